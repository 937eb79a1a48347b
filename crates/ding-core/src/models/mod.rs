//! Persisted and in-flight entity types.

pub mod build;
pub mod release;
pub mod repository;
pub mod result;
pub mod step;

pub use build::{Build, BuildId, BuildResponse, BuildStatus, CreateBuildRequest};
pub use release::Release;
pub use repository::{Repo, RepoId, RepoResponse, SaveRepoRequest, Vcs};
pub use result::{BuildResult, ResultId};
pub use step::{StepName, StepRecord};
