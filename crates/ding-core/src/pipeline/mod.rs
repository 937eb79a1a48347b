//! The build driver: drives one build through its stage machine,
//! persisting transitions, capturing output, and applying the
//! notification policy on exit.

pub mod driver;

pub use driver::{load_repo_for_build, run_build, DriverContext};
