//! Build model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RepoId;

/// Unique identifier for a build. Monotonic, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(pub i64);

impl BuildId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for BuildId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Build status. Advances monotonically through this exact ordered list
/// a build that fails at a stage is left with its
/// `status` set to that stage's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    New,
    Clone,
    Checkout,
    Build,
    Success,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::New => "new",
            BuildStatus::Clone => "clone",
            BuildStatus::Checkout => "checkout",
            BuildStatus::Build => "build",
            BuildStatus::Success => "success",
        }
    }

    /// True once a build has reached its terminal success state.
    pub fn is_success(&self) -> bool {
        matches!(self, BuildStatus::Success)
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(BuildStatus::New),
            "clone" => Ok(BuildStatus::Clone),
            "checkout" => Ok(BuildStatus::Checkout),
            "build" => Ok(BuildStatus::Build),
            "success" => Ok(BuildStatus::Success),
            _ => Err(format!("unknown build status: {s}")),
        }
    }
}

/// One attempt to build a repository at a specific revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub repo_id: RepoId,
    pub branch: String,
    /// May be empty until the clone stage resolves it.
    pub commit_hash: String,
    pub status: BuildStatus,
    pub start: DateTime<Utc>,
    pub finish: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Last non-empty output line captured from the failing step, if any.
    pub last_line: Option<String>,
    pub released: Option<DateTime<Utc>>,
    pub builddir_removed: bool,
    pub disk_usage: Option<i64>,
}

impl Build {
    /// Creates a new build row in the `new` stage, ready to be submitted
    /// to the serializer.
    pub fn new(repo_id: RepoId, branch: String, commit_hash: String) -> Self {
        Self {
            id: BuildId(0),
            repo_id,
            branch,
            commit_hash,
            status: BuildStatus::New,
            start: Utc::now(),
            finish: None,
            error_message: None,
            last_line: None,
            released: None,
            builddir_removed: false,
            disk_usage: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.finish.is_none()
    }
}

/// API response DTO for a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResponse {
    pub id: i64,
    pub repo_id: i64,
    pub branch: String,
    pub commit_hash: String,
    pub status: String,
    pub start: DateTime<Utc>,
    pub finish: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub last_line: Option<String>,
    pub released: Option<DateTime<Utc>>,
    pub builddir_removed: bool,
    pub disk_usage: Option<i64>,
}

impl From<Build> for BuildResponse {
    fn from(build: Build) -> Self {
        Self {
            id: build.id.0,
            repo_id: build.repo_id.0,
            branch: build.branch,
            commit_hash: build.commit_hash,
            status: build.status.as_str().to_string(),
            start: build.start,
            finish: build.finish,
            error_message: build.error_message,
            last_line: build.last_line,
            released: build.released,
            builddir_removed: build.builddir_removed,
            disk_usage: build.disk_usage,
        }
    }
}

/// Request to trigger a manual build.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBuildRequest {
    pub repo: String,
    pub branch: String,
    #[serde(default)]
    pub commit: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_ordering_is_monotonic() {
        assert!(BuildStatus::New < BuildStatus::Clone);
        assert!(BuildStatus::Clone < BuildStatus::Checkout);
        assert!(BuildStatus::Checkout < BuildStatus::Build);
        assert!(BuildStatus::Build < BuildStatus::Success);
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            BuildStatus::New,
            BuildStatus::Clone,
            BuildStatus::Checkout,
            BuildStatus::Build,
            BuildStatus::Success,
        ] {
            let parsed: BuildStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn unknown_status_is_rejected() {
        assert!("bogus".parse::<BuildStatus>().is_err());
    }

    #[test]
    fn new_build_starts_active() {
        let build = Build::new(RepoId(1), "main".to_string(), String::new());
        assert!(build.is_active());
        assert_eq!(build.status, BuildStatus::New);
    }
}
