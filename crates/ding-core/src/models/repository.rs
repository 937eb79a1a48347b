//! Repository model.

use serde::{Deserialize, Serialize};

use crate::error::{DingError, Result};

/// Unique identifier for a repository. Monotonic, assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(pub i64);

impl std::fmt::Display for RepoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for RepoId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Version control dispatch (a closed enum,
/// dispatch is a tagged switch, no dynamic dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vcs {
    Git,
    Mercurial,
    Command,
}

impl Vcs {
    pub fn as_str(&self) -> &'static str {
        match self {
            Vcs::Git => "git",
            Vcs::Mercurial => "mercurial",
            Vcs::Command => "command",
        }
    }
}

impl std::fmt::Display for Vcs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Vcs {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(Vcs::Git),
            "mercurial" => Ok(Vcs::Mercurial),
            "command" => Ok(Vcs::Command),
            _ => Err(format!("unknown vcs: {s}")),
        }
    }
}

/// A named build target with a source origin and a build script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: RepoId,
    pub name: String,
    pub vcs: Vcs,
    /// Clone URL (git/hg) or shell command (command vcs).
    pub origin: String,
    /// Relative, non-empty, no leading/trailing slash.
    pub checkout_path: String,
    pub build_script: String,
}

impl Repo {
    /// Validates the fields a caller supplied for `createRepo`/`saveRepo`,
    /// Mirrors the validation applied on repository creation.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DingError::user_error("repository name must not be empty"));
        }
        if self.checkout_path.is_empty() {
            return Err(DingError::user_error("checkout_path must not be empty"));
        }
        if self.checkout_path.starts_with('/') || self.checkout_path.ends_with('/') {
            return Err(DingError::user_error(
                "checkout_path must not have a leading or trailing slash",
            ));
        }
        if self.checkout_path.split('/').any(|part| part == "..") {
            return Err(DingError::user_error(
                "checkout_path must not contain '..' segments",
            ));
        }
        Ok(())
    }
}

/// API response / request DTO for a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoResponse {
    pub id: i64,
    pub name: String,
    pub vcs: String,
    pub origin: String,
    pub checkout_path: String,
    pub build_script: String,
}

impl From<Repo> for RepoResponse {
    fn from(repo: Repo) -> Self {
        Self {
            id: repo.id.0,
            name: repo.name,
            vcs: repo.vcs.as_str().to_string(),
            origin: repo.origin,
            checkout_path: repo.checkout_path,
            build_script: repo.build_script,
        }
    }
}

/// Request body for `createRepo`/`saveRepo`.
#[derive(Debug, Clone, Deserialize)]
pub struct SaveRepoRequest {
    pub name: String,
    pub vcs: String,
    pub origin: String,
    pub checkout_path: String,
    pub build_script: String,
}

impl TryFrom<SaveRepoRequest> for Repo {
    type Error = DingError;

    fn try_from(req: SaveRepoRequest) -> Result<Self> {
        let vcs: Vcs = req
            .vcs
            .parse()
            .map_err(|_| DingError::user_error(format!("unknown vcs: {}", req.vcs)))?;
        let repo = Repo {
            id: RepoId(0),
            name: req.name,
            vcs,
            origin: req.origin,
            checkout_path: req.checkout_path,
            build_script: req.build_script,
        };
        repo.validate()?;
        Ok(repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> Repo {
        Repo {
            id: RepoId(1),
            name: "demo".to_string(),
            vcs: Vcs::Git,
            origin: "https://example.com/demo.git".to_string(),
            checkout_path: "demo".to_string(),
            build_script: "#!/bin/sh\necho ok\n".to_string(),
        }
    }

    #[test]
    fn valid_repo_passes() {
        assert!(repo().validate().is_ok());
    }

    #[test]
    fn rejects_empty_name() {
        let mut r = repo();
        r.name = "  ".to_string();
        assert!(r.validate().is_err());
    }

    #[test]
    fn rejects_leading_slash_checkout_path() {
        let mut r = repo();
        r.checkout_path = "/demo".to_string();
        assert!(r.validate().is_err());
    }

    #[test]
    fn rejects_trailing_slash_checkout_path() {
        let mut r = repo();
        r.checkout_path = "demo/".to_string();
        assert!(r.validate().is_err());
    }

    #[test]
    fn rejects_dotdot_segment() {
        let mut r = repo();
        r.checkout_path = "../demo".to_string();
        assert!(r.validate().is_err());
    }

    #[test]
    fn vcs_round_trips_through_str() {
        for vcs in [Vcs::Git, Vcs::Mercurial, Vcs::Command] {
            let parsed: Vcs = vcs.as_str().parse().unwrap();
            assert_eq!(parsed, vcs);
        }
    }
}
