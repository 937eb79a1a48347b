//! Result model: a file declared releasable by the build script.

use serde::{Deserialize, Serialize};

use super::BuildId;

/// Unique identifier for a result row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultId(pub i64);

impl std::fmt::Display for ResultId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single `release:` declaration parsed from a successful build's
/// captured stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub id: ResultId,
    pub build_id: BuildId,
    pub command: String,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub toolchain: String,
    /// Relative to the checkout directory.
    pub filename: String,
    pub filesize: i64,
}

impl BuildResult {
    pub fn new(
        build_id: BuildId,
        command: String,
        version: String,
        os: String,
        arch: String,
        toolchain: String,
        filename: String,
        filesize: i64,
    ) -> Self {
        Self {
            id: ResultId(0),
            build_id,
            command,
            version,
            os,
            arch,
            toolchain,
            filename,
            filesize,
        }
    }
}
