//! Per-stage captured output records.

use serde::{Deserialize, Serialize};

/// One stage of a build whose stdout/stderr/combined output and duration
/// are persisted on the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepName {
    Clone,
    Checkout,
    Build,
}

impl StepName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Clone => "clone",
            StepName::Checkout => "checkout",
            StepName::Build => "build",
        }
    }

    /// The ordered stage names the driver runs for a git repository.
    pub const GIT_ORDER: [StepName; 3] = [StepName::Clone, StepName::Checkout, StepName::Build];
    /// Mercurial and command repositories have no separate checkout step.
    pub const NO_CHECKOUT_ORDER: [StepName; 2] = [StepName::Clone, StepName::Build];
}

impl std::fmt::Display for StepName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A captured step, as recorded in a [`crate::models::Release`] snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: StepName,
    pub stdout: String,
    pub stderr: String,
    pub output: String,
    /// Wall-clock duration in nanoseconds.
    pub nsec: u64,
}
