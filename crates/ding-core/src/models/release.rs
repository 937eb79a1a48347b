//! Release model: a snapshot of a successful build made public.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{BuildId, StepRecord};

/// A promoted, successful build. Prevents the underlying build from being
/// removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub build_id: BuildId,
    pub time: DateTime<Utc>,
    pub build_script: String,
    pub steps: Vec<StepRecord>,
}
