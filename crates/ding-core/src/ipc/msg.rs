//! Control-socket request/reply records.

use serde::{Deserialize, Serialize};

/// The three privileged operations the worker may ask the root process
/// to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MsgKind {
    Chown,
    RemoveDir,
    Build,
}

/// A framed request sent over the control socket. Serialized as one JSON
/// object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg {
    pub kind: MsgKind,
    pub repo: String,
    /// Negative means "the whole repo tree" for `RemoveDir`.
    pub build_id: i64,
    pub checkout_path: String,
    pub env: Vec<(String, String)>,
}

impl Msg {
    pub fn chown(repo: impl Into<String>, build_id: i64) -> Self {
        Self {
            kind: MsgKind::Chown,
            repo: repo.into(),
            build_id,
            checkout_path: String::new(),
            env: Vec::new(),
        }
    }

    pub fn remove_dir(repo: impl Into<String>, build_id: i64) -> Self {
        Self {
            kind: MsgKind::RemoveDir,
            repo: repo.into(),
            build_id,
            checkout_path: String::new(),
            env: Vec::new(),
        }
    }

    pub fn build(
        repo: impl Into<String>,
        build_id: i64,
        checkout_path: impl Into<String>,
        env: Vec<(String, String)>,
    ) -> Self {
        Self {
            kind: MsgKind::Build,
            repo: repo.into(),
            build_id,
            checkout_path: checkout_path.into(),
            env,
        }
    }
}

/// The root process's reply to a non-`Build` request, or to a `Build`
/// request that failed to start. Empty string means success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub error: String,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            error: String::new(),
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}
