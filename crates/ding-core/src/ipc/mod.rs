//! Root/worker IPC: message framing, descriptor passing, and
//! validation shared by both sides of the control socket.

pub mod fd_passing;
pub mod msg;
#[cfg(unix)]
pub mod root;
pub mod transport;

pub use msg::{Msg, MsgKind};
pub use transport::{BuildHandles, InProcessTransport, IpcTransport, SocketTransport};

use crate::error::{DingError, Result};

/// Checks that `path` resolves inside `root` and contains no `..` segment,
/// as the root process requires before acting on a request.
pub fn validate_contained_path(root: &std::path::Path, path: &std::path::Path) -> Result<()> {
    if path.components().any(|c| c.as_os_str() == "..") {
        return Err(DingError::PathEscape(format!(
            "{} contains a '..' segment",
            path.display()
        )));
    }
    if !path.starts_with(root) {
        return Err(DingError::PathEscape(format!(
            "{} is not contained within {}",
            path.display(),
            root.display()
        )));
    }
    Ok(())
}

/// Checks that `uid` falls within the configured per-build identity range,
/// excluding the identity reserved for the worker itself.
pub fn validate_uid_range(uid: u32, uid_start: u32, uid_end: u32, ding_uid: u32) -> Result<()> {
    if uid == ding_uid {
        return Err(DingError::RootProcess(format!(
            "uid {uid} is reserved for the worker process"
        )));
    }
    if uid < uid_start || uid >= uid_end {
        return Err(DingError::RootProcess(format!(
            "uid {uid} is outside the configured range [{uid_start}, {uid_end})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn rejects_dotdot_segment() {
        let root = Path::new("/data/build");
        let path = Path::new("/data/build/../etc/passwd");
        assert!(validate_contained_path(root, path).is_err());
    }

    #[test]
    fn accepts_contained_path() {
        let root = Path::new("/data/build");
        let path = Path::new("/data/build/demo/1");
        assert!(validate_contained_path(root, path).is_ok());
    }

    #[test]
    fn rejects_path_outside_root() {
        let root = Path::new("/data/build");
        let path = Path::new("/home/other");
        assert!(validate_contained_path(root, path).is_err());
    }

    #[test]
    fn uid_range_excludes_reserved_identity() {
        assert!(validate_uid_range(1000, 1000, 1010, 1000).is_err());
    }

    #[test]
    fn uid_range_rejects_out_of_bounds() {
        assert!(validate_uid_range(2000, 1000, 1010, 999).is_err());
        assert!(validate_uid_range(1005, 1000, 1010, 999).is_ok());
    }
}
