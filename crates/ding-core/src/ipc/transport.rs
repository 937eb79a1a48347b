//! The worker's view of the root process: an [`IpcTransport`] abstracts
//! over the real Unix-socket implementation and an in-process stand-in
//! used when isolation is disabled.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};

use crate::error::{DingError, Result};

use super::msg::{Msg, Reply};

/// The three streams a successful `build` request yields: the child's
/// stdout and stderr, and a one-shot status signal (empty string on
/// success, an error description otherwise).
pub struct BuildHandles {
    pub stdout: Box<dyn AsyncRead + Unpin + Send>,
    pub stderr: Box<dyn AsyncRead + Unpin + Send>,
    pub status: oneshot::Receiver<String>,
}

/// Operations the worker may ask the root process to perform.
#[async_trait]
pub trait IpcTransport: Send + Sync {
    async fn chown(&self, repo: &str, build_id: i64) -> Result<()>;

    /// `build_id = None` removes the whole `data/build/<repo>` tree.
    async fn remove_dir(&self, repo: &str, build_id: Option<i64>) -> Result<()>;

    async fn spawn_build(
        &self,
        repo: &str,
        build_id: i64,
        checkout_path: &str,
        env: Vec<(String, String)>,
    ) -> Result<BuildHandles>;
}

/// Real implementation: a pair of Unix stream sockets established before
/// fork, one carrying framed JSON request/reply records, the other used
/// once per build to pass descriptors.
pub struct SocketTransport {
    control: Mutex<BufReader<tokio::net::UnixStream>>,
    fd_socket: Mutex<tokio::net::UnixStream>,
}

impl SocketTransport {
    pub fn new(control: tokio::net::UnixStream, fd_socket: tokio::net::UnixStream) -> Self {
        Self {
            control: Mutex::new(BufReader::new(control)),
            fd_socket: Mutex::new(fd_socket),
        }
    }

    async fn roundtrip(&self, msg: &Msg) -> Result<Reply> {
        let mut control = self.control.lock().await;
        let mut line = serde_json::to_string(msg)?;
        line.push('\n');
        control
            .get_mut()
            .write_all(line.as_bytes())
            .await
            .map_err(DingError::Io)?;

        let mut reply_line = String::new();
        let n = control
            .read_line(&mut reply_line)
            .await
            .map_err(DingError::Io)?;
        if n == 0 {
            return Err(DingError::IpcFraming(
                "root process closed the control socket".to_string(),
            ));
        }
        serde_json::from_str(reply_line.trim_end()).map_err(DingError::Json)
    }
}

#[async_trait]
impl IpcTransport for SocketTransport {
    async fn chown(&self, repo: &str, build_id: i64) -> Result<()> {
        let reply = self.roundtrip(&Msg::chown(repo, build_id)).await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(DingError::RootProcess(reply.error))
        }
    }

    async fn remove_dir(&self, repo: &str, build_id: Option<i64>) -> Result<()> {
        let reply = self
            .roundtrip(&Msg::remove_dir(repo, build_id.unwrap_or(-1)))
            .await?;
        if reply.is_ok() {
            Ok(())
        } else {
            Err(DingError::RootProcess(reply.error))
        }
    }

    async fn spawn_build(
        &self,
        repo: &str,
        build_id: i64,
        checkout_path: &str,
        env: Vec<(String, String)>,
    ) -> Result<BuildHandles> {
        let msg = Msg::build(repo, build_id, checkout_path, env);
        let reply = self.roundtrip(&msg).await?;
        if !reply.is_ok() {
            return Err(DingError::ChildProcess(reply.error));
        }

        // Descriptor-passing handshake: the root process has queued the
        // three fds (stdout, stderr, status) on the fd socket.
        let fd_socket = self.fd_socket.lock().await;
        let (stdout, stderr, status_file) = recv_build_fds(&fd_socket).await?;

        let (status_tx, status_rx) = oneshot::channel();
        tokio::spawn(async move {
            use tokio::io::AsyncReadExt;
            let mut status_file = status_file;
            let mut buf = Vec::new();
            let _ = status_file.read_to_end(&mut buf).await;
            let text = String::from_utf8_lossy(&buf).to_string();
            let _ = status_tx.send(text);
        });

        Ok(BuildHandles {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            status: status_rx,
        })
    }
}

#[cfg(unix)]
async fn recv_build_fds(
    fd_socket: &tokio::net::UnixStream,
) -> Result<(tokio::fs::File, tokio::fs::File, tokio::fs::File)> {
    use std::os::fd::{AsRawFd, FromRawFd};

    fd_socket.readable().await.map_err(DingError::Io)?;
    let fds = super::fd_passing::recv_fds(fd_socket.as_raw_fd(), 3).map_err(DingError::Io)?;
    if fds.len() != 3 {
        return Err(DingError::IpcFraming(format!(
            "expected 3 descriptors, got {}",
            fds.len()
        )));
    }
    // Safety: these fds were just received via SCM_RIGHTS and are owned
    // exclusively by this process from this point on.
    unsafe {
        Ok((
            tokio::fs::File::from_std(std::fs::File::from_raw_fd(fds[0])),
            tokio::fs::File::from_std(std::fs::File::from_raw_fd(fds[1])),
            tokio::fs::File::from_std(std::fs::File::from_raw_fd(fds[2])),
        ))
    }
}

#[cfg(not(unix))]
async fn recv_build_fds(
    _fd_socket: &tokio::net::UnixStream,
) -> Result<(tokio::fs::File, tokio::fs::File, tokio::fs::File)> {
    Err(DingError::RootProcess(
        "descriptor passing is only supported on unix".to_string(),
    ))
}

/// Stand-in used when isolation is disabled: both logical roles run in
/// one address space, so there is no privilege boundary to cross and the
/// "root" operations just happen directly.
pub struct InProcessTransport {
    pub builds_dir: std::path::PathBuf,
}

impl InProcessTransport {
    pub fn new(builds_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            builds_dir: builds_dir.into(),
        }
    }

    fn build_dir(&self, repo: &str, build_id: i64) -> std::path::PathBuf {
        self.builds_dir.join(repo).join(build_id.to_string())
    }
}

#[async_trait]
impl IpcTransport for InProcessTransport {
    async fn chown(&self, _repo: &str, _build_id: i64) -> Result<()> {
        // No privilege boundary: the worker already owns the tree.
        Ok(())
    }

    async fn remove_dir(&self, repo: &str, build_id: Option<i64>) -> Result<()> {
        let path = match build_id {
            Some(id) => self.build_dir(repo, id),
            None => self.builds_dir.join(repo),
        };
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DingError::Io(e)),
        }
    }

    async fn spawn_build(
        &self,
        repo: &str,
        build_id: i64,
        checkout_path: &str,
        env: Vec<(String, String)>,
    ) -> Result<BuildHandles> {
        let build_dir = self.build_dir(repo, build_id);
        let cwd = build_dir.join("checkout").join(checkout_path);
        let script = build_dir.join("scripts").join("build.sh");

        let mut cmd = tokio::process::Command::new(script);
        cmd.current_dir(&cwd);
        cmd.env_clear();
        for (k, v) in env {
            cmd.env(k, v);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| DingError::ChildProcess(e.to_string()))?;
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");

        let (status_tx, status_rx) = oneshot::channel();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(exit) if exit.success() => String::new(),
                Ok(exit) => format!("exit status {exit}"),
                Err(e) => e.to_string(),
            };
            let _ = status_tx.send(status);
        });

        Ok(BuildHandles {
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
            status: status_rx,
        })
    }
}
