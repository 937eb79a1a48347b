//! Root-process side of the control socket: services [`Msg`] requests
//! sent by the unprivileged worker over a blocking loop. Runs outside
//! tokio — the root process has no other work, so a plain blocking read
//! loop is simplest and keeps this code safe to call right after fork/exec
//! setup, before any async runtime exists.

#![cfg(unix)]

use std::io::{BufRead, BufReader, Write};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::config::Config;
use crate::error::{DingError, Result};

use super::fd_passing::send_fds;
use super::msg::{Msg, MsgKind, Reply};
use super::{validate_contained_path, validate_uid_range};

/// Services requests on `control`/`fd_socket` until the worker closes the
/// control socket (`Ok(())`) or a framing error occurs.
pub fn run(control: UnixStream, fd_socket: UnixStream, config: &Config, cli_binary: &Path) -> Result<()> {
    let mut reader = BufReader::new(control.try_clone().map_err(DingError::Io)?);
    let mut writer = control;

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).map_err(DingError::Io)?;
        if n == 0 {
            return Ok(());
        }
        let msg: Msg = serde_json::from_str(line.trim_end()).map_err(DingError::Json)?;

        let reply = match msg.kind {
            MsgKind::Chown => handle_chown(&msg, config, cli_binary),
            MsgKind::RemoveDir => handle_remove_dir(&msg, config),
            MsgKind::Build => handle_build(&msg, config, &fd_socket),
        };
        write_reply(&mut writer, &reply)?;
    }
}

fn write_reply(writer: &mut UnixStream, reply: &Reply) -> Result<()> {
    let mut line = serde_json::to_string(reply)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).map_err(DingError::Io)
}

fn build_dir(config: &Config, repo: &str, build_id: i64) -> PathBuf {
    Path::new(&config.isolate_builds.builds_dir)
        .join(repo)
        .join(build_id.to_string())
}

/// Delegates the recursive chown to `ding chownbuild`, kept as a small,
/// auditable unit rather than walking the tree with root privilege here.
fn handle_chown(msg: &Msg, config: &Config, cli_binary: &Path) -> Reply {
    if msg.repo.is_empty() {
        return Reply::err("chown request missing repo name");
    }
    let uid = config.build_uid(msg.build_id);
    let gid = config.isolate_builds.ding_gid;
    if let Err(e) = validate_uid_range(
        uid,
        config.isolate_builds.uid_start,
        config.isolate_builds.uid_end,
        config.isolate_builds.ding_uid,
    ) {
        return Reply::err(e.to_string());
    }

    let dir = build_dir(config, &msg.repo, msg.build_id);
    let output = Command::new(cli_binary)
        .arg("chownbuild")
        .arg(&config.config_path)
        .arg(uid.to_string())
        .arg(gid.to_string())
        .arg(dir.join("home"))
        .arg(dir.join("checkout"))
        .output();

    match output {
        Ok(out) if out.status.success() => Reply::ok(),
        Ok(out) => Reply::err(String::from_utf8_lossy(&out.stderr).trim().to_string()),
        Err(e) => Reply::err(e.to_string()),
    }
}

fn handle_remove_dir(msg: &Msg, config: &Config) -> Reply {
    if msg.repo.is_empty() {
        return Reply::err("remove_dir request missing repo name");
    }
    let builds_dir = PathBuf::from(&config.isolate_builds.builds_dir);
    let path = if msg.build_id >= 0 {
        build_dir(config, &msg.repo, msg.build_id)
    } else {
        builds_dir.join(&msg.repo)
    };
    if let Err(e) = validate_contained_path(&builds_dir, &path) {
        return Reply::err(e.to_string());
    }

    match std::fs::remove_dir_all(&path) {
        Ok(()) => Reply::ok(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Reply::ok(),
        Err(e) => Reply::err(e.to_string()),
    }
}

/// Starts `build.sh` under the per-build uid/gid and hands its stdout,
/// stderr, and a status pipe to the worker over `fd_socket` via
/// `SCM_RIGHTS`. The worker learns whether the build succeeded by reading
/// the status pipe to EOF.
fn handle_build(msg: &Msg, config: &Config, fd_socket: &UnixStream) -> Reply {
    if msg.repo.is_empty() {
        return Reply::err("build request missing repo name");
    }
    let uid = config.build_uid(msg.build_id);
    let gid = config.isolate_builds.ding_gid;
    if config.isolate_builds.enabled {
        if let Err(e) = validate_uid_range(
            uid,
            config.isolate_builds.uid_start,
            config.isolate_builds.uid_end,
            config.isolate_builds.ding_uid,
        ) {
            return Reply::err(e.to_string());
        }
    }

    let dir = build_dir(config, &msg.repo, msg.build_id);
    let checkout_dir = dir.join("checkout").join(&msg.checkout_path);
    let script = dir.join("scripts").join("build.sh");

    let (out_r, out_w) = match make_pipe() {
        Ok(p) => p,
        Err(e) => return Reply::err(format!("creating stdout pipe: {e}")),
    };
    let (err_r, err_w) = match make_pipe() {
        Ok(p) => p,
        Err(e) => return Reply::err(format!("creating stderr pipe: {e}")),
    };
    let (status_r, status_w) = match make_pipe() {
        Ok(p) => p,
        Err(e) => return Reply::err(format!("creating status pipe: {e}")),
    };

    let mut cmd = Command::new(&script);
    cmd.current_dir(&checkout_dir);
    cmd.env_clear();
    for (k, v) in &msg.env {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::from(out_w));
    cmd.stderr(Stdio::from(err_w));
    if config.isolate_builds.enabled {
        cmd.uid(uid);
        cmd.gid(gid);
    }

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => return Reply::err(format!("starting build: {e}")),
    };

    let fds = [out_r.as_raw_fd(), err_r.as_raw_fd(), status_r.as_raw_fd()];
    if let Err(e) = send_fds(fd_socket.as_raw_fd(), &fds) {
        let _ = child.kill();
        return Reply::err(format!("sending descriptors to worker: {e}"));
    }
    // Our copies; the worker received its own via SCM_RIGHTS.
    drop(out_r);
    drop(err_r);
    drop(status_r);

    std::thread::spawn(move || {
        let status = match child.wait() {
            Ok(exit) if exit.success() => String::new(),
            Ok(exit) => exit.to_string(),
            Err(e) => e.to_string(),
        };
        let mut status_w = status_w;
        let _ = status_w.write_all(status.as_bytes());
    });

    Reply::ok()
}

fn make_pipe() -> std::io::Result<(std::fs::File, std::fs::File)> {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe {
        (
            std::fs::File::from_raw_fd(fds[0]),
            std::fs::File::from_raw_fd(fds[1]),
        )
    })
}
