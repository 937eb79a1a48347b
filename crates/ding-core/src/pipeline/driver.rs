//! The build stage machine: `new → clone → checkout → build → success`.
//! Every exit path, success or failure, runs through [`finalize`], which is
//! idempotent and always persists, cleans up, notifies, and emits exactly
//! once.

use std::path::{Path, PathBuf};

use tokio::process::Command;

use crate::cleanup::cleanup_builds;
use crate::config::Config;
use crate::db::build::BuildRepo;
use crate::db::repository::RepoRepo;
use crate::db::result::ResultRepo;
use crate::db::DbPool;
use crate::error::{DingError, Result};
use crate::event::{Event, EventBus};
use crate::ipc::IpcTransport;
use crate::mail;
use crate::models::{Build, BuildId, BuildResult, BuildStatus, Repo, StepName, Vcs};
use crate::notify;
use crate::output;

/// Everything the driver needs to run a single build through to
/// completion. Constructed once per build by the caller (the serializer's
/// release handler).
pub struct DriverContext<'a> {
    pub pool: &'a DbPool,
    pub transport: &'a dyn IpcTransport,
    pub config: &'a Config,
    pub bus: EventBus,
}

/// Drives `build` for `repo` through every stage. Always finalizes before
/// returning, regardless of which stage failed.
pub async fn run_build(ctx: &DriverContext<'_>, repo: &Repo, mut build: Build) -> Result<()> {
    let build_id = ensure_persisted(ctx.pool, &mut build).await?;
    let build_dir = PathBuf::from(&ctx.config.isolate_builds.builds_dir)
        .join(&repo.name)
        .join(build_id.0.to_string());

    let outcome = run_stages(ctx, repo, &mut build, &build_dir).await;

    let (error_message, last_line) = match &outcome {
        Ok(()) => (None, None),
        Err(Failure::User(msg)) => (Some(msg.clone()), None),
        Err(Failure::Stage { last_line, .. }) => (None, last_line.clone()),
        Err(Failure::Infra(e)) => {
            tracing::error!(build_id = build_id.0, error = %e, "build terminated by an infrastructure error");
            (None, None)
        }
    };

    if let Err(Failure::Stage { status, .. }) = &outcome {
        build.status = *status;
        BuildRepo::update_status(ctx.pool, build_id, *status).await?;
    }

    finalize(ctx, repo, &mut build, error_message, last_line).await?;

    match outcome {
        Ok(()) | Err(Failure::Stage { .. }) | Err(Failure::User(_)) => Ok(()),
        Err(Failure::Infra(e)) => Err(e),
    }
}

async fn ensure_persisted(pool: &DbPool, build: &mut Build) -> Result<BuildId> {
    if build.id.0 == 0 {
        build.id = BuildRepo::create(pool, build).await?;
    }
    Ok(build.id)
}

enum Failure {
    /// The stage that failed, with the build's terminal status and the
    /// last non-empty output line captured from the failing step.
    Stage {
        status: BuildStatus,
        last_line: Option<String>,
    },
    /// A user-attributable error: recorded as `error_message`, never
    /// re-raised as internal.
    User(String),
    /// Infrastructure failure: logged, not surfaced to `error_message`.
    Infra(DingError),
}

impl From<DingError> for Failure {
    fn from(e: DingError) -> Self {
        match e.kind() {
            crate::error::ErrorKind::UserError => Failure::User(e.to_string()),
            _ => Failure::Infra(e),
        }
    }
}

async fn run_stages(
    ctx: &DriverContext<'_>,
    repo: &Repo,
    build: &mut Build,
    build_dir: &Path,
) -> std::result::Result<(), Failure> {
    let build_id = build.id;

    prepare_tree(repo, build_dir).await?;
    set_status(ctx, &repo.name, build, BuildStatus::Clone).await?;

    let checkout_dir = build_dir.join("checkout").join(&repo.checkout_path);
    let output_dir = build_dir.join("output");

    let clone_outcome = run_clone(ctx, repo, build, &checkout_dir, &output_dir).await;
    let clone_outcome = match clone_outcome {
        Ok(v) => v,
        Err(Failure::Stage { last_line, .. }) => {
            return Err(Failure::Stage {
                status: BuildStatus::Clone,
                last_line,
            })
        }
        Err(other) => return Err(other),
    };
    build.commit_hash = clone_outcome;
    BuildRepo::set_commit_hash(ctx.pool, build_id, &build.commit_hash).await?;

    if repo.vcs == Vcs::Git {
        set_status(ctx, &repo.name, build, BuildStatus::Checkout).await?;
        if let Err(failure) =
            run_checkout(ctx, build, &checkout_dir, &output_dir, &build.commit_hash).await
        {
            return Err(match failure {
                Failure::Stage { last_line, .. } => Failure::Stage {
                    status: BuildStatus::Checkout,
                    last_line,
                },
                other => other,
            });
        }
    }

    ctx.transport
        .chown(&repo.name, build_id.0)
        .await
        .map_err(Failure::from)?;

    set_status(ctx, &repo.name, build, BuildStatus::Build).await?;
    if let Err(failure) = run_build_step(ctx, repo, build, build_dir, &checkout_dir, &output_dir).await {
        return Err(match failure {
            Failure::Stage { last_line, .. } => Failure::Stage {
                status: BuildStatus::Build,
                last_line,
            },
            other => other,
        });
    }

    set_status(ctx, &repo.name, build, BuildStatus::Success).await?;
    Ok(())
}

async fn set_status(
    ctx: &DriverContext<'_>,
    repo_name: &str,
    build: &mut Build,
    status: BuildStatus,
) -> Result<()> {
    build.status = status;
    BuildRepo::update_status(ctx.pool, build.id, status).await?;
    ctx.bus
        .publish(Event::Build {
            repo: repo_name.to_string(),
            build: Box::new(build.clone()),
        })
        .await;
    Ok(())
}

async fn prepare_tree(repo: &Repo, build_dir: &Path) -> std::result::Result<(), Failure> {
    for sub in ["scripts", "home", "output", "checkout"] {
        tokio::fs::create_dir_all(build_dir.join(sub))
            .await
            .map_err(DingError::Io)?;
    }
    let script_path = build_dir.join("scripts").join("build.sh");
    tokio::fs::write(&script_path, &repo.build_script)
        .await
        .map_err(DingError::Io)?;
    set_executable(&script_path).await.map_err(DingError::Io)?;
    Ok(())
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let metadata = tokio::fs::metadata(path).await?;
    let mut perms = metadata.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(path, perms).await
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Runs the clone step for any of the three VCS kinds and returns the
/// resolved commit hash.
async fn run_clone(
    ctx: &DriverContext<'_>,
    repo: &Repo,
    build: &Build,
    checkout_dir: &Path,
    output_dir: &Path,
) -> std::result::Result<String, Failure> {
    let cmd = match repo.vcs {
        Vcs::Git => {
            tokio::fs::create_dir_all(checkout_dir.parent().unwrap_or(checkout_dir))
                .await
                .map_err(DingError::Io)?;
            let mut cmd = prefixed_command(ctx.config, "git");
            cmd.arg("clone")
                .arg("--recursive")
                .arg("--no-hardlinks")
                .arg("--branch")
                .arg(&build.branch)
                .arg(&repo.origin)
                .arg(checkout_dir);
            cmd
        }
        Vcs::Mercurial => {
            tokio::fs::create_dir_all(checkout_dir.parent().unwrap_or(checkout_dir))
                .await
                .map_err(DingError::Io)?;
            let mut cmd = prefixed_command(ctx.config, "hg");
            cmd.arg("clone").arg("--branch").arg(&build.branch);
            if !build.commit_hash.is_empty() {
                cmd.arg("--rev")
                    .arg(&build.commit_hash)
                    .arg("--updaterev")
                    .arg(&build.commit_hash);
            }
            cmd.arg(&repo.origin).arg(checkout_dir);
            cmd
        }
        Vcs::Command => {
            tokio::fs::create_dir_all(checkout_dir)
                .await
                .map_err(DingError::Io)?;
            let mut cmd = prefixed_command(ctx.config, "sh");
            cmd.arg("-c").arg(&repo.origin).current_dir(checkout_dir);
            cmd
        }
    };

    let captured = run_captured_step(ctx, build.id, StepName::Clone, output_dir, cmd).await?;

    if repo.vcs == Vcs::Command {
        let last_line = captured
            .stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("");
        let hash = last_line
            .strip_prefix("commit:")
            .map(|s| s.trim().to_string())
            .ok_or_else(|| {
                Failure::User(format!(
                    "command clone output did not end with a commit: line (got {last_line:?})"
                ))
            })?;
        return Ok(hash);
    }

    if !build.commit_hash.is_empty() {
        return Ok(build.commit_hash.clone());
    }

    resolve_commit_hash(ctx, repo, checkout_dir).await
}

async fn resolve_commit_hash(
    ctx: &DriverContext<'_>,
    repo: &Repo,
    checkout_dir: &Path,
) -> std::result::Result<String, Failure> {
    let mut cmd = match repo.vcs {
        Vcs::Git => {
            let mut cmd = prefixed_command(ctx.config, "git");
            cmd.arg("rev-parse").arg("HEAD");
            cmd
        }
        Vcs::Mercurial => {
            let mut cmd = prefixed_command(ctx.config, "hg");
            cmd.arg("id").arg("--id");
            cmd
        }
        Vcs::Command => unreachable!("command vcs resolves its hash from clone output"),
    };
    cmd.current_dir(checkout_dir);
    let output = cmd.output().await.map_err(DingError::Io)?;
    if !output.status.success() {
        return Err(Failure::Stage {
            status: BuildStatus::Clone,
            last_line: last_non_empty_line(&output.stderr).or_else(|| last_non_empty_line(&output.stdout)),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

async fn run_checkout(
    ctx: &DriverContext<'_>,
    build: &Build,
    checkout_dir: &Path,
    output_dir: &Path,
    commit_hash: &str,
) -> std::result::Result<(), Failure> {
    let mut cmd = prefixed_command(ctx.config, "git");
    cmd.arg("checkout").arg(commit_hash).current_dir(checkout_dir);
    run_captured_step(ctx, build.id, StepName::Checkout, output_dir, cmd).await?;
    Ok(())
}

struct CapturedStep {
    stdout: String,
}

/// Spawns `cmd` directly (not via the root process — used for clone and
/// checkout, which run under the worker's own identity before ownership
/// transfers), streams its output through the same per-step pipe the
/// privileged build step uses, and returns the captured stdout text.
async fn run_captured_step(
    ctx: &DriverContext<'_>,
    build_id: BuildId,
    step: StepName,
    output_dir: &Path,
    mut cmd: Command,
) -> std::result::Result<CapturedStep, Failure> {
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());

    let mut child = cmd.spawn().map_err(DingError::Io)?;
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let (status_tx, status_rx) = tokio::sync::oneshot::channel();
    let wait_task = tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(exit) if exit.success() => String::new(),
            Ok(exit) => format!("exit status {exit}"),
            Err(e) => e.to_string(),
        };
        let _ = status_tx.send(status);
    });

    let outcome = output::run_step(
        output_dir,
        build_id,
        step,
        stdout,
        stderr,
        status_rx,
        ctx.bus.clone(),
    )
    .await
    .map_err(Failure::from)?;

    let _ = wait_task.await;

    if !outcome.status.is_empty() {
        let stdout_path = output_dir.join(format!("{}.stdout", step.as_str()));
        let stdout_text = tokio::fs::read_to_string(&stdout_path).await.unwrap_or_default();
        let stderr_path = output_dir.join(format!("{}.stderr", step.as_str()));
        let stderr_text = tokio::fs::read_to_string(&stderr_path).await.unwrap_or_default();
        let last_line = last_non_empty_line(stderr_text.as_bytes())
            .or_else(|| last_non_empty_line(stdout_text.as_bytes()));
        return Err(Failure::Stage {
            status: BuildStatus::Clone,
            last_line,
        });
    }

    let stdout_path = output_dir.join(format!("{}.stdout", step.as_str()));
    let stdout_text = tokio::fs::read_to_string(&stdout_path).await.unwrap_or_default();
    Ok(CapturedStep { stdout: stdout_text })
}

async fn run_build_step(
    ctx: &DriverContext<'_>,
    repo: &Repo,
    build: &Build,
    build_dir: &Path,
    checkout_dir: &Path,
    output_dir: &Path,
) -> std::result::Result<(), Failure> {
    let env = build_environment(ctx.config, repo, build, build_dir, checkout_dir);
    let checkout_rel = checkout_dir
        .strip_prefix(build_dir.join("checkout"))
        .unwrap_or(checkout_dir)
        .to_string_lossy()
        .to_string();

    let handles = ctx
        .transport
        .spawn_build(&repo.name, build.id.0, &checkout_rel, env)
        .await
        .map_err(Failure::from)?;

    let outcome = output::run_step(
        output_dir,
        build.id,
        StepName::Build,
        handles.stdout,
        handles.stderr,
        handles.status,
        ctx.bus.clone(),
    )
    .await
    .map_err(Failure::from)?;

    if !outcome.status.is_empty() {
        let stdout_path = output_dir.join("build.stdout");
        let stdout_text = tokio::fs::read_to_string(&stdout_path).await.unwrap_or_default();
        let stderr_path = output_dir.join("build.stderr");
        let stderr_text = tokio::fs::read_to_string(&stderr_path).await.unwrap_or_default();
        let last_line = last_non_empty_line(stderr_text.as_bytes())
            .or_else(|| last_non_empty_line(stdout_text.as_bytes()));
        return Err(Failure::Stage {
            status: BuildStatus::Build,
            last_line,
        });
    }

    record_artifacts(ctx, repo, build, checkout_dir, output_dir).await?;
    Ok(())
}

async fn record_artifacts(
    ctx: &DriverContext<'_>,
    _repo: &Repo,
    build: &Build,
    checkout_dir: &Path,
    output_dir: &Path,
) -> std::result::Result<(), Failure> {
    let stdout_path = output_dir.join("build.stdout");
    let stdout_text = tokio::fs::read_to_string(&stdout_path).await.unwrap_or_default();
    let declarations = output::parse_artifact_declarations(&stdout_text).map_err(Failure::from)?;

    for decl in declarations {
        let artifact_path = if decl.filename.starts_with('/') {
            PathBuf::from(&decl.filename)
        } else {
            checkout_dir.join(&decl.filename)
        };
        let metadata = tokio::fs::metadata(&artifact_path).await.map_err(|_| {
            Failure::User(format!(
                "released file {:?} does not exist in the checkout",
                decl.filename
            ))
        })?;

        // Stored filename is always relative to checkout_dir, regardless of
        // whether the release line declared an absolute or relative path.
        let relative_filename = if decl.filename.starts_with('/') {
            artifact_path
                .strip_prefix(checkout_dir)
                .map_err(|_| {
                    Failure::User(format!(
                        "released file {:?} is outside the checkout directory",
                        decl.filename
                    ))
                })?
                .to_string_lossy()
                .into_owned()
        } else {
            decl.filename.clone()
        };

        let result = BuildResult::new(
            build.id,
            decl.command,
            decl.version,
            decl.os,
            decl.arch,
            decl.toolchain,
            relative_filename,
            metadata.len() as i64,
        );
        ResultRepo::create(ctx.pool, &result).await.map_err(Failure::from)?;
    }
    Ok(())
}

fn build_environment(
    config: &Config,
    repo: &Repo,
    build: &Build,
    build_dir: &Path,
    _checkout_dir: &Path,
) -> Vec<(String, String)> {
    let mut env = vec![
        ("BUILDDIR".to_string(), build_dir.to_string_lossy().to_string()),
        ("CHECKOUTPATH".to_string(), repo.checkout_path.clone()),
        ("HOME".to_string(), build_dir.join("home").to_string_lossy().to_string()),
        ("BUILDID".to_string(), build.id.0.to_string()),
        ("REPONAME".to_string(), repo.name.clone()),
        ("BRANCH".to_string(), build.branch.clone()),
        ("COMMIT".to_string(), build.commit_hash.clone()),
    ];
    for (k, v) in &config.environment {
        env.push((k.clone(), v.clone()));
    }
    env
}

fn prefixed_command(config: &Config, program: &str) -> Command {
    if let Some((first, rest)) = config.run_prefix.split_first() {
        let mut cmd = Command::new(first);
        cmd.args(rest).arg(program);
        cmd
    } else {
        Command::new(program)
    }
}

fn last_non_empty_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| l.to_string())
}

/// Runs on every exit path: sets `finish`, trims retained builds, applies
/// the notification policy, and emits the final build-change event.
async fn finalize(
    ctx: &DriverContext<'_>,
    repo: &Repo,
    build: &mut Build,
    error_message: Option<String>,
    last_line: Option<String>,
) -> Result<()> {
    let finish = chrono::Utc::now();
    BuildRepo::finish(
        ctx.pool,
        build.id,
        finish,
        error_message.as_deref(),
        last_line.as_deref(),
    )
    .await?;
    build.finish.get_or_insert(finish);
    build.error_message = build.error_message.clone().or(error_message);
    build.last_line = build.last_line.clone().or(last_line);

    let removed = cleanup_builds(ctx.pool, ctx.transport, &repo.name, repo.id, &build.branch).await?;
    if removed > 0 {
        tracing::debug!(repo = %repo.name, branch = %build.branch, removed, "trimmed retained builds");
    }

    let previous = previous_status(ctx.pool, repo.id, &build.branch, build.id).await?;
    let decision = notify::decide(previous, !build.status.is_success());
    if let Some(notification) = mail::render(
        decision,
        &ctx.config.base_url,
        &repo.name,
        build.id.0,
        &build.branch,
        build.last_line.as_deref(),
        build.error_message.as_deref(),
        &ctx.config.notify.name,
        &ctx.config.notify.email,
    ) {
        mail::send(&ctx.config.mail, notification).await;
    }

    ctx.bus
        .publish(Event::Build {
            repo: repo.name.clone(),
            build: Box::new(build.clone()),
        })
        .await;

    Ok(())
}

async fn previous_status(
    pool: &DbPool,
    repo_id: crate::models::RepoId,
    branch: &str,
    current: BuildId,
) -> Result<Option<BuildStatus>> {
    let builds = BuildRepo::list_for_branch(pool, repo_id, branch).await?;
    Ok(builds
        .into_iter()
        .find(|b| b.id != current)
        .map(|b| b.status))
}

/// Loads the repository a queued build belongs to; used by the serializer
/// when replaying recovered builds at startup.
pub async fn load_repo_for_build(pool: &DbPool, build: &Build) -> Result<Repo> {
    RepoRepo::get_by_id(pool, build.repo_id)
        .await?
        .ok_or_else(|| DingError::RepositoryNotFound(build.repo_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_non_empty_line_skips_trailing_blank() {
        assert_eq!(
            last_non_empty_line(b"first\nsecond\n\n"),
            Some("second".to_string())
        );
    }

    #[test]
    fn last_non_empty_line_handles_empty_input() {
        assert_eq!(last_non_empty_line(b""), None);
    }

    fn test_config() -> Config {
        serde_json::from_str(
            r#"{"database_url":"sqlite::memory:","base_url":"http://localhost:8080"}"#,
        )
        .unwrap()
    }

    #[test]
    fn build_environment_contains_required_keys() {
        let config = test_config();
        let repo = Repo {
            id: crate::models::RepoId(1),
            name: "demo".to_string(),
            vcs: Vcs::Git,
            origin: "https://example.com/demo.git".to_string(),
            checkout_path: "demo".to_string(),
            build_script: "#!/bin/sh\n".to_string(),
        };
        let build = Build::new(repo.id, "main".to_string(), "abc123".to_string());
        let env = build_environment(&config, &repo, &build, Path::new("/data/build/demo/1"), Path::new("/x"));
        let keys: Vec<&str> = env.iter().map(|(k, _)| k.as_str()).collect();
        for required in ["BUILDDIR", "CHECKOUTPATH", "HOME", "BUILDID", "REPONAME", "BRANCH", "COMMIT"] {
            assert!(keys.contains(&required), "missing {required}");
        }
    }
}
