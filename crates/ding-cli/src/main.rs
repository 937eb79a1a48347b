use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ding_core::config::Config;
use ding_core::ipc::{validate_contained_path, validate_uid_range};
use serde::{Deserialize, Serialize};

#[derive(Parser)]
#[command(name = "ding")]
#[command(about = "Thin client for the Ding CI server", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trigger a build over the HTTP API
    Kick {
        base_url: String,
        repo: String,
        branch: String,
        commit: String,
    },
    /// Recursively chown a build path, invoked by the privileged root process
    Chownbuild {
        config_path: PathBuf,
        uid: u32,
        gid: u32,
        paths: Vec<PathBuf>,
    },
    /// Print the client version
    Version,
}

#[derive(Serialize)]
struct CreateBuildRequest<'a> {
    repo: &'a str,
    branch: &'a str,
    commit: &'a str,
}

#[derive(Deserialize)]
struct BuildResponse {
    id: i64,
}

async fn kick(base_url: &str, repo: &str, branch: &str, commit: &str) -> Result<()> {
    let url = format!("{}/api/builds", base_url.trim_end_matches('/'));
    let client = reqwest::Client::new();
    let response = client
        .post(&url)
        .json(&CreateBuildRequest { repo, branch, commit })
        .send()
        .await
        .context("initializing request to ding server")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("building: server returned {status}: {body}");
    }

    let build: BuildResponse = response.json().await.context("building")?;
    println!("buildId {}", build.id);
    Ok(())
}

/// Validates `uid`/`gid`/`paths` against the deployment's isolation
/// settings, then shells out to `chown -R uid:gid path...` in one call.
/// Kept as a small, auditable unit the root process can invoke without
/// itself linking a chown implementation.
fn chownbuild(config_path: &PathBuf, uid: u32, gid: u32, paths: &[PathBuf]) -> Result<()> {
    let config = Config::load_from_path(config_path).context("loading config")?;
    let isolation = &config.isolate_builds;

    validate_uid_range(uid, isolation.uid_start, isolation.uid_end, isolation.ding_uid)
        .context("validating uid")?;
    if gid != isolation.ding_gid {
        bail!("gid {gid} not allowed, not ding_gid {}", isolation.ding_gid);
    }

    let builds_dir = PathBuf::from(&isolation.builds_dir);
    for path in paths {
        validate_contained_path(&builds_dir, path)
            .with_context(|| format!("validating path {}", path.display()))?;
    }

    let mut cmd = Command::new("chown");
    cmd.arg("-R").arg(format!("{uid}:{gid}"));
    cmd.args(paths);

    let output = cmd.output().context("running chown")?;
    if !output.status.success() {
        bail!(
            "chown failed: {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Kick { base_url, repo, branch, commit } => kick(&base_url, &repo, &branch, &commit).await?,
        Commands::Chownbuild { config_path, uid, gid, paths } => chownbuild(&config_path, uid, gid, &paths)?,
        Commands::Version => println!("ding {}", ding_core::VERSION),
    }

    Ok(())
}
