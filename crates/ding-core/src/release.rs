//! `createRelease`: promotes a successful build's declared artifacts into
//! a stable, gzip-compressed location and snapshots its captured step
//! output.

use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::db::build::BuildRepo;
use crate::db::result::{ReleaseRepo, ResultRepo};
use crate::error::{DingError, Result};
use crate::models::{Build, BuildId, Release, Repo, StepName, StepRecord};

/// Promotes `build_id`'s declared artifacts under
/// `release_dir/<repo.name>/<build_id>/`, snapshotting the build's steps.
/// Idempotent: calling again after a successful promotion returns the
/// existing release record unchanged.
pub async fn create_release(
    pool: &crate::db::DbPool,
    builds_dir: &Path,
    release_dir: &Path,
    repo: &Repo,
    build_id: BuildId,
) -> Result<Release> {
    if let Some(existing) = ReleaseRepo::get_by_build(pool, build_id).await? {
        return Ok(existing);
    }

    let build = BuildRepo::get_by_id(pool, build_id)
        .await?
        .ok_or_else(|| DingError::BuildNotFound(build_id.to_string()))?;

    if !build.status.is_success() {
        return Err(DingError::BuildNotSuccessful);
    }

    let build_dir = builds_dir.join(&repo.name).join(build_id.0.to_string());
    let checkout_dir = build_dir.join("checkout").join(&repo.checkout_path);
    let output_dir = build_dir.join("output");
    let out_dir = release_dir.join(&repo.name).join(build_id.0.to_string());
    tokio::fs::create_dir_all(&out_dir).await.map_err(DingError::Io)?;

    let results = ResultRepo::list_for_build(pool, build_id).await?;
    for result in &results {
        let source = checkout_dir.join(&result.filename);
        let data = tokio::fs::read(&source).await.map_err(|e| {
            DingError::UserError(format!(
                "released file {:?} missing at promotion time: {e}",
                result.filename
            ))
        })?;

        let name = Path::new(&result.filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| result.filename.clone());
        let dest = out_dir.join(format!("{name}.gz"));
        gzip_to_file(&data, &dest).await?;
    }

    let steps = snapshot_steps(&output_dir, step_order(&build, repo)).await?;

    let release = Release {
        build_id,
        time: chrono::Utc::now(),
        build_script: repo.build_script.clone(),
        steps,
    };
    ReleaseRepo::create(pool, &release).await?;
    BuildRepo::mark_released(pool, build_id, release.time).await?;

    Ok(release)
}

fn step_order(_build: &Build, repo: &Repo) -> &'static [StepName] {
    match repo.vcs {
        crate::models::Vcs::Git => &StepName::GIT_ORDER,
        _ => &StepName::NO_CHECKOUT_ORDER,
    }
}

async fn snapshot_steps(output_dir: &Path, order: &[StepName]) -> Result<Vec<StepRecord>> {
    let mut steps = Vec::with_capacity(order.len());
    for &name in order {
        let stdout = read_or_empty(output_dir, name, "stdout").await?;
        let stderr = read_or_empty(output_dir, name, "stderr").await?;
        let output = read_or_empty(output_dir, name, "output").await?;
        let nsec = read_or_empty(output_dir, name, "nsec")
            .await?
            .trim()
            .parse()
            .unwrap_or(0);
        steps.push(StepRecord { name, stdout, stderr, output, nsec });
    }
    Ok(steps)
}

async fn read_or_empty(dir: &Path, step: StepName, ext: &str) -> Result<String> {
    match tokio::fs::read_to_string(dir.join(format!("{}.{ext}", step.as_str()))).await {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(DingError::Io(e)),
    }
}

async fn gzip_to_file(data: &[u8], dest: &Path) -> Result<()> {
    let data = data.to_vec();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let file = std::fs::File::create(&dest)?;
        let mut encoder = GzEncoder::new(file, Compression::default());
        std::io::Write::write_all(&mut encoder, &data)?;
        encoder.finish()?;
        Ok(())
    })
    .await
    .map_err(|e| DingError::Io(std::io::Error::other(e.to_string())))?
    .map_err(DingError::Io)
}

/// Path to a promoted release artifact on disk, for the download routes.
pub fn release_artifact_path(release_dir: &Path, repo: &str, build_id: i64, name: &str) -> PathBuf {
    release_dir.join(repo).join(build_id.to_string()).join(format!("{name}.gz"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn gzip_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.gz");
        gzip_to_file(b"hello release", &dest).await.unwrap();

        let compressed = tokio::fs::read(&dest).await.unwrap();
        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut out = String::new();
        std::io::Read::read_to_string(&mut decoder, &mut out).unwrap();
        assert_eq!(out, "hello release");
    }
}
