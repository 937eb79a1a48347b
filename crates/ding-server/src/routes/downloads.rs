//! File download routes: individual release/result files, and on-the-fly
//! `.zip`/`.tgz` bundles of a build's declared artifacts.

use std::path::{Path as FsPath, PathBuf};

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use ding_core::archive::{build_tgz, build_zip, ArchiveEntry};
use ding_core::db::build::BuildRepo;
use ding_core::db::repository::RepoRepo;
use ding_core::db::result::ResultRepo;
use ding_core::models::BuildId;
use ding_core::release::release_artifact_path;
use ding_core::DingError;

use crate::routes::error_response;
use crate::state::AppState;

/// GET /release/:repo/:id/:name
///
/// Serves one promoted release artifact. Clients that advertise
/// `Accept-Encoding: gzip` get the on-disk `.gz` file streamed as-is;
/// everyone else gets it decompressed.
pub async fn release_file(
    State(state): State<AppState>,
    Path((repo, id, name)): Path<(String, i64, String)>,
    headers: HeaderMap,
) -> Response {
    let path = release_artifact_path(std::path::Path::new(&state.config.release_dir), &repo, id, &name);
    let data = match tokio::fs::read(&path).await {
        Ok(data) => data,
        Err(_) => {
            return error_response(DingError::BuildNotFound(format!("{repo}/{id}/{name}"))).into_response()
        }
    };

    if accepts_gzip(&headers) {
        (
            [(header::CONTENT_ENCODING, "gzip"), (header::CONTENT_TYPE, "application/octet-stream")],
            data,
        )
            .into_response()
    } else {
        match gunzip(&data) {
            Ok(raw) => ([(header::CONTENT_TYPE, "application/octet-stream")], raw).into_response(),
            Err(e) => error_response(e).into_response(),
        }
    }
}

/// GET /result/:repo/:id/:basename
///
/// Serves a single result file straight from the build's checkout,
/// matched by filename suffix against the declared results for that
/// build (so callers can ask for `app-release.apk` without knowing the
/// full relative path it was declared under).
pub async fn result_file(
    State(state): State<AppState>,
    Path((repo_name, id, basename)): Path<(String, i64, String)>,
) -> Response {
    let build_id = BuildId(id);
    let (repo, build) = match load_repo_and_build(&state, &repo_name, build_id).await {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    let results = match ResultRepo::list_for_build(&state.db, build.id).await {
        Ok(r) => r,
        Err(e) => return error_response(e).into_response(),
    };

    let Some(result) = results.iter().find(|r| r.filename.ends_with(&basename)) else {
        return error_response(DingError::BuildNotFound(format!("{repo_name}/{id}/{basename}"))).into_response();
    };

    let checkout_dir = checkout_dir(&state, &repo.name, build.id, &repo.checkout_path);
    let path = checkout_dir.join(&result.filename);
    match tokio::fs::read(&path).await {
        Ok(data) => ([(header::CONTENT_TYPE, "application/octet-stream")], data).into_response(),
        Err(e) => error_response(DingError::Io(e)).into_response(),
    }
}

/// GET /download/release/:repo/:id/:name (name ends in `.zip` or `.tgz`)
///
/// Bundles every promoted artifact for the build into a single archive.
pub async fn download_release(
    State(state): State<AppState>,
    Path((repo_name, id, name)): Path<(String, i64, String)>,
) -> Response {
    let build_id = BuildId(id);
    let (repo, build) = match load_repo_and_build(&state, &repo_name, build_id).await {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    let Some(format) = ArchiveFormat::from_name(&name) else {
        return error_response(DingError::UserError(format!("unsupported archive extension: {name}"))).into_response();
    };

    let results = match ResultRepo::list_for_build(&state.db, build.id).await {
        Ok(r) => r,
        Err(e) => return error_response(e).into_response(),
    };

    let release_dir = FsPath::new(&state.config.release_dir);
    let mut paths = Vec::with_capacity(results.len());
    for result in &results {
        let basename = FsPath::new(&result.filename)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| result.filename.clone());
        paths.push((basename.clone(), release_artifact_path(release_dir, &repo.name, id, &basename)));
    }
    let entries: Vec<ArchiveEntry> = paths
        .iter()
        .map(|(name, path)| ArchiveEntry { name, path, gzipped: true })
        .collect();

    build_archive(format, &entries, &name).await
}

/// GET /download/result/:repo/:id/:name (name ends in `.zip` or `.tgz`)
///
/// Bundles every declared result file straight from the build's checkout.
pub async fn download_result(
    State(state): State<AppState>,
    Path((repo_name, id, name)): Path<(String, i64, String)>,
) -> Response {
    let build_id = BuildId(id);
    let (repo, build) = match load_repo_and_build(&state, &repo_name, build_id).await {
        Ok(pair) => pair,
        Err(resp) => return resp,
    };

    let Some(format) = ArchiveFormat::from_name(&name) else {
        return error_response(DingError::UserError(format!("unsupported archive extension: {name}"))).into_response();
    };

    let results = match ResultRepo::list_for_build(&state.db, build.id).await {
        Ok(r) => r,
        Err(e) => return error_response(e).into_response(),
    };

    let checkout_dir = checkout_dir(&state, &repo.name, build.id, &repo.checkout_path);
    let paths: Vec<(String, PathBuf)> = results
        .iter()
        .map(|r| (r.filename.clone(), checkout_dir.join(&r.filename)))
        .collect();
    let entries: Vec<ArchiveEntry> = paths
        .iter()
        .map(|(name, path)| ArchiveEntry { name, path, gzipped: false })
        .collect();

    build_archive(format, &entries, &name).await
}

#[derive(Clone, Copy)]
enum ArchiveFormat {
    Zip,
    Tgz,
}

impl ArchiveFormat {
    fn from_name(name: &str) -> Option<Self> {
        if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".tgz") {
            Some(Self::Tgz)
        } else {
            None
        }
    }

    fn content_type(self) -> &'static str {
        match self {
            Self::Zip => "application/zip",
            Self::Tgz => "application/gzip",
        }
    }
}

async fn build_archive(format: ArchiveFormat, entries: &[ArchiveEntry<'_>], name: &str) -> Response {
    let result = match format {
        ArchiveFormat::Zip => build_zip(entries).await,
        ArchiveFormat::Tgz => build_tgz(entries).await,
    };
    match result {
        Ok(data) => (
            [
                (header::CONTENT_TYPE, format.content_type().to_string()),
                (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{name}\"")),
            ],
            data,
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

async fn load_repo_and_build(
    state: &AppState,
    repo_name: &str,
    build_id: BuildId,
) -> Result<(ding_core::models::Repo, ding_core::models::Build), Response> {
    let repo = RepoRepo::get_by_name(&state.db, repo_name)
        .await
        .map_err(|e| error_response(e).into_response())?
        .ok_or_else(|| error_response(DingError::RepositoryNotFound(repo_name.to_string())).into_response())?;

    let build = BuildRepo::get_by_id(&state.db, build_id)
        .await
        .map_err(|e| error_response(e).into_response())?
        .ok_or_else(|| error_response(DingError::BuildNotFound(build_id.0.to_string())).into_response())?;

    if build.repo_id != repo.id {
        return Err(error_response(DingError::BuildNotFound(build_id.0.to_string())).into_response());
    }

    Ok((repo, build))
}

fn checkout_dir(state: &AppState, repo_name: &str, build_id: BuildId, checkout_path: &str) -> PathBuf {
    FsPath::new(&state.config.isolate_builds.builds_dir)
        .join(repo_name)
        .join(build_id.0.to_string())
        .join("checkout")
        .join(checkout_path)
}

fn accepts_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("gzip"))
        .unwrap_or(false)
}

fn gunzip(data: &[u8]) -> ding_core::Result<Bytes> {
    use std::io::Read;
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(DingError::Io)?;
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_format_detects_extension() {
        assert!(matches!(ArchiveFormat::from_name("app.zip"), Some(ArchiveFormat::Zip)));
        assert!(matches!(ArchiveFormat::from_name("app.tgz"), Some(ArchiveFormat::Tgz)));
        assert!(ArchiveFormat::from_name("app.exe").is_none());
    }
}
