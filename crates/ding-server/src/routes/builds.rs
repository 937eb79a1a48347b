//! `createBuild`, `repoBuilds`, `builds`, `buildResult`, `createRelease`,
//! `release`, `removeBuild`, `cleanupBuilddir`.

use std::path::Path;

use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use ding_core::db::build::BuildRepo;
use ding_core::db::repository::RepoRepo;
use ding_core::db::result::{ReleaseRepo, ResultRepo};
use ding_core::models::{Build, BuildResponse, CreateBuildRequest};
use serde_json::json;

use crate::routes::error_response;
use crate::state::AppState;
use crate::worker::dispatch_build;

const RECENT_BUILDS_LIMIT: i64 = 50;

/// POST /api/builds — `createBuild(repo, branch, commit)`.
pub async fn create_build(
    State(state): State<AppState>,
    Json(req): Json<CreateBuildRequest>,
) -> impl IntoResponse {
    let repo = match RepoRepo::get_by_name(&state.db, &req.repo).await {
        Ok(Some(repo)) => repo,
        Ok(None) => return error_response(ding_core::DingError::RepositoryNotFound(req.repo)).into_response(),
        Err(e) => return error_response(e).into_response(),
    };

    let build = Build::new(repo.id, req.branch, req.commit);
    let build = match persist_and_dispatch(&state, repo, build).await {
        Ok(build) => build,
        Err(e) => return error_response(e).into_response(),
    };

    (StatusCode::CREATED, Json(json!(BuildResponse::from(build)))).into_response()
}

async fn persist_and_dispatch(
    state: &AppState,
    repo: ding_core::models::Repo,
    mut build: Build,
) -> ding_core::Result<Build> {
    build.id = BuildRepo::create(&state.db, &build).await?;
    dispatch_build(state.clone(), repo, build.clone());
    Ok(build)
}

/// GET /api/repos — `repoBuilds`: each repository paired with its most
/// recent build, for the dashboard overview.
pub async fn repo_builds(State(state): State<AppState>) -> impl IntoResponse {
    let repos = match RepoRepo::list(&state.db).await {
        Ok(repos) => repos,
        Err(e) => return error_response(e).into_response(),
    };

    let mut out = Vec::with_capacity(repos.len());
    for repo in repos {
        let latest = match BuildRepo::list_for_repo(&state.db, repo.id, 1).await {
            Ok(builds) => builds.into_iter().next(),
            Err(e) => return error_response(e).into_response(),
        };
        out.push(json!({
            "repo": ding_core::models::RepoResponse::from(repo),
            "latestBuild": latest.map(BuildResponse::from),
        }));
    }
    (StatusCode::OK, Json(json!(out))).into_response()
}

/// GET /api/repos/:repo/builds — `builds(repo)`.
pub async fn list_builds(
    State(state): State<AppState>,
    AxumPath(repo_name): AxumPath<String>,
) -> impl IntoResponse {
    let repo = match RepoRepo::get_by_name(&state.db, &repo_name).await {
        Ok(Some(repo)) => repo,
        Ok(None) => return error_response(ding_core::DingError::RepositoryNotFound(repo_name)).into_response(),
        Err(e) => return error_response(e).into_response(),
    };

    match BuildRepo::list_for_repo(&state.db, repo.id, RECENT_BUILDS_LIMIT).await {
        Ok(builds) => {
            let responses: Vec<BuildResponse> = builds.into_iter().map(BuildResponse::from).collect();
            (StatusCode::OK, Json(json!(responses))).into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

/// GET /api/repos/:repo/builds/:id/result — `buildResult`.
pub async fn build_result(
    State(state): State<AppState>,
    AxumPath((_repo_name, build_id)): AxumPath<(String, i64)>,
) -> impl IntoResponse {
    match ResultRepo::list_for_build(&state.db, build_id.into()).await {
        Ok(results) => (StatusCode::OK, Json(json!(results))).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// POST /api/repos/:repo/builds/:id/release — `createRelease(repo, buildId)`.
pub async fn create_release(
    State(state): State<AppState>,
    AxumPath((repo_name, build_id)): AxumPath<(String, i64)>,
) -> impl IntoResponse {
    let repo = match RepoRepo::get_by_name(&state.db, &repo_name).await {
        Ok(Some(repo)) => repo,
        Ok(None) => return error_response(ding_core::DingError::RepositoryNotFound(repo_name)).into_response(),
        Err(e) => return error_response(e).into_response(),
    };

    let result = ding_core::release::create_release(
        &state.db,
        Path::new(&state.config.isolate_builds.builds_dir),
        Path::new(&state.config.release_dir),
        &repo,
        build_id.into(),
    )
    .await;

    match result {
        Ok(release) => (StatusCode::CREATED, Json(json!(release))).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// GET /api/repos/:repo/builds/:id/release — `release(repo, buildId)`.
pub async fn get_release(
    State(state): State<AppState>,
    AxumPath((_repo_name, build_id)): AxumPath<(String, i64)>,
) -> impl IntoResponse {
    match ReleaseRepo::get_by_build(&state.db, build_id.into()).await {
        Ok(Some(release)) => (StatusCode::OK, Json(json!(release))).into_response(),
        Ok(None) => error_response(ding_core::DingError::BuildNotFound(build_id.to_string())).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// DELETE /api/builds/:id — `removeBuild(buildId)`.
pub async fn remove_build(State(state): State<AppState>, AxumPath(build_id): AxumPath<i64>) -> impl IntoResponse {
    let build_id = ding_core::models::BuildId(build_id);
    let build = match BuildRepo::get_by_id(&state.db, build_id).await {
        Ok(Some(build)) => build,
        Ok(None) => return error_response(ding_core::DingError::BuildNotFound(build_id.to_string())).into_response(),
        Err(e) => return error_response(e).into_response(),
    };

    if build.released.is_some() {
        return error_response(ding_core::DingError::BuildReleased).into_response();
    }

    let repo = match RepoRepo::get_by_id(&state.db, build.repo_id).await {
        Ok(Some(repo)) => repo,
        Ok(None) => return error_response(ding_core::DingError::RepositoryNotFound(build.repo_id.to_string())).into_response(),
        Err(e) => return error_response(e).into_response(),
    };

    if let Err(e) = BuildRepo::delete(&state.db, build_id).await {
        return error_response(e).into_response();
    }
    if let Err(e) = state.transport.remove_dir(&repo.name, Some(build_id.0)).await {
        tracing::warn!(build_id = build_id.0, error = %e, "failed to remove build directory");
    }
    state
        .bus
        .publish(ding_core::event::Event::RemoveBuild { repo: repo.name, build_id: build_id.0 })
        .await;
    StatusCode::NO_CONTENT.into_response()
}

/// POST /api/repos/:repo/builds/:id/cleanup — `cleanupBuilddir(repo, buildId)`.
pub async fn cleanup_builddir(
    State(state): State<AppState>,
    AxumPath((repo_name, build_id)): AxumPath<(String, i64)>,
) -> impl IntoResponse {
    let build_id = ding_core::models::BuildId(build_id);
    let build = match BuildRepo::get_by_id(&state.db, build_id).await {
        Ok(Some(build)) => build,
        Ok(None) => return error_response(ding_core::DingError::BuildNotFound(build_id.to_string())).into_response(),
        Err(e) => return error_response(e).into_response(),
    };
    if build.finish.is_none() {
        return error_response(ding_core::DingError::user_error("build is still active")).into_response();
    }

    if let Err(e) = state.transport.remove_dir(&repo_name, Some(build_id.0)).await {
        return error_response(e).into_response();
    }
    if let Err(e) = BuildRepo::mark_builddir_removed(&state.db, build_id).await {
        return error_response(e).into_response();
    }
    StatusCode::NO_CONTENT.into_response()
}
