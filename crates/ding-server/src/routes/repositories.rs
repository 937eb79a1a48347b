//! `repo`, `createRepo`, `saveRepo`, `removeRepo`.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use ding_core::db::repository::RepoRepo;
use ding_core::event::Event;
use ding_core::models::{RepoResponse, SaveRepoRequest};
use serde_json::json;

use crate::routes::error_response;
use crate::state::AppState;

/// GET /api/repos
pub async fn list_repos(State(state): State<AppState>) -> impl IntoResponse {
    match RepoRepo::list(&state.db).await {
        Ok(repos) => {
            let responses: Vec<RepoResponse> = repos.into_iter().map(RepoResponse::from).collect();
            (StatusCode::OK, Json(json!(responses))).into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

/// GET /api/repos/:name
pub async fn get_repo(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
    match RepoRepo::get_by_name(&state.db, &name).await {
        Ok(Some(repo)) => (StatusCode::OK, Json(json!(RepoResponse::from(repo)))).into_response(),
        Ok(None) => error_response(ding_core::DingError::RepositoryNotFound(name)).into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// POST /api/repos
pub async fn create_repo(
    State(state): State<AppState>,
    Json(req): Json<SaveRepoRequest>,
) -> impl IntoResponse {
    let repo = match ding_core::models::Repo::try_from(req) {
        Ok(repo) => repo,
        Err(e) => return error_response(e).into_response(),
    };

    let mut repo = repo;
    match RepoRepo::create(&state.db, &repo).await {
        Ok(id) => {
            repo.id = id;
            state.bus.publish(Event::Repo(repo.clone())).await;
            (StatusCode::CREATED, Json(json!(RepoResponse::from(repo)))).into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

/// PUT /api/repos/:name
pub async fn save_repo(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(req): Json<SaveRepoRequest>,
) -> impl IntoResponse {
    let existing = match RepoRepo::get_by_name(&state.db, &name).await {
        Ok(Some(repo)) => repo,
        Ok(None) => return error_response(ding_core::DingError::RepositoryNotFound(name)).into_response(),
        Err(e) => return error_response(e).into_response(),
    };

    let mut repo = match ding_core::models::Repo::try_from(req) {
        Ok(repo) => repo,
        Err(e) => return error_response(e).into_response(),
    };
    repo.id = existing.id;

    match RepoRepo::update(&state.db, &repo).await {
        Ok(()) => {
            state.bus.publish(Event::Repo(repo.clone())).await;
            (StatusCode::OK, Json(json!(RepoResponse::from(repo)))).into_response()
        }
        Err(e) => error_response(e).into_response(),
    }
}

/// DELETE /api/repos/:name
pub async fn remove_repo(State(state): State<AppState>, Path(name): Path<String>) -> impl IntoResponse {
    let repo = match RepoRepo::get_by_name(&state.db, &name).await {
        Ok(Some(repo)) => repo,
        Ok(None) => return error_response(ding_core::DingError::RepositoryNotFound(name)).into_response(),
        Err(e) => return error_response(e).into_response(),
    };

    if let Err(e) = RepoRepo::delete(&state.db, repo.id).await {
        return error_response(e).into_response();
    }
    if let Err(e) = state.transport.remove_dir(&repo.name, None).await {
        tracing::warn!(repo = %repo.name, error = %e, "failed to remove build tree for removed repository");
    }
    state.bus.publish(Event::RemoveRepo { name: repo.name }).await;
    StatusCode::NO_CONTENT.into_response()
}
