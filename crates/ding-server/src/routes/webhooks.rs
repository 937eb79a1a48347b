//! Push-event webhook receivers for GitHub and Bitbucket.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use bytes::Bytes;
use ding_core::db::repository::RepoRepo;
use ding_core::models::Build;

use crate::routes::error_response;
use crate::state::AppState;
use crate::worker::dispatch_build;

/// POST /github/:repo
pub async fn github(
    State(state): State<AppState>,
    Path(repo_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let repo = match RepoRepo::get_by_name(&state.db, &repo_name).await {
        Ok(Some(repo)) => repo,
        Ok(None) => return error_response(ding_core::DingError::RepositoryNotFound(repo_name)).into_response(),
        Err(e) => return error_response(e).into_response(),
    };

    let Some(secret) = state.config.github_webhook_secret.as_deref() else {
        return error_response(ding_core::DingError::Configuration(
            "no github webhook secret configured".to_string(),
        ))
        .into_response();
    };

    let signature = headers
        .get("X-Hub-Signature")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !ding_core::crypto::verify_github_signature(secret, signature, &body) {
        return error_response(ding_core::DingError::WebhookVerificationFailed).into_response();
    }

    let push = match ding_core::webhook::parse_github_push(&body) {
        Ok(push) => push,
        Err(e) => return error_response(e).into_response(),
    };

    let build = Build::new(repo.id, push.branch, push.commit);
    match enqueue(&state, repo, build).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

/// POST /bitbucket/:repo/:secret
pub async fn bitbucket(
    State(state): State<AppState>,
    Path((repo_name, secret)): Path<(String, String)>,
    body: Bytes,
) -> impl IntoResponse {
    let repo = match RepoRepo::get_by_name(&state.db, &repo_name).await {
        Ok(Some(repo)) => repo,
        Ok(None) => return error_response(ding_core::DingError::RepositoryNotFound(repo_name)).into_response(),
        Err(e) => return error_response(e).into_response(),
    };

    match state.config.bitbucket_webhook_secret.as_deref() {
        Some(expected) if expected == secret => {}
        _ => return error_response(ding_core::DingError::WebhookVerificationFailed).into_response(),
    }

    let pushes = match ding_core::webhook::parse_bitbucket_push(&body, repo.vcs, &repo.checkout_path) {
        Ok(pushes) => pushes,
        Err(e) => return error_response(e).into_response(),
    };

    for push in pushes {
        let build = Build::new(repo.id, push.branch, push.commit);
        if let Err(e) = enqueue(&state, repo.clone(), build).await {
            return error_response(e).into_response();
        }
    }
    StatusCode::ACCEPTED.into_response()
}

async fn enqueue(state: &AppState, repo: ding_core::models::Repo, mut build: Build) -> ding_core::Result<()> {
    build.id = ding_core::db::build::BuildRepo::create(&state.db, &build).await?;
    dispatch_build(state.clone(), repo, build);
    Ok(())
}
