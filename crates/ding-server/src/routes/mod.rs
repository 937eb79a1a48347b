//! HTTP route handlers.

pub mod downloads;
pub mod events;
pub mod repositories;
pub mod builds;
pub mod webhooks;

use axum::http::StatusCode;
use axum::Json;
use ding_core::error::{DingError, ErrorKind};
use serde_json::{json, Value};

/// Maps a [`DingError`] onto the three-way `userError`/`serverError`/
/// `userNotFound` taxonomy the RPC surface exposes, in a sherpa-style
/// `{"code","message"}` body.
pub fn error_response(e: DingError) -> (StatusCode, Json<Value>) {
    let (status, code) = match e.kind() {
        ErrorKind::UserError => (StatusCode::BAD_REQUEST, "userError"),
        ErrorKind::NotFound => (StatusCode::NOT_FOUND, "userNotFound"),
        ErrorKind::ServerError => {
            tracing::error!(error = %e, "server error");
            (StatusCode::INTERNAL_SERVER_ERROR, "serverError")
        }
    };
    (status, Json(json!({ "code": code, "message": e.to_string() })))
}

/// GET /api/status
pub async fn status() -> Json<Value> {
    Json(json!({ "version": ding_core::VERSION, "name": "ding" }))
}
