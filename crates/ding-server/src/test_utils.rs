//! Test utilities for ding-server integration tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{routing::get, Router};
use ding_core::config::{Config, IsolationConfig, MailConfig, NotifyConfig};
use ding_core::db::{create_pool, run_migrations, DbPool};
use ding_core::event::EventBus;
use ding_core::ipc::InProcessTransport;
use ding_core::serializer::Serializer;

use crate::routes;
use crate::state::AppState;

static TEST_DIR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Creates an in-memory test database with migrations applied.
pub async fn setup_test_db() -> DbPool {
    let pool = create_pool("sqlite::memory:")
        .await
        .expect("Failed to create test database");
    run_migrations(&pool).await.expect("Failed to run migrations");
    pool
}

/// Creates test application state backed by an in-memory database and an
/// in-process IPC transport (no isolation, as in single-process test runs).
pub async fn setup_test_state() -> AppState {
    let db = setup_test_db().await;

    let n = TEST_DIR_COUNTER.fetch_add(1, Ordering::Relaxed);
    let builds_dir = std::env::temp_dir().join(format!("ding-test-{n}"));

    let config = Config {
        database_url: "sqlite::memory:".to_string(),
        base_url: "http://localhost:8080".to_string(),
        environment: Default::default(),
        run_prefix: Vec::new(),
        notify: NotifyConfig::default(),
        github_webhook_secret: Some("test-github-secret".to_string()),
        bitbucket_webhook_secret: Some("test-bitbucket-secret".to_string()),
        isolate_builds: IsolationConfig {
            builds_dir: builds_dir.to_string_lossy().to_string(),
            ..IsolationConfig::default()
        },
        mail: MailConfig::default(),
        listen: "127.0.0.1:0".to_string(),
        release_dir: std::env::temp_dir().join(format!("ding-test-release-{n}")).to_string_lossy().to_string(),
    };

    let transport = Arc::new(InProcessTransport::new(builds_dir));
    let serializer = Serializer::spawn();
    let bus = EventBus::spawn();

    AppState::new(db, config, transport, serializer, bus)
}

/// Creates the full application router for testing.
pub fn create_test_app(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(routes::status))
        .route("/api/repos", get(routes::repositories::list_repos).post(routes::repositories::create_repo))
        .route(
            "/api/repos/{name}",
            get(routes::repositories::get_repo)
                .put(routes::repositories::save_repo)
                .delete(routes::repositories::remove_repo),
        )
        .route("/api/repos/{name}/builds", get(routes::builds::list_builds))
        .route("/api/builds", get(routes::builds::repo_builds).post(routes::builds::create_build))
        .route("/api/builds/{id}", axum::routing::delete(routes::builds::remove_build))
        .route("/github/{repo}", axum::routing::post(routes::webhooks::github))
        .route("/bitbucket/{repo}/{secret}", axum::routing::post(routes::webhooks::bitbucket))
        .route("/events", get(routes::events::events))
        .with_state(state)
}

/// Creates a test application with in-memory database.
pub async fn create_test_app_with_state() -> Router {
    let state = setup_test_state().await;
    create_test_app(state)
}
