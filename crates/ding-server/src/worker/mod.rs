//! Build dispatch: bridges the HTTP/RPC and webhook handlers to the
//! per-repo serializer and the build driver.

use ding_core::models::{Build, Repo};
use ding_core::pipeline::{run_build, DriverContext};

use crate::state::AppState;

/// Submits `build` for `repo` to the serializer and spawns the driver once
/// a ticket is granted. Returns immediately; the build runs in the
/// background and its progress is observable via the event bus.
pub fn dispatch_build(state: AppState, repo: Repo, build: Build) {
    tokio::spawn(async move {
        state.serializer.acquire(repo.name.clone()).await;

        let ctx = DriverContext {
            pool: &state.db,
            transport: state.transport.as_ref(),
            config: &state.config,
            bus: state.bus.clone(),
        };

        if let Err(e) = run_build(&ctx, &repo, build).await {
            tracing::error!(repo = %repo.name, error = %e, "build driver returned an infrastructure error");
        }

        state.serializer.finished(repo.name).await;
    });
}

/// Re-submits every queued build recovered at startup, in the order the
/// store returns them (submission order).
pub async fn dispatch_recovered(state: &AppState, queued: Vec<Build>) -> ding_core::Result<()> {
    for build in queued {
        let repo = ding_core::pipeline::load_repo_for_build(&state.db, &build).await?;
        dispatch_build(state.clone(), repo, build);
    }
    Ok(())
}
