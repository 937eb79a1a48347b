use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    http::Method,
    routing::{delete, get, post, put},
    Router,
};
use clap::Parser;
use tokio::signal;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod routes;
mod service;
mod state;
mod worker;

use cli::{Cli, Commands};
use ding_core::config::Config;
use ding_core::db::{create_pool, run_migrations};
use ding_core::event::EventBus;
use ding_core::ipc::InProcessTransport;
use ding_core::serializer::{recover_queued_builds, recover_stale_builds, Serializer};
use state::AppState;

/// Body size cap applied to the whole surface; webhook payloads are the
/// largest legitimate requests it needs to admit.
const MAX_REQUEST_BODY_BYTES: usize = 10 * 1024 * 1024;

fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(routes::status))
        .route("/repos", get(routes::repositories::list_repos))
        .route("/repos", post(routes::repositories::create_repo))
        .route("/repos/{name}", get(routes::repositories::get_repo))
        .route("/repos/{name}", put(routes::repositories::save_repo))
        .route("/repos/{name}", delete(routes::repositories::remove_repo))
        .route("/repos/{name}/builds", get(routes::builds::list_builds))
        .route("/builds", get(routes::builds::repo_builds))
        .route("/builds", post(routes::builds::create_build))
        .route("/builds/{id}", delete(routes::builds::remove_build))
        .route("/repos/{repo}/builds/{id}/result", get(routes::builds::build_result))
        .route("/repos/{repo}/builds/{id}/release", post(routes::builds::create_release))
        .route("/repos/{repo}/builds/{id}/release", get(routes::builds::get_release))
        .route("/repos/{repo}/builds/{id}/cleanup", post(routes::builds::cleanup_builddir))
        .route("/events", get(routes::events::events))
        .with_state(state)
}

fn webhook_router(state: AppState) -> Router {
    Router::new()
        .route("/github/{repo}", post(routes::webhooks::github))
        .route("/bitbucket/{repo}/{secret}", post(routes::webhooks::bitbucket))
        .with_state(state)
}

fn download_router(state: AppState) -> Router {
    Router::new()
        .route("/release/{repo}/{id}/{name}", get(routes::downloads::release_file))
        .route("/result/{repo}/{id}/{basename}", get(routes::downloads::result_file))
        .route("/download/release/{repo}/{id}/{name}", get(routes::downloads::download_release))
        .route("/download/result/{repo}/{id}/{name}", get(routes::downloads::download_result))
        .with_state(state)
}

fn load_env() {
    if let Ok(env_file) = std::env::var("DING_ENV_FILE") {
        if let Err(e) = dotenvy::from_path(&env_file) {
            eprintln!("Warning: failed to load env file {env_file}: {e}");
        } else {
            return;
        }
    }
    let _ = dotenvy::dotenv();
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ding_server=info,ding_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Serves the HTTP surface over `transport`. Used directly for
/// isolation-disabled deployments and, over a [`SocketTransport`], for the
/// worker side of an isolation-enabled deployment.
async fn run_server(config: Config, transport: Arc<dyn ding_core::ipc::IpcTransport>) -> Result<()> {
    tracing::info!(base_url = %config.base_url, listen = %config.listen, "starting ding server");

    let db = match create_pool(&config.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("failed to create database pool: {e}");
            std::process::exit(1);
        }
    };
    if let Err(e) = run_migrations(&db).await {
        tracing::error!("failed to run migrations: {e}");
        std::process::exit(1);
    }

    let builds_dir = std::path::PathBuf::from(&config.isolate_builds.builds_dir);

    let stale = match recover_stale_builds(&db, &builds_dir).await {
        Ok(count) => count,
        Err(e) => {
            tracing::error!("failed to recover stale builds: {e}");
            std::process::exit(1);
        }
    };
    if stale > 0 {
        tracing::warn!(count = stale, "finalized builds left active by a previous crash");
    }

    let queued = match recover_queued_builds(&db).await {
        Ok(queued) => queued,
        Err(e) => {
            tracing::error!("failed to recover queued builds: {e}");
            std::process::exit(1);
        }
    };

    let bus = EventBus::spawn();
    let serializer = Serializer::spawn();

    let state = AppState::new(db.clone(), config.clone(), transport, serializer, bus);

    if !queued.is_empty() {
        tracing::info!(count = queued.len(), "resubmitting queued builds from previous run");
        if let Err(e) = worker::dispatch_recovered(&state, queued).await {
            tracing::error!("failed to resubmit queued builds: {e}");
        }
    }

    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE]);

    let app = Router::new()
        .nest("/api", api_router(state.clone()))
        .nest("/", webhook_router(state.clone()))
        .nest("/", download_router(state))
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_REQUEST_BODY_BYTES))
        .layer(tower_http::trace::TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(addr = %config.listen, "ding server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install ctrl+c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl+c, shutting down"),
        _ = terminate => tracing::info!("received sigterm, shutting down"),
    }
}

/// `dingd serve` with isolation disabled, or the worker's fallback when
/// invoked directly without a root process: one process, no privilege
/// boundary.
fn run_unisolated(config: Config) -> Result<()> {
    let builds_dir = std::path::PathBuf::from(&config.isolate_builds.builds_dir);
    let transport: Arc<dyn ding_core::ipc::IpcTransport> = Arc::new(InProcessTransport::new(builds_dir));
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run_server(config, transport))
}

/// `dingd serve` with isolation enabled: becomes the privileged root
/// process, forking/execing a `serve-http` worker dropped to
/// `isolate_builds.ding_uid`/`ding_gid`, then services [`Msg`][ding_core::ipc::Msg]
/// requests over the control socket until the worker exits.
#[cfg(unix)]
fn run_root(config: Config) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::os::unix::process::CommandExt;

    if unsafe { libc::geteuid() } != 0 {
        anyhow::bail!("isolate_builds.enabled requires dingd serve to run as root");
    }

    let (control_root, control_worker) =
        UnixStream::pair().context("creating control socketpair")?;
    let (fd_root, fd_worker) = UnixStream::pair().context("creating fd socketpair")?;

    clear_cloexec(control_worker.as_raw_fd())?;
    clear_cloexec(fd_worker.as_raw_fd())?;

    let exe = std::env::current_exe().context("resolving dingd path")?;
    let cli_binary = exe.with_file_name("ding");

    let mut cmd = std::process::Command::new(&exe);
    cmd.arg("serve-http")
        .env("DING_CONTROL_FD", control_worker.as_raw_fd().to_string())
        .env("DING_FD_SOCKET_FD", fd_worker.as_raw_fd().to_string())
        .uid(config.isolate_builds.ding_uid)
        .gid(config.isolate_builds.ding_gid);

    let child = cmd.spawn().context("spawning serve-http worker")?;
    tracing::info!(pid = child.id(), "worker process started");
    drop(control_worker);
    drop(fd_worker);
    std::thread::spawn(move || {
        let mut child = child;
        let _ = child.wait();
    });

    ding_core::ipc::root::run(control_root, fd_root, &config, &cli_binary)
        .map_err(|e| anyhow::anyhow!("root process loop: {e}"))
}

#[cfg(unix)]
fn clear_cloexec(fd: std::os::unix::io::RawFd) -> Result<()> {
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFD, 0) };
    if rc != 0 {
        return Err(anyhow::anyhow!(std::io::Error::last_os_error()));
    }
    Ok(())
}

fn run_serve(config: Config) -> Result<()> {
    if config.isolate_builds.enabled {
        #[cfg(unix)]
        return run_root(config);
        #[cfg(not(unix))]
        anyhow::bail!("isolate_builds.enabled is only supported on unix");
    }
    run_unisolated(config)
}

/// `dingd serve-http`: the worker entry point. Reconstructs the
/// [`SocketTransport`][ding_core::ipc::SocketTransport] from the
/// descriptors the root process set up before exec, or falls back to an
/// in-process transport if invoked without them (isolation disabled).
fn run_serve_http(config: Config) -> Result<()> {
    #[cfg(unix)]
    let transport = worker_transport_from_env(&config)?;
    #[cfg(not(unix))]
    let transport: Arc<dyn ding_core::ipc::IpcTransport> = Arc::new(InProcessTransport::new(
        std::path::PathBuf::from(&config.isolate_builds.builds_dir),
    ));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run_server(config, transport))
}

#[cfg(unix)]
fn worker_transport_from_env(config: &Config) -> Result<Arc<dyn ding_core::ipc::IpcTransport>> {
    use std::os::unix::io::FromRawFd;
    use std::os::unix::net::UnixStream;

    let control_fd = std::env::var("DING_CONTROL_FD").ok().and_then(|v| v.parse::<i32>().ok());
    let fd_socket_fd = std::env::var("DING_FD_SOCKET_FD")
        .ok()
        .and_then(|v| v.parse::<i32>().ok());

    match (control_fd, fd_socket_fd) {
        (Some(control_fd), Some(fd_socket_fd)) => {
            // Safety: these descriptors were set up by the root process
            // and inherited across exec for this purpose alone.
            let control = unsafe { UnixStream::from_raw_fd(control_fd) };
            let fd_socket = unsafe { UnixStream::from_raw_fd(fd_socket_fd) };
            control
                .set_nonblocking(true)
                .context("setting control socket nonblocking")?;
            fd_socket
                .set_nonblocking(true)
                .context("setting fd socket nonblocking")?;
            let control =
                tokio::net::UnixStream::from_std(control).context("wrapping control socket")?;
            let fd_socket =
                tokio::net::UnixStream::from_std(fd_socket).context("wrapping fd socket")?;
            Ok(Arc::new(ding_core::ipc::SocketTransport::new(control, fd_socket)))
        }
        _ => {
            let builds_dir = std::path::PathBuf::from(&config.isolate_builds.builds_dir);
            Ok(Arc::new(InProcessTransport::new(builds_dir)))
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or_default();
    let is_serve_http = matches!(command, Commands::ServeHttp);

    match command {
        Commands::Serve | Commands::ServeHttp => {
            load_env();
            let config = match Config::load() {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("configuration error: {e}");
                    std::process::exit(1);
                }
            };
            init_tracing();
            if is_serve_http {
                run_serve_http(config)
            } else {
                run_serve(config)
            }
        }
        Commands::Install { env_file, force } => service::install(env_file, force),
        Commands::Uninstall { purge } => service::uninstall(purge),
        Commands::Start => service::start(),
        Commands::Stop => service::stop(),
        Commands::Restart => service::restart(),
        Commands::Status => service::status(),
        Commands::Logs { lines, follow } => service::logs(lines, follow),
    }
}
