//! Application state for the Ding server.

use std::sync::Arc;

use ding_core::config::Config;
use ding_core::db::DbPool;
use ding_core::event::EventBus;
use ding_core::ipc::IpcTransport;
use ding_core::serializer::Serializer;

/// Shared application state threaded through every route handler.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: Arc<Config>,
    pub transport: Arc<dyn IpcTransport>,
    pub serializer: Serializer,
    pub bus: EventBus,
}

impl AppState {
    pub fn new(
        db: DbPool,
        config: Config,
        transport: Arc<dyn IpcTransport>,
        serializer: Serializer,
        bus: EventBus,
    ) -> Self {
        Self {
            db,
            config: Arc::new(config),
            transport,
            serializer,
            bus,
        }
    }
}
