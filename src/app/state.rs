//! Application state shared across routes

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::Config;
use crate::game::ServerHandle;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    /// Handle to the tick coordinator
    pub server: ServerHandle,
    /// Flips to true when the process starts shutting down
    pub shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(config: Config, server: ServerHandle, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            config: Arc::new(config),
            server,
            shutdown,
        }
    }
}
