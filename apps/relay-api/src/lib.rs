pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod routes;

use std::sync::Arc;

use tokio::sync::watch;

use config::Config;
use db::kv::PresenceStore;
use gateway::bus::GroupBus;
use gateway::registry::ConnectionRegistry;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn PresenceStore>,
    pub registry: Arc<ConnectionRegistry>,
    /// Flipped to `true` once on shutdown; every connection loop subscribes.
    pub shutdown: Arc<watch::Sender<bool>>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn PresenceStore>, bus: Arc<dyn GroupBus>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(bus, &config.key_prefix));
        let (shutdown, _) = watch::channel(false);
        Self {
            config: Arc::new(config),
            store,
            registry,
            shutdown: Arc::new(shutdown),
        }
    }

    /// Ask every open connection to close with "going away".
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}
