use std::sync::Arc;

use tokio::sync::broadcast;

use crate::camera::registry::CameraRegistry;
use crate::config::ConfigStore;
use crate::status::StatusStore;

/// Application-wide state shared across handlers
///
/// One explicit context value instead of process-wide singletons: the
/// registry owns the pipelines, the status store carries observability
/// records, the config store is the single source of settings.
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// Camera registry (pipelines, preview, probing)
    pub registry: Arc<CameraRegistry>,
    /// Status store for out-of-process observation
    pub status: Arc<StatusStore>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: ConfigStore,
        registry: Arc<CameraRegistry>,
        status: Arc<StatusStore>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            status,
            shutdown_tx,
        })
    }

    /// Subscribe to shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
