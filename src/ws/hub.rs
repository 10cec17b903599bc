use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::registry::RoomRegistry;
use crate::config::Config;
use crate::db::{
    ContentStore, FileUpdateStoreProvider, FsContentStore, MemoryUpdateStoreProvider, UpdateStoreProvider,
};

/// Timings for the background activities of document rooms.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// How long an empty document room survives.
    pub cleanup_delay: Duration,
    /// Quiet period before a changed document is saved.
    pub save_delay: Duration,
    /// File poll interval. Zero disables watching.
    pub poll_interval: Duration,
    /// Prefer file-system events over polling when the store is on local disk.
    pub file_watch: bool,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            cleanup_delay: Duration::from_secs(60),
            save_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(1),
            file_watch: true,
        }
    }
}

impl HubSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cleanup_delay: Duration::from_secs(config.room_cleanup_secs),
            save_delay: Duration::from_millis(config.save_delay_ms),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            file_watch: config.file_watch,
        }
    }
}

/// Process-scoped owner of the room registry and the stores rooms talk to.
/// Created once at startup and shared by every connection.
pub struct SyncHub {
    pub registry: RoomRegistry,
    pub contents: Arc<dyn ContentStore>,
    pub settings: HubSettings,
}

impl SyncHub {
    pub fn new(
        contents: Arc<dyn ContentStore>,
        update_stores: Arc<dyn UpdateStoreProvider>,
        settings: HubSettings,
    ) -> Self {
        Self {
            registry: RoomRegistry::new(update_stores),
            contents,
            settings,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let root = PathBuf::from(&config.root_dir);
        let update_stores: Arc<dyn UpdateStoreProvider> = match config.update_store.as_str() {
            "memory" => Arc::new(MemoryUpdateStoreProvider::new()),
            _ => Arc::new(FileUpdateStoreProvider::new(root.clone())),
        };
        info!(
            "Serving files from {} with {} update logs",
            root.display(),
            config.update_store
        );
        Self::new(
            Arc::new(FsContentStore::new(root)),
            update_stores,
            HubSettings::from_config(config),
        )
    }
}
