//! CLI command handlers.

pub mod chat;
pub mod config;
pub mod models;
pub mod sessions;

use std::sync::Arc;

use aman_core::config::Config;
use aman_core::core::persistence::{FileStore, KeyValueStore};
use aman_core::core::store::SessionStore;

/// Opens the durable store under the configured data directory.
fn open_backend(config: &Config) -> Arc<dyn KeyValueStore> {
    let dir = config.data_dir();
    tracing::debug!(data_dir = %dir.display(), "Opening session data");
    Arc::new(FileStore::new(dir))
}

fn open_store(config: &Config) -> SessionStore {
    SessionStore::load(open_backend(config))
}
