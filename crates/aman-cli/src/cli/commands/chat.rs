//! Chat command handler.

use std::sync::Arc;

use aman_core::client::InferenceClient;
use aman_core::config::Config;
use aman_core::core::controller::StreamController;
use aman_core::core::dispatcher::Dispatcher;
use aman_core::core::models::ModelSelection;
use aman_core::core::store::SessionStore;
use anyhow::{Context, Result};

use super::open_backend;
use crate::modes;

pub async fn run(config: &Config, session: Option<&str>) -> Result<()> {
    let backend = open_backend(config);
    let mut store = SessionStore::load(Arc::clone(&backend));
    if let Some(id) = session {
        let session_id = store.resolve(id)?.id.clone();
        store.select(&session_id);
    }

    let client = InferenceClient::from_config(config)?;
    let models = Arc::new(ModelSelection::load(backend, &config.default_model));
    if let Some(model) = models.refresh(&client).await {
        eprintln!("Saved model is not offered by the service; using {model}");
    }

    let dispatcher = Dispatcher::new(store.into_shared(), StreamController::new(), client, models);
    modes::chat::run_repl(&dispatcher)
        .await
        .context("interactive chat failed")
}
