//! Model command handlers.

use aman_core::client::InferenceClient;
use aman_core::config::Config;
use aman_core::core::models::ModelSelection;
use anyhow::{Context, Result};

use super::open_backend;

pub async fn list(config: &Config) -> Result<()> {
    let client = InferenceClient::from_config(config)?;
    let selection = ModelSelection::load(open_backend(config), &config.default_model);

    let models = client
        .list_models()
        .await
        .with_context(|| format!("list models from {}", client.base_url()))?;
    if models.is_empty() {
        println!("No models available.");
        return Ok(());
    }

    let current = selection.current();
    for model in &models {
        let marker = if *model == current { '*' } else { ' ' };
        println!("{marker} {model}");
    }
    Ok(())
}

pub fn set(config: &Config, model: &str) -> Result<()> {
    let selection = ModelSelection::load(open_backend(config), &config.default_model);
    selection.set(model).context("save model selection")?;
    println!("Model set to {}", selection.current());
    Ok(())
}
