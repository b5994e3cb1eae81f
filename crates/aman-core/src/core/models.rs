//! Selected model, persisted across runs.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};

use crate::client::InferenceClient;
use crate::core::persistence::{KeyValueStore, MODEL_KEY};

#[derive(Debug, Default)]
struct Selection {
    current: String,
    available: Vec<String>,
}

/// The model sent with every command, plus the last known model listing.
pub struct ModelSelection {
    backend: Arc<dyn KeyValueStore>,
    state: Mutex<Selection>,
}

impl ModelSelection {
    /// Restores the saved model, or `default_model` when nothing was saved.
    pub fn load(backend: Arc<dyn KeyValueStore>, default_model: &str) -> Self {
        let saved = match backend.get(MODEL_KEY) {
            Ok(saved) => saved.and_then(|raw| decode_model(&raw)),
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "Failed to read saved model");
                None
            }
        };

        Self {
            backend,
            state: Mutex::new(Selection {
                current: saved.unwrap_or_else(|| default_model.to_string()),
                available: Vec::new(),
            }),
        }
    }

    pub fn current(&self) -> String {
        self.lock().current.clone()
    }

    pub fn available(&self) -> Vec<String> {
        self.lock().available.clone()
    }

    /// Selects `model` and saves it.
    ///
    /// # Errors
    /// Returns an error if the id is blank or the backend write fails. The
    /// in-memory selection is updated either way for non-blank ids.
    pub fn set(&self, model: &str) -> Result<()> {
        let model = model.trim();
        if model.is_empty() {
            anyhow::bail!("Model id cannot be empty");
        }
        self.lock().current = model.to_string();
        tracing::info!(model = %model, "Model selected");
        self.save(model)
    }

    /// Records the service's model listing.
    ///
    /// When the listing is non-empty and does not contain the current model,
    /// the first listed model is selected and saved. Returns the newly
    /// selected model in that case.
    pub fn reconcile(&self, models: Vec<String>) -> Option<String> {
        let fallback = {
            let mut state = self.lock();
            let fallback = match models.first() {
                Some(first) if !models.contains(&state.current) => {
                    state.current = first.clone();
                    Some(first.clone())
                }
                _ => None,
            };
            state.available = models;
            fallback
        };

        if let Some(model) = &fallback {
            tracing::info!(model = %model, "Saved model unavailable; falling back");
            if let Err(err) = self.save(model) {
                tracing::warn!(error = %format!("{err:#}"), "Failed to persist model selection");
            }
        }
        fallback
    }

    /// Fetches the listing from the service and reconciles with it.
    ///
    /// Failures are logged and leave the selection untouched.
    pub async fn refresh(&self, client: &InferenceClient) -> Option<String> {
        match client.list_models().await {
            Ok(models) => {
                tracing::debug!(count = models.len(), "Models listed");
                self.reconcile(models)
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to list models");
                None
            }
        }
    }

    fn save(&self, model: &str) -> Result<()> {
        let json = serde_json::to_string(model).context("Failed to serialize model id")?;
        self.backend
            .put(MODEL_KEY, &json)
            .context("Failed to save model selection")
    }

    fn lock(&self) -> MutexGuard<'_, Selection> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Accepts both a JSON string and a bare id.
fn decode_model(raw: &str) -> Option<String> {
    let model = serde_json::from_str::<String>(raw).unwrap_or_else(|_| raw.trim().to_string());
    (!model.trim().is_empty()).then_some(model)
}
