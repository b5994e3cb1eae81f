//! Wire types for the inference service API.

use serde::{Deserialize, Serialize};

use crate::core::session::Message;

/// One prior turn, as sent in `history`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

impl From<&Message> for HistoryEntry {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role.as_str().to_string(),
            content: message.content.clone(),
        }
    }
}

/// Body of `POST /api/command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    pub user_input: String,
    pub session_id: String,
    pub history: Vec<HistoryEntry>,
    pub model: String,
}

/// Body of `GET /api/models`.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ModelsResponse {
    #[serde(default)]
    pub models: Vec<Option<String>>,
    #[serde(default)]
    pub error: Option<String>,
}
