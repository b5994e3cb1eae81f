//! Session and message data model.
//!
//! Sessions are plain data owned by the `SessionStore`; everything here is
//! serializable so the whole collection can be written to the durable store
//! as one JSON array.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Title shown until the first user message arrives.
pub const DEFAULT_TITLE: &str = "New Chat";

/// Maximum number of characters kept from the first user message.
pub const TITLE_MAX_CHARS: usize = 30;

const TITLE_ELLIPSIS: &str = "...";

/// Operational mode that picks the default remote command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    #[default]
    Align,
    Model,
    Act,
    Navigate,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Align, Mode::Model, Mode::Act, Mode::Navigate];

    /// Wire and display name (`ALIGN`, `MODEL`, ...).
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Align => "ALIGN",
            Mode::Model => "MODEL",
            Mode::Act => "ACT",
            Mode::Navigate => "NAVIGATE",
        }
    }

    /// Remote command used when the input carries no explicit `/command`.
    pub fn default_command(self) -> String {
        format!("/{}", self.as_str().to_lowercase())
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Mode::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| format!("Unknown mode: {value}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One entry in a session transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            mode: None,
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            mode: None,
            timestamp: Utc::now(),
        }
    }

    /// Creates the empty assistant message that receives a stream.
    pub fn stream_target(mode: Mode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::assistant(String::new())
        }
    }

    /// Creates the terminal message appended when a stream fails.
    pub fn error(description: impl fmt::Display) -> Self {
        Self::assistant(format!("Error: {description}"))
    }
}

/// In-place mutation applied to an assistant message while it streams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageUpdate {
    AppendContent(String),
    SetMode(Mode),
}

impl MessageUpdate {
    pub(crate) fn apply(&self, message: &mut Message) {
        match self {
            MessageUpdate::AppendContent(text) => message.content.push_str(text),
            MessageUpdate::SetMode(mode) => message.mode = Some(*mode),
        }
    }
}

/// A persisted conversation thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// Creates an empty session with a fresh id.
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            title: DEFAULT_TITLE.to_string(),
            mode: Mode::default(),
            messages: Vec::new(),
            last_activity: Utc::now(),
        }
    }

    pub fn has_user_message(&self) -> bool {
        self.messages.iter().any(|m| m.role == Role::User)
    }

    pub fn last_message(&self) -> Option<&Message> {
        self.messages.last()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Derives a session title from the first user message.
///
/// Counts characters, not bytes, so multi-byte input never splits a code point.
pub fn derive_title(input: &str) -> String {
    if input.chars().count() > TITLE_MAX_CHARS {
        let head: String = input.chars().take(TITLE_MAX_CHARS).collect();
        format!("{head}{TITLE_ELLIPSIS}")
    } else {
        input.to_string()
    }
}

/// Short id prefix for listings.
pub fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_title_truncates_long_input() {
        let title = derive_title("Hello, how are things going today?");
        assert_eq!(title, "Hello, how are things going to...");
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
    }

    #[test]
    fn test_derive_title_keeps_short_input() {
        assert_eq!(derive_title("hi"), "hi");
    }

    #[test]
    fn test_derive_title_exactly_at_limit_is_unchanged() {
        let input = "a".repeat(TITLE_MAX_CHARS);
        assert_eq!(derive_title(&input), input);
    }

    #[test]
    fn test_derive_title_counts_chars_not_bytes() {
        let input = "é".repeat(40);
        let title = derive_title(&input);
        assert!(title.starts_with(&"é".repeat(30)));
        assert!(title.ends_with("..."));
    }

    #[test]
    fn test_mode_wire_format() {
        assert_eq!(serde_json::to_string(&Mode::Navigate).unwrap(), "\"NAVIGATE\"");
        let parsed: Mode = serde_json::from_str("\"ACT\"").unwrap();
        assert_eq!(parsed, Mode::Act);
        assert!(serde_json::from_str::<Mode>("\"act\"").is_err());
    }

    #[test]
    fn test_mode_default_command_is_lowercased() {
        assert_eq!(Mode::Align.default_command(), "/align");
        assert_eq!(Mode::Navigate.default_command(), "/navigate");
    }

    #[test]
    fn test_mode_from_str_is_case_insensitive() {
        assert_eq!("model".parse::<Mode>().unwrap(), Mode::Model);
        assert!("unknown".parse::<Mode>().is_err());
    }

    #[test]
    fn test_message_serialization_omits_missing_mode() {
        let msg = Message::user("hi");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("mode").is_none());
    }

    #[test]
    fn test_message_update_apply() {
        let mut msg = Message::stream_target(Mode::Align);
        MessageUpdate::AppendContent("A".into()).apply(&mut msg);
        MessageUpdate::AppendContent("B".into()).apply(&mut msg);
        MessageUpdate::SetMode(Mode::Act).apply(&mut msg);
        assert_eq!(msg.content, "AB");
        assert_eq!(msg.mode, Some(Mode::Act));
    }
}
