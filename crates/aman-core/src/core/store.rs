//! Session store: the single owner of all session and message data.
//!
//! Mutations go through the methods below, which persist to the durable
//! backend and publish a `StoreEvent` on a broadcast change feed so that a
//! presentation layer can follow along without holding references into the
//! store.
//!
//! Persistence runs on create, delete, append and clear. In-place updates of
//! a streaming message are not persisted individually; the dispatcher calls
//! `save` when the stream reaches a terminal state.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{Mutex, broadcast};

use crate::core::persistence::{KeyValueStore, SESSIONS_KEY};
use crate::core::session::{Message, MessageUpdate, Mode, Role, Session, derive_title};

const CHANGE_FEED_CAPACITY: usize = 256;

/// Store shared between the dispatcher tasks and the renderer.
///
/// Each lock scope touches exactly one session, which serializes mutations
/// per session while streams for different sessions proceed independently.
pub type SharedStore = Arc<Mutex<SessionStore>>;

/// Change notifications published after every mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    SessionCreated {
        session_id: String,
    },
    SessionSelected {
        session_id: String,
    },
    SessionDeleted {
        session_id: String,
    },
    MessageAppended {
        session_id: String,
        index: usize,
    },
    MessageUpdated {
        session_id: String,
        index: usize,
        update: MessageUpdate,
    },
    ModeChanged {
        session_id: String,
        mode: Mode,
    },
    Cleared,
}

pub struct SessionStore {
    sessions: Vec<Session>,
    current: Option<String>,
    backend: Arc<dyn KeyValueStore>,
    events: broadcast::Sender<StoreEvent>,
}

impl SessionStore {
    /// Restores the session set from `backend`.
    ///
    /// The most recently active session becomes current. A missing, empty or
    /// unreadable entry falls back to a single fresh session.
    pub fn load(backend: Arc<dyn KeyValueStore>) -> Self {
        let (events, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let mut store = Self {
            sessions: Vec::new(),
            current: None,
            backend,
            events,
        };

        match store.read_sessions() {
            Ok(sessions) => {
                for session in sessions {
                    if store.get(&session.id).is_some() {
                        tracing::warn!(session_id = %session.id, "Dropping duplicate session on load");
                        continue;
                    }
                    store.sessions.push(session);
                }
            }
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "Failed to load sessions; starting fresh");
            }
        }

        if let Some(id) = store.most_recent().map(|s| s.id.clone()) {
            tracing::debug!(sessions = store.sessions.len(), current = %id, "Sessions loaded");
            store.current = Some(id);
        } else {
            store.create();
        }

        store
    }

    pub fn into_shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    /// Subscribes to the change feed.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Sessions in store order (newest created first).
    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// Looks a session up by full id or unique id prefix.
    ///
    /// # Errors
    /// Returns an error when nothing matches or the prefix is ambiguous.
    pub fn resolve(&self, id_or_prefix: &str) -> Result<&Session> {
        if let Some(session) = self.get(id_or_prefix) {
            return Ok(session);
        }

        let matches: Vec<&Session> = self
            .sessions
            .iter()
            .filter(|s| s.id.starts_with(id_or_prefix))
            .collect();
        match matches.as_slice() {
            [session] => Ok(session),
            [] => anyhow::bail!("Session '{id_or_prefix}' not found"),
            _ => anyhow::bail!(
                "Session prefix '{id_or_prefix}' is ambiguous ({} matches)",
                matches.len()
            ),
        }
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current(&self) -> Option<&Session> {
        self.current.as_deref().and_then(|id| self.get(id))
    }

    /// Sessions sorted by last activity, most recent first.
    pub fn list_by_activity(&self) -> Vec<&Session> {
        let mut sorted: Vec<&Session> = self.sessions.iter().collect();
        sorted.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sorted
    }

    /// Creates a new session, makes it current and returns its id.
    pub fn create(&mut self) -> String {
        let session = Session::new();
        let id = session.id.clone();
        self.sessions.insert(0, session);
        self.current = Some(id.clone());

        tracing::info!(session_id = %id, "Session created");
        self.persist();
        self.notify(StoreEvent::SessionCreated {
            session_id: id.clone(),
        });
        id
    }

    /// Makes `id` current. Unknown ids are ignored.
    pub fn select(&mut self, id: &str) -> bool {
        if self.get(id).is_none() {
            tracing::debug!(session_id = %id, "Ignoring select of unknown session");
            return false;
        }
        self.current = Some(id.to_string());
        self.notify(StoreEvent::SessionSelected {
            session_id: id.to_string(),
        });
        true
    }

    /// Removes a session.
    ///
    /// When the removed session was current, the most recently active
    /// remaining session is selected, or a fresh one is created if none are
    /// left. Persists before returning.
    pub fn delete(&mut self, id: &str) -> bool {
        let Some(position) = self.sessions.iter().position(|s| s.id == id) else {
            tracing::warn!(session_id = %id, "Delete of unknown session ignored");
            return false;
        };

        self.sessions.remove(position);
        tracing::info!(session_id = %id, "Session deleted");
        self.notify(StoreEvent::SessionDeleted {
            session_id: id.to_string(),
        });

        if self.current.as_deref() == Some(id) {
            self.current = None;
            if let Some(next) = self.most_recent().map(|s| s.id.clone()) {
                self.select(&next);
            } else {
                // create() persists the new set
                self.create();
                return true;
            }
        }

        self.persist();
        true
    }

    /// Appends a message and returns its index.
    ///
    /// The first user message of a session fixes the session title.
    pub fn append_message(&mut self, session_id: &str, message: Message) -> Option<usize> {
        let Some(session) = self.session_mut(session_id) else {
            tracing::warn!(session_id = %session_id, "Append to unknown session ignored");
            return None;
        };

        if message.role == Role::User && !session.has_user_message() {
            session.title = derive_title(&message.content);
        }
        session.messages.push(message);
        session.last_activity = Utc::now();
        let index = session.messages.len() - 1;

        self.persist();
        self.notify(StoreEvent::MessageAppended {
            session_id: session_id.to_string(),
            index,
        });
        Some(index)
    }

    /// Applies `update` to the trailing message of a session.
    pub fn update_last_message(&mut self, session_id: &str, update: MessageUpdate) -> bool {
        let last = self
            .get(session_id)
            .and_then(|s| s.messages.len().checked_sub(1));
        let Some(index) = last else {
            tracing::warn!(session_id = %session_id, "No message to update");
            return false;
        };
        self.update_message(session_id, index, update)
    }

    /// Applies `update` to the assistant message at `index`.
    ///
    /// User messages are immutable; updates addressed to them, to missing
    /// indexes or to unknown sessions are ignored with a warning.
    pub fn update_message(&mut self, session_id: &str, index: usize, update: MessageUpdate) -> bool {
        let Some(session) = self.session_mut(session_id) else {
            tracing::warn!(session_id = %session_id, "Update of unknown session ignored");
            return false;
        };
        let Some(message) = session.messages.get_mut(index) else {
            tracing::warn!(session_id = %session_id, index, "Update of unknown message ignored");
            return false;
        };
        if message.role == Role::User {
            tracing::warn!(session_id = %session_id, index, "Refusing to mutate a user message");
            return false;
        }

        update.apply(message);
        self.notify(StoreEvent::MessageUpdated {
            session_id: session_id.to_string(),
            index,
            update,
        });
        true
    }

    /// Updates the operational mode of a session.
    pub fn set_mode(&mut self, session_id: &str, mode: Mode) -> bool {
        let Some(session) = self.session_mut(session_id) else {
            tracing::warn!(session_id = %session_id, "Mode change for unknown session ignored");
            return false;
        };
        session.mode = mode;
        self.notify(StoreEvent::ModeChanged {
            session_id: session_id.to_string(),
            mode,
        });
        true
    }

    /// Drops every session and starts over with one fresh session.
    pub fn clear_all(&mut self) {
        self.sessions.clear();
        self.current = None;
        if let Err(err) = self.backend.remove(SESSIONS_KEY) {
            tracing::warn!(error = %format!("{err:#}"), "Failed to remove stored sessions");
        }
        tracing::info!("Session history cleared");
        self.notify(StoreEvent::Cleared);
        self.create();
    }

    /// Writes the full session set to the backend.
    ///
    /// # Errors
    /// Returns an error if serialization or the backend write fails.
    pub fn save(&self) -> Result<()> {
        let json = serde_json::to_string(&self.sessions).context("Failed to serialize sessions")?;
        self.backend
            .put(SESSIONS_KEY, &json)
            .context("Failed to write sessions")
    }

    /// Saves and logs failures; the in-memory state stays authoritative.
    pub(crate) fn persist(&self) {
        if let Err(err) = self.save() {
            tracing::error!(error = %format!("{err:#}"), "Failed to persist sessions");
        }
    }

    fn read_sessions(&self) -> Result<Vec<Session>> {
        let Some(json) = self.backend.get(SESSIONS_KEY)? else {
            return Ok(Vec::new());
        };
        serde_json::from_str(&json).context("Stored sessions are corrupt")
    }

    /// Latest activity wins; ties go to the session earlier in store order.
    fn most_recent(&self) -> Option<&Session> {
        self.sessions.iter().rev().max_by_key(|s| s.last_activity)
    }

    fn session_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.id == id)
    }

    fn notify(&self, event: StoreEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
