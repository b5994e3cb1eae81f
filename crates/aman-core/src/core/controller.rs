//! Per-session stream lifecycle.
//!
//! Each session is `Idle` or `Streaming`. A stream ends in one of three
//! terminal outcomes and the session returns to `Idle`. Starting a stream on
//! a session that is already streaming cancels the older stream first, so at
//! most one stream per session is ever active.
//!
//! `StreamHandle` is the RAII side of an active stream. Dropping it releases
//! the session slot, which also covers early returns and panics in the task
//! that owns it.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Default)]
struct StreamSeq {
    next: u64,
}

impl StreamSeq {
    fn next_id(&mut self) -> StreamId {
        let id = StreamId(self.next);
        self.next = self.next.wrapping_add(1);
        id
    }
}

/// How a stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Cancelled,
    Failed,
}

impl StreamOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamOutcome::Completed => "completed",
            StreamOutcome::Cancelled => "cancelled",
            StreamOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Streaming,
}

#[derive(Debug)]
struct ActiveStream {
    id: StreamId,
    cancel: CancellationToken,
    target: Option<usize>,
}

#[derive(Debug, Default)]
struct Registry {
    seq: StreamSeq,
    active: HashMap<String, ActiveStream>,
    outcomes: HashMap<String, StreamOutcome>,
}

impl Registry {
    /// Releases the slot only if `id` still owns it.
    fn finish_if_active(&mut self, session_id: &str, id: StreamId, outcome: StreamOutcome) -> bool {
        let owns = self
            .active
            .get(session_id)
            .is_some_and(|active| active.id == id);
        if owns {
            self.active.remove(session_id);
            self.outcomes.insert(session_id.to_string(), outcome);
        }
        owns
    }
}

/// Tracks the active stream of every session.
#[derive(Debug, Default)]
pub struct StreamController {
    registry: Mutex<Registry>,
}

impl StreamController {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a new stream for `session_id`, cancelling any stream the
    /// session already had.
    pub fn start(self: &Arc<Self>, session_id: &str) -> StreamHandle {
        let cancel = CancellationToken::new();
        let mut registry = self.lock();
        let id = registry.seq.next_id();

        let previous = registry.active.insert(
            session_id.to_string(),
            ActiveStream {
                id,
                cancel: cancel.clone(),
                target: None,
            },
        );
        if let Some(previous) = previous {
            tracing::info!(
                session_id = %session_id,
                stream_id = %previous.id,
                "Superseding active stream"
            );
            previous.cancel.cancel();
        }
        drop(registry);

        tracing::debug!(session_id = %session_id, stream_id = %id, "Stream started");
        StreamHandle {
            controller: Arc::clone(self),
            session_id: session_id.to_string(),
            id,
            cancel,
            outcome: None,
        }
    }

    /// Signals cancellation to the active stream of `session_id`.
    ///
    /// Returns `false` when the session is idle. The slot is released by the
    /// stream's own task once it observes the signal.
    pub fn cancel(&self, session_id: &str) -> bool {
        let registry = self.lock();
        match registry.active.get(session_id) {
            Some(active) => {
                tracing::info!(session_id = %session_id, stream_id = %active.id, "Cancelling stream");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancels every active stream.
    pub fn cancel_all(&self) -> usize {
        let registry = self.lock();
        for active in registry.active.values() {
            active.cancel.cancel();
        }
        registry.active.len()
    }

    pub fn state(&self, session_id: &str) -> StreamState {
        if self.is_streaming(session_id) {
            StreamState::Streaming
        } else {
            StreamState::Idle
        }
    }

    pub fn is_streaming(&self, session_id: &str) -> bool {
        self.lock().active.contains_key(session_id)
    }

    /// Message index the active stream writes to, once it has one.
    pub fn target(&self, session_id: &str) -> Option<usize> {
        self.lock().active.get(session_id).and_then(|a| a.target)
    }

    /// Terminal outcome of the most recent stream that ended while still
    /// owning its session.
    pub fn last_outcome(&self, session_id: &str) -> Option<StreamOutcome> {
        self.lock().outcomes.get(session_id).copied()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ownership of one active stream.
#[derive(Debug)]
pub struct StreamHandle {
    controller: Arc<StreamController>,
    session_id: String,
    id: StreamId,
    cancel: CancellationToken,
    outcome: Option<StreamOutcome>,
}

impl StreamHandle {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Records the message index this stream writes to.
    pub fn set_target(&self, index: usize) {
        let mut registry = self.controller.lock();
        if let Some(active) = registry.active.get_mut(&self.session_id)
            && active.id == self.id
        {
            active.target = Some(index);
        }
    }

    /// Ends the stream with `outcome` and releases the session slot.
    pub fn finish(mut self, outcome: StreamOutcome) -> StreamOutcome {
        self.outcome = Some(outcome);
        outcome
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        let outcome = self.outcome.unwrap_or(if self.cancel.is_cancelled() {
            StreamOutcome::Cancelled
        } else {
            StreamOutcome::Failed
        });
        // Wakes anything still waiting on this token.
        self.cancel.cancel();

        let released = self
            .controller
            .lock()
            .finish_if_active(&self.session_id, self.id, outcome);
        tracing::debug!(
            session_id = %self.session_id,
            stream_id = %self.id,
            outcome = outcome.as_str(),
            released,
            "Stream finished"
        );
    }
}
