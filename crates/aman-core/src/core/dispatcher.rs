//! Turns raw user input into local actions or streamed remote commands.
//!
//! Remote flow for one input:
//! 1. the input is appended as a user message before anything is sent
//! 2. a stream handle is opened and the request goes out with the history
//!    that preceded the input
//! 3. on a successful response an empty assistant message is appended as the
//!    stream target, and decoded events are applied to it in wire order
//! 4. every terminal path flushes the store and releases the handle
//!
//! Transport failures become a single `Error: ...` assistant message.
//! Cancellation is silent.

use std::fmt::Write as _;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::client::{CommandRequest, HistoryEntry, InferenceClient, TransportError};
use crate::core::controller::{StreamController, StreamHandle, StreamOutcome};
use crate::core::decoder::{EventDecoder, StreamError, StreamEvent};
use crate::core::models::ModelSelection;
use crate::core::session::{Message, MessageUpdate, Mode, short_id};
use crate::core::store::SharedStore;

/// Commands handled without contacting the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalCommand {
    NewSession,
    ListSessions,
}

impl LocalCommand {
    pub const ALL: [LocalCommand; 2] = [LocalCommand::NewSession, LocalCommand::ListSessions];

    pub fn as_str(self) -> &'static str {
        match self {
            LocalCommand::NewSession => "/new-session",
            LocalCommand::ListSessions => "/list-sessions",
        }
    }

    fn parse(input: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cmd| cmd.as_str() == input)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Local(LocalCommand),
    Remote { command: String },
}

/// Classifies trimmed, non-empty input.
///
/// Local commands match exactly. Other slash input uses its first
/// whitespace-delimited token as the command; plain text is routed to the
/// command of the session's current mode.
pub fn classify(input: &str, mode: Mode) -> Command {
    if let Some(local) = LocalCommand::parse(input) {
        return Command::Local(local);
    }
    let command = match input.split_whitespace().next() {
        Some(token) if token.starts_with('/') => token.to_string(),
        _ => mode.default_command(),
    };
    Command::Remote { command }
}

/// Result of one finished stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSummary {
    pub outcome: StreamOutcome,
    /// Lines skipped because they could not be decoded.
    pub warnings: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Blank input, or a session that no longer exists.
    Ignored,
    Local(LocalCommand),
    Remote(StreamSummary),
}

#[derive(Clone)]
pub struct Dispatcher {
    store: SharedStore,
    controller: Arc<StreamController>,
    client: InferenceClient,
    models: Arc<ModelSelection>,
}

impl Dispatcher {
    pub fn new(
        store: SharedStore,
        controller: Arc<StreamController>,
        client: InferenceClient,
        models: Arc<ModelSelection>,
    ) -> Self {
        Self {
            store,
            controller,
            client,
            models,
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn controller(&self) -> &Arc<StreamController> {
        &self.controller
    }

    pub fn models(&self) -> &Arc<ModelSelection> {
        &self.models
    }

    /// Handles one line of user input addressed to `session_id`.
    ///
    /// Sending a remote command to a session that is already streaming
    /// cancels the older stream first.
    pub async fn handle(&self, raw_input: &str, session_id: &str) -> DispatchOutcome {
        let input = raw_input.trim();
        if input.is_empty() {
            return DispatchOutcome::Ignored;
        }

        let mode = {
            let store = self.store.lock().await;
            match store.get(session_id) {
                Some(session) => session.mode,
                None => {
                    tracing::warn!(session_id = %session_id, "Input for unknown session ignored");
                    return DispatchOutcome::Ignored;
                }
            }
        };

        match classify(input, mode) {
            Command::Local(local) => {
                self.run_local(local, session_id).await;
                DispatchOutcome::Local(local)
            }
            Command::Remote { command } => {
                DispatchOutcome::Remote(self.run_remote(command, raw_input, session_id).await)
            }
        }
    }

    /// Cancels the active stream of `session_id`, if any.
    pub fn cancel(&self, session_id: &str) -> bool {
        self.controller.cancel(session_id)
    }

    async fn run_local(&self, command: LocalCommand, session_id: &str) {
        let mut store = self.store.lock().await;
        match command {
            LocalCommand::NewSession => {
                store.create();
            }
            LocalCommand::ListSessions => {
                let current = store.current_id();
                let mut listing = String::from("Sessions, most recent first:");
                for session in store.list_by_activity() {
                    let marker = if Some(session.id.as_str()) == current {
                        '*'
                    } else {
                        ' '
                    };
                    let _ = write!(
                        listing,
                        "\n{marker} {}  {}  ({}, {} messages)",
                        short_id(&session.id),
                        session.title,
                        session.mode,
                        session.messages.len()
                    );
                }
                store.append_message(session_id, Message::assistant(listing));
            }
        }
        tracing::debug!(session_id = %session_id, command = command.as_str(), "Local command handled");
    }

    async fn run_remote(&self, command: String, input: &str, session_id: &str) -> StreamSummary {
        let history: Vec<HistoryEntry> = {
            let mut store = self.store.lock().await;
            let history = store
                .get(session_id)
                .map(|s| s.messages.iter().map(HistoryEntry::from).collect())
                .unwrap_or_default();
            store.append_message(session_id, Message::user(input));
            history
        };

        let handle = self.controller.start(session_id);
        let request = CommandRequest {
            command,
            user_input: input.to_string(),
            session_id: session_id.to_string(),
            history,
            model: self.models.current(),
        };
        tracing::info!(
            session_id = %session_id,
            stream_id = %handle.id(),
            command = %request.command,
            model = %request.model,
            "Dispatching command"
        );

        let sent = tokio::select! {
            biased;
            () = handle.token().cancelled() => None,
            result = self.client.send_command(&request) => Some(result),
        };

        match sent {
            None => finish(&self.store, handle, StreamOutcome::Cancelled, 0).await,
            Some(Err(err)) => fail(&self.store, handle, &err, 0).await,
            Some(Ok(body)) => drive(&self.store, handle, body).await,
        }
    }
}

/// Applies a response body to the session owning `handle`.
pub(crate) async fn drive<S, E>(store: &SharedStore, handle: StreamHandle, body: S) -> StreamSummary
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<TransportError>,
{
    let session_id = handle.session_id().to_string();
    if handle.is_cancelled() {
        return finish(store, handle, StreamOutcome::Cancelled, 0).await;
    }

    let target = {
        let mut store = store.lock().await;
        let mode = store.get(&session_id).map(|s| s.mode).unwrap_or_default();
        store.append_message(&session_id, Message::stream_target(mode))
    };
    let Some(target) = target else {
        return finish(store, handle, StreamOutcome::Cancelled, 0).await;
    };
    handle.set_target(target);

    let mut events = EventDecoder::new(body);
    let mut warnings = 0;
    let outcome = loop {
        let next = tokio::select! {
            biased;
            () = handle.token().cancelled() => break StreamOutcome::Cancelled,
            next = events.next() => next,
        };
        if handle.is_cancelled() {
            break StreamOutcome::Cancelled;
        }

        match next {
            None => break StreamOutcome::Completed,
            Some(Ok(event)) => {
                if !apply_event(store, &session_id, target, event).await {
                    tracing::debug!(session_id = %session_id, "Session gone; abandoning stream");
                    break StreamOutcome::Cancelled;
                }
            }
            Some(Err(StreamError::Decode(err))) => {
                warnings += 1;
                tracing::warn!(
                    session_id = %session_id,
                    stream_id = %handle.id(),
                    line = %err.line,
                    reason = %err.reason,
                    "Skipping malformed event line"
                );
            }
            Some(Err(StreamError::Transport(err))) => {
                drop(events);
                return fail(store, handle, &err, warnings).await;
            }
        }
    };

    // Dropping the body aborts the connection.
    drop(events);
    finish(store, handle, outcome, warnings).await
}

/// Returns `false` once the target is no longer writable.
async fn apply_event(store: &SharedStore, session_id: &str, target: usize, event: StreamEvent) -> bool {
    let mut store = store.lock().await;
    match event {
        StreamEvent::Meta { mode } => {
            store.set_mode(session_id, mode);
            store.update_message(session_id, target, MessageUpdate::SetMode(mode))
        }
        StreamEvent::Chunk { content } => {
            store.update_message(session_id, target, MessageUpdate::AppendContent(content))
        }
    }
}

async fn fail(
    store: &SharedStore,
    handle: StreamHandle,
    err: &TransportError,
    warnings: usize,
) -> StreamSummary {
    tracing::error!(
        session_id = %handle.session_id(),
        stream_id = %handle.id(),
        kind = %err.kind,
        error = %err,
        "Stream failed"
    );
    store
        .lock()
        .await
        .append_message(handle.session_id(), Message::error(err));
    finish(store, handle, StreamOutcome::Failed, warnings).await
}

async fn finish(
    store: &SharedStore,
    handle: StreamHandle,
    outcome: StreamOutcome,
    warnings: usize,
) -> StreamSummary {
    store.lock().await.persist();
    tracing::info!(
        session_id = %handle.session_id(),
        stream_id = %handle.id(),
        outcome = outcome.as_str(),
        warnings,
        "Stream ended"
    );
    StreamSummary {
        outcome: handle.finish(outcome),
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::time::Duration;

    use futures_util::stream;
    use tokio::sync::mpsc;
    use wiremock::matchers::{any, body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::core::persistence::{KeyValueStore, MemoryStore, SESSIONS_KEY};
    use crate::core::session::{Role, Session};
    use crate::core::store::{SessionStore, StoreEvent};

    type ChannelBody = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

    struct Harness {
        dispatcher: Dispatcher,
        backend: Arc<MemoryStore>,
        session_id: String,
    }

    impl Harness {
        async fn new(base_url: &str) -> Self {
            let backend = Arc::new(MemoryStore::new());
            let store = SessionStore::load(backend.clone()).into_shared();
            let session_id = store.lock().await.current_id().unwrap().to_string();
            let models = Arc::new(ModelSelection::load(backend.clone(), "llama3"));
            let client = InferenceClient::new(base_url, None).unwrap();
            let dispatcher = Dispatcher::new(store, StreamController::new(), client, models);
            Self {
                dispatcher,
                backend,
                session_id,
            }
        }

        async fn session(&self) -> Session {
            self.dispatcher
                .store()
                .lock()
                .await
                .get(&self.session_id)
                .unwrap()
                .clone()
        }

        fn persisted(&self) -> Vec<Session> {
            serde_json::from_str(&self.backend.get(SESSIONS_KEY).unwrap().unwrap()).unwrap()
        }
    }

    fn ndjson(lines: &[&str]) -> ResponseTemplate {
        let mut body = lines.join("\n");
        body.push('\n');
        ResponseTemplate::new(200).set_body_raw(body, "application/x-ndjson")
    }

    fn channel_body() -> (mpsc::UnboundedSender<Result<Bytes, TransportError>>, ChannelBody) {
        let (tx, rx) = mpsc::unbounded_channel();
        let body = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        (tx, Box::pin(body))
    }

    fn chunk_line(text: &str) -> Result<Bytes, TransportError> {
        Ok(Bytes::from(format!(
            "{{\"type\":\"chunk\",\"content\":\"{text}\"}}\n"
        )))
    }

    async fn wait_for_update(rx: &mut tokio::sync::broadcast::Receiver<StoreEvent>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let StoreEvent::MessageUpdated { .. } = rx.recv().await.unwrap() {
                    return;
                }
            }
        })
        .await
        .unwrap();
    }

    async fn wait_until_streaming(dispatcher: &Dispatcher, session_id: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !dispatcher.controller().is_streaming(session_id) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_classify_commands() {
        assert_eq!(
            classify("/new-session", Mode::Align),
            Command::Local(LocalCommand::NewSession)
        );
        assert_eq!(
            classify("/list-sessions", Mode::Act),
            Command::Local(LocalCommand::ListSessions)
        );
        assert_eq!(
            classify("/model build a cache", Mode::Align),
            Command::Remote {
                command: "/model".into()
            }
        );
        assert_eq!(
            classify("hello there", Mode::Navigate),
            Command::Remote {
                command: "/navigate".into()
            }
        );
        assert_eq!(
            classify("/new-session now", Mode::Align),
            Command::Remote {
                command: "/new-session".into()
            }
        );
    }

    #[tokio::test]
    async fn test_chunks_concatenate_into_target() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/command"))
            .and(body_partial_json(serde_json::json!({
                "command": "/align",
                "user_input": "hi",
                "history": [],
                "model": "llama3"
            })))
            .respond_with(ndjson(&[
                r#"{"type":"chunk","content":"Hel"}"#,
                r#"{"type":"chunk","content":"lo, "}"#,
                r#"{"type":"chunk","content":"world"}"#,
            ]))
            .expect(1)
            .mount(&server)
            .await;
        let h = Harness::new(&server.uri()).await;

        let outcome = h.dispatcher.handle("hi", &h.session_id).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Remote(StreamSummary {
                outcome: StreamOutcome::Completed,
                warnings: 0
            })
        );
        let session = h.session().await;
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[1].content, "Hello, world");
        assert_eq!(session.messages[1].mode, Some(Mode::Align));
        assert_eq!(session.title, "hi");
        assert_eq!(h.persisted()[0].messages[1].content, "Hello, world");
        assert!(!h.dispatcher.controller().is_streaming(&h.session_id));
        assert_eq!(
            h.dispatcher.controller().last_outcome(&h.session_id),
            Some(StreamOutcome::Completed)
        );
    }

    #[tokio::test]
    async fn test_history_excludes_new_input() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/command"))
            .and(body_partial_json(serde_json::json!({
                "user_input": "second",
                "history": [
                    {"role": "user", "content": "first"},
                    {"role": "assistant", "content": "ok"}
                ]
            })))
            .respond_with(ndjson(&[r#"{"type":"chunk","content":"ok"}"#]))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/command"))
            .respond_with(ndjson(&[r#"{"type":"chunk","content":"ok"}"#]))
            .with_priority(10)
            .mount(&server)
            .await;
        let h = Harness::new(&server.uri()).await;

        h.dispatcher.handle("first", &h.session_id).await;
        h.dispatcher.handle("second", &h.session_id).await;

        assert_eq!(h.session().await.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_meta_sets_session_and_target_mode() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/command"))
            .and(body_partial_json(serde_json::json!({"command": "/model"})))
            .respond_with(ndjson(&[
                r#"{"type":"meta","mode":"MODEL"}"#,
                r#"{"type":"chunk","content":"planning"}"#,
            ]))
            .expect(1)
            .mount(&server)
            .await;
        let h = Harness::new(&server.uri()).await;

        h.dispatcher.handle("/model design it", &h.session_id).await;

        let session = h.session().await;
        assert_eq!(session.mode, Mode::Model);
        assert_eq!(session.messages[1].mode, Some(Mode::Model));
        assert_eq!(session.messages[1].content, "planning");
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped_with_one_warning() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/command"))
            .respond_with(ndjson(&[
                r#"{"type":"chunk","content":"A"}"#,
                "not json",
                r#"{"type":"chunk","content":"B"}"#,
            ]))
            .mount(&server)
            .await;
        let h = Harness::new(&server.uri()).await;

        let outcome = h.dispatcher.handle("go", &h.session_id).await;

        assert_eq!(
            outcome,
            DispatchOutcome::Remote(StreamSummary {
                outcome: StreamOutcome::Completed,
                warnings: 1
            })
        );
        assert_eq!(h.session().await.messages[1].content, "AB");
    }

    #[tokio::test]
    async fn test_http_error_appends_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/command"))
            .respond_with(ResponseTemplate::new(500).set_body_string(r#"{"detail":"boom"}"#))
            .mount(&server)
            .await;
        let h = Harness::new(&server.uri()).await;

        let outcome = h.dispatcher.handle("hi", &h.session_id).await;

        assert!(matches!(
            outcome,
            DispatchOutcome::Remote(StreamSummary {
                outcome: StreamOutcome::Failed,
                ..
            })
        ));
        let session = h.session().await;
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].role, Role::Assistant);
        assert_eq!(session.messages[1].content, "Error: HTTP 500: boom");
        assert!(!h.dispatcher.controller().is_streaming(&h.session_id));
    }

    #[tokio::test]
    async fn test_new_session_is_local() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let h = Harness::new(&server.uri()).await;
        let before = h.dispatcher.store().lock().await.len();

        let outcome = h.dispatcher.handle("  /new-session ", &h.session_id).await;

        assert_eq!(outcome, DispatchOutcome::Local(LocalCommand::NewSession));
        let store = h.dispatcher.store().lock().await;
        assert_eq!(store.len(), before + 1);
        assert_ne!(store.current_id(), Some(h.session_id.as_str()));
    }

    #[tokio::test]
    async fn test_list_sessions_appends_listing() {
        let server = MockServer::start().await;
        Mock::given(any())
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        let h = Harness::new(&server.uri()).await;

        h.dispatcher.handle("/list-sessions", &h.session_id).await;

        let session = h.session().await;
        assert_eq!(session.messages.len(), 1);
        let listing = &session.messages[0].content;
        assert!(listing.starts_with("Sessions, most recent first:"));
        assert!(listing.contains(&format!("* {}", short_id(&h.session_id))));
        assert_eq!(session.title, "New Chat");
    }

    #[tokio::test]
    async fn test_blank_input_is_ignored() {
        let h = Harness::new("http://127.0.0.1:9").await;
        assert_eq!(h.dispatcher.handle("   ", &h.session_id).await, DispatchOutcome::Ignored);
        assert_eq!(
            h.dispatcher.handle("hi", "missing").await,
            DispatchOutcome::Ignored
        );
        assert!(h.session().await.messages.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_keeps_partial_content() {
        let h = Harness::new("http://127.0.0.1:9").await;
        let store = h.dispatcher.store().clone();
        let mut feed = store.lock().await.subscribe();
        let (tx, body) = channel_body();

        let handle = h.dispatcher.controller().start(&h.session_id);
        let task = tokio::spawn({
            let store = store.clone();
            async move { drive(&store, handle, body).await }
        });

        tx.send(chunk_line("C")).unwrap();
        wait_for_update(&mut feed).await;
        assert!(h.dispatcher.cancel(&h.session_id));
        // Arrives after the cancel and must not land.
        let _ = tx.send(chunk_line("D"));

        let summary = task.await.unwrap();

        assert_eq!(summary.outcome, StreamOutcome::Cancelled);
        let session = h.session().await;
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].content, "C");
        assert_eq!(h.persisted()[0].messages[0].content, "C");
        assert!(!h.dispatcher.controller().is_streaming(&h.session_id));
    }

    #[tokio::test]
    async fn test_new_stream_supersedes_running_stream() {
        let h = Harness::new("http://127.0.0.1:9").await;
        let store = h.dispatcher.store().clone();
        let (_tx, body) = channel_body();

        let first = h.dispatcher.controller().start(&h.session_id);
        let task = tokio::spawn({
            let store = store.clone();
            async move { drive(&store, first, body).await }
        });
        tokio::task::yield_now().await;

        let second = h.dispatcher.controller().start(&h.session_id);
        let summary = task.await.unwrap();

        assert_eq!(summary.outcome, StreamOutcome::Cancelled);
        assert!(h.dispatcher.controller().is_streaming(&h.session_id));
        drop(second);
        assert!(!h.dispatcher.controller().is_streaming(&h.session_id));
    }

    #[tokio::test]
    async fn test_body_error_mid_stream_fails_after_partial_content() {
        let h = Harness::new("http://127.0.0.1:9").await;
        let store = h.dispatcher.store().clone();
        let (tx, body) = channel_body();

        tx.send(chunk_line("partial")).unwrap();
        tx.send(Err(TransportError::new(
            crate::client::TransportErrorKind::Body,
            "connection reset",
        )))
        .unwrap();

        let handle = h.dispatcher.controller().start(&h.session_id);
        let summary = drive(&store, handle, body).await;

        assert_eq!(summary.outcome, StreamOutcome::Failed);
        let session = h.session().await;
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].content, "partial");
        assert_eq!(session.messages[1].content, "Error: connection reset");
    }

    #[tokio::test]
    async fn test_cancel_while_request_pending() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/command"))
            .respond_with(
                ndjson(&[r#"{"type":"chunk","content":"late"}"#]).set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;
        let h = Harness::new(&server.uri()).await;

        let task = tokio::spawn({
            let dispatcher = h.dispatcher.clone();
            let session_id = h.session_id.clone();
            async move { dispatcher.handle("hi", &session_id).await }
        });
        wait_until_streaming(&h.dispatcher, &h.session_id).await;
        assert!(h.dispatcher.cancel(&h.session_id));

        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Remote(StreamSummary {
                outcome: StreamOutcome::Cancelled,
                warnings: 0
            })
        );
        let session = h.session().await;
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[0].content, "hi");
        assert_eq!(h.persisted()[0].messages.len(), 1);
        assert!(!h.dispatcher.controller().is_streaming(&h.session_id));
        assert_eq!(
            h.dispatcher.controller().last_outcome(&h.session_id),
            Some(StreamOutcome::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_second_command_supersedes_pending_one() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/command"))
            .and(body_partial_json(serde_json::json!({"user_input": "first"})))
            .respond_with(
                ndjson(&[r#"{"type":"chunk","content":"stale"}"#]).set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/command"))
            .respond_with(ndjson(&[r#"{"type":"chunk","content":"fresh"}"#]))
            .with_priority(10)
            .mount(&server)
            .await;
        let h = Harness::new(&server.uri()).await;

        let first = tokio::spawn({
            let dispatcher = h.dispatcher.clone();
            let session_id = h.session_id.clone();
            async move { dispatcher.handle("first", &session_id).await }
        });
        wait_until_streaming(&h.dispatcher, &h.session_id).await;

        let second = h.dispatcher.handle("second", &h.session_id).await;
        let first = tokio::time::timeout(Duration::from_secs(5), first)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            first,
            DispatchOutcome::Remote(StreamSummary {
                outcome: StreamOutcome::Cancelled,
                warnings: 0
            })
        );
        assert_eq!(
            second,
            DispatchOutcome::Remote(StreamSummary {
                outcome: StreamOutcome::Completed,
                warnings: 0
            })
        );
        let contents: Vec<String> = h
            .session()
            .await
            .messages
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, ["first", "second", "fresh"]);
        assert!(!h.dispatcher.controller().is_streaming(&h.session_id));
        assert_eq!(
            h.dispatcher.controller().last_outcome(&h.session_id),
            Some(StreamOutcome::Completed)
        );
    }
}
