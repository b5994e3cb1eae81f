//! Line-oriented interactive chat.
//!
//! Input is read from stdin one line at a time. Output is produced only by
//! `Renderer`, which follows the store change feed, so everything printed is
//! exactly what the store holds. Ctrl+C while a reply streams cancels it;
//! Ctrl+C at the prompt arms a second press to quit.

use std::io::{self, IsTerminal, Write};
use std::sync::Arc;

use aman_core::core::controller::StreamOutcome;
use aman_core::core::dispatcher::{DispatchOutcome, Dispatcher};
use aman_core::core::interrupt;
use aman_core::core::session::{Role, short_id};
use aman_core::core::store::{SharedStore, StoreEvent};
use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::Receiver;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

const HELP: &str = "\
Commands:
  /new-session         start a new session
  /list-sessions       list sessions in this chat
  /<command> <text>    send text with an explicit command (e.g. /act ...)
  :switch <id>         switch to a session by id or id prefix
  :model <id>          select the model for following requests
  :help                show this help
  :q                   quit
Ctrl+C cancels a streaming reply.";

#[derive(Debug, PartialEq, Eq)]
enum ReplInput<'a> {
    Quit,
    Help,
    Switch(&'a str),
    Model(&'a str),
    Unknown(&'a str),
    Send(&'a str),
}

impl<'a> ReplInput<'a> {
    fn parse(line: &'a str) -> Self {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix(':') else {
            return ReplInput::Send(line);
        };
        let (name, arg) = rest
            .split_once(char::is_whitespace)
            .map_or((rest, ""), |(name, arg)| (name, arg.trim()));
        match (name, arg) {
            ("q" | "quit" | "exit", _) => ReplInput::Quit,
            ("help", _) => ReplInput::Help,
            ("switch", id) if !id.is_empty() => ReplInput::Switch(id),
            ("model", id) if !id.is_empty() => ReplInput::Model(id),
            _ => ReplInput::Unknown(trimmed),
        }
    }
}

/// Prints store changes for the focused session.
///
/// Text is always read back from the store, never from event payloads. Each
/// event for the focused session prints the messages not seen yet plus the
/// unprinted tail of the open message, so a lagging feed loses nothing and a
/// late event prints nothing twice.
pub struct Renderer<W> {
    out: W,
    focus: String,
    /// Messages of the focused session already handled.
    seen: usize,
    /// Index and printed byte length of the message on the open line.
    open: Option<(usize, usize)>,
}

impl<W: Write> Renderer<W> {
    /// Follows `focus`, skipping its first `seen` messages.
    pub fn new(out: W, focus: impl Into<String>, seen: usize) -> Self {
        Self {
            out,
            focus: focus.into(),
            seen,
            open: None,
        }
    }

    pub async fn on_event(&mut self, store: &SharedStore, event: StoreEvent) -> io::Result<()> {
        match event {
            StoreEvent::MessageAppended { session_id, .. }
            | StoreEvent::MessageUpdated { session_id, .. }
                if session_id == self.focus =>
            {
                return self.sync(store).await;
            }
            StoreEvent::SessionCreated { session_id } => {
                self.close_line()?;
                writeln!(self.out, "Started session {}", short_id(&session_id))?;
                self.focus = session_id;
                self.seen = 0;
            }
            StoreEvent::SessionSelected { session_id } => {
                let (title, len) = store
                    .lock()
                    .await
                    .get(&session_id)
                    .map(|s| (s.title.clone(), s.messages.len()))
                    .unwrap_or_default();
                self.close_line()?;
                writeln!(self.out, "Switched to session {} ({title})", short_id(&session_id))?;
                self.focus = session_id;
                self.seen = len;
            }
            StoreEvent::Cleared => {
                self.close_line()?;
                writeln!(self.out, "History cleared")?;
            }
            _ => {}
        }
        self.out.flush()
    }

    /// Prints whatever the focused session holds that is not on screen yet.
    pub async fn sync(&mut self, store: &SharedStore) -> io::Result<()> {
        let store = store.lock().await;
        let Some(session) = store.get(&self.focus) else {
            return Ok(());
        };

        if let Some((index, printed)) = self.open {
            let tail = session
                .messages
                .get(index)
                .and_then(|m| m.content.get(printed..))
                .unwrap_or_default();
            if !tail.is_empty() {
                write!(self.out, "{tail}")?;
                self.open = Some((index, printed + tail.len()));
            }
        }

        for (index, message) in session.messages.iter().enumerate().skip(self.seen) {
            if message.role == Role::User {
                continue;
            }
            self.close_line()?;
            if let Some(mode) = message.mode {
                write!(self.out, "[{mode}] ")?;
            }
            write!(self.out, "{}", message.content)?;
            self.open = Some((index, message.content.len()));
        }
        self.seen = self.seen.max(session.messages.len());
        self.out.flush()
    }

    /// Ends a partially printed message line.
    pub fn close_line(&mut self) -> io::Result<()> {
        if self.open.take().is_some() {
            writeln!(self.out)?;
        }
        self.out.flush()
    }

    async fn on_recv(
        &mut self,
        store: &SharedStore,
        received: Result<StoreEvent, RecvError>,
    ) -> io::Result<()> {
        match received {
            Ok(event) => self.on_event(store, event).await,
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "Renderer fell behind the change feed; resyncing");
                self.sync(store).await
            }
            Err(RecvError::Closed) => Ok(()),
        }
    }

    /// Renders every event already queued on the feed.
    async fn drain(&mut self, store: &SharedStore, feed: &mut Receiver<StoreEvent>) -> io::Result<()> {
        loop {
            match feed.try_recv() {
                Ok(event) => self.on_event(store, event).await?,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Renderer fell behind the change feed; resyncing");
                    self.sync(store).await?;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return Ok(()),
            }
        }
    }
}

pub async fn run_repl(dispatcher: &Dispatcher) -> Result<()> {
    let interactive = io::stdin().is_terminal();
    let store = Arc::clone(dispatcher.store());
    let (mut feed, focus, title, seen) = {
        let guard = store.lock().await;
        let current = guard.current().context("no current session")?;
        (
            guard.subscribe(),
            current.id.clone(),
            current.title.clone(),
            current.messages.len(),
        )
    };
    let mut renderer = Renderer::new(io::stdout(), focus.clone(), seen);

    if interactive {
        println!("AMAN chat, session {} ({title})", short_id(&focus));
        println!("Model: {}. Type :help for commands, :q to quit.", dispatcher.models().current());
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        if interactive {
            print_prompt(&store).await?;
        }

        let line = tokio::select! {
            line = lines.next_line() => line.context("read input")?,
            () = interrupt::wait_for_interrupt(), if !interrupt::is_interrupted() => {
                eprintln!("\n(press Ctrl+C again to quit, or type :q)");
                continue;
            }
        };
        interrupt::reset();
        let Some(line) = line else { break };

        match ReplInput::parse(&line) {
            ReplInput::Quit => break,
            ReplInput::Help => println!("{HELP}"),
            ReplInput::Unknown(cmd) => eprintln!("Unknown command: {cmd} (try :help)"),
            ReplInput::Model(id) => match dispatcher.models().set(id) {
                Ok(()) => println!("Model set to {id}"),
                Err(err) => eprintln!("{err:#}"),
            },
            ReplInput::Switch(id) => {
                let mut guard = store.lock().await;
                let resolved = guard.resolve(id).map(|s| s.id.clone());
                match resolved {
                    Ok(session_id) => {
                        guard.select(&session_id);
                    }
                    Err(err) => eprintln!("{err:#}"),
                }
            }
            ReplInput::Send(text) => {
                let session_id = renderer.focus.clone();
                let outcome = run_turn(dispatcher, &mut renderer, &mut feed, text, &session_id).await?;
                report(&outcome);
            }
        }
        renderer.drain(&store, &mut feed).await?;
        renderer.close_line()?;
    }

    renderer.close_line()?;
    let cancelled = dispatcher.controller().cancel_all();
    tracing::debug!(cancelled, "Chat ended");
    Ok(())
}

/// Dispatches one input while rendering its effects as they happen.
async fn run_turn<W: Write>(
    dispatcher: &Dispatcher,
    renderer: &mut Renderer<W>,
    feed: &mut Receiver<StoreEvent>,
    input: &str,
    session_id: &str,
) -> Result<DispatchOutcome> {
    let store = dispatcher.store();
    let turn = dispatcher.handle(input, session_id);
    tokio::pin!(turn);

    let outcome = loop {
        tokio::select! {
            biased;
            received = feed.recv() => renderer.on_recv(store, received).await?,
            outcome = &mut turn => break outcome,
            () = interrupt::wait_for_interrupt() => {
                dispatcher.cancel(session_id);
                interrupt::reset();
            }
        }
    };

    renderer.drain(store, feed).await?;
    renderer.close_line()?;
    Ok(outcome)
}

fn report(outcome: &DispatchOutcome) {
    let DispatchOutcome::Remote(summary) = outcome else {
        return;
    };
    if summary.outcome == StreamOutcome::Cancelled {
        eprintln!("(cancelled)");
    }
    if summary.warnings > 0 {
        eprintln!("(skipped {} malformed line(s))", summary.warnings);
    }
}

async fn print_prompt(store: &SharedStore) -> io::Result<()> {
    let mode = store
        .lock()
        .await
        .current()
        .map(|s| s.mode)
        .unwrap_or_default();
    let mut out = io::stdout();
    write!(out, "{}> ", mode.as_str().to_lowercase())?;
    out.flush()
}
