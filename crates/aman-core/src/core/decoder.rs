//! Newline-delimited JSON decoder for command response streams.
//!
//! The inference service answers a command with a chunked body where every
//! line is one JSON object:
//!
//! ```text
//! {"type":"meta","mode":"MODEL"}
//! {"type":"chunk","content":"Hello"}
//! {"type":"chunk","content":", world"}
//! ```
//!
//! Network deliveries do not respect line boundaries, so bytes are buffered
//! until a full line is available. A malformed line becomes a recoverable
//! `StreamError::Decode` item; the stream keeps going afterwards.

use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use serde::Deserialize;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder};

use crate::client::TransportError;
use crate::core::session::Mode;

/// One decoded application event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The service switched the session mode.
    Meta { mode: Mode },
    /// Text to append to the streaming assistant message.
    Chunk { content: String },
}

/// A single line that could not be turned into an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    /// The offending line, lossily decoded for diagnostics.
    pub line: String,
    pub reason: String,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Malformed event line ({}): {}", self.reason, self.line)
    }
}

impl std::error::Error for DecodeError {}

/// Items yielded next to events.
#[derive(Debug)]
pub enum StreamError {
    /// One bad line; decoding continues.
    Decode(DecodeError),
    /// The transport failed; the stream is over.
    Transport(TransportError),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Decode(err) => err.fmt(f),
            StreamError::Transport(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for StreamError {}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Meta {
        #[serde(default)]
        mode: Option<Mode>,
    },
    Chunk {
        content: String,
    },
}

/// Parses one complete line.
///
/// Returns `Ok(None)` for blank lines and for `meta` lines without a mode.
///
/// # Errors
/// Returns a `DecodeError` for invalid UTF-8, invalid JSON, an unknown
/// `type` or an unknown mode value.
pub fn parse_line(raw: &[u8]) -> Result<Option<StreamEvent>, DecodeError> {
    let line = std::str::from_utf8(raw).map_err(|err| DecodeError {
        line: String::from_utf8_lossy(raw).into_owned(),
        reason: format!("invalid UTF-8: {err}"),
    })?;
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let event: WireEvent = serde_json::from_str(line).map_err(|err| DecodeError {
        line: line.to_string(),
        reason: err.to_string(),
    })?;

    Ok(match event {
        WireEvent::Meta { mode } => mode.map(|mode| StreamEvent::Meta { mode }),
        WireEvent::Chunk { content } => Some(StreamEvent::Chunk { content }),
    })
}

/// Longest accepted line. Anything longer is reported once and skipped up to
/// the next newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

const PREVIEW_BYTES: usize = 80;

/// Accumulates bytes and hands out complete lines.
///
/// Lines are framed on raw `\n` bytes before any UTF-8 decoding, so a
/// multi-byte character split across two deliveries is reassembled intact.
/// The codec keeps its scan offset between pushes; a long line arriving in
/// small pieces is scanned once.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    codec: AnyDelimiterCodec,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            codec: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), max_length),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<Result<Bytes, DecodeError>> {
        let decoded = self.codec.decode(&mut self.buf);
        self.frame(decoded)
    }

    /// Drains whatever is left once the transport has ended.
    pub fn finish(&mut self) -> Option<Result<Bytes, DecodeError>> {
        let decoded = self.codec.decode_eof(&mut self.buf);
        self.frame(decoded)
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }

    fn frame(
        &self,
        decoded: Result<Option<Bytes>, AnyDelimiterCodecError>,
    ) -> Option<Result<Bytes, DecodeError>> {
        match decoded {
            Ok(line) => line.map(|mut line| {
                if line.ends_with(b"\r") {
                    line.truncate(line.len() - 1);
                }
                Ok(line)
            }),
            // The overlong line is still buffered; the codec drops it on the next call.
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                let preview = &self.buf[..self.buf.len().min(PREVIEW_BYTES)];
                Some(Err(DecodeError {
                    line: String::from_utf8_lossy(preview).into_owned(),
                    reason: format!("line longer than {} bytes", self.codec.max_length()),
                }))
            }
            Err(err) => Some(Err(DecodeError {
                line: String::new(),
                reason: err.to_string(),
            })),
        }
    }
}

/// Decodes a byte stream into `StreamEvent`s.
///
/// The decoder is lazy: it polls the inner stream only when the caller asks
/// for the next item and nothing is buffered. After the inner stream ends or
/// fails it yields `None` forever.
pub struct EventDecoder<S> {
    inner: S,
    lines: LineBuffer,
    pending: VecDeque<Result<StreamEvent, StreamError>>,
    done: bool,
}

impl<S> EventDecoder<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            lines: LineBuffer::new(),
            pending: VecDeque::new(),
            done: false,
        }
    }

    fn queue_line(&mut self, framed: Result<Bytes, DecodeError>) {
        match framed.and_then(|raw| parse_line(&raw)) {
            Ok(Some(event)) => self.pending.push_back(Ok(event)),
            Ok(None) => {}
            Err(err) => self.pending.push_back(Err(StreamError::Decode(err))),
        }
    }

    fn drain_complete_lines(&mut self) {
        while let Some(framed) = self.lines.next_line() {
            self.queue_line(framed);
        }
    }
}

impl<S, E> Stream for EventDecoder<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Into<TransportError>,
{
    type Item = Result<StreamEvent, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    self.lines.push(&bytes);
                    self.drain_complete_lines();
                }
                Poll::Ready(Some(Err(err))) => {
                    self.done = true;
                    return Poll::Ready(Some(Err(StreamError::Transport(err.into()))));
                }
                Poll::Ready(None) => {
                    self.done = true;
                    while let Some(framed) = self.lines.finish() {
                        self.queue_line(framed);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
