//! Runtime execution modes.
//!
//! - `chat`: Line-oriented interactive chat on stdin/stdout

pub mod chat;
