//! Core module: UI-agnostic domain and runtime.
//!
//! This module contains:
//! - `session`: Session, message and mode types
//! - `persistence`: Durable keyed storage
//! - `store`: Session store and its change feed
//! - `decoder`: NDJSON event decoding of command responses
//! - `controller`: Per-session stream lifecycle and cancellation
//! - `dispatcher`: Local/remote command handling
//! - `models`: Persisted model selection
//! - `interrupt`: Ctrl+C handling

pub mod controller;
pub mod decoder;
pub mod dispatcher;
pub mod interrupt;
pub mod models;
pub mod persistence;
pub mod session;
pub mod store;
