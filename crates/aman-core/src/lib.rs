//! Core AMAN library (sessions, streaming, service client, config).

pub mod client;
pub mod config;
pub mod core;
pub mod logging;
