//! Session command handlers.

use aman_core::config::Config;
use aman_core::core::session::{Role, Session, short_id};
use anyhow::{Context, Result};
use chrono::Local;

use super::open_store;

pub fn list(config: &Config) -> Result<()> {
    let store = open_store(config);
    let current = store.current_id();
    for session in store.list_by_activity() {
        let marker = if Some(session.id.as_str()) == current {
            '*'
        } else {
            ' '
        };
        println!(
            "{marker} {}  {}  {}  {} msgs  {}",
            short_id(&session.id),
            session.title,
            session.mode,
            session.messages.len(),
            session
                .last_activity
                .with_timezone(&Local)
                .format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

pub fn show(config: &Config, id: &str, json: bool) -> Result<()> {
    let store = open_store(config);
    let session = store.resolve(id)?;
    if json {
        let out = serde_json::to_string_pretty(session).context("serialize session")?;
        println!("{out}");
    } else {
        print!("{}", format_transcript(session));
    }
    Ok(())
}

pub fn delete(config: &Config, id: &str) -> Result<()> {
    let mut store = open_store(config);
    let session_id = store.resolve(id)?.id.clone();
    store.delete(&session_id);
    println!("Deleted session {}", short_id(&session_id));
    Ok(())
}

pub fn clear(config: &Config, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to delete ALL sessions without --yes");
    }
    let mut store = open_store(config);
    let count = store.len();
    store.clear_all();
    println!("Deleted {count} session(s)");
    Ok(())
}

fn format_transcript(session: &Session) -> String {
    let mut out = format!("# {} ({})\n", session.title, session.id);
    for message in &session.messages {
        let speaker = match (message.role, message.mode) {
            (Role::User, _) => "you".to_string(),
            (Role::Assistant, Some(mode)) => format!("aman [{mode}]"),
            (Role::Assistant, None) => "aman".to_string(),
        };
        out.push_str(&format!("\n{speaker}: {}\n", message.content));
    }
    out
}
