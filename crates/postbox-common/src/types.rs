//! Common types for Postbox

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Unique identifier for accounts
pub type AccountId = Uuid;

/// Unique identifier for mailboxes
pub type MailboxId = Uuid;

/// Unique identifier for stored messages
pub type MessageId = Uuid;

/// Unique identifier for folders
pub type FolderId = Uuid;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Message flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageFlags {
    pub unread: bool,
    pub flagged: bool,
    pub answered: bool,
    pub draft: bool,
}

impl Default for MessageFlags {
    fn default() -> Self {
        Self {
            unread: true,
            flagged: false,
            answered: false,
            draft: false,
        }
    }
}

impl MessageFlags {
    /// Parse a flag string such as `"uf"`.
    ///
    /// Characters: `u` unread, `f` flagged, `r` answered, `d` draft.
    /// Unknown characters are ignored. An empty string yields no flags.
    pub fn parse(s: &str) -> Self {
        let mut flags = Self {
            unread: false,
            ..Self::default()
        };
        for c in s.chars() {
            match c.to_ascii_lowercase() {
                'u' => flags.unread = true,
                'f' => flags.flagged = true,
                'r' => flags.answered = true,
                'd' => flags.draft = true,
                _ => {}
            }
        }
        flags
    }
}

/// Handle on a piece of configuration that can be swapped at runtime.
///
/// Readers call [`LiveConfig::get`] at use time and always see the latest
/// value.
#[derive(Debug)]
pub struct LiveConfig<T> {
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for LiveConfig<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone> LiveConfig<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(RwLock::new(value)),
        }
    }

    /// Snapshot of the current value
    pub fn get(&self) -> T {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replace the current value
    pub fn set(&self, value: T) {
        match self.inner.write() {
            Ok(mut guard) => *guard = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
    }
}

/// Log a fatal condition and abort the process.
pub fn halt(message: &str) -> ! {
    tracing::error!(reason = %message, "fatal condition, halting");
    eprintln!("fatal: {}", message);
    std::process::abort()
}
