//! Redis key naming for a queue.
//!
//! Every key a queue touches is derived here from the queue name and a
//! separator, so two queues with different names never share a key. The
//! name must not contain the separator, otherwise `a` + `deduplication::x`
//! and `a::deduplication` + `x` would spell the same key.

/// Default separator between key segments.
pub const DEFAULT_SEPARATOR: &str = "::";

use crate::error::{Error, Result};

const DEDUPLICATION: &str = "deduplication";
const PENDING: &str = "pending";
const PROCESSING: &str = "processing";
const COMPLETED: &str = "completed";
const FAILED: &str = "failed";

/// The set of keys belonging to one named queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    name: String,
    separator: String,
    pending: String,
    processing: String,
    completed: String,
    failed: String,
}

impl QueueKeys {
    /// Derive the keys for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty name or separator, or a name
    /// in which the separator occurs (including across the name's end).
    pub fn new(name: impl Into<String>, separator: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let separator = separator.into();
        if name.is_empty() {
            return Err(Error::Config("queue name must not be empty".into()));
        }
        if separator.is_empty() {
            return Err(Error::Config("key separator must not be empty".into()));
        }
        // The first separator in every key must be the one right after the name.
        if format!("{name}{separator}").find(&separator) != Some(name.len()) {
            return Err(Error::Config(format!(
                "queue name {name:?} must not contain the key separator {separator:?}"
            )));
        }
        let join = |segment: &str| format!("{name}{separator}{segment}");

        Ok(Self {
            pending: join(PENDING),
            processing: join(PROCESSING),
            completed: join(COMPLETED),
            failed: join(FAILED),
            name,
            separator,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Marker key recording that a message with `dedup_key` was accepted.
    pub fn deduplication(&self, dedup_key: &str) -> String {
        let sep = &self.separator;
        format!("{}{sep}{DEDUPLICATION}{sep}{dedup_key}", self.name)
    }

    /// List of messages waiting for a worker.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// List of messages leased by a worker.
    pub fn processing(&self) -> &str {
        &self.processing
    }

    /// Log of successfully processed messages (when enabled).
    pub fn completed(&self) -> &str {
        &self.completed
    }

    /// Log of messages whose handler failed (when enabled).
    pub fn failed(&self) -> &str {
        &self.failed
    }
}
