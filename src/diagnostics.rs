//! Restart-surviving diagnostic log for one instance
//!
//! Entries are stored under `log:<index>` with the index zero-padded so the
//! store's key order is the insertion order. The next free index lives under
//! `meta:index`. The two prefixes are disjoint, so the counter can never be
//! mistaken for an entry.

use crate::db::NamespacedStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

const COUNTER_KEY: &str = "meta:index";
const ENTRY_PREFIX: &str = "log:";

fn entry_key(index: u64) -> String {
    format!("{}{:020}", ENTRY_PREFIX, index)
}

/// One diagnostic record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only log backed by a [`NamespacedStore`]
pub struct DiagnosticLog {
    store: NamespacedStore,
    /// Serializes the read-counter / write-entry / write-counter sequence
    append_lock: Mutex<()>,
}

impl DiagnosticLog {
    pub fn new(store: NamespacedStore) -> Self {
        Self {
            store,
            append_lock: Mutex::new(()),
        }
    }

    /// Append a message, followed by each detail separated by a space.
    ///
    /// Returns once the entry and the advanced counter are durable.
    pub fn append(&self, message: &str, details: &[&dyn fmt::Display]) -> Result<LogEntry> {
        let mut text = message.to_string();
        for detail in details {
            text.push(' ');
            text.push_str(&detail.to_string());
        }

        let _guard = self.append_lock.lock();

        let index = self.next_index()?;
        let entry = LogEntry {
            index,
            message: text,
            timestamp: Utc::now(),
        };
        let value = serde_json::to_string(&entry)?;
        let next = (index + 1).to_string();

        self.store
            .put_many(&[(entry_key(index).as_str(), value.as_str()), (COUNTER_KEY, next.as_str())])?;
        self.store.sync()?;

        Ok(entry)
    }

    /// All entries in insertion order
    pub fn read_all(&self) -> Result<Vec<LogEntry>> {
        self.store
            .list(ENTRY_PREFIX)?
            .into_iter()
            .map(|(key, value)| {
                serde_json::from_str(&value)
                    .with_context(|| format!("Corrupt log entry {} in {}", key, self.store.namespace()))
            })
            .collect()
    }

    /// Delete every entry and reset the counter
    pub fn clear(&self) -> Result<usize> {
        let _guard = self.append_lock.lock();
        self.store.delete_all()
    }

    fn next_index(&self) -> Result<u64> {
        match self.store.get(COUNTER_KEY)? {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("Corrupt log counter {:?} in {}", raw, self.store.namespace())),
            None => Ok(0),
        }
    }
}
