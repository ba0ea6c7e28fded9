//! Scoped key-value store shared between agents.
//!
//! Three scopes: a session scope keyed by conversation, a workflow scope
//! keyed by workflow instance, and one global scope. Writes are
//! last-writer-wins per key; there is no ordering across keys.

use crate::domain_types::{SessionId, WorkflowId};
use bytes::Bytes;
use dashmap::DashMap;
use std::fmt;

/// The scope a memory entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryScope {
    /// Scoped to one conversation session.
    Session(SessionId),
    /// Scoped to one workflow instance.
    Workflow(WorkflowId),
    /// Visible to the whole process.
    Global,
}

impl fmt::Display for MemoryScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(id) => write!(f, "session:{id}"),
            Self::Workflow(id) => write!(f, "workflow:{id}"),
            Self::Global => write!(f, "global"),
        }
    }
}

/// In-process scoped KV store.
#[derive(Debug, Default)]
pub struct SharedMemory {
    entries: DashMap<(MemoryScope, String), Bytes>,
}

impl SharedMemory {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a value; the previous value for the key, if any, is
    /// replaced.
    pub fn write(&self, scope: MemoryScope, key: &str, value: Bytes) {
        self.entries.insert((scope, key.to_string()), value);
    }

    /// Reads the most recent committed write for the key.
    #[must_use]
    pub fn read(&self, scope: MemoryScope, key: &str) -> Option<Bytes> {
        self.entries
            .get(&(scope, key.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Deletes a key. Returns whether a value was present.
    pub fn delete(&self, scope: MemoryScope, key: &str) -> bool {
        self.entries.remove(&(scope, key.to_string())).is_some()
    }

    /// Lists `(key, value)` pairs in a scope whose keys start with the
    /// prefix, sorted by key.
    #[must_use]
    pub fn list(&self, scope: MemoryScope, prefix: &str) -> Vec<(String, Bytes)> {
        let mut matches: Vec<(String, Bytes)> = self
            .entries
            .iter()
            .filter(|entry| {
                let (entry_scope, key) = entry.key();
                *entry_scope == scope && key.starts_with(prefix)
            })
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        matches.sort_by(|a, b| a.0.cmp(&b.0));
        matches
    }

    /// Drops every entry in a scope. Used when a workflow completes.
    pub fn clear_scope(&self, scope: MemoryScope) {
        self.entries.retain(|(entry_scope, _), _| *entry_scope != scope);
    }
}
