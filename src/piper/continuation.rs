//! Continuations of nested deferrals.
//!
//! When a handler running on the worker asks to finish later, the call it was
//! serving is parked here under the handler's fresh inner tag. The inner
//! tag's completion later takes the entry out and finishes the original call.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::tag::{Tag, TagId};
use crate::protocol::CallMessage;

/// The original call a nested deferral stands in for.
#[derive(Debug)]
pub struct ContinuationEntry {
    /// The request the framework is waiting to answer.
    pub request: CallMessage,
    /// Ticket of that request.
    pub tag: Tag,
}

/// Inner tag -> original (request, tag).
#[derive(Debug, Default)]
pub struct ContinuationTable {
    entries: Mutex<HashMap<TagId, ContinuationEntry>>,
}

impl ContinuationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `entry` under `inner`.
    ///
    /// Returns the entry previously parked under the same id, which would
    /// mean an inner tag was registered twice.
    pub fn insert(&self, inner: TagId, entry: ContinuationEntry) -> Option<ContinuationEntry> {
        self.entries.lock().insert(inner, entry)
    }

    /// Remove and return the entry for `inner`. Each entry is taken once.
    pub fn take(&self, inner: TagId) -> Option<ContinuationEntry> {
        self.entries.lock().remove(&inner)
    }

    pub fn contains(&self, inner: TagId) -> bool {
        self.entries.lock().contains_key(&inner)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piper::tag::TagArena;
    use bytes::Bytes;

    #[test]
    fn test_take_once() {
        let arena = TagArena::new();
        let table = ContinuationTable::new();
        let inner = arena.mint();
        let original = arena.mint();
        let original_id = original.id();

        table.insert(
            inner.id(),
            ContinuationEntry {
                request: CallMessage::new("Slow", Bytes::new()),
                tag: original,
            },
        );
        assert!(table.contains(inner.id()));

        let entry = table.take(inner.id()).unwrap();
        assert_eq!(entry.tag.id(), original_id);
        assert_eq!(entry.request.member(), "Slow");
        assert!(table.take(inner.id()).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_entry_keeps_original_tag_alive() {
        let arena = TagArena::new();
        let table = ContinuationTable::new();
        let inner = arena.mint();
        let original = arena.mint();
        let original_id = original.id();

        table.insert(
            inner.id(),
            ContinuationEntry {
                request: CallMessage::new("Slow", Bytes::new()),
                tag: original,
            },
        );
        assert!(arena.contains(original_id));

        drop(table.take(inner.id()));
        assert!(!arena.contains(original_id));
    }
}
