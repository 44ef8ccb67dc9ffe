//! Document pin registry.
//!
//! Tracks which cache entries hold each cached document. A document stays in
//! the shared table while at least one entry pins it.

use std::collections::{HashMap, HashSet};

use super::keys::EntryId;
use crate::domain::document::DocId;

/// Tracks (collection, document) → pinning entries.
#[derive(Debug, Default)]
pub struct PinRegistry {
    pins: HashMap<String, HashMap<DocId, HashSet<EntryId>>>,
}

impl PinRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `entry` holds the document. Pinning twice is a no-op.
    pub fn pin(&mut self, collection: &str, id: &DocId, entry: EntryId) {
        self.pins
            .entry(collection.to_string())
            .or_default()
            .entry(id.clone())
            .or_default()
            .insert(entry);
    }

    /// Release one entry's hold on the document.
    ///
    /// Returns true when no entry pins the document anymore.
    pub fn unpin(&mut self, collection: &str, id: &DocId, entry: EntryId) -> bool {
        let Some(documents) = self.pins.get_mut(collection) else {
            return true;
        };
        let Some(entries) = documents.get_mut(id) else {
            return true;
        };

        entries.remove(&entry);
        if !entries.is_empty() {
            return false;
        }
        documents.remove(id);
        if documents.is_empty() {
            self.pins.remove(collection);
        }
        true
    }

    /// Number of entries pinning the document.
    pub fn pin_count(&self, collection: &str, id: &DocId) -> usize {
        self.pins
            .get(collection)
            .and_then(|documents| documents.get(id))
            .map_or(0, HashSet::len)
    }

    /// Clear all pins.
    pub fn clear(&mut self) {
        self.pins.clear();
    }

    /// Get the number of pinned documents.
    pub fn document_count(&self) -> usize {
        self.pins.values().map(HashMap::len).sum()
    }
}
