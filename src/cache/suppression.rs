//! Writer suppression.
//!
//! A session that writes a document has already applied the change locally.
//! The change-feed echo of that write must not be delivered back to it, so the
//! write path records (document, session) here and the multiplexer skips
//! matching subscribers while the record lives.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use super::keys::{FeedKey, SessionId};
use crate::domain::document::DocId;

#[derive(Debug)]
struct SuppressionRecord {
    sessions: HashSet<SessionId>,
    /// Feeds that already dispatched the suppressed change.
    dispatched: HashSet<FeedKey>,
    registered_at: Instant,
}

impl SuppressionRecord {
    fn new(now: Instant) -> Self {
        Self {
            sessions: HashSet::new(),
            dispatched: HashSet::new(),
            registered_at: now,
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.registered_at) >= ttl
    }
}

/// Short-lived (document → writing sessions) records.
///
/// Records expire `ttl` after the first session registered, whether or not the
/// corresponding change was ever dispatched.
#[derive(Debug, Clone)]
pub struct SuppressionWindow {
    ttl: Duration,
    records: Arc<DashMap<DocId, SuppressionRecord>>,
}

impl SuppressionWindow {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            records: Arc::new(DashMap::new()),
        }
    }

    pub fn register(&self, id: DocId, session: SessionId) {
        let now = Instant::now();
        let mut record = self
            .records
            .entry(id)
            .or_insert_with(|| SuppressionRecord::new(now));
        if record.is_expired(now, self.ttl) {
            *record = SuppressionRecord::new(now);
        }
        record.sessions.insert(session);
    }

    /// Sessions whose changes to `id` are currently suppressed.
    pub fn sessions_for(&self, id: &DocId) -> HashSet<SessionId> {
        let now = Instant::now();
        self.records
            .remove_if(id, |_, record| record.is_expired(now, self.ttl));
        self.records
            .get(id)
            .map(|record| record.sessions.clone())
            .unwrap_or_default()
    }

    pub fn is_suppressed(&self, id: &DocId, session: &SessionId) -> bool {
        self.sessions_for(id).contains(session)
    }

    /// Note that `feed` dispatched the change to `id`. Returns every feed that
    /// has done so while the record lives.
    pub fn mark_dispatched(&self, id: &DocId, feed: &FeedKey) -> HashSet<FeedKey> {
        match self.records.get_mut(id) {
            Some(mut record) => {
                record.dispatched.insert(feed.clone());
                record.dispatched.clone()
            }
            None => HashSet::new(),
        }
    }

    /// Forget every session recorded for `id`.
    pub fn release(&self, id: &DocId) -> bool {
        self.records.remove(id).is_some()
    }

    /// Forget one session's record for `id`.
    pub fn release_session(&self, id: &DocId, session: &SessionId) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.sessions.remove(session);
        }
        self.records.remove_if(id, |_, record| record.sessions.is_empty());
    }

    /// Drop expired records. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.records.len();
        self.records
            .retain(|_, record| !record.is_expired(now, self.ttl));
        before.saturating_sub(self.records.len())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
