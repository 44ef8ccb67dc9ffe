//! Live subscribers attached to a change feed.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::keys::{Fingerprint, SessionId, SubscriberId};
use crate::application::delivery::Delivery;
use crate::domain::document::Document;

/// One subscription: where its changes go and which cache entry backs it.
#[derive(Clone)]
pub struct Subscriber {
    pub id: SubscriberId,
    pub session: SessionId,
    pub fingerprint: Fingerprint,
    /// Full filter of the subscription, before any identity stripping.
    pub filter: Document,
    pub delivery: Arc<dyn Delivery>,
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Shared, mutable set of subscribers of one feed.
#[derive(Debug, Clone, Default)]
pub struct Subscribers {
    inner: Arc<DashMap<SubscriberId, Subscriber>>,
}

impl Subscribers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber unless one with the same id is already present.
    pub fn insert(&self, subscriber: Subscriber) -> bool {
        match self.inner.entry(subscriber.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(subscriber);
                true
            }
        }
    }

    pub fn remove(&self, id: &SubscriberId) -> Option<Subscriber> {
        self.inner.remove(id).map(|(_, subscriber)| subscriber)
    }

    pub fn get(&self, id: &SubscriberId) -> Option<Subscriber> {
        self.inner.get(id).map(|subscriber| subscriber.value().clone())
    }

    pub fn contains(&self, id: &SubscriberId) -> bool {
        self.inner.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Whether any subscriber belongs to `session`.
    pub fn has_session(&self, session: &SessionId) -> bool {
        self.inner
            .iter()
            .any(|subscriber| &subscriber.session == session)
    }

    /// Current subscribers, ordered by id.
    pub fn snapshot(&self) -> Vec<Subscriber> {
        let mut subscribers: Vec<Subscriber> = self
            .inner
            .iter()
            .map(|subscriber| subscriber.value().clone())
            .collect();
        subscribers.sort_by(|a, b| a.id.cmp(&b.id));
        subscribers
    }

    pub fn for_fingerprint(&self, fingerprint: &Fingerprint) -> Vec<Subscriber> {
        self.snapshot()
            .into_iter()
            .filter(|subscriber| &subscriber.fingerprint == fingerprint)
            .collect()
    }
}

/// Distinct cache keys among `subscribers`, in first-seen order.
pub fn fingerprints_of(subscribers: &[Subscriber]) -> Vec<Fingerprint> {
    let mut seen = Vec::new();
    for subscriber in subscribers {
        if !seen.contains(&subscriber.fingerprint) {
            seen.push(subscriber.fingerprint.clone());
        }
    }
    seen
}
