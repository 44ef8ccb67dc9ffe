//! Delivery sink that records what a subscriber was sent.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::application::delivery::{Delivery, DeliveryError};
use crate::cache::lock::mutex_lock;
use crate::domain::document::{DocId, Document};

const SOURCE: &str = "infra::recording";

#[derive(Debug, Clone, PartialEq)]
pub enum Delivered {
    Added {
        collection: String,
        id: DocId,
        fields: Document,
    },
    Changed {
        collection: String,
        id: DocId,
        fields: Document,
    },
    Removed {
        collection: String,
        id: DocId,
    },
    Stopped,
}

impl Delivered {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Changed { .. } => "changed",
            Self::Removed { .. } => "removed",
            Self::Stopped => "stopped",
        }
    }

    pub fn id(&self) -> Option<&DocId> {
        match self {
            Self::Added { id, .. } | Self::Changed { id, .. } | Self::Removed { id, .. } => Some(id),
            Self::Stopped => None,
        }
    }
}

/// Records deliveries in arrival order.
///
/// In strict mode it behaves like a client that tracks which documents it
/// holds: `changed` or `removed` for a document it never received fails with
/// [`DeliveryError::UnknownDocument`].
#[derive(Debug, Default)]
pub struct RecordingDelivery {
    events: Mutex<Vec<Delivered>>,
    known: Mutex<HashSet<DocId>>,
    strict: bool,
    failing: AtomicBool,
    notify: Notify,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    /// Mark documents as already held, e.g. the initial result set.
    pub fn acknowledge<'a>(&self, docs: impl IntoIterator<Item = &'a Arc<Document>>) {
        let mut known = mutex_lock(&self.known, SOURCE, "acknowledge");
        known.extend(docs.into_iter().filter_map(|doc| DocId::of(doc)));
    }

    /// Fail every subsequent delivery until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<Delivered> {
        mutex_lock(&self.events, SOURCE, "events").clone()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.events, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn added_ids(&self) -> Vec<DocId> {
        self.ids_of("added")
    }

    pub fn changed_ids(&self) -> Vec<DocId> {
        self.ids_of("changed")
    }

    pub fn removed_ids(&self) -> Vec<DocId> {
        self.ids_of("removed")
    }

    pub fn is_stopped(&self) -> bool {
        self.events()
            .iter()
            .any(|event| matches!(event, Delivered::Stopped))
    }

    /// Wait until at least `count` deliveries were recorded.
    pub async fn wait_for(&self, count: usize, within: Duration) -> bool {
        tokio::time::timeout(within, async {
            loop {
                let notified = self.notify.notified();
                if self.len() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }

    fn ids_of(&self, kind: &str) -> Vec<DocId> {
        self.events()
            .iter()
            .filter(|event| event.kind() == kind)
            .filter_map(Delivered::id)
            .cloned()
            .collect()
    }

    fn record(&self, event: Delivered) {
        debug!(kind = event.kind(), id = ?event.id(), "Recorded delivery");
        mutex_lock(&self.events, SOURCE, "record").push(event);
        self.notify.notify_waiters();
    }

    fn check(&self, collection: &str, id: &DocId) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Closed);
        }
        if self.strict && !mutex_lock(&self.known, SOURCE, "check").contains(id) {
            return Err(DeliveryError::UnknownDocument {
                collection: collection.to_string(),
                id: id.clone(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn added(&self, collection: &str, id: &DocId, fields: &Document) -> Result<(), DeliveryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeliveryError::Closed);
        }
        mutex_lock(&self.known, SOURCE, "added").insert(id.clone());
        self.record(Delivered::Added {
            collection: collection.to_string(),
            id: id.clone(),
            fields: fields.clone(),
        });
        Ok(())
    }

    async fn changed(&self, collection: &str, id: &DocId, fields: &Document) -> Result<(), DeliveryError> {
        self.check(collection, id)?;
        self.record(Delivered::Changed {
            collection: collection.to_string(),
            id: id.clone(),
            fields: fields.clone(),
        });
        Ok(())
    }

    async fn removed(&self, collection: &str, id: &DocId) -> Result<(), DeliveryError> {
        self.check(collection, id)?;
        mutex_lock(&self.known, SOURCE, "removed").remove(id);
        self.record(Delivered::Removed {
            collection: collection.to_string(),
            id: id.clone(),
        });
        Ok(())
    }

    async fn stop(&self) {
        self.record(Delivered::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn strict_mode_rejects_changes_to_unknown_documents() {
        let delivery = RecordingDelivery::strict();
        let id = DocId::new("a");
        let fields = Document::new();

        let err = delivery.changed("posts", &id, &fields).await.expect_err("unknown");
        assert!(matches!(err, DeliveryError::UnknownDocument { .. }));

        delivery.added("posts", &id, &fields).await.expect("added");
        delivery.changed("posts", &id, &fields).await.expect("changed");
        delivery.removed("posts", &id).await.expect("removed");
        assert_eq!(delivery.added_ids(), vec![id.clone()]);
        assert_eq!(delivery.changed_ids(), vec![id.clone()]);
        assert_eq!(delivery.removed_ids(), vec![id]);
    }

    #[tokio::test]
    async fn acknowledged_documents_are_known() {
        let delivery = RecordingDelivery::strict();
        let initial = vec![Arc::new(
            json!({"_id": "a"}).as_object().cloned().expect("object"),
        )];
        delivery.acknowledge(&initial);
        delivery
            .changed("posts", &DocId::new("a"), &Document::new())
            .await
            .expect("changed");
    }

    #[tokio::test]
    async fn wait_for_times_out_without_deliveries() {
        let delivery = RecordingDelivery::new();
        assert!(!delivery.wait_for(1, Duration::from_millis(10)).await);
        delivery.stop().await;
        assert!(delivery.wait_for(1, Duration::from_millis(10)).await);
        assert!(delivery.is_stopped());
    }
}
