//! Debounced refills after deletions.
//!
//! A delete leaves a hole in every window that contained the document. Deletes
//! against one entry are counted for a short debounce window; when it closes,
//! the entry is refilled with one store query per distinct subscriber position
//! plus, when the shared window lost a document, one query for the window.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::join_all;
use metrics::{counter, histogram};
use tracing::{debug, instrument, warn};

use crate::application::delivery::DeliveryError;
use crate::application::query::{exclusion_query, positional_query};
use crate::application::store::{DocumentStore, StoreError};
use crate::domain::document::{DocId, Document};

use super::config::CacheConfig;
use super::keys::{Fingerprint, SubscriberId};
use super::lock::mutex_lock;
use super::store::{DocumentCache, EntryGuard, PurgeReason, shared_documents};
use super::subscriber::{Subscriber, Subscribers};

const SOURCE: &str = "cache::backfill";

pub const METRIC_BACKFILL_QUERY: &str = "flusso_backfill_query_total";
pub const METRIC_BACKFILL_MS: &str = "flusso_backfill_ms";

#[derive(Debug)]
struct PendingDeleteBatch {
    count: u64,
    /// At least one deleted document was part of the shared window.
    everyone: bool,
    subscribers: Subscribers,
}

/// Documents to announce to one subscriber after the entry lock is released.
struct PlannedDelivery {
    subscriber: Subscriber,
    collection: String,
    docs: Vec<Arc<Document>>,
}

pub struct BackfillEngine {
    debounce: Duration,
    cache: Arc<DocumentCache>,
    store: Arc<dyn DocumentStore>,
    pending: Mutex<HashMap<Fingerprint, PendingDeleteBatch>>,
}

impl BackfillEngine {
    pub fn new(config: &CacheConfig, cache: Arc<DocumentCache>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            debounce: config.backfill_debounce(),
            cache,
            store,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Count one delete against `fingerprint`.
    ///
    /// The first delete of a batch starts the debounce timer; later ones only
    /// grow the batch. Returns true when this call opened a new batch.
    pub fn queue_delete(
        self: &Arc<Self>,
        fingerprint: &Fingerprint,
        subscribers: &Subscribers,
        everyone: bool,
    ) -> bool {
        {
            let mut pending = mutex_lock(&self.pending, SOURCE, "queue_delete");
            if let Some(batch) = pending.get_mut(fingerprint) {
                batch.count += 1;
                batch.everyone |= everyone;
                return false;
            }
            pending.insert(
                fingerprint.clone(),
                PendingDeleteBatch {
                    count: 1,
                    everyone,
                    subscribers: subscribers.clone(),
                },
            );
        }

        let engine = Arc::clone(self);
        let fingerprint = fingerprint.clone();
        tokio::spawn(async move {
            tokio::time::sleep(engine.debounce).await;
            let batch = mutex_lock(&engine.pending, SOURCE, "flush").remove(&fingerprint);
            if let Some(batch) = batch {
                engine.run(&fingerprint, batch).await;
            }
        });
        true
    }

    /// Deletes counted so far in the open batch for `fingerprint`.
    pub fn pending_deletes(&self, fingerprint: &Fingerprint) -> Option<u64> {
        mutex_lock(&self.pending, SOURCE, "pending_deletes")
            .get(fingerprint)
            .map(|batch| batch.count)
    }

    #[instrument(skip(self, batch), fields(fingerprint = %fingerprint, deletes = batch.count))]
    async fn run(&self, fingerprint: &Fingerprint, batch: PendingDeleteBatch) {
        let started_at = Instant::now();
        let planned = {
            let entry = self.cache.lock(fingerprint).await;
            match self.refill(&entry, fingerprint, &batch).await {
                Ok(planned) => planned,
                Err(err) => {
                    entry.purge(PurgeReason::Backfill, &err);
                    Vec::new()
                }
            }
        };

        let delivered = deliver_planned(&planned).await;
        debug!(delivered, "Backfill complete");
        histogram!(METRIC_BACKFILL_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
    }

    async fn refill(
        &self,
        entry: &EntryGuard<'_>,
        fingerprint: &Fingerprint,
        batch: &PendingDeleteBatch,
    ) -> Result<Vec<PlannedDelivery>, StoreError> {
        let Some(snapshot) = entry.snapshot() else {
            return Ok(Vec::new());
        };
        let subscribers = batch.subscribers.for_fingerprint(fingerprint);
        let mut planned = Vec::new();
        let mut positioned: HashSet<SubscriberId> = HashSet::new();

        if let Some(sort) = &snapshot.sort {
            let mut advanced: Vec<(SubscriberId, Arc<Document>)> = Vec::new();
            for (position, group) in &snapshot.timestamps {
                positioned.extend(group.iter().cloned());
                let query = positional_query(
                    &snapshot.collection,
                    &snapshot.filter,
                    sort,
                    position.clone(),
                    batch.count,
                );
                counter!(METRIC_BACKFILL_QUERY, "mode" => "positional").increment(1);
                let docs = shared_documents(self.store.find(&query).await?);
                let Some(last) = docs.last().cloned() else {
                    continue;
                };

                for id in group {
                    let Some(subscriber) = subscribers.iter().find(|s| &s.id == id) else {
                        continue;
                    };
                    planned.push(PlannedDelivery {
                        subscriber: subscriber.clone(),
                        collection: snapshot.collection.clone(),
                        docs: docs.clone(),
                    });
                    advanced.push((id.clone(), Arc::clone(&last)));
                }
            }
            for (subscriber, doc) in advanced {
                entry.set_timestamp(&subscriber, &doc);
            }
        }

        if batch.everyone
            && let Some(limit) = snapshot.limit
        {
            let missing = limit.saturating_sub(snapshot.len() as u64);
            if missing > 0 {
                let query = exclusion_query(
                    &snapshot.collection,
                    &snapshot.filter,
                    snapshot.sort.as_ref(),
                    &snapshot.doc_ids,
                    missing,
                );
                counter!(METRIC_BACKFILL_QUERY, "mode" => "everyone").increment(1);
                let found = self.store.find(&query).await?;
                if !found.is_empty() {
                    entry.store(found.clone());
                    let docs = shared_documents(found);
                    for subscriber in subscribers.iter().filter(|s| !positioned.contains(&s.id)) {
                        planned.push(PlannedDelivery {
                            subscriber: subscriber.clone(),
                            collection: snapshot.collection.clone(),
                            docs: docs.clone(),
                        });
                    }
                }
            }
        }

        Ok(planned)
    }
}

async fn deliver_planned(planned: &[PlannedDelivery]) -> usize {
    let results = join_all(planned.iter().map(|plan| async move {
        for doc in &plan.docs {
            let Some(id) = DocId::of(doc) else {
                continue;
            };
            plan.subscriber
                .delivery
                .added(&plan.collection, &id, doc)
                .await?;
        }
        Ok::<usize, DeliveryError>(plan.docs.len())
    }))
    .await;

    let mut delivered = 0;
    for (plan, result) in planned.iter().zip(results) {
        match result {
            Ok(count) => delivered += count,
            Err(err) => warn!(
                subscriber = %plan.subscriber.id,
                error = %err,
                "Backfill delivery failed"
            ),
        }
    }
    delivered
}
