//! Change-feed multiplexing.
//!
//! One change feed is opened per (collection, feed filter) no matter how many
//! subscribers need it. Each feed runs a pump task that applies every event to
//! the cache entries of its subscribers and then fans the change out to them.
//! Events of one feed are dispatched sequentially, which preserves per-document
//! order.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use futures::future::join_all;
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::application::delivery::{Delivery, DeliveryError};
use crate::application::query::change_feed_pipeline;
use crate::application::store::{
    ChangeEvent, ChangeKind, ChangeStream, DocumentStore, OperationType, StoreError,
};
use crate::domain::document::{DocId, Document, FieldDelta, ID_FIELD};
use crate::domain::filter::evaluate;

use super::backfill::BackfillEngine;
use super::config::CacheConfig;
use super::keys::{FeedKey, Fingerprint, KeyError, SessionId, SubscriberId};
use super::lock::mutex_lock;
use super::store::{DocumentCache, Mutation, PointFetch, UpdateOutcome};
use super::subscriber::{Subscriber, Subscribers, fingerprints_of};
use super::suppression::SuppressionWindow;

const SOURCE: &str = "cache::feed";

pub const METRIC_FEED_OPEN: &str = "flusso_feed_open_total";
pub const METRIC_FEED_CLOSE: &str = "flusso_feed_close_total";
pub const METRIC_FEED_ACTIVE: &str = "flusso_feed_active";
pub const METRIC_FEED_DELIVERY_ERROR: &str = "flusso_feed_delivery_error_total";
pub const METRIC_FEED_SUPPRESSED: &str = "flusso_feed_suppressed_total";
pub const METRIC_FEED_RECOVERED: &str = "flusso_feed_recovered_total";

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to open change feed `{key}`: {source}")]
    Open {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Everything needed to attach one subscriber to a shared feed.
pub struct AttachRequest {
    pub subscriber_id: SubscriberId,
    pub session_id: SessionId,
    pub collection: String,
    /// Filter of the shared feed; may be broader than the subscription.
    pub feed_filter: Document,
    pub projection: Option<Document>,
    /// Cache entry backing the subscription.
    pub fingerprint: Fingerprint,
    pub delivery: Arc<dyn Delivery>,
}

/// Registration returned by [`ChangeFeedMultiplexer::attach`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FeedHandle {
    key: FeedKey,
    /// Identifies the feed instance; a reopened feed under the same key gets
    /// a new one.
    generation: u64,
    subscriber_id: SubscriberId,
    fingerprint: Fingerprint,
}

impl FeedHandle {
    pub fn key(&self) -> &FeedKey {
        &self.key
    }

    pub fn subscriber_id(&self) -> &SubscriberId {
        &self.subscriber_id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}

struct FeedRegistration {
    generation: u64,
    collection: String,
    subscribers: Subscribers,
    pump: JoinHandle<()>,
}

/// State shared between the multiplexer and its pump tasks.
struct Dispatcher {
    config: CacheConfig,
    store: Arc<dyn DocumentStore>,
    cache: Arc<DocumentCache>,
    backfill: Arc<BackfillEngine>,
    suppression: SuppressionWindow,
    feeds: Mutex<HashMap<FeedKey, FeedRegistration>>,
    generations: AtomicU64,
}

pub struct ChangeFeedMultiplexer {
    dispatcher: Arc<Dispatcher>,
    /// Held while a feed is being opened so concurrent attaches open it once.
    opening: AsyncMutex<()>,
}

impl ChangeFeedMultiplexer {
    pub fn new(
        config: &CacheConfig,
        store: Arc<dyn DocumentStore>,
        cache: Arc<DocumentCache>,
        backfill: Arc<BackfillEngine>,
        suppression: SuppressionWindow,
    ) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher {
                config: config.clone(),
                store,
                cache,
                backfill,
                suppression,
                feeds: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
            opening: AsyncMutex::new(()),
        }
    }

    /// Register a subscriber, opening the shared feed if none exists yet.
    #[instrument(skip(self, request), fields(collection = %request.collection, subscriber = %request.subscriber_id))]
    pub async fn attach(&self, request: AttachRequest) -> Result<FeedHandle, FeedError> {
        let key = FeedKey::new(&request.collection, &request.feed_filter);
        let shape = request.fingerprint.parse()?;
        let subscriber = Subscriber {
            id: request.subscriber_id.clone(),
            session: request.session_id,
            fingerprint: request.fingerprint.clone(),
            filter: shape.filter,
            delivery: request.delivery,
        };
        let handle = |generation| FeedHandle {
            key: key.clone(),
            generation,
            subscriber_id: request.subscriber_id.clone(),
            fingerprint: request.fingerprint.clone(),
        };

        if let Some(generation) = self.join_existing(&key, &subscriber) {
            return Ok(handle(generation));
        }

        let _opening = self.opening.lock().await;
        if let Some(generation) = self.join_existing(&key, &subscriber) {
            return Ok(handle(generation));
        }

        let pipeline = change_feed_pipeline(&request.feed_filter, request.projection.as_ref());
        let stream = self
            .dispatcher
            .store
            .watch(&request.collection, &pipeline)
            .await
            .map_err(|source| FeedError::Open {
                key: key.to_string(),
                source,
            })?;

        let generation = self.dispatcher.generations.fetch_add(1, Ordering::Relaxed);
        let subscribers = Subscribers::new();
        subscribers.insert(subscriber);
        let active = {
            // Spawned under the lock: the pump removes its registration on exit.
            let mut feeds = mutex_lock(&self.dispatcher.feeds, SOURCE, "attach");
            let pump = tokio::spawn(pump(
                Arc::clone(&self.dispatcher),
                key.clone(),
                generation,
                subscribers.clone(),
                stream,
            ));
            feeds.insert(
                key.clone(),
                FeedRegistration {
                    generation,
                    collection: request.collection.clone(),
                    subscribers,
                    pump,
                },
            );
            feeds.len()
        };
        counter!(METRIC_FEED_OPEN).increment(1);
        gauge!(METRIC_FEED_ACTIVE).set(active as f64);
        info!(feed = %key, generation, "Opened change feed");
        Ok(handle(generation))
    }

    /// Join a live feed; returns its generation.
    fn join_existing(&self, key: &FeedKey, subscriber: &Subscriber) -> Option<u64> {
        let feeds = mutex_lock(&self.dispatcher.feeds, SOURCE, "join_existing");
        let registration = feeds.get(key)?;
        registration.subscribers.insert(subscriber.clone());
        Some(registration.generation)
    }

    /// Remove a subscriber; the last one out closes the feed.
    ///
    /// Returns true when the feed was closed.
    pub fn detach(&self, handle: &FeedHandle) -> bool {
        let (closed, active) = {
            let mut feeds = mutex_lock(&self.dispatcher.feeds, SOURCE, "detach");
            let Some(registration) = feeds
                .get(&handle.key)
                .filter(|registration| registration.generation == handle.generation)
            else {
                return false;
            };
            registration.subscribers.remove(&handle.subscriber_id);
            if !registration.subscribers.is_empty() {
                return false;
            }
            let closed = feeds.remove(&handle.key);
            (closed, feeds.len())
        };

        let Some(registration) = closed else {
            return false;
        };
        registration.pump.abort();
        counter!(METRIC_FEED_CLOSE).increment(1);
        gauge!(METRIC_FEED_ACTIVE).set(active as f64);
        info!(feed = %handle.key, "Closed change feed");
        true
    }

    /// Close every feed without notifying subscribers.
    pub fn close_all(&self) -> usize {
        let drained: Vec<FeedRegistration> = mutex_lock(&self.dispatcher.feeds, SOURCE, "close_all")
            .drain()
            .map(|(_, registration)| registration)
            .collect();
        for registration in &drained {
            registration.pump.abort();
        }
        counter!(METRIC_FEED_CLOSE).increment(drained.len() as u64);
        gauge!(METRIC_FEED_ACTIVE).set(0.0);
        drained.len()
    }

    pub fn feed_count(&self) -> usize {
        mutex_lock(&self.dispatcher.feeds, SOURCE, "feed_count").len()
    }

    pub fn subscriber_count(&self, key: &FeedKey) -> usize {
        mutex_lock(&self.dispatcher.feeds, SOURCE, "subscriber_count")
            .get(key)
            .map_or(0, |registration| registration.subscribers.len())
    }

    pub fn suppression(&self) -> &SuppressionWindow {
        &self.dispatcher.suppression
    }
}

async fn pump(
    dispatcher: Arc<Dispatcher>,
    key: FeedKey,
    generation: u64,
    subscribers: Subscribers,
    mut stream: ChangeStream,
) {
    let failure = loop {
        match stream.next().await {
            Some(Ok(event)) => dispatcher.dispatch(&key, &subscribers, event).await,
            Some(Err(err)) => break Some(err),
            None => break None,
        }
    };
    match &failure {
        Some(err) => warn!(feed = %key, error = %err, "Change feed failed; stopping subscribers"),
        None => info!(feed = %key, "Change feed ended; stopping subscribers"),
    }

    // Retire first so that subscribers reacting to the stop open a fresh feed.
    dispatcher.retire(&key, generation);
    join_all(subscribers.snapshot().iter().map(|s| s.delivery.stop())).await;
}

/// A CRUD event reduced to what subscribers receive.
struct Change {
    collection: String,
    id: DocId,
    operation: OperationType,
    mutation: Mutation,
    /// Fields announced to subscribers, including `_id`.
    fields: Document,
}

impl Change {
    fn from_event(event: ChangeEvent) -> Option<Self> {
        let operation = event.operation();
        let id = event.document_id()?;
        let (mutation, fields) = match event.kind {
            ChangeKind::Insert { mut full_document } => {
                full_document.insert(ID_FIELD.to_string(), id.to_value());
                (Mutation::Insert(full_document.clone()), full_document)
            }
            ChangeKind::Replace { mut full_document } => {
                full_document.insert(ID_FIELD.to_string(), id.to_value());
                (Mutation::Replace(full_document.clone()), full_document)
            }
            ChangeKind::Update {
                updated_fields,
                removed_fields,
            } => {
                let delta = FieldDelta::new(updated_fields, removed_fields);
                let fields = delta.to_fields(&id);
                (
                    Mutation::Update {
                        id: id.clone(),
                        delta,
                    },
                    fields,
                )
            }
            ChangeKind::Delete => {
                let mut fields = Document::new();
                fields.insert(ID_FIELD.to_string(), id.to_value());
                (Mutation::Delete(id.clone()), fields)
            }
            _ => return None,
        };
        Some(Self {
            collection: event.collection,
            id,
            operation,
            mutation,
            fields,
        })
    }
}

impl Dispatcher {
    /// Drop the registration of a feed whose pump exited, unless the key
    /// already belongs to a newer feed.
    fn retire(&self, key: &FeedKey, generation: u64) -> bool {
        let active = {
            let mut feeds = mutex_lock(&self.feeds, SOURCE, "retire");
            if feeds.get(key).map(|registration| registration.generation) != Some(generation) {
                return false;
            }
            feeds.remove(key);
            feeds.len()
        };
        counter!(METRIC_FEED_CLOSE).increment(1);
        gauge!(METRIC_FEED_ACTIVE).set(active as f64);
        debug!(feed = %key, generation, "Retired change feed");
        true
    }

    #[instrument(skip_all, fields(feed = %key, operation = event.operation().as_str()))]
    async fn dispatch(&self, key: &FeedKey, subscribers: &Subscribers, event: ChangeEvent) {
        let targets = subscribers.snapshot();
        if targets.is_empty() {
            return;
        }

        if !event.operation().is_crud() {
            info!(collection = %event.collection, "Administrative change; stopping subscribers");
            join_all(targets.iter().map(|subscriber| subscriber.delivery.stop())).await;
            return;
        }

        let Some(change) = Change::from_event(event) else {
            warn!("Change event without a usable document id");
            return;
        };

        let fetch = PointFetch::new(self.store.as_ref(), &change.collection, &change.id);
        let mut outcomes: HashMap<Fingerprint, UpdateOutcome> = HashMap::new();
        for fingerprint in fingerprints_of(&targets) {
            match self
                .cache
                .update_with(&fingerprint, change.mutation.clone(), &fetch)
                .await
            {
                Ok(Some(outcome)) => {
                    if change.operation == OperationType::Delete
                        && (outcome.entry.limit.is_some() || !outcome.entry.timestamps.is_empty())
                    {
                        self.backfill.queue_delete(
                            &fingerprint,
                            subscribers,
                            outcome.everyone.unwrap_or(false),
                        );
                    }
                    outcomes.insert(fingerprint, outcome);
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(fingerprint = %fingerprint, error = %err, "Cache update failed");
                }
            }
        }

        let suppressed = self.suppression.sessions_for(&change.id);
        let results = join_all(targets.iter().map(|subscriber| {
            self.deliver(
                subscriber,
                &change,
                outcomes.get(&subscriber.fingerprint),
                &suppressed,
                &fetch,
            )
        }))
        .await;

        for (subscriber, result) in targets.iter().zip(results) {
            if let Err(err) = result {
                counter!(METRIC_FEED_DELIVERY_ERROR).increment(1);
                warn!(
                    subscriber = %subscriber.id,
                    document = %change.id,
                    error = %err,
                    "Change delivery failed"
                );
            }
        }

        if self.config.release_suppression_after_dispatch && !suppressed.is_empty() {
            self.release_suppressed(key, &change.id, &change.collection, &suppressed);
        }
    }

    /// Release each suppressed session once every feed it listens to on the
    /// collection has dispatched the change. Records for feeds that never see
    /// the change expire instead.
    fn release_suppressed(
        &self,
        key: &FeedKey,
        id: &DocId,
        collection: &str,
        suppressed: &HashSet<SessionId>,
    ) {
        let dispatched = self.suppression.mark_dispatched(id, key);
        let feeds = mutex_lock(&self.feeds, SOURCE, "release_suppressed");
        for session in suppressed {
            let pending = feeds.iter().any(|(other, registration)| {
                !dispatched.contains(other)
                    && registration.collection == collection
                    && registration.subscribers.has_session(session)
            });
            if !pending {
                self.suppression.release_session(id, session);
            }
        }
    }

    async fn deliver(
        &self,
        subscriber: &Subscriber,
        change: &Change,
        outcome: Option<&UpdateOutcome>,
        suppressed: &HashSet<SessionId>,
        fetch: &PointFetch<'_>,
    ) -> Result<(), DeliveryError> {
        if suppressed.contains(&subscriber.session) {
            counter!(METRIC_FEED_SUPPRESSED).increment(1);
            return Ok(());
        }

        let full = outcome.and_then(|outcome| outcome.full_document.clone());
        let fields: &Document = full.as_deref().unwrap_or(&change.fields);
        let delivery = &subscriber.delivery;
        let result = match change.operation {
            OperationType::Insert => {
                if evaluate(&subscriber.filter, fields).excludes() {
                    return Ok(());
                }
                delivery.added(&change.collection, &change.id, fields).await
            }
            OperationType::Replace => {
                if evaluate(&subscriber.filter, fields).excludes() {
                    return Ok(());
                }
                delivery.changed(&change.collection, &change.id, fields).await
            }
            OperationType::Update => delivery.changed(&change.collection, &change.id, fields).await,
            OperationType::Delete => {
                return match delivery.removed(&change.collection, &change.id).await {
                    Err(DeliveryError::UnknownDocument { .. }) => Ok(()),
                    other => other,
                };
            }
            _ => return Ok(()),
        };

        match result {
            Err(DeliveryError::UnknownDocument { .. }) => {
                self.recover(subscriber, change, fetch).await
            }
            other => other,
        }
    }

    /// The subscriber never saw the document: send it whole as an addition.
    async fn recover(
        &self,
        subscriber: &Subscriber,
        change: &Change,
        fetch: &PointFetch<'_>,
    ) -> Result<(), DeliveryError> {
        let Some(doc) = fetch.get().await.map_err(DeliveryError::from_failure)? else {
            return Ok(());
        };
        if evaluate(&subscriber.filter, &doc).excludes() {
            return Ok(());
        }
        counter!(METRIC_FEED_RECOVERED).increment(1);
        subscriber
            .delivery
            .added(&change.collection, &change.id, &doc)
            .await
    }
}
