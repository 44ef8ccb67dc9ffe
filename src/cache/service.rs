//! Live query orchestration.
//!
//! `CacheService` is the entry point for subscriptions: it serves the initial
//! result set from the cache or the store, attaches the subscriber to a shared
//! change feed, and tears both down again when the subscriber leaves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::application::delivery::Delivery;
use crate::application::query::FetchDescription;
use crate::application::store::{DocumentStore, StoreError};
use crate::domain::document::{DocId, Document};
use crate::domain::filter::strip_value;

use super::backfill::BackfillEngine;
use super::config::CacheConfig;
use super::feed::{AttachRequest, ChangeFeedMultiplexer, FeedError, FeedHandle};
use super::keys::{Fingerprint, SessionId, SubscriberId};
use super::lock::mutex_lock;
use super::store::{DocumentCache, shared_documents};
use super::suppression::SuppressionWindow;

const SOURCE: &str = "cache::service";

/// Registrations between sweeps of expired suppression records.
const SUPPRESSION_SWEEP_EVERY: u64 = 256;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Feed(#[from] FeedError),
}

/// A subscription request.
pub struct StreamRequest {
    pub subscriber_id: SubscriberId,
    pub session_id: SessionId,
    /// Identity of the caller; conditions on it are dropped from the shared
    /// feed filter so that callers differing only by identity share one feed.
    pub caller: Option<Value>,
    pub fetch: FetchDescription,
    pub delivery: Arc<dyn Delivery>,
}

/// Initial result set of a subscription plus its registration.
#[derive(Debug)]
pub struct StreamStart {
    pub docs: Vec<Arc<Document>>,
    pub from_cache: bool,
    pub handle: StreamHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHandle {
    feed: FeedHandle,
}

impl StreamHandle {
    pub fn fingerprint(&self) -> &Fingerprint {
        self.feed.fingerprint()
    }

    pub fn subscriber_id(&self) -> &SubscriberId {
        self.feed.subscriber_id()
    }

    pub fn feed(&self) -> &FeedHandle {
        &self.feed
    }
}

pub struct CacheService {
    config: CacheConfig,
    store: Arc<dyn DocumentStore>,
    cache: Arc<DocumentCache>,
    backfill: Arc<BackfillEngine>,
    suppression: SuppressionWindow,
    feeds: ChangeFeedMultiplexer,
    /// Live subscriptions per cache entry.
    users: Mutex<HashMap<Fingerprint, usize>>,
    writes: AtomicU64,
}

impl CacheService {
    pub fn new(config: CacheConfig, store: Arc<dyn DocumentStore>) -> Self {
        let cache = Arc::new(DocumentCache::new(&config, Arc::clone(&store)));
        let backfill = Arc::new(BackfillEngine::new(
            &config,
            Arc::clone(&cache),
            Arc::clone(&store),
        ));
        let suppression = SuppressionWindow::new(config.suppression_ttl());
        let feeds = ChangeFeedMultiplexer::new(
            &config,
            Arc::clone(&store),
            Arc::clone(&cache),
            Arc::clone(&backfill),
            suppression.clone(),
        );
        Self {
            config,
            store,
            cache,
            backfill,
            suppression,
            feeds,
            users: Mutex::new(HashMap::new()),
            writes: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<DocumentCache> {
        &self.cache
    }

    pub fn backfill(&self) -> &Arc<BackfillEngine> {
        &self.backfill
    }

    pub fn feeds(&self) -> &ChangeFeedMultiplexer {
        &self.feeds
    }

    pub fn suppression(&self) -> &SuppressionWindow {
        &self.suppression
    }

    /// Serve the initial results of a live query and subscribe to its changes.
    #[instrument(skip(self, request), fields(collection = %request.fetch.collection, subscriber = %request.subscriber_id))]
    pub async fn stream(&self, request: StreamRequest) -> Result<StreamStart, ServiceError> {
        let fetch = &request.fetch;
        let fingerprint = fetch.fingerprint();
        let (docs, from_cache) = self.initial_results(fetch, &fingerprint).await?;

        if fetch.paginate
            && fetch.sort.is_some()
            && let Some(last) = docs.last()
        {
            self.cache
                .set_timestamp(&fingerprint, &request.subscriber_id, last)
                .await;
        }

        let feed_filter = match &request.caller {
            Some(caller) => strip_value(&fetch.filter, caller),
            None => fetch.filter.clone(),
        };
        if feed_filter.is_empty() {
            warn!(
                collection = %fetch.collection,
                "Change feed observes the entire collection; narrow the filter to reduce load"
            );
        }

        self.acquire(&fingerprint);
        let attached = self
            .feeds
            .attach(AttachRequest {
                subscriber_id: request.subscriber_id.clone(),
                session_id: request.session_id,
                collection: fetch.collection.clone(),
                feed_filter,
                projection: fetch.projection.clone(),
                fingerprint: fingerprint.clone(),
                delivery: request.delivery,
            })
            .await;

        let feed = match attached {
            Ok(feed) => feed,
            Err(err) => {
                self.cache
                    .clear_timestamp(&fingerprint, &request.subscriber_id)
                    .await;
                self.release(&fingerprint).await;
                return Err(err.into());
            }
        };

        debug!(from_cache, count = docs.len(), "Stream started");
        Ok(StreamStart {
            docs,
            from_cache,
            handle: StreamHandle { feed },
        })
    }

    async fn initial_results(
        &self,
        fetch: &FetchDescription,
        fingerprint: &Fingerprint,
    ) -> Result<(Vec<Arc<Document>>, bool), StoreError> {
        let options = fetch.options();
        let view = self.cache.get(fingerprint, options).await;
        if !fetch.paginate
            && let Some(view) = view
            && view.is_hit()
        {
            return Ok((view.docs, true));
        }

        let found = match self.store.find(&fetch.to_store_query()).await {
            Ok(found) => found,
            Err(err) => {
                // The lookup above may have created the entry; nobody holds it.
                if self.users_of(fingerprint) == 0 {
                    self.cache.delete(fingerprint).await;
                }
                return Err(err);
            }
        };
        if !options.skips() {
            self.cache.set(fingerprint, found.clone()).await;
        }
        Ok((shared_documents(found), false))
    }

    /// Tear down a subscription created by [`CacheService::stream`].
    #[instrument(skip(self, handle), fields(subscriber = %handle.subscriber_id()))]
    pub async fn unsubscribe(&self, handle: StreamHandle) {
        let fingerprint = handle.fingerprint().clone();
        self.cache
            .clear_timestamp(&fingerprint, handle.subscriber_id())
            .await;
        self.feeds.detach(&handle.feed);
        self.release(&fingerprint).await;
    }

    /// Point-in-time read straight from the store; nothing is cached or watched.
    pub async fn once(&self, fetch: &FetchDescription) -> Result<Vec<Document>, ServiceError> {
        Ok(self.store.find(&fetch.to_store_query()).await?)
    }

    /// Record that `session` wrote document `id`; the feed echo of that write
    /// will not be delivered back to the session.
    pub fn record_write(&self, id: DocId, session: SessionId) {
        self.suppression.register(id, session);
        if self.writes.fetch_add(1, Ordering::Relaxed) % SUPPRESSION_SWEEP_EVERY
            == SUPPRESSION_SWEEP_EVERY - 1
        {
            let purged = self.suppression.purge_expired();
            debug!(purged, "Swept expired suppression records");
        }
    }

    /// The write path is done with `id`; stop suppressing it.
    pub fn release_write(&self, id: &DocId) {
        self.suppression.release(id);
    }

    /// Close every feed and drop all cached data.
    pub fn shutdown(&self) {
        let closed = self.feeds.close_all();
        self.cache.clear();
        mutex_lock(&self.users, SOURCE, "shutdown").clear();
        info!(closed, "Cache service shut down");
    }

    pub fn users_of(&self, fingerprint: &Fingerprint) -> usize {
        mutex_lock(&self.users, SOURCE, "users_of")
            .get(fingerprint)
            .copied()
            .unwrap_or(0)
    }

    fn acquire(&self, fingerprint: &Fingerprint) {
        *mutex_lock(&self.users, SOURCE, "acquire")
            .entry(fingerprint.clone())
            .or_insert(0) += 1;
    }

    async fn release(&self, fingerprint: &Fingerprint) {
        let remaining = {
            let mut users = mutex_lock(&self.users, SOURCE, "release");
            match users.get_mut(fingerprint) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    *count
                }
                Some(_) => {
                    users.remove(fingerprint);
                    0
                }
                None => 0,
            }
        };

        if remaining == 0 && self.config.evict_on_last_detach && self.cache.delete(fingerprint).await {
            debug!(fingerprint = %fingerprint, "Evicted cache entry after last subscriber left");
        }
    }
}
