//! Document cache storage.
//!
//! Documents live once per collection in a shared table. Each query
//! fingerprint owns a cache entry listing the documents it currently covers;
//! a document stays in the table while at least one entry pins it.
//!
//! Mutations of one entry are serialized through striped async locks so that a
//! read-modify-write sequence which awaits the backing store is never
//! interleaved with another mutation of the same entry. The synchronous table
//! lock is only held for the in-memory part of each step.

use std::collections::hash_map::{self, HashMap};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use metrics::counter;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{MutexGuard as AsyncMutexGuard, OnceCell};
use tracing::{debug, warn};

use crate::application::query::FetchOptions;
use crate::application::store::{DocumentStore, StoreError};
use crate::domain::document::{DocId, Document, FieldDelta, get_path, normalize_id};
use crate::domain::filter::{SimpleFilter, evaluate};
use crate::domain::sort::{SortSpec, trim};

use super::config::CacheConfig;
use super::keys::{EntryId, Fingerprint, KeyError, QueryShape, SubscriberId, canonical_json};
use super::lock::{EntryLocks, rw_read, rw_write};
use super::registry::PinRegistry;

const SOURCE: &str = "cache::store";

pub const METRIC_CACHE_HIT: &str = "flusso_cache_hit_total";
pub const METRIC_CACHE_MISS: &str = "flusso_cache_miss_total";
pub const METRIC_CACHE_PURGE: &str = "flusso_cache_purge_total";
pub const METRIC_CACHE_EVICT: &str = "flusso_cache_evict_total";

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

/// Why an entry was dropped after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeReason {
    PointFetch,
    Backfill,
}

impl PurgeReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PointFetch => "point_fetch",
            Self::Backfill => "backfill",
        }
    }
}

/// Where a cache hit was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitSource {
    /// The entry's own documents.
    Entry,
    /// Documents found in the shared table for a simple filter.
    Scan,
}

impl HitSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entry => "entry",
            Self::Scan => "scan",
        }
    }
}

/// A change applied to one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert(Document),
    Replace(Document),
    Update { id: DocId, delta: FieldDelta },
    Delete(DocId),
}

impl Mutation {
    pub fn id(&self) -> Option<DocId> {
        match self {
            Self::Insert(doc) | Self::Replace(doc) => DocId::of(doc),
            Self::Update { id, .. } | Self::Delete(id) => Some(id.clone()),
        }
    }
}

/// Read-only copy of an entry's bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub id: EntryId,
    pub collection: String,
    pub filter: Document,
    pub sort: Option<SortSpec>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    /// Covered documents in insertion order.
    pub doc_ids: Vec<DocId>,
    /// Last-seen sort positions and the subscribers sitting at each.
    pub timestamps: Vec<(Value, Vec<SubscriberId>)>,
}

impl EntrySnapshot {
    pub fn contains(&self, id: &DocId) -> bool {
        self.doc_ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    pub fn timestamp_of(&self, subscriber: &SubscriberId) -> Option<&Value> {
        self.timestamps
            .iter()
            .find(|(_, subscribers)| subscribers.contains(subscriber))
            .map(|(position, _)| position)
    }
}

/// Result of a cache read. An empty `docs` is a miss.
#[derive(Debug, Clone)]
pub struct CacheView {
    pub entry: EntrySnapshot,
    pub docs: Vec<Arc<Document>>,
    pub source: Option<HitSource>,
}

impl CacheView {
    fn empty(entry: EntrySnapshot) -> Self {
        Self {
            entry,
            docs: Vec::new(),
            source: None,
        }
    }

    pub fn is_hit(&self) -> bool {
        !self.docs.is_empty()
    }
}

/// What an update did to an entry.
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    /// The entry after the update was applied.
    pub entry: EntrySnapshot,
    /// For deletes: whether the removed document was covered by the entry,
    /// and therefore visible to every subscriber of it.
    pub everyone: Option<bool>,
    /// Complete document fetched to resolve a partial update.
    pub full_document: Option<Arc<Document>>,
}

#[derive(Debug)]
struct Position {
    value: Value,
    subscribers: HashSet<SubscriberId>,
}

#[derive(Debug)]
struct CacheEntry {
    id: EntryId,
    collection: String,
    filter: Document,
    sort: Option<SortSpec>,
    skip: Option<u64>,
    limit: Option<u64>,
    doc_ids: HashMap<DocId, u64>,
    next_seq: u64,
    timestamps: BTreeMap<String, Position>,
}

impl CacheEntry {
    fn new(shape: QueryShape, options: FetchOptions) -> Self {
        Self {
            id: EntryId::new(),
            collection: shape.collection,
            filter: shape.filter,
            sort: shape.sort,
            skip: options.skip,
            limit: options.limit,
            doc_ids: HashMap::new(),
            next_seq: 0,
            timestamps: BTreeMap::new(),
        }
    }

    fn skips(&self) -> bool {
        self.skip.is_some_and(|skip| skip > 0)
    }

    fn track(&mut self, id: DocId) {
        if let hash_map::Entry::Vacant(slot) = self.doc_ids.entry(id) {
            slot.insert(self.next_seq);
            self.next_seq += 1;
        }
    }

    fn untrack(&mut self, id: &DocId) -> bool {
        self.doc_ids.remove(id).is_some()
    }

    fn ids_in_order(&self) -> Vec<DocId> {
        let mut ids: Vec<(&DocId, u64)> = self.doc_ids.iter().map(|(id, seq)| (id, *seq)).collect();
        ids.sort_by_key(|(_, seq)| *seq);
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }

    fn forget_subscriber(&mut self, subscriber: &SubscriberId) {
        self.timestamps.retain(|_, position| {
            position.subscribers.remove(subscriber);
            !position.subscribers.is_empty()
        });
    }

    fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            id: self.id,
            collection: self.collection.clone(),
            filter: self.filter.clone(),
            sort: self.sort.clone(),
            skip: self.skip,
            limit: self.limit,
            doc_ids: self.ids_in_order(),
            timestamps: self
                .timestamps
                .values()
                .map(|position| {
                    let mut subscribers: Vec<SubscriberId> =
                        position.subscribers.iter().cloned().collect();
                    subscribers.sort();
                    (position.value.clone(), subscribers)
                })
                .collect(),
        }
    }
}

#[derive(Debug, Default)]
struct DocumentTable {
    collections: HashMap<String, HashMap<DocId, Arc<Document>>>,
    pins: PinRegistry,
}

impl DocumentTable {
    fn get(&self, collection: &str, id: &DocId) -> Option<Arc<Document>> {
        self.collections
            .get(collection)
            .and_then(|documents| documents.get(id))
            .cloned()
    }

    fn put(&mut self, collection: &str, id: &DocId, doc: Arc<Document>, entry: EntryId) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), doc);
        self.pins.pin(collection, id, entry);
    }

    fn pin(&mut self, collection: &str, id: &DocId, entry: EntryId) {
        self.pins.pin(collection, id, entry);
    }

    fn release(&mut self, collection: &str, id: &DocId, entry: EntryId) {
        if !self.pins.unpin(collection, id, entry) {
            return;
        }
        if let Some(documents) = self.collections.get_mut(collection) {
            documents.remove(id);
            if documents.is_empty() {
                self.collections.remove(collection);
            }
        }
    }

    fn scan(&self, collection: &str) -> impl Iterator<Item = &Arc<Document>> {
        self.collections
            .get(collection)
            .into_iter()
            .flat_map(HashMap::values)
    }

    fn document_count(&self) -> usize {
        self.collections.values().map(HashMap::len).sum()
    }
}

#[derive(Debug, Default)]
struct CacheState {
    table: DocumentTable,
    entries: HashMap<Fingerprint, CacheEntry>,
}

impl CacheState {
    fn read(&mut self, fingerprint: &Fingerprint, options: FetchOptions) -> Result<CacheView, KeyError> {
        let Self { table, entries } = self;
        let entry = match entries.entry(fingerprint.clone()) {
            hash_map::Entry::Occupied(slot) => slot.into_mut(),
            hash_map::Entry::Vacant(slot) => {
                slot.insert(CacheEntry::new(fingerprint.parse()?, options))
            }
        };

        if options.skips() {
            return Ok(CacheView::empty(entry.snapshot()));
        }

        let mut docs: Vec<Arc<Document>> = entry
            .ids_in_order()
            .iter()
            .filter_map(|id| table.get(&entry.collection, id))
            .collect();

        let source = if !docs.is_empty() {
            if let Some(sort) = &entry.sort {
                docs.sort_by(|a, b| sort.compare(a, b));
            }
            if let Some(limit) = options.limit {
                docs.truncate(limit as usize);
            }
            HitSource::Entry
        } else if entry.sort.is_some() {
            return Ok(CacheView::empty(entry.snapshot()));
        } else {
            docs = find_existing(table, entry, options.limit.or(entry.limit));
            HitSource::Scan
        };

        for doc in &docs {
            if let Some(id) = DocId::of(doc) {
                table.pin(&entry.collection, &id, entry.id);
                entry.track(id);
            }
        }

        let source = (!docs.is_empty()).then_some(source);
        Ok(CacheView {
            entry: entry.snapshot(),
            docs,
            source,
        })
    }

    fn store(&mut self, fingerprint: &Fingerprint, docs: Vec<Document>) {
        let Self { table, entries } = self;
        let Some(entry) = entries.get_mut(fingerprint) else {
            return;
        };
        if entry.skips() {
            return;
        }

        for mut doc in docs {
            let Some(id) = normalize_id(&mut doc) else {
                continue;
            };
            table.put(&entry.collection, &id, Arc::new(doc), entry.id);
            entry.track(id);
        }
        enforce_limits(table, entry);
    }

    fn remove(&mut self, fingerprint: &Fingerprint, id: &DocId) -> bool {
        let Self { table, entries } = self;
        let Some(entry) = entries.get_mut(fingerprint) else {
            return false;
        };
        if !entry.untrack(id) {
            return false;
        }
        table.release(&entry.collection, id, entry.id);
        true
    }

    fn evict(&mut self, fingerprint: &Fingerprint) -> bool {
        let Some(entry) = self.entries.remove(fingerprint) else {
            return false;
        };
        for id in entry.doc_ids.keys() {
            self.table.release(&entry.collection, id, entry.id);
        }
        true
    }

    fn set_timestamp(&mut self, fingerprint: &Fingerprint, subscriber: &SubscriberId, doc: &Document) {
        let Some(entry) = self.entries.get_mut(fingerprint) else {
            return;
        };
        let Some(sort) = &entry.sort else {
            return;
        };

        let value = get_path(doc, &sort.field).cloned().unwrap_or(Value::Null);
        entry.forget_subscriber(subscriber);
        entry
            .timestamps
            .entry(canonical_json(&value))
            .or_insert_with(|| Position {
                value,
                subscribers: HashSet::new(),
            })
            .subscribers
            .insert(subscriber.clone());
    }

    fn clear_timestamp(&mut self, fingerprint: &Fingerprint, subscriber: &SubscriberId) {
        if let Some(entry) = self.entries.get_mut(fingerprint) {
            entry.forget_subscriber(subscriber);
        }
    }
}

/// Answer a query from documents other entries already hold.
///
/// Only single-field equality, `$in` and `$nin` filters qualify. The result
/// must be complete: `limit` documents, or every id an `_id` filter names.
fn find_existing(table: &DocumentTable, entry: &CacheEntry, limit: Option<u64>) -> Vec<Arc<Document>> {
    let Some(filter) = SimpleFilter::parse(&entry.filter) else {
        return Vec::new();
    };

    let mut candidates: Vec<Arc<Document>> = table
        .scan(&entry.collection)
        .filter(|doc| filter.matches(doc))
        .cloned()
        .collect();
    if candidates.is_empty() {
        return candidates;
    }
    match &entry.sort {
        Some(sort) => candidates.sort_by(|a, b| sort.compare(a, b)),
        None => candidates.sort_by_key(|doc| DocId::of(doc)),
    }

    match limit {
        Some(limit) => {
            let limit = limit as usize;
            let found = trim(candidates, 0, limit);
            if found.len() < limit { Vec::new() } else { found }
        }
        None => match filter.requested_ids() {
            Some(ids) if ids.len() == candidates.len() => candidates,
            _ => Vec::new(),
        },
    }
}

/// Normalize ids and move documents behind shared pointers.
pub(crate) fn shared_documents(docs: Vec<Document>) -> Vec<Arc<Document>> {
    docs.into_iter()
        .map(|mut doc| {
            normalize_id(&mut doc);
            Arc::new(doc)
        })
        .collect()
}

/// Full-document lookup for one change, shared by every entry and subscriber
/// handling it so the store is asked at most once.
pub(crate) struct PointFetch<'a> {
    store: &'a dyn DocumentStore,
    collection: &'a str,
    id: &'a DocId,
    found: OnceCell<Result<Option<Arc<Document>>, StoreError>>,
}

impl<'a> PointFetch<'a> {
    pub(crate) fn new(store: &'a dyn DocumentStore, collection: &'a str, id: &'a DocId) -> Self {
        Self {
            store,
            collection,
            id,
            found: OnceCell::new(),
        }
    }

    /// The current document, fetched on first use. A failure is remembered
    /// too.
    pub(crate) async fn get(&self) -> Result<Option<Arc<Document>>, StoreError> {
        self.found
            .get_or_init(|| async {
                let found = self.store.find_one(self.collection, self.id).await?;
                Ok(found.and_then(|doc| shared_documents(vec![doc]).pop()))
            })
            .await
            .clone()
    }
}

/// Drop documents beyond the entry's limit: the oldest inserted ones, or the
/// ones sorting past the window when the entry has a sort.
fn enforce_limits(table: &mut DocumentTable, entry: &mut CacheEntry) {
    let Some(limit) = entry.limit.map(|limit| limit as usize) else {
        return;
    };
    if entry.doc_ids.len() <= limit {
        return;
    }

    let ordered = entry.ids_in_order();
    let overflow: Vec<DocId> = match &entry.sort {
        Some(sort) => {
            let mut ranked: Vec<(DocId, Option<Arc<Document>>)> = ordered
                .into_iter()
                .map(|id| {
                    let doc = table.get(&entry.collection, &id);
                    (id, doc)
                })
                .collect();
            ranked.sort_by(|(_, a), (_, b)| match (a, b) {
                (Some(a), Some(b)) => sort.compare(a, b),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            });
            ranked.into_iter().skip(limit).map(|(id, _)| id).collect()
        }
        None => {
            let excess = ordered.len() - limit;
            ordered.into_iter().take(excess).collect()
        }
    };

    for id in &overflow {
        entry.untrack(id);
        table.release(&entry.collection, id, entry.id);
    }
    counter!(METRIC_CACHE_EVICT).increment(overflow.len() as u64);
}

/// Bounded, reference-counted document cache keyed by query fingerprint.
pub struct DocumentCache {
    config: CacheConfig,
    store: Arc<dyn DocumentStore>,
    state: RwLock<CacheState>,
    locks: EntryLocks,
}

impl DocumentCache {
    pub fn new(config: &CacheConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            config: config.clone(),
            store,
            state: RwLock::new(CacheState::default()),
            locks: EntryLocks::new(config.lock_stripes_non_zero().get()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Take the entry's mutation lock.
    pub(crate) async fn lock<'a>(&'a self, fingerprint: &'a Fingerprint) -> EntryGuard<'a> {
        EntryGuard {
            cache: self,
            fingerprint,
            _guard: self.locks.lock(fingerprint).await,
        }
    }

    /// Read the cached view for a query, creating its entry on first use.
    ///
    /// Returns `None` when caching is disabled or the fingerprint is malformed.
    pub async fn get(&self, fingerprint: &Fingerprint, options: FetchOptions) -> Option<CacheView> {
        if !self.config.enabled {
            return None;
        }
        let options = FetchOptions {
            limit: options.limit.filter(|limit| *limit > 0),
            ..options
        };
        let entry = self.lock(fingerprint).await;
        let view = match entry.read(options) {
            Ok(view) => view,
            Err(err) => {
                warn!(fingerprint = %fingerprint, error = %err, "Ignoring malformed cache key");
                return None;
            }
        };

        match view.source {
            Some(source) => {
                counter!(METRIC_CACHE_HIT, "source" => source.as_str()).increment(1);
            }
            None => counter!(METRIC_CACHE_MISS).increment(1),
        }
        Some(view)
    }

    /// Add fetched documents to an existing entry and enforce its limit.
    pub async fn set(&self, fingerprint: &Fingerprint, docs: Vec<Document>) {
        if !self.config.enabled {
            return;
        }
        self.lock(fingerprint).await.store(docs);
    }

    /// Apply one change to an entry.
    ///
    /// Returns `None` when caching is disabled, the entry does not exist or the
    /// change carries no usable id. A failed point fetch purges the entry.
    pub async fn update(
        &self,
        fingerprint: &Fingerprint,
        mutation: Mutation,
    ) -> Result<Option<UpdateOutcome>, CacheError> {
        let Some(id) = mutation.id() else {
            return Ok(None);
        };
        let Some(collection) = self.snapshot(fingerprint).map(|entry| entry.collection) else {
            return Ok(None);
        };
        let fetch = PointFetch::new(self.store.as_ref(), &collection, &id);
        self.update_with(fingerprint, mutation, &fetch).await
    }

    /// [`DocumentCache::update`] resolving unknown documents through `fetch`.
    pub(crate) async fn update_with(
        &self,
        fingerprint: &Fingerprint,
        mutation: Mutation,
        fetch: &PointFetch<'_>,
    ) -> Result<Option<UpdateOutcome>, CacheError> {
        if !self.config.enabled {
            return Ok(None);
        }
        let entry = self.lock(fingerprint).await;
        let Some(before) = entry.snapshot() else {
            return Ok(None);
        };
        let Some(id) = mutation.id() else {
            return Ok(None);
        };
        let held = before.contains(&id);
        let mut everyone = None;
        let mut full_document = None;

        match mutation {
            Mutation::Insert(doc) | Mutation::Replace(doc) => {
                if evaluate(&before.filter, &doc).excludes() {
                    entry.remove(&id);
                } else {
                    entry.store(vec![doc]);
                }
            }
            Mutation::Delete(_) => {
                entry.remove(&id);
                everyone = Some(held);
            }
            Mutation::Update { delta, .. } => match self.document(&before.collection, &id) {
                Some(existing) => {
                    let mut merged = (*existing).clone();
                    delta.apply(&mut merged);
                    if evaluate(&before.filter, &merged).excludes() {
                        entry.remove(&id);
                    } else {
                        if !held {
                            full_document = Some(Arc::new(merged.clone()));
                        }
                        entry.store(vec![merged]);
                    }
                }
                None => match fetch.get().await {
                    Ok(Some(found)) => {
                        if !evaluate(&before.filter, &found).excludes() {
                            entry.store(vec![(*found).clone()]);
                            full_document = Some(found);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        entry.purge(PurgeReason::PointFetch, &err);
                        return Err(err.into());
                    }
                },
            },
        }

        Ok(Some(UpdateOutcome {
            entry: entry.snapshot().unwrap_or(before),
            everyone,
            full_document,
        }))
    }

    /// Remove an entry and release its pins.
    pub async fn delete(&self, fingerprint: &Fingerprint) -> bool {
        self.lock(fingerprint).await.evict()
    }

    /// Record the subscriber's last-seen sort position from `doc`.
    pub async fn set_timestamp(&self, fingerprint: &Fingerprint, subscriber: &SubscriberId, doc: &Document) {
        if !self.config.enabled {
            return;
        }
        self.lock(fingerprint).await.set_timestamp(subscriber, doc);
    }

    pub async fn clear_timestamp(&self, fingerprint: &Fingerprint, subscriber: &SubscriberId) {
        let _guard = self.locks.lock(fingerprint).await;
        rw_write(&self.state, SOURCE, "clear_timestamp").clear_timestamp(fingerprint, subscriber);
    }

    pub fn snapshot(&self, fingerprint: &Fingerprint) -> Option<EntrySnapshot> {
        rw_read(&self.state, SOURCE, "snapshot")
            .entries
            .get(fingerprint)
            .map(CacheEntry::snapshot)
    }

    pub fn document(&self, collection: &str, id: &DocId) -> Option<Arc<Document>> {
        rw_read(&self.state, SOURCE, "document").table.get(collection, id)
    }

    /// Number of entries currently holding the document.
    pub fn pin_count(&self, collection: &str, id: &DocId) -> usize {
        rw_read(&self.state, SOURCE, "pin_count")
            .table
            .pins
            .pin_count(collection, id)
    }

    pub fn entry_count(&self) -> usize {
        rw_read(&self.state, SOURCE, "entry_count").entries.len()
    }

    pub fn document_count(&self) -> usize {
        rw_read(&self.state, SOURCE, "document_count")
            .table
            .document_count()
    }

    /// Drop every entry and document.
    pub fn clear(&self) {
        let mut state = rw_write(&self.state, SOURCE, "clear");
        state.entries.clear();
        state.table.collections.clear();
        state.table.pins.clear();
    }
}

/// Exclusive access to one entry for the duration of a mutation sequence.
pub(crate) struct EntryGuard<'a> {
    cache: &'a DocumentCache,
    fingerprint: &'a Fingerprint,
    _guard: AsyncMutexGuard<'a, ()>,
}

impl EntryGuard<'_> {
    fn read(&self, options: FetchOptions) -> Result<CacheView, KeyError> {
        rw_write(&self.cache.state, SOURCE, "read").read(self.fingerprint, options)
    }

    pub(crate) fn snapshot(&self) -> Option<EntrySnapshot> {
        self.cache.snapshot(self.fingerprint)
    }

    pub(crate) fn store(&self, docs: Vec<Document>) {
        rw_write(&self.cache.state, SOURCE, "store").store(self.fingerprint, docs);
    }

    pub(crate) fn remove(&self, id: &DocId) -> bool {
        rw_write(&self.cache.state, SOURCE, "remove").remove(self.fingerprint, id)
    }

    pub(crate) fn set_timestamp(&self, subscriber: &SubscriberId, doc: &Document) {
        rw_write(&self.cache.state, SOURCE, "set_timestamp").set_timestamp(
            self.fingerprint,
            subscriber,
            doc,
        );
    }

    pub(crate) fn evict(&self) -> bool {
        rw_write(&self.cache.state, SOURCE, "evict").evict(self.fingerprint)
    }

    /// Drop the entry after a failure so the next read refetches it.
    pub(crate) fn purge(&self, reason: PurgeReason, err: &dyn fmt::Display) {
        self.evict();
        counter!(METRIC_CACHE_PURGE, "reason" => reason.as_str()).increment(1);
        if self.cache.config.debug {
            warn!(
                fingerprint = %self.fingerprint,
                reason = reason.as_str(),
                error = %err,
                "Purged cache entry"
            );
        } else {
            debug!(
                fingerprint = %self.fingerprint,
                reason = reason.as_str(),
                error = %err,
                "Purged cache entry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::application::store::{ChangeStream, StoreQuery, WatchPipeline};

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    /// Store answering point fetches from a fixed list.
    #[derive(Default)]
    struct FixedStore {
        docs: Vec<Document>,
        fail: bool,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl DocumentStore for FixedStore {
        async fn find(&self, _query: &StoreQuery) -> Result<Vec<Document>, StoreError> {
            Ok(Vec::new())
        }

        async fn find_one(&self, _collection: &str, id: &DocId) -> Result<Option<Document>, StoreError> {
            self.fetches.fetch_add(1, AtomicOrdering::SeqCst);
            if self.fail {
                return Err(StoreError::Unavailable("offline".to_string()));
            }
            Ok(self.docs.iter().find(|doc| DocId::of(doc).as_ref() == Some(id)).cloned())
        }

        async fn watch(&self, _collection: &str, _pipeline: &WatchPipeline) -> Result<ChangeStream, StoreError> {
            Err(StoreError::Closed)
        }
    }

    fn cache_with(docs: Vec<Document>, fail: bool) -> DocumentCache {
        DocumentCache::new(
            &CacheConfig::default(),
            Arc::new(FixedStore {
                docs,
                fail,
                ..FixedStore::default()
            }),
        )
    }

    fn limited(limit: u64) -> FetchOptions {
        FetchOptions {
            skip: None,
            limit: Some(limit),
        }
    }

    fn ids(view: &CacheView) -> Vec<String> {
        view.docs
            .iter()
            .filter_map(|doc| DocId::of(doc))
            .map(|id| id.to_string())
            .collect()
    }

    #[tokio::test]
    async fn first_read_is_a_miss_then_set_fills_entry() {
        let cache = cache_with(Vec::new(), false);
        let key = Fingerprint::new("posts", &doc(json!({"owner": "u1"})), None);

        let view = cache.get(&key, FetchOptions::default()).await.expect("view");
        assert!(!view.is_hit());
        assert_eq!(cache.entry_count(), 1);

        cache
            .set(&key, vec![doc(json!({"_id": "a", "owner": "u1"})), doc(json!({"title": "no id"}))])
            .await;
        let view = cache.get(&key, FetchOptions::default()).await.expect("view");
        assert_eq!(view.source, Some(HitSource::Entry));
        assert_eq!(ids(&view), vec!["a"]);
        assert_eq!(cache.pin_count("posts", &DocId::new("a")), 1);
    }

    #[tokio::test]
    async fn disabled_cache_never_answers() {
        let cache = DocumentCache::new(
            &CacheConfig::disabled(),
            Arc::new(FixedStore::default()),
        );
        let key = Fingerprint::new("posts", &Document::new(), None);
        assert!(cache.get(&key, FetchOptions::default()).await.is_none());
        cache.set(&key, vec![doc(json!({"_id": "a"}))]).await;
        assert_eq!(cache.document_count(), 0);
    }

    #[tokio::test]
    async fn skipped_pages_are_not_cached() {
        let cache = cache_with(Vec::new(), false);
        let key = Fingerprint::new("posts", &Document::new(), None);
        let options = FetchOptions {
            skip: Some(10),
            limit: Some(5),
        };
        assert!(!cache.get(&key, options).await.expect("view").is_hit());
        cache.set(&key, vec![doc(json!({"_id": "a"}))]).await;
        assert_eq!(cache.document_count(), 0);
    }

    #[tokio::test]
    async fn unsorted_limit_drops_oldest() {
        let cache = cache_with(Vec::new(), false);
        let key = Fingerprint::new("posts", &Document::new(), None);
        cache.get(&key, limited(2)).await;
        cache
            .set(&key, vec![doc(json!({"_id": "a"})), doc(json!({"_id": "b"}))])
            .await;
        cache.set(&key, vec![doc(json!({"_id": "c"}))]).await;

        let snapshot = cache.snapshot(&key).expect("entry");
        assert_eq!(snapshot.doc_ids, vec![DocId::new("b"), DocId::new("c")]);
        assert!(cache.document("posts", &DocId::new("a")).is_none());
    }

    #[tokio::test]
    async fn sorted_limit_keeps_window() {
        let cache = cache_with(Vec::new(), false);
        let key = Fingerprint::new("posts", &Document::new(), Some(&SortSpec::descending("t")));
        cache.get(&key, limited(2)).await;
        cache
            .set(
                &key,
                vec![
                    doc(json!({"_id": "a", "t": 3})),
                    doc(json!({"_id": "b", "t": 1})),
                    doc(json!({"_id": "c", "t": 2})),
                ],
            )
            .await;

        let view = cache.get(&key, limited(2)).await.expect("view");
        assert_eq!(ids(&view), vec!["a", "c"]);
        assert!(cache.document("posts", &DocId::new("b")).is_none());
    }

    #[tokio::test]
    async fn shared_documents_survive_one_entry_eviction() {
        let cache = cache_with(Vec::new(), false);
        let first = Fingerprint::new("posts", &doc(json!({"owner": "u1"})), None);
        let second = Fingerprint::new("posts", &Document::new(), None);
        cache.get(&first, FetchOptions::default()).await;
        cache.get(&second, FetchOptions::default()).await;
        cache.set(&first, vec![doc(json!({"_id": "a", "owner": "u1"}))]).await;
        cache.set(&second, vec![doc(json!({"_id": "a", "owner": "u1"}))]).await;
        assert_eq!(cache.pin_count("posts", &DocId::new("a")), 2);

        assert!(cache.delete(&first).await);
        assert_eq!(cache.pin_count("posts", &DocId::new("a")), 1);
        assert!(cache.document("posts", &DocId::new("a")).is_some());

        assert!(cache.delete(&second).await);
        assert!(cache.document("posts", &DocId::new("a")).is_none());
        assert!(!cache.delete(&second).await);
    }

    #[tokio::test]
    async fn id_filter_is_answered_from_other_entries() {
        let cache = cache_with(Vec::new(), false);
        let all = Fingerprint::new("posts", &Document::new(), None);
        cache.get(&all, FetchOptions::default()).await;
        cache
            .set(&all, vec![doc(json!({"_id": "a"})), doc(json!({"_id": "b"}))])
            .await;

        let one = Fingerprint::new("posts", &doc(json!({"_id": "a"})), None);
        let view = cache.get(&one, FetchOptions::default()).await.expect("view");
        assert_eq!(view.source, Some(HitSource::Scan));
        assert_eq!(ids(&view), vec!["a"]);
        assert_eq!(cache.pin_count("posts", &DocId::new("a")), 2);

        let partial = Fingerprint::new("posts", &doc(json!({"_id": {"$in": ["a", "z"]}})), None);
        assert!(!cache.get(&partial, FetchOptions::default()).await.expect("view").is_hit());
    }

    #[tokio::test]
    async fn scan_requires_limit_to_be_satisfied() {
        let cache = cache_with(Vec::new(), false);
        let all = Fingerprint::new("posts", &Document::new(), None);
        cache.get(&all, FetchOptions::default()).await;
        cache
            .set(&all, vec![doc(json!({"_id": "a", "owner": "u1"}))])
            .await;

        let owned = Fingerprint::new("posts", &doc(json!({"owner": "u1"})), None);
        assert!(!cache.get(&owned, limited(2)).await.expect("view").is_hit());
        let owned_one = Fingerprint::new("posts", &doc(json!({"owner": {"$in": ["u1"]}})), None);
        assert!(cache.get(&owned_one, limited(1)).await.expect("view").is_hit());
    }

    #[tokio::test]
    async fn malformed_fingerprint_reads_as_absent() {
        let cache = cache_with(Vec::new(), false);
        assert!(
            cache
                .get(&Fingerprint::from_raw("{broken"), FetchOptions::default())
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn delete_reports_membership() {
        let cache = cache_with(Vec::new(), false);
        let key = Fingerprint::new("posts", &Document::new(), None);
        cache.get(&key, FetchOptions::default()).await;
        cache.set(&key, vec![doc(json!({"_id": "a"}))]).await;

        let outcome = cache
            .update(&key, Mutation::Delete(DocId::new("a")))
            .await
            .expect("update")
            .expect("outcome");
        assert_eq!(outcome.everyone, Some(true));
        assert!(outcome.entry.is_empty());

        let outcome = cache
            .update(&key, Mutation::Delete(DocId::new("zzz")))
            .await
            .expect("update")
            .expect("outcome");
        assert_eq!(outcome.everyone, Some(false));
    }

    #[tokio::test]
    async fn update_merges_cached_document() {
        let cache = cache_with(Vec::new(), false);
        let key = Fingerprint::new("posts", &Document::new(), None);
        cache.get(&key, FetchOptions::default()).await;
        cache.set(&key, vec![doc(json!({"_id": "a", "title": "old", "draft": true}))]).await;

        let outcome = cache
            .update(
                &key,
                Mutation::Update {
                    id: DocId::new("a"),
                    delta: FieldDelta::new(doc(json!({"title": "new"})), vec!["draft".to_string()]),
                },
            )
            .await
            .expect("update")
            .expect("outcome");
        assert!(outcome.full_document.is_none());
        let stored = cache.document("posts", &DocId::new("a")).expect("doc");
        assert_eq!(*stored, doc(json!({"_id": "a", "title": "new"})));
    }

    #[tokio::test]
    async fn update_of_unknown_document_fetches_it() {
        let cache = cache_with(vec![doc(json!({"_id": "x", "title": "fetched"}))], false);
        let key = Fingerprint::new("posts", &Document::new(), None);
        cache.get(&key, FetchOptions::default()).await;

        let outcome = cache
            .update(
                &key,
                Mutation::Update {
                    id: DocId::new("x"),
                    delta: FieldDelta::default(),
                },
            )
            .await
            .expect("update")
            .expect("outcome");
        let full = outcome.full_document.expect("full document");
        assert_eq!(full.get("title"), Some(&json!("fetched")));
        assert!(outcome.entry.contains(&DocId::new("x")));
    }

    #[tokio::test]
    async fn entries_share_one_point_fetch_per_change() {
        let store = Arc::new(FixedStore {
            docs: vec![doc(json!({"_id": "x", "owner": "u9"}))],
            ..FixedStore::default()
        });
        let cache = DocumentCache::new(&CacheConfig::default(), Arc::clone(&store) as Arc<dyn DocumentStore>);
        let keys: Vec<Fingerprint> = ["u1", "u2", "u9"]
            .iter()
            .map(|owner| Fingerprint::new("posts", &doc(json!({"owner": owner})), None))
            .collect();
        for key in &keys {
            cache.get(key, FetchOptions::default()).await;
        }

        let id = DocId::new("x");
        let fetch = PointFetch::new(store.as_ref(), "posts", &id);
        for key in &keys {
            let mutation = Mutation::Update {
                id: id.clone(),
                delta: FieldDelta::default(),
            };
            cache.update_with(key, mutation, &fetch).await.expect("update");
        }

        assert_eq!(store.fetches.load(AtomicOrdering::SeqCst), 1);
        assert!(!cache.snapshot(&keys[0]).expect("entry").contains(&id));
        assert!(cache.snapshot(&keys[2]).expect("entry").contains(&id));
    }

    #[tokio::test]
    async fn failed_point_fetch_purges_entry() {
        let cache = cache_with(Vec::new(), true);
        let key = Fingerprint::new("posts", &Document::new(), None);
        cache.get(&key, FetchOptions::default()).await;
        cache.set(&key, vec![doc(json!({"_id": "a"}))]).await;

        let result = cache
            .update(
                &key,
                Mutation::Update {
                    id: DocId::new("x"),
                    delta: FieldDelta::default(),
                },
            )
            .await;
        assert!(matches!(result, Err(CacheError::Store(_))));
        assert!(cache.snapshot(&key).is_none());
        assert_eq!(cache.document_count(), 0);
    }

    #[tokio::test]
    async fn inserts_outside_the_filter_are_not_cached() {
        let cache = cache_with(Vec::new(), false);
        let key = Fingerprint::new("posts", &doc(json!({"owner": "u1"})), None);
        cache.get(&key, FetchOptions::default()).await;

        cache
            .update(&key, Mutation::Insert(doc(json!({"_id": "a", "owner": "u2"}))))
            .await
            .expect("update");
        assert!(cache.snapshot(&key).expect("entry").is_empty());

        cache
            .update(&key, Mutation::Insert(doc(json!({"_id": "b", "owner": "u1"}))))
            .await
            .expect("update");
        assert!(cache.snapshot(&key).expect("entry").contains(&DocId::new("b")));
    }

    #[tokio::test]
    async fn timestamps_track_one_position_per_subscriber() {
        let cache = cache_with(Vec::new(), false);
        let key = Fingerprint::new("posts", &Document::new(), Some(&SortSpec::descending("t")));
        cache.get(&key, limited(2)).await;
        let subscriber = SubscriberId::new("s1");

        cache.set_timestamp(&key, &subscriber, &doc(json!({"_id": "a", "t": 5}))).await;
        cache.set_timestamp(&key, &subscriber, &doc(json!({"_id": "b", "t": 3}))).await;
        let snapshot = cache.snapshot(&key).expect("entry");
        assert_eq!(snapshot.timestamps.len(), 1);
        assert_eq!(snapshot.timestamp_of(&subscriber), Some(&json!(3)));

        cache.clear_timestamp(&key, &subscriber).await;
        assert!(cache.snapshot(&key).expect("entry").timestamps.is_empty());
    }
}
