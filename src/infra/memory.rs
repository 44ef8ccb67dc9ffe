//! In-process document store with change feeds.
//!
//! Backs the `simulate` command and the test suites. Writes are applied
//! synchronously and each one is published to every open watch on the
//! collection whose pipeline admits it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;

use crate::application::store::{
    ChangeEvent, ChangeKind, ChangeStream, DocumentStore, StoreError, StoreQuery, WatchPipeline,
};
use crate::cache::lock::mutex_lock;
use crate::domain::document::{DocId, Document, FieldDelta, ID_FIELD, normalize_id};
use crate::domain::filter::{FULL_DOCUMENT_PREFIX, evaluate, parse_filter};
use crate::domain::sort::trim;

const SOURCE: &str = "infra::memory";

type EventSender = mpsc::UnboundedSender<Result<ChangeEvent, StoreError>>;

struct Watcher {
    collection: String,
    pipeline: WatchPipeline,
    sender: EventSender,
}

#[derive(Default)]
struct MemoryState {
    collections: HashMap<String, BTreeMap<DocId, Document>>,
    watchers: Vec<Watcher>,
    queries: Vec<StoreQuery>,
}

#[derive(Debug, Default)]
struct WatchCounters {
    opened: AtomicUsize,
    closed: AtomicUsize,
}

/// Decrements the live watch count when its stream is dropped.
struct WatchGuard(Arc<WatchCounters>);

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.0.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    counters: Arc<WatchCounters>,
    point_fetches: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load documents without publishing change events.
    pub fn seed(&self, collection: &str, docs: Vec<Document>) {
        let mut state = mutex_lock(&self.state, SOURCE, "seed");
        let table = state.collections.entry(collection.to_string()).or_default();
        for mut doc in docs {
            if let Some(id) = normalize_id(&mut doc) {
                table.insert(id, doc);
            }
        }
    }

    /// Insert a document and publish an insert event. Returns the new id.
    pub fn insert(&self, collection: &str, mut doc: Document) -> Option<DocId> {
        let id = normalize_id(&mut doc)?;
        let mut state = mutex_lock(&self.state, SOURCE, "insert");
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.clone(), doc.clone());
        state.publish(
            collection,
            ChangeEvent {
                collection: collection.to_string(),
                document_key: Some(id.to_value()),
                kind: ChangeKind::Insert { full_document: doc },
            },
        );
        Some(id)
    }

    /// Apply a field-level update. Returns false when the document is absent.
    pub fn update(&self, collection: &str, id: &DocId, delta: FieldDelta) -> bool {
        let mut state = mutex_lock(&self.state, SOURCE, "update");
        let Some(existing) = state
            .collections
            .get_mut(collection)
            .and_then(|table| table.get_mut(id))
        else {
            return false;
        };
        delta.apply(existing);
        state.publish(
            collection,
            ChangeEvent {
                collection: collection.to_string(),
                document_key: Some(id.to_value()),
                kind: ChangeKind::Update {
                    updated_fields: delta.set,
                    removed_fields: delta.unset,
                },
            },
        );
        true
    }

    /// Replace a document wholesale. Returns false when the document is absent.
    pub fn replace(&self, collection: &str, mut doc: Document) -> bool {
        let Some(id) = normalize_id(&mut doc) else {
            return false;
        };
        let mut state = mutex_lock(&self.state, SOURCE, "replace");
        let Some(existing) = state
            .collections
            .get_mut(collection)
            .and_then(|table| table.get_mut(&id))
        else {
            return false;
        };
        *existing = doc.clone();
        state.publish(
            collection,
            ChangeEvent {
                collection: collection.to_string(),
                document_key: Some(id.to_value()),
                kind: ChangeKind::Replace { full_document: doc },
            },
        );
        true
    }

    pub fn delete(&self, collection: &str, id: &DocId) -> bool {
        let mut state = mutex_lock(&self.state, SOURCE, "delete");
        let removed = state
            .collections
            .get_mut(collection)
            .and_then(|table| table.remove(id))
            .is_some();
        if removed {
            state.publish(
                collection,
                ChangeEvent {
                    collection: collection.to_string(),
                    document_key: Some(id.to_value()),
                    kind: ChangeKind::Delete,
                },
            );
        }
        removed
    }

    /// Drop a whole collection; open watches receive a drop event.
    pub fn drop_collection(&self, collection: &str) {
        let mut state = mutex_lock(&self.state, SOURCE, "drop_collection");
        state.collections.remove(collection);
        state.publish(
            collection,
            ChangeEvent {
                collection: collection.to_string(),
                document_key: None,
                kind: ChangeKind::Drop,
            },
        );
    }

    /// Terminate every open watch on `collection` with an error.
    pub fn break_watches(&self, collection: &str) {
        let mut state = mutex_lock(&self.state, SOURCE, "break_watches");
        state.watchers.retain(|watcher| {
            if watcher.collection != collection {
                return true;
            }
            let _ = watcher.sender.send(Err(StoreError::Closed));
            false
        });
    }

    /// Make every subsequent read fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every `find` received so far, oldest first.
    pub fn queries(&self) -> Vec<StoreQuery> {
        mutex_lock(&self.state, SOURCE, "queries").queries.clone()
    }

    pub fn point_fetches(&self) -> usize {
        self.point_fetches.load(Ordering::SeqCst)
    }

    pub fn watches_opened(&self) -> usize {
        self.counters.opened.load(Ordering::SeqCst)
    }

    pub fn active_watches(&self) -> usize {
        self.watches_opened() - self.counters.closed.load(Ordering::SeqCst)
    }

    pub fn get(&self, collection: &str, id: &DocId) -> Option<Document> {
        mutex_lock(&self.state, SOURCE, "get")
            .collections
            .get(collection)
            .and_then(|table| table.get(id))
            .cloned()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".to_string()));
        }
        Ok(())
    }
}

impl MemoryState {
    fn publish(&mut self, collection: &str, event: ChangeEvent) {
        let envelope = event_document(&event);
        self.watchers.retain(|watcher| {
            if watcher.collection != collection {
                return true;
            }
            if evaluate(&watcher.pipeline.match_expression, &envelope).excludes() {
                return !watcher.sender.is_closed();
            }
            let shaped = project_event(event.clone(), watcher.pipeline.projection.as_ref());
            watcher.sender.send(Ok(shaped)).is_ok()
        });
    }
}

/// The event as the change-feed match expression sees it.
fn event_document(event: &ChangeEvent) -> Document {
    let mut envelope = Document::new();
    envelope.insert(
        "operationType".to_string(),
        Value::String(event.operation().as_str().to_string()),
    );
    if let Some(key) = &event.document_key {
        let mut document_key = Document::new();
        document_key.insert(ID_FIELD.to_string(), key.clone());
        envelope.insert("documentKey".to_string(), Value::Object(document_key));
    }
    match &event.kind {
        ChangeKind::Insert { full_document } | ChangeKind::Replace { full_document } => {
            envelope.insert(
                "fullDocument".to_string(),
                Value::Object(full_document.clone()),
            );
        }
        ChangeKind::Update {
            updated_fields,
            removed_fields,
        } => {
            envelope.insert(
                "updateDescription".to_string(),
                json!({
                    "updatedFields": updated_fields,
                    "removedFields": removed_fields,
                }),
            );
        }
        _ => {}
    }
    envelope
}

fn project_event(mut event: ChangeEvent, projection: Option<&Document>) -> ChangeEvent {
    let Some(projection) = projection else {
        return event;
    };
    let unprefixed: Document = projection
        .iter()
        .filter_map(|(field, value)| {
            field
                .strip_prefix(FULL_DOCUMENT_PREFIX)
                .map(|field| (field.to_string(), value.clone()))
        })
        .collect();
    if let ChangeKind::Insert { full_document } | ChangeKind::Replace { full_document } =
        &mut event.kind
    {
        *full_document = project(full_document, &unprefixed);
    }
    event
}

fn is_inclusion(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        _ => true,
    }
}

/// Apply an inclusion or exclusion projection to top-level fields.
fn project(doc: &Document, projection: &Document) -> Document {
    if projection.is_empty() {
        return doc.clone();
    }
    let inclusive = projection
        .iter()
        .filter(|(field, _)| field.as_str() != ID_FIELD)
        .any(|(_, value)| is_inclusion(value));
    let keep_id = projection.get(ID_FIELD).is_none_or(is_inclusion);

    doc.iter()
        .filter(|(field, _)| {
            if field.as_str() == ID_FIELD {
                return keep_id;
            }
            match projection.get(field.as_str()) {
                Some(value) => is_inclusion(value),
                None => !inclusive,
            }
        })
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect()
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn find(&self, query: &StoreQuery) -> Result<Vec<Document>, StoreError> {
        self.check_available()?;
        let expression = parse_filter(&query.filter).map_err(StoreError::from_query)?;

        let mut state = mutex_lock(&self.state, SOURCE, "find");
        state.queries.push(query.clone());
        let mut matched: Vec<&Document> = state
            .collections
            .get(&query.collection)
            .map(|table| table.values().filter(|doc| expression.matches(doc)).collect())
            .unwrap_or_default();

        if let Some(sort) = &query.sort {
            matched.sort_by(|a, b| sort.compare(a, b));
        }
        let skip = query.skip.unwrap_or(0) as usize;
        let limit = query.limit.map_or(usize::MAX, |limit| limit as usize);
        let docs = trim(matched, skip, limit)
            .into_iter()
            .map(|doc| match &query.projection {
                Some(projection) => project(doc, projection),
                None => doc.clone(),
            })
            .collect::<Vec<_>>();
        debug!(collection = %query.collection, count = docs.len(), "Served find");
        Ok(docs)
    }

    async fn find_one(&self, collection: &str, id: &DocId) -> Result<Option<Document>, StoreError> {
        self.check_available()?;
        self.point_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.get(collection, id))
    }

    async fn watch(&self, collection: &str, pipeline: &WatchPipeline) -> Result<ChangeStream, StoreError> {
        self.check_available()?;
        let (sender, receiver) = mpsc::unbounded_channel();
        mutex_lock(&self.state, SOURCE, "watch").watchers.push(Watcher {
            collection: collection.to_string(),
            pipeline: pipeline.clone(),
            sender,
        });
        self.counters.opened.fetch_add(1, Ordering::SeqCst);

        let guard = WatchGuard(Arc::clone(&self.counters));
        let events = stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
            receiver.recv().await.map(|event| (event, (receiver, guard)))
        });
        Ok(Box::pin(events))
    }
}
