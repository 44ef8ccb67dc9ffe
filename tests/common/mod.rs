#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use flusso::application::query::FetchDescription;
use flusso::cache::{
    CacheConfig, CacheService, SessionId, StreamHandle, StreamRequest, StreamStart, SubscriberId,
};
use flusso::domain::document::Document;
use flusso::infra::memory::MemoryStore;
use flusso::infra::recording::RecordingDelivery;
use serde_json::Value;

pub const WAIT: Duration = Duration::from_secs(2);

pub fn doc(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

/// Config with a short debounce so refills land quickly in tests.
pub fn fast_config() -> CacheConfig {
    CacheConfig {
        backfill_debounce_ms: 10,
        ..CacheConfig::default()
    }
}

pub fn service(config: CacheConfig) -> (Arc<MemoryStore>, CacheService) {
    let store = Arc::new(MemoryStore::new());
    let service = CacheService::new(config, store.clone());
    (store, service)
}

pub struct Subscription {
    pub start: StreamStart,
    pub delivery: Arc<RecordingDelivery>,
}

impl Subscription {
    pub fn handle(&self) -> StreamHandle {
        self.start.handle.clone()
    }
}

pub async fn subscribe(
    service: &CacheService,
    subscriber: &str,
    session: &str,
    caller: Option<Value>,
    fetch: FetchDescription,
) -> Subscription {
    let delivery = Arc::new(RecordingDelivery::strict());
    let start = service
        .stream(StreamRequest {
            subscriber_id: SubscriberId::new(subscriber),
            session_id: SessionId::new(session),
            caller,
            fetch,
            delivery: delivery.clone(),
        })
        .await
        .expect("stream starts");
    delivery.acknowledge(&start.docs);
    Subscription { start, delivery }
}

/// Poll `condition` until it holds or the wait budget runs out.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
