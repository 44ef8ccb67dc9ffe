mod common;

use std::time::Duration;

use flusso::application::query::FetchDescription;
use flusso::cache::{CacheConfig, SubscriberId};
use flusso::domain::document::DocId;
use flusso::domain::sort::SortSpec;
use flusso::infra::memory::MemoryStore;
use serde_json::json;

use common::{WAIT, doc, eventually, fast_config, service, subscribe};

fn seed_ranked(store: &MemoryStore, ranks: &[(&str, i64)]) {
    store.seed(
        "posts",
        ranks
            .iter()
            .map(|(id, t)| doc(json!({"_id": id, "t": t})))
            .collect(),
    );
}

fn top(limit: u64) -> FetchDescription {
    FetchDescription::new("posts")
        .with_sort(SortSpec::descending("t"))
        .with_limit(limit)
}

fn ids(values: &[&str]) -> Vec<DocId> {
    values.iter().map(|id| DocId::new(*id)).collect()
}

fn slow_config() -> CacheConfig {
    CacheConfig {
        backfill_debounce_ms: 100,
        ..CacheConfig::default()
    }
}

#[tokio::test]
async fn deleted_window_document_is_replaced_by_the_next_one() {
    let (store, service) = service(fast_config());
    seed_ranked(&store, &[("A", 3), ("B", 2), ("C", 1), ("D", 0)]);
    let fetch = top(2);

    let reader = subscribe(&service, "s1", "session-1", None, fetch.clone()).await;
    assert_eq!(reader.start.docs.len(), 2);

    store.delete("posts", &DocId::new("A"));

    assert!(reader.delivery.wait_for(2, WAIT).await);
    assert_eq!(reader.delivery.removed_ids(), ids(&["A"]));
    assert_eq!(reader.delivery.added_ids(), ids(&["C"]));

    let queries = store.queries();
    assert_eq!(queries.len(), 2);
    let refill = &queries[1];
    assert_eq!(refill.limit, Some(1));
    assert_eq!(refill.filter, doc(json!({"_id": {"$nin": ["B"]}})));

    let entry = service.cache().snapshot(&fetch.fingerprint()).expect("entry");
    assert_eq!(entry.len(), 2);
    assert!(entry.contains(&DocId::new("B")));
    assert!(entry.contains(&DocId::new("C")));
}

#[tokio::test]
async fn paginated_subscriber_refills_from_its_position() {
    let (store, service) = service(fast_config());
    seed_ranked(&store, &[("A", 3), ("B", 2), ("C", 1), ("D", 0)]);
    let fetch = top(2).paginated();

    let reader = subscribe(&service, "s1", "session-1", None, fetch.clone()).await;
    let entry = service.cache().snapshot(&fetch.fingerprint()).expect("entry");
    assert_eq!(
        entry.timestamp_of(&SubscriberId::new("s1")),
        Some(&json!(2))
    );

    store.delete("posts", &DocId::new("A"));

    assert!(reader.delivery.wait_for(2, WAIT).await);
    assert_eq!(reader.delivery.added_ids(), ids(&["C"]));

    assert!(
        eventually(|| {
            service
                .cache()
                .snapshot(&fetch.fingerprint())
                .and_then(|entry| entry.timestamp_of(&SubscriberId::new("s1")).cloned())
                == Some(json!(1))
        })
        .await
    );
    let queries = store.queries();
    let positional = &queries[1];
    assert_eq!(positional.limit, Some(1));
    assert_eq!(positional.filter, doc(json!({"t": {"$lt": 2}})));
}

#[tokio::test]
async fn burst_of_deletes_is_refilled_by_one_query() {
    let (store, service) = service(slow_config());
    seed_ranked(
        &store,
        &[("p1", 1), ("p2", 2), ("p3", 3), ("p4", 4), ("p5", 5), ("p6", 6)],
    );
    let fetch = top(3);
    let reader = subscribe(&service, "s1", "session-1", None, fetch.clone()).await;

    store.delete("posts", &DocId::new("p6"));
    store.delete("posts", &DocId::new("p5"));
    assert!(reader.delivery.wait_for(2, WAIT).await);
    assert_eq!(
        service.backfill().pending_deletes(&fetch.fingerprint()),
        Some(2)
    );

    assert!(reader.delivery.wait_for(4, WAIT).await);
    assert_eq!(reader.delivery.removed_ids(), ids(&["p6", "p5"]));
    assert_eq!(reader.delivery.added_ids(), ids(&["p3", "p2"]));

    let queries = store.queries();
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[1].limit, Some(2));
    assert_eq!(service.backfill().pending_deletes(&fetch.fingerprint()), None);
    assert_eq!(
        service.cache().snapshot(&fetch.fingerprint()).expect("entry").len(),
        3
    );
}

#[tokio::test]
async fn delete_outside_any_window_needs_no_refill() {
    let (store, service) = service(fast_config());
    seed_ranked(&store, &[("A", 3), ("B", 2), ("C", 1)]);
    let fetch = FetchDescription::new("posts").with_filter(doc(json!({"t": {"$gte": 2}})));
    let reader = subscribe(&service, "s1", "session-1", None, fetch.clone()).await;

    store.delete("posts", &DocId::new("A"));

    assert!(reader.delivery.wait_for(1, WAIT).await);
    assert_eq!(reader.delivery.removed_ids(), ids(&["A"]));
    assert_eq!(service.backfill().pending_deletes(&fetch.fingerprint()), None);
    assert_eq!(store.queries().len(), 1);
}

#[tokio::test]
async fn failed_refill_purges_the_entry() {
    let (store, service) = service(slow_config());
    seed_ranked(&store, &[("A", 3), ("B", 2), ("C", 1)]);
    let fetch = top(2);
    let reader = subscribe(&service, "s1", "session-1", None, fetch.clone()).await;

    store.delete("posts", &DocId::new("A"));
    assert!(reader.delivery.wait_for(1, WAIT).await);
    store.set_failing(true);

    assert!(eventually(|| service.cache().snapshot(&fetch.fingerprint()).is_none()).await);
    assert!(service.cache().document("posts", &DocId::new("B")).is_none());
    assert_eq!(reader.delivery.added_ids(), Vec::<DocId>::new());
}

#[tokio::test]
async fn unsubscribing_before_the_refill_cancels_it() {
    let (store, service) = service(slow_config());
    seed_ranked(&store, &[("A", 3), ("B", 2), ("C", 1)]);
    let fetch = top(2);
    let reader = subscribe(&service, "s1", "session-1", None, fetch.clone()).await;

    store.delete("posts", &DocId::new("A"));
    assert!(reader.delivery.wait_for(1, WAIT).await);
    service.unsubscribe(reader.handle()).await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(service.backfill().pending_deletes(&fetch.fingerprint()), None);
    assert_eq!(store.queries().len(), 1);
    assert_eq!(reader.delivery.len(), 1);
    assert!(service.cache().snapshot(&fetch.fingerprint()).is_none());
    assert_eq!(service.cache().entry_count(), 0);
}
