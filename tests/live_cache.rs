mod common;

use std::sync::Arc;

use flusso::application::query::{FetchDescription, FetchOptions};
use flusso::cache::{CacheConfig, DocumentCache, Fingerprint, Mutation};
use flusso::domain::document::{DocId, Document, FieldDelta};
use flusso::domain::sort::SortSpec;
use flusso::infra::memory::MemoryStore;
use serde_json::json;

use common::{doc, fast_config, service, subscribe};

fn unbounded() -> FetchOptions {
    FetchOptions::default()
}

fn limited(limit: u64) -> FetchOptions {
    FetchOptions {
        skip: None,
        limit: Some(limit),
    }
}

#[tokio::test]
async fn shared_document_lives_until_its_last_pin_is_released() {
    let store = Arc::new(MemoryStore::new());
    let cache = DocumentCache::new(&CacheConfig::default(), store);
    let open = Fingerprint::new("tasks", &doc(json!({"status": "open"})), None);
    let picked = Fingerprint::new(
        "tasks",
        &doc(json!({"_id": {"$in": ["id1", "id2"]}})),
        None,
    );
    let id1 = DocId::new("id1");

    cache.get(&open, unbounded()).await;
    cache
        .set(
            &open,
            vec![
                doc(json!({"_id": "id1", "status": "open"})),
                doc(json!({"_id": "id3", "status": "open"})),
            ],
        )
        .await;
    cache.get(&picked, unbounded()).await;
    cache
        .set(
            &picked,
            vec![
                doc(json!({"_id": "id1", "status": "open"})),
                doc(json!({"_id": "id2", "status": "closed"})),
            ],
        )
        .await;
    assert_eq!(cache.pin_count("tasks", &id1), 2);

    let outcome = cache
        .update(&open, Mutation::Delete(id1.clone()))
        .await
        .expect("update")
        .expect("entry exists");
    assert_eq!(outcome.everyone, Some(true));
    assert!(!outcome.entry.contains(&id1));
    assert!(cache.document("tasks", &id1).is_some());
    assert_eq!(cache.pin_count("tasks", &id1), 1);

    assert!(cache.delete(&picked).await);
    assert!(cache.document("tasks", &id1).is_none());
    assert!(cache.document("tasks", &DocId::new("id2")).is_none());
    assert!(cache.document("tasks", &DocId::new("id3")).is_some());

    assert!(cache.delete(&open).await);
    assert_eq!(cache.document_count(), 0);
}

#[tokio::test]
async fn limited_entries_never_exceed_their_limit() {
    let store = Arc::new(MemoryStore::new());
    let cache = DocumentCache::new(&CacheConfig::default(), store);
    let newest = Fingerprint::new("posts", &Document::new(), Some(&SortSpec::descending("t")));

    cache.get(&newest, limited(3)).await;
    cache
        .set(
            &newest,
            (1..=6)
                .map(|n| doc(json!({"_id": format!("p{n}"), "t": n})))
                .collect(),
        )
        .await;

    let entry = cache.snapshot(&newest).expect("entry");
    assert_eq!(entry.len(), 3);
    for id in ["p6", "p5", "p4"] {
        assert!(entry.contains(&DocId::new(id)), "missing {id}");
    }
    assert_eq!(cache.document_count(), 3);

    cache
        .update(&newest, Mutation::Insert(doc(json!({"_id": "p7", "t": 7}))))
        .await
        .expect("update");
    let entry = cache.snapshot(&newest).expect("entry");
    assert_eq!(entry.len(), 3);
    assert!(entry.contains(&DocId::new("p7")));
    assert!(!entry.contains(&DocId::new("p4")));
    assert!(cache.document("posts", &DocId::new("p4")).is_none());
}

#[tokio::test]
async fn unsorted_limit_drops_oldest_inserted() {
    let store = Arc::new(MemoryStore::new());
    let cache = DocumentCache::new(&CacheConfig::default(), store);
    let key = Fingerprint::new("posts", &Document::new(), None);

    cache.get(&key, limited(2)).await;
    cache
        .set(
            &key,
            vec![
                doc(json!({"_id": "a"})),
                doc(json!({"_id": "b"})),
                doc(json!({"_id": "c"})),
            ],
        )
        .await;

    let entry = cache.snapshot(&key).expect("entry");
    assert_eq!(entry.doc_ids, vec![DocId::new("b"), DocId::new("c")]);
}

#[tokio::test]
async fn update_that_leaves_filter_removes_document() {
    let store = Arc::new(MemoryStore::new());
    let cache = DocumentCache::new(&CacheConfig::default(), store);
    let open = Fingerprint::new("tasks", &doc(json!({"status": "open"})), None);
    let id = DocId::new("t1");

    cache.get(&open, unbounded()).await;
    cache
        .set(&open, vec![doc(json!({"_id": "t1", "status": "open", "title": "x"}))])
        .await;

    let mut set = Document::new();
    set.insert("status".to_string(), json!("done"));
    let outcome = cache
        .update(
            &open,
            Mutation::Update {
                id: id.clone(),
                delta: FieldDelta::new(set, Vec::new()),
            },
        )
        .await
        .expect("update")
        .expect("entry exists");

    assert!(!outcome.entry.contains(&id));
    assert!(cache.document("tasks", &id).is_none());
}

#[tokio::test]
async fn disabled_cache_always_reads_the_store() {
    let (store, service) = service(CacheConfig::disabled());
    store.seed("posts", vec![doc(json!({"_id": "a", "t": 1}))]);
    let fetch = FetchDescription::new("posts");

    let first = subscribe(&service, "s1", "session-1", None, fetch.clone()).await;
    let second = subscribe(&service, "s2", "session-2", None, fetch.clone()).await;

    assert!(!first.start.from_cache);
    assert!(!second.start.from_cache);
    assert_eq!(second.start.docs.len(), 1);
    assert_eq!(store.queries().len(), 2);
    assert_eq!(service.cache().entry_count(), 0);
    assert!(
        service
            .cache()
            .get(&fetch.fingerprint(), fetch.options())
            .await
            .is_none()
    );
}

#[tokio::test]
async fn identical_query_is_served_from_cache() {
    let (store, service) = service(fast_config());
    store.seed(
        "posts",
        (1..=4)
            .map(|n| doc(json!({"_id": format!("p{n}"), "t": n})))
            .collect(),
    );
    let fetch = FetchDescription::new("posts")
        .with_sort(SortSpec::descending("t"))
        .with_limit(2);

    let first = subscribe(&service, "s1", "session-1", None, fetch.clone()).await;
    let second = subscribe(&service, "s2", "session-2", None, fetch).await;

    assert!(!first.start.from_cache);
    assert!(second.start.from_cache);
    let ids: Vec<Option<DocId>> = second.start.docs.iter().map(|d| DocId::of(d)).collect();
    assert_eq!(ids, vec![Some(DocId::new("p4")), Some(DocId::new("p3"))]);
    assert_eq!(store.queries().len(), 1);
}

#[tokio::test]
async fn id_lookup_is_answered_from_documents_other_queries_hold() {
    let (store, service) = service(fast_config());
    store.seed(
        "tasks",
        vec![
            doc(json!({"_id": "a", "status": "open"})),
            doc(json!({"_id": "b", "status": "open"})),
            doc(json!({"_id": "c", "status": "closed"})),
        ],
    );

    let _open = subscribe(
        &service,
        "s1",
        "session-1",
        None,
        FetchDescription::new("tasks").with_filter(doc(json!({"status": "open"}))),
    )
    .await;
    let picked = subscribe(
        &service,
        "s2",
        "session-2",
        None,
        FetchDescription::new("tasks").with_filter(doc(json!({"_id": {"$in": ["a", "b"]}}))),
    )
    .await;

    assert!(picked.start.from_cache);
    assert_eq!(picked.start.docs.len(), 2);
    assert_eq!(store.queries().len(), 1);
    assert_eq!(service.cache().pin_count("tasks", &DocId::new("a")), 2);
}

#[tokio::test]
async fn id_lookup_missing_documents_falls_through_to_store() {
    let (store, service) = service(fast_config());
    store.seed(
        "tasks",
        vec![
            doc(json!({"_id": "a", "status": "open"})),
            doc(json!({"_id": "c", "status": "closed"})),
        ],
    );

    let _open = subscribe(
        &service,
        "s1",
        "session-1",
        None,
        FetchDescription::new("tasks").with_filter(doc(json!({"status": "open"}))),
    )
    .await;
    let picked = subscribe(
        &service,
        "s2",
        "session-2",
        None,
        FetchDescription::new("tasks").with_filter(doc(json!({"_id": {"$in": ["a", "c"]}}))),
    )
    .await;

    assert!(!picked.start.from_cache);
    assert_eq!(picked.start.docs.len(), 2);
    assert_eq!(store.queries().len(), 2);
}

#[tokio::test]
async fn later_pages_are_never_cached() {
    let (store, service) = service(fast_config());
    store.seed(
        "posts",
        (1..=6)
            .map(|n| doc(json!({"_id": format!("p{n}"), "t": n})))
            .collect(),
    );
    let fetch = FetchDescription::new("posts")
        .with_sort(SortSpec::descending("t"))
        .with_skip(2)
        .with_limit(2);

    let page = subscribe(&service, "s1", "session-1", None, fetch.clone()).await;

    assert!(!page.start.from_cache);
    let ids: Vec<Option<DocId>> = page.start.docs.iter().map(|d| DocId::of(d)).collect();
    assert_eq!(ids, vec![Some(DocId::new("p4")), Some(DocId::new("p3"))]);
    let entry = service.cache().snapshot(&fetch.fingerprint()).expect("entry");
    assert!(entry.is_empty());
    assert_eq!(service.cache().document_count(), 0);
}

#[tokio::test]
async fn last_unsubscribe_evicts_the_entry() {
    let (store, service) = service(fast_config());
    store.seed("posts", vec![doc(json!({"_id": "a"}))]);
    let fetch = FetchDescription::new("posts");

    let first = subscribe(&service, "s1", "session-1", None, fetch.clone()).await;
    let second = subscribe(&service, "s2", "session-2", None, fetch.clone()).await;
    assert_eq!(service.users_of(&fetch.fingerprint()), 2);

    service.unsubscribe(first.handle()).await;
    assert_eq!(service.cache().entry_count(), 1);
    assert_eq!(service.cache().document_count(), 1);

    service.unsubscribe(second.handle()).await;
    assert_eq!(service.users_of(&fetch.fingerprint()), 0);
    assert_eq!(service.cache().entry_count(), 0);
    assert_eq!(service.cache().document_count(), 0);
}

#[tokio::test]
async fn retained_entries_survive_unsubscribe() {
    let config = CacheConfig {
        evict_on_last_detach: false,
        ..fast_config()
    };
    let (store, service) = service(config);
    store.seed("posts", vec![doc(json!({"_id": "a"}))]);
    let fetch = FetchDescription::new("posts");

    let only = subscribe(&service, "s1", "session-1", None, fetch.clone()).await;
    service.unsubscribe(only.handle()).await;

    assert_eq!(service.cache().entry_count(), 1);
    let again = subscribe(&service, "s2", "session-2", None, fetch).await;
    assert!(again.start.from_cache);
}

#[tokio::test]
async fn once_reads_without_caching_or_watching() {
    let (store, service) = service(fast_config());
    store.seed("posts", vec![doc(json!({"_id": "a"})), doc(json!({"_id": "b"}))]);

    let docs = service
        .once(&FetchDescription::new("posts").with_limit(1))
        .await
        .expect("once");

    assert_eq!(docs.len(), 1);
    assert_eq!(service.cache().entry_count(), 0);
    assert_eq!(store.watches_opened(), 0);
}

#[test]
fn fingerprints_ignore_filter_key_order() {
    let mut forward = Document::new();
    forward.insert("a".to_string(), json!(1));
    forward.insert("b".to_string(), json!({"$in": [1, 2]}));
    let mut backward = Document::new();
    backward.insert("b".to_string(), json!({"$in": [1, 2]}));
    backward.insert("a".to_string(), json!(1));

    let sort = SortSpec::descending("t");
    assert_eq!(
        Fingerprint::new("posts", &forward, Some(&sort)),
        Fingerprint::new("posts", &backward, Some(&sort))
    );
    assert_ne!(
        Fingerprint::new("posts", &forward, Some(&sort)),
        Fingerprint::new("posts", &forward, Some(&SortSpec::ascending("t")))
    );
    assert_ne!(
        Fingerprint::new("posts", &forward, None),
        Fingerprint::new("drafts", &forward, None)
    );
}
