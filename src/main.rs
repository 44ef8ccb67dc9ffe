use std::{fs, process, sync::Arc, time::Duration};

use flusso::{
    application::query::FetchDescription,
    cache::{CacheConfig, CacheService, SessionId, StreamHandle, StreamRequest, SubscriberId},
    config::{self, SimulateArgs},
    domain::{
        document::{DocId, Document, FieldDelta},
        sort::SortSpec,
    },
    infra::{
        error::InfraError,
        memory::MemoryStore,
        recording::RecordingDelivery,
        telemetry,
    },
};
use serde_json::{Value, json};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

const COLLECTION: &str = "items";
const OWNERS: usize = 2;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Simulate(SimulateArgs::default()));

    match command {
        config::Command::CheckConfig(_) => {
            println!("{settings:#?}");
            Ok(())
        }
        config::Command::Simulate(args) => {
            telemetry::init(&settings.logging)?;
            run_simulate(&settings, args).await
        }
    }
}

struct SimulatedSubscriber {
    handle: StreamHandle,
    delivery: Arc<RecordingDelivery>,
}

async fn run_simulate(settings: &config::Settings, args: SimulateArgs) -> Result<(), InfraError> {
    let cache_config = CacheConfig::from(&settings.cache);
    let store = Arc::new(MemoryStore::new());
    store.seed(COLLECTION, seed_documents(&args)?);

    let service = CacheService::new(cache_config.clone(), store.clone());
    let mut subscribers = Vec::with_capacity(args.subscribers);
    for index in 0..args.subscribers {
        let owner = owner_name(index);
        let delivery = Arc::new(RecordingDelivery::strict());
        let fetch = FetchDescription::new(COLLECTION)
            .with_filter(owner_filter(&owner))
            .with_sort(SortSpec::descending("rank"))
            .with_limit(args.limit);

        let start = service
            .stream(StreamRequest {
                subscriber_id: SubscriberId::new(format!("sub-{index}")),
                session_id: SessionId::new(format!("session-{index}")),
                caller: Some(Value::String(owner)),
                fetch,
                delivery: delivery.clone(),
            })
            .await?;
        delivery.acknowledge(&start.docs);
        info!(
            subscriber = index,
            initial = start.docs.len(),
            from_cache = start.from_cache,
            "Subscribed"
        );
        subscribers.push(SimulatedSubscriber {
            handle: start.handle,
            delivery,
        });
    }

    let writer = SessionId::new("session-0");
    let mut next_id = store_size(&args);
    for step in 0..args.writes {
        let owner = owner_name(step);
        match step % 3 {
            0 => {
                let id = DocId::new(format!("item-{next_id}"));
                service.record_write(id.clone(), writer.clone());
                store.insert(COLLECTION, item(&id, next_id, &owner));
                next_id += 1;
            }
            1 => {
                let id = DocId::new(format!("item-{}", step % next_id.max(1)));
                let mut set = Document::new();
                set.insert("rank".to_string(), json!(next_id + step));
                store.update(COLLECTION, &id, FieldDelta::new(set, Vec::new()));
            }
            _ => {
                let id = DocId::new(format!("item-{}", next_id.saturating_sub(step % 7 + 1)));
                store.delete(COLLECTION, &id);
            }
        }
        tokio::task::yield_now().await;
    }

    // Let debounced backfills settle before reporting.
    tokio::time::sleep(cache_config.backfill_debounce() * 3 + Duration::from_millis(50)).await;

    for (index, subscriber) in subscribers.iter().enumerate() {
        info!(
            subscriber = index,
            added = subscriber.delivery.added_ids().len(),
            changed = subscriber.delivery.changed_ids().len(),
            removed = subscriber.delivery.removed_ids().len(),
            stopped = subscriber.delivery.is_stopped(),
            "Delivery totals"
        );
    }
    info!(
        feeds = service.feeds().feed_count(),
        watches_opened = store.watches_opened(),
        entries = service.cache().entry_count(),
        documents = service.cache().document_count(),
        "Simulation finished"
    );

    for subscriber in subscribers {
        service.unsubscribe(subscriber.handle).await;
    }
    service.shutdown();
    Ok(())
}

fn seed_documents(args: &SimulateArgs) -> Result<Vec<Document>, InfraError> {
    let Some(path) = args.seed.as_ref() else {
        return Ok((0..store_size(args))
            .map(|n| item(&DocId::new(format!("item-{n}")), n, &owner_name(n)))
            .collect());
    };

    let raw = fs::read_to_string(path)?;
    let parsed: Vec<Value> = serde_json::from_str(&raw).map_err(|err| {
        InfraError::configuration(format!("invalid seed file `{}`: {err}", path.display()))
    })?;
    parsed
        .into_iter()
        .map(|value| match value {
            Value::Object(doc) => Ok(doc),
            other => Err(InfraError::configuration(format!(
                "seed documents must be objects, found `{other}`"
            ))),
        })
        .collect()
}

fn store_size(args: &SimulateArgs) -> usize {
    usize::try_from(args.limit)
        .unwrap_or(usize::MAX)
        .saturating_mul(OWNERS * 2)
}

fn owner_name(index: usize) -> String {
    format!("user-{}", index % OWNERS)
}

fn owner_filter(owner: &str) -> Document {
    let mut filter = Document::new();
    filter.insert("owner".to_string(), Value::String(owner.to_string()));
    filter
}

fn item(id: &DocId, rank: usize, owner: &str) -> Document {
    let mut doc = Document::new();
    doc.insert("_id".to_string(), id.to_value());
    doc.insert("rank".to_string(), json!(rank));
    doc.insert("owner".to_string(), Value::String(owner.to_string()));
    doc
}
