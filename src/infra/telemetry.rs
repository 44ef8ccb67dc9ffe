use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::cache::metric_names::*;
use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT,
            Unit::Count,
            "Total number of cache reads served from memory, labelled by source."
        );
        describe_counter!(
            METRIC_CACHE_MISS,
            Unit::Count,
            "Total number of cache reads that fell through to the store."
        );
        describe_counter!(
            METRIC_CACHE_EVICT,
            Unit::Count,
            "Total number of documents dropped from bounded cache entries."
        );
        describe_counter!(
            METRIC_CACHE_PURGE,
            Unit::Count,
            "Total number of cache entries dropped after a failed store call."
        );
        describe_counter!(
            METRIC_BACKFILL_QUERY,
            Unit::Count,
            "Total number of backfill queries issued, labelled by mode."
        );
        describe_histogram!(
            METRIC_BACKFILL_MS,
            Unit::Milliseconds,
            "Backfill batch latency in milliseconds."
        );
        describe_counter!(
            METRIC_FEED_OPEN,
            Unit::Count,
            "Total number of change feeds opened."
        );
        describe_counter!(
            METRIC_FEED_CLOSE,
            Unit::Count,
            "Total number of change feeds closed."
        );
        describe_gauge!(
            METRIC_FEED_ACTIVE,
            Unit::Count,
            "Current number of open change feeds."
        );
        describe_counter!(
            METRIC_FEED_DELIVERY_ERROR,
            Unit::Count,
            "Total number of change deliveries that failed."
        );
        describe_counter!(
            METRIC_FEED_SUPPRESSED,
            Unit::Count,
            "Total number of changes withheld from the session that wrote them."
        );
        describe_counter!(
            METRIC_FEED_RECOVERED,
            Unit::Count,
            "Total number of changes resent as additions to subscribers missing the document."
        );
    });
}
