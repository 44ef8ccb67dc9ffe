//! Flusso live query cache
//!
//! Keeps the results of live queries in memory and keeps them current from
//! shared change feeds:
//!
//! - **Document cache**: query entries over a refcounted per-collection table
//! - **Backfill**: refills limited entries after deletions, debounced
//! - **Feed multiplexer**: one change feed per (collection, filter), fanned out
//!   to every subscriber, with write-echo suppression
//!
//! ## Configuration
//!
//! Cache behavior is controlled via `flusso.toml`:
//!
//! ```toml
//! [cache]
//! enabled = true
//! backfill_debounce_ms = 100
//! suppression_ttl_ms = 2000
//! # ... see config.rs for all options
//! ```

mod backfill;
mod config;
mod feed;
mod keys;
pub(crate) mod lock;
mod registry;
mod service;
mod store;
mod subscriber;
mod suppression;

pub use backfill::BackfillEngine;
pub use config::CacheConfig;
pub use feed::{AttachRequest, ChangeFeedMultiplexer, FeedError, FeedHandle};
pub use keys::{
    EntryId, FeedKey, Fingerprint, KeyError, QueryShape, SessionId, SubscriberId, canonical_json,
    hash_value,
};
pub use registry::PinRegistry;
pub use service::{CacheService, ServiceError, StreamHandle, StreamRequest, StreamStart};
pub use store::{
    CacheError, CacheView, DocumentCache, EntrySnapshot, HitSource, Mutation, PurgeReason,
    UpdateOutcome,
};
pub use subscriber::{Subscriber, Subscribers};
pub use suppression::SuppressionWindow;

/// Metric names emitted by the cache, for describing and asserting.
pub mod metric_names {
    pub use super::backfill::{METRIC_BACKFILL_MS, METRIC_BACKFILL_QUERY};
    pub use super::feed::{
        METRIC_FEED_ACTIVE, METRIC_FEED_CLOSE, METRIC_FEED_DELIVERY_ERROR, METRIC_FEED_OPEN,
        METRIC_FEED_RECOVERED, METRIC_FEED_SUPPRESSED,
    };
    pub use super::store::{
        METRIC_CACHE_EVICT, METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_CACHE_PURGE,
    };
}
