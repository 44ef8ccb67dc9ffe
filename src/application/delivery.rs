//! Per-subscriber delivery of document changes.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::document::{DocId, Document};

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// A `changed` was sent for a document the subscriber never received.
    #[error("document `{id}` in `{collection}` is unknown to the subscriber")]
    UnknownDocument { collection: String, id: DocId },
    #[error("subscriber connection closed")]
    Closed,
    #[error("delivery failed: {0}")]
    Failed(String),
}

impl DeliveryError {
    pub fn from_failure(err: impl std::fmt::Display) -> Self {
        Self::Failed(err.to_string())
    }
}

/// Callbacks through which a subscriber receives changes.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn added(
        &self,
        collection: &str,
        id: &DocId,
        fields: &Document,
    ) -> Result<(), DeliveryError>;

    async fn changed(
        &self,
        collection: &str,
        id: &DocId,
        fields: &Document,
    ) -> Result<(), DeliveryError>;

    async fn removed(&self, collection: &str, id: &DocId) -> Result<(), DeliveryError>;

    /// The subscription can no longer be served and must end.
    async fn stop(&self);
}
