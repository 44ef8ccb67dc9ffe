//! Backing document store abstraction.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

use crate::domain::document::{DocId, Document};
use crate::domain::sort::SortSpec;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("change feed closed")]
    Closed,
}

impl StoreError {
    pub fn from_query(err: impl std::fmt::Display) -> Self {
        Self::Query(err.to_string())
    }
}

/// A read against one collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreQuery {
    pub collection: String,
    pub filter: Document,
    pub sort: Option<SortSpec>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub projection: Option<Document>,
}

impl StoreQuery {
    pub fn new(collection: impl Into<String>, filter: Document) -> Self {
        Self {
            collection: collection.into(),
            filter,
            ..Self::default()
        }
    }
}

/// Server-side shaping applied to a change feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchPipeline {
    /// Filter over the change event itself (`operationType`, `fullDocument.*`, ...).
    pub match_expression: Document,
    /// Projection over the change event, already prefixed with `fullDocument.`.
    pub projection: Option<Document>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    DropDatabase,
    Rename,
    Invalidate,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::Drop => "drop",
            Self::DropDatabase => "dropDatabase",
            Self::Rename => "rename",
            Self::Invalidate => "invalidate",
        }
    }

    /// Document-level changes, as opposed to collection administration.
    pub fn is_crud(self) -> bool {
        matches!(
            self,
            Self::Insert | Self::Update | Self::Replace | Self::Delete
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    Insert { full_document: Document },
    Update { updated_fields: Document, removed_fields: Vec<String> },
    Replace { full_document: Document },
    Delete,
    Drop,
    DropDatabase,
    Rename,
    Invalidate,
}

/// One notification from a change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub collection: String,
    /// Raw `_id` from the event's document key; absent for administrative events.
    pub document_key: Option<Value>,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn operation(&self) -> OperationType {
        match self.kind {
            ChangeKind::Insert { .. } => OperationType::Insert,
            ChangeKind::Update { .. } => OperationType::Update,
            ChangeKind::Replace { .. } => OperationType::Replace,
            ChangeKind::Delete => OperationType::Delete,
            ChangeKind::Drop => OperationType::Drop,
            ChangeKind::DropDatabase => OperationType::DropDatabase,
            ChangeKind::Rename => OperationType::Rename,
            ChangeKind::Invalidate => OperationType::Invalidate,
        }
    }

    pub fn document_id(&self) -> Option<DocId> {
        self.document_key.as_ref().and_then(DocId::from_value)
    }
}

pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, StoreError>>;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn find(&self, query: &StoreQuery) -> Result<Vec<Document>, StoreError>;

    async fn find_one(&self, collection: &str, id: &DocId)
    -> Result<Option<Document>, StoreError>;

    /// Open a change feed. Dropping the returned stream closes it.
    async fn watch(
        &self,
        collection: &str,
        pipeline: &WatchPipeline,
    ) -> Result<ChangeStream, StoreError>;
}
