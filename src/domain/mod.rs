//! Domain layer: documents, filters and sort order.
//!
//! Pure data types and evaluation logic with no knowledge of the cache, the
//! backing store, or subscriber transport.

pub mod document;
pub mod filter;
pub mod sort;

pub use document::{DocId, Document, FieldDelta, ID_FIELD, normalize_id};
pub use filter::{FilterMatch, FilterParseError};
pub use sort::{SortDirection, SortSpec};
