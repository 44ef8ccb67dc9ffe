//! Application seams: the backing store, subscriber delivery and query shaping.

pub mod delivery;
pub mod query;
pub mod store;

pub use delivery::{Delivery, DeliveryError};
pub use query::{FetchDescription, FetchOptions};
pub use store::{ChangeEvent, ChangeKind, DocumentStore, OperationType, StoreError, StoreQuery};
