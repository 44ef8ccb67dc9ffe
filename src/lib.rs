//! Flusso: a bounded, change-feed-synchronized document cache for live queries.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
