#![doc = include_str!("../README.md")]
#![doc(issue_tracker_base_url = "https://github.com/factordynamics/marketdata/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

//! Storage backends for fetched market data.
//!
//! This crate provides implementations of the [`Storage`] trait from `marketdata-core`:
//!
//! - [`SqliteStorage`] - Persistent SQLite-backed store (requires the `sqlite` feature)
//! - [`InMemoryStorage`] - Map-backed store for testing
//! - [`NoopStorage`] - Store that keeps nothing

/// In-memory storage implementation.
pub mod memory;
/// No-op storage implementation.
pub mod noop;
/// Stored record type.
pub mod record;

/// SQLite-backed storage implementation.
#[cfg(feature = "sqlite")]
pub mod sqlite;

// Re-export the trait for convenience
pub use marketdata_core::Storage;

pub use memory::InMemoryStorage;
pub use noop::NoopStorage;
pub use record::StoredRecord;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
