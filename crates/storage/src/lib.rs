//! Storage abstraction and implementations for Leadflow.
//!
//! This crate provides a transaction-scoped storage interface with an
//! in-process implementation and an optional SQLite backend.

#![warn(missing_docs)]

pub mod trait_;
pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite_storage;

pub use trait_::{Storage, StorageError, Result, Transaction};
pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite_storage::SqliteStorage;
