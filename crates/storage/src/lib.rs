//! Storage abstraction and implementations for the study-phase engine.
//!
//! This crate provides a trait-based transactional document store with an
//! in-memory backend and a JSON-file reference backend.

#![warn(missing_docs)]

pub mod trait_;
pub mod memory_storage;
pub mod json_storage;

pub use trait_::{Precondition, Result, Storage, StorageError, Transaction, Versioned, Write};
pub use memory_storage::MemoryStorage;
pub use json_storage::JsonStorage;
