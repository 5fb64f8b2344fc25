//! Durable storage for the offline write-sync worker.
//!
//! This crate provides:
//! - A versioned, transactional key-value engine (object stores, indices)
//! - Pluggable persistence backends (JSON file, in-memory)
//! - The typed `syncQueue` / `deadLetterQueue` ledgers

pub mod backend;
pub mod engine;
pub mod error;
pub mod queue;

pub use backend::{Backend, FileBackend, MemoryBackend};
pub use engine::{Database, Snapshot, StoreSnapshot, Transaction, TransactionMode, VersionChange};
pub use error::StoreError;
pub use queue::{
    DeadLetterReason, DeadLetterRecord, QueueIndex, QueueStore, QueuedRequest, DB_NAME, DB_VERSION,
    DEAD_LETTER_QUEUE, SYNC_QUEUE,
};
