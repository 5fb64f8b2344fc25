//! Offline write-sync worker.
//!
//! Sits in front of every network call an application makes and guarantees
//! eventual delivery of its writes across restarts and connectivity loss:
//!
//! - Request interception with per-class cache strategies
//! - A durable retry queue with bounded exponential backoff
//! - Dead-lettering of writes that can never succeed
//! - Client notification of sync status and terminal failures
//! - Versioned cache generations, purged on activation

pub mod bridge;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod fetch;
pub mod interceptor;
pub mod lifecycle;
pub mod poller;
pub mod scheduler;
pub mod worker;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use bridge::{ClientId, ClientMessage, ClientPort, ClientRegistry, Mailbox, WorkerMessage};
pub use cache::CacheStorage;
pub use clock::{Clock, SystemClock};
pub use config::{CacheNames, RetryPolicy, WorkerConfig};
pub use error::WorkerError;
pub use events::{EventOutcome, WorkerEvent};
pub use fetch::{FetchError, Method, Request, Response, Transport, TransportError, UreqTransport};
pub use interceptor::RequestClass;
pub use lifecycle::WorkerState;
pub use poller::SyncPoller;
pub use scheduler::DrainReport;
pub use worker::{SyncStatus, SyncWorker};
