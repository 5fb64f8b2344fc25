use sync_store::StoreError;

use crate::fetch::FetchError;
use crate::lifecycle::WorkerState;

/// Errors surfaced by the worker.
#[derive(thiserror::Error, Debug)]
pub enum WorkerError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: WorkerState, to: WorkerState },

    #[error("precache failed for {url}: {reason}")]
    Precache { url: String, reason: String },

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("queue store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
