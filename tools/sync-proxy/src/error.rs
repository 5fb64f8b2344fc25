use std::path::PathBuf;
use std::process::ExitCode;

use sync_store::StoreError;
use sync_worker::WorkerError;

/// All errors produced by sync-proxy.
///
/// Variants are split into two categories:
/// - **Infrastructure errors** (exit code 2): bad config, unreadable ledger, I/O
/// - **Operational errors** (exit code 1): the worker ran but could not finish
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    // ── Infrastructure errors (exit code 2) ──────────────────────────

    #[error("Config file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Could not listen on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Queue store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ── Operational errors (exit code 1) ─────────────────────────────

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Drain left {dead} request(s) dead-lettered")]
    DeadLettered { dead: usize },

    #[error(
        "Ledger {} is owned by a running proxy; use its /__sync/status or /__sync/online routes",
        path.display()
    )]
    LedgerBusy { path: PathBuf },
}

impl ProxyError {
    /// Map each error variant to its process exit code.
    ///
    /// - `2`: infrastructure error (bad config, store, I/O)
    /// - `1`: operational failure
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }

    /// The raw numeric exit code.
    pub fn exit_status(&self) -> u8 {
        match self {
            // Infrastructure errors → 2
            Self::ConfigNotFound { .. }
            | Self::ConfigParse(_)
            | Self::InvalidConfig(_)
            | Self::Bind { .. }
            | Self::Store(_)
            | Self::Io(_)
            | Self::Json(_) => 2,

            // A worker that failed on its store or config is still infrastructure.
            Self::Worker(WorkerError::Store(_))
            | Self::Worker(WorkerError::Config(_))
            | Self::Worker(WorkerError::ConfigParse(_)) => 2,

            // Operational errors → 1
            Self::Worker(_) | Self::DeadLettered { .. } | Self::LedgerBusy { .. } => 1,
        }
    }
}
