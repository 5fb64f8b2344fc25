/// Errors produced by the ledger engine and its backends.
///
/// Every failed operation leaves the open database exactly as it was before
/// the operation started.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("object store not found: {name}")]
    NoSuchStore { name: String },

    #[error("index not found: {store}.{index}")]
    NoSuchIndex { store: String, index: String },

    #[error("object store {name} is not part of this transaction")]
    OutOfScope { name: String },

    #[error("write attempted in a read-only transaction")]
    ReadOnly,

    #[error("key already exists: {key}")]
    Constraint { key: u64 },

    #[error("record has no primary key")]
    MissingKey,

    #[error("stored database version {stored} is newer than requested version {requested}")]
    Version { stored: u32, requested: u32 },

    #[error("invalid record: {0}")]
    Data(String),

    #[error("ledger {} is in use by another process", path.display())]
    Locked { path: std::path::PathBuf },

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
