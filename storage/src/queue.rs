//! Typed ledgers for queued writes and their dead letters.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, FileBackend, MemoryBackend};
use crate::engine::{Database, VersionChange};
use crate::error::StoreError;

/// Database name of the offline ledger.
pub const DB_NAME: &str = "case-desk-offline";
/// Current schema version.
pub const DB_VERSION: u32 = 2;
/// Active ledger of requests awaiting replay.
pub const SYNC_QUEUE: &str = "syncQueue";
/// Ledger of requests that will never be replayed again.
pub const DEAD_LETTER_QUEUE: &str = "deadLetterQueue";

const INDEX_RETRIES: &str = "retries";
const INDEX_TIMESTAMP: &str = "timestamp";

/// One pending mutating request.
///
/// Times are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedRequest {
    /// Ledger key, assigned on enqueue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<Vec<u8>>,
    pub timestamp: u64,
    pub last_retry_time: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl QueuedRequest {
    /// A fresh record. The enqueue time also counts as the last attempt, since
    /// the original request has just failed.
    pub fn new(
        url: impl Into<String>,
        method: impl Into<String>,
        headers: Vec<(String, String)>,
        body: Option<Vec<u8>>,
        now: u64,
    ) -> Self {
        Self {
            id: None,
            url: url.into(),
            method: method.into(),
            headers,
            body,
            timestamp: now,
            last_retry_time: now,
            retries: 0,
            last_error: None,
        }
    }

    /// Record one more failed attempt.
    pub fn record_failure(&mut self, now: u64, error: impl Into<String>) {
        self.retries = self.retries.saturating_add(1);
        self.last_retry_time = now;
        self.last_error = Some(error.into());
    }
}

/// Why a record left the active ledger without being delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum DeadLetterReason {
    MaxRetriesExceeded,
    ClientError(u16),
    /// The stored method or URL no longer forms a request.
    InvalidRequest,
}

const MAX_RETRIES_EXCEEDED: &str = "max_retries_exceeded";
const INVALID_REQUEST: &str = "invalid_request";
const CLIENT_ERROR_PREFIX: &str = "client_error_";

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxRetriesExceeded => f.write_str(MAX_RETRIES_EXCEEDED),
            Self::ClientError(status) => write!(f, "{}{}", CLIENT_ERROR_PREFIX, status),
            Self::InvalidRequest => f.write_str(INVALID_REQUEST),
        }
    }
}

impl FromStr for DeadLetterReason {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            MAX_RETRIES_EXCEEDED => return Ok(Self::MaxRetriesExceeded),
            INVALID_REQUEST => return Ok(Self::InvalidRequest),
            _ => {}
        }
        s.strip_prefix(CLIENT_ERROR_PREFIX)
            .and_then(|status| status.parse().ok())
            .map(Self::ClientError)
            .ok_or_else(|| StoreError::Data(format!("unknown dead-letter reason: {}", s)))
    }
}

impl From<DeadLetterReason> for String {
    fn from(reason: DeadLetterReason) -> Self {
        reason.to_string()
    }
}

impl TryFrom<String> for DeadLetterReason {
    type Error = StoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A request snapshot taken when it was moved out of the active ledger.
///
/// Keeps the request's original id as its key in the dead-letter ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    #[serde(flatten)]
    pub request: QueuedRequest,
    pub moved_at: u64,
    pub reason: DeadLetterReason,
}

/// Secondary orderings of the active ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueIndex {
    Retries,
    Timestamp,
}

impl QueueIndex {
    fn name(self) -> &'static str {
        match self {
            Self::Retries => INDEX_RETRIES,
            Self::Timestamp => INDEX_TIMESTAMP,
        }
    }
}

fn upgrade(change: &mut VersionChange<'_>, old_version: u32) -> Result<(), StoreError> {
    // Every step is idempotent, so a partially upgraded ledger converges too.
    change.ensure_store(SYNC_QUEUE, Some("id"));
    change.ensure_index(SYNC_QUEUE, INDEX_RETRIES, "retries")?;
    change.ensure_index(SYNC_QUEUE, INDEX_TIMESTAMP, "timestamp")?;

    if change.ensure_store(DEAD_LETTER_QUEUE, Some("id")) {
        debug!("created {} (upgrade from v{})", DEAD_LETTER_QUEUE, old_version);
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(values: Vec<serde_json::Value>) -> Result<Vec<T>, StoreError> {
    values
        .into_iter()
        .map(|value| serde_json::from_value(value).map_err(StoreError::from))
        .collect()
}

/// The durable queue: `syncQueue` plus `deadLetterQueue`.
pub struct QueueStore {
    db: Database,
}

impl QueueStore {
    /// Open (and upgrade if needed) the ledger on a backend.
    pub fn open<B: Backend + 'static>(backend: B) -> Result<Self, StoreError> {
        let db = Database::open(backend, DB_NAME, DB_VERSION, upgrade)?;
        Ok(Self { db })
    }

    /// Open the ledger stored in a JSON file, holding its lock for as long
    /// as the store lives.
    pub fn open_file(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open(FileBackend::open(path)?)
    }

    /// Open a ledger that lives only in this process.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(MemoryBackend::new())
    }

    /// Schema version of the open ledger.
    pub fn version(&self) -> u32 {
        self.db.version()
    }

    /// Persist a new record and return its id.
    pub fn enqueue(&self, request: &QueuedRequest) -> Result<u64, StoreError> {
        let mut value = serde_json::to_value(request)?;
        if let Some(object) = value.as_object_mut() {
            object.remove("id");
        }
        let id = self.db.write(&[SYNC_QUEUE], |tx| tx.add(SYNC_QUEUE, value))?;
        debug!("enqueued {} {} as #{}", request.method, request.url, id);
        Ok(id)
    }

    pub fn get(&self, id: u64) -> Result<Option<QueuedRequest>, StoreError> {
        self.db
            .read(&[SYNC_QUEUE], |tx| tx.get(SYNC_QUEUE, id))?
            .map(|value| serde_json::from_value(value).map_err(StoreError::from))
            .transpose()
    }

    /// Every queued record in id order.
    pub fn get_all(&self) -> Result<Vec<QueuedRequest>, StoreError> {
        decode(self.db.read(&[SYNC_QUEUE], |tx| tx.get_all(SYNC_QUEUE))?)
    }

    /// Every queued record ordered by a secondary index.
    pub fn pending_by(&self, index: QueueIndex) -> Result<Vec<QueuedRequest>, StoreError> {
        decode(
            self.db
                .read(&[SYNC_QUEUE], |tx| tx.index_get_all(SYNC_QUEUE, index.name()))?,
        )
    }

    /// Overwrite a queued record.
    ///
    /// Returns `false` when the record has already left the queue.
    pub fn update(&self, request: &QueuedRequest) -> Result<bool, StoreError> {
        let id = request.id.ok_or(StoreError::MissingKey)?;
        let value = serde_json::to_value(request)?;
        self.db
            .write(&[SYNC_QUEUE], |tx| tx.replace(SYNC_QUEUE, id, value))
    }

    /// Remove a queued record. Returns whether anything was removed.
    pub fn delete(&self, id: u64) -> Result<bool, StoreError> {
        let removed = self
            .db
            .write(&[SYNC_QUEUE], |tx| tx.delete(SYNC_QUEUE, id))?;
        Ok(removed.is_some())
    }

    /// Number of queued records.
    pub fn count(&self) -> Result<usize, StoreError> {
        self.db.read(&[SYNC_QUEUE], |tx| tx.count(SYNC_QUEUE))
    }

    /// Move a record from the queue to the dead-letter ledger in one transaction.
    ///
    /// Returns `None` when the record is no longer queued.
    pub fn move_to_dead_letter(
        &self,
        id: u64,
        reason: DeadLetterReason,
        moved_at: u64,
    ) -> Result<Option<DeadLetterRecord>, StoreError> {
        let moved = self.db.write(&[SYNC_QUEUE, DEAD_LETTER_QUEUE], |tx| {
            let Some(value) = tx.delete(SYNC_QUEUE, id)? else {
                return Ok(None);
            };
            let request: QueuedRequest = serde_json::from_value(value)?;
            let record = DeadLetterRecord {
                request,
                moved_at,
                reason,
            };
            tx.add(DEAD_LETTER_QUEUE, serde_json::to_value(&record)?)?;
            Ok(Some(record))
        })?;

        if let Some(record) = &moved {
            warn!(
                "dead-lettered #{} {} {} ({})",
                id, record.request.method, record.request.url, reason
            );
        }
        Ok(moved)
    }

    /// Every dead-letter record in id order.
    pub fn dead_letters(&self) -> Result<Vec<DeadLetterRecord>, StoreError> {
        decode(
            self.db
                .read(&[DEAD_LETTER_QUEUE], |tx| tx.get_all(DEAD_LETTER_QUEUE))?,
        )
    }

    /// Number of dead-letter records.
    pub fn count_dead_letters(&self) -> Result<usize, StoreError> {
        self.db
            .read(&[DEAD_LETTER_QUEUE], |tx| tx.count(DEAD_LETTER_QUEUE))
    }
}
