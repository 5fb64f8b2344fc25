//! Notification Bridge
//!
//! Structured messages between the worker and its foreground clients, and the
//! registry the worker broadcasts through.
//!
//! - `GET_SYNC_STATUS` → `SYNC_STATUS { pending, failed }`
//! - dead-lettered records → one `SYNC_FAILED` per drain
//! - `push` → `NOTIFICATION`, `notificationclick` → `NAVIGATE`

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use spin::Mutex;
use sync_store::DeadLetterRecord;

// ── Messages ────────────────────────────────────────────────

/// Messages a foreground client sends to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// Activate an installed worker immediately.
    SkipWaiting,
    /// Ask for queue / dead-letter counts.
    GetSyncStatus,
    /// Drain the queue now.
    SyncNow,
}

/// Redacted view of a dead-lettered request. Headers and body stay in the
/// ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub url: String,
    pub method: String,
    pub timestamp: u64,
    pub retries: u32,
}

impl From<&DeadLetterRecord> for FailedItem {
    fn from(record: &DeadLetterRecord) -> Self {
        Self {
            url: record.request.url.clone(),
            method: record.request.method.clone(),
            timestamp: record.request.timestamp,
            retries: record.request.retries,
        }
    }
}

/// Messages the worker posts to foreground clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
    SyncStatus {
        pending: usize,
        failed: usize,
    },
    SyncFailed {
        count: usize,
        items: Vec<FailedItem>,
    },
    SyncComplete {
        synced: usize,
    },
    Notification {
        title: String,
        body: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    Navigate {
        url: String,
    },
}

impl WorkerMessage {
    /// The `SYNC_FAILED` broadcast for a set of newly dead records, if any.
    pub fn sync_failed(records: &[DeadLetterRecord]) -> Option<Self> {
        if records.is_empty() {
            return None;
        }
        Some(Self::SyncFailed {
            count: records.len(),
            items: records.iter().map(FailedItem::from).collect(),
        })
    }
}

/// Payload of a `push` event. Missing fields fall back to defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PushPayload {
    #[serde(default = "default_push_title")]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub url: Option<String>,
}

fn default_push_title() -> String {
    String::from("Case Desk")
}

impl PushPayload {
    /// Decode push data; anything that is not a JSON object becomes the body.
    pub fn decode(data: Option<&[u8]>) -> Self {
        let data = data.unwrap_or_default();
        serde_json::from_slice(data).unwrap_or_else(|_| Self {
            title: default_push_title(),
            body: String::from_utf8_lossy(data).into_owned(),
            url: None,
        })
    }
}

// ── Client ports ────────────────────────────────────────────

/// The client behind a port has gone away.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("client disconnected")]
pub struct Disconnected;

/// Delivery endpoint for one foreground client.
pub trait ClientPort: Send + Sync {
    fn post(&self, message: &WorkerMessage) -> Result<(), Disconnected>;
}

#[derive(Debug, Default)]
struct MailboxState {
    messages: VecDeque<WorkerMessage>,
    closed: bool,
}

/// In-process client port that buffers messages until they are taken.
///
/// Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct Mailbox {
    state: Arc<Mutex<MailboxState>>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every buffered message.
    pub fn drain(&self) -> Vec<WorkerMessage> {
        self.state.lock().messages.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further deliveries; the registry drops the port on next post.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.messages.clear();
    }
}

impl ClientPort for Mailbox {
    fn post(&self, message: &WorkerMessage) -> Result<(), Disconnected> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Disconnected);
        }
        state.messages.push_back(message.clone());
        Ok(())
    }
}

// ── Registry ────────────────────────────────────────────────

/// Client identifier.
pub type ClientId = u64;

/// Currently open foreground clients.
pub struct ClientRegistry {
    /// client_id → port
    clients: Mutex<BTreeMap<ClientId, Arc<dyn ClientPort>>>,
    next_id: AtomicU64,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn register(&self, port: Arc<dyn ClientPort>) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.clients.lock().insert(id, port);
        debug!("client {} registered", id);
        id
    }

    pub fn unregister(&self, id: ClientId) -> bool {
        self.clients.lock().remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.lock().keys().copied().collect()
    }

    /// Post to one client. A disconnected client is removed.
    pub fn post_to(&self, id: ClientId, message: &WorkerMessage) -> bool {
        let port = self.clients.lock().get(&id).cloned();
        match port.map(|port| port.post(message)) {
            Some(Ok(())) => true,
            Some(Err(Disconnected)) => {
                self.unregister(id);
                false
            }
            None => false,
        }
    }

    /// Post to every client. Returns how many received the message;
    /// disconnected clients are removed.
    pub fn broadcast(&self, message: &WorkerMessage) -> usize {
        let ports: Vec<(ClientId, Arc<dyn ClientPort>)> = self
            .clients
            .lock()
            .iter()
            .map(|(id, port)| (*id, Arc::clone(port)))
            .collect();

        let mut delivered = 0;
        for (id, port) in ports {
            match port.post(message) {
                Ok(()) => delivered += 1,
                Err(Disconnected) => {
                    debug!("client {} disconnected", id);
                    self.unregister(id);
                }
            }
        }
        trace!("broadcast to {} clients: {:?}", delivered, message);
        delivered
    }
}
