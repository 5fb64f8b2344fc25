//! Event dispatch.
//!
//! Every platform event the worker reacts to is a [`WorkerEvent`]; a single
//! dispatch table maps each kind to its handler.

use log::debug;

use crate::bridge::{ClientId, ClientMessage, WorkerMessage};
use crate::error::WorkerError;
use crate::fetch::{Request, Response};
use crate::scheduler::DrainReport;
use crate::worker::SyncWorker;

/// Sync tag that drains the write queue.
pub const BACKGROUND_SYNC_TAG: &str = "background-sync";

/// Events delivered to the worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Install,
    Activate,
    Fetch(Request),
    Sync { tag: String },
    Message {
        client: Option<ClientId>,
        message: ClientMessage,
    },
    Push { data: Option<Vec<u8>> },
    NotificationClick { url: Option<String> },
    /// The host noticed the network is reachable again.
    ConnectivityRestored,
}

impl WorkerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Activate => "activate",
            Self::Fetch(_) => "fetch",
            Self::Sync { .. } => "sync",
            Self::Message { .. } => "message",
            Self::Push { .. } => "push",
            Self::NotificationClick { .. } => "notificationclick",
            Self::ConnectivityRestored => "online",
        }
    }
}

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Lifecycle step finished.
    Done,
    /// Answer to a fetch.
    Response(Response),
    /// Result of a queue drain.
    Drained(DrainReport),
    /// Reply to a client message.
    Reply(Option<WorkerMessage>),
    /// Number of clients a broadcast reached.
    Broadcast(usize),
    /// Event not meant for this worker.
    Ignored,
}

impl SyncWorker {
    /// Handle one event.
    pub fn dispatch(&self, event: WorkerEvent) -> Result<EventOutcome, WorkerError> {
        debug!("dispatch {}", event.kind());
        match event {
            WorkerEvent::Install => self.install().map(|_| EventOutcome::Done),
            WorkerEvent::Activate => self.activate().map(|_| EventOutcome::Done),
            WorkerEvent::Fetch(request) => Ok(EventOutcome::Response(self.fetch(request)?)),
            WorkerEvent::Sync { tag } if tag == BACKGROUND_SYNC_TAG => {
                self.sync().map(EventOutcome::Drained)
            }
            WorkerEvent::Sync { tag } => {
                debug!("ignoring sync tag {}", tag);
                Ok(EventOutcome::Ignored)
            }
            WorkerEvent::ConnectivityRestored => self.sync().map(EventOutcome::Drained),
            WorkerEvent::Message { client, message } => self
                .handle_message(client, message)
                .map(EventOutcome::Reply),
            WorkerEvent::Push { data } => Ok(EventOutcome::Broadcast(self.push(data.as_deref()))),
            WorkerEvent::NotificationClick { url } => {
                Ok(EventOutcome::Broadcast(self.notification_click(url)))
            }
        }
    }
}
