//! Background drain loop.
//!
//! Stands in for the platform's `sync` event: a thread that drains the queue
//! every poll interval while it is non-empty, and immediately when woken.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};

use crate::error::WorkerError;
use crate::worker::SyncWorker;

enum Signal {
    Wake,
    Shutdown,
}

/// Handle to the drain thread. Dropping it stops the thread.
pub struct SyncPoller {
    sender: Sender<Signal>,
    handle: Option<JoinHandle<()>>,
}

impl SyncPoller {
    pub fn spawn(worker: Arc<SyncWorker>, interval: Duration) -> Result<Self, WorkerError> {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(String::from("sync-poller"))
            .spawn(move || {
                info!("sync poller started (every {:?})", interval);
                loop {
                    match receiver.recv_timeout(interval) {
                        Ok(Signal::Wake) => run_cycle(&worker, "wake"),
                        Err(RecvTimeoutError::Timeout) => {
                            if has_pending(&worker) {
                                run_cycle(&worker, "timer");
                            }
                        }
                        Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                info!("sync poller stopped");
            })
            .map_err(|source| WorkerError::Spawn {
                name: "sync-poller",
                source,
            })?;

        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    /// Drain now (connectivity restored, manual trigger). Returns `false` if
    /// the thread has stopped.
    pub fn wake(&self) -> bool {
        self.sender.send(Signal::Wake).is_ok()
    }

    /// Stop the thread and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.sender.send(Signal::Shutdown);
            if handle.join().is_err() {
                error!("sync poller panicked");
            }
        }
    }
}

impl Drop for SyncPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn has_pending(worker: &SyncWorker) -> bool {
    match worker.store().count() {
        Ok(count) => count > 0,
        Err(e) => {
            error!("could not read queue size: {}", e);
            false
        }
    }
}

fn run_cycle(worker: &SyncWorker, trigger: &str) {
    debug!("drain triggered by {}", trigger);
    if let Err(e) = worker.sync() {
        error!("drain failed: {}", e);
    }
}
