//! The offline write-sync worker.
//!
//! Owns the client registry and wires the interceptor, scheduler and bridge
//! together. The queue and the cache storage are handed in, so a worker for a
//! new cache generation takes over the buckets and ledger of the one it
//! replaces. Every handler runs
//! synchronously on the calling thread; the worker is shared via `Arc` between
//! the host's request threads and the [`SyncPoller`](crate::SyncPoller).

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use spin::Mutex;
use sync_store::QueueStore;
use url::Url;

use crate::bridge::{ClientId, ClientMessage, ClientRegistry, PushPayload, WorkerMessage};
use crate::cache::CacheStorage;
use crate::clock::Clock;
use crate::config::{CacheNames, WorkerConfig};
use crate::error::WorkerError;
use crate::fetch::{FetchError, Request, Response, Transport};
use crate::interceptor::Interceptor;
use crate::lifecycle::{Lifecycle, WorkerState};
use crate::scheduler::{DrainReport, RetryScheduler};

/// Queue and dead-letter counts, as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub pending: usize,
    pub failed: usize,
}

pub struct SyncWorker {
    config: WorkerConfig,
    origin: Url,
    cache_names: CacheNames,
    store: Arc<QueueStore>,
    caches: Arc<CacheStorage>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    interceptor: Interceptor,
    scheduler: RetryScheduler,
    clients: ClientRegistry,
    lifecycle: Mutex<Lifecycle>,
}

impl SyncWorker {
    /// Build a worker over shared queue and cache storage. Nothing is fetched
    /// or purged until [`install`](Self::install) and
    /// [`activate`](Self::activate).
    pub fn new(
        config: WorkerConfig,
        store: Arc<QueueStore>,
        caches: Arc<CacheStorage>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        let origin = config.origin_url()?;
        let interceptor = Interceptor::new(
            &config,
            Arc::clone(&caches),
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&clock),
        )?;
        let scheduler = RetryScheduler::new(
            Arc::clone(&store),
            Arc::clone(&transport),
            Arc::clone(&clock),
            config.retry,
        );

        Ok(Self {
            cache_names: config.cache_names(),
            config,
            origin,
            store,
            caches,
            transport,
            clock,
            interceptor,
            scheduler,
            clients: ClientRegistry::new(),
            lifecycle: Mutex::new(Lifecycle::new()),
        })
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// The origin whose requests are intercepted.
    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn cache_names(&self) -> &CacheNames {
        &self.cache_names
    }

    pub fn caches(&self) -> &CacheStorage {
        &self.caches
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn state(&self) -> WorkerState {
        self.lifecycle.lock().state()
    }

    fn transition(&self, to: WorkerState) -> Result<(), WorkerError> {
        self.lifecycle.lock().transition(to)
    }

    // ── Lifecycle ───────────────────────────────────────────

    /// Precache the shell into the static cache.
    ///
    /// Any failed or non-2xx fetch fails the install and leaves the worker
    /// redundant. With `activate_on_install`, a successful install activates
    /// immediately.
    pub fn install(&self) -> Result<(), WorkerError> {
        self.transition(WorkerState::Installing)?;

        if let Err(e) = self.precache() {
            warn!("install failed: {}", e);
            self.transition(WorkerState::Redundant)?;
            return Err(e);
        }

        self.transition(WorkerState::Installed)?;
        info!(
            "installed {} ({} assets precached)",
            self.cache_names.static_assets,
            self.config.precache.len()
        );

        if self.config.activate_on_install {
            self.activate()?;
        }
        Ok(())
    }

    fn precache(&self) -> Result<(), WorkerError> {
        let now = self.clock.now_ms();
        self.caches.open(&self.cache_names.static_assets);
        for path in &self.config.precache {
            let url = self.origin.join(path).map_err(|e| WorkerError::Precache {
                url: path.clone(),
                reason: e.to_string(),
            })?;
            let request = Request::get(url);
            let response = self
                .transport
                .send(&request)
                .map_err(|e| WorkerError::Precache {
                    url: path.clone(),
                    reason: e.to_string(),
                })?;
            if !response.ok() {
                return Err(WorkerError::Precache {
                    url: path.clone(),
                    reason: format!("HTTP {}", response.status),
                });
            }
            self.caches
                .put(&self.cache_names.static_assets, &request, &response, now);
        }
        Ok(())
    }

    /// Delete every cache bucket outside the current generation, then start
    /// intercepting. Returns the deleted bucket names.
    pub fn activate(&self) -> Result<Vec<String>, WorkerError> {
        self.transition(WorkerState::Activating)?;
        let purged = self
            .caches
            .retain(|name| self.cache_names.contains(name));
        for name in &purged {
            info!("deleted stale cache {}", name);
        }
        self.transition(WorkerState::Activated)?;
        Ok(purged)
    }

    /// Activate an installed worker. Does nothing in any other state.
    pub fn skip_waiting(&self) -> Result<bool, WorkerError> {
        if self.state() != WorkerState::Installed {
            debug!("skip-waiting ignored in state {:?}", self.state());
            return Ok(false);
        }
        self.activate()?;
        Ok(true)
    }

    // ── Fetch ───────────────────────────────────────────────

    /// Handle a fetch. Until the worker is active, requests go straight to the
    /// network.
    pub fn fetch(&self, request: Request) -> Result<Response, FetchError> {
        if self.state() != WorkerState::Activated {
            return self.interceptor.network(&request);
        }
        self.interceptor.handle(request)
    }

    /// Block until background cache refreshes have finished.
    pub fn wait_for_revalidations(&self) {
        self.interceptor.wait_for_revalidations();
    }

    // ── Sync ────────────────────────────────────────────────

    /// Drain the queue once and notify clients.
    ///
    /// Newly dead-lettered records are reported in a single `SYNC_FAILED`
    /// broadcast; delivered records in a `SYNC_COMPLETE`.
    pub fn sync(&self) -> Result<DrainReport, WorkerError> {
        let report = self.scheduler.drain()?;

        if let Some(message) = WorkerMessage::sync_failed(&report.dead_lettered) {
            let delivered = self.clients.broadcast(&message);
            warn!(
                "{} request(s) failed permanently; notified {} client(s)",
                report.dead_lettered.len(),
                delivered
            );
        }
        if report.succeeded > 0 {
            self.clients.broadcast(&WorkerMessage::SyncComplete {
                synced: report.succeeded,
            });
        }
        Ok(report)
    }

    /// Current queue and dead-letter counts.
    pub fn status(&self) -> Result<SyncStatus, WorkerError> {
        Ok(SyncStatus {
            pending: self.store.count()?,
            failed: self.store.count_dead_letters()?,
        })
    }

    // ── Messages ────────────────────────────────────────────

    /// Handle a client message. Returns the reply, if the message has one.
    ///
    /// When `from` is a registered client the reply is also posted to it.
    pub fn handle_message(
        &self,
        from: Option<ClientId>,
        message: ClientMessage,
    ) -> Result<Option<WorkerMessage>, WorkerError> {
        debug!("message {:?} from {:?}", message, from);
        let reply = match message {
            ClientMessage::SkipWaiting => {
                self.skip_waiting()?;
                None
            }
            ClientMessage::GetSyncStatus => {
                let status = self.status()?;
                Some(WorkerMessage::SyncStatus {
                    pending: status.pending,
                    failed: status.failed,
                })
            }
            ClientMessage::SyncNow => {
                self.sync()?;
                None
            }
        };

        if let (Some(client), Some(reply)) = (from, &reply) {
            self.clients.post_to(client, reply);
        }
        Ok(reply)
    }

    /// Relay a push to every client as a notification.
    pub fn push(&self, data: Option<&[u8]>) -> usize {
        let payload = PushPayload::decode(data);
        self.clients.broadcast(&WorkerMessage::Notification {
            title: payload.title,
            body: payload.body,
            url: payload.url,
        })
    }

    /// Ask clients to navigate to the clicked notification's URL.
    pub fn notification_click(&self, url: Option<String>) -> usize {
        let url = url.unwrap_or_else(|| String::from("/"));
        self.clients.broadcast(&WorkerMessage::Navigate { url })
    }
}
