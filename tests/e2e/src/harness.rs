//! Scenario harness
//!
//! Owns a worker and everything around it: the scripted network, the clock,
//! the ledger backend, the cache storage and one registered foreground client.

use std::sync::Arc;

use sync_store::{MemoryBackend, QueueStore};
use sync_worker::fetch::FetchError;
use sync_worker::testing::{ManualClock, Outcome, ScriptedTransport};
use sync_worker::{
    CacheStorage, ClientId, ClientMessage, DrainReport, Mailbox, Method, Request, Response,
    SyncWorker, WorkerConfig, WorkerMessage,
};

use crate::fixtures;

/// A worker wired to test doubles.
pub struct Harness {
    pub worker: Arc<SyncWorker>,
    pub transport: Arc<ScriptedTransport>,
    pub clock: Arc<ManualClock>,
    pub backend: MemoryBackend,
    pub caches: Arc<CacheStorage>,
    pub client: Mailbox,
    pub client_id: ClientId,
}

impl Harness {
    /// An installed, active worker for cache generation `v1`.
    pub fn new() -> Self {
        Self::with_config(fixtures::app_config("v1"))
    }

    pub fn with_config(config: WorkerConfig) -> Self {
        let transport = Arc::new(ScriptedTransport::new());
        for path in &config.precache {
            transport.always(Method::Get, path, Outcome::body(200, fixtures::shell_asset(path)));
        }
        Self::start(
            config,
            MemoryBackend::new(),
            Arc::new(CacheStorage::new()),
            transport,
            Arc::new(ManualClock::new(1_700_000_000_000)),
        )
    }

    fn start(
        config: WorkerConfig,
        backend: MemoryBackend,
        caches: Arc<CacheStorage>,
        transport: Arc<ScriptedTransport>,
        clock: Arc<ManualClock>,
    ) -> Self {
        let store = QueueStore::open(backend.clone()).expect("open ledger");
        let worker = SyncWorker::new(
            config,
            Arc::new(store),
            Arc::clone(&caches),
            transport.clone(),
            clock.clone(),
        )
        .expect("build worker");
        worker.install().expect("install worker");

        let client = Mailbox::new();
        let client_id = worker.clients().register(Arc::new(client.clone()));
        Self {
            worker: Arc::new(worker),
            transport,
            clock,
            backend,
            caches,
            client,
            client_id,
        }
    }

    /// Tear the worker down and start a fresh one on the same ledger, network
    /// and clock, as after a browser restart.
    pub fn restart(self) -> Self {
        let config = self.worker.config().clone();
        self.respawn(config)
    }

    /// Replace the worker with one for a new deployment, on the same ledger,
    /// cache storage, network and clock. The new version's precache routes
    /// are scripted before it installs.
    pub fn upgrade(self, config: WorkerConfig) -> Self {
        for path in &config.precache {
            self.transport
                .always(Method::Get, path, Outcome::body(200, fixtures::shell_asset(path)));
        }
        self.respawn(config)
    }

    fn respawn(self, config: WorkerConfig) -> Self {
        self.worker.wait_for_revalidations();
        Self::start(config, self.backend, self.caches, self.transport, self.clock)
    }

    pub fn request(&self, method: Method, path: &str) -> Request {
        let url = self.worker.origin().join(path).expect("valid path");
        Request::new(method, url)
    }

    /// Send an application request through the worker.
    pub fn send(&self, method: Method, path: &str, body: Option<&str>) -> Result<Response, FetchError> {
        let mut request = self.request(method, path);
        if let Some(body) = body {
            request = request
                .with_header("Content-Type", "application/json")
                .with_body(body);
        }
        self.worker.fetch(request)
    }

    pub fn get(&self, path: &str) -> Result<Response, FetchError> {
        self.send(Method::Get, path, None)
    }

    /// Send a write while the network is down. The write must be queued.
    pub fn write_offline(&self, method: Method, path: &str, body: Option<&str>) -> u64 {
        self.transport.set_offline(true);
        let err = self
            .send(method, path, body)
            .expect_err("offline write must fail");
        self.transport.set_offline(false);
        assert!(err.is_queued(), "write was not queued: {err}");
        self.worker
            .store()
            .get_all()
            .expect("read queue")
            .iter()
            .filter_map(|record| record.id)
            .max()
            .expect("queued record has an id")
    }

    pub fn drain(&self) -> DrainReport {
        self.worker.sync().expect("drain")
    }

    /// Move the clock past the backoff window for a record with `retries`.
    pub fn wait_backoff(&self, retries: u32) {
        let policy = self.worker.config().retry;
        self.clock.advance_ms(policy.backoff_ms(retries));
    }

    /// Ask the worker for its sync status the way a page does.
    pub fn sync_status(&self) -> WorkerMessage {
        self.worker
            .handle_message(Some(self.client_id), ClientMessage::GetSyncStatus)
            .expect("status query")
            .expect("status reply")
    }

    /// Messages delivered to the client since the last call.
    pub fn messages(&self) -> Vec<WorkerMessage> {
        self.client.drain()
    }

    /// Replays sent for `path` with `method`.
    pub fn calls(&self, method: Method, path: &str) -> usize {
        self.transport.call_count(method, path)
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
