//! Request Interceptor
//!
//! Classifies every request and applies its strategy:
//!
//! | Class | Strategy |
//! |---|---|
//! | cross-origin, non-API non-GET | pass through |
//! | navigation | network first, offline page, then a bare 503 |
//! | static asset | cache first, fill the dynamic cache |
//! | API GET | stale-while-revalidate in the API cache |
//! | search GET | network first, fall back to the search cache |
//! | API write | network first, queue on any failure |
//!
//! Failures are always reported to the caller; queuing a write is a side
//! effect, never a silent success.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use spin::Mutex;
use sync_store::{QueueStore, QueuedRequest};
use url::Url;

use crate::cache::CacheStorage;
use crate::clock::Clock;
use crate::config::{CacheNames, WorkerConfig};
use crate::error::WorkerError;
use crate::fetch::{FetchError, Method, Request, Response, Transport};

const OFFLINE_MESSAGE: &str = "You are currently offline. Please check your connection.";

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    CrossOrigin,
    Navigation,
    StaticAsset,
    ApiRead,
    SearchRead,
    ApiWrite,
    /// Same-origin request the worker has no strategy for.
    PassThrough,
}

/// URL-based request classification.
#[derive(Debug, Clone)]
pub struct Classifier {
    origin: Url,
    api_prefix: String,
    search_prefixes: Vec<String>,
    critical_endpoints: Vec<String>,
}

impl Classifier {
    pub fn new(config: &WorkerConfig) -> Result<Self, WorkerError> {
        Ok(Self {
            origin: config.origin_url()?,
            api_prefix: config.api_prefix.clone(),
            search_prefixes: config.search_prefixes.clone(),
            critical_endpoints: config.critical_endpoints.clone(),
        })
    }

    pub fn classify(&self, request: &Request) -> RequestClass {
        if request.url.origin() != self.origin.origin() {
            return RequestClass::CrossOrigin;
        }
        if request.is_navigation() && request.method == Method::Get {
            return RequestClass::Navigation;
        }

        let path = request.url.path();
        let is_api = path.starts_with(&self.api_prefix);
        match request.method {
            Method::Get if is_api => {
                if self.search_prefixes.iter().any(|p| path.starts_with(p.as_str())) {
                    RequestClass::SearchRead
                } else {
                    RequestClass::ApiRead
                }
            }
            Method::Get => RequestClass::StaticAsset,
            method if is_api && method.is_mutating() => RequestClass::ApiWrite,
            _ => RequestClass::PassThrough,
        }
    }

    /// Whether an API read gets the synthetic offline answer.
    pub fn is_critical(&self, url: &Url) -> bool {
        let path = url.path();
        self.critical_endpoints
            .iter()
            .any(|endpoint| path.starts_with(endpoint.as_str()))
    }
}

/// The JSON 503 returned for critical API reads when nothing else works.
pub fn offline_api_response() -> Response {
    Response::json(
        503,
        &serde_json::json!({ "error": "Offline", "message": OFFLINE_MESSAGE }),
    )
}

/// The fetch-event handler.
pub struct Interceptor {
    classifier: Classifier,
    cache_names: CacheNames,
    offline_page: Url,
    caches: Arc<CacheStorage>,
    store: Arc<QueueStore>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    max_search_entries: usize,
    /// Background stale-while-revalidate refreshes
    revalidations: Mutex<Vec<JoinHandle<()>>>,
    /// URLs with a refresh in flight; at most one per URL
    refreshing: Arc<Mutex<BTreeSet<String>>>,
}

/// Marks a URL as being refreshed until dropped.
struct Refresh {
    refreshing: Arc<Mutex<BTreeSet<String>>>,
    url: String,
}

impl Drop for Refresh {
    fn drop(&mut self) {
        self.refreshing.lock().remove(&self.url);
    }
}

impl Interceptor {
    pub fn new(
        config: &WorkerConfig,
        caches: Arc<CacheStorage>,
        store: Arc<QueueStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, WorkerError> {
        let classifier = Classifier::new(config)?;
        let offline_page = classifier.origin.join(&config.offline_page).map_err(|e| {
            WorkerError::Config(format!("invalid offline_page {}: {}", config.offline_page, e))
        })?;
        Ok(Self {
            classifier,
            cache_names: config.cache_names(),
            offline_page,
            caches,
            store,
            transport,
            clock,
            max_search_entries: config.max_search_entries,
            revalidations: Mutex::new(Vec::new()),
            refreshing: Arc::new(Mutex::new(BTreeSet::new())),
        })
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Handle one intercepted request.
    pub fn handle(&self, request: Request) -> Result<Response, FetchError> {
        let class = self.classifier.classify(&request);
        debug!("{} {} -> {:?}", request.method, request.url, class);
        match class {
            RequestClass::CrossOrigin | RequestClass::PassThrough => self.network(&request),
            RequestClass::Navigation => Ok(self.network_or_offline_page(&request)),
            RequestClass::StaticAsset => self.cache_first(&request),
            RequestClass::ApiRead => self.stale_while_revalidate(request),
            RequestClass::SearchRead => self.network_or_search_cache(&request),
            RequestClass::ApiWrite => self.network_or_queue(&request),
        }
    }

    /// Straight to the network.
    pub fn network(&self, request: &Request) -> Result<Response, FetchError> {
        self.transport.send(request).map_err(FetchError::network)
    }

    fn network_or_offline_page(&self, request: &Request) -> Response {
        match self.transport.send(request) {
            Ok(response) => response,
            Err(e) => {
                debug!("navigation to {} failed: {}", request.url, e);
                let fallback = Request::get(self.offline_page.clone());
                self.caches
                    .match_any(&fallback)
                    .unwrap_or_else(|| Response::text(503, "Service Unavailable"))
            }
        }
    }

    fn cache_first(&self, request: &Request) -> Result<Response, FetchError> {
        if let Some(hit) = self.caches.match_any(request) {
            return Ok(hit);
        }
        let response = self.network(request)?;
        self.caches
            .put(&self.cache_names.dynamic, request, &response, self.clock.now_ms());
        Ok(response)
    }

    fn stale_while_revalidate(&self, request: Request) -> Result<Response, FetchError> {
        if let Some(hit) = self.caches.match_in(&self.cache_names.api, &request) {
            self.spawn_revalidation(request);
            return Ok(hit);
        }

        match self.transport.send(&request) {
            Ok(response) => {
                self.caches
                    .put(&self.cache_names.api, &request, &response, self.clock.now_ms());
                Ok(response)
            }
            Err(e) if self.classifier.is_critical(&request.url) => {
                warn!("serving offline response for {}: {}", request.url, e);
                Ok(offline_api_response())
            }
            Err(e) => Err(FetchError::network(e)),
        }
    }

    fn network_or_search_cache(&self, request: &Request) -> Result<Response, FetchError> {
        match self.transport.send(request) {
            Ok(response) => {
                let search = &self.cache_names.search;
                if self.caches.put(search, request, &response, self.clock.now_ms()) {
                    self.caches.trim(search, self.max_search_entries);
                }
                Ok(response)
            }
            Err(e) => self
                .caches
                .match_in(&self.cache_names.search, request)
                .ok_or_else(|| FetchError::network(e)),
        }
    }

    fn network_or_queue(&self, request: &Request) -> Result<Response, FetchError> {
        match self.transport.send(request) {
            Ok(response) if response.ok() => Ok(response),
            Ok(response) => {
                self.enqueue(
                    request,
                    format!("HTTP {} {}", response.status, response.status_text),
                );
                Ok(response)
            }
            Err(source) => {
                let queued = self.enqueue(request, source.message.clone());
                Err(FetchError::Network { source, queued })
            }
        }
    }

    /// Persist a failed write. Returns whether it was stored.
    fn enqueue(&self, request: &Request, reason: String) -> bool {
        let mut record = QueuedRequest::new(
            request.url.as_str(),
            request.method.as_str(),
            request.headers.clone(),
            request.body.clone(),
            self.clock.now_ms(),
        );
        record.last_error = Some(reason);

        match self.store.enqueue(&record) {
            Ok(id) => {
                info!("queued {} {} as #{}", request.method, request.url, id);
                true
            }
            Err(e) => {
                error!("could not queue {} {}: {}", request.method, request.url, e);
                false
            }
        }
    }

    fn spawn_revalidation(&self, request: Request) {
        let url = String::from(request.url.as_str());
        if !self.refreshing.lock().insert(url.clone()) {
            debug!("refresh of {} already in flight", url);
            return;
        }
        let refresh = Refresh {
            refreshing: Arc::clone(&self.refreshing),
            url,
        };

        let caches = Arc::clone(&self.caches);
        let transport = Arc::clone(&self.transport);
        let clock = Arc::clone(&self.clock);
        let cache_name = self.cache_names.api.clone();

        let spawned = thread::Builder::new()
            .name(String::from("swr-refresh"))
            .spawn(move || {
                let _refresh = refresh;
                match transport.send(&request) {
                    Ok(response) => {
                        caches.put(&cache_name, &request, &response, clock.now_ms());
                    }
                    Err(e) => debug!("background refresh of {} failed: {}", request.url, e),
                }
            });

        match spawned {
            Ok(handle) => {
                let mut handles = self.revalidations.lock();
                handles.retain(|h| !h.is_finished());
                handles.push(handle);
            }
            Err(e) => warn!("could not start background refresh: {}", e),
        }
    }

    /// Block until every background refresh started so far has finished.
    pub fn wait_for_revalidations(&self) {
        let handles = std::mem::take(&mut *self.revalidations.lock());
        for handle in handles {
            if handle.join().is_err() {
                warn!("background refresh panicked");
            }
        }
    }
}
