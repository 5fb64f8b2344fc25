//! Cache Storage
//!
//! Named cache buckets of GET responses keyed by request URL. Buckets are
//! grouped into generations by their version suffix (see
//! [`CacheNames`](crate::CacheNames)); activation deletes every bucket that
//! does not belong to the current generation.

use std::collections::BTreeMap;

use log::debug;
use spin::RwLock;

use crate::fetch::{Method, Request, Response, ResponseSource};

// ── Types ───────────────────────────────────────────────────

/// A single cached response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    /// HTTP status code.
    pub status: u16,
    pub status_text: String,
    /// Response headers, in order.
    pub headers: Vec<(String, String)>,
    /// Response body bytes.
    pub body: Vec<u8>,
    /// When this entry was written (ms since epoch).
    pub cached_at: u64,
}

impl CachedResponse {
    fn from_response(response: &Response, cached_at: u64) -> Self {
        Self {
            status: response.status,
            status_text: response.status_text.clone(),
            headers: response.headers.clone(),
            body: response.body.clone(),
            cached_at,
        }
    }

    fn to_response(&self) -> Response {
        Response {
            status: self.status,
            status_text: self.status_text.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            source: ResponseSource::Cache,
        }
    }
}

/// A named cache.
#[derive(Debug, Clone, Default)]
struct Cache {
    /// URL → CachedResponse.
    entries: BTreeMap<String, CachedResponse>,
}

/// All cache buckets owned by the worker.
pub struct CacheStorage {
    /// cache_name → Cache.
    caches: RwLock<BTreeMap<String, Cache>>,
}

impl Default for CacheStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStorage {
    pub fn new() -> Self {
        Self {
            caches: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a bucket if it does not exist yet.
    pub fn open(&self, name: &str) {
        self.caches
            .write()
            .entry(String::from(name))
            .or_default();
    }

    /// Whether a bucket exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.read().contains_key(name)
    }

    /// Names of all buckets.
    pub fn keys(&self) -> Vec<String> {
        self.caches.read().keys().cloned().collect()
    }

    /// Delete a whole bucket.
    pub fn delete(&self, name: &str) -> bool {
        self.caches.write().remove(name).is_some()
    }

    /// Number of entries in a bucket.
    pub fn entry_count(&self, name: &str) -> usize {
        self.caches
            .read()
            .get(name)
            .map(|cache| cache.entries.len())
            .unwrap_or(0)
    }

    /// Store a response, replacing any previous one for the same URL.
    ///
    /// Only successful GET responses are cached; anything else is ignored and
    /// `false` is returned.
    pub fn put(&self, name: &str, request: &Request, response: &Response, now: u64) -> bool {
        if request.method != Method::Get || !response.ok() {
            return false;
        }
        let entry = CachedResponse::from_response(response, now);
        self.caches
            .write()
            .entry(String::from(name))
            .or_default()
            .entries
            .insert(String::from(request.url.as_str()), entry);
        debug!("cached {} in {}", request.url, name);
        true
    }

    /// Evict the oldest entries of a bucket until at most `max_entries`
    /// remain. Returns the number evicted.
    pub fn trim(&self, name: &str, max_entries: usize) -> usize {
        let mut caches = self.caches.write();
        let Some(cache) = caches.get_mut(name) else {
            return 0;
        };
        let excess = cache.entries.len().saturating_sub(max_entries);
        if excess == 0 {
            return 0;
        }

        let mut by_age: Vec<(u64, String)> = cache
            .entries
            .iter()
            .map(|(url, entry)| (entry.cached_at, url.clone()))
            .collect();
        by_age.sort();
        for (_, url) in by_age.into_iter().take(excess) {
            cache.entries.remove(&url);
        }
        debug!("evicted {} entries from {}", excess, name);
        excess
    }

    /// Look up a request in one bucket.
    pub fn match_in(&self, name: &str, request: &Request) -> Option<Response> {
        if request.method != Method::Get {
            return None;
        }
        self.caches
            .read()
            .get(name)
            .and_then(|cache| cache.entries.get(request.url.as_str()))
            .map(CachedResponse::to_response)
    }

    /// Look up a request across every bucket, in bucket-name order.
    pub fn match_any(&self, request: &Request) -> Option<Response> {
        if request.method != Method::Get {
            return None;
        }
        self.caches
            .read()
            .values()
            .find_map(|cache| cache.entries.get(request.url.as_str()))
            .map(CachedResponse::to_response)
    }

    /// Delete every bucket for which `keep` returns false. Returns the
    /// deleted names.
    pub fn retain(&self, keep: impl Fn(&str) -> bool) -> Vec<String> {
        let mut caches = self.caches.write();
        let stale: Vec<String> = caches
            .keys()
            .filter(|name| !keep(name.as_str()))
            .cloned()
            .collect();
        for name in &stale {
            caches.remove(name);
        }
        stale
    }
}
