//! Test doubles: a scripted network and a manually advanced clock.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use spin::Mutex;

use crate::clock::Clock;
use crate::fetch::{Method, Request, Response, Transport, TransportError};

/// What the scripted network does with one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Respond(Response),
    Fail(String),
}

impl Outcome {
    /// A response with this status and an empty body.
    pub fn status(status: u16) -> Self {
        Self::Respond(Response::new(status))
    }

    /// A response with this status and body.
    pub fn body(status: u16, body: &str) -> Self {
        Self::Respond(Response::new(status).with_body(body))
    }

    /// No response at all.
    pub fn fail(message: &str) -> Self {
        Self::Fail(String::from(message))
    }
}

#[derive(Default)]
struct Script {
    /// "METHOD /path" → one-shot outcomes, oldest first
    queued: BTreeMap<String, VecDeque<Outcome>>,
    /// "METHOD /path" → outcome used once the queue is empty
    fallback: BTreeMap<String, Outcome>,
    calls: Vec<(Method, String)>,
}

fn route(method: Method, path: &str) -> String {
    format!("{} {}", method, path)
}

/// A [`Transport`] that answers from a script and records every call.
///
/// Routes are matched on method and URL path; the query string is ignored.
/// Unscripted routes fail like an unreachable host.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next matching request with `outcome`.
    pub fn push(&self, method: Method, path: &str, outcome: Outcome) {
        self.script
            .lock()
            .queued
            .entry(route(method, path))
            .or_default()
            .push_back(outcome);
    }

    /// Answer every matching request with `outcome` once the one-shot queue
    /// for the route is empty.
    pub fn always(&self, method: Method, path: &str, outcome: Outcome) {
        self.script
            .lock()
            .fallback
            .insert(route(method, path), outcome);
    }

    /// While offline every request fails, scripted or not.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every call, to widen race windows in concurrency tests.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Every call so far, as (method, path).
    pub fn calls(&self) -> Vec<(Method, String)> {
        self.script.lock().calls.clone()
    }

    pub fn call_count(&self, method: Method, path: &str) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|(m, p)| *m == method && p == path)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.script.lock().calls.len()
    }
}

impl Transport for ScriptedTransport {
    fn send(&self, request: &Request) -> Result<Response, TransportError> {
        let path = request.url.path();
        let outcome = {
            let mut script = self.script.lock();
            script.calls.push((request.method, String::from(path)));
            let key = route(request.method, path);
            let next = script.queued.get_mut(&key).and_then(VecDeque::pop_front);
            next.or_else(|| script.fallback.get(&key).cloned())
        };

        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            thread::sleep(Duration::from_millis(latency));
        }

        if self.offline.load(Ordering::SeqCst) {
            return Err(TransportError::new("network unreachable"));
        }
        match outcome {
            Some(Outcome::Respond(response)) => Ok(response),
            Some(Outcome::Fail(message)) => Err(TransportError::new(message)),
            None => Err(TransportError::new(format!(
                "no route to {} {}",
                request.method, path
            ))),
        }
    }
}

/// A [`Clock`] that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        let ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.advance_ms(ms);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
