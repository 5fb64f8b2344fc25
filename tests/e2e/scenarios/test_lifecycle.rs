//! E2E Test: Worker Lifecycle
//!
//! Install precaches the shell, activation purges every cache generation but
//! the current one, and a waiting worker activates on `SKIP_WAITING`.

use std::sync::Arc;

use sync_e2e_tests::fixtures::app_config;
use sync_e2e_tests::Harness;
use sync_store::QueueStore;
use sync_worker::testing::Outcome;
use sync_worker::{ClientMessage, Method, Request, SyncWorker, WorkerConfig, WorkerState};

fn waiting_config(version: &str) -> WorkerConfig {
    WorkerConfig {
        activate_on_install: false,
        ..app_config(version)
    }
}

#[test]
fn test_install_precaches_shell() {
    let h = Harness::new();
    assert_eq!(h.worker.state(), WorkerState::Activated);
    let static_cache = h.worker.cache_names().static_assets.clone();
    assert_eq!(h.worker.caches().entry_count(&static_cache), 4);
}

#[test]
fn test_activation_purges_old_generations() {
    let h = Harness::new();
    h.transport
        .always(Method::Get, "/app.js", Outcome::body(200, "console.log('v1')"));
    h.transport
        .always(Method::Get, "/api/v1/alerts", Outcome::body(200, "[]"));
    h.transport
        .always(Method::Get, "/api/v1/search", Outcome::body(200, "[]"));
    h.get("/app.js").unwrap();
    h.get("/api/v1/alerts").unwrap();
    h.get("/api/v1/search?q=hinge").unwrap();
    let v1_names = h.worker.cache_names().clone();
    for name in v1_names.all() {
        assert!(h.caches.has(name), "{name} was never filled");
    }

    // v2 installs beside the running v1 and waits.
    let h = h.upgrade(waiting_config("v2"));
    assert_eq!(h.worker.state(), WorkerState::Installed);
    assert!(h.caches.has(&v1_names.dynamic));

    let reply = h
        .worker
        .handle_message(Some(h.client_id), ClientMessage::SkipWaiting)
        .unwrap();
    assert_eq!(reply, None);
    assert_eq!(h.worker.state(), WorkerState::Activated);

    for name in h.caches.keys() {
        assert!(h.worker.cache_names().contains(&name), "{name} survived activation");
    }
    for name in v1_names.all() {
        assert!(!h.caches.has(name), "{name} survived activation");
    }
    // The v1 copy of /app.js is gone; v2 fetches its own.
    let request = h.request(Method::Get, "/app.js");
    assert!(h.caches.match_any(&request).is_none());
}

#[test]
fn test_waiting_worker_passes_writes_through() {
    let h = Harness::with_config(waiting_config("v1"));
    h.transport.set_offline(true);

    let request = h.request(Method::Post, "/api/v1/cases/");
    let err = h.worker.fetch(request).unwrap_err();
    assert!(!err.is_queued());
    assert_eq!(h.worker.store().count().unwrap(), 0);
}

#[test]
fn test_failed_precache_leaves_worker_redundant() {
    let h = Harness::new();
    h.transport
        .push(Method::Get, "/offline.html", Outcome::status(500));

    let worker = SyncWorker::new(
        app_config("v2"),
        Arc::new(QueueStore::open_in_memory().unwrap()),
        Arc::clone(&h.caches),
        h.transport.clone(),
        h.clock.clone(),
    )
    .unwrap();
    assert!(worker.install().is_err());
    assert_eq!(worker.state(), WorkerState::Redundant);

    // A redundant worker does not intercept.
    h.transport.set_offline(true);
    let url = worker.origin().join("/").unwrap();
    assert!(worker.fetch(Request::navigate(url)).is_err());
}
