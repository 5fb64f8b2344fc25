//! E2E Test: Offline Reads
//!
//! Reads are served from the cache buckets when the network is gone, and are
//! never written to either ledger.

use sync_e2e_tests::assertions::assert_ledgers_empty;
use sync_e2e_tests::fixtures::{metrics_body, METRICS, OFFLINE_HTML, SHELL_HTML};
use sync_e2e_tests::Harness;
use sync_worker::fetch::ResponseSource;
use sync_worker::testing::Outcome;
use sync_worker::{Method, Request};

#[test]
fn test_cached_metrics_survive_outage() {
    let h = Harness::new();
    let body = metrics_body(14);
    h.transport.push(Method::Get, METRICS, Outcome::body(200, &body));

    let first = h.get(METRICS).unwrap();
    assert_eq!(first.source, ResponseSource::Network);
    assert_eq!(first.body, body.as_bytes());

    h.transport.set_offline(true);
    let second = h.get(METRICS).unwrap();
    h.worker.wait_for_revalidations();
    assert_eq!(second.status, 200);
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.body, body.as_bytes());

    assert_ledgers_empty(h.worker.store()).unwrap();
}

#[test]
fn test_stale_metrics_are_refreshed_in_background() {
    let h = Harness::new();
    h.transport.push(Method::Get, METRICS, Outcome::body(200, &metrics_body(1)));
    h.transport.push(Method::Get, METRICS, Outcome::body(200, &metrics_body(2)));
    h.get(METRICS).unwrap();

    // Stale answer now, fresh answer next time.
    let stale = h.get(METRICS).unwrap();
    h.worker.wait_for_revalidations();
    assert_eq!(stale.body, metrics_body(1).as_bytes());

    h.transport.set_offline(true);
    let fresh = h.get(METRICS).unwrap();
    h.worker.wait_for_revalidations();
    assert_eq!(fresh.body, metrics_body(2).as_bytes());
}

#[test]
fn test_uncached_critical_endpoint_answers_offline_json() {
    let h = Harness::new();
    h.transport.set_offline(true);

    let response = h.get("/api/v1/alerts").unwrap();
    assert_eq!(response.status, 503);
    assert_eq!(response.source, ResponseSource::Synthetic);
    let json: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(json["error"], "Offline");
    assert_ledgers_empty(h.worker.store()).unwrap();
}

#[test]
fn test_uncached_plain_api_read_fails_without_queueing() {
    let h = Harness::new();
    h.transport.set_offline(true);

    let err = h.get("/api/v1/users/me").unwrap_err();
    assert!(!err.is_queued());
    assert_ledgers_empty(h.worker.store()).unwrap();
}

#[test]
fn test_navigation_falls_back_to_precached_offline_page() {
    let h = Harness::new();
    h.transport.set_offline(true);

    let url = h.worker.origin().join("/cases/12").unwrap();
    let response = h.worker.fetch(Request::navigate(url)).unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, OFFLINE_HTML.as_bytes());
}

#[test]
fn test_shell_is_served_cache_first() {
    let h = Harness::new();
    let before = h.transport.total_calls();

    let response = h.get("/index.html").unwrap();
    assert_eq!(response.source, ResponseSource::Cache);
    assert_eq!(response.body, SHELL_HTML.as_bytes());
    assert_eq!(h.transport.total_calls(), before);
}

#[test]
fn test_search_falls_back_to_last_result() {
    let h = Harness::new();
    h.transport
        .push(Method::Get, "/api/v1/search", Outcome::body(200, r#"{"hits":[3]}"#));

    let online = h.get("/api/v1/search?q=leak").unwrap();
    assert_eq!(online.source, ResponseSource::Network);

    h.transport.set_offline(true);
    let offline = h.get("/api/v1/search?q=leak").unwrap();
    assert_eq!(offline.source, ResponseSource::Cache);
    assert_eq!(offline.body, br#"{"hits":[3]}"#);

    // A different query has no cached answer.
    assert!(h.get("/api/v1/search?q=mould").is_err());
    assert_ledgers_empty(h.worker.store()).unwrap();
}
