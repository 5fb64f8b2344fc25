//! E2E Test: Client Notifications
//!
//! The bridge reports sync status on request, broadcasts permanent failures
//! once per drain, and relays push notifications and clicks.

use sync_e2e_tests::fixtures::{case_payload, CASES};
use sync_e2e_tests::Harness;
use sync_worker::bridge::FailedItem;
use sync_worker::testing::Outcome;
use sync_worker::{ClientMessage, Mailbox, Method, WorkerEvent, WorkerMessage};

use std::sync::Arc;

#[test]
fn test_status_counts_pending_and_failed() {
    let h = Harness::new();
    h.write_offline(Method::Post, CASES, Some(&case_payload("one")));
    h.write_offline(Method::Post, CASES, Some(&case_payload("two")));
    h.write_offline(Method::Delete, "/api/v1/cases/c-1", None);
    h.transport
        .push(Method::Delete, "/api/v1/cases/c-1", Outcome::status(410));
    h.transport.always(Method::Post, CASES, Outcome::status(503));

    h.wait_backoff(0);
    h.drain();
    h.messages();

    let reply = h.sync_status();
    assert_eq!(reply, WorkerMessage::SyncStatus { pending: 2, failed: 1 });
    // The reply also reaches the asking client.
    assert_eq!(h.messages(), vec![reply]);
}

#[test]
fn test_sync_failed_is_one_broadcast_per_drain() {
    let h = Harness::new();
    let second = Mailbox::new();
    h.worker.clients().register(Arc::new(second.clone()));

    for case in ["c-1", "c-2"] {
        let path = format!("/api/v1/cases/{case}");
        h.write_offline(Method::Put, &path, Some("{}"));
        h.transport.push(Method::Put, &path, Outcome::status(400));
    }
    h.wait_backoff(0);
    let report = h.drain();
    assert_eq!(report.dead_lettered.len(), 2);

    for inbox in [h.messages(), second.drain()] {
        match inbox.as_slice() {
            [WorkerMessage::SyncFailed { count: 2, items }] => {
                let urls: Vec<&str> = items.iter().map(|i: &FailedItem| i.url.as_str()).collect();
                assert!(urls.contains(&"http://localhost:3000/api/v1/cases/c-1"));
                assert!(urls.contains(&"http://localhost:3000/api/v1/cases/c-2"));
            }
            other => panic!("expected one SYNC_FAILED, got {other:?}"),
        }
    }
}

#[test]
fn test_sync_failed_wire_format() {
    let h = Harness::new();
    h.write_offline(Method::Post, CASES, Some("{}"));
    h.transport.push(Method::Post, CASES, Outcome::status(403));
    h.wait_backoff(0);
    h.drain();

    let message = h.messages().pop().unwrap();
    let json = serde_json::to_value(&message).unwrap();
    assert_eq!(json["type"], "SYNC_FAILED");
    assert_eq!(json["count"], 1);
    assert_eq!(json["items"][0]["method"], "POST");
    // Bodies and headers stay in the ledger.
    assert!(json["items"][0].get("body").is_none());
}

#[test]
fn test_sync_now_message_drains() {
    let h = Harness::new();
    h.write_offline(Method::Post, CASES, Some("{}"));
    h.transport.push(Method::Post, CASES, Outcome::status(200));
    h.wait_backoff(0);

    let reply = h
        .worker
        .handle_message(Some(h.client_id), ClientMessage::SyncNow)
        .unwrap();
    assert_eq!(reply, None);
    assert_eq!(h.messages(), vec![WorkerMessage::SyncComplete { synced: 1 }]);
}

#[test]
fn test_push_and_click_round_trip() {
    let h = Harness::new();
    let payload = br#"{"title":"Case escalated","body":"c-42 is overdue","url":"/cases/c-42"}"#;
    h.worker
        .dispatch(WorkerEvent::Push {
            data: Some(payload.to_vec()),
        })
        .unwrap();
    h.worker
        .dispatch(WorkerEvent::NotificationClick {
            url: Some(String::from("/cases/c-42")),
        })
        .unwrap();

    assert_eq!(
        h.messages(),
        vec![
            WorkerMessage::Notification {
                title: String::from("Case escalated"),
                body: String::from("c-42 is overdue"),
                url: Some(String::from("/cases/c-42")),
            },
            WorkerMessage::Navigate {
                url: String::from("/cases/c-42"),
            },
        ]
    );
}

#[test]
fn test_closed_client_is_dropped() {
    let h = Harness::new();
    h.client.close();
    h.write_offline(Method::Post, CASES, Some("{}"));
    h.transport.push(Method::Post, CASES, Outcome::status(404));
    h.wait_backoff(0);
    h.drain();
    assert!(h.worker.clients().is_empty());
}
