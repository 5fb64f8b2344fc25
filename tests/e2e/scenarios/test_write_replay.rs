//! E2E Test: Offline Write Replay
//!
//! Writes made while offline are queued, replayed with backoff and end in
//! exactly one terminal state:
//! 1. Delivered and deleted
//! 2. Dead-lettered after the retry ceiling
//! 3. Dead-lettered on a client error

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use sync_e2e_tests::assertions::{
    assert_dead, assert_dead_lettered, assert_exclusive, assert_pending,
};
use sync_e2e_tests::fixtures::{case_payload, CASES};
use sync_e2e_tests::Harness;
use sync_store::DeadLetterReason;
use sync_worker::testing::Outcome;
use sync_worker::{Clock, Method, WorkerMessage};

#[test]
fn test_network_errors_then_500_exhaust_retries() {
    let h = Harness::new();
    let body = case_payload("Water damage on unit 4");
    // Attempt 1: the original request.
    let id = h.write_offline(Method::Post, CASES, Some(&body));

    // Attempts 2 and 3: network errors.
    h.transport.push(Method::Post, CASES, Outcome::fail("connection reset"));
    h.transport.push(Method::Post, CASES, Outcome::fail("connection reset"));
    // Attempt 4: server error.
    h.transport.push(Method::Post, CASES, Outcome::status(500));

    for retries in 0..3 {
        h.wait_backoff(retries);
        let report = h.drain();
        assert_eq!(report.retried, 1, "replay {} should fail", retries + 1);
        assert_eq!(h.worker.store().get(id).unwrap().unwrap().retries, retries + 1);
    }
    assert_eq!(h.calls(Method::Post, CASES), 3);
    assert!(h.messages().is_empty());

    // The ceiling is reached: the next drain dead-letters without a call.
    let report = h.drain();
    assert_eq!(report.replayed, 0);
    assert_eq!(report.dead_lettered.len(), 1);
    assert_eq!(h.calls(Method::Post, CASES), 3);
    assert_dead_lettered(h.worker.store(), id, DeadLetterReason::MaxRetriesExceeded, 3).unwrap();

    match h.messages().as_slice() {
        [WorkerMessage::SyncFailed { count, items }] => {
            assert_eq!(*count, 1);
            assert_eq!(items[0].method, "POST");
            assert_eq!(items[0].retries, 3);
        }
        other => panic!("expected one SYNC_FAILED, got {other:?}"),
    }
}

#[test]
fn test_404_dead_letters_after_one_attempt() {
    let h = Harness::new();
    let id = h.write_offline(Method::Put, "/api/v1/cases/c-17", Some(&case_payload("Renamed")));
    h.transport.push(Method::Put, "/api/v1/cases/c-17", Outcome::status(404));

    h.wait_backoff(0);
    let report = h.drain();
    assert_eq!(report.replayed, 1);
    assert_eq!(h.calls(Method::Put, "/api/v1/cases/c-17"), 1);
    assert_dead_lettered(
        h.worker.store(),
        id,
        DeadLetterReason::ClientError(404),
        0,
    )
    .unwrap();

    // Nothing left to replay.
    h.wait_backoff(5);
    assert_eq!(h.drain().examined, 0);
    assert_eq!(h.calls(Method::Put, "/api/v1/cases/c-17"), 1);
}

#[test]
fn test_successful_replay_deletes_record() {
    let h = Harness::new();
    let body = case_payload("Broken hinge");
    let id = h.write_offline(Method::Post, CASES, Some(&body));
    h.transport.push(Method::Post, CASES, Outcome::status(201));

    h.wait_backoff(0);
    let report = h.drain();
    assert_eq!(report.succeeded, 1);
    assert!(h.worker.store().get(id).unwrap().is_none());
    assert_pending(h.worker.store(), 0).unwrap();
    assert_dead(h.worker.store(), 0).unwrap();
    assert_eq!(h.messages(), vec![WorkerMessage::SyncComplete { synced: 1 }]);
}

#[test]
fn test_replay_never_precedes_backoff() {
    let h = Harness::new();
    let id = h.write_offline(Method::Delete, "/api/v1/cases/c-3", None);
    h.transport
        .always(Method::Delete, "/api/v1/cases/c-3", Outcome::status(503));
    let policy = h.worker.config().retry;

    for retries in 0..policy.max_retries {
        // One millisecond short of the window: no replay.
        h.clock.advance_ms(policy.backoff_ms(retries) - 1);
        let report = h.drain();
        assert_eq!(report.skipped_backoff, 1);
        assert_eq!(
            h.calls(Method::Delete, "/api/v1/cases/c-3"),
            retries as usize
        );

        h.clock.advance_ms(1);
        let report = h.drain();
        assert_eq!(report.replayed, 1);
        let record = h.worker.store().get(id).unwrap().unwrap();
        assert_eq!(record.last_retry_time, h.clock.now_ms());
    }
    assert_eq!(h.calls(Method::Delete, "/api/v1/cases/c-3"), 3);
}

#[test]
fn test_concurrent_drains_replay_once() {
    let h = Harness::new();
    h.write_offline(Method::Post, CASES, Some(&case_payload("Leaking tap")));
    h.transport.always(Method::Post, CASES, Outcome::status(200));
    h.transport.set_latency(Duration::from_millis(50));
    h.wait_backoff(0);

    let drains: Vec<_> = (0..2)
        .map(|_| {
            let worker = Arc::clone(&h.worker);
            thread::spawn(move || worker.sync().unwrap())
        })
        .collect();
    let reports: Vec<_> = drains.into_iter().map(|d| d.join().unwrap()).collect();

    assert_eq!(h.calls(Method::Post, CASES), 1);
    assert_eq!(reports.iter().map(|r| r.succeeded).sum::<usize>(), 1);
    assert_pending(h.worker.store(), 0).unwrap();
}

#[test]
fn test_queue_survives_restart() {
    let h = Harness::new();
    let body = case_payload("Queued before restart");
    let id = h.write_offline(Method::Post, CASES, Some(&body));

    let h = h.restart();
    let record = h.worker.store().get(id).unwrap().unwrap();
    assert_eq!(record.body.as_deref(), Some(body.as_bytes()));
    assert!(record
        .headers
        .iter()
        .any(|(name, value)| name == "Content-Type" && value == "application/json"));

    h.transport.push(Method::Post, CASES, Outcome::status(200));
    h.wait_backoff(0);
    assert_eq!(h.drain().succeeded, 1);
}

#[test]
fn test_non_2xx_live_write_is_queued_and_returned() {
    let h = Harness::new();
    h.transport.push(Method::Patch, "/api/v1/cases/c-9", Outcome::status(502));

    let response = h
        .send(Method::Patch, "/api/v1/cases/c-9", Some(&case_payload("x")))
        .unwrap();
    assert_eq!(response.status, 502);
    assert_pending(h.worker.store(), 1).unwrap();
}

#[derive(Debug, Clone)]
enum Replay {
    Delivered,
    ClientError,
    ServerError,
    NetworkError,
}

fn replay_outcome() -> impl Strategy<Value = Replay> {
    prop_oneof![
        Just(Replay::Delivered),
        Just(Replay::ClientError),
        Just(Replay::ServerError),
        Just(Replay::NetworkError),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_every_record_reaches_one_terminal_state(
        script in proptest::collection::vec(replay_outcome(), 3)
    ) {
        let h = Harness::new();
        let id = h.write_offline(Method::Post, CASES, Some("{}"));
        for step in &script {
            let outcome = match step {
                Replay::Delivered => Outcome::status(200),
                Replay::ClientError => Outcome::status(422),
                Replay::ServerError => Outcome::status(500),
                Replay::NetworkError => Outcome::fail("timed out"),
            };
            h.transport.push(Method::Post, CASES, outcome);
        }

        for _ in 0..6 {
            h.clock.advance_ms(h.worker.config().retry.max_backoff_ms);
            h.drain();
            assert_exclusive(h.worker.store()).unwrap();
        }

        // Terminal: gone from the queue, dead at most once.
        prop_assert!(h.worker.store().get(id).unwrap().is_none());
        let dead = h.worker.store().dead_letters().unwrap();
        prop_assert!(dead.len() <= 1);

        let failures = script
            .iter()
            .take_while(|s| matches!(s, Replay::ServerError | Replay::NetworkError))
            .count();
        match script.get(failures) {
            Some(Replay::Delivered) => prop_assert!(dead.is_empty()),
            Some(Replay::ClientError) => {
                prop_assert_eq!(dead[0].reason, DeadLetterReason::ClientError(422));
                prop_assert_eq!(dead[0].request.retries as usize, failures);
            }
            _ => {
                prop_assert_eq!(dead[0].reason, DeadLetterReason::MaxRetriesExceeded);
                prop_assert_eq!(dead[0].request.retries, 3);
            }
        }
        prop_assert_eq!(h.calls(Method::Post, CASES), (failures + 1).min(3));
    }
}
