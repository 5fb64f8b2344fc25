//! Retry Scheduler
//!
//! Drains the queue: every record is evaluated on its own.
//!
//! 1. `retries >= max_retries` → dead-letter (`max_retries_exceeded`)
//! 2. backoff since `lastRetryTime` not elapsed → skip
//! 3. replay:
//!    - 2xx → delete
//!    - 4xx → dead-letter (`client_error_<status>`), retries unchanged
//!    - 5xx, other statuses, no response → `retries += 1`, stays queued
//!
//! Concurrent drains are safe: a record is claimed before it is replayed and
//! re-read after the claim, so at most one replay per record is in flight and
//! a record removed by another drain is skipped.

use std::collections::BTreeSet;
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::Serialize;
use spin::Mutex;
use sync_store::{DeadLetterReason, DeadLetterRecord, QueueStore, QueuedRequest, StoreError};

use crate::clock::Clock;
use crate::config::RetryPolicy;
use crate::error::WorkerError;
use crate::fetch::{Method, Request, Response, Transport};

/// Outcome of one drain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Records seen in the queue.
    pub examined: usize,
    /// Replays sent.
    pub replayed: usize,
    /// Replays that were delivered and removed.
    pub succeeded: usize,
    /// Replays that failed and stay queued.
    pub retried: usize,
    /// Records still inside their backoff window.
    pub skipped_backoff: usize,
    /// Records being handled by a concurrent drain.
    pub skipped_in_flight: usize,
    /// Records whose store operation failed; they are left as they were.
    pub store_errors: usize,
    /// Records moved to the dead-letter ledger by this drain.
    pub dead_lettered: Vec<DeadLetterRecord>,
}

/// Marks a record as being handled; released on drop.
struct Claim<'a> {
    in_flight: &'a Mutex<BTreeSet<u64>>,
    id: u64,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.id);
    }
}

enum Replay {
    Delivered,
    Rejected(u16),
    Failed(String),
}

/// Replays queued writes under a [`RetryPolicy`].
pub struct RetryScheduler {
    store: Arc<QueueStore>,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
    in_flight: Mutex<BTreeSet<u64>>,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<QueueStore>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
            policy,
            in_flight: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn claim(&self, id: u64) -> Option<Claim<'_>> {
        if !self.in_flight.lock().insert(id) {
            return None;
        }
        Some(Claim {
            in_flight: &self.in_flight,
            id,
        })
    }

    /// Run one drain cycle over every queued record.
    ///
    /// Only reading the queue itself can fail the drain; per-record store
    /// failures are logged and counted in the report.
    pub fn drain(&self) -> Result<DrainReport, WorkerError> {
        let queued = self.store.get_all()?;
        let mut report = DrainReport::default();

        for snapshot in queued {
            let Some(id) = snapshot.id else {
                continue;
            };
            report.examined += 1;

            let Some(_claim) = self.claim(id) else {
                debug!("#{} is being replayed by another drain", id);
                report.skipped_in_flight += 1;
                continue;
            };

            if let Err(e) = self.process(id, &mut report) {
                error!("store failure while processing #{}: {}", id, e);
                report.store_errors += 1;
            }
        }

        if report.examined > 0 {
            info!(
                "drain: {} examined, {} delivered, {} retried, {} waiting, {} dead-lettered",
                report.examined,
                report.succeeded,
                report.retried,
                report.skipped_backoff,
                report.dead_lettered.len()
            );
        }
        Ok(report)
    }

    fn process(&self, id: u64, report: &mut DrainReport) -> Result<(), StoreError> {
        // Another drain may have finished this record since the listing.
        let Some(mut record) = self.store.get(id)? else {
            return Ok(());
        };

        let now = self.clock.now_ms();
        if self.policy.is_exhausted(record.retries) {
            self.dead_letter(id, DeadLetterReason::MaxRetriesExceeded, now, report)?;
            return Ok(());
        }
        // Resending cannot repair a record that does not form a request.
        let request = match rebuild(&record) {
            Ok(request) => request,
            Err(reason) => {
                warn!("#{} {} {} is not replayable: {}", id, record.method, record.url, reason);
                self.dead_letter(id, DeadLetterReason::InvalidRequest, now, report)?;
                return Ok(());
            }
        };
        if !self
            .policy
            .is_due(record.retries, record.last_retry_time, now)
        {
            report.skipped_backoff += 1;
            return Ok(());
        }

        report.replayed += 1;
        match self.replay(&request) {
            Replay::Delivered => {
                if self.store.delete(id)? {
                    report.succeeded += 1;
                    debug!("#{} delivered", id);
                }
            }
            Replay::Rejected(status) => {
                self.dead_letter(
                    id,
                    DeadLetterReason::ClientError(status),
                    self.clock.now_ms(),
                    report,
                )?;
            }
            Replay::Failed(reason) => {
                warn!(
                    "#{} {} {} failed (attempt {}): {}",
                    id,
                    record.method,
                    record.url,
                    record.retries + 1,
                    reason
                );
                record.record_failure(self.clock.now_ms(), reason);
                if self.store.update(&record)? {
                    report.retried += 1;
                }
            }
        }
        Ok(())
    }

    fn dead_letter(
        &self,
        id: u64,
        reason: DeadLetterReason,
        now: u64,
        report: &mut DrainReport,
    ) -> Result<(), StoreError> {
        if let Some(moved) = self.store.move_to_dead_letter(id, reason, now)? {
            report.dead_lettered.push(moved);
        }
        Ok(())
    }

    fn replay(&self, request: &Request) -> Replay {
        match self.transport.send(request) {
            Ok(response) => classify(&response),
            Err(e) => Replay::Failed(e.message),
        }
    }
}

fn classify(response: &Response) -> Replay {
    if response.ok() {
        Replay::Delivered
    } else if response.is_client_error() {
        Replay::Rejected(response.status)
    } else {
        Replay::Failed(format!("HTTP {} {}", response.status, response.status_text))
    }
}

/// Reconstruct the original request from its ledger record.
fn rebuild(record: &QueuedRequest) -> Result<Request, String> {
    let method: Method = record.method.parse().map_err(|e| format!("{}", e))?;
    let mut request =
        Request::parse(method, &record.url).map_err(|e| format!("{}", e))?;
    request.headers = record.headers.clone();
    request.body = record.body.clone();
    Ok(request)
}
