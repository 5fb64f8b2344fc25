//! End-to-end scenarios for the offline write-sync worker.
//!
//! The worker runs against a scripted network, a manual clock and an
//! in-memory ledger that survives worker restarts. Scenario tests live in
//! `scenarios/`.

pub mod assertions;
pub mod fixtures;
pub mod harness;

pub use harness::Harness;
