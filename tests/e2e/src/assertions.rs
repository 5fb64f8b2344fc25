//! Ledger assertions
//!
//! Each check returns an [`AssertResult`] so scenarios can combine them and
//! report every broken expectation at once.

use sync_store::{DeadLetterReason, QueueStore};

/// Assertion result
pub type AssertResult = Result<(), String>;

/// Assert the number of queued records.
pub fn assert_pending(store: &QueueStore, expected: usize) -> AssertResult {
    let actual = store.count().map_err(|e| e.to_string())?;
    if actual == expected {
        Ok(())
    } else {
        Err(format!("Expected {} pending record(s), found {}", expected, actual))
    }
}

/// Assert the number of dead-lettered records.
pub fn assert_dead(store: &QueueStore, expected: usize) -> AssertResult {
    let actual = store.count_dead_letters().map_err(|e| e.to_string())?;
    if actual == expected {
        Ok(())
    } else {
        Err(format!("Expected {} dead letter(s), found {}", expected, actual))
    }
}

/// Assert that `id` was dead-lettered with `reason` after `retries` failed
/// replays, and is no longer queued.
pub fn assert_dead_lettered(
    store: &QueueStore,
    id: u64,
    reason: DeadLetterReason,
    retries: u32,
) -> AssertResult {
    if store.get(id).map_err(|e| e.to_string())?.is_some() {
        return Err(format!("#{} is still queued", id));
    }
    let dead = store.dead_letters().map_err(|e| e.to_string())?;
    let Some(record) = dead.iter().find(|record| record.request.id == Some(id)) else {
        return Err(format!("#{} is not in the dead-letter ledger", id));
    };
    if record.reason != reason {
        return Err(format!("#{} reason: expected {}, got {}", id, reason, record.reason));
    }
    if record.request.retries != retries {
        return Err(format!(
            "#{} retries: expected {}, got {}",
            id, retries, record.request.retries
        ));
    }
    Ok(())
}

/// Assert no record is both queued and dead-lettered.
pub fn assert_exclusive(store: &QueueStore) -> AssertResult {
    let dead = store.dead_letters().map_err(|e| e.to_string())?;
    for record in &dead {
        let Some(id) = record.request.id else {
            return Err(String::from("dead letter without an id"));
        };
        if store.get(id).map_err(|e| e.to_string())?.is_some() {
            return Err(format!("#{} is both queued and dead-lettered", id));
        }
    }
    Ok(())
}

/// Assert both ledgers are empty.
pub fn assert_ledgers_empty(store: &QueueStore) -> AssertResult {
    assert_pending(store, 0)?;
    assert_dead(store, 0)
}
