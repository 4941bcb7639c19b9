//! Bounded, immediate retry of a unit of work.

use crate::error::StoreError;
use anyhow::Result;
use rusqlite::ErrorCode as SqliteCode;
use tracing::{error, warn};

/// How many times a unit of work is attempted before giving up.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 10 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Run `work` until it succeeds, fails terminally, or the attempts run out.
    ///
    /// `work` must be a whole unit: it is re-run from the start on every attempt.
    pub fn run<T, F>(&self, op: &str, mut work: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            match work() {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) => {
                    if attempt >= self.max_attempts {
                        error!(op, attempts = attempt, error = %err, "Retries exhausted");
                        return Err(StoreError::RetriesExhausted {
                            op: op.to_string(),
                            attempts: attempt,
                            last: err.to_string(),
                        }
                        .into());
                    }
                    warn!(op, attempt, error = %err, "Transient store failure, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Lock contention and in-transaction inconsistencies are worth another attempt.
pub fn is_transient(err: &anyhow::Error) -> bool {
    if let Some(rusqlite::Error::SqliteFailure(e, _)) = err.downcast_ref::<rusqlite::Error>() {
        return matches!(e.code, SqliteCode::DatabaseBusy | SqliteCode::DatabaseLocked);
    }
    matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::Inconsistent(_))
    )
}
