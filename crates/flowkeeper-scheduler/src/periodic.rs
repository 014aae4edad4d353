//! Periodic scheduler: non-overlapping job execution across the fleet.
//!
//! Every worker fires every job on its own cadence; the distributed lock makes
//! sure only one of them actually runs the body at a time. Losers skip quietly.

use std::time::{Duration, Instant};

use flowkeeper_core::error::Result;
use flowkeeper_store::{LockOutcome, LockStore};

/// What a lock-guarded invocation did.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome<T> {
    Completed(T),
    /// Another worker holds the job's lock.
    Skipped { holder: String },
}

impl<T> RunOutcome<T> {
    pub fn is_skipped(&self) -> bool {
        matches!(self, RunOutcome::Skipped { .. })
    }
}

pub struct PeriodicScheduler {
    locks: LockStore,
}

impl PeriodicScheduler {
    pub fn new(locks: LockStore) -> Self {
        Self { locks }
    }

    pub fn locks(&self) -> &LockStore {
        &self.locks
    }

    /// Run `job` under `lock_key`, or skip if someone else holds it.
    ///
    /// The lock is released after the body returns, successfully or not. If the
    /// process dies mid-run the lock simply expires after `ttl`.
    pub fn run<T, F>(&self, job_name: &str, lock_key: &str, ttl: Duration, job: F) -> Result<RunOutcome<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        let token = match self.locks.acquire(lock_key, ttl)? {
            LockOutcome::Acquired(token) => token,
            LockOutcome::Held { holder, expires_at } => {
                tracing::debug!(
                    "Skipping '{}': lock '{}' held by {} until {}",
                    job_name,
                    lock_key,
                    holder,
                    expires_at
                );
                return Ok(RunOutcome::Skipped { holder });
            }
        };

        let started = Instant::now();
        let result = job();

        if let Err(e) = self.locks.release(&token) {
            tracing::warn!("⚠️ Failed to release lock '{}' after '{}': {e}", lock_key, job_name);
        }

        match result {
            Ok(value) => {
                tracing::debug!("'{}' finished on {} in {:?}", job_name, self.locks.holder(), started.elapsed());
                Ok(RunOutcome::Completed(value))
            }
            Err(e) => {
                tracing::error!("❌ Job '{}' failed after {:?}: {e}", job_name, started.elapsed());
                Err(e)
            }
        }
    }
}
