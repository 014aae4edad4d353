//! Timeout detector: turns overdue waits into handler events, once each.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowkeeper_core::error::Result;
use flowkeeper_store::{DedupRecord, RunStore, Store, TaskQueue, TimeoutCandidate};

use crate::events::{HANDLE_EVENT_TASK, HandlerEvent};

/// Dedup namespace for queued timeouts.
pub const TIMEOUTS_NAMESPACE: &str = "flow_timeouts";

/// Result of handling one scanned item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    Queued,
    /// Already queued by an earlier scan.
    Skipped,
    Failed(String),
}

/// Tally of a scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanReport {
    pub queued: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ScanReport {
    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Queued => self.queued += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Failed(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.skipped + self.failed
    }
}

impl std::fmt::Display for ScanReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} queued, {} skipped, {} failed", self.queued, self.skipped, self.failed)
    }
}

pub struct TimeoutDetector {
    runs: RunStore,
    queued: DedupRecord,
    queue: TaskQueue,
    handler_queue: String,
}

impl TimeoutDetector {
    pub fn new(store: Arc<Store>, handler_queue: impl Into<String>) -> Self {
        Self {
            runs: RunStore::new(store.clone()),
            queued: DedupRecord::new(store.clone(), TIMEOUTS_NAMESPACE),
            queue: TaskQueue::new(store),
            handler_queue: handler_queue.into(),
        }
    }

    pub fn check(&self) -> Result<ScanReport> {
        self.check_at(Utc::now())
    }

    /// Scan for overdue timeouts and queue an event for each new one.
    pub fn check_at(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        for candidate in self.runs.timed_out(now)? {
            let outcome = self.queue_timeout(&candidate, now);
            if let ItemOutcome::Failed(reason) = &outcome {
                tracing::error!("❌ Error queuing timeout task for run #{}: {}", candidate.id, reason);
            }
            report.record(&outcome);
        }

        if report.total() > 0 {
            tracing::info!("⏰ Flow timeouts: {}", report);
        }
        Ok(report)
    }

    fn queue_timeout(&self, candidate: &TimeoutCandidate, now: DateTime<Utc>) -> ItemOutcome {
        match self.queued.is_marked_at(candidate, now) {
            Ok(true) => return ItemOutcome::Skipped,
            Ok(false) => {}
            Err(e) => return ItemOutcome::Failed(e.to_string()),
        }

        let event = HandlerEvent::Timeout {
            run: candidate.id,
            timeout_on: candidate.timeout_on,
        };
        // mark only after the push succeeded, so a failed push is retried next scan
        let pushed = self
            .queue
            .push(&self.handler_queue, candidate.org_id, HANDLE_EVENT_TASK, &event)
            .and_then(|_| self.queued.mark_at(std::slice::from_ref(candidate), now));

        match pushed {
            Ok(()) => ItemOutcome::Queued,
            Err(e) => ItemOutcome::Failed(e.to_string()),
        }
    }
}
