//! Campaign event fires: queuing due fires and trimming dead ones.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use flowkeeper_core::error::Result;
use flowkeeper_store::{DedupRecord, FireStore, Store, TaskQueue};

use crate::events::{HANDLE_EVENT_TASK, HandlerEvent};
use crate::jobs::timeouts::ScanReport;

/// Dedup namespace for fires handed to the handler but not yet marked fired.
pub const FIRES_NAMESPACE: &str = "queued_event_fires";
/// Fire ids per handler task.
pub const FIRE_BATCH: usize = 500;
/// Upper bound on fires removed per trim.
pub const TRIM_LIMIT: usize = 100_000;
const TRIM_CHUNK: usize = 100;

pub struct CampaignFireChecker {
    fires: FireStore,
    queued: DedupRecord,
    queue: TaskQueue,
    handler_queue: String,
}

impl CampaignFireChecker {
    pub fn new(store: Arc<Store>, handler_queue: impl Into<String>) -> Self {
        Self {
            fires: FireStore::new(store.clone()),
            queued: DedupRecord::new(store.clone(), FIRES_NAMESPACE),
            queue: TaskQueue::new(store),
            handler_queue: handler_queue.into(),
        }
    }

    pub fn check(&self) -> Result<ScanReport> {
        self.check_at(Utc::now())
    }

    /// Queue due fires, batched per event. Counts are per fire.
    pub fn check_at(&self, now: DateTime<Utc>) -> Result<ScanReport> {
        let due = self.fires.due(now)?;
        let mut report = ScanReport::default();

        for event_fires in due.chunk_by(|a, b| a.event_id == b.event_id) {
            let org_id = event_fires[0].org_id;
            let event_id = event_fires[0].event_id;
            for batch in event_fires.chunks(FIRE_BATCH) {
                let ids: Vec<i64> = batch.iter().map(|f| f.id).collect();
                match self.queue_batch(org_id, &ids, now) {
                    Ok(queued) => {
                        report.queued += queued;
                        report.skipped += ids.len() - queued;
                    }
                    Err(e) => {
                        let ids_str = ids.iter().map(i64::to_string).collect::<Vec<_>>().join(",");
                        tracing::error!("❌ Error queuing fires of event {}: {} ({e})", event_id, ids_str);
                        report.failed += ids.len();
                    }
                }
            }
        }

        if report.total() > 0 {
            tracing::info!("📣 Campaign fires: {}", report);
        }
        Ok(report)
    }

    fn queue_batch(&self, org_id: i64, ids: &[i64], now: DateTime<Utc>) -> Result<usize> {
        let fresh = self.queued.filter_unmarked_at(ids, now)?;
        if fresh.is_empty() {
            return Ok(0);
        }
        let event = HandlerEvent::Fire { fires: fresh.clone() };
        self.queue.push(&self.handler_queue, org_id, HANDLE_EVENT_TASK, &event)?;
        self.queued.mark_at(&fresh, now)?;
        Ok(fresh.len())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrimReport {
    pub deleted: usize,
    pub elapsed: Duration,
}

impl std::fmt::Display for TrimReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "deleted {} event fires in {:?}", self.deleted, self.elapsed)
    }
}

pub struct EventFireTrimmer {
    fires: FireStore,
    trim_days: i64,
}

impl EventFireTrimmer {
    pub fn new(store: Arc<Store>, trim_days: i64) -> Self {
        Self {
            fires: FireStore::new(store),
            trim_days,
        }
    }

    pub fn trim(&self) -> Result<TrimReport> {
        self.trim_at(Utc::now())
    }

    /// Delete orphaned unfired fires first, then the oldest fired ones.
    pub fn trim_at(&self, now: DateTime<Utc>) -> Result<TrimReport> {
        let started = Instant::now();
        let boundary = now - chrono::Duration::days(self.trim_days);

        let mut ids = self.fires.inactive_unfired_ids(TRIM_LIMIT)?;
        if ids.len() < TRIM_LIMIT {
            ids.extend(self.fires.fired_before(boundary, TRIM_LIMIT - ids.len())?);
        }

        let mut deleted = 0;
        for chunk in ids.chunks(TRIM_CHUNK) {
            deleted += self.fires.delete(chunk)?;
        }

        let report = TrimReport {
            deleted,
            elapsed: started.elapsed(),
        };
        tracing::info!("🧹 Event fire trim: {}", report);
        Ok(report)
    }
}
