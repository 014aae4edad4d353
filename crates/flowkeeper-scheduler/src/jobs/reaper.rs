//! Session reaper: bounded deletion of long-ended sessions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use flowkeeper_core::error::Result;
use flowkeeper_store::{SessionStore, Store};

pub const REAP_BATCH: usize = 1000;
const PROGRESS_EVERY: usize = 10_000;

#[derive(Debug, Clone, PartialEq)]
pub struct ReapReport {
    pub deleted: usize,
    pub threshold: DateTime<Utc>,
    pub elapsed: Duration,
}

impl std::fmt::Display for ReapReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "deleted {} sessions ended before {} in {:?}",
            self.deleted, self.threshold, self.elapsed
        )
    }
}

pub struct SessionReaper {
    sessions: SessionStore,
    trim_days: i64,
}

impl SessionReaper {
    pub fn new(store: Arc<Store>, trim_days: i64) -> Self {
        Self {
            sessions: SessionStore::new(store),
            trim_days,
        }
    }

    pub fn reap(&self) -> Result<ReapReport> {
        self.reap_at(Utc::now())
    }

    pub fn reap_at(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let started = Instant::now();
        let threshold = now - chrono::Duration::days(self.trim_days);
        let mut deleted = 0;
        let mut next_progress = PROGRESS_EVERY;

        loop {
            let ids = self.sessions.ended_before(threshold, REAP_BATCH)?;
            if ids.is_empty() {
                break;
            }
            let n = self.sessions.delete(&ids)?;
            if n == 0 {
                break;
            }
            deleted += n;
            if deleted >= next_progress {
                tracing::info!("🧹 Deleted {} sessions so far ({:?})", deleted, started.elapsed());
                next_progress = (deleted / PROGRESS_EVERY + 1) * PROGRESS_EVERY;
            }
        }

        let report = ReapReport {
            deleted,
            threshold,
            elapsed: started.elapsed(),
        };
        tracing::info!("🧹 Session trim: {}", report);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use flowkeeper_store::{NewRun, RunStore};

    #[test]
    fn test_reaps_old_sessions_in_batches() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let sessions = SessionStore::new(store.clone());
        let runs = RunStore::new(store.clone());
        let now = Utc::now();

        let mut first = None;
        for _ in 0..(REAP_BATCH + 5) {
            let id = sessions.create(1, Some(now - ChronoDuration::days(8))).unwrap();
            first.get_or_insert(id);
        }
        let recent = sessions.create(1, Some(now - ChronoDuration::days(2))).unwrap();
        sessions.create(1, None).unwrap();
        let run = runs
            .insert(&NewRun { org_id: 1, flow_id: 1, session_id: first, ..Default::default() })
            .unwrap();

        let report = SessionReaper::new(store, 7).reap_at(now).unwrap();
        assert_eq!(report.deleted, REAP_BATCH + 5);
        assert_eq!(sessions.count().unwrap(), 2);
        assert!(sessions.ended_before(now, 10).unwrap().contains(&recent));

        // the run survives, detached
        let run = runs.get(run).unwrap().unwrap();
        assert!(run.session_id.is_none());
    }

    #[test]
    fn test_nothing_to_reap() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let report = SessionReaper::new(store, 7).reap().unwrap();
        assert_eq!(report.deleted, 0);
    }
}
