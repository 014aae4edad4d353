//! Run expiry: the periodic sweep plus triggered expiration maintenance.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowkeeper_core::error::Result;
use flowkeeper_store::{ExitType, RunStore, Store};

use crate::periodic::{PeriodicScheduler, RunOutcome};

/// Runs exited per sweep iteration.
pub const SWEEP_BATCH: usize = 1000;

/// Lock shared by the periodic sweep and forced sweeps.
pub const CHECK_FLOWS_LOCK: &str = "check_flows";

const PAGE: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub batches: usize,
    pub expired: usize,
}

impl std::fmt::Display for SweepReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} runs expired in {} batches", self.expired, self.batches)
    }
}

pub struct ExpirySweeper {
    runs: RunStore,
}

impl ExpirySweeper {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            runs: RunStore::new(store),
        }
    }

    pub fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now())
    }

    /// Exit every run that expired at or before `now`, soonest first.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        loop {
            let ids = self.runs.expired_batch(now, SWEEP_BATCH)?;
            if ids.is_empty() {
                break;
            }
            let exited = self.runs.bulk_exit(&ids, ExitType::Expired, now)?;
            report.batches += 1;
            report.expired += exited;
            if exited == 0 {
                // another sweeper got there first
                break;
            }
        }

        if report.expired > 0 {
            tracing::info!("⌛ Expired {} flow runs", report.expired);
        }
        Ok(report)
    }
}

/// Outcome of recomputing a flow's expirations.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpirationUpdate {
    pub updated: usize,
    pub sweep: RunOutcome<SweepReport>,
}

/// Triggered expiration maintenance for a single flow.
pub struct ExpirationManager {
    runs: RunStore,
    sweeper: ExpirySweeper,
    scheduler: Arc<PeriodicScheduler>,
    sweep_lock_ttl: Duration,
}

impl ExpirationManager {
    pub fn new(store: Arc<Store>, scheduler: Arc<PeriodicScheduler>, sweep_lock_ttl: Duration) -> Self {
        Self {
            runs: RunStore::new(store.clone()),
            sweeper: ExpirySweeper::new(store),
            scheduler,
            sweep_lock_ttl,
        }
    }

    /// Re-derive `expires_on` for the flow's active runs from their last step,
    /// then force an expiry sweep so runs that are now overdue exit right away.
    pub fn update_expirations(&self, flow_id: i64) -> Result<ExpirationUpdate> {
        let mut updated = 0;
        match self.runs.flow_expiration(flow_id)? {
            Some(minutes) => {
                let mut after_id = 0;
                loop {
                    let page = self.runs.active_for_flow(flow_id, after_id, PAGE)?;
                    let Some(last) = page.last() else { break };
                    after_id = last.id;

                    let updates: Vec<(i64, DateTime<Utc>)> = page
                        .iter()
                        .filter_map(|run| {
                            run.last_step()
                                .map(|step| (run.id, step.arrived_on + chrono::Duration::minutes(minutes)))
                        })
                        .collect();
                    updated += self.runs.set_expirations(&updates)?;
                }
                tracing::info!("📝 Updated expiration of {} runs in flow {}", updated, flow_id);
            }
            None => tracing::warn!("Flow {} not found, skipping expiration update", flow_id),
        }

        let sweep = self
            .scheduler
            .run("check_flows", CHECK_FLOWS_LOCK, self.sweep_lock_ttl, || self.sweeper.sweep())?;
        Ok(ExpirationUpdate { updated, sweep })
    }

    /// Exit the given runs. Safe to repeat.
    pub fn bulk_exit(&self, run_ids: &[i64], exit_type: ExitType) -> Result<usize> {
        self.runs.bulk_exit(run_ids, exit_type, Utc::now())
    }

    /// Interrupt every active run of a flow.
    pub fn interrupt_flow(&self, flow_id: i64) -> Result<usize> {
        let now = Utc::now();
        let mut interrupted = 0;
        let mut after_id = 0;
        loop {
            let ids = self.runs.active_ids_for_flow(flow_id, after_id, PAGE)?;
            let Some(&last) = ids.last() else { break };
            after_id = last;
            interrupted += self.runs.bulk_exit(&ids, ExitType::Interrupted, now)?;
        }
        tracing::info!("🛑 Interrupted {} runs in flow {}", interrupted, flow_id);
        Ok(interrupted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use flowkeeper_store::{LockStore, NewRun, PathStep};

    fn setup() -> (Arc<Store>, RunStore) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        (store.clone(), RunStore::new(store))
    }

    fn manager(store: &Arc<Store>) -> ExpirationManager {
        let scheduler = Arc::new(PeriodicScheduler::new(LockStore::new(store.clone(), "test")));
        ExpirationManager::new(store.clone(), scheduler, Duration::from_secs(900))
    }

    fn run_at(flow_id: i64, arrived_on: DateTime<Utc>, expires_on: Option<DateTime<Utc>>) -> NewRun {
        NewRun {
            org_id: 1,
            flow_id,
            expires_on,
            path: vec![PathStep { node_uuid: "n".into(), arrived_on, exit_uuid: None }],
            ..Default::default()
        }
    }

    #[test]
    fn test_sweep_exits_only_expired() {
        let (store, runs) = setup();
        let now = Utc::now();
        let expired = runs.insert(&NewRun { org_id: 1, flow_id: 1, expires_on: Some(now - ChronoDuration::minutes(1)), ..Default::default() }).unwrap();
        let live = runs.insert(&NewRun { org_id: 1, flow_id: 1, expires_on: Some(now + ChronoDuration::minutes(1)), ..Default::default() }).unwrap();
        let remote = runs
            .insert(&NewRun {
                org_id: 2,
                flow_id: 1,
                expires_on: Some(now - ChronoDuration::minutes(1)),
                engine_managed: true,
                ..Default::default()
            })
            .unwrap();

        let report = ExpirySweeper::new(store).sweep_at(now).unwrap();
        assert_eq!(report, SweepReport { batches: 1, expired: 1 });
        assert_eq!(runs.get(expired).unwrap().unwrap().exit_type, Some(ExitType::Expired));
        assert!(runs.get(live).unwrap().unwrap().is_active);
        assert!(runs.get(remote).unwrap().unwrap().is_active);
    }

    #[test]
    fn test_sweep_drains_multiple_batches() {
        let (store, runs) = setup();
        let now = Utc::now();
        for _ in 0..(SWEEP_BATCH + 10) {
            runs.insert(&NewRun { org_id: 1, flow_id: 1, expires_on: Some(now), ..Default::default() }).unwrap();
        }
        let report = ExpirySweeper::new(store).sweep_at(now).unwrap();
        assert_eq!(report.expired, SWEEP_BATCH + 10);
        assert_eq!(report.batches, 2);
    }

    #[test]
    fn test_update_expirations_recomputes_and_sweeps() {
        let (store, runs) = setup();
        let now = Utc::now();
        runs.upsert_flow(5, 1, 60).unwrap();

        // last step 2h ago: overdue under a 60 minute policy
        let stale = runs.insert(&run_at(5, now - ChronoDuration::hours(2), Some(now + ChronoDuration::days(7)))).unwrap();
        // last step 10 minutes ago: expires in 50 minutes
        let fresh = runs.insert(&run_at(5, now - ChronoDuration::minutes(10), Some(now + ChronoDuration::days(7)))).unwrap();
        // no path: left untouched
        let empty = runs
            .insert(&NewRun { org_id: 1, flow_id: 5, expires_on: Some(now + ChronoDuration::days(7)), ..Default::default() })
            .unwrap();

        let result = manager(&store).update_expirations(5).unwrap();
        assert_eq!(result.updated, 2);
        assert_eq!(result.sweep, RunOutcome::Completed(SweepReport { batches: 1, expired: 1 }));

        assert_eq!(runs.get(stale).unwrap().unwrap().exit_type, Some(ExitType::Expired));
        let fresh = runs.get(fresh).unwrap().unwrap();
        assert!(fresh.is_active);
        let expected = fresh.path[0].arrived_on + ChronoDuration::minutes(60);
        assert_eq!(fresh.expires_on.unwrap().timestamp_millis(), expected.timestamp_millis());
        assert!(runs.get(empty).unwrap().unwrap().is_active);
    }

    #[test]
    fn test_forced_sweep_respects_lock() {
        let (store, runs) = setup();
        runs.upsert_flow(5, 1, 60).unwrap();
        let other = LockStore::new(store.clone(), "other-worker");
        assert!(other.acquire(CHECK_FLOWS_LOCK, Duration::from_secs(60)).unwrap().is_acquired());

        let result = manager(&store).update_expirations(5).unwrap();
        assert!(result.sweep.is_skipped());
    }

    #[test]
    fn test_interrupt_flow() {
        let (store, runs) = setup();
        let a = runs.insert(&NewRun { org_id: 1, flow_id: 8, ..Default::default() }).unwrap();
        let b = runs.insert(&NewRun { org_id: 1, flow_id: 8, ..Default::default() }).unwrap();
        let other = runs.insert(&NewRun { org_id: 1, flow_id: 9, ..Default::default() }).unwrap();

        let manager = manager(&store);
        assert_eq!(manager.interrupt_flow(8).unwrap(), 2);
        assert_eq!(manager.interrupt_flow(8).unwrap(), 0);
        for id in [a, b] {
            assert_eq!(runs.get(id).unwrap().unwrap().exit_type, Some(ExitType::Interrupted));
        }
        assert!(runs.get(other).unwrap().unwrap().is_active);
        // already exited runs are not re-exited
        assert_eq!(manager.bulk_exit(&[a, b], ExitType::Expired).unwrap(), 0);
    }
}
