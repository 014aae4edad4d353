//! Periodic maintenance jobs and the registry that runs them under their locks.

pub mod campaigns;
pub mod expiry;
pub mod reaper;
pub mod squash;
pub mod timeouts;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use flowkeeper_core::config::{FlowkeeperConfig, JobConfig, JobsConfig};
use flowkeeper_core::error::Result;
use flowkeeper_store::{LockStore, Store};

use crate::periodic::{PeriodicScheduler, RunOutcome};
use campaigns::{CampaignFireChecker, EventFireTrimmer, TrimReport};
use expiry::{ExpirationManager, ExpirySweeper, SweepReport};
use reaper::{ReapReport, SessionReaper};
use squash::{CounterSquasher, SquashReport};
use timeouts::{ScanReport, TimeoutDetector};

/// Every periodic job. The name doubles as the job's lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    CheckFlows,
    CheckFlowTimeouts,
    SquashFlowPathCounts,
    SquashFlowRunCounts,
    TrimFlowSessions,
    CheckCampaigns,
    TrimEventFires,
}

impl JobKind {
    pub const ALL: [JobKind; 7] = [
        JobKind::CheckFlows,
        JobKind::CheckFlowTimeouts,
        JobKind::SquashFlowPathCounts,
        JobKind::SquashFlowRunCounts,
        JobKind::TrimFlowSessions,
        JobKind::CheckCampaigns,
        JobKind::TrimEventFires,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            JobKind::CheckFlows => "check_flows",
            JobKind::CheckFlowTimeouts => "check_flow_timeouts",
            JobKind::SquashFlowPathCounts => "squash_flowpathcounts",
            JobKind::SquashFlowRunCounts => "squash_flowruncounts",
            JobKind::TrimFlowSessions => "trim_flow_sessions",
            JobKind::CheckCampaigns => "check_campaigns",
            JobKind::TrimEventFires => "trim_event_fires",
        }
    }

    pub fn config<'a>(&self, jobs: &'a JobsConfig) -> &'a JobConfig {
        match self {
            JobKind::CheckFlows => &jobs.check_flows,
            JobKind::CheckFlowTimeouts => &jobs.check_flow_timeouts,
            JobKind::SquashFlowPathCounts => &jobs.squash_flowpathcounts,
            JobKind::SquashFlowRunCounts => &jobs.squash_flowruncounts,
            JobKind::TrimFlowSessions => &jobs.trim_flow_sessions,
            JobKind::CheckCampaigns => &jobs.check_campaigns,
            JobKind::TrimEventFires => &jobs.trim_event_fires,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                let known: Vec<_> = JobKind::ALL.iter().map(|k| k.name()).collect();
                format!("unknown job '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

/// Summary of one completed job run.
#[derive(Debug, Clone, PartialEq)]
pub enum JobReport {
    Expiry(SweepReport),
    Timeouts(ScanReport),
    Squash(SquashReport),
    Sessions(ReapReport),
    Campaigns(ScanReport),
    EventFires(TrimReport),
}

impl fmt::Display for JobReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobReport::Expiry(r) => write!(f, "{r}"),
            JobReport::Timeouts(r) | JobReport::Campaigns(r) => write!(f, "{r}"),
            JobReport::Squash(r) => write!(f, "{r}"),
            JobReport::Sessions(r) => write!(f, "{r}"),
            JobReport::EventFires(r) => write!(f, "{r}"),
        }
    }
}

/// All job bodies, bound to one store and one lock holder.
pub struct Jobs {
    scheduler: Arc<PeriodicScheduler>,
    config: JobsConfig,
    store: Arc<Store>,
    sweeper: ExpirySweeper,
    timeouts: TimeoutDetector,
    squasher: CounterSquasher,
    reaper: SessionReaper,
    campaigns: CampaignFireChecker,
    fire_trimmer: EventFireTrimmer,
}

impl Jobs {
    pub fn new(store: Arc<Store>, config: &FlowkeeperConfig, holder: &str) -> Self {
        let scheduler = Arc::new(PeriodicScheduler::new(LockStore::new(store.clone(), holder)));
        Self {
            scheduler,
            config: config.jobs.clone(),
            sweeper: ExpirySweeper::new(store.clone()),
            timeouts: TimeoutDetector::new(store.clone(), &config.queues.handler),
            squasher: CounterSquasher::new(store.clone()),
            reaper: SessionReaper::new(store.clone(), config.retention.session_trim_days),
            campaigns: CampaignFireChecker::new(store.clone(), &config.queues.handler),
            fire_trimmer: EventFireTrimmer::new(store.clone(), config.retention.fire_trim_days),
            store,
        }
    }

    pub fn scheduler(&self) -> &Arc<PeriodicScheduler> {
        &self.scheduler
    }

    /// Expiration maintenance sharing this registry's lock holder.
    pub fn expirations(&self) -> ExpirationManager {
        ExpirationManager::new(
            self.store.clone(),
            self.scheduler.clone(),
            self.config.check_flows.lock_ttl(),
        )
    }

    /// Run one job under its lock.
    pub fn run(&self, kind: JobKind) -> Result<RunOutcome<JobReport>> {
        let ttl = kind.config(&self.config).lock_ttl();
        self.scheduler.run(kind.name(), kind.name(), ttl, || self.execute(kind))
    }

    fn execute(&self, kind: JobKind) -> Result<JobReport> {
        Ok(match kind {
            JobKind::CheckFlows => JobReport::Expiry(self.sweeper.sweep()?),
            JobKind::CheckFlowTimeouts => JobReport::Timeouts(self.timeouts.check()?),
            JobKind::SquashFlowPathCounts => JobReport::Squash(self.squasher.squash_path_counts()?),
            JobKind::SquashFlowRunCounts => JobReport::Squash(self.squasher.squash_run_counts()?),
            JobKind::TrimFlowSessions => JobReport::Sessions(self.reaper.reap()?),
            JobKind::CheckCampaigns => JobReport::Campaigns(self.campaigns.check()?),
            JobKind::TrimEventFires => JobReport::EventFires(self.fire_trimmer.trim()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_job_names_roundtrip() {
        for kind in JobKind::ALL {
            assert_eq!(kind.name().parse::<JobKind>().unwrap(), kind);
        }
        let err = "squash_everything".parse::<JobKind>().unwrap_err();
        assert!(err.contains("check_flows"));
    }

    #[test]
    fn test_lock_ttls_follow_config() {
        let config = FlowkeeperConfig::default();
        assert_eq!(JobKind::SquashFlowRunCounts.config(&config.jobs).lock_ttl(), Duration::from_secs(7200));
        assert_eq!(JobKind::CheckFlowTimeouts.config(&config.jobs).lock_ttl(), Duration::from_secs(3600));
        assert_eq!(JobKind::TrimEventFires.config(&config.jobs).lock_ttl(), Duration::from_secs(900));
    }

    #[test]
    fn test_run_every_job_on_empty_store() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let jobs = Jobs::new(store, &FlowkeeperConfig::default(), "test");
        for kind in JobKind::ALL {
            let outcome = jobs.run(kind).unwrap();
            assert!(!outcome.is_skipped(), "{kind} was skipped");
        }
        assert!(jobs.scheduler().locks().list_active().unwrap().is_empty());
    }

    #[test]
    fn test_held_lock_skips_job() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let other = LockStore::new(store.clone(), "other");
        other.acquire("trim_flow_sessions", Duration::from_secs(60)).unwrap();

        let jobs = Jobs::new(store, &FlowkeeperConfig::default(), "test");
        assert!(jobs.run(JobKind::TrimFlowSessions).unwrap().is_skipped());
        assert!(!jobs.run(JobKind::CheckFlows).unwrap().is_skipped());
    }
}
