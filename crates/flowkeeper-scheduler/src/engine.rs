//! Worker: the per-process loop.
//! Each enabled job ticks on its own `tokio::time::interval`; the lock decides
//! which worker in the fleet actually runs it. An optional dispatcher loop
//! drains the batch queue alongside.

use std::sync::Arc;
use std::time::Duration;

use flowkeeper_core::FlowkeeperConfig;
use flowkeeper_core::error::Result;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::dispatch::{BatchDispatcher, DispatchOutcome};
use crate::jobs::{JobKind, Jobs};
use crate::periodic::RunOutcome;

/// Lock holder name: configured, or `host:pid`.
pub fn worker_name(config: &FlowkeeperConfig) -> String {
    if let Some(name) = config.worker.name.as_deref().filter(|n| !n.is_empty()) {
        return name.to_string();
    }
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".into());
    format!("{host}:{}", std::process::id())
}

pub struct Worker {
    jobs: Arc<Jobs>,
    dispatcher: Option<Arc<BatchDispatcher>>,
    config: FlowkeeperConfig,
}

impl Worker {
    pub fn new(jobs: Arc<Jobs>, dispatcher: Option<BatchDispatcher>, config: FlowkeeperConfig) -> Self {
        Self {
            jobs,
            dispatcher: dispatcher.map(Arc::new),
            config,
        }
    }

    /// Start every loop and return their handles.
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for kind in JobKind::ALL {
            let job = kind.config(&self.config.jobs);
            if !job.enabled {
                tracing::info!("⏸️ Job '{}' disabled", kind);
                continue;
            }
            handles.push(tokio::spawn(job_loop(self.jobs.clone(), kind, job.interval())));
        }

        if let Some(dispatcher) = &self.dispatcher {
            let idle = Duration::from_millis(self.config.worker.idle_poll_ms.max(1));
            handles.push(tokio::spawn(dispatch_loop(dispatcher.clone(), idle)));
        }
        handles
    }

    /// Run until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let handles = self.spawn();
        tracing::info!(
            "⏰ Worker started: {} loops{}",
            handles.len(),
            if self.dispatcher.is_some() { " (dispatching)" } else { "" }
        );

        tokio::signal::ctrl_c().await?;
        tracing::info!("👋 Shutting down worker");
        for handle in &handles {
            handle.abort();
        }
        futures::future::join_all(handles).await;
        Ok(())
    }
}

async fn job_loop(jobs: Arc<Jobs>, kind: JobKind, every: Duration) {
    tracing::info!("📅 Job '{}' scheduled every {:?}", kind, every);
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        interval.tick().await;
        let jobs = jobs.clone();
        // job bodies are blocking SQLite work
        match tokio::task::spawn_blocking(move || jobs.run(kind)).await {
            Ok(Ok(RunOutcome::Completed(report))) => tracing::info!("✅ {}: {}", kind, report),
            Ok(Ok(RunOutcome::Skipped { .. })) => {}
            Ok(Err(e)) => tracing::warn!("⚠️ {} failed: {e}", kind),
            Err(e) => tracing::error!("❌ {} panicked: {e}", kind),
        }
    }
}

async fn dispatch_loop(dispatcher: Arc<BatchDispatcher>, idle: Duration) {
    tracing::info!("📦 Dispatching from '{}'", dispatcher.queue_name());
    loop {
        match dispatcher.dispatch_next().await {
            Ok(DispatchOutcome::Idle) => tokio::time::sleep(idle).await,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("⚠️ Dispatch failed: {e}");
                tokio::time::sleep(idle).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowkeeper_store::{NewRun, RunStore, Store};

    #[test]
    fn test_worker_name() {
        let mut config = FlowkeeperConfig::default();
        config.worker.name = Some("worker-7".into());
        assert_eq!(worker_name(&config), "worker-7");

        config.worker.name = None;
        let name = worker_name(&config);
        assert!(name.ends_with(&format!(":{}", std::process::id())));
    }

    #[tokio::test]
    async fn test_spawn_skips_disabled_jobs() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut config = FlowkeeperConfig::default();
        config.jobs.trim_event_fires.enabled = false;
        config.jobs.check_campaigns.enabled = false;

        let jobs = Arc::new(Jobs::new(store, &config, "test"));
        let worker = Worker::new(jobs, None, config);
        let handles = worker.spawn();
        assert_eq!(handles.len(), JobKind::ALL.len() - 2);
        for h in handles {
            h.abort();
        }
    }

    #[tokio::test]
    async fn test_job_loop_runs_on_first_tick() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let runs = RunStore::new(store.clone());
        let expired = runs
            .insert(&NewRun {
                org_id: 1,
                flow_id: 1,
                expires_on: Some(chrono::Utc::now() - chrono::Duration::minutes(1)),
                ..Default::default()
            })
            .unwrap();

        let jobs = Arc::new(Jobs::new(store, &FlowkeeperConfig::default(), "test"));
        let handle = tokio::spawn(job_loop(jobs, JobKind::CheckFlows, Duration::from_secs(3600)));

        // the first interval tick fires immediately
        for _ in 0..50 {
            if !runs.get(expired).unwrap().unwrap().is_active {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();
        assert!(!runs.get(expired).unwrap().unwrap().is_active);
    }
}
