//! Counter squashing.

use std::sync::Arc;

use flowkeeper_core::error::Result;
use flowkeeper_store::{CounterKind, CounterStore, Store};

/// Keys loaded per page.
const KEY_PAGE: usize = 500;
/// Recent runs kept per path segment.
pub const RECENT_RUNS_KEPT: usize = 5;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SquashReport {
    pub keys: usize,
    pub rows: usize,
    pub pruned: usize,
}

impl SquashReport {
    fn merge(&mut self, other: SquashReport) {
        self.keys += other.keys;
        self.rows += other.rows;
        self.pruned += other.pruned;
    }
}

impl std::fmt::Display for SquashReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} rows folded into {} keys, {} recent runs pruned", self.rows, self.keys, self.pruned)
    }
}

pub struct CounterSquasher {
    counts: CounterStore,
}

impl CounterSquasher {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            counts: CounterStore::new(store),
        }
    }

    /// Path counts only; the busiest family gets its own job.
    pub fn squash_path_counts(&self) -> Result<SquashReport> {
        let report = self.squash_kind(CounterKind::Path)?;
        tracing::info!("🧮 squash_flowpathcounts: {}", report);
        Ok(report)
    }

    /// Node, run, category and start counts, plus the recent-run prune.
    pub fn squash_run_counts(&self) -> Result<SquashReport> {
        let mut report = SquashReport::default();
        for kind in [CounterKind::Node, CounterKind::Run, CounterKind::Category] {
            report.merge(self.squash_kind(kind)?);
        }
        report.pruned = self.counts.prune_recent_runs(RECENT_RUNS_KEPT)?;
        report.merge(self.squash_kind(CounterKind::Start)?);
        tracing::info!("🧮 squash_flowruncounts: {}", report);
        Ok(report)
    }

    /// Squash every key of `kind` that has unsquashed rows.
    pub fn squash_kind(&self, kind: CounterKind) -> Result<SquashReport> {
        let mut report = SquashReport::default();
        let mut after = None;
        loop {
            let keys = self.counts.unsquashed_keys(kind, after.as_ref(), KEY_PAGE)?;
            if keys.is_empty() {
                break;
            }
            for key in &keys {
                let folded = self.counts.squash_key(key)?;
                if folded.rows > 0 {
                    report.keys += 1;
                    report.rows += folded.rows;
                }
            }
            after = keys.into_iter().last();
        }
        tracing::debug!("Squashed {} {} keys", report.keys, kind.as_str());
        Ok(report)
    }
}
