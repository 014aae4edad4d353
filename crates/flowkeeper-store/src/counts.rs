//! Append-only flow counters and their compaction.
//!
//! Writers only ever insert small delta rows. The squasher folds every key's
//! unsquashed rows into a single squashed row, bounded by the highest id it
//! read, so deltas written concurrently survive for the next pass and the
//! per-key total never changes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowkeeper_core::error::Result;
use rusqlite::{TransactionBehavior, params};
use serde::Serialize;

use crate::db::{Store, to_millis};

/// Counter families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterKind {
    /// Segment traversals, scope `"{from}:{to}"`.
    Path,
    /// Contacts waiting at a node, scope is the node uuid.
    Node,
    /// Runs per exit type, scope is the exit type (`""` while active).
    Run,
    /// Result categories, scope `"{result}:{category}"`.
    Category,
    /// Contacts per flow start, owner is the start id.
    Start,
}

impl CounterKind {
    pub const ALL: [CounterKind; 5] = [
        CounterKind::Path,
        CounterKind::Node,
        CounterKind::Run,
        CounterKind::Category,
        CounterKind::Start,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CounterKind::Path => "path",
            CounterKind::Node => "node",
            CounterKind::Run => "run",
            CounterKind::Category => "category",
            CounterKind::Start => "start",
        }
    }
}

/// Dimension key of a counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CounterKey {
    pub kind: CounterKind,
    pub owner_id: i64,
    pub scope: String,
}

impl CounterKey {
    pub fn new(kind: CounterKind, owner_id: i64, scope: impl Into<String>) -> Self {
        Self {
            kind,
            owner_id,
            scope: scope.into(),
        }
    }
}

/// What one key's squash folded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SquashResult {
    pub rows: usize,
    pub delta: i64,
}

pub struct CounterStore {
    store: Arc<Store>,
}

impl CounterStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Append a delta row.
    pub fn increment(&self, key: &CounterKey, delta: i64) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT INTO flow_counts (kind, owner_id, scope, count, is_squashed)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![key.kind.as_str(), key.owner_id, key.scope, delta],
        )?;
        Ok(())
    }

    /// Squashed plus unsquashed total.
    pub fn total(&self, key: &CounterKey) -> Result<i64> {
        let conn = self.store.conn()?;
        Ok(conn.query_row(
            "SELECT COALESCE(SUM(count), 0) FROM flow_counts
             WHERE kind = ?1 AND owner_id = ?2 AND scope = ?3",
            params![key.kind.as_str(), key.owner_id, key.scope],
            |row| row.get(0),
        )?)
    }

    pub fn row_count(&self, key: &CounterKey) -> Result<usize> {
        let conn = self.store.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM flow_counts WHERE kind = ?1 AND owner_id = ?2 AND scope = ?3",
            params![key.kind.as_str(), key.owner_id, key.scope],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// One page of keys with unsquashed rows, ordered by (owner, scope), after `after`.
    pub fn unsquashed_keys(
        &self,
        kind: CounterKind,
        after: Option<&CounterKey>,
        limit: usize,
    ) -> Result<Vec<CounterKey>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT owner_id, scope FROM flow_counts
             WHERE kind = ?1 AND is_squashed = 0
               AND (?2 IS NULL OR owner_id > ?2 OR (owner_id = ?2 AND scope > ?3))
             ORDER BY owner_id, scope
             LIMIT ?4",
        )?;
        let rows = stmt.query_map(
            params![
                kind.as_str(),
                after.map(|k| k.owner_id),
                after.map(|k| k.scope.as_str()),
                limit as i64
            ],
            |row| Ok(CounterKey::new(kind, row.get(0)?, row.get::<_, String>(1)?)),
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Fold the key's unsquashed rows into its squashed row.
    ///
    /// Runs as one IMMEDIATE transaction: read the highest unsquashed id and the
    /// sum up to it, delete exactly those rows, add the sum to the squashed row.
    pub fn squash_key(&self, key: &CounterKey) -> Result<SquashResult> {
        let kind = key.kind.as_str();
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (max_id, delta, rows): (Option<i64>, i64, i64) = tx.query_row(
            "SELECT MAX(id), COALESCE(SUM(count), 0), COUNT(*) FROM flow_counts
             WHERE kind = ?1 AND owner_id = ?2 AND scope = ?3 AND is_squashed = 0",
            params![kind, key.owner_id, key.scope],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        let Some(max_id) = max_id else {
            return Ok(SquashResult::default());
        };

        tx.execute(
            "DELETE FROM flow_counts
             WHERE kind = ?1 AND owner_id = ?2 AND scope = ?3 AND is_squashed = 0 AND id <= ?4",
            params![kind, key.owner_id, key.scope, max_id],
        )?;
        let merged = tx.execute(
            "UPDATE flow_counts SET count = count + ?4
             WHERE kind = ?1 AND owner_id = ?2 AND scope = ?3 AND is_squashed = 1",
            params![kind, key.owner_id, key.scope, delta],
        )?;
        if merged == 0 && delta != 0 {
            tx.execute(
                "INSERT INTO flow_counts (kind, owner_id, scope, count, is_squashed)
                 VALUES (?1, ?2, ?3, ?4, 1)",
                params![kind, key.owner_id, key.scope, delta],
            )?;
        }
        tx.commit()?;

        Ok(SquashResult {
            rows: rows as usize,
            delta,
        })
    }

    // ── Recent path sample ─────────────────────────────

    pub fn record_recent_run(
        &self,
        from_uuid: &str,
        to_uuid: &str,
        run_id: i64,
        visited_on: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT INTO flow_path_recent_runs (from_uuid, to_uuid, run_id, visited_on)
             VALUES (?1, ?2, ?3, ?4)",
            params![from_uuid, to_uuid, run_id, to_millis(visited_on)],
        )?;
        Ok(())
    }

    /// Run ids sampled on a segment, newest first.
    pub fn recent_runs(&self, from_uuid: &str, to_uuid: &str) -> Result<Vec<i64>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT run_id FROM flow_path_recent_runs
             WHERE from_uuid = ?1 AND to_uuid = ?2
             ORDER BY visited_on DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![from_uuid, to_uuid], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Keep only the newest `keep` samples per segment.
    pub fn prune_recent_runs(&self, keep: usize) -> Result<usize> {
        let conn = self.store.conn()?;
        let pruned = conn.execute(
            "DELETE FROM flow_path_recent_runs WHERE id IN (
                SELECT id FROM (
                    SELECT id, ROW_NUMBER() OVER (
                        PARTITION BY from_uuid, to_uuid
                        ORDER BY visited_on DESC, id DESC
                    ) AS pos
                    FROM flow_path_recent_runs
                ) WHERE pos > ?1
             )",
            [keep as i64],
        )?;
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{SharedDb, memory};
    use chrono::Duration;

    fn path_key() -> CounterKey {
        CounterKey::new(CounterKind::Path, 12, "a1b2:c3d4")
    }

    #[test]
    fn test_squash_collapses_to_one_row() {
        let counts = CounterStore::new(memory());
        let key = path_key();
        for i in 0..2500 {
            let delta = if i < 330 { -1 } else { 1 };
            counts.increment(&key, delta).unwrap();
        }

        let result = counts.squash_key(&key).unwrap();
        assert_eq!(result.rows, 2500);
        assert_eq!(result.delta, 1840);
        assert_eq!(counts.row_count(&key).unwrap(), 1);
        assert_eq!(counts.total(&key).unwrap(), 1840);
    }

    #[test]
    fn test_total_invariant_across_passes() {
        let counts = CounterStore::new(memory());
        let key = CounterKey::new(CounterKind::Node, 3, "node-1");
        counts.increment(&key, 4).unwrap();
        counts.squash_key(&key).unwrap();
        counts.increment(&key, -1).unwrap();
        counts.increment(&key, 2).unwrap();
        assert_eq!(counts.total(&key).unwrap(), 5);

        counts.squash_key(&key).unwrap();
        assert_eq!(counts.total(&key).unwrap(), 5);
        assert_eq!(counts.row_count(&key).unwrap(), 1);

        // nothing left to fold
        assert_eq!(counts.squash_key(&key).unwrap(), SquashResult::default());
    }

    #[test]
    fn test_keys_do_not_mix() {
        let counts = CounterStore::new(memory());
        let a = CounterKey::new(CounterKind::Run, 1, "EXPIRED");
        let b = CounterKey::new(CounterKind::Run, 1, "INTERRUPTED");
        let c = CounterKey::new(CounterKind::Category, 1, "EXPIRED");
        counts.increment(&a, 3).unwrap();
        counts.increment(&b, 5).unwrap();
        counts.increment(&c, 7).unwrap();
        counts.squash_key(&a).unwrap();

        assert_eq!(counts.total(&a).unwrap(), 3);
        assert_eq!(counts.total(&b).unwrap(), 5);
        assert_eq!(counts.total(&c).unwrap(), 7);
        assert_eq!(counts.row_count(&b).unwrap(), 1);
    }

    #[test]
    fn test_unsquashed_keys_pages() {
        let counts = CounterStore::new(memory());
        for owner in 1..=5 {
            counts.increment(&CounterKey::new(CounterKind::Start, owner, ""), 1).unwrap();
        }
        counts.increment(&CounterKey::new(CounterKind::Path, 1, "x:y"), 1).unwrap();

        let first = counts.unsquashed_keys(CounterKind::Start, None, 2).unwrap();
        assert_eq!(first.iter().map(|k| k.owner_id).collect::<Vec<_>>(), vec![1, 2]);
        let second = counts.unsquashed_keys(CounterKind::Start, first.last(), 10).unwrap();
        assert_eq!(second.iter().map(|k| k.owner_id).collect::<Vec<_>>(), vec![3, 4, 5]);

        for key in first.iter().chain(second.iter()) {
            counts.squash_key(key).unwrap();
        }
        assert!(counts.unsquashed_keys(CounterKind::Start, None, 10).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_writers_and_squashers_lose_nothing() {
        let db = SharedDb::new("squash-race");
        let key = path_key();
        let deltas = [3_i64, 1, 4, 1, 5];

        let writer = {
            let counts = CounterStore::new(db.open());
            let key = key.clone();
            std::thread::spawn(move || {
                for delta in deltas {
                    counts.increment(&key, delta).unwrap();
                    std::thread::yield_now();
                }
            })
        };
        let squashers: Vec<_> = (0..2)
            .map(|_| {
                let counts = CounterStore::new(db.open());
                let key = key.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        counts.squash_key(&key).unwrap();
                        std::thread::yield_now();
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for s in squashers {
            s.join().unwrap();
        }

        let counts = CounterStore::new(db.open());
        counts.squash_key(&key).unwrap();
        assert_eq!(counts.total(&key).unwrap(), 14);
        assert_eq!(counts.row_count(&key).unwrap(), 1);
    }

    #[test]
    fn test_prune_recent_runs_keeps_newest() {
        let counts = CounterStore::new(memory());
        let base = Utc::now();
        for run in 1..=8 {
            counts.record_recent_run("from", "to", run, base + Duration::seconds(run)).unwrap();
        }
        counts.record_recent_run("from", "other", 99, base).unwrap();

        assert_eq!(counts.prune_recent_runs(5).unwrap(), 3);
        assert_eq!(counts.recent_runs("from", "to").unwrap(), vec![8, 7, 6, 5, 4]);
        assert_eq!(counts.recent_runs("from", "other").unwrap(), vec![99]);
    }
}
