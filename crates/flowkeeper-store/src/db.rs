//! Shared store: one SQLite file per deployment, one connection per process.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowkeeper_core::error::{FlowkeeperError, Result};
use rusqlite::Connection;

/// Handle on the shared store.
///
/// Each worker process opens its own `Store` on the same database file. SQLite
/// serializes writers across processes, and the busy timeout turns short write
/// contention into a bounded wait instead of an error.
pub struct Store {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl Store {
    /// Open or create the store with the default busy timeout.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, Duration::from_millis(5000))
    }

    /// Open or create the store at `path`.
    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        // WAL lets readers proceed while a worker holds the write lock
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Private in-memory store, for tests and one-shot tooling.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        };
        store.migrate()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run schema migrations.
    fn migrate(&self) -> Result<()> {
        self.conn()?.execute_batch(
            "
            -- Distributed locks (one live row per key)
            CREATE TABLE IF NOT EXISTS locks (
                key TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                token TEXT NOT NULL,
                acquired_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            -- Dedup fingerprints, bucketed by UTC day
            CREATE TABLE IF NOT EXISTS dedup_entries (
                namespace TEXT NOT NULL,
                bucket TEXT NOT NULL,
                fingerprint TEXT NOT NULL,
                recorded_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, bucket, fingerprint)
            );
            CREATE INDEX IF NOT EXISTS idx_dedup_recorded ON dedup_entries(namespace, recorded_at);

            -- Partitioned task queue
            CREATE TABLE IF NOT EXISTS queue_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                org_id INTEGER NOT NULL,
                task_name TEXT NOT NULL,
                payload TEXT NOT NULL,           -- JSON
                enqueued_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_queue_tasks_partition ON queue_tasks(queue, org_id, id);

            CREATE TABLE IF NOT EXISTS queue_partitions (
                queue TEXT NOT NULL,
                org_id INTEGER NOT NULL,
                active INTEGER NOT NULL DEFAULT 0,   -- popped but not yet completed
                PRIMARY KEY (queue, org_id)
            );

            -- Flow expiration policy
            CREATE TABLE IF NOT EXISTS flows (
                id INTEGER PRIMARY KEY,
                org_id INTEGER NOT NULL,
                expires_after_minutes INTEGER NOT NULL DEFAULT 10080
            );

            CREATE TABLE IF NOT EXISTS flow_sessions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                org_id INTEGER NOT NULL,
                ended_on INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_flow_sessions_ended ON flow_sessions(ended_on);

            CREATE TABLE IF NOT EXISTS flow_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                org_id INTEGER NOT NULL,
                flow_id INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                expires_on INTEGER,
                timeout_on INTEGER,
                path TEXT NOT NULL DEFAULT '[]',     -- JSON array of steps
                exit_type TEXT,
                exited_on INTEGER,
                session_id INTEGER,
                engine_managed INTEGER NOT NULL DEFAULT 0,
                modified_on INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_flow_runs_expires ON flow_runs(is_active, expires_on);
            CREATE INDEX IF NOT EXISTS idx_flow_runs_timeout ON flow_runs(is_active, timeout_on);
            CREATE INDEX IF NOT EXISTS idx_flow_runs_flow ON flow_runs(flow_id, is_active);
            CREATE INDEX IF NOT EXISTS idx_flow_runs_session ON flow_runs(session_id);

            -- Append-only counters; AUTOINCREMENT keeps ids monotonic for squashing
            CREATE TABLE IF NOT EXISTS flow_counts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                owner_id INTEGER NOT NULL,
                scope TEXT NOT NULL DEFAULT '',
                count INTEGER NOT NULL,
                is_squashed INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_flow_counts_key ON flow_counts(kind, is_squashed, owner_id, scope);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_flow_counts_squashed
                ON flow_counts(kind, owner_id, scope) WHERE is_squashed = 1;

            CREATE TABLE IF NOT EXISTS flow_path_recent_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_uuid TEXT NOT NULL,
                to_uuid TEXT NOT NULL,
                run_id INTEGER NOT NULL,
                visited_on INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_recent_runs_path
                ON flow_path_recent_runs(from_uuid, to_uuid, visited_on);

            -- Campaign event fires
            CREATE TABLE IF NOT EXISTS event_fires (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                org_id INTEGER NOT NULL,
                event_id INTEGER NOT NULL,
                flow_id INTEGER NOT NULL,
                scheduled INTEGER NOT NULL,
                fired INTEGER,
                event_active INTEGER NOT NULL DEFAULT 1,
                engine_managed INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_event_fires_due ON event_fires(fired, scheduled);
            ",
        )?;
        Ok(())
    }

    /// Lock the connection for one operation.
    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| FlowkeeperError::store("store connection poisoned"))
    }
}

/// Timestamps are stored as epoch milliseconds.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// `?,?,?` for an `IN (...)` list of `n` values.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Store;
    use std::path::PathBuf;
    use std::sync::Arc;

    /// Temp database file shared by several `Store` handles, removed on drop.
    pub struct SharedDb {
        pub path: PathBuf,
    }

    impl SharedDb {
        pub fn new(label: &str) -> Self {
            let path = std::env::temp_dir().join(format!(
                "flowkeeper-{label}-{}.db",
                uuid::Uuid::new_v4()
            ));
            Self { path }
        }

        pub fn open(&self) -> Arc<Store> {
            Arc::new(Store::open(&self.path).unwrap())
        }
    }

    impl Drop for SharedDb {
        fn drop(&mut self) {
            for suffix in ["", "-wal", "-shm"] {
                let mut p = self.path.clone().into_os_string();
                p.push(suffix);
                std::fs::remove_file(PathBuf::from(p)).ok();
            }
        }
    }

    pub fn memory() -> Arc<Store> {
        Arc::new(Store::open_in_memory().unwrap())
    }
}
