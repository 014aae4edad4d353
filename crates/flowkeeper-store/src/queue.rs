//! Partitioned task queue: FIFO per org, fair across orgs.
//!
//! Each (queue, org) pair is a partition with an `active` count of tasks that
//! were popped but not yet completed. `pop_next` serves the partition with the
//! fewest in-flight tasks, so one busy org cannot starve the others, and always
//! takes that org's oldest task. Every successful pop must be followed by exactly
//! one `complete`, or the partition stays marked busy.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowkeeper_core::error::{FlowkeeperError, Result};
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use serde::Serialize;

use crate::db::{Store, from_millis, to_millis};

/// A task taken off the queue.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub id: i64,
    pub queue: String,
    pub org_id: i64,
    pub task_name: String,
    pub payload: serde_json::Value,
    pub enqueued_at: DateTime<Utc>,
}

/// Per-partition depth, for operators.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PartitionStats {
    pub queue: String,
    pub org_id: i64,
    pub pending: i64,
    pub active: i64,
}

/// Producer and consumer side of the shared queue.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<Store>,
}

impl TaskQueue {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Append a task to the org's partition of `queue`.
    pub fn push<T: Serialize>(
        &self,
        queue: &str,
        org_id: i64,
        task_name: &str,
        payload: &T,
    ) -> Result<i64> {
        let payload = serde_json::to_string(payload)?;
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO queue_tasks (queue, org_id, task_name, payload, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![queue, org_id, task_name, payload, to_millis(Utc::now())],
        )?;
        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT OR IGNORE INTO queue_partitions (queue, org_id, active) VALUES (?1, ?2, 0)",
            params![queue, org_id],
        )?;
        tx.commit()?;

        tracing::debug!("📥 Queue[{}] push #{} for org {} ({})", queue, id, org_id, task_name);
        Ok(id)
    }

    /// Take the next task, or `None` when the queue is empty. Never waits.
    pub fn pop_next(&self, queue: &str) -> Result<Option<QueuedTask>> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let head: Option<i64> = tx
            .query_row(
                "SELECT MIN(t.id) AS head
                 FROM queue_partitions p
                 JOIN queue_tasks t ON t.queue = p.queue AND t.org_id = p.org_id
                 WHERE p.queue = ?1
                 GROUP BY p.org_id, p.active
                 ORDER BY p.active ASC, head ASC
                 LIMIT 1",
                [queue],
                |row| row.get(0),
            )
            .optional()?;

        let Some(task_id) = head else {
            return Ok(None);
        };

        let task = tx.query_row(
            "SELECT id, queue, org_id, task_name, payload, enqueued_at FROM queue_tasks WHERE id = ?1",
            [task_id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        )?;
        let (id, queue, org_id, task_name, raw, enqueued_at) = task;
        tx.execute("DELETE FROM queue_tasks WHERE id = ?1", [task_id])?;

        // an undecodable task is dropped without occupying a slot
        let payload = match serde_json::from_str(&raw) {
            Ok(payload) => payload,
            Err(e) => {
                tx.commit()?;
                tracing::error!(
                    "❌ Queue[{}] dropped task #{} for org {} ({}): bad payload {}: {e}",
                    queue, id, org_id, task_name, raw
                );
                return Err(FlowkeeperError::store(format!("task #{id} has an invalid payload: {e}")));
            }
        };

        tx.execute(
            "UPDATE queue_partitions SET active = active + 1 WHERE queue = ?1 AND org_id = ?2",
            params![queue, org_id],
        )?;
        tx.commit()?;

        Ok(Some(QueuedTask {
            id,
            queue,
            org_id,
            task_name,
            payload,
            enqueued_at: from_millis(enqueued_at),
        }))
    }

    /// Release one in-flight slot of the org's partition.
    pub fn complete(&self, queue: &str, org_id: i64) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "UPDATE queue_partitions SET active = MAX(active - 1, 0) WHERE queue = ?1 AND org_id = ?2",
            params![queue, org_id],
        )?;
        Ok(())
    }

    /// Pending task count for `queue`.
    pub fn pending(&self, queue: &str) -> Result<usize> {
        let conn = self.store.conn()?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM queue_tasks WHERE queue = ?1",
            [queue],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Depth and in-flight count of every partition that is not idle.
    pub fn stats(&self) -> Result<Vec<PartitionStats>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT p.queue, p.org_id,
                    (SELECT COUNT(*) FROM queue_tasks t WHERE t.queue = p.queue AND t.org_id = p.org_id),
                    p.active
             FROM queue_partitions p
             ORDER BY p.queue, p.org_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PartitionStats {
                queue: row.get(0)?,
                org_id: row.get(1)?,
                pending: row.get(2)?,
                active: row.get(3)?,
            })
        })?;
        let stats = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stats
            .into_iter()
            .filter(|s| s.pending > 0 || s.active > 0)
            .collect())
    }
}
