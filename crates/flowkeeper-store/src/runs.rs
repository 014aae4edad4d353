//! Flow runs: the runnable executions the sweeps act on.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowkeeper_core::error::Result;
use rusqlite::types::{Type, Value};
use rusqlite::{OptionalExtension, Row, params, params_from_iter};
use serde::{Deserialize, Serialize};

use crate::db::{Store, from_millis, placeholders, to_millis};
use crate::dedup::Fingerprint;

/// Ids per `bulk_exit` transaction.
pub const EXIT_CHUNK: usize = 1000;

/// How a run left its flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitType {
    /// Written by the flow engine only.
    Completed,
    Interrupted,
    Expired,
}

impl ExitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitType::Completed => "COMPLETED",
            ExitType::Interrupted => "INTERRUPTED",
            ExitType::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "COMPLETED" => Some(ExitType::Completed),
            "INTERRUPTED" => Some(ExitType::Interrupted),
            "EXPIRED" => Some(ExitType::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One visited node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathStep {
    pub node_uuid: String,
    pub arrived_on: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_uuid: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlowRun {
    pub id: i64,
    pub org_id: i64,
    pub flow_id: i64,
    pub is_active: bool,
    pub expires_on: Option<DateTime<Utc>>,
    pub timeout_on: Option<DateTime<Utc>>,
    pub path: Vec<PathStep>,
    pub exit_type: Option<ExitType>,
    pub exited_on: Option<DateTime<Utc>>,
    pub session_id: Option<i64>,
    pub engine_managed: bool,
    pub modified_on: DateTime<Utc>,
}

impl FlowRun {
    pub fn last_step(&self) -> Option<&PathStep> {
        self.path.last()
    }
}

/// Fields for creating a run.
#[derive(Debug, Clone, Default)]
pub struct NewRun {
    pub org_id: i64,
    pub flow_id: i64,
    pub expires_on: Option<DateTime<Utc>>,
    pub timeout_on: Option<DateTime<Utc>>,
    pub path: Vec<PathStep>,
    pub session_id: Option<i64>,
    pub engine_managed: bool,
}

/// An active run whose wait has timed out.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutCandidate {
    pub id: i64,
    pub org_id: i64,
    pub timeout_on: DateTime<Utc>,
}

impl Fingerprint for TimeoutCandidate {
    // a rescheduled timeout must not be deduplicated against the old one
    fn fingerprint(&self) -> String {
        format!("{}:{}", self.id, self.timeout_on.timestamp())
    }
}

pub struct RunStore {
    store: Arc<Store>,
}

impl RunStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    // ── Flows ──────────────────────────────────────────

    pub fn upsert_flow(&self, flow_id: i64, org_id: i64, expires_after_minutes: i64) -> Result<()> {
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT INTO flows (id, org_id, expires_after_minutes) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                org_id = excluded.org_id,
                expires_after_minutes = excluded.expires_after_minutes",
            params![flow_id, org_id, expires_after_minutes],
        )?;
        Ok(())
    }

    /// Expiration policy of a flow in minutes, `None` for an unknown flow.
    pub fn flow_expiration(&self, flow_id: i64) -> Result<Option<i64>> {
        let conn = self.store.conn()?;
        let minutes = conn
            .query_row(
                "SELECT expires_after_minutes FROM flows WHERE id = ?1",
                [flow_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(minutes)
    }

    // ── Runs ───────────────────────────────────────────

    pub fn insert(&self, run: &NewRun) -> Result<i64> {
        let path = serde_json::to_string(&run.path)?;
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT INTO flow_runs
                (org_id, flow_id, is_active, expires_on, timeout_on, path, session_id, engine_managed, modified_on)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                run.org_id,
                run.flow_id,
                run.expires_on.map(to_millis),
                run.timeout_on.map(to_millis),
                path,
                run.session_id,
                run.engine_managed,
                to_millis(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<FlowRun>> {
        let conn = self.store.conn()?;
        let run = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM flow_runs WHERE id = ?1"),
                [id],
                row_to_run,
            )
            .optional()?;
        Ok(run)
    }

    /// Active, locally managed runs whose timeout has passed.
    pub fn timed_out(&self, now: DateTime<Utc>) -> Result<Vec<TimeoutCandidate>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, org_id, timeout_on FROM flow_runs
             WHERE is_active = 1 AND engine_managed = 0
               AND timeout_on IS NOT NULL AND timeout_on <= ?1
             ORDER BY timeout_on, id",
        )?;
        let rows = stmt.query_map([to_millis(now)], |row| {
            Ok(TimeoutCandidate {
                id: row.get(0)?,
                org_id: row.get(1)?,
                timeout_on: from_millis(row.get(2)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Up to `limit` expired run ids, soonest expiry first.
    pub fn expired_batch(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<i64>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM flow_runs
             WHERE is_active = 1 AND engine_managed = 0 AND exit_type IS NULL
               AND expires_on IS NOT NULL AND expires_on <= ?1
             ORDER BY expires_on, id
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![to_millis(now), limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// One page of a flow's active runs, by id.
    pub fn active_for_flow(&self, flow_id: i64, after_id: i64, limit: usize) -> Result<Vec<FlowRun>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM flow_runs
             WHERE flow_id = ?1 AND is_active = 1 AND id > ?2
             ORDER BY id LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![flow_id, after_id, limit as i64], row_to_run)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn active_ids_for_flow(&self, flow_id: i64, after_id: i64, limit: usize) -> Result<Vec<i64>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM flow_runs
             WHERE flow_id = ?1 AND is_active = 1 AND id > ?2
             ORDER BY id LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![flow_id, after_id, limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Write new expirations in one transaction. Runs that exited meanwhile are left alone.
    pub fn set_expirations(&self, updates: &[(i64, DateTime<Utc>)]) -> Result<usize> {
        if updates.is_empty() {
            return Ok(0);
        }
        let now = to_millis(Utc::now());
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(
                "UPDATE flow_runs SET expires_on = ?1, modified_on = ?2
                 WHERE id = ?3 AND is_active = 1",
            )?;
            for (id, expires_on) in updates {
                changed += stmt.execute(params![to_millis(*expires_on), now, id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Set or clear a run's wait timeout.
    pub fn set_timeout(&self, run_id: i64, timeout_on: Option<DateTime<Utc>>) -> Result<bool> {
        let conn = self.store.conn()?;
        let changed = conn.execute(
            "UPDATE flow_runs SET timeout_on = ?1, modified_on = ?2 WHERE id = ?3 AND is_active = 1",
            params![timeout_on.map(to_millis), to_millis(Utc::now()), run_id],
        )?;
        Ok(changed == 1)
    }

    /// Exit runs with `exit_type`, at most [`EXIT_CHUNK`] per transaction.
    ///
    /// Idempotent: runs that are already inactive or carry an exit type are
    /// skipped, so replays and overlapping sweeps are harmless. Returns the
    /// number of runs actually exited.
    pub fn bulk_exit(&self, ids: &[i64], exit_type: ExitType, now: DateTime<Utc>) -> Result<usize> {
        let mut exited = 0;
        for chunk in ids.chunks(EXIT_CHUNK) {
            let mut values = vec![
                Value::Text(exit_type.as_str().to_string()),
                Value::Integer(to_millis(now)),
            ];
            values.extend(chunk.iter().map(|id| Value::Integer(*id)));

            let mut conn = self.store.conn()?;
            let tx = conn.transaction()?;
            exited += tx.execute(
                &format!(
                    "UPDATE flow_runs SET
                        is_active = 0, exit_type = ?1, exited_on = ?2, modified_on = ?2,
                        expires_on = NULL, timeout_on = NULL
                     WHERE is_active = 1 AND exit_type IS NULL AND id IN ({})",
                    placeholders(chunk.len())
                ),
                params_from_iter(values),
            )?;
            tx.commit()?;
        }
        Ok(exited)
    }
}

const RUN_COLUMNS: &str = "id, org_id, flow_id, is_active, expires_on, timeout_on, path, \
                           exit_type, exited_on, session_id, engine_managed, modified_on";

fn row_to_run(row: &Row) -> rusqlite::Result<FlowRun> {
    let path: String = row.get(6)?;
    let path = serde_json::from_str(&path)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    let exit_type: Option<String> = row.get(7)?;
    Ok(FlowRun {
        id: row.get(0)?,
        org_id: row.get(1)?,
        flow_id: row.get(2)?,
        is_active: row.get(3)?,
        expires_on: row.get::<_, Option<i64>>(4)?.map(from_millis),
        timeout_on: row.get::<_, Option<i64>>(5)?.map(from_millis),
        path,
        exit_type: exit_type.as_deref().and_then(ExitType::parse),
        exited_on: row.get::<_, Option<i64>>(8)?.map(from_millis),
        session_id: row.get(9)?,
        engine_managed: row.get(10)?,
        modified_on: from_millis(row.get(11)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory;
    use chrono::Duration;

    fn step(node: &str, at: DateTime<Utc>) -> PathStep {
        PathStep {
            node_uuid: node.into(),
            arrived_on: at,
            exit_uuid: None,
        }
    }

    #[test]
    fn test_insert_and_get() {
        let runs = RunStore::new(memory());
        let now = Utc::now();
        let id = runs
            .insert(&NewRun {
                org_id: 1,
                flow_id: 10,
                timeout_on: Some(now),
                path: vec![step("n1", now)],
                ..Default::default()
            })
            .unwrap();

        let run = runs.get(id).unwrap().unwrap();
        assert!(run.is_active);
        assert_eq!(run.flow_id, 10);
        assert_eq!(run.last_step().unwrap().node_uuid, "n1");
        assert_eq!(run.timeout_on.unwrap().timestamp_millis(), now.timestamp_millis());
        assert!(runs.get(id + 1).unwrap().is_none());
    }

    #[test]
    fn test_timed_out_skips_engine_managed_and_future() {
        let runs = RunStore::new(memory());
        let now = Utc::now();
        let due = runs
            .insert(&NewRun { org_id: 1, flow_id: 1, timeout_on: Some(now - Duration::minutes(1)), ..Default::default() })
            .unwrap();
        runs.insert(&NewRun { org_id: 1, flow_id: 1, timeout_on: Some(now + Duration::minutes(1)), ..Default::default() })
            .unwrap();
        runs.insert(&NewRun {
            org_id: 2,
            flow_id: 1,
            timeout_on: Some(now - Duration::minutes(1)),
            engine_managed: true,
            ..Default::default()
        })
        .unwrap();

        let candidates = runs.timed_out(now).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, due);
    }

    #[test]
    fn test_bulk_exit_is_idempotent() {
        let runs = RunStore::new(memory());
        let now = Utc::now();
        let ids: Vec<i64> = (0..3)
            .map(|_| {
                runs.insert(&NewRun {
                    org_id: 1,
                    flow_id: 5,
                    expires_on: Some(now),
                    timeout_on: Some(now),
                    ..Default::default()
                })
                .unwrap()
            })
            .collect();

        assert_eq!(runs.bulk_exit(&ids, ExitType::Interrupted, now).unwrap(), 3);
        assert_eq!(runs.bulk_exit(&ids, ExitType::Expired, now).unwrap(), 0);

        let run = runs.get(ids[0]).unwrap().unwrap();
        assert!(!run.is_active);
        assert_eq!(run.exit_type, Some(ExitType::Interrupted));
        assert!(run.expires_on.is_none());
        assert!(run.timeout_on.is_none());
        assert!(run.exited_on.is_some());
    }

    #[test]
    fn test_bulk_exit_spans_chunks() {
        let runs = RunStore::new(memory());
        let now = Utc::now();
        let ids: Vec<i64> = (0..(EXIT_CHUNK + 5))
            .map(|_| runs.insert(&NewRun { org_id: 1, flow_id: 1, ..Default::default() }).unwrap())
            .collect();
        assert_eq!(runs.bulk_exit(&ids, ExitType::Expired, now).unwrap(), EXIT_CHUNK + 5);
        assert!(runs.active_ids_for_flow(1, 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_expired_batch_orders_by_expiry() {
        let runs = RunStore::new(memory());
        let now = Utc::now();
        let late = runs
            .insert(&NewRun { org_id: 1, flow_id: 1, expires_on: Some(now - Duration::minutes(1)), ..Default::default() })
            .unwrap();
        let early = runs
            .insert(&NewRun { org_id: 1, flow_id: 1, expires_on: Some(now - Duration::hours(1)), ..Default::default() })
            .unwrap();
        runs.insert(&NewRun { org_id: 1, flow_id: 1, expires_on: Some(now + Duration::hours(1)), ..Default::default() })
            .unwrap();

        assert_eq!(runs.expired_batch(now, 10).unwrap(), vec![early, late]);
        assert_eq!(runs.expired_batch(now, 1).unwrap(), vec![early]);
    }

    #[test]
    fn test_flow_policy_and_expirations() {
        let runs = RunStore::new(memory());
        assert!(runs.flow_expiration(3).unwrap().is_none());
        runs.upsert_flow(3, 1, 60).unwrap();
        runs.upsert_flow(3, 1, 120).unwrap();
        assert_eq!(runs.flow_expiration(3).unwrap(), Some(120));

        let id = runs.insert(&NewRun { org_id: 1, flow_id: 3, ..Default::default() }).unwrap();
        let at = Utc::now() + Duration::hours(2);
        assert_eq!(runs.set_expirations(&[(id, at)]).unwrap(), 1);
        let run = runs.get(id).unwrap().unwrap();
        assert_eq!(run.expires_on.unwrap().timestamp_millis(), at.timestamp_millis());
    }

    #[test]
    fn test_exit_type_strings() {
        for t in [ExitType::Completed, ExitType::Interrupted, ExitType::Expired] {
            assert_eq!(ExitType::parse(t.as_str()), Some(t));
        }
        assert_eq!(serde_json::to_string(&ExitType::Expired).unwrap(), "\"EXPIRED\"");
        assert!(ExitType::parse("X").is_none());
    }
}
