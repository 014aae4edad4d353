//! Flow sessions: only what the reaper needs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowkeeper_core::error::Result;
use rusqlite::{params, params_from_iter};

use crate::db::{Store, placeholders, to_millis};

pub struct SessionStore {
    store: Arc<Store>,
}

impl SessionStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn create(&self, org_id: i64, ended_on: Option<DateTime<Utc>>) -> Result<i64> {
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT INTO flow_sessions (org_id, ended_on) VALUES (?1, ?2)",
            params![org_id, ended_on.map(to_millis)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Up to `limit` sessions that ended at or before `threshold`.
    pub fn ended_before(&self, threshold: DateTime<Utc>, limit: usize) -> Result<Vec<i64>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM flow_sessions
             WHERE ended_on IS NOT NULL AND ended_on <= ?1
             ORDER BY id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![to_millis(threshold), limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Delete sessions, first detaching any runs that still point at them.
    /// Runs themselves are never deleted.
    pub fn delete(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let marks = placeholders(ids.len());
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            &format!("UPDATE flow_runs SET session_id = NULL WHERE session_id IN ({marks})"),
            params_from_iter(ids),
        )?;
        let deleted = tx.execute(
            &format!("DELETE FROM flow_sessions WHERE id IN ({marks})"),
            params_from_iter(ids),
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.store.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM flow_sessions", [], |row| row.get(0))?)
    }
}
