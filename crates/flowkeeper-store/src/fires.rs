//! Campaign event fires.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use flowkeeper_core::error::Result;
use rusqlite::types::Value;
use rusqlite::{OptionalExtension, Row, params, params_from_iter};

use crate::db::{Store, from_millis, placeholders, to_millis};

#[derive(Debug, Clone, PartialEq)]
pub struct EventFire {
    pub id: i64,
    pub org_id: i64,
    pub event_id: i64,
    pub flow_id: i64,
    pub scheduled: DateTime<Utc>,
    pub fired: Option<DateTime<Utc>>,
    pub event_active: bool,
    pub engine_managed: bool,
}

#[derive(Debug, Clone)]
pub struct NewFire {
    pub org_id: i64,
    pub event_id: i64,
    pub flow_id: i64,
    pub scheduled: DateTime<Utc>,
    pub event_active: bool,
    pub engine_managed: bool,
}

/// A fire ready to be handed to the event handler.
#[derive(Debug, Clone, PartialEq)]
pub struct DueFire {
    pub id: i64,
    pub event_id: i64,
    pub org_id: i64,
    pub flow_id: i64,
}

pub struct FireStore {
    store: Arc<Store>,
}

impl FireStore {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn insert(&self, fire: &NewFire) -> Result<i64> {
        let conn = self.store.conn()?;
        conn.execute(
            "INSERT INTO event_fires (org_id, event_id, flow_id, scheduled, event_active, engine_managed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                fire.org_id,
                fire.event_id,
                fire.flow_id,
                to_millis(fire.scheduled),
                fire.event_active,
                fire.engine_managed,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get(&self, id: i64) -> Result<Option<EventFire>> {
        let conn = self.store.conn()?;
        let fire = conn
            .query_row(
                "SELECT id, org_id, event_id, flow_id, scheduled, fired, event_active, engine_managed
                 FROM event_fires WHERE id = ?1",
                [id],
                row_to_fire,
            )
            .optional()?;
        Ok(fire)
    }

    /// Unfired fires of active events scheduled at or before `now`, grouped by event.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<DueFire>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, event_id, org_id, flow_id FROM event_fires
             WHERE fired IS NULL AND scheduled <= ?1
               AND event_active = 1 AND engine_managed = 0
             ORDER BY event_id, scheduled, id",
        )?;
        let rows = stmt.query_map([to_millis(now)], |row| {
            Ok(DueFire {
                id: row.get(0)?,
                event_id: row.get(1)?,
                org_id: row.get(2)?,
                flow_id: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Stamp fires as fired. Already-fired ones keep their original time.
    pub fn mark_fired(&self, ids: &[i64], at: DateTime<Utc>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut values = vec![Value::Integer(to_millis(at))];
        values.extend(ids.iter().map(|id| Value::Integer(*id)));
        let conn = self.store.conn()?;
        Ok(conn.execute(
            &format!(
                "UPDATE event_fires SET fired = ?1 WHERE fired IS NULL AND id IN ({})",
                placeholders(ids.len())
            ),
            params_from_iter(values),
        )?)
    }

    pub fn set_event_active(&self, event_id: i64, active: bool) -> Result<usize> {
        let conn = self.store.conn()?;
        Ok(conn.execute(
            "UPDATE event_fires SET event_active = ?1 WHERE event_id = ?2",
            params![active, event_id],
        )?)
    }

    /// Unfired fires whose event was deactivated; they will never fire.
    pub fn inactive_unfired_ids(&self, limit: usize) -> Result<Vec<i64>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM event_fires
             WHERE event_active = 0 AND fired IS NULL
             ORDER BY id LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Fired fires older than `boundary`, oldest first.
    pub fn fired_before(&self, boundary: DateTime<Utc>, limit: usize) -> Result<Vec<i64>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id FROM event_fires
             WHERE fired IS NOT NULL AND fired < ?1
             ORDER BY fired, id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![to_millis(boundary), limit as i64], |row| row.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn delete(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.store.conn()?;
        Ok(conn.execute(
            &format!("DELETE FROM event_fires WHERE id IN ({})", placeholders(ids.len())),
            params_from_iter(ids),
        )?)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.store.conn()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM event_fires", [], |row| row.get(0))?)
    }
}

fn row_to_fire(row: &Row) -> rusqlite::Result<EventFire> {
    Ok(EventFire {
        id: row.get(0)?,
        org_id: row.get(1)?,
        event_id: row.get(2)?,
        flow_id: row.get(3)?,
        scheduled: from_millis(row.get(4)?),
        fired: row.get::<_, Option<i64>>(5)?.map(from_millis),
        event_active: row.get(6)?,
        engine_managed: row.get(7)?,
    })
}
