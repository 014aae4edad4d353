//! Distributed locks: named, TTL-bound mutexes in the shared store.
//!
//! Acquisition is a single upsert that only overwrites an entry whose TTL has
//! passed, so two workers racing for the same key cannot both win. A holder that
//! crashes simply lets its entry expire.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowkeeper_core::error::Result;
use rusqlite::{OptionalExtension, params};

use crate::db::{Store, from_millis, to_millis};

/// Proof of ownership returned by a successful acquire.
#[derive(Debug, Clone, PartialEq)]
pub struct LockToken {
    pub key: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of a non-blocking acquire.
#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    Acquired(LockToken),
    /// Someone else holds a live lease on the key.
    Held {
        holder: String,
        expires_at: DateTime<Utc>,
    },
}

impl LockOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockOutcome::Acquired(_))
    }
}

/// A live lock, as seen by operators.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LockEntry {
    pub key: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Lock store bound to one holder identity (usually the worker name).
pub struct LockStore {
    store: Arc<Store>,
    holder: String,
}

impl LockStore {
    pub fn new(store: Arc<Store>, holder: impl Into<String>) -> Self {
        Self {
            store,
            holder: holder.into(),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Try to take `key` for `ttl`. Never waits for the current holder.
    pub fn acquire(&self, key: &str, ttl: Duration) -> Result<LockOutcome> {
        self.acquire_at(key, ttl, Utc::now())
    }

    pub fn acquire_at(&self, key: &str, ttl: Duration, now: DateTime<Utc>) -> Result<LockOutcome> {
        let token = uuid::Uuid::new_v4().to_string();
        let now_ms = to_millis(now);
        let expires_ms = now_ms.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64);

        let conn = self.store.conn()?;
        let changed = conn.execute(
            "INSERT INTO locks (key, holder, token, acquired_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                holder = excluded.holder,
                token = excluded.token,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
             WHERE locks.expires_at <= excluded.acquired_at",
            params![key, self.holder, token, now_ms, expires_ms],
        )?;

        if changed == 1 {
            tracing::debug!("🔒 Lock '{}' acquired by {}", key, self.holder);
            return Ok(LockOutcome::Acquired(LockToken {
                key: key.to_string(),
                token,
                expires_at: from_millis(expires_ms),
            }));
        }

        let current: Option<(String, i64)> = conn
            .query_row(
                "SELECT holder, expires_at FROM locks WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        // autocommit: the row we lost to is visible, unless it was released in between
        let (holder, expires_at) = current.unwrap_or_else(|| (String::new(), now_ms));
        Ok(LockOutcome::Held {
            holder,
            expires_at: from_millis(expires_at),
        })
    }

    /// Release early. Only the matching token can; returns false for a stale token.
    pub fn release(&self, token: &LockToken) -> Result<bool> {
        let conn = self.store.conn()?;
        let deleted = conn.execute(
            "DELETE FROM locks WHERE key = ?1 AND token = ?2",
            params![token.key, token.token],
        )?;
        if deleted == 0 {
            tracing::warn!("Lock '{}' was no longer held by {} at release", token.key, self.holder);
        }
        Ok(deleted == 1)
    }

    /// Locks whose TTL has not yet passed.
    pub fn list_active(&self) -> Result<Vec<LockEntry>> {
        self.list_active_at(Utc::now())
    }

    pub fn list_active_at(&self, now: DateTime<Utc>) -> Result<Vec<LockEntry>> {
        let conn = self.store.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, holder, acquired_at, expires_at FROM locks
             WHERE expires_at > ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map([to_millis(now)], |row| {
            Ok(LockEntry {
                key: row.get(0)?,
                holder: row.get(1)?,
                acquired_at: from_millis(row.get(2)?),
                expires_at: from_millis(row.get(3)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
