//! Dedup records: "already queued" markers that expire on their own.
//!
//! Fingerprints are bucketed by UTC day. A lookup consults today's and
//! yesterday's bucket, and marking purges anything older, so the table never
//! holds more than two days of entries per namespace.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use flowkeeper_core::error::Result;
use rusqlite::params;

use crate::db::{Store, to_millis};

/// Number of day buckets an entry stays visible in.
const RETENTION_DAYS: i64 = 2;

/// Deterministic identity of an entity for deduplication.
///
/// Two scans of an unchanged entity must produce the same fingerprint; a change
/// to the timestamp that matters (e.g. a rescheduled timeout) must produce a new one.
pub trait Fingerprint {
    fn fingerprint(&self) -> String;
}

impl Fingerprint for i64 {
    fn fingerprint(&self) -> String {
        self.to_string()
    }
}

/// Named set of recently handled fingerprints.
pub struct DedupRecord {
    store: Arc<Store>,
    namespace: String,
}

impl DedupRecord {
    pub fn new(store: Arc<Store>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    pub fn is_marked<T: Fingerprint>(&self, entity: &T) -> Result<bool> {
        self.is_marked_at(entity, Utc::now())
    }

    pub fn is_marked_at<T: Fingerprint>(&self, entity: &T, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.store.conn()?;
        let found: i64 = conn.query_row(
            "SELECT COUNT(*) FROM dedup_entries
             WHERE namespace = ?1 AND fingerprint = ?2 AND bucket IN (?3, ?4)",
            params![
                self.namespace,
                entity.fingerprint(),
                bucket(now),
                bucket(now - Duration::days(1)),
            ],
            |row| row.get(0),
        )?;
        Ok(found > 0)
    }

    pub fn mark<T: Fingerprint>(&self, entities: &[T]) -> Result<()> {
        self.mark_at(entities, Utc::now())
    }

    pub fn mark_at<T: Fingerprint>(&self, entities: &[T], now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.store.conn()?;
        let tx = conn.transaction()?;
        {
            let mut insert = tx.prepare(
                "INSERT OR IGNORE INTO dedup_entries (namespace, bucket, fingerprint, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            let today = bucket(now);
            for entity in entities {
                insert.execute(params![self.namespace, today, entity.fingerprint(), to_millis(now)])?;
            }
        }
        let horizon = now - Duration::days(RETENTION_DAYS);
        tx.execute(
            "DELETE FROM dedup_entries WHERE namespace = ?1 AND recorded_at < ?2",
            params![self.namespace, to_millis(horizon)],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The subset of `entities` not yet marked, order preserved.
    pub fn filter_unmarked<T: Fingerprint + Clone>(&self, entities: &[T]) -> Result<Vec<T>> {
        self.filter_unmarked_at(entities, Utc::now())
    }

    pub fn filter_unmarked_at<T: Fingerprint + Clone>(
        &self,
        entities: &[T],
        now: DateTime<Utc>,
    ) -> Result<Vec<T>> {
        let mut unmarked = Vec::with_capacity(entities.len());
        for entity in entities {
            if !self.is_marked_at(entity, now)? {
                unmarked.push(entity.clone());
            }
        }
        Ok(unmarked)
    }
}

fn bucket(at: DateTime<Utc>) -> String {
    at.format("%Y_%m_%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::memory;
    use chrono::TimeZone;

    #[derive(Clone)]
    struct Timeout {
        id: i64,
        timeout_on: DateTime<Utc>,
    }

    impl Fingerprint for Timeout {
        fn fingerprint(&self) -> String {
            format!("{}:{}", self.id, self.timeout_on.timestamp())
        }
    }

    #[test]
    fn test_mark_then_is_marked() {
        let record = DedupRecord::new(memory(), "flow_timeouts");
        let t = Timeout { id: 7, timeout_on: Utc::now() };
        assert!(!record.is_marked(&t).unwrap());
        record.mark(&[t.clone()]).unwrap();
        assert!(record.is_marked(&t).unwrap());
    }

    #[test]
    fn test_changed_timestamp_is_new_fingerprint() {
        let record = DedupRecord::new(memory(), "flow_timeouts");
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let original = Timeout { id: 7, timeout_on: at };
        record.mark(&[original]).unwrap();

        let rescheduled = Timeout { id: 7, timeout_on: at + Duration::minutes(5) };
        assert!(!record.is_marked(&rescheduled).unwrap());
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let store = memory();
        let timeouts = DedupRecord::new(store.clone(), "flow_timeouts");
        let fires = DedupRecord::new(store, "queued_event_fires");
        timeouts.mark(&[42_i64]).unwrap();
        assert!(!fires.is_marked(&42_i64).unwrap());
    }

    #[test]
    fn test_entries_expire_after_retention() {
        let record = DedupRecord::new(memory(), "flow_timeouts");
        let day0 = Utc.with_ymd_and_hms(2026, 3, 1, 23, 30, 0).unwrap();
        record.mark_at(&[1_i64], day0).unwrap();

        // next day still sees yesterday's bucket
        assert!(record.is_marked_at(&1_i64, day0 + Duration::hours(1)).unwrap());
        // two days on it is gone
        assert!(!record.is_marked_at(&1_i64, day0 + Duration::days(2)).unwrap());

        // and a later mark purges it physically
        record.mark_at(&[2_i64], day0 + Duration::days(3)).unwrap();
        let rows: i64 = record
            .store
            .conn()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM dedup_entries", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_filter_unmarked_keeps_order() {
        let record = DedupRecord::new(memory(), "queued_event_fires");
        record.mark(&[2_i64, 4]).unwrap();
        let fresh = record.filter_unmarked(&[1_i64, 2, 3, 4, 5]).unwrap();
        assert_eq!(fresh, vec![1, 3, 5]);
    }
}
