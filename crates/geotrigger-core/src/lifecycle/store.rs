//! LifecycleStore: SQLite-backed match-event lifecycle tracking.
//!
//! Provides the Pending → Completed/Rejected state machine with:
//! - Idempotent pending inserts keyed by the event identity tuple
//! - Idempotent completion, deduplicated on the completion dedup key
//! - Execution history for the trailing-window rate gate
//! - A durable reconciliation outbox for completions whose bookkeeping
//!   call failed after the transaction already landed on-chain

use super::schema::LIFECYCLE_SCHEMA;
use crate::errors::StoreError;
use crate::model::{CompletedRecord, EventKey, MatchEvent};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Receipt from a completion call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompleteReceipt {
    /// True if this call created the visible completion record; false on an
    /// idempotent retry or a duplicate upstream report.
    pub was_new: bool,
    /// True if this call moved an event out of Pending. False when the
    /// event was already terminal or unknown (tolerated, not an error).
    pub transitioned: bool,
}

/// A pending match event as read back from the store.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub seq: i64,
    pub event: MatchEvent,
}

/// One entry in the reconciliation outbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub id: i64,
    pub rule_id: i64,
    pub matched_public_key: String,
    pub update_id: Option<i64>,
    pub transaction_hash: String,
    pub attempts: u32,
}

const UPDATE_SENTINEL: &str = "no-update";

fn update_key(update_id: Option<i64>) -> String {
    update_id
        .map(|u| u.to_string())
        .unwrap_or_else(|| UPDATE_SENTINEL.to_string())
}

fn validate_key(rule_id: i64, matched_public_key: &str) -> Result<(), StoreError> {
    if rule_id <= 0 {
        return Err(StoreError::MalformedKey {
            reason: format!("rule_id must be positive, got {}", rule_id),
        });
    }
    if matched_public_key.trim().is_empty() {
        return Err(StoreError::MalformedKey {
            reason: "matched_public_key is empty".to_string(),
        });
    }
    Ok(())
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// SQLite-backed lifecycle store.
#[derive(Clone)]
pub struct LifecycleStore {
    conn: Arc<Mutex<Connection>>,
}

impl LifecycleStore {
    /// Open a file-backed store.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_connection(conn: &Connection) -> Result<(), StoreError> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        // WAL mode for file-backed DBs (no-op for in-memory)
        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        conn.execute_batch(LIFECYCLE_SCHEMA)?;
        Ok(())
    }

    /// Idempotent insert of a match event. Returns true when the event is
    /// new; a duplicate insert with the same identity tuple is a no-op.
    pub fn mark_pending(&self, event: &MatchEvent) -> Result<bool, StoreError> {
        validate_key(event.rule_id, &event.matched_public_key)?;
        let params_json = serde_json::to_string(&event.function_parameters)
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            r#"
            INSERT INTO events (
                rule_id, matched_public_key, update_id, update_key,
                matched_at, latitude, longitude, dwell_seconds,
                parameters, message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(rule_id, matched_public_key, update_key) DO NOTHING
            "#,
            params![
                event.rule_id,
                event.matched_public_key,
                event.update_id,
                update_key(event.update_id),
                event.matched_at.to_rfc3339(),
                event.location.map(|(lat, _)| lat),
                event.location.map(|(_, lon)| lon),
                event.dwell_seconds,
                params_json,
                event.message,
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Transition an event to Completed and record the visible completion.
    ///
    /// Safe to call twice with the same arguments: the completion record is
    /// keyed by the dedup key and the state update only fires while the
    /// event is still Pending. Unknown or already-terminal events are
    /// tolerated (state may have been mutated concurrently by another
    /// operator or the batch path).
    pub fn complete(
        &self,
        rule_id: i64,
        matched_public_key: &str,
        update_id: Option<i64>,
        transaction_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CompleteReceipt, StoreError> {
        validate_key(rule_id, matched_public_key)?;
        let conn = self.conn.lock().unwrap();

        // BEGIN IMMEDIATE acquires the write lock up front
        conn.execute("BEGIN IMMEDIATE", [])?;
        let result =
            Self::complete_inner(&conn, rule_id, matched_public_key, update_id, transaction_hash, now);
        match &result {
            Ok(_) => {
                conn.execute("COMMIT", [])?;
            }
            Err(_) => {
                let _ = conn.execute("ROLLBACK", []);
            }
        }
        result
    }

    fn complete_inner(
        conn: &Connection,
        rule_id: i64,
        matched_public_key: &str,
        update_id: Option<i64>,
        transaction_hash: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<CompleteReceipt, StoreError> {
        // Select by the full identity tuple when the update id is known,
        // otherwise fall back to the most recent pending match for the pair.
        let seq: Option<i64> = match update_id {
            Some(_) => conn
                .query_row(
                    r#"
                    SELECT seq FROM events
                    WHERE rule_id = ?1 AND matched_public_key = ?2
                      AND update_key = ?3 AND state = 'pending'
                    "#,
                    params![rule_id, matched_public_key, update_key(update_id)],
                    |row| row.get(0),
                )
                .optional()?,
            None => conn
                .query_row(
                    r#"
                    SELECT seq FROM events
                    WHERE rule_id = ?1 AND matched_public_key = ?2
                      AND state = 'pending'
                    ORDER BY seq DESC LIMIT 1
                    "#,
                    params![rule_id, matched_public_key],
                    |row| row.get(0),
                )
                .optional()?,
        };

        let transitioned = match seq {
            Some(seq) => {
                conn.execute(
                    "UPDATE events SET state = 'completed' WHERE seq = ?1 AND state = 'pending'",
                    params![seq],
                )? > 0
            }
            None => false,
        };

        let dedup = CompletedRecord {
            rule_id,
            matched_public_key: matched_public_key.to_string(),
            update_id,
            transaction_hash: transaction_hash.map(str::to_string),
            completed_at: now,
        }
        .dedup_key();

        let was_new = conn.execute(
            r#"
            INSERT INTO completions (
                dedup_key, rule_id, matched_public_key, update_id,
                transaction_hash, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(dedup_key) DO NOTHING
            "#,
            params![
                dedup,
                rule_id,
                matched_public_key,
                update_id,
                transaction_hash,
                now.to_rfc3339(),
            ],
        )? > 0;

        if was_new {
            conn.execute(
                "INSERT INTO executions (rule_id, matched_public_key, executed_at) VALUES (?1, ?2, ?3)",
                params![rule_id, matched_public_key, now.to_rfc3339()],
            )?;
        }

        Ok(CompleteReceipt {
            was_new,
            transitioned,
        })
    }

    /// Transition a pending match to Rejected. Irreversible. Targets the
    /// exact identity tuple when the update id is known, otherwise the most
    /// recent pending match for the pair. Unknown events are tolerated.
    pub fn reject(
        &self,
        rule_id: i64,
        matched_public_key: &str,
        update_id: Option<i64>,
    ) -> Result<bool, StoreError> {
        validate_key(rule_id, matched_public_key)?;
        let conn = self.conn.lock().unwrap();
        let changed = match update_id {
            Some(_) => conn.execute(
                r#"
                UPDATE events SET state = 'rejected'
                WHERE rule_id = ?1 AND matched_public_key = ?2
                  AND update_key = ?3 AND state = 'pending'
                "#,
                params![rule_id, matched_public_key, update_key(update_id)],
            )?,
            None => conn.execute(
                r#"
                UPDATE events SET state = 'rejected'
                WHERE seq = (
                    SELECT seq FROM events
                    WHERE rule_id = ?1 AND matched_public_key = ?2 AND state = 'pending'
                    ORDER BY seq DESC LIMIT 1
                )
                "#,
                params![rule_id, matched_public_key],
            )?,
        };
        Ok(changed > 0)
    }

    /// Pending events in insertion order.
    pub fn list_pending(&self) -> Result<Vec<PendingEvent>, StoreError> {
        self.list_events("pending")
    }

    /// Rejected events in insertion order.
    pub fn list_rejected(&self) -> Result<Vec<PendingEvent>, StoreError> {
        self.list_events("rejected")
    }

    fn list_events(&self, state: &str) -> Result<Vec<PendingEvent>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT seq, rule_id, matched_public_key, update_id, matched_at,
                   latitude, longitude, dwell_seconds, parameters, message
            FROM events WHERE state = ?1 ORDER BY seq
            "#,
        )?;
        let rows = stmt.query_map(params![state], |row| {
            let seq: i64 = row.get(0)?;
            let rule_id: i64 = row.get(1)?;
            let matched_public_key: String = row.get(2)?;
            let update_id: Option<i64> = row.get(3)?;
            let matched_at: String = row.get(4)?;
            let latitude: Option<f64> = row.get(5)?;
            let longitude: Option<f64> = row.get(6)?;
            let dwell_seconds: Option<i64> = row.get(7)?;
            let parameters: String = row.get(8)?;
            let message: String = row.get(9)?;
            Ok((
                seq,
                rule_id,
                matched_public_key,
                update_id,
                matched_at,
                latitude,
                longitude,
                dwell_seconds,
                parameters,
                message,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (seq, rule_id, matched_public_key, update_id, matched_at, lat, lon, dwell, params_json, message) =
                row?;
            let function_parameters: BTreeMap<String, serde_json::Value> =
                serde_json::from_str(&params_json).unwrap_or_default();
            out.push(PendingEvent {
                seq,
                event: MatchEvent {
                    rule_id,
                    matched_public_key,
                    matched_at: parse_ts(&matched_at),
                    location: lat.zip(lon),
                    update_id,
                    dwell_seconds: dwell,
                    function_parameters,
                    message,
                },
            });
        }
        Ok(out)
    }

    /// Completed records. The dedup rule is enforced at insert time, so the
    /// view is already collapsed to one record per dedup key.
    pub fn list_completed(&self) -> Result<Vec<CompletedRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT rule_id, matched_public_key, update_id, transaction_hash, completed_at
            FROM completions ORDER BY completed_at, dedup_key
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            let rule_id: i64 = row.get(0)?;
            let matched_public_key: String = row.get(1)?;
            let update_id: Option<i64> = row.get(2)?;
            let transaction_hash: Option<String> = row.get(3)?;
            let completed_at: String = row.get(4)?;
            Ok((rule_id, matched_public_key, update_id, transaction_hash, completed_at))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (rule_id, matched_public_key, update_id, transaction_hash, completed_at) = row?;
            out.push(CompletedRecord {
                rule_id,
                matched_public_key,
                update_id,
                transaction_hash,
                completed_at: parse_ts(&completed_at),
            });
        }
        Ok(out)
    }

    /// Whether the event identified by `key` is still pending.
    pub fn is_pending(&self, key: &EventKey) -> Result<bool, StoreError> {
        validate_key(key.rule_id, &key.matched_public_key)?;
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                r#"
                SELECT seq FROM events
                WHERE rule_id = ?1 AND matched_public_key = ?2
                  AND update_key = ?3 AND state = 'pending'
                "#,
                params![key.rule_id, key.matched_public_key, update_key(key.update_id)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Executions recorded for the identity since `since`. Feeds the
    /// trailing-window rate limit.
    pub fn executions_since(
        &self,
        rule_id: i64,
        matched_public_key: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, StoreError> {
        validate_key(rule_id, matched_public_key)?;
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM executions
            WHERE rule_id = ?1 AND matched_public_key = ?2 AND executed_at >= ?3
            "#,
            params![rule_id, matched_public_key, since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// Enqueue a completion whose bookkeeping call failed. Idempotent on
    /// (rule_id, matched_public_key, transaction_hash).
    pub fn outbox_push(
        &self,
        rule_id: i64,
        matched_public_key: &str,
        update_id: Option<i64>,
        transaction_hash: &str,
    ) -> Result<(), StoreError> {
        validate_key(rule_id, matched_public_key)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO outbox (rule_id, matched_public_key, update_id, transaction_hash)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(rule_id, matched_public_key, transaction_hash) DO NOTHING
            "#,
            params![rule_id, matched_public_key, update_id, transaction_hash],
        )?;
        Ok(())
    }

    /// Outbox entries in insertion order.
    pub fn outbox_entries(&self) -> Result<Vec<OutboxEntry>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, rule_id, matched_public_key, update_id, transaction_hash, attempts
            FROM outbox ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(OutboxEntry {
                id: row.get(0)?,
                rule_id: row.get(1)?,
                matched_public_key: row.get(2)?,
                update_id: row.get(3)?,
                transaction_hash: row.get(4)?,
                attempts: row.get::<_, i64>(5)? as u32,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn outbox_bump_attempts(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE outbox SET attempts = attempts + 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(())
    }

    pub fn outbox_remove(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
        Ok(())
    }

    /// Force subsequent completion calls to fail, so tests can exercise the
    /// reconciliation fallback.
    #[cfg(test)]
    pub(crate) fn drop_completions_table(&self) {
        let conn = self.conn.lock().unwrap();
        conn.execute("DROP TABLE completions", []).unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn event(rule_id: i64, pk: &str, update_id: Option<i64>) -> MatchEvent {
        MatchEvent {
            rule_id,
            matched_public_key: pk.to_string(),
            matched_at: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            location: Some((52.37, 4.89)),
            update_id,
            dwell_seconds: Some(120),
            function_parameters: BTreeMap::new(),
            message: "wallet entered geofence".to_string(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 5, 0).unwrap()
    }

    #[test]
    fn mark_pending_is_idempotent() {
        let store = LifecycleStore::memory().unwrap();
        assert!(store.mark_pending(&event(5, "W1", Some(42))).unwrap());
        assert!(!store.mark_pending(&event(5, "W1", Some(42))).unwrap());
        assert_eq!(store.list_pending().unwrap().len(), 1);
    }

    #[test]
    fn complete_twice_yields_one_visible_record() {
        let store = LifecycleStore::memory().unwrap();
        store.mark_pending(&event(5, "W1", Some(42))).unwrap();

        let first = store.complete(5, "W1", Some(42), Some("abc123"), now()).unwrap();
        assert!(first.was_new);
        assert!(first.transitioned);

        let second = store.complete(5, "W1", Some(42), Some("abc123"), now()).unwrap();
        assert!(!second.was_new);
        assert!(!second.transitioned);

        let completed = store.list_completed().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].dedup_key(), "5_abc123_42_W1");
        assert!(store.list_pending().unwrap().is_empty());
    }

    #[test]
    fn complete_without_update_id_targets_most_recent_pending() {
        let store = LifecycleStore::memory().unwrap();
        store.mark_pending(&event(5, "W1", Some(1))).unwrap();
        store.mark_pending(&event(5, "W1", Some(2))).unwrap();

        let receipt = store.complete(5, "W1", None, Some("tx1"), now()).unwrap();
        assert!(receipt.transitioned);

        // The older match (update 1) is still pending
        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.update_id, Some(1));
    }

    #[test]
    fn complete_of_unknown_event_is_tolerated() {
        let store = LifecycleStore::memory().unwrap();
        let receipt = store.complete(9, "W9", Some(7), Some("txZ"), now()).unwrap();
        assert!(!receipt.transitioned);
        // The completion record is still visible for reconciliation reads
        assert!(receipt.was_new);
    }

    #[test]
    fn malformed_key_is_the_only_hard_error() {
        let store = LifecycleStore::memory().unwrap();
        assert!(matches!(
            store.complete(0, "W1", None, None, now()),
            Err(StoreError::MalformedKey { .. })
        ));
        assert!(matches!(
            store.reject(5, "  ", None),
            Err(StoreError::MalformedKey { .. })
        ));
    }

    #[test]
    fn sentinel_dedup_collapses_hashless_completions() {
        // Known behavior: two genuinely different completions that both
        // lack a transaction hash and update id collapse to one record.
        let store = LifecycleStore::memory().unwrap();
        store.complete(5, "W1", None, None, now()).unwrap();
        let second = store.complete(5, "W1", None, None, now()).unwrap();
        assert!(!second.was_new);
        assert_eq!(store.list_completed().unwrap().len(), 1);
    }

    #[test]
    fn reject_targets_the_named_update() {
        let store = LifecycleStore::memory().unwrap();
        store.mark_pending(&event(5, "W1", Some(1))).unwrap();
        store.mark_pending(&event(5, "W1", Some(2))).unwrap();

        assert!(store.reject(5, "W1", Some(1)).unwrap());

        // The newer match (update 2) must be untouched
        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.update_id, Some(2));
        assert_eq!(store.list_rejected().unwrap()[0].event.update_id, Some(1));

        // Without an update id the most recent pending match is targeted
        store.mark_pending(&event(5, "W1", Some(3))).unwrap();
        assert!(store.reject(5, "W1", None).unwrap());
        let pending = store.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.update_id, Some(2));
    }

    #[test]
    fn reject_is_terminal() {
        let store = LifecycleStore::memory().unwrap();
        store.mark_pending(&event(5, "W1", Some(42))).unwrap();
        assert!(store.reject(5, "W1", Some(42)).unwrap());
        assert!(store.list_pending().unwrap().is_empty());
        assert_eq!(store.list_rejected().unwrap().len(), 1);

        // A later completion report does not resurrect the event
        let receipt = store.complete(5, "W1", Some(42), Some("tx"), now()).unwrap();
        assert!(!receipt.transitioned);
        assert!(store.list_pending().unwrap().is_empty());
    }

    #[test]
    fn executions_since_counts_trailing_window() {
        let store = LifecycleStore::memory().unwrap();
        store.mark_pending(&event(5, "W1", Some(1))).unwrap();
        store.complete(5, "W1", Some(1), Some("tx1"), now()).unwrap();

        let count = store
            .executions_since(5, "W1", now() - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(count, 1);
        let count = store
            .executions_since(5, "W1", now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn outbox_roundtrip() {
        let store = LifecycleStore::memory().unwrap();
        store.outbox_push(5, "W1", Some(42), "abc123").unwrap();
        store.outbox_push(5, "W1", Some(42), "abc123").unwrap();

        let entries = store.outbox_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].transaction_hash, "abc123");
        assert_eq!(entries[0].attempts, 0);

        store.outbox_bump_attempts(entries[0].id).unwrap();
        assert_eq!(store.outbox_entries().unwrap()[0].attempts, 1);

        store.outbox_remove(entries[0].id).unwrap();
        assert!(store.outbox_entries().unwrap().is_empty());
    }
}
