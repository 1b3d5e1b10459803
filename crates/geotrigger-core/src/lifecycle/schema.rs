//! SQLite schema for the rule lifecycle store.
//!
//! Tables:
//! - `events`: match events and their lifecycle state
//! - `completions`: append-only completion records, unique on the dedup key
//! - `executions`: per-identity execution timestamps for the rate gate
//! - `outbox`: durable reconciliation queue for completions whose
//!   bookkeeping call failed after an on-chain success

/// DDL for the lifecycle tables.
///
/// Schema version: 3
pub const LIFECYCLE_SCHEMA: &str = r#"
-- Match events keyed by their identity tuple. `update_key` is the textual
-- update id or the 'no-update' sentinel so the uniqueness constraint also
-- covers events without an update id.
CREATE TABLE IF NOT EXISTS events (
    seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id             INTEGER NOT NULL,
    matched_public_key  TEXT NOT NULL,
    update_id           INTEGER,
    update_key          TEXT NOT NULL,
    matched_at          TEXT NOT NULL,
    latitude            REAL,
    longitude           REAL,
    dwell_seconds       INTEGER,
    parameters          TEXT NOT NULL DEFAULT '{}',
    message             TEXT NOT NULL DEFAULT '',
    state               TEXT NOT NULL DEFAULT 'pending',
    inserted_at         TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(rule_id, matched_public_key, update_key)
);

-- Completion records (append-only). Duplicate completion reports from
-- upstream collapse on dedup_key.
CREATE TABLE IF NOT EXISTS completions (
    dedup_key           TEXT PRIMARY KEY,
    rule_id             INTEGER NOT NULL,
    matched_public_key  TEXT NOT NULL,
    update_id           INTEGER,
    transaction_hash    TEXT,
    completed_at        TEXT NOT NULL
);

-- Execution history consumed by the trailing-window rate limit.
CREATE TABLE IF NOT EXISTS executions (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id             INTEGER NOT NULL,
    matched_public_key  TEXT NOT NULL,
    executed_at         TEXT NOT NULL
);

-- Reconciliation outbox: completions confirmed on-chain whose lifecycle
-- bookkeeping has not succeeded yet.
CREATE TABLE IF NOT EXISTS outbox (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    rule_id             INTEGER NOT NULL,
    matched_public_key  TEXT NOT NULL,
    update_id           INTEGER,
    transaction_hash    TEXT NOT NULL,
    attempts            INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(rule_id, matched_public_key, transaction_hash)
);

CREATE INDEX IF NOT EXISTS idx_events_state
    ON events(state);
CREATE INDEX IF NOT EXISTS idx_executions_identity
    ON executions(rule_id, matched_public_key, executed_at);
"#;
