//! SQL migration definitions for the Dealflow database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.
//!
//! Timestamps are stored as fixed-width RFC 3339 text (microseconds, `Z`
//! suffix) so lexical comparison in SQL matches chronological order.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: source_records, queue_items",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Provider snapshots per entity
CREATE TABLE IF NOT EXISTS source_records (
    id           TEXT PRIMARY KEY,
    entity_id    TEXT NOT NULL,
    provider     TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    retrieved_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_source_records_latest
    ON source_records(entity_id, provider, retrieved_at);

-- Enrichment attempts
CREATE TABLE IF NOT EXISTS queue_items (
    id             TEXT PRIMARY KEY,
    entity_id      TEXT NOT NULL,
    fund_id        TEXT NOT NULL,
    priority       TEXT NOT NULL CHECK (priority IN ('high', 'normal', 'low')),
    trigger_reason TEXT NOT NULL,
    status         TEXT NOT NULL CHECK (status IN ('queued', 'processing', 'completed', 'failed')),
    attempts       INTEGER NOT NULL DEFAULT 0,
    created_at     TEXT NOT NULL,
    started_at     TEXT,
    completed_at   TEXT,
    error_message  TEXT,
    scheduled_for  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_queue_items_claim ON queue_items(status, scheduled_for);
CREATE INDEX IF NOT EXISTS idx_queue_items_entity ON queue_items(entity_id, status);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Entity trigger state: per-reason last trigger, block-until",
            sql: r#"
CREATE TABLE IF NOT EXISTS entity_triggers (
    entity_id         TEXT NOT NULL,
    trigger_reason    TEXT NOT NULL,
    last_triggered_at TEXT NOT NULL,
    triggered_by      TEXT,
    PRIMARY KEY (entity_id, trigger_reason)
);

CREATE TABLE IF NOT EXISTS entity_blocks (
    entity_id     TEXT PRIMARY KEY,
    blocked_until TEXT NOT NULL,
    reason        TEXT
);

INSERT OR IGNORE INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
