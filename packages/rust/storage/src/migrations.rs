//! SQL migration definitions for the procwatch database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed within a transaction.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: change_events, cost_ledger",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version     INTEGER PRIMARY KEY,
    description TEXT NOT NULL DEFAULT '',
    applied_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Change events moving through the pipeline
CREATE TABLE IF NOT EXISTS change_events (
    id                         INTEGER PRIMARY KEY AUTOINCREMENT,
    watch_uuid                 TEXT NOT NULL,
    watch_url                  TEXT NOT NULL DEFAULT '',
    received_at                TEXT NOT NULL,
    diff_text                  TEXT,
    snapshot_text              TEXT,
    classification             TEXT,
    classification_confidence  REAL,
    classification_reasoning   TEXT,
    classification_model       TEXT,
    classification_tokens_used INTEGER,
    summary                    TEXT,
    recommended_actions        TEXT,
    urgency                    TEXT,
    key_dates                  TEXT,
    relevant_agencies          TEXT,
    enrichment_model           TEXT,
    enrichment_tokens_used     INTEGER,
    triage_result              TEXT,
    triage_tokens_used         INTEGER,
    discovered_links           TEXT,
    parent_event_id            INTEGER REFERENCES change_events(id),
    pipeline_status            TEXT NOT NULL DEFAULT 'received',
    error_message              TEXT,
    slack_message_ts           TEXT
);

CREATE INDEX IF NOT EXISTS idx_events_watch_uuid ON change_events(watch_uuid);
CREATE INDEX IF NOT EXISTS idx_events_parent ON change_events(parent_event_id);
CREATE INDEX IF NOT EXISTS idx_events_status ON change_events(pipeline_status);
CREATE INDEX IF NOT EXISTS idx_events_received_at ON change_events(received_at);

-- Append-only LLM spend ledger
CREATE TABLE IF NOT EXISTS cost_ledger (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    date               TEXT NOT NULL,
    model              TEXT NOT NULL,
    prompt_tokens      INTEGER NOT NULL DEFAULT 0,
    completion_tokens  INTEGER NOT NULL DEFAULT 0,
    estimated_cost_usd REAL NOT NULL DEFAULT 0,
    event_id           INTEGER REFERENCES change_events(id),
    created_at         TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cost_ledger_date ON cost_ledger(date);

INSERT INTO schema_migrations (version, description) VALUES (1, 'Initial schema: change_events, cost_ledger');
"#,
    }]
}
