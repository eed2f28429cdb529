//! libSQL storage layer for change events and the LLM cost ledger.
//!
//! [`Storage`] owns the database and runs migrations on open. Every pipeline
//! run, HTTP request, and CLI command acquires its own [`Session`] (a fresh
//! connection) via [`Storage::session`] and drops it at scope exit, so
//! concurrent runs never share an in-progress statement.

mod migrations;

use std::path::Path;

use chrono::Utc;
use libsql::{Connection, Database, params};
use procwatch_shared::{ChangeEvent, CostLedgerEntry, PipelineStatus, ProcwatchError, Result};

/// Column list shared by every `change_events` SELECT; indexes in
/// [`row_to_event`] follow this order.
const EVENT_COLUMNS: &str = "id, watch_uuid, watch_url, received_at, diff_text, snapshot_text, \
     classification, classification_confidence, classification_reasoning, classification_model, \
     classification_tokens_used, summary, recommended_actions, urgency, key_dates, \
     relevant_agencies, enrichment_model, enrichment_tokens_used, triage_result, \
     triage_tokens_used, discovered_links, parent_event_id, pipeline_status, error_message, \
     slack_message_ts";

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
}

impl Storage {
    /// Open or create a database at `path` and apply pending migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ProcwatchError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ProcwatchError::Storage(e.to_string()))?;

        let storage = Self { db };
        storage.session()?.run_migrations().await?;
        Ok(storage)
    }

    /// Acquire a fresh connection scoped to one run/request/command.
    pub fn session(&self) -> Result<Session> {
        let conn = self
            .db
            .connect()
            .map_err(|e| ProcwatchError::Storage(e.to_string()))?;
        Ok(Session { conn })
    }
}

/// A single-scope database session with the repository operations.
pub struct Session {
    conn: Connection,
}

impl Session {
    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    ProcwatchError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Event operations
    // -----------------------------------------------------------------------

    /// Insert a freshly received event (status `received`). Returns the event
    /// with its storage-assigned id.
    pub async fn create_event(&self, watch_uuid: &str, watch_url: &str) -> Result<ChangeEvent> {
        let mut event = ChangeEvent::new(watch_uuid, watch_url);
        self.conn
            .execute(
                "INSERT INTO change_events (watch_uuid, watch_url, received_at, pipeline_status)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    event.watch_uuid.as_str(),
                    event.watch_url.as_str(),
                    event.received_at.to_rfc3339(),
                    event.pipeline_status.as_str(),
                ],
            )
            .await
            .map_err(|e| ProcwatchError::Storage(e.to_string()))?;

        event.id = self.conn.last_insert_rowid();
        Ok(event)
    }

    /// Insert a child event spawned from a discovered link. Children inherit
    /// the parent's watch identity, carry the crawled page text as their
    /// snapshot, and enter the pipeline at `fetched`.
    pub async fn create_child_event(
        &self,
        parent: &ChangeEvent,
        url: &str,
        page_text: &str,
    ) -> Result<ChangeEvent> {
        let mut event = ChangeEvent::new(parent.watch_uuid.clone(), url);
        event.parent_event_id = Some(parent.id);
        event.snapshot_text = Some(page_text.to_string());
        event.pipeline_status = PipelineStatus::Fetched;

        self.conn
            .execute(
                "INSERT INTO change_events
                   (watch_uuid, watch_url, received_at, snapshot_text, parent_event_id, pipeline_status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    event.watch_uuid.as_str(),
                    event.watch_url.as_str(),
                    event.received_at.to_rfc3339(),
                    event.snapshot_text.as_deref(),
                    event.parent_event_id,
                    event.pipeline_status.as_str(),
                ],
            )
            .await
            .map_err(|e| ProcwatchError::Storage(e.to_string()))?;

        event.id = self.conn.last_insert_rowid();
        Ok(event)
    }

    /// Load an event by id.
    pub async fn get_event(&self, id: i64) -> Result<Option<ChangeEvent>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {EVENT_COLUMNS} FROM change_events WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| ProcwatchError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_event(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ProcwatchError::Storage(e.to_string())),
        }
    }

    /// Persist every mutable field of an event.
    pub async fn update_event(&self, event: &ChangeEvent) -> Result<()> {
        self.conn
            .execute(
                "UPDATE change_events SET
                   diff_text = ?1,
                   snapshot_text = ?2,
                   classification = ?3,
                   classification_confidence = ?4,
                   classification_reasoning = ?5,
                   classification_model = ?6,
                   classification_tokens_used = ?7,
                   summary = ?8,
                   recommended_actions = ?9,
                   urgency = ?10,
                   key_dates = ?11,
                   relevant_agencies = ?12,
                   enrichment_model = ?13,
                   enrichment_tokens_used = ?14,
                   triage_result = ?15,
                   triage_tokens_used = ?16,
                   discovered_links = ?17,
                   pipeline_status = ?18,
                   error_message = ?19,
                   slack_message_ts = ?20
                 WHERE id = ?21",
                params![
                    event.diff_text.as_deref(),
                    event.snapshot_text.as_deref(),
                    event.classification.as_deref(),
                    event.classification_confidence,
                    event.classification_reasoning.as_deref(),
                    event.classification_model.as_deref(),
                    event.classification_tokens_used,
                    event.summary.as_deref(),
                    event.recommended_actions.as_deref(),
                    event.urgency.as_deref(),
                    event.key_dates.as_deref(),
                    event.relevant_agencies.as_deref(),
                    event.enrichment_model.as_deref(),
                    event.enrichment_tokens_used,
                    event.triage_result.as_deref(),
                    event.triage_tokens_used,
                    event.discovered_links.as_deref(),
                    event.pipeline_status.as_str(),
                    event.error_message.as_deref(),
                    event.slack_message_ts.as_deref(),
                    event.id,
                ],
            )
            .await
            .map_err(|e| ProcwatchError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Child events of a parent, oldest first.
    pub async fn children_of(&self, parent_id: i64) -> Result<Vec<ChangeEvent>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {EVENT_COLUMNS} FROM change_events
                     WHERE parent_event_id = ?1 ORDER BY id"
                ),
                params![parent_id],
            )
            .await
            .map_err(|e| ProcwatchError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_event(&row)?);
        }
        Ok(results)
    }

    /// Total number of events ever received.
    pub async fn events_count(&self) -> Result<i64> {
        self.scalar_i64("SELECT COUNT(*) FROM change_events", params![])
            .await
    }

    /// Events received on the current UTC day.
    pub async fn events_today_count(&self) -> Result<i64> {
        let today = Utc::now().format("%Y-%m-%d").to_string();
        self.scalar_i64(
            "SELECT COUNT(*) FROM change_events WHERE substr(received_at, 1, 10) = ?1",
            params![today.as_str()],
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Cost ledger operations
    // -----------------------------------------------------------------------

    /// Append a spend row to the ledger.
    pub async fn record_cost(&self, entry: &CostLedgerEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO cost_ledger
                   (date, model, prompt_tokens, completion_tokens, estimated_cost_usd, event_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.date.as_str(),
                    entry.model.as_str(),
                    entry.prompt_tokens,
                    entry.completion_tokens,
                    entry.estimated_cost_usd,
                    entry.event_id,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| ProcwatchError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Total estimated spend for a UTC day (`YYYY-MM-DD`), 0.0 when no rows.
    pub async fn daily_spend(&self, date: &str) -> Result<f64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COALESCE(SUM(estimated_cost_usd), 0.0) FROM cost_ledger WHERE date = ?1",
                params![date],
            )
            .await
            .map_err(|e| ProcwatchError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<f64>(0).unwrap_or(0.0)),
            Ok(None) => Ok(0.0),
            Err(e) => Err(ProcwatchError::Storage(e.to_string())),
        }
    }

    async fn scalar_i64(
        &self,
        sql: &str,
        query_params: impl libsql::params::IntoParams,
    ) -> Result<i64> {
        let mut rows = self
            .conn
            .query(sql, query_params)
            .await
            .map_err(|e| ProcwatchError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| ProcwatchError::Storage(e.to_string())),
            Ok(None) => Ok(0),
            Err(e) => Err(ProcwatchError::Storage(e.to_string())),
        }
    }
}

/// Convert a database row to a [`ChangeEvent`]. Column order must match
/// [`EVENT_COLUMNS`].
fn row_to_event(row: &libsql::Row) -> Result<ChangeEvent> {
    let status_raw: String = row
        .get(22)
        .map_err(|e| ProcwatchError::Storage(e.to_string()))?;
    let pipeline_status = PipelineStatus::parse(&status_raw)
        .ok_or_else(|| ProcwatchError::Storage(format!("unknown pipeline_status: {status_raw}")))?;

    Ok(ChangeEvent {
        id: row
            .get::<i64>(0)
            .map_err(|e| ProcwatchError::Storage(e.to_string()))?,
        watch_uuid: row
            .get::<String>(1)
            .map_err(|e| ProcwatchError::Storage(e.to_string()))?,
        watch_url: row
            .get::<String>(2)
            .map_err(|e| ProcwatchError::Storage(e.to_string()))?,
        received_at: {
            let s: String = row
                .get(3)
                .map_err(|e| ProcwatchError::Storage(e.to_string()))?;
            chrono::DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .map_err(|e| ProcwatchError::Storage(format!("invalid date: {e}")))?
        },
        diff_text: row.get::<String>(4).ok(),
        snapshot_text: row.get::<String>(5).ok(),
        classification: row.get::<String>(6).ok(),
        classification_confidence: row.get::<f64>(7).ok(),
        classification_reasoning: row.get::<String>(8).ok(),
        classification_model: row.get::<String>(9).ok(),
        classification_tokens_used: row.get::<i64>(10).ok(),
        summary: row.get::<String>(11).ok(),
        recommended_actions: row.get::<String>(12).ok(),
        urgency: row.get::<String>(13).ok(),
        key_dates: row.get::<String>(14).ok(),
        relevant_agencies: row.get::<String>(15).ok(),
        enrichment_model: row.get::<String>(16).ok(),
        enrichment_tokens_used: row.get::<i64>(17).ok(),
        triage_result: row.get::<String>(18).ok(),
        triage_tokens_used: row.get::<i64>(19).ok(),
        discovered_links: row.get::<String>(20).ok(),
        parent_event_id: row.get::<i64>(21).ok(),
        pipeline_status,
        error_message: row.get::<String>(23).ok(),
        slack_message_ts: row.get::<String>(24).ok(),
    })
}
