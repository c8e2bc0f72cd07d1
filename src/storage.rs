//! SQLite journal of incidents and notification deliveries.
//!
//! The frame loop is the only writer of incident rows; alert workers append
//! to the notification log. Rows hold the filterable columns plus the full
//! incident document, so reads never have to reassemble one from parts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::Result;
use crate::model::{Incident, IncidentState};
use crate::notify::DeliveryResults;

/// One delivery attempt as recorded in the notification log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationRecord {
    pub channel: String,
    pub success: bool,
    pub sent_at: DateTime<Utc>,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:watchdog.db?mode=rwc" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> Result<Self> {
        // Every connection to an in-memory database is its own database
        let in_memory = database_url.contains(":memory:");
        let mut options = SqlitePoolOptions::new().max_connections(if in_memory { 1 } else { 5 });
        if in_memory {
            options = options.idle_timeout(None).max_lifetime(None);
        }
        let pool = options.connect(database_url).await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS incidents (
                incident_id TEXT PRIMARY KEY,
                rule_id TEXT NOT NULL,
                track_id INTEGER NOT NULL,
                state TEXT NOT NULL,
                first_detected REAL NOT NULL,
                confirmed REAL,
                resolved REAL,
                notification_count INTEGER NOT NULL,
                document TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_incidents_state
            ON incidents(state, first_detected)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS notification_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                incident_id TEXT NOT NULL,
                channel TEXT NOT NULL,
                success INTEGER NOT NULL,
                ts INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_notification_log_incident
            ON notification_log(incident_id, ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace the journal row for an incident.
    pub async fn upsert_incident(&self, incident: &Incident) -> Result<()> {
        let document = serde_json::to_string(incident)?;

        sqlx::query(
            r#"
            INSERT INTO incidents (
                incident_id, rule_id, track_id, state, first_detected,
                confirmed, resolved, notification_count, document, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(incident_id) DO UPDATE SET
                state = excluded.state,
                confirmed = excluded.confirmed,
                resolved = excluded.resolved,
                notification_count = excluded.notification_count,
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&incident.incident_id)
        .bind(&incident.rule_id)
        .bind(incident.track_id as i64)
        .bind(incident.state.as_str())
        .bind(incident.first_detected_time)
        .bind(incident.confirmed_time)
        .bind(incident.resolved_time)
        .bind(i64::from(incident.notification_count))
        .bind(document)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_incident(&self, incident_id: &str) -> Result<Option<Incident>> {
        let row = sqlx::query("SELECT document FROM incidents WHERE incident_id = ?")
            .bind(incident_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let document: String = row.get("document");
                Ok(Some(serde_json::from_str(&document)?))
            }
            None => Ok(None),
        }
    }

    /// Incidents ordered by first detection, optionally filtered by state.
    pub async fn list_incidents(&self, state: Option<IncidentState>) -> Result<Vec<Incident>> {
        let rows = match state {
            Some(state) => {
                sqlx::query(
                    r#"
                    SELECT document FROM incidents
                    WHERE state = ?
                    ORDER BY first_detected, incident_id
                    "#,
                )
                .bind(state.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT document FROM incidents ORDER BY first_detected, incident_id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        rows.iter()
            .map(|row| {
                let document: String = row.get("document");
                Ok(serde_json::from_str(&document)?)
            })
            .collect()
    }

    pub async fn record_notification(&self, incident_id: &str, channel: &str, success: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notification_log (incident_id, channel, success, ts)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(incident_id)
        .bind(channel)
        .bind(success)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Log every entry of one dispatch.
    pub async fn record_deliveries(&self, incident_id: &str, results: &DeliveryResults) -> Result<()> {
        for (channel, success) in results {
            self.record_notification(incident_id, channel, *success).await?;
        }
        Ok(())
    }

    pub async fn notifications_for(&self, incident_id: &str) -> Result<Vec<NotificationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT channel, success, ts
            FROM notification_log
            WHERE incident_id = ?
            ORDER BY ts, id
            "#,
        )
        .bind(incident_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| NotificationRecord {
                channel: row.get("channel"),
                success: row.get("success"),
                sent_at: DateTime::from_timestamp(row.get("ts"), 0).unwrap_or_default(),
            })
            .collect())
    }
}
