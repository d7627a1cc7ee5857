//! Application repository for the `applications` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};
use crate::app::{ApplicationState, SyncPolicy};
use crate::manifest::Revision;

const TABLE: &str = "applications";

/// A raw application row.
#[derive(Debug, Clone)]
struct ApplicationRow {
    name: String,
    sync_status: String,
    health_status: String,
    last_applied_revision: Option<String>,
    last_observed_revision: Option<String>,
    invalid_revision: Option<String>,
    auto_sync: bool,
    prune: bool,
    policy_source: String,
    last_drift: String,
    message: Option<String>,
    last_error: Option<String>,
    reconciled_at: Option<String>,
}

impl ApplicationRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            name: row.get("name")?,
            sync_status: row.get("sync_status")?,
            health_status: row.get("health_status")?,
            last_applied_revision: row.get("last_applied_revision")?,
            last_observed_revision: row.get("last_observed_revision")?,
            invalid_revision: row.get("invalid_revision")?,
            auto_sync: row.get("auto_sync")?,
            prune: row.get("prune")?,
            policy_source: row.get("policy_source")?,
            last_drift: row.get("last_drift")?,
            message: row.get("message")?,
            last_error: row.get("last_error")?,
            reconciled_at: row.get("reconciled_at")?,
        })
    }

    fn into_state(self) -> Result<ApplicationState, DatabaseError> {
        let reconciled_at = self
            .reconciled_at
            .map(|ts| {
                DateTime::parse_from_rfc3339(&ts)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| DatabaseError::decode(TABLE, "reconciled_at", e))
            })
            .transpose()?;

        Ok(ApplicationState {
            sync_status: self
                .sync_status
                .parse()
                .map_err(|e: String| DatabaseError::decode(TABLE, "sync_status", e))?,
            health_status: self
                .health_status
                .parse()
                .map_err(|e: String| DatabaseError::decode(TABLE, "health_status", e))?,
            last_applied_revision: self.last_applied_revision.map(Revision::new),
            last_observed_revision: self.last_observed_revision.map(Revision::new),
            invalid_revision: self.invalid_revision.map(Revision::new),
            policy: SyncPolicy {
                auto_sync: self.auto_sync,
                prune: self.prune,
            },
            policy_source: self
                .policy_source
                .parse()
                .map_err(|e: String| DatabaseError::decode(TABLE, "policy_source", e))?,
            last_drift: serde_json::from_str(&self.last_drift)
                .map_err(|e| DatabaseError::decode(TABLE, "last_drift", e))?,
            message: self.message,
            last_error: self.last_error,
            reconciled_at,
            name: self.name,
        })
    }
}

/// Inserts or replaces the state of one application.
pub fn save(db: &Database, state: &ApplicationState) -> Result<(), DatabaseError> {
    let last_drift = serde_json::to_string(&state.last_drift)
        .map_err(|e| DatabaseError::decode(TABLE, "last_drift", e))?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO applications (name, sync_status, health_status, last_applied_revision,
             last_observed_revision, invalid_revision, auto_sync, prune, policy_source,
             last_drift, message, last_error, reconciled_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(name) DO UPDATE SET
               sync_status=excluded.sync_status, health_status=excluded.health_status,
               last_applied_revision=excluded.last_applied_revision,
               last_observed_revision=excluded.last_observed_revision,
               invalid_revision=excluded.invalid_revision, auto_sync=excluded.auto_sync,
               prune=excluded.prune, policy_source=excluded.policy_source,
               last_drift=excluded.last_drift, message=excluded.message,
               last_error=excluded.last_error, reconciled_at=excluded.reconciled_at,
               updated_at=excluded.updated_at",
            params![
                state.name,
                state.sync_status.to_string(),
                state.health_status.to_string(),
                state.last_applied_revision.as_ref().map(Revision::as_str),
                state.last_observed_revision.as_ref().map(Revision::as_str),
                state.invalid_revision.as_ref().map(Revision::as_str),
                state.policy.auto_sync,
                state.policy.prune,
                state.policy_source.to_string(),
                last_drift,
                state.message,
                state.last_error,
                state.reconciled_at.map(|ts| ts.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    })
}

/// Finds an application by name.
pub fn find(db: &Database, name: &str) -> Result<Option<ApplicationState>, DatabaseError> {
    let row = db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM applications WHERE name = ?1",
                params![name],
                ApplicationRow::from_row,
            )
            .optional()?)
    })?;
    row.map(ApplicationRow::into_state).transpose()
}

/// Lists all applications ordered by name.
pub fn list(db: &Database) -> Result<Vec<ApplicationState>, DatabaseError> {
    let rows = db.with_conn(|conn| {
        let mut stmt = conn.prepare("SELECT * FROM applications ORDER BY name")?;
        let rows = stmt
            .query_map([], ApplicationRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;
    rows.into_iter().map(ApplicationRow::into_state).collect()
}
