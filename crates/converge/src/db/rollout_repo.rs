//! Rollout repository for the `rollouts` table.
//!
//! One row per in-flight workload rollout; the state itself is stored as JSON.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::{Database, DatabaseError};
use crate::manifest::ResourceRef;
use crate::sync::RolloutState;

const TABLE: &str = "rollouts";

fn decode(json: &str) -> Result<RolloutState, DatabaseError> {
    serde_json::from_str(json).map_err(|e| DatabaseError::decode(TABLE, "state", e))
}

/// Inserts or replaces a rollout state.
pub fn save(db: &Database, state: &RolloutState) -> Result<(), DatabaseError> {
    let json = serde_json::to_string(state).map_err(|e| DatabaseError::decode(TABLE, "state", e))?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO rollouts (application, resource, state, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(application, resource) DO UPDATE SET
               state=excluded.state, updated_at=excluded.updated_at",
            params![
                state.application,
                state.reference.to_string(),
                json,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    })
}

/// Finds the rollout of one resource.
pub fn find(
    db: &Database,
    application: &str,
    reference: &ResourceRef,
) -> Result<Option<RolloutState>, DatabaseError> {
    let json: Option<String> = db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT state FROM rollouts WHERE application = ?1 AND resource = ?2",
                params![application, reference.to_string()],
                |r| r.get(0),
            )
            .optional()?)
    })?;
    json.as_deref().map(decode).transpose()
}

/// Lists the in-flight rollouts of an application, ordered by resource.
pub fn list_for(db: &Database, application: &str) -> Result<Vec<RolloutState>, DatabaseError> {
    let rows: Vec<String> = db.with_conn(|conn| {
        let mut stmt = conn
            .prepare("SELECT state FROM rollouts WHERE application = ?1 ORDER BY resource")?;
        let rows = stmt
            .query_map(params![application], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    })?;
    rows.iter().map(|json| decode(json)).collect()
}

/// Deletes the rollout of one resource. Returns whether a row existed.
pub fn delete(db: &Database, application: &str, reference: &ResourceRef) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute(
            "DELETE FROM rollouts WHERE application = ?1 AND resource = ?2",
            params![application, reference.to_string()],
        )?;
        Ok(deleted > 0)
    })
}

/// Deletes every rollout of an application.
pub fn delete_all(db: &Database, application: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.execute(
            "DELETE FROM rollouts WHERE application = ?1",
            params![application],
        )?)
    })
}
