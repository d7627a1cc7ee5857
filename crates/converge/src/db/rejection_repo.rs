//! Rejection repository for the `rejected_resources` table.
//!
//! A row blocks automatic retries of one resource for as long as its
//! declared fingerprint is unchanged.

use chrono::Utc;
use rusqlite::{params, Row};

use super::{Database, DatabaseError};
use crate::manifest::{ResourceRef, Revision};

/// A recorded rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub reference: ResourceRef,
    /// Fingerprint of the declaration that was rejected.
    pub fingerprint: String,
    pub revision: Revision,
    pub reason: String,
    pub rejected_at: String,
}

struct RejectionRow {
    resource: String,
    fingerprint: String,
    revision: String,
    reason: String,
    rejected_at: String,
}

impl RejectionRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            resource: row.get("resource")?,
            fingerprint: row.get("fingerprint")?,
            revision: row.get("revision")?,
            reason: row.get("reason")?,
            rejected_at: row.get("rejected_at")?,
        })
    }
}

/// Records (or refreshes) a rejection.
pub fn record(
    db: &Database,
    application: &str,
    reference: &ResourceRef,
    fingerprint: &str,
    revision: &Revision,
    reason: &str,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO rejected_resources (application, resource, fingerprint, revision, reason, rejected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(application, resource) DO UPDATE SET
               fingerprint=excluded.fingerprint, revision=excluded.revision,
               reason=excluded.reason, rejected_at=excluded.rejected_at",
            params![
                application,
                reference.to_string(),
                fingerprint,
                revision.as_str(),
                reason,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    })
}

/// Lists the rejections of an application, ordered by resource.
pub fn list_for(db: &Database, application: &str) -> Result<Vec<Rejection>, DatabaseError> {
    let rows = db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM rejected_resources WHERE application = ?1 ORDER BY resource",
        )?;
        let rows = stmt
            .query_map(params![application], RejectionRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })?;

    rows.into_iter()
        .map(|row| {
            Ok(Rejection {
                reference: row.resource.parse().map_err(|e: String| {
                    DatabaseError::decode("rejected_resources", "resource", e)
                })?,
                fingerprint: row.fingerprint,
                revision: Revision::new(row.revision),
                reason: row.reason,
                rejected_at: row.rejected_at,
            })
        })
        .collect()
}

/// Removes the rejection of one resource.
pub fn remove(db: &Database, application: &str, reference: &ResourceRef) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "DELETE FROM rejected_resources WHERE application = ?1 AND resource = ?2",
            params![application, reference.to_string()],
        )?;
        Ok(())
    })
}

/// Removes every rejection of an application. Returns the number removed.
pub fn clear(db: &Database, application: &str) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.execute(
            "DELETE FROM rejected_resources WHERE application = ?1",
            params![application],
        )?)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ResourceKind;

    #[test]
    fn test_record_list_remove() {
        let db = Database::open_in_memory().unwrap();
        let web = ResourceRef::new(ResourceKind::Workload, "shop", "web");
        let api = ResourceRef::new(ResourceKind::Workload, "shop", "api");

        record(&db, "shop", &web, "f1", &Revision::new("r1"), "bad image").unwrap();
        record(&db, "shop", &api, "f2", &Revision::new("r1"), "bad port").unwrap();
        record(&db, "shop", &web, "f3", &Revision::new("r2"), "still bad").unwrap();

        let listed = list_for(&db, "shop").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].reference, web);
        assert_eq!(listed[1].fingerprint, "f3");
        assert_eq!(listed[1].revision, Revision::new("r2"));

        remove(&db, "shop", &web).unwrap();
        assert_eq!(list_for(&db, "shop").unwrap().len(), 1);
        assert_eq!(clear(&db, "shop").unwrap(), 1);
        assert!(list_for(&db, "shop").unwrap().is_empty());
    }
}
