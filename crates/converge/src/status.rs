//! Status reporter: read-only view of the last completed cycle.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::app::{ApplicationState, HealthStatus, PolicySource, SyncPolicy, SyncStatus};
use crate::db::{app_repo, rollout_repo, Database, DatabaseError};
use crate::diff::Drift;
use crate::manifest::{ResourceRef, Revision};
use crate::sync::RolloutState;

/// Progress of one in-flight rollout.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutSummary {
    pub reference: ResourceRef,
    pub desired_replicas: u32,
    pub updated_replicas: u32,
    pub ready_replicas: u32,
    pub steps_completed: u32,
    pub updated_at: DateTime<Utc>,
}

impl From<&RolloutState> for RolloutSummary {
    fn from(state: &RolloutState) -> Self {
        Self {
            reference: state.reference.clone(),
            desired_replicas: state.desired_replicas,
            updated_replicas: state.updated_replicas(),
            ready_replicas: state.ready_replicas,
            steps_completed: state.steps_completed,
            updated_at: state.updated_at,
        }
    }
}

/// Status of one application as seen by operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub application: String,
    pub sync_status: SyncStatus,
    pub health_status: HealthStatus,
    pub last_applied_revision: Option<Revision>,
    pub last_observed_revision: Option<Revision>,
    pub last_drift: Vec<Drift>,
    pub message: Option<String>,
    pub last_error: Option<String>,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub policy: SyncPolicy,
    pub policy_source: PolicySource,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rollouts: Vec<RolloutSummary>,
}

impl StatusReport {
    /// Report for an application that has not completed a cycle yet.
    pub fn unknown(application: &str) -> Self {
        Self {
            application: application.to_string(),
            sync_status: SyncStatus::Unknown,
            health_status: HealthStatus::Healthy,
            last_applied_revision: None,
            last_observed_revision: None,
            last_drift: Vec::new(),
            message: None,
            last_error: None,
            reconciled_at: None,
            policy: SyncPolicy::default(),
            policy_source: PolicySource::Config,
            rollouts: Vec::new(),
        }
    }

    /// Combines persisted state with in-flight rollouts.
    ///
    /// Any in-flight rollout overlays the sync status with `Progressing`.
    pub fn from_state(state: &ApplicationState, rollouts: &[RolloutState]) -> Self {
        let sync_status = if rollouts.is_empty() {
            state.sync_status
        } else {
            SyncStatus::Progressing
        };
        Self {
            application: state.name.clone(),
            sync_status,
            health_status: state.health_status,
            last_applied_revision: state.last_applied_revision.clone(),
            last_observed_revision: state.last_observed_revision.clone(),
            last_drift: state.last_drift.clone(),
            message: state.message.clone(),
            last_error: state.last_error.clone(),
            reconciled_at: state.reconciled_at,
            policy: state.policy,
            policy_source: state.policy_source,
            rollouts: rollouts.iter().map(RolloutSummary::from).collect(),
        }
    }

    /// `Sync/Health`, e.g. `OutOfSync/Degraded`.
    pub fn summary(&self) -> String {
        format!("{}/{}", self.sync_status, self.health_status)
    }
}

/// Reads application status from the durable store.
#[derive(Clone)]
pub struct StatusReporter {
    db: Database,
}

impl StatusReporter {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Current status of one application.
    pub fn current_status(&self, application: &str) -> Result<StatusReport, DatabaseError> {
        let rollouts = rollout_repo::list_for(&self.db, application)?;
        Ok(match app_repo::find(&self.db, application)? {
            Some(state) => StatusReport::from_state(&state, &rollouts),
            None => StatusReport::unknown(application),
        })
    }

    /// Status of every application with persisted state.
    pub fn all(&self) -> Result<Vec<StatusReport>, DatabaseError> {
        app_repo::list(&self.db)?
            .iter()
            .map(|state| {
                let rollouts = rollout_repo::list_for(&self.db, &state.name)?;
                Ok(StatusReport::from_state(state, &rollouts))
            })
            .collect()
    }
}
