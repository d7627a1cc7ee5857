//! Application model: what is tracked, and its sync/health status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::{Drift, DriftKind};
use crate::manifest::Revision;

/// Whether live state matches the declared revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SyncStatus {
    #[default]
    Unknown,
    Synced,
    OutOfSync,
    /// Overlay reported while a rollout is in flight; never persisted.
    Progressing,
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStatus::Unknown => write!(f, "Unknown"),
            SyncStatus::Synced => write!(f, "Synced"),
            SyncStatus::OutOfSync => write!(f, "OutOfSync"),
            SyncStatus::Progressing => write!(f, "Progressing"),
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Unknown" => Ok(SyncStatus::Unknown),
            "Synced" => Ok(SyncStatus::Synced),
            "OutOfSync" => Ok(SyncStatus::OutOfSync),
            "Progressing" => Ok(SyncStatus::Progressing),
            _ => Err(format!("Unknown sync status: {}", s)),
        }
    }
}

/// Whether the declared state could be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum HealthStatus {
    #[default]
    Healthy,
    /// A declared change was rejected, or the revision failed to parse.
    Degraded,
    /// Declared resources are absent and were not created.
    Missing,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Missing => write!(f, "Missing"),
        }
    }
}

impl std::str::FromStr for HealthStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Healthy" => Ok(HealthStatus::Healthy),
            "Degraded" => Ok(HealthStatus::Degraded),
            "Missing" => Ok(HealthStatus::Missing),
            _ => Err(format!("Unknown health status: {}", s)),
        }
    }
}

impl HealthStatus {
    /// Health for drift that was left in place.
    pub fn for_drift(drift: &[Drift], has_rejections: bool) -> Self {
        if has_rejections {
            HealthStatus::Degraded
        } else if drift.iter().any(|d| d.kind == DriftKind::Missing) {
            HealthStatus::Missing
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Auto-sync policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Apply corrective actions without a manual trigger.
    #[serde(default)]
    pub auto_sync: bool,
    /// Delete owned resources that are no longer declared.
    #[serde(default)]
    pub prune: bool,
}

/// Who set the active policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PolicySource {
    /// Taken from the controller config on every start.
    #[default]
    Config,
    /// Set through `set_auto_sync`; survives restarts.
    Operator,
}

impl std::fmt::Display for PolicySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicySource::Config => write!(f, "config"),
            PolicySource::Operator => write!(f, "operator"),
        }
    }
}

impl std::str::FromStr for PolicySource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config" => Ok(PolicySource::Config),
            "operator" => Ok(PolicySource::Operator),
            _ => Err(format!("Unknown policy source: {}", s)),
        }
    }
}

/// Static binding of one manifest source to one destination namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub name: String,
    pub namespace: String,
    /// Source location, for status output.
    pub source: String,
    /// Policy from the controller config.
    pub policy: SyncPolicy,
}

/// Durable per-application state, owned by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationState {
    pub name: String,
    pub sync_status: SyncStatus,
    pub health_status: HealthStatus,
    /// Revision live state last fully converged to.
    pub last_applied_revision: Option<Revision>,
    /// Revision the last completed cycle read.
    pub last_observed_revision: Option<Revision>,
    /// Head revision that failed to parse; skipped until the head moves.
    pub invalid_revision: Option<Revision>,
    pub policy: SyncPolicy,
    pub policy_source: PolicySource,
    pub last_drift: Vec<Drift>,
    /// Reason string when not synced.
    pub message: Option<String>,
    /// Transient failure of the last cycle, if any.
    pub last_error: Option<String>,
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl ApplicationState {
    /// State of an application that has never been reconciled.
    pub fn initial(application: &Application) -> Self {
        Self {
            name: application.name.clone(),
            sync_status: SyncStatus::Unknown,
            health_status: HealthStatus::Healthy,
            last_applied_revision: None,
            last_observed_revision: None,
            invalid_revision: None,
            policy: application.policy,
            policy_source: PolicySource::Config,
            last_drift: Vec::new(),
            message: None,
            last_error: None,
            reconciled_at: None,
        }
    }

    /// Marks the state as converged at `revision`.
    pub fn converged(&mut self, revision: &Revision) {
        self.sync_status = SyncStatus::Synced;
        self.health_status = HealthStatus::Healthy;
        self.last_applied_revision = Some(revision.clone());
        self.last_drift.clear();
        self.message = None;
        self.last_error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ResourceKind, ResourceRef};

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            SyncStatus::Unknown,
            SyncStatus::Synced,
            SyncStatus::OutOfSync,
            SyncStatus::Progressing,
        ] {
            assert_eq!(status.to_string().parse::<SyncStatus>(), Ok(status));
        }
        assert_eq!("Degraded".parse::<HealthStatus>(), Ok(HealthStatus::Degraded));
        assert!("Broken".parse::<HealthStatus>().is_err());
    }

    #[test]
    fn test_health_for_drift() {
        let missing = Drift::missing(ResourceRef::new(ResourceKind::Workload, "shop", "web"));
        assert_eq!(HealthStatus::for_drift(&[], false), HealthStatus::Healthy);
        assert_eq!(
            HealthStatus::for_drift(std::slice::from_ref(&missing), false),
            HealthStatus::Missing
        );
        assert_eq!(HealthStatus::for_drift(&[missing], true), HealthStatus::Degraded);
    }

    #[test]
    fn test_converged_clears_reason() {
        let app = Application {
            name: "shop".into(),
            namespace: "shop".into(),
            source: "dir://x".into(),
            policy: SyncPolicy::default(),
        };
        let mut state = ApplicationState::initial(&app);
        state.message = Some("drift".into());
        state.health_status = HealthStatus::Degraded;
        state.converged(&Revision::new("r2"));
        assert_eq!(state.sync_status, SyncStatus::Synced);
        assert_eq!(state.health_status, HealthStatus::Healthy);
        assert_eq!(state.last_applied_revision, Some(Revision::new("r2")));
        assert!(state.message.is_none());
    }
}
