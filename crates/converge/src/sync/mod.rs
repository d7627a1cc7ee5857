//! Sync executor: turns drift into provider calls.
//!
//! Creates and updates run in drift order; deletions of no longer declared
//! resources run last and only when pruning is enabled. One resource failing
//! never stops the others.

pub mod rollout;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::app::SyncPolicy;
use crate::db::Database;
use crate::diff::{DiffEngine, Drift, DriftKind};
use crate::live::LiveState;
use crate::manifest::{template_hash, ManifestSet, Resource, ResourceRef};
use crate::provider::{ProviderError, ResourceProvider};

pub use rollout::{RolloutError, RolloutOptions, RolloutOutcome, RolloutRunner, RolloutState};

/// What the executor does about one drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionKind {
    Create,
    Update,
    /// Record update followed by a rolling replacement of replicas.
    Rollout,
    Delete,
    /// Left drifted on purpose.
    Skip,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Create => write!(f, "create"),
            ActionKind::Update => write!(f, "update"),
            ActionKind::Rollout => write!(f, "rollout"),
            ActionKind::Delete => write!(f, "delete"),
            ActionKind::Skip => write!(f, "skip"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedAction {
    pub reference: ResourceRef,
    pub action: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The provider refused the declared spec; terminal for that spec.
    Rejected,
    /// Transport failure or timeout; retried next cycle.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncFailure {
    pub reference: ResourceRef,
    pub kind: FailureKind,
    pub message: String,
}

impl SyncFailure {
    fn from_provider(reference: &ResourceRef, error: ProviderError) -> Self {
        let kind = match &error {
            ProviderError::Rejected { .. } | ProviderError::Conflict { .. } => FailureKind::Rejected,
            ProviderError::Unavailable(_)
            | ProviderError::Timeout { .. }
            | ProviderError::NotFound(_) => FailureKind::Unavailable,
        };
        Self {
            reference: reference.clone(),
            kind,
            message: error.to_string(),
        }
    }

    fn rejected(reference: &ResourceRef, message: impl Into<String>) -> Self {
        Self {
            reference: reference.clone(),
            kind: FailureKind::Rejected,
            message: message.into(),
        }
    }

    fn unavailable(reference: &ResourceRef, message: impl Into<String>) -> Self {
        Self {
            reference: reference.clone(),
            kind: FailureKind::Unavailable,
            message: message.into(),
        }
    }
}

/// Outcome of one apply pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub applied: Vec<PlannedAction>,
    pub failures: Vec<SyncFailure>,
    /// Drift intentionally left in place (prune disabled, blocked rejections).
    pub skipped: Vec<PlannedAction>,
    /// Shutdown interrupted the pass; remaining actions were not attempted.
    pub cancelled: bool,
}

impl SyncResult {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }

    pub fn rejected(&self) -> impl Iterator<Item = &SyncFailure> {
        self.failures.iter().filter(|f| f.kind == FailureKind::Rejected)
    }
}

/// Everything one apply pass needs.
pub struct ApplyRequest<'a> {
    pub application: &'a str,
    pub desired: &'a ManifestSet,
    pub live: &'a LiveState,
    pub drifts: &'a [Drift],
    pub policy: SyncPolicy,
    /// Resources whose current declaration was already rejected.
    pub blocked: &'a BTreeSet<ResourceRef>,
}

/// Computes the actions for a drift sequence without touching anything.
///
/// Deletions are moved to the end; everything else keeps drift order.
pub fn plan(drifts: &[Drift], policy: &SyncPolicy, blocked: &BTreeSet<ResourceRef>) -> Vec<PlannedAction> {
    let mut actions = Vec::with_capacity(drifts.len());
    let mut deletions = Vec::new();

    for drift in drifts {
        let reference = drift.reference.clone();
        if blocked.contains(&reference) {
            actions.push(PlannedAction {
                reference,
                action: ActionKind::Skip,
                reason: Some("declaration was rejected; waiting for a change".to_string()),
            });
            continue;
        }
        match drift.kind {
            DriftKind::Missing => actions.push(PlannedAction {
                reference,
                action: ActionKind::Create,
                reason: None,
            }),
            DriftKind::Modified => {
                let action = if reference.kind.is_workload() {
                    ActionKind::Rollout
                } else {
                    ActionKind::Update
                };
                actions.push(PlannedAction {
                    reference,
                    action,
                    reason: None,
                });
            }
            DriftKind::Extra if policy.prune => deletions.push(PlannedAction {
                reference,
                action: ActionKind::Delete,
                reason: None,
            }),
            DriftKind::Extra => deletions.push(PlannedAction {
                reference,
                action: ActionKind::Skip,
                reason: Some("prune disabled".to_string()),
            }),
        }
    }

    actions.extend(deletions);
    actions
}

/// Applies corrective actions through the resource provider.
pub struct SyncExecutor {
    provider: Arc<dyn ResourceProvider>,
    db: Database,
    diff: DiffEngine,
    rollout: RolloutOptions,
}

impl SyncExecutor {
    pub fn new(
        provider: Arc<dyn ResourceProvider>,
        db: Database,
        diff: DiffEngine,
        rollout: RolloutOptions,
    ) -> Self {
        Self {
            provider,
            db,
            diff,
            rollout,
        }
    }

    /// Applies the planned actions for `request.drifts`.
    pub async fn apply(&self, request: &ApplyRequest<'_>, shutdown: watch::Receiver<bool>) -> SyncResult {
        let mut result = SyncResult::default();

        for action in plan(request.drifts, &request.policy, request.blocked) {
            if *shutdown.borrow() {
                result.cancelled = true;
                break;
            }

            let outcome = match action.action {
                ActionKind::Skip => {
                    result.skipped.push(action);
                    continue;
                }
                ActionKind::Create | ActionKind::Update | ActionKind::Rollout => {
                    match request.desired.get(&action.reference) {
                        Some(desired) => self.converge(request, desired, shutdown.clone()).await,
                        None => Err(SyncFailure::rejected(&action.reference, "not declared")),
                    }
                }
                ActionKind::Delete => self.delete(&action.reference).await,
            };

            match outcome {
                Ok(true) => {
                    log::info!("Applied {} to {}", action.action, action.reference);
                    result.applied.push(action);
                }
                Ok(false) => {
                    result.cancelled = true;
                    break;
                }
                Err(failure) => {
                    log::warn!("Failed to {} {}: {}", action.action, action.reference, failure.message);
                    result.failures.push(failure);
                }
            }
        }

        result
    }

    /// Creates or updates one declared resource and rolls out workloads.
    ///
    /// Returns `Ok(false)` if a rollout was cancelled.
    async fn converge(
        &self,
        request: &ApplyRequest<'_>,
        desired: &Resource,
        shutdown: watch::Receiver<bool>,
    ) -> Result<bool, SyncFailure> {
        let reference = desired.reference();
        let owned = desired.owned_by(request.application);

        let written = match request.live.get(&reference) {
            None => self.provider.create(&owned).await,
            Some(observed) => self.provider.update(&owned, observed.resource_version).await,
        };
        match written {
            Ok(_) => {}
            Err(ProviderError::Conflict { .. }) => {
                self.retry_after_conflict(desired, &owned).await?;
            }
            Err(e) => return Err(SyncFailure::from_provider(&reference, e)),
        }

        let Some(spec) = desired.workload_spec() else {
            return Ok(true);
        };

        let mut runner = RolloutRunner::new(self.provider.as_ref(), &self.db, &self.rollout, shutdown);
        let target = template_hash(&desired.spec);
        match runner
            .run(request.application, &reference, &target, spec.replicas)
            .await
        {
            Ok(RolloutOutcome::Completed { .. }) => Ok(true),
            Ok(RolloutOutcome::Cancelled) => {
                log::info!("Rollout of {} interrupted, progress saved", reference);
                Ok(false)
            }
            Err(RolloutError::Provider(e)) => Err(SyncFailure::from_provider(&reference, e)),
            Err(e @ RolloutError::NeverReady { .. }) => Err(SyncFailure::rejected(&reference, e.to_string())),
            Err(e @ RolloutError::Store(_)) => Err(SyncFailure::unavailable(&reference, e.to_string())),
        }
    }

    /// Re-reads the resource after a conflicting write and retries once if
    /// it still differs from the declaration.
    async fn retry_after_conflict(&self, desired: &Resource, owned: &Resource) -> Result<(), SyncFailure> {
        let reference = desired.reference();
        log::info!("Conflicting write to {}, re-reading", reference);

        let current = self
            .provider
            .get(&reference)
            .await
            .map_err(|e| SyncFailure::from_provider(&reference, e))?;

        let retried = match current {
            None => self.provider.create(owned).await,
            Some(current) => {
                if self.diff.diff_resource(desired, &current).is_empty() {
                    return Ok(());
                }
                self.provider.update(owned, current.resource_version).await
            }
        };

        match retried {
            Ok(_) => Ok(()),
            Err(ProviderError::Conflict { .. }) => Err(SyncFailure::rejected(
                &reference,
                "concurrent modification persisted after re-read",
            )),
            Err(e) => Err(SyncFailure::from_provider(&reference, e)),
        }
    }

    async fn delete(&self, reference: &ResourceRef) -> Result<bool, SyncFailure> {
        match self.provider.delete(reference).await {
            Ok(()) | Err(ProviderError::NotFound(_)) => Ok(true),
            Err(e) => Err(SyncFailure::from_provider(reference, e)),
        }
    }
}
