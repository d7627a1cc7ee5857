//! One application's reconciliation cycle.
//!
//! A cycle reads the head revision, observes live state, diffs, applies
//! (policy permitting), re-observes and persists the resulting status. At
//! most one cycle runs per application at any time; the cycle lock is held
//! from the first read until the status is persisted.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tracing::Instrument;

use super::scheduler::CycleRequest;
use crate::app::{Application, ApplicationState, HealthStatus, PolicySource, SyncPolicy, SyncStatus};
use crate::db::rejection_repo::{self, Rejection};
use crate::db::{app_repo, rollout_repo, Database, DatabaseError};
use crate::diff::{DiffEngine, DiffOptions, Drift};
use crate::error::ReconcileError;
use crate::events::{StatusBroadcaster, StatusEvent};
use crate::live::{LiveStateReader, Scope};
use crate::manifest::{ManifestSet, Resource, ResourceRef, Revision};
use crate::provider::ResourceProvider;
use crate::source::{ManifestSource, SourceError};
use crate::status::StatusReport;
use crate::sync::{self, ApplyRequest, FailureKind, PlannedAction, RolloutOptions, SyncExecutor, SyncResult};

/// Tunables shared by every reconciler of a controller.
#[derive(Debug, Clone, Default)]
pub struct ReconcilerSettings {
    pub diff: DiffOptions,
    pub rollout: RolloutOptions,
}

/// What one cycle saw and did.
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    /// Head revision the cycle worked on.
    pub revision: Revision,
    /// Drift found before any action was taken.
    pub drift: Vec<Drift>,
    /// Actions computed for that drift.
    pub plan: Vec<PlannedAction>,
    /// Present when actions were applied.
    pub result: Option<SyncResult>,
    /// Status after the cycle. For dry runs and skipped cycles this is the
    /// unchanged persisted status.
    pub status: StatusReport,
    pub dry_run: bool,
    /// The head revision already failed to parse and nothing was done.
    pub skipped: bool,
}

pub struct Reconciler {
    app: Application,
    source: Arc<dyn ManifestSource>,
    reader: LiveStateReader,
    diff: DiffEngine,
    executor: SyncExecutor,
    db: Database,
    events: StatusBroadcaster,
    cycle_lock: Mutex<()>,
    shutdown: watch::Receiver<bool>,
}

impl Reconciler {
    pub fn new(
        app: Application,
        source: Arc<dyn ManifestSource>,
        provider: Arc<dyn ResourceProvider>,
        db: Database,
        events: StatusBroadcaster,
        settings: &ReconcilerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let diff = DiffEngine::new(&settings.diff);
        Self {
            reader: LiveStateReader::new(Arc::clone(&provider)),
            executor: SyncExecutor::new(provider, db.clone(), diff.clone(), settings.rollout.clone()),
            app,
            source,
            diff,
            db,
            events,
            cycle_lock: Mutex::new(()),
            shutdown,
        }
    }

    pub fn application(&self) -> &Application {
        &self.app
    }

    /// Location of the manifest source.
    pub fn source(&self) -> String {
        self.source.describe()
    }

    /// Persisted state, or the initial state if no cycle completed yet.
    ///
    /// A config-sourced policy always reflects the current config.
    pub fn state(&self) -> Result<ApplicationState, DatabaseError> {
        let mut state =
            app_repo::find(&self.db, &self.app.name)?.unwrap_or_else(|| ApplicationState::initial(&self.app));
        if state.policy_source == PolicySource::Config {
            state.policy = self.app.policy;
        }
        Ok(state)
    }

    /// Status as last persisted, with any in-flight rollouts overlaid.
    pub fn status(&self) -> Result<StatusReport, DatabaseError> {
        let rollouts = rollout_repo::list_for(&self.db, &self.app.name)?;
        Ok(StatusReport::from_state(&self.state()?, &rollouts))
    }

    /// Stores an operator policy. It takes precedence over the config from
    /// now on and survives restarts.
    pub fn set_policy(&self, policy: SyncPolicy) -> Result<StatusReport, DatabaseError> {
        let mut state = self.state()?;
        state.policy = policy;
        state.policy_source = PolicySource::Operator;
        app_repo::save(&self.db, &state)?;
        log::info!(
            "Policy of {} set by operator: autoSync={} prune={}",
            self.app.name,
            policy.auto_sync,
            policy.prune
        );
        self.status()
    }

    /// Runs one cycle, waiting for a running one to finish first.
    pub async fn reconcile(&self, request: &CycleRequest) -> Result<CycleOutcome, ReconcileError> {
        let span = tracing::info_span!(
            "reconcile",
            app = %self.app.name,
            reason = %request.reason,
            dry_run = request.dry_run
        );
        async {
            let _guard = self.cycle_lock.lock().await;
            self.run_cycle(request).await
        }
        .instrument(span)
        .await
    }

    async fn run_cycle(&self, request: &CycleRequest) -> Result<CycleOutcome, ReconcileError> {
        if *self.shutdown.borrow() {
            return Err(ReconcileError::ShuttingDown);
        }

        let name = self.app.name.as_str();
        let mut state = self.state()?;

        let head = match self.source.head_revision().await {
            Ok(revision) => revision,
            Err(e) => return self.record_failure(state, e.into(), request),
        };
        if let Some(announced) = &request.revision {
            if announced != &head {
                log::debug!(
                    "Announced revision {} is not the head ({}) of {}",
                    announced.short(),
                    head.short(),
                    name
                );
            }
        }

        if !request.manual && state.invalid_revision.as_ref() == Some(&head) {
            log::debug!("Revision {} of {} failed to parse before, skipping", head.short(), name);
            return Ok(CycleOutcome {
                revision: head,
                drift: Vec::new(),
                plan: Vec::new(),
                result: None,
                status: self.status()?,
                dry_run: request.dry_run,
                skipped: true,
            });
        }

        let desired = match self.source.fetch_revision(&head).await {
            Ok(set) => set,
            Err(e @ SourceError::ManifestInvalid { .. }) => return self.record_invalid(state, head, e, request),
            Err(e) => return self.record_failure(state, e.into(), request),
        };

        let scope = Scope::new(name, &self.app.namespace);
        let live = match self.reader.observe(&scope, &desired).await {
            Ok(live) => live,
            Err(e) => return self.record_failure(state, e.into(), request),
        };
        let drift = self.diff.compare(&desired, &live, name);

        let rejections = self.active_rejections(request, &desired, &drift)?;
        let blocked: BTreeSet<ResourceRef> = rejections.iter().map(|r| r.reference.clone()).collect();
        let plan = sync::plan(&drift, &state.policy, &blocked);

        if request.plan_requested && !request.dry_run {
            log::info!(
                "Dry run of {} merged into a {} cycle; publishing its plan",
                name,
                request.reason
            );
            self.events.send(StatusEvent {
                status: self.status()?,
                plan: Some(plan.clone()),
                result: None,
            });
        }

        if request.dry_run {
            log::info!(
                "Dry run of {} at {}: {} drifted, {} planned actions",
                name,
                head.short(),
                drift.len(),
                plan.len()
            );
            let status = self.status()?;
            self.events.send(StatusEvent {
                status: status.clone(),
                plan: Some(plan.clone()),
                result: None,
            });
            return Ok(CycleOutcome {
                revision: head,
                drift,
                plan,
                result: None,
                status,
                dry_run: true,
                skipped: false,
            });
        }

        state.last_observed_revision = Some(head.clone());
        state.invalid_revision = None;
        state.last_error = None;
        state.reconciled_at = Some(Utc::now());

        if drift.is_empty() {
            self.mark_converged(&mut state, &head)?;
            return self.finish(state, head, drift, plan, None);
        }

        if !state.policy.auto_sync && !request.manual {
            log::info!(
                "{} is out of sync at {} ({} resources), auto-sync disabled",
                name,
                head.short(),
                drift.len()
            );
            state.sync_status = SyncStatus::OutOfSync;
            state.health_status = HealthStatus::for_drift(&drift, !rejections.is_empty());
            state.last_drift = drift.clone();
            state.message = Some(format!(
                "Auto-sync disabled; {} resource(s) out of sync",
                drift.len()
            ));
            return self.finish(state, head, drift, plan, None);
        }

        log::info!(
            "Syncing {} to {} ({} drifted resources)",
            name,
            head.short(),
            drift.len()
        );
        let result = self
            .executor
            .apply(
                &ApplyRequest {
                    application: name,
                    desired: &desired,
                    live: &live,
                    drifts: &drift,
                    policy: state.policy,
                    blocked: &blocked,
                },
                self.shutdown.clone(),
            )
            .await;

        for failure in result.rejected() {
            let fingerprint = desired
                .get(&failure.reference)
                .map(Resource::fingerprint)
                .unwrap_or_default();
            rejection_repo::record(&self.db, name, &failure.reference, &fingerprint, &head, &failure.message)?;
            log::error!(
                "{} rejected at revision {}: {}",
                failure.reference,
                head.short(),
                failure.message
            );
        }

        let remaining = match self.reader.observe(&scope, &desired).await {
            Ok(live) => self.diff.compare(&desired, &live, name),
            Err(e) => return self.record_failure(state, e.into(), request),
        };

        if remaining.is_empty() {
            self.mark_converged(&mut state, &head)?;
        } else {
            let rejections = rejection_repo::list_for(&self.db, name)?;
            state.sync_status = SyncStatus::OutOfSync;
            state.health_status = HealthStatus::for_drift(&remaining, !rejections.is_empty());
            state.message = Some(if result.cancelled {
                "Sync interrupted by shutdown; in-flight rollouts resume on restart".to_string()
            } else {
                describe_remaining(&remaining, &rejections, &result)
            });
            state.last_error = result
                .failures
                .iter()
                .find(|f| f.kind == FailureKind::Unavailable)
                .map(|f| f.message.clone());
            state.last_drift = remaining;
        }

        self.finish(state, head, drift, plan, Some(result))
    }

    /// Loads recorded rejections and drops the ones that no longer apply.
    ///
    /// A rejection stays active while the declaration it was recorded for
    /// is unchanged and still drifted. A real manual sync clears them all.
    fn active_rejections(
        &self,
        request: &CycleRequest,
        desired: &ManifestSet,
        drift: &[Drift],
    ) -> Result<Vec<Rejection>, DatabaseError> {
        let name = self.app.name.as_str();
        let recorded = rejection_repo::list_for(&self.db, name)?;

        if request.manual && !request.dry_run {
            if !recorded.is_empty() {
                log::info!("Manual sync of {} retries {} rejected resource(s)", name, recorded.len());
                rejection_repo::clear(&self.db, name)?;
            }
            return Ok(Vec::new());
        }

        let mut active = Vec::with_capacity(recorded.len());
        for rejection in recorded {
            let fingerprint = desired
                .get(&rejection.reference)
                .map(Resource::fingerprint)
                .unwrap_or_default();
            let drifted = drift.iter().any(|d| d.reference == rejection.reference);
            if fingerprint == rejection.fingerprint && drifted {
                active.push(rejection);
            } else if !request.dry_run {
                log::info!("Declaration of {} changed, retrying", rejection.reference);
                rejection_repo::remove(&self.db, name, &rejection.reference)?;
            }
        }
        Ok(active)
    }

    fn mark_converged(&self, state: &mut ApplicationState, head: &Revision) -> Result<(), DatabaseError> {
        let name = self.app.name.as_str();
        if state.sync_status != SyncStatus::Synced
            || state.last_applied_revision.as_ref() != Some(head)
        {
            log::info!("{} is in sync at {}", name, head.short());
        }
        state.converged(head);

        let stale = rollout_repo::delete_all(&self.db, name)?;
        if stale > 0 {
            log::debug!("Dropped {} finished rollout record(s) of {}", stale, name);
        }
        rejection_repo::clear(&self.db, name)?;
        Ok(())
    }

    /// Records a failure that leaves statuses untouched and returns it.
    fn record_failure(
        &self,
        mut state: ApplicationState,
        error: ReconcileError,
        request: &CycleRequest,
    ) -> Result<CycleOutcome, ReconcileError> {
        log::warn!("Cycle of {} failed, keeping last status: {}", self.app.name, error);
        if !request.dry_run {
            state.last_error = Some(error.to_string());
            self.persist(&mut state)?;
            self.publish(&state, None)?;
        }
        Err(error)
    }

    /// The head revision does not parse: Degraded, sync status retained.
    fn record_invalid(
        &self,
        mut state: ApplicationState,
        head: Revision,
        error: SourceError,
        request: &CycleRequest,
    ) -> Result<CycleOutcome, ReconcileError> {
        log::error!("Revision {} of {} is invalid: {}", head.short(), self.app.name, error);
        if request.dry_run {
            return Err(error.into());
        }
        state.health_status = HealthStatus::Degraded;
        state.invalid_revision = Some(head.clone());
        state.last_observed_revision = Some(head.clone());
        state.message = Some(error.to_string());
        state.last_error = None;
        state.reconciled_at = Some(Utc::now());
        self.finish(state, head, Vec::new(), Vec::new(), None)
    }

    fn finish(
        &self,
        mut state: ApplicationState,
        revision: Revision,
        drift: Vec<Drift>,
        plan: Vec<PlannedAction>,
        result: Option<SyncResult>,
    ) -> Result<CycleOutcome, ReconcileError> {
        self.persist(&mut state)?;
        let status = self.publish(&state, result.clone())?;
        log::debug!("{} is {}", self.app.name, status.summary());
        Ok(CycleOutcome {
            revision,
            drift,
            plan,
            result,
            status,
            dry_run: false,
            skipped: false,
        })
    }

    /// Saves the state, keeping an operator policy set while the cycle ran.
    fn persist(&self, state: &mut ApplicationState) -> Result<(), DatabaseError> {
        if let Some(stored) = app_repo::find(&self.db, &state.name)? {
            if stored.policy_source == PolicySource::Operator {
                state.policy = stored.policy;
                state.policy_source = PolicySource::Operator;
            }
        }
        app_repo::save(&self.db, state)
    }

    fn publish(&self, state: &ApplicationState, result: Option<SyncResult>) -> Result<StatusReport, DatabaseError> {
        let rollouts = rollout_repo::list_for(&self.db, &state.name)?;
        let status = StatusReport::from_state(state, &rollouts);
        self.events.send(StatusEvent {
            status: status.clone(),
            plan: None,
            result,
        });
        Ok(status)
    }
}

fn describe_remaining(remaining: &[Drift], rejections: &[Rejection], result: &SyncResult) -> String {
    if !rejections.is_empty() {
        let reasons: Vec<String> = rejections
            .iter()
            .map(|r| format!("{}: {}", r.reference, r.reason))
            .collect();
        return format!("{} resource(s) rejected: {}", rejections.len(), reasons.join("; "));
    }
    if !result.skipped.is_empty() {
        return format!(
            "{} resource(s) out of sync, {} left in place",
            remaining.len(),
            result.skipped.len()
        );
    }
    format!("{} resource(s) still out of sync", remaining.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::DriftKind;
    use crate::manifest::ResourceKind;
    use crate::provider::InMemoryProvider;
    use crate::source::DirectorySource;
    use std::time::Duration;
    use tempfile::TempDir;

    const CONFIG: &str = "apiVersion: converge.dev/v1\nkind: ConfigMap\nmetadata:\n  name: settings\nspec:\n  data:\n    mode: live\n";

    struct Fixture {
        dir: TempDir,
        memory: Arc<InMemoryProvider>,
        db: Database,
        reconciler: Reconciler,
        events: StatusBroadcaster,
        _shutdown: watch::Sender<bool>,
    }

    fn fixture(policy: SyncPolicy) -> Fixture {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("settings.yaml"), CONFIG).unwrap();
        let memory = Arc::new(InMemoryProvider::new());
        let db = Database::open_in_memory().unwrap();
        let (tx, rx) = watch::channel(false);
        let app = Application {
            name: "shop".to_string(),
            namespace: "shop".to_string(),
            source: format!("dir://{}", dir.path().display()),
            policy,
        };
        let settings = ReconcilerSettings {
            diff: DiffOptions::default(),
            rollout: RolloutOptions {
                poll_interval: Duration::from_millis(5),
                progress_deadline: Duration::from_millis(500),
            },
        };
        let events = StatusBroadcaster::default();
        let reconciler = Reconciler::new(
            app,
            Arc::new(DirectorySource::new(dir.path(), "shop")),
            memory.clone(),
            db.clone(),
            events.clone(),
            &settings,
            rx,
        );
        Fixture {
            dir,
            memory,
            db,
            reconciler,
            events,
            _shutdown: tx,
        }
    }

    fn settings_ref() -> ResourceRef {
        ResourceRef::new(ResourceKind::ConfigMap, "shop", "settings")
    }

    #[tokio::test]
    async fn test_auto_sync_creates_and_converges() {
        let f = fixture(SyncPolicy {
            auto_sync: true,
            prune: false,
        });
        let outcome = f.reconciler.reconcile(&CycleRequest::timer()).await.unwrap();
        assert_eq!(outcome.drift.len(), 1);
        assert_eq!(outcome.drift[0].kind, DriftKind::Missing);
        assert_eq!(outcome.status.sync_status, SyncStatus::Synced);
        assert_eq!(outcome.status.last_applied_revision, Some(outcome.revision.clone()));
        assert!(f.memory.snapshot(&settings_ref()).is_some());

        let again = f.reconciler.reconcile(&CycleRequest::timer()).await.unwrap();
        assert!(again.drift.is_empty());
        assert!(again.result.is_none());
    }

    #[tokio::test]
    async fn test_manual_only_without_auto_sync() {
        let f = fixture(SyncPolicy::default());
        let outcome = f.reconciler.reconcile(&CycleRequest::timer()).await.unwrap();
        assert_eq!(outcome.status.sync_status, SyncStatus::OutOfSync);
        assert_eq!(outcome.status.health_status, HealthStatus::Missing);
        assert!(f.memory.snapshot(&settings_ref()).is_none());

        let manual = f.reconciler.reconcile(&CycleRequest::manual(false)).await.unwrap();
        assert_eq!(manual.status.sync_status, SyncStatus::Synced);
        assert!(f.memory.snapshot(&settings_ref()).is_some());
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let f = fixture(SyncPolicy::default());
        let outcome = f.reconciler.reconcile(&CycleRequest::manual(true)).await.unwrap();
        assert!(outcome.dry_run);
        assert_eq!(outcome.plan.len(), 1);
        assert_eq!(outcome.plan[0].action, sync::ActionKind::Create);
        assert_eq!(outcome.status.sync_status, SyncStatus::Unknown);
        assert!(f.memory.snapshot(&settings_ref()).is_none());
        assert!(app_repo::find(&f.db, "shop").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merged_dry_run_still_publishes_its_plan() {
        let f = fixture(SyncPolicy {
            auto_sync: true,
            prune: false,
        });
        let mut events = f.events.subscribe();
        let request = CycleRequest::manual(true).merge(CycleRequest::timer());

        let outcome = f.reconciler.reconcile(&request).await.unwrap();
        assert!(!outcome.dry_run);
        assert_eq!(outcome.status.sync_status, SyncStatus::Synced);

        let planned = events.try_recv().unwrap();
        let plan = planned.plan.expect("plan event first");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].action, sync::ActionKind::Create);
        let finished = events.try_recv().unwrap();
        assert!(finished.plan.is_none());
        assert_eq!(finished.status.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_invalid_revision_is_skipped_until_it_changes() {
        let f = fixture(SyncPolicy {
            auto_sync: true,
            prune: false,
        });
        f.reconciler.reconcile(&CycleRequest::timer()).await.unwrap();

        std::fs::write(f.dir.path().join("broken.yaml"), "kind: [unclosed").unwrap();
        let outcome = f.reconciler.reconcile(&CycleRequest::timer()).await.unwrap();
        assert_eq!(outcome.status.health_status, HealthStatus::Degraded);
        assert_eq!(outcome.status.sync_status, SyncStatus::Synced);

        let skipped = f.reconciler.reconcile(&CycleRequest::timer()).await.unwrap();
        assert!(skipped.skipped);

        std::fs::remove_file(f.dir.path().join("broken.yaml")).unwrap();
        let recovered = f.reconciler.reconcile(&CycleRequest::timer()).await.unwrap();
        assert_eq!(recovered.status.summary(), "Synced/Healthy");
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_status() {
        let f = fixture(SyncPolicy {
            auto_sync: true,
            prune: false,
        });
        f.reconciler.reconcile(&CycleRequest::timer()).await.unwrap();

        f.memory.set_unavailable(true);
        let err = f.reconciler.reconcile(&CycleRequest::timer()).await.unwrap_err();
        assert!(err.is_transient());

        let status = f.reconciler.status().unwrap();
        assert_eq!(status.summary(), "Synced/Healthy");
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_operator_policy_wins_over_config() {
        let f = fixture(SyncPolicy::default());
        let status = f
            .reconciler
            .set_policy(SyncPolicy {
                auto_sync: true,
                prune: true,
            })
            .unwrap();
        assert_eq!(status.policy_source, PolicySource::Operator);

        let outcome = f.reconciler.reconcile(&CycleRequest::timer()).await.unwrap();
        assert_eq!(outcome.status.sync_status, SyncStatus::Synced);
        assert!(outcome.status.policy.auto_sync);
        assert_eq!(outcome.status.policy_source, PolicySource::Operator);
    }
}
