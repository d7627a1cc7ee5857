//! The controller: one reconciler, trigger queue and scheduler per
//! application, plus the operator-facing API.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use super::reconciler::{CycleOutcome, Reconciler, ReconcilerSettings};
use super::scheduler::{CycleRequest, SyncScheduler, TriggerAck, TriggerQueue};
use crate::app::{Application, SyncPolicy};
use crate::config::{ControllerConfig, SourceConfig};
use crate::db::Database;
use crate::error::ReconcileError;
use crate::events::{StatusBroadcaster, StatusEvent};
use crate::manifest::Revision;
use crate::provider::{ResourceProvider, TimedProvider};
use crate::source::git::GitSourceSettings;
use crate::source::{DirectorySource, GitSource, ManifestSource, SourceWatcher};
use crate::status::StatusReport;

/// Options of a manual sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOptions {
    #[serde(default)]
    pub dry_run: bool,
}

/// Controller-wide settings.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub reconcile_interval: Duration,
    pub reconciler: ReconcilerSettings,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            reconcile_interval: Duration::from_secs(180),
            reconciler: ReconcilerSettings::default(),
        }
    }
}

/// Handle a producer uses to announce a new revision of one application.
///
/// It can only enqueue a cycle; it has no access to the cluster.
#[derive(Clone)]
pub struct RevisionNotifier {
    application: String,
    queue: Arc<TriggerQueue>,
}

impl RevisionNotifier {
    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn notify(&self, revision: Option<Revision>) -> TriggerAck {
        self.queue.push(CycleRequest::revision(revision))
    }
}

struct AppHandle {
    reconciler: Arc<Reconciler>,
    queue: Arc<TriggerQueue>,
    watch_root: Option<PathBuf>,
}

pub struct Controller {
    apps: BTreeMap<String, AppHandle>,
    provider: Arc<dyn ResourceProvider>,
    db: Database,
    events: StatusBroadcaster,
    settings: ControllerSettings,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    watchers: Mutex<Vec<SourceWatcher>>,
}

impl Controller {
    /// Creates a controller without applications.
    pub fn new(db: Database, provider: Arc<dyn ResourceProvider>, settings: ControllerSettings) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            apps: BTreeMap::new(),
            provider,
            db,
            events: StatusBroadcaster::default(),
            settings,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Builds a controller for every application in `config`.
    ///
    /// Provider calls are bounded by the configured timeout.
    pub fn from_config(
        config: &ControllerConfig,
        db: Database,
        provider: Arc<dyn ResourceProvider>,
    ) -> Result<Self, ReconcileError> {
        let provider: Arc<dyn ResourceProvider> =
            Arc::new(TimedProvider::new(provider, config.provider_timeout()));
        let settings = ControllerSettings {
            reconcile_interval: config.reconcile_interval(),
            reconciler: ReconcilerSettings {
                diff: config.diff_options(),
                rollout: config.rollout_options(),
            },
        };
        let mut controller = Self::new(db, provider, settings);

        for app_config in &config.applications {
            let app = app_config.to_application(config);
            let namespace = app.namespace.clone();
            let (source, watch_root): (Arc<dyn ManifestSource>, Option<PathBuf>) = match &app_config.source {
                SourceConfig::Git {
                    repo_path,
                    url,
                    branch,
                    path,
                } => {
                    let settings = GitSourceSettings {
                        repo_path: config.resolve(repo_path),
                        url: url.clone(),
                        branch: branch.clone(),
                        path: path.clone(),
                        timeout: config.git_timeout(),
                    };
                    (Arc::new(GitSource::new(settings, namespace)), None)
                }
                SourceConfig::Directory { path } => {
                    let root = config.resolve(path);
                    (Arc::new(DirectorySource::new(root.clone(), namespace)), Some(root))
                }
            };
            controller.add_application(app, source, watch_root)?;
        }

        Ok(controller)
    }

    /// Registers an application. Must happen before [`Controller::start`].
    ///
    /// With `watch_root` set, file changes below it trigger a cycle.
    pub fn add_application(
        &mut self,
        app: Application,
        source: Arc<dyn ManifestSource>,
        watch_root: Option<PathBuf>,
    ) -> Result<(), ReconcileError> {
        if self.apps.contains_key(&app.name) {
            return Err(ReconcileError::DuplicateApplication(app.name));
        }
        let name = app.name.clone();
        log::info!("Tracking {} from {}", name, app.source);
        let reconciler = Reconciler::new(
            app,
            source,
            Arc::clone(&self.provider),
            self.db.clone(),
            self.events.clone(),
            &self.settings.reconciler,
            self.shutdown_tx.subscribe(),
        );
        self.apps.insert(
            name,
            AppHandle {
                reconciler: Arc::new(reconciler),
                queue: Arc::new(TriggerQueue::new()),
                watch_root,
            },
        );
        Ok(())
    }

    /// Names of the tracked applications, sorted.
    pub fn applications(&self) -> Vec<String> {
        self.apps.keys().cloned().collect()
    }

    /// Spawns the schedulers and file watchers. Requires a tokio runtime.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !tasks.is_empty() {
            log::warn!("Controller already started");
            return;
        }
        let mut watchers = self.watchers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        for (name, handle) in &self.apps {
            let scheduler = SyncScheduler::new(
                Arc::clone(&handle.reconciler),
                Arc::clone(&handle.queue),
                self.settings.reconcile_interval,
            );
            tasks.push(scheduler.spawn(self.shutdown_tx.subscribe()));

            if let Some(root) = &handle.watch_root {
                let mut watcher = SourceWatcher::new(root.clone());
                let changes = watcher.subscribe();
                watcher.start();
                tasks.push(forward_changes(
                    name.clone(),
                    changes,
                    Arc::clone(&handle.queue),
                    self.shutdown_tx.subscribe(),
                ));
                watchers.push(watcher);
            }
        }

        log::info!("Controller started with {} application(s)", self.apps.len());
    }

    fn handle(&self, application: &str) -> Result<&AppHandle, ReconcileError> {
        self.apps
            .get(application)
            .ok_or_else(|| ReconcileError::UnknownApplication(application.to_string()))
    }

    /// Last persisted status of one application.
    pub fn status(&self, application: &str) -> Result<StatusReport, ReconcileError> {
        Ok(self.handle(application)?.reconciler.status()?)
    }

    /// Status of every tracked application, sorted by name.
    pub fn statuses(&self) -> Result<Vec<StatusReport>, ReconcileError> {
        self.apps
            .values()
            .map(|handle| Ok(handle.reconciler.status()?))
            .collect()
    }

    /// Queues a manual sync and returns without waiting for it.
    pub fn trigger_sync(&self, application: &str, options: SyncOptions) -> Result<TriggerAck, ReconcileError> {
        let ack = self
            .handle(application)?
            .queue
            .push(CycleRequest::manual(options.dry_run));
        log::info!("Manual sync of {} requested ({:?})", application, ack);
        Ok(ack)
    }

    /// Runs a manual sync now and waits for its outcome.
    pub async fn sync_now(&self, application: &str, options: SyncOptions) -> Result<CycleOutcome, ReconcileError> {
        let reconciler = Arc::clone(&self.handle(application)?.reconciler);
        reconciler.reconcile(&CycleRequest::manual(options.dry_run)).await
    }

    /// Sets the sync policy of one application as an operator override.
    pub fn set_auto_sync(&self, application: &str, enabled: bool, prune: bool) -> Result<StatusReport, ReconcileError> {
        let policy = SyncPolicy {
            auto_sync: enabled,
            prune,
        };
        Ok(self.handle(application)?.reconciler.set_policy(policy)?)
    }

    /// Announces a new revision on behalf of a producer.
    pub fn notify_revision(&self, application: &str, revision: Option<Revision>) -> Result<TriggerAck, ReconcileError> {
        Ok(self.revision_notifier(application)?.notify(revision))
    }

    pub fn revision_notifier(&self, application: &str) -> Result<RevisionNotifier, ReconcileError> {
        let handle = self.handle(application)?;
        Ok(RevisionNotifier {
            application: application.to_string(),
            queue: Arc::clone(&handle.queue),
        })
    }

    /// Status events, one per completed cycle.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Stops watchers and schedulers and waits for running cycles.
    ///
    /// A rollout in flight stops at its next step boundary; its progress is
    /// persisted and picked up again after a restart.
    pub async fn shutdown(&self) {
        log::info!("Controller shutting down");
        self.shutdown_tx.send_replace(true);

        let watchers = std::mem::take(&mut *self.watchers.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        for mut watcher in watchers {
            watcher.stop();
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                log::error!("Controller task failed: {}", e);
            }
        }
        log::info!("Controller stopped");
    }
}

/// Turns watcher events into cycle requests.
fn forward_changes(
    application: String,
    mut changes: broadcast::Receiver<crate::source::watcher::SourceChangeEvent>,
    queue: Arc<TriggerQueue>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = changes.recv() => match event {
                    Ok(event) => {
                        log::debug!("{} changed in source of {}", event.path, application);
                        queue.push(CycleRequest::source_changed());
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("Missed {} change events of {}", skipped, application);
                        queue.push(CycleRequest::source_changed());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}
