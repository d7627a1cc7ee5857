//! Test harness for isolated reconciliation runs.
//!
//! The `TestHarness` provides:
//! - A temporary manifest directory read through `DirectorySource`
//! - An `InMemoryProvider` cluster with fault injection
//! - A file-backed SQLite store, so a "restart" re-opens the same state
//! - Fast rollout timings

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::watch;

use converge::reconcile::{
    Controller, ControllerSettings, CycleOutcome, CycleRequest, Reconciler, ReconcilerSettings,
};
use converge::sync::RolloutOptions;
use converge::{
    Application, Database, DiffOptions, DirectorySource, InMemoryProvider, ReconcileError,
    StatusBroadcaster, StatusReport, SyncPolicy,
};

pub const APP: &str = "shop";
pub const NAMESPACE: &str = "shop";

pub struct TestHarness {
    temp_dir: TempDir,
    /// Directory the application's manifests are read from.
    pub manifest_dir: PathBuf,
    /// SQLite file backing the state store.
    pub db_path: PathBuf,
    /// The simulated cluster.
    pub cluster: Arc<InMemoryProvider>,
    pub db: Database,
    policy: SyncPolicy,
    settings: ReconcilerSettings,
    shutdown: watch::Sender<bool>,
    reconciler: Arc<Reconciler>,
}

impl TestHarness {
    /// Creates a harness whose application has the given config policy.
    pub fn new(policy: SyncPolicy) -> Self {
        Self::with_deadline(policy, Duration::from_secs(5))
    }

    pub fn auto_sync() -> Self {
        Self::new(SyncPolicy {
            auto_sync: true,
            prune: false,
        })
    }

    pub fn auto_sync_with_prune() -> Self {
        Self::new(SyncPolicy {
            auto_sync: true,
            prune: true,
        })
    }

    /// Creates a harness with a custom rollout progress deadline.
    pub fn with_deadline(policy: SyncPolicy, progress_deadline: Duration) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let manifest_dir = temp_dir.path().join("manifests");
        std::fs::create_dir_all(&manifest_dir).expect("Failed to create manifest dir");
        let db_path = temp_dir.path().join("state.db");
        let db = Database::open(&db_path).expect("Failed to open database");
        let cluster = Arc::new(InMemoryProvider::new());
        let settings = ReconcilerSettings {
            diff: DiffOptions::default(),
            rollout: RolloutOptions {
                poll_interval: Duration::from_millis(5),
                progress_deadline,
            },
        };
        let (shutdown, shutdown_rx) = watch::channel(false);
        let reconciler = Arc::new(Self::build_reconciler(
            &manifest_dir,
            &cluster,
            &db,
            policy,
            &settings,
            shutdown_rx,
        ));

        Self {
            temp_dir,
            manifest_dir,
            db_path,
            cluster,
            db,
            policy,
            settings,
            shutdown,
            reconciler,
        }
    }

    fn application(dir: &Path, policy: SyncPolicy) -> Application {
        Application {
            name: APP.to_string(),
            namespace: NAMESPACE.to_string(),
            source: format!("dir://{}", dir.display()),
            policy,
        }
    }

    fn build_reconciler(
        dir: &Path,
        cluster: &Arc<InMemoryProvider>,
        db: &Database,
        policy: SyncPolicy,
        settings: &ReconcilerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Reconciler {
        Reconciler::new(
            Self::application(dir, policy),
            Arc::new(DirectorySource::new(dir, NAMESPACE)),
            cluster.clone(),
            db.clone(),
            StatusBroadcaster::default(),
            settings,
            shutdown,
        )
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes (or replaces) a manifest file.
    pub fn write_manifest(&self, filename: &str, content: &str) -> PathBuf {
        let path = self.manifest_dir.join(filename);
        std::fs::write(&path, content).expect("Failed to write manifest");
        path
    }

    pub fn remove_manifest(&self, filename: &str) {
        std::fs::remove_file(self.manifest_dir.join(filename)).expect("Failed to remove manifest");
    }

    pub fn reconciler(&self) -> Arc<Reconciler> {
        Arc::clone(&self.reconciler)
    }

    /// Runs a timer-triggered cycle.
    pub async fn cycle(&self) -> Result<CycleOutcome, ReconcileError> {
        self.reconciler.reconcile(&CycleRequest::timer()).await
    }

    /// Runs a manual sync.
    pub async fn manual_sync(&self) -> Result<CycleOutcome, ReconcileError> {
        self.reconciler.reconcile(&CycleRequest::manual(false)).await
    }

    pub async fn dry_run(&self) -> Result<CycleOutcome, ReconcileError> {
        self.reconciler.reconcile(&CycleRequest::manual(true)).await
    }

    pub fn status(&self) -> StatusReport {
        self.reconciler.status().expect("Failed to read status")
    }

    /// Signals shutdown to the running reconciler.
    pub fn cancel(&self) {
        self.shutdown.send_replace(true);
    }

    /// Simulates a process restart: re-opens the store from disk and builds
    /// a fresh reconciler. The cluster keeps running.
    pub fn restart(&mut self) {
        self.db = Database::open(&self.db_path).expect("Failed to re-open database");
        let (shutdown, shutdown_rx) = watch::channel(false);
        self.shutdown = shutdown;
        self.reconciler = Arc::new(Self::build_reconciler(
            &self.manifest_dir,
            &self.cluster,
            &self.db,
            self.policy,
            &self.settings,
            shutdown_rx,
        ));
    }

    /// A controller over the same store, cluster and manifest directory.
    pub fn controller(&self, interval: Duration) -> Controller {
        let mut controller = Controller::new(
            self.db.clone(),
            self.cluster.clone(),
            ControllerSettings {
                reconcile_interval: interval,
                reconciler: self.settings.clone(),
            },
        );
        controller
            .add_application(
                Self::application(&self.manifest_dir, self.policy),
                Arc::new(DirectorySource::new(&self.manifest_dir, NAMESPACE)),
                None,
            )
            .expect("Failed to register application");
        controller
    }
}
