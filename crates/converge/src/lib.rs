pub mod app;
pub mod config;
pub mod db;
pub mod diff;
pub mod error;
pub mod events;
pub mod live;
pub mod manifest;
pub mod provider;
pub mod reconcile;
pub mod source;
pub mod status;
pub mod sync;

pub use app::{Application, ApplicationState, HealthStatus, PolicySource, SyncPolicy, SyncStatus};
pub use config::{load_config, load_config_from_str, ControllerConfig};
pub use db::Database;
pub use diff::{DiffEngine, DiffOptions, Drift, DriftKind, FieldDelta};
pub use error::{ConfigError, ConvergeError, ReconcileError};
pub use events::{StatusBroadcaster, StatusEvent};
pub use live::{LiveState, LiveStateReader, Observation, Scope};
pub use manifest::{ManifestSet, Resource, ResourceKind, ResourceRef, Revision};
pub use provider::{InMemoryProvider, ObservedResource, ProviderError, ResourceProvider};
pub use reconcile::{Controller, CycleOutcome, RevisionNotifier, SyncOptions, TriggerAck};
pub use source::{DirectorySource, GitSource, ManifestSource, SourceError};
pub use status::{StatusReport, StatusReporter};
pub use sync::{ActionKind, PlannedAction, SyncExecutor, SyncResult};
