//! Reconciliation: per-application cycles, their triggers and the controller
//! that owns them.

pub mod controller;
pub mod reconciler;
pub mod scheduler;

pub use controller::{Controller, ControllerSettings, RevisionNotifier, SyncOptions};
pub use reconciler::{CycleOutcome, Reconciler, ReconcilerSettings};
pub use scheduler::{CycleRequest, SyncScheduler, TriggerAck, TriggerQueue, TriggerReason};
