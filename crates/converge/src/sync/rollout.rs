//! Rolling replacement of workload replicas.
//!
//! A rollout is a persisted state machine keyed by resource reference. Every
//! step re-reads the live replicas, performs exactly one provider mutation
//! and saves its progress, so an interrupted rollout resumes where it
//! stopped instead of starting over.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::db::{rollout_repo, Database, DatabaseError};
use crate::manifest::ResourceRef;
use crate::provider::{ProviderError, Replica, ResourceProvider};

/// Timing knobs for rollouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutOptions {
    /// Delay between readiness probes of a new replica.
    pub poll_interval: Duration,
    /// How long a new replica may take to become ready.
    pub progress_deadline: Duration,
}

impl Default for RolloutOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            progress_deadline: Duration::from_secs(600),
        }
    }
}

/// Progress of one workload rollout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutState {
    /// Stable id, the resource reference.
    pub id: String,
    pub application: String,
    pub reference: ResourceRef,
    /// Template hash replicas are being moved to.
    pub target_hash: String,
    pub desired_replicas: u32,
    /// Live replica count per template hash at the last step.
    pub replicas_by_revision: BTreeMap<String, u32>,
    pub ready_replicas: u32,
    pub steps_completed: u32,
    /// Replica started by the last surge step and not yet confirmed ready.
    pub pending_replica: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RolloutState {
    pub fn new(
        application: impl Into<String>,
        reference: ResourceRef,
        target_hash: impl Into<String>,
        desired_replicas: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: reference.to_string(),
            application: application.into(),
            reference,
            target_hash: target_hash.into(),
            desired_replicas,
            replicas_by_revision: BTreeMap::new(),
            ready_replicas: 0,
            steps_completed: 0,
            pending_replica: None,
            started_at: now,
            updated_at: now,
        }
    }

    fn observe(&mut self, replicas: &[Replica]) {
        self.replicas_by_revision.clear();
        for replica in replicas {
            *self
                .replicas_by_revision
                .entry(replica.template_hash.clone())
                .or_insert(0) += 1;
        }
        self.ready_replicas = replicas.iter().filter(|r| r.ready).count() as u32;
    }

    /// Replicas already running the target template.
    pub fn updated_replicas(&self) -> u32 {
        self.replicas_by_revision
            .get(&self.target_hash)
            .copied()
            .unwrap_or(0)
    }
}

/// How a rollout ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutOutcome {
    /// Every replica runs the target template and is ready.
    Completed { steps: u32 },
    /// Shutdown was requested; progress is saved.
    Cancelled,
}

/// Errors that stop a rollout.
#[derive(Error, Debug)]
pub enum RolloutError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Replica {replica} of {reference} not ready after {waited_secs}s")]
    NeverReady {
        reference: ResourceRef,
        replica: String,
        waited_secs: u64,
    },

    #[error("Failed to persist rollout state: {0}")]
    Store(#[from] DatabaseError),
}

enum Wait {
    Ready,
    DeadlineExceeded(Duration),
    Cancelled,
}

/// Drives one workload to its target template, one replica at a time.
///
/// Ready capacity never drops below `desired - 1`: an old replica is only
/// retired while ready capacity exceeds the desired count.
pub struct RolloutRunner<'a> {
    provider: &'a dyn ResourceProvider,
    db: &'a Database,
    options: &'a RolloutOptions,
    shutdown: watch::Receiver<bool>,
}

impl<'a> RolloutRunner<'a> {
    pub fn new(
        provider: &'a dyn ResourceProvider,
        db: &'a Database,
        options: &'a RolloutOptions,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            provider,
            db,
            options,
            shutdown,
        }
    }

    fn cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn save(&self, state: &mut RolloutState) -> Result<(), RolloutError> {
        state.updated_at = Utc::now();
        rollout_repo::save(self.db, state)?;
        Ok(())
    }

    /// Runs (or resumes) the rollout of `reference` to `target_hash`.
    pub async fn run(
        &mut self,
        application: &str,
        reference: &ResourceRef,
        target_hash: &str,
        desired: u32,
    ) -> Result<RolloutOutcome, RolloutError> {
        let mut state = match rollout_repo::find(self.db, application, reference)? {
            Some(saved) if saved.target_hash == target_hash => {
                log::info!(
                    "Resuming rollout of {} after {} steps",
                    reference,
                    saved.steps_completed
                );
                saved
            }
            Some(saved) => {
                log::info!(
                    "Target of {} moved from {} to {}, restarting rollout",
                    reference,
                    saved.target_hash,
                    target_hash
                );
                RolloutState::new(application, reference.clone(), target_hash, desired)
            }
            None => RolloutState::new(application, reference.clone(), target_hash, desired),
        };
        state.desired_replicas = desired;
        let desired = desired as usize;

        loop {
            if self.cancelled() {
                self.save(&mut state)?;
                return Ok(RolloutOutcome::Cancelled);
            }

            let observed = self
                .provider
                .get(reference)
                .await?
                .ok_or_else(|| ProviderError::NotFound(reference.clone()))?;
            state.observe(&observed.replicas);
            let replicas = &observed.replicas;

            if let Some(pending) = state.pending_replica.clone() {
                let still_starting = replicas.iter().any(|r| r.id == pending && !r.ready);
                if still_starting {
                    self.save(&mut state)?;
                    match self.wait_ready(reference, &pending).await? {
                        Wait::Ready => {
                            state.steps_completed += 1;
                            log::info!("Replica {} of {} is ready", pending, reference);
                        }
                        Wait::Cancelled => {
                            self.save(&mut state)?;
                            return Ok(RolloutOutcome::Cancelled);
                        }
                        Wait::DeadlineExceeded(waited) => {
                            // Not serving, so stopping it costs no capacity.
                            self.stop(reference, &pending).await?;
                            rollout_repo::delete(self.db, application, reference)?;
                            return Err(RolloutError::NeverReady {
                                reference: reference.clone(),
                                replica: pending,
                                waited_secs: waited.as_secs(),
                            });
                        }
                    }
                }
                state.pending_replica = None;
                self.save(&mut state)?;
                continue;
            }

            let new_ready: Vec<&Replica> = replicas
                .iter()
                .filter(|r| r.ready && r.template_hash == target_hash)
                .collect();
            let old: Vec<&Replica> = replicas
                .iter()
                .filter(|r| r.template_hash != target_hash)
                .collect();

            if let Some(stray) = replicas.iter().find(|r| !r.ready) {
                log::debug!("Retiring unready replica {} of {}", stray.id, reference);
                self.stop(reference, &stray.id).await?;
            } else if !old.is_empty() && new_ready.len() + old.len() > desired {
                log::info!(
                    "Retiring old replica {} of {} ({} updated, {} old)",
                    old[0].id,
                    reference,
                    new_ready.len(),
                    old.len()
                );
                self.stop(reference, &old[0].id).await?;
            } else if old.is_empty() && new_ready.len() > desired {
                let surplus = new_ready[new_ready.len() - 1];
                log::info!("Scaling in {} to {} replicas", reference, desired);
                self.stop(reference, &surplus.id).await?;
            } else if new_ready.len() < desired {
                let replica = self.provider.start_replica(reference, target_hash).await?;
                log::info!(
                    "Started replica {} of {} ({}/{} updated)",
                    replica.id,
                    reference,
                    new_ready.len() + 1,
                    desired
                );
                state.pending_replica = Some(replica.id);
            } else {
                rollout_repo::delete(self.db, application, reference)?;
                log::info!(
                    "Rollout of {} complete after {} steps",
                    reference,
                    state.steps_completed
                );
                return Ok(RolloutOutcome::Completed {
                    steps: state.steps_completed,
                });
            }

            if state.pending_replica.is_none() {
                state.steps_completed += 1;
            }
            self.save(&mut state)?;
        }
    }

    async fn stop(&self, reference: &ResourceRef, replica_id: &str) -> Result<(), RolloutError> {
        match self.provider.stop_replica(reference, replica_id).await {
            Ok(()) | Err(ProviderError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_ready(&mut self, reference: &ResourceRef, replica_id: &str) -> Result<Wait, RolloutError> {
        let started = Instant::now();
        loop {
            if self.provider.replica_ready(reference, replica_id).await? {
                return Ok(Wait::Ready);
            }
            let waited = started.elapsed();
            if waited >= self.options.progress_deadline {
                return Ok(Wait::DeadlineExceeded(waited));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.options.poll_interval) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone: nobody can cancel us any more.
                        tokio::time::sleep(self.options.poll_interval).await;
                    }
                }
            }

            if self.cancelled() {
                return Ok(Wait::Cancelled);
            }
        }
    }
}
