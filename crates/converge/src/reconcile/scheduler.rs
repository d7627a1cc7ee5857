//! Per-application sync scheduler.
//!
//! Timer ticks, manual syncs, revision notifications and watcher refreshes
//! all end up as a [`CycleRequest`] handed to the same reconcile call.
//! Requests arriving while a cycle runs are coalesced into a single pending
//! slot rather than stacked.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::reconciler::Reconciler;
use crate::manifest::Revision;

/// Why a cycle was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerReason {
    Timer,
    Manual,
    RevisionNotified,
    SourceChanged,
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerReason::Timer => write!(f, "timer"),
            TriggerReason::Manual => write!(f, "manual"),
            TriggerReason::RevisionNotified => write!(f, "revision"),
            TriggerReason::SourceChanged => write!(f, "source-change"),
        }
    }
}

/// One request for a reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleRequest {
    pub reason: TriggerReason,
    /// Manual syncs apply even with auto-sync off and clear recorded rejections.
    pub manual: bool,
    /// Compute the plan only; never mutate the cluster or persisted status.
    pub dry_run: bool,
    /// A dry run asked for the plan. Set even when the dry run was merged
    /// into a real cycle, which then publishes its plan before applying.
    pub plan_requested: bool,
    /// Revision announced by a producer, if any.
    pub revision: Option<Revision>,
}

impl CycleRequest {
    pub fn timer() -> Self {
        Self {
            reason: TriggerReason::Timer,
            manual: false,
            dry_run: false,
            plan_requested: false,
            revision: None,
        }
    }

    pub fn manual(dry_run: bool) -> Self {
        Self {
            reason: TriggerReason::Manual,
            manual: true,
            dry_run,
            plan_requested: dry_run,
            revision: None,
        }
    }

    pub fn revision(revision: Option<Revision>) -> Self {
        Self {
            reason: TriggerReason::RevisionNotified,
            manual: false,
            dry_run: false,
            plan_requested: false,
            revision,
        }
    }

    pub fn source_changed() -> Self {
        Self {
            reason: TriggerReason::SourceChanged,
            manual: false,
            dry_run: false,
            plan_requested: false,
            revision: None,
        }
    }

    /// Merges two pending requests into one.
    ///
    /// The result is a dry run only if both were; a real manual sync is
    /// never downgraded, and a dry run never turns into a real manual sync.
    pub fn merge(self, other: CycleRequest) -> CycleRequest {
        let dry_run = self.dry_run && other.dry_run;
        let manual = if dry_run {
            true
        } else {
            (self.manual && !self.dry_run) || (other.manual && !other.dry_run)
        };
        let reason = if manual && !dry_run {
            TriggerReason::Manual
        } else if self.dry_run {
            other.reason
        } else {
            self.reason
        };
        CycleRequest {
            reason,
            manual,
            dry_run,
            plan_requested: self.plan_requested || other.plan_requested,
            revision: other.revision.or(self.revision),
        }
    }
}

/// Acknowledgement returned to whoever asked for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerAck {
    /// The request occupies the pending slot.
    Queued,
    /// Merged into an already pending request.
    Coalesced,
}

/// Single-slot coalescing queue.
#[derive(Default)]
pub struct TriggerQueue {
    slot: Mutex<Option<CycleRequest>>,
    notify: Notify,
}

impl TriggerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a request without waiting.
    pub fn push(&self, request: CycleRequest) -> TriggerAck {
        let ack = {
            let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match slot.take() {
                Some(pending) => {
                    *slot = Some(pending.merge(request));
                    TriggerAck::Coalesced
                }
                None => {
                    *slot = Some(request);
                    TriggerAck::Queued
                }
            }
        };
        self.notify.notify_one();
        ack
    }

    /// Takes the pending request, if any.
    pub fn take(&self) -> Option<CycleRequest> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    pub fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Waits for the next request.
    pub async fn next(&self) -> CycleRequest {
        loop {
            if let Some(request) = self.take() {
                return request;
            }
            self.notify.notified().await;
        }
    }
}

/// Runs one application's cycles in a tokio task.
pub struct SyncScheduler {
    reconciler: Arc<Reconciler>,
    queue: Arc<TriggerQueue>,
    interval: Duration,
}

impl SyncScheduler {
    pub fn new(reconciler: Arc<Reconciler>, queue: Arc<TriggerQueue>, interval: Duration) -> Self {
        Self {
            reconciler,
            queue,
            interval,
        }
    }

    /// Starts the loop. The first timer tick fires immediately, so every
    /// application is reconciled once on startup.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let name = self.reconciler.application().name.clone();
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            log::info!(
                "Sync scheduler for {} started (interval {}s)",
                name,
                self.interval.as_secs()
            );

            loop {
                if *shutdown.borrow() {
                    break;
                }

                let request = tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                    request = self.queue.next() => request,
                    _ = ticker.tick() => CycleRequest::timer(),
                };

                // Anything that arrived meanwhile rides along with this cycle.
                let request = match self.queue.take() {
                    Some(pending) => request.merge(pending),
                    None => request,
                };

                log::debug!("Cycle for {} triggered by {}", name, request.reason);
                match self.reconciler.reconcile(&request).await {
                    Ok(outcome) => log::debug!(
                        "Cycle for {} finished: {}",
                        name,
                        outcome.status.summary()
                    ),
                    Err(e) if e.is_transient() => {
                        log::warn!("Cycle for {} failed, retrying next tick: {}", name, e)
                    }
                    Err(e) => log::error!("Cycle for {} failed: {}", name, e),
                }
            }

            log::info!("Sync scheduler for {} stopped", name);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_coalesces() {
        let queue = TriggerQueue::new();
        assert_eq!(queue.push(CycleRequest::timer()), TriggerAck::Queued);
        assert_eq!(queue.push(CycleRequest::manual(false)), TriggerAck::Coalesced);
        assert_eq!(
            queue.push(CycleRequest::revision(Some(Revision::new("abc")))),
            TriggerAck::Coalesced
        );

        let merged = queue.take().unwrap();
        assert!(merged.manual);
        assert!(!merged.dry_run);
        assert_eq!(merged.reason, TriggerReason::Manual);
        assert_eq!(merged.revision, Some(Revision::new("abc")));
        assert!(queue.take().is_none());
    }

    #[test]
    fn test_dry_run_never_becomes_real_manual_sync() {
        let merged = CycleRequest::manual(true).merge(CycleRequest::timer());
        assert!(!merged.dry_run);
        assert!(!merged.manual);
        assert!(merged.plan_requested, "the dry run's plan is still owed");
        assert_eq!(merged.reason, TriggerReason::Timer);

        let later = CycleRequest::revision(None).merge(CycleRequest::manual(true));
        assert!(!later.dry_run && later.plan_requested);
        assert!(!CycleRequest::timer().merge(CycleRequest::manual(false)).plan_requested);

        let both_dry = CycleRequest::manual(true).merge(CycleRequest::manual(true));
        assert!(both_dry.dry_run && both_dry.manual);

        let real = CycleRequest::manual(true).merge(CycleRequest::manual(false));
        assert!(real.manual && !real.dry_run);
    }

    #[test]
    fn test_is_pending_survives_poisoned_lock() {
        let queue = Arc::new(TriggerQueue::new());
        queue.push(CycleRequest::timer());
        let poisoner = Arc::clone(&queue);
        let _ = std::thread::spawn(move || {
            let _slot = poisoner.slot.lock().unwrap();
            panic!("poison the slot");
        })
        .join();

        assert!(queue.slot.is_poisoned());
        assert!(queue.is_pending());
        assert_eq!(queue.push(CycleRequest::manual(false)), TriggerAck::Coalesced);
        assert!(queue.take().unwrap().manual);
    }

    #[tokio::test]
    async fn test_next_wakes_on_push() {
        let queue = Arc::new(TriggerQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.push(CycleRequest::source_changed());
        let request = waiter.await.unwrap();
        assert_eq!(request.reason, TriggerReason::SourceChanged);
        assert!(!queue.is_pending());
    }
}
