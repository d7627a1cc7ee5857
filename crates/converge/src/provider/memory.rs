//! In-process resource provider.
//!
//! A complete, self-contained cluster: objects with uids and versions,
//! workload replicas with readiness, provider-injected defaults and fault
//! injection hooks. It backs the CLI sandbox (optionally persisted to a JSON
//! file) and the test suite.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{ObservedResource, ProviderError, Replica, ResourceProvider, Result};
use crate::manifest::{template_hash, Resource, ResourceKind, ResourceRef};

/// Fault injection knobs.
#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    rejected_images: BTreeSet<String>,
    never_ready_images: BTreeSet<String>,
    conflict_once: BTreeSet<ResourceRef>,
}

/// Serializable cluster contents.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterSnapshot {
    objects: Vec<ObservedResource>,
    next_version: u64,
}

#[derive(Debug, Default)]
struct ClusterState {
    objects: BTreeMap<ResourceRef, ObservedResource>,
    next_version: u64,
    /// Remaining readiness probes before a replica reports ready.
    pending_polls: HashMap<String, u32>,
    /// Ready replica count per workload after every replica change.
    ready_history: BTreeMap<ResourceRef, Vec<usize>>,
    faults: Faults,
}

impl ClusterState {
    fn bump_version(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }

    fn record_ready(&mut self, reference: &ResourceRef) {
        let ready = self
            .objects
            .get(reference)
            .map(|o| o.ready_replicas())
            .unwrap_or(0);
        self.ready_history
            .entry(reference.clone())
            .or_default()
            .push(ready);
    }

    fn image_of(&self, reference: &ResourceRef) -> Option<String> {
        self.objects
            .get(reference)
            .and_then(|o| o.resource.spec.get("image"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// An in-memory cluster implementing [`ResourceProvider`].
pub struct InMemoryProvider {
    state: Mutex<ClusterState>,
    ready_after_polls: Mutex<u32>,
    latency: Mutex<Duration>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryProvider {
    /// Creates an empty cluster where new replicas are ready on first probe.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            ready_after_polls: Mutex::new(0),
            latency: Mutex::new(Duration::ZERO),
        }
    }

    /// Loads a cluster previously written with [`InMemoryProvider::save_to`].
    ///
    /// A missing file yields an empty cluster.
    pub fn load_from(path: &Path) -> std::io::Result<Self> {
        let provider = Self::new();
        if !path.exists() {
            return Ok(provider);
        }
        let content = std::fs::read_to_string(path)?;
        let snapshot: ClusterSnapshot = serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        {
            let mut state = provider.lock();
            state.next_version = snapshot.next_version;
            for object in snapshot.objects {
                state.objects.insert(object.reference(), object);
            }
        }
        Ok(provider)
    }

    /// Writes the cluster contents as JSON.
    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        let snapshot = {
            let state = self.lock();
            ClusterSnapshot {
                objects: state.objects.values().cloned().collect(),
                next_version: state.next_version,
            }
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    fn lock(&self) -> MutexGuard<'_, ClusterState> {
        // A panic while holding the lock leaves plain data behind; keep serving it.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn enter(&self) -> Result<()> {
        let latency = *self
            .latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.lock().faults.unavailable {
            return Err(ProviderError::Unavailable(
                "connection refused (injected)".to_string(),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Fault injection and external mutation
    // ------------------------------------------------------------------

    /// Makes every call fail with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().faults.unavailable = unavailable;
    }

    /// Adds artificial latency to every call.
    pub fn set_latency(&self, latency: Duration) {
        *self
            .latency
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = latency;
    }

    /// Number of readiness probes a new replica needs before it is ready.
    pub fn set_ready_after_polls(&self, polls: u32) {
        *self
            .ready_after_polls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = polls;
    }

    /// Writes declaring this image are rejected as invalid.
    pub fn reject_image(&self, image: impl Into<String>) {
        self.lock().faults.rejected_images.insert(image.into());
    }

    /// Replicas running this image never become ready.
    pub fn never_ready_image(&self, image: impl Into<String>) {
        self.lock().faults.never_ready_images.insert(image.into());
    }

    /// The next update of `reference` observes a concurrent write.
    pub fn conflict_on_next_update(&self, reference: &ResourceRef) {
        self.lock().faults.conflict_once.insert(reference.clone());
    }

    /// Inserts a workload with `ready` running replicas, as if it had been
    /// deployed earlier by `application`.
    pub fn seed(&self, resource: &Resource, application: &str) -> ObservedResource {
        let mut state = self.lock();
        let version = state.bump_version();
        let owned = resource.owned_by(application);
        let replicas = match owned.workload_spec() {
            Some(spec) => {
                let hash = template_hash(&owned.spec);
                (0..spec.replicas).map(|_| new_replica(&hash, true)).collect()
            }
            None => Vec::new(),
        };
        let observed = ObservedResource {
            resource: with_defaults(&owned, state.objects.len()),
            uid: Uuid::new_v4().to_string(),
            resource_version: version,
            created_at: Utc::now(),
            replicas,
        };
        state.objects.insert(observed.reference(), observed.clone());
        state.record_ready(&observed.reference());
        observed
    }

    /// Simulates a manual scale: sets `spec.replicas` and adds or removes
    /// ready replicas of the current template.
    pub fn scale_externally(&self, reference: &ResourceRef, replicas: u32) {
        let mut state = self.lock();
        let version = state.bump_version();
        if let Some(object) = state.objects.get_mut(reference) {
            object.resource.spec["replicas"] = json!(replicas);
            object.resource_version = version;
            let hash = object
                .replicas
                .first()
                .map(|r| r.template_hash.clone())
                .unwrap_or_else(|| template_hash(&object.resource.spec));
            while object.replicas.len() < replicas as usize {
                object.replicas.push(new_replica(&hash, true));
            }
            object.replicas.truncate(replicas as usize);
        }
        state.record_ready(reference);
    }

    /// Marks every starting replica of `reference` ready, except replicas of
    /// never-ready images.
    pub fn finish_startup(&self, reference: &ResourceRef) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let never_ready = state
            .image_of(reference)
            .map(|image| state.faults.never_ready_images.contains(&image))
            .unwrap_or(false);
        if never_ready {
            return;
        }
        if let Some(object) = state.objects.get_mut(reference) {
            for replica in object.replicas.iter_mut().filter(|r| !r.ready) {
                replica.ready = true;
                state.pending_polls.remove(&replica.id);
            }
        }
        state.record_ready(reference);
    }

    /// Simulates an out-of-band edit of the recorded object.
    pub fn edit_externally(&self, reference: &ResourceRef, edit: impl FnOnce(&mut Resource)) {
        let mut state = self.lock();
        let version = state.bump_version();
        if let Some(object) = state.objects.get_mut(reference) {
            edit(&mut object.resource);
            object.resource_version = version;
        }
    }

    /// Simulates a manual deletion.
    pub fn delete_externally(&self, reference: &ResourceRef) {
        let mut state = self.lock();
        state.objects.remove(reference);
        state.record_ready(reference);
    }

    /// Synchronous read for inspection.
    pub fn snapshot(&self, reference: &ResourceRef) -> Option<ObservedResource> {
        self.lock().objects.get(reference).cloned()
    }

    /// All objects currently held.
    pub fn objects(&self) -> Vec<ObservedResource> {
        self.lock().objects.values().cloned().collect()
    }

    /// Ready replica counts recorded after every replica change.
    pub fn ready_history(&self, reference: &ResourceRef) -> Vec<usize> {
        self.lock()
            .ready_history
            .get(reference)
            .cloned()
            .unwrap_or_default()
    }

    fn check_accepted(state: &ClusterState, resource: &Resource) -> Result<()> {
        resource
            .validate_spec()
            .map_err(|reason| ProviderError::Rejected {
                reference: resource.reference(),
                reason,
            })?;
        if let Some(image) = resource.spec.get("image").and_then(Value::as_str) {
            if state.faults.rejected_images.contains(image) {
                return Err(ProviderError::Rejected {
                    reference: resource.reference(),
                    reason: format!("image '{}' failed admission", image),
                });
            }
        }
        Ok(())
    }
}

fn new_replica(template_hash: &str, ready: bool) -> Replica {
    Replica {
        id: Uuid::new_v4().to_string(),
        template_hash: template_hash.to_string(),
        ready,
        started_at: Utc::now(),
    }
}

/// Adds provider-managed defaults the way a real API server would.
fn with_defaults(resource: &Resource, ordinal: usize) -> Resource {
    let mut stored = resource.clone();
    if let Value::Object(spec) = &mut stored.spec {
        match stored.kind {
            ResourceKind::Workload => {
                spec.entry("revisionHistoryLimit").or_insert(json!(10));
                spec.entry("strategy").or_insert(json!("RollingUpdate"));
            }
            ResourceKind::Endpoint => {
                spec.entry("clusterIp")
                    .or_insert(json!(format!("10.96.0.{}", ordinal % 250 + 2)));
                spec.entry("protocol").or_insert(json!("TCP"));
            }
            ResourceKind::ConfigMap => {}
        }
    }
    stored
}

#[async_trait]
impl ResourceProvider for InMemoryProvider {
    async fn get(&self, reference: &ResourceRef) -> Result<Option<ObservedResource>> {
        self.enter().await?;
        Ok(self.lock().objects.get(reference).cloned())
    }

    async fn list_owned(
        &self,
        namespace: Option<&str>,
        application: &str,
    ) -> Result<Vec<ObservedResource>> {
        self.enter().await?;
        Ok(self
            .lock()
            .objects
            .values()
            .filter(|o| namespace.map_or(true, |ns| o.resource.metadata.namespace == ns))
            .filter(|o| o.resource.owner() == Some(application))
            .cloned()
            .collect())
    }

    async fn create(&self, resource: &Resource) -> Result<ObservedResource> {
        self.enter().await?;
        let mut state = self.lock();
        Self::check_accepted(&state, resource)?;
        let reference = resource.reference();
        if let Some(existing) = state.objects.get(&reference) {
            return Err(ProviderError::Conflict {
                reference,
                expected: 0,
                actual: existing.resource_version,
            });
        }
        let version = state.bump_version();
        let observed = ObservedResource {
            resource: with_defaults(resource, state.objects.len()),
            uid: Uuid::new_v4().to_string(),
            resource_version: version,
            created_at: Utc::now(),
            replicas: Vec::new(),
        };
        state.objects.insert(reference, observed.clone());
        Ok(observed)
    }

    async fn update(&self, resource: &Resource, expected_version: u64) -> Result<ObservedResource> {
        self.enter().await?;
        let mut state = self.lock();
        Self::check_accepted(&state, resource)?;
        let reference = resource.reference();

        if state.faults.conflict_once.remove(&reference) {
            let version = state.bump_version();
            if let Some(object) = state.objects.get_mut(&reference) {
                object.resource_version = version;
            }
        }

        let ordinal = state.objects.len();
        let version = state.next_version + 1;
        let object = state
            .objects
            .get_mut(&reference)
            .ok_or_else(|| ProviderError::NotFound(reference.clone()))?;
        if object.resource_version != expected_version {
            return Err(ProviderError::Conflict {
                reference,
                expected: expected_version,
                actual: object.resource_version,
            });
        }
        object.resource = with_defaults(resource, ordinal);
        object.resource_version = version;
        let updated = object.clone();
        state.next_version = version;
        Ok(updated)
    }

    async fn delete(&self, reference: &ResourceRef) -> Result<()> {
        self.enter().await?;
        let mut state = self.lock();
        if state.objects.remove(reference).is_none() {
            return Err(ProviderError::NotFound(reference.clone()));
        }
        if reference.kind.is_workload() {
            state.record_ready(reference);
        }
        Ok(())
    }

    async fn start_replica(&self, reference: &ResourceRef, template_hash: &str) -> Result<Replica> {
        self.enter().await?;
        let polls = *self
            .ready_after_polls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut state = self.lock();
        let image = state.image_of(reference);
        let never_ready = image
            .as_ref()
            .map(|i| state.faults.never_ready_images.contains(i))
            .unwrap_or(false);

        let object = state
            .objects
            .get_mut(reference)
            .ok_or_else(|| ProviderError::NotFound(reference.clone()))?;
        if !reference.kind.is_workload() {
            return Err(ProviderError::Rejected {
                reference: reference.clone(),
                reason: "only workloads run replicas".to_string(),
            });
        }
        let replica = new_replica(template_hash, false);
        object.replicas.push(replica.clone());
        let remaining = if never_ready { u32::MAX } else { polls };
        state.pending_polls.insert(replica.id.clone(), remaining);
        state.record_ready(reference);
        Ok(replica)
    }

    async fn replica_ready(&self, reference: &ResourceRef, replica_id: &str) -> Result<bool> {
        self.enter().await?;
        let mut state = self.lock();
        let remaining = state.pending_polls.get(replica_id).copied().unwrap_or(0);
        let becomes_ready = remaining == 0;
        if !becomes_ready && remaining != u32::MAX {
            state
                .pending_polls
                .insert(replica_id.to_string(), remaining - 1);
        }

        let object = state
            .objects
            .get_mut(reference)
            .ok_or_else(|| ProviderError::NotFound(reference.clone()))?;
        let replica = object
            .replicas
            .iter_mut()
            .find(|r| r.id == replica_id)
            .ok_or_else(|| ProviderError::NotFound(reference.clone()))?;
        if replica.ready {
            return Ok(true);
        }
        replica.ready = becomes_ready;
        if becomes_ready {
            state.pending_polls.remove(replica_id);
            state.record_ready(reference);
        }
        Ok(becomes_ready)
    }

    async fn stop_replica(&self, reference: &ResourceRef, replica_id: &str) -> Result<()> {
        self.enter().await?;
        let mut state = self.lock();
        let object = state
            .objects
            .get_mut(reference)
            .ok_or_else(|| ProviderError::NotFound(reference.clone()))?;
        let before = object.replicas.len();
        object.replicas.retain(|r| r.id != replica_id);
        if object.replicas.len() == before {
            return Err(ProviderError::NotFound(reference.clone()));
        }
        state.pending_polls.remove(replica_id);
        state.record_ready(reference);
        Ok(())
    }
}
