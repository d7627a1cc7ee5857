//! Resource provider seam: the declarative read/apply/delete API of the
//! cluster the controller converges.
//!
//! The provider is the only component that mutates live state. Nothing in
//! the manifest source side holds a handle to it.

pub mod memory;
pub mod timed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manifest::{Resource, ResourceRef};

pub use memory::InMemoryProvider;
pub use timed::TimedProvider;

/// One running replica of a workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Replica {
    pub id: String,
    /// Template hash the replica was started from.
    pub template_hash: String,
    pub ready: bool,
    pub started_at: DateTime<Utc>,
}

/// A resource as currently held by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedResource {
    /// Recorded object, including provider-injected fields.
    pub resource: Resource,
    /// Provider-generated identifier.
    pub uid: String,
    /// Bumped on every write; used for optimistic concurrency.
    pub resource_version: u64,
    pub created_at: DateTime<Utc>,
    /// Live replicas (workloads only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replicas: Vec<Replica>,
}

impl ObservedResource {
    pub fn reference(&self) -> ResourceRef {
        self.resource.reference()
    }

    pub fn ready_replicas(&self) -> usize {
        self.replicas.iter().filter(|r| r.ready).count()
    }
}

/// Errors returned by a resource provider.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Provider call '{operation}' timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    #[error("Provider rejected {reference}: {reason}")]
    Rejected {
        reference: ResourceRef,
        reason: String,
    },

    #[error("Conflicting write to {reference}: expected version {expected}, found {actual}")]
    Conflict {
        reference: ResourceRef,
        expected: u64,
        actual: u64,
    },

    #[error("Resource not found: {0}")]
    NotFound(ResourceRef),
}

impl ProviderError {
    /// Transport-level failures, retried on the next cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Unavailable(_) | ProviderError::Timeout { .. }
        )
    }
}

/// Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Declarative access to live cluster state.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Reads one resource; a missing resource is `Ok(None)`, never an error.
    async fn get(&self, reference: &ResourceRef) -> Result<Option<ObservedResource>>;

    /// Lists resources labeled as owned by `application`, restricted to
    /// `namespace` when one is given and cluster-wide otherwise.
    async fn list_owned(
        &self,
        namespace: Option<&str>,
        application: &str,
    ) -> Result<Vec<ObservedResource>>;

    /// Creates a resource. Workloads start with zero replicas.
    async fn create(&self, resource: &Resource) -> Result<ObservedResource>;

    /// Replaces the recorded object if its version still equals `expected_version`.
    async fn update(&self, resource: &Resource, expected_version: u64)
        -> Result<ObservedResource>;

    /// Deletes a resource and, for workloads, all of its replicas.
    async fn delete(&self, reference: &ResourceRef) -> Result<()>;

    /// Starts one replica of a workload from the recorded template.
    async fn start_replica(&self, reference: &ResourceRef, template_hash: &str)
        -> Result<Replica>;

    /// Readiness probe for one replica.
    async fn replica_ready(&self, reference: &ResourceRef, replica_id: &str) -> Result<bool>;

    /// Stops one replica.
    async fn stop_replica(&self, reference: &ResourceRef, replica_id: &str) -> Result<()>;
}
