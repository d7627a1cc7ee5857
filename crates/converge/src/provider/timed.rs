//! Per-call timeout decorator for resource providers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{ObservedResource, ProviderError, Replica, ResourceProvider, Result};
use crate::manifest::{Resource, ResourceRef};

/// Wraps a provider so every call is bounded by `timeout`.
///
/// An elapsed call surfaces as [`ProviderError::Timeout`], which the loop
/// treats like any other unavailability of the provider.
#[derive(Clone)]
pub struct TimedProvider {
    inner: Arc<dyn ResourceProvider>,
    timeout: Duration,
}

impl TimedProvider {
    pub fn new(inner: Arc<dyn ResourceProvider>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        call: impl Future<Output = Result<T>> + Send,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!(
                    "Provider call '{}' exceeded {}ms",
                    operation,
                    self.timeout.as_millis()
                );
                Err(ProviderError::Timeout {
                    operation: operation.to_string(),
                    millis: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

#[async_trait]
impl ResourceProvider for TimedProvider {
    async fn get(&self, reference: &ResourceRef) -> Result<Option<ObservedResource>> {
        self.bounded("get", self.inner.get(reference)).await
    }

    async fn list_owned(
        &self,
        namespace: Option<&str>,
        application: &str,
    ) -> Result<Vec<ObservedResource>> {
        self.bounded("list_owned", self.inner.list_owned(namespace, application))
            .await
    }

    async fn create(&self, resource: &Resource) -> Result<ObservedResource> {
        self.bounded("create", self.inner.create(resource)).await
    }

    async fn update(&self, resource: &Resource, expected_version: u64) -> Result<ObservedResource> {
        self.bounded("update", self.inner.update(resource, expected_version))
            .await
    }

    async fn delete(&self, reference: &ResourceRef) -> Result<()> {
        self.bounded("delete", self.inner.delete(reference)).await
    }

    async fn start_replica(&self, reference: &ResourceRef, template_hash: &str) -> Result<Replica> {
        self.bounded(
            "start_replica",
            self.inner.start_replica(reference, template_hash),
        )
        .await
    }

    async fn replica_ready(&self, reference: &ResourceRef, replica_id: &str) -> Result<bool> {
        self.bounded(
            "replica_ready",
            self.inner.replica_ready(reference, replica_id),
        )
        .await
    }

    async fn stop_replica(&self, reference: &ResourceRef, replica_id: &str) -> Result<()> {
        self.bounded("stop_replica", self.inner.stop_replica(reference, replica_id))
            .await
    }
}
