//! Live state reader: observed state for the resources an application
//! declares, plus anything else it owns.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;

use crate::manifest::{ManifestSet, ResourceRef};
use crate::provider::{self, ObservedResource, ResourceProvider};

/// What the provider holds for one reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum Observation {
    Present(Box<ObservedResource>),
    Absent,
}

impl Observation {
    pub fn present(&self) -> Option<&ObservedResource> {
        match self {
            Observation::Present(observed) => Some(observed),
            Observation::Absent => None,
        }
    }
}

/// Where an application's resources live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub application: String,
    /// Destination namespace for declarations that name none.
    pub namespace: String,
}

impl Scope {
    pub fn new(application: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            namespace: namespace.into(),
        }
    }
}

/// Observed state keyed by reference, sorted.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LiveState {
    observations: BTreeMap<ResourceRef, Observation>,
}

impl LiveState {
    pub fn from_observed(observed: impl IntoIterator<Item = ObservedResource>) -> Self {
        let mut state = Self::default();
        for object in observed {
            state.insert_present(object);
        }
        state
    }

    pub fn insert_present(&mut self, observed: ObservedResource) {
        self.observations
            .insert(observed.reference(), Observation::Present(Box::new(observed)));
    }

    pub fn insert_absent(&mut self, reference: ResourceRef) {
        self.observations.insert(reference, Observation::Absent);
    }

    pub fn observation(&self, reference: &ResourceRef) -> Option<&Observation> {
        self.observations.get(reference)
    }

    /// The observed object, or `None` when absent or never looked up.
    pub fn get(&self, reference: &ResourceRef) -> Option<&ObservedResource> {
        self.observations.get(reference).and_then(Observation::present)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceRef, &Observation)> {
        self.observations.iter()
    }

    /// Objects that are present, in reference order.
    pub fn present(&self) -> impl Iterator<Item = &ObservedResource> {
        self.observations.values().filter_map(Observation::present)
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }
}

/// Reads observed state through a resource provider.
#[derive(Clone)]
pub struct LiveStateReader {
    provider: Arc<dyn ResourceProvider>,
}

impl LiveStateReader {
    pub fn new(provider: Arc<dyn ResourceProvider>) -> Self {
        Self { provider }
    }

    /// Looks up every declared reference concurrently, then lists owned
    /// resources in every namespace, including ones the current revision
    /// no longer declares anything in.
    ///
    /// A reference the provider does not hold is `Absent`; only transport
    /// failures are errors.
    pub async fn observe(&self, scope: &Scope, desired: &ManifestSet) -> provider::Result<LiveState> {
        let references = desired.references();
        let lookups = references.iter().map(|r| self.provider.get(r));
        let results = join_all(lookups).await;

        let mut state = LiveState::default();
        for (reference, result) in references.iter().zip(results) {
            match result? {
                Some(observed) => state.insert_present(observed),
                None => state.insert_absent(reference.clone()),
            }
        }

        for observed in self.provider.list_owned(None, &scope.application).await? {
            let reference = observed.reference();
            if state.observation(&reference).is_none() {
                state.insert_present(observed);
            }
        }

        log::debug!(
            "Observed {} resources for {} ({} declared)",
            state.len(),
            scope.application,
            references.len()
        );
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Resource, ResourceKind, Revision};
    use crate::provider::InMemoryProvider;
    use serde_json::json;

    fn cfg(name: &str, namespace: &str) -> Resource {
        Resource::new(ResourceKind::ConfigMap, namespace, name, json!({"data": {"a": "b"}}))
    }

    #[tokio::test]
    async fn test_observe_reports_absent_and_extras() {
        let memory = Arc::new(InMemoryProvider::new());
        memory.seed(&cfg("present", "shop"), "shop");
        memory.seed(&cfg("leftover", "shop"), "shop");
        memory.seed(&cfg("foreign", "shop"), "other-app");

        let desired = ManifestSet::new(
            Revision::new("r1"),
            vec![cfg("present", "shop"), cfg("missing", "shop")],
        );
        let reader = LiveStateReader::new(memory);
        let live = reader.observe(&Scope::new("shop", "shop"), &desired).await.unwrap();

        let missing = ResourceRef::new(ResourceKind::ConfigMap, "shop", "missing");
        assert_eq!(live.observation(&missing), Some(&Observation::Absent));
        assert!(live
            .get(&ResourceRef::new(ResourceKind::ConfigMap, "shop", "leftover"))
            .is_some());
        assert!(live
            .observation(&ResourceRef::new(ResourceKind::ConfigMap, "shop", "foreign"))
            .is_none());
        assert_eq!(live.len(), 3);
    }

    #[tokio::test]
    async fn test_observe_lists_owned_resources_in_undeclared_namespaces() {
        let memory = Arc::new(InMemoryProvider::new());
        memory.seed(&cfg("ledger", "billing"), "shop");

        let desired = ManifestSet::new(Revision::new("r2"), vec![cfg("present", "shop")]);
        let reader = LiveStateReader::new(memory);
        let live = reader.observe(&Scope::new("shop", "shop"), &desired).await.unwrap();

        assert!(live
            .get(&ResourceRef::new(ResourceKind::ConfigMap, "billing", "ledger"))
            .is_some());
    }

    #[tokio::test]
    async fn test_observe_fails_only_on_transport_errors() {
        let memory = Arc::new(InMemoryProvider::new());
        memory.set_unavailable(true);
        let desired = ManifestSet::new(Revision::new("r1"), vec![cfg("a", "shop")]);
        let reader = LiveStateReader::new(memory);
        let err = reader
            .observe(&Scope::new("shop", "shop"), &desired)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
