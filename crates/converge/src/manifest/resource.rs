//! K8s-style resource types for declared and observed state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// The API version every manifest document must declare.
pub const API_VERSION: &str = "converge.dev/v1";

/// Label stamped on every resource the controller creates or updates.
pub const OWNER_LABEL: &str = "converge.dev/application";

/// The kind of resource.
///
/// Variants are declared in name order so the derived `Ord` matches the
/// textual ordering used for drift output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    ConfigMap,
    Endpoint,
    Workload,
}

impl ResourceKind {
    /// Returns all resource kinds.
    pub fn all() -> &'static [ResourceKind] {
        &[
            ResourceKind::ConfigMap,
            ResourceKind::Endpoint,
            ResourceKind::Workload,
        ]
    }

    /// Whether updates to this kind go through the rollout strategy.
    pub fn is_workload(&self) -> bool {
        matches!(self, ResourceKind::Workload)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::ConfigMap => write!(f, "ConfigMap"),
            ResourceKind::Endpoint => write!(f, "Endpoint"),
            ResourceKind::Workload => write!(f, "Workload"),
        }
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "configmap" => Ok(ResourceKind::ConfigMap),
            "endpoint" => Ok(ResourceKind::Endpoint),
            "workload" => Ok(ResourceKind::Workload),
            _ => Err(format!("Unknown resource kind: {}", s)),
        }
    }
}

/// Identity of a resource: (kind, namespace, name).
///
/// Field order matters: the derived `Ord` is the drift sort order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

impl std::str::FromStr for ResourceRef {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(kind), Some(namespace), Some(name)) if !namespace.is_empty() && !name.is_empty() => {
                Ok(ResourceRef::new(kind.parse()?, namespace, name))
            }
            _ => Err(format!("Invalid resource reference: {}", s)),
        }
    }
}

/// Metadata for a resource, following K8s conventions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// The unique name of the resource within its kind and namespace.
    pub name: String,

    /// Target namespace. Filled from the application destination when omitted.
    #[serde(default)]
    pub namespace: String,

    /// Key-value labels for organizing and selecting resources.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Key-value annotations for storing additional metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    /// Creates a new ObjectMeta with a name and namespace.
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
        }
    }

    /// Adds a label to the metadata.
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// A declared (or recorded) resource.
///
/// The spec is kept as structured JSON so the diff engine can walk declared
/// fields generically; [`Resource::validate_spec`] checks it against the
/// typed spec for its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// API version, always `converge.dev/v1`.
    pub api_version: String,

    /// The kind of resource.
    pub kind: ResourceKind,

    /// Resource metadata.
    pub metadata: ObjectMeta,

    /// The resource specification.
    #[serde(default)]
    pub spec: Value,
}

impl Resource {
    /// Creates a new resource with the given kind, identity and spec.
    pub fn new(
        kind: ResourceKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: Value,
    ) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind,
            metadata: ObjectMeta::new(name, namespace),
            spec,
        }
    }

    /// Returns the name of the resource.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Returns the identity of this resource.
    pub fn reference(&self) -> ResourceRef {
        ResourceRef::new(self.kind, &self.metadata.namespace, &self.metadata.name)
    }

    /// Returns the owning application, if the owner label is present.
    pub fn owner(&self) -> Option<&str> {
        self.metadata.labels.get(OWNER_LABEL).map(String::as_str)
    }

    /// Returns a copy carrying the owner label for `application`.
    pub fn owned_by(&self, application: &str) -> Self {
        let mut owned = self.clone();
        owned
            .metadata
            .labels
            .insert(OWNER_LABEL.to_string(), application.to_string());
        owned
    }

    /// Checks the spec against the typed schema for this kind.
    pub fn validate_spec(&self) -> Result<(), String> {
        let result = match self.kind {
            ResourceKind::Workload => {
                serde_json::from_value::<WorkloadSpec>(self.spec.clone()).map(|spec| {
                    if spec.image.trim().is_empty() {
                        Err("spec.image must not be empty".to_string())
                    } else {
                        Ok(())
                    }
                })
            }
            ResourceKind::Endpoint => {
                serde_json::from_value::<EndpointSpec>(self.spec.clone()).map(|_| Ok(()))
            }
            ResourceKind::ConfigMap => {
                serde_json::from_value::<ConfigMapSpec>(self.spec.clone()).map(|_| Ok(()))
            }
        };
        result.map_err(|e| format!("invalid {} spec: {}", self.kind, e))?
    }

    /// Parses the spec as a workload spec.
    pub fn workload_spec(&self) -> Option<WorkloadSpec> {
        if !self.kind.is_workload() {
            return None;
        }
        serde_json::from_value(self.spec.clone()).ok()
    }

    /// Stable fingerprint of the declared content (metadata + spec).
    ///
    /// Used to recognize an unchanged declaration across revisions.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::json!({
            "kind": self.kind,
            "metadata": self.metadata,
            "spec": self.spec,
        });
        blake3::hash(canonical.to_string().as_bytes())
            .to_hex()
            .to_string()
    }
}

/// Hash of a workload's pod template: the spec without `replicas`.
///
/// Replicas started from the same template share this hash; it is the
/// "revision" replicas are counted by during a rollout.
pub fn template_hash(spec: &Value) -> String {
    let mut template = spec.clone();
    if let Value::Object(map) = &mut template {
        map.remove("replicas");
    }
    let hex = blake3::hash(template.to_string().as_bytes()).to_hex();
    hex.as_str()[..16].to_string()
}

/// Workload specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Desired number of replicas.
    pub replicas: u32,

    /// Container image reference.
    pub image: String,

    /// Environment variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Exposed container ports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
}

/// Network endpoint specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSpec {
    /// Port the endpoint listens on.
    pub port: u16,

    /// Port on the selected workloads, defaults to `port`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,

    /// Label selector for backing workloads.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,

    /// Transport protocol.
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "TCP".to_string()
}

/// Plain key-value configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigMapSpec {
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// An opaque, immutable identifier for one snapshot of the manifest source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines: the first twelve characters.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((end, _)) => &self.0[..end],
            None => &self.0,
        }
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The desired-state manifest set at one revision.
///
/// Immutable once read; resources are sorted by reference and unique.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestSet {
    revision: Revision,
    resources: Vec<Resource>,
}

impl ManifestSet {
    /// Builds a set, sorting resources by reference.
    ///
    /// Callers are expected to have rejected duplicate references already.
    pub fn new(revision: Revision, mut resources: Vec<Resource>) -> Self {
        resources.sort_by_key(|r| r.reference());
        Self {
            revision,
            resources,
        }
    }

    pub fn revision(&self) -> &Revision {
        &self.revision
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn references(&self) -> Vec<ResourceRef> {
        self.resources.iter().map(Resource::reference).collect()
    }

    pub fn get(&self, reference: &ResourceRef) -> Option<&Resource> {
        self.resources
            .binary_search_by(|r| r.reference().cmp(reference))
            .ok()
            .map(|idx| &self.resources[idx])
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
