//! Diff engine: structured drift between desired and observed state.
//!
//! Only fields the desired resource declares are compared, so provider
//! defaults and generated identifiers on the observed side never show up as
//! drift. The output is sorted and fully deterministic.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::live::LiveState;
use crate::manifest::{template_hash, ManifestSet, Resource, ResourceRef};
use crate::provider::ObservedResource;

/// Paths the provider manages; never compared.
pub const PROVIDER_MANAGED_FIELDS: &[&str] = &[
    "metadata.uid",
    "metadata.resourceVersion",
    "metadata.creationTimestamp",
    "status",
];

/// Synthetic path reporting replicas started from another template.
pub const TEMPLATE_PATH: &str = "template";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DriftKind {
    /// Declared but not present.
    Missing,
    /// Present and owned but no longer declared.
    Extra,
    /// Present with at least one declared field differing.
    Modified,
}

impl std::fmt::Display for DriftKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriftKind::Missing => write!(f, "Missing"),
            DriftKind::Extra => write!(f, "Extra"),
            DriftKind::Modified => write!(f, "Modified"),
        }
    }
}

/// One differing field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDelta {
    /// Dotted path, e.g. `spec.replicas` or `spec.ports[0]`.
    pub path: String,
    pub desired: Option<Value>,
    pub observed: Option<Value>,
}

impl std::fmt::Display for FieldDelta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |v: &Option<Value>| match v {
            Some(v) => v.to_string(),
            None => "<unset>".to_string(),
        };
        write!(f, "{}: {} -> {}", self.path, show(&self.observed), show(&self.desired))
    }
}

/// Drift for one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Drift {
    pub reference: ResourceRef,
    pub kind: DriftKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deltas: Vec<FieldDelta>,
}

impl Drift {
    pub fn missing(reference: ResourceRef) -> Self {
        Self {
            reference,
            kind: DriftKind::Missing,
            deltas: Vec::new(),
        }
    }

    pub fn extra(reference: ResourceRef) -> Self {
        Self {
            reference,
            kind: DriftKind::Extra,
            deltas: Vec::new(),
        }
    }

    /// Looks up the delta for `path`.
    pub fn delta(&self, path: &str) -> Option<&FieldDelta> {
        self.deltas.iter().find(|d| d.path == path)
    }
}

impl std::fmt::Display for Drift {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind, self.reference)?;
        for delta in &self.deltas {
            write!(f, "; {}", delta)?;
        }
        Ok(())
    }
}

/// Diff knobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffOptions {
    /// Extra dotted paths never compared, on top of [`PROVIDER_MANAGED_FIELDS`].
    pub ignore_fields: Vec<String>,
}

/// Compares desired against observed state.
#[derive(Debug, Clone)]
pub struct DiffEngine {
    ignored: BTreeSet<String>,
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self::new(&DiffOptions::default())
    }
}

impl DiffEngine {
    pub fn new(options: &DiffOptions) -> Self {
        let ignored = PROVIDER_MANAGED_FIELDS
            .iter()
            .map(|s| s.to_string())
            .chain(options.ignore_fields.iter().cloned())
            .collect();
        Self { ignored }
    }

    /// Computes the sorted drift sequence for one application.
    pub fn compare(&self, desired: &ManifestSet, live: &LiveState, application: &str) -> Vec<Drift> {
        let mut drifts = Vec::new();

        for resource in desired.resources() {
            let reference = resource.reference();
            match live.get(&reference) {
                None => drifts.push(Drift::missing(reference)),
                Some(observed) => {
                    let deltas = self.diff_resource(resource, observed);
                    if !deltas.is_empty() {
                        drifts.push(Drift {
                            reference,
                            kind: DriftKind::Modified,
                            deltas,
                        });
                    }
                }
            }
        }

        for observed in live.present() {
            let reference = observed.reference();
            if desired.get(&reference).is_none() && observed.resource.owner() == Some(application) {
                drifts.push(Drift::extra(reference));
            }
        }

        drifts.sort_by(|a, b| a.reference.cmp(&b.reference));
        drifts
    }

    /// Field deltas between one declared resource and its observed object.
    pub fn diff_resource(&self, desired: &Resource, observed: &ObservedResource) -> Vec<FieldDelta> {
        let mut deltas = Vec::new();

        let metadata = &observed.resource.metadata;
        for (key, value) in &desired.metadata.labels {
            self.compare_scalar(
                &format!("metadata.labels.{}", key),
                Value::from(value.as_str()),
                metadata.labels.get(key).map(|v| Value::from(v.as_str())),
                &mut deltas,
            );
        }
        for (key, value) in &desired.metadata.annotations {
            self.compare_scalar(
                &format!("metadata.annotations.{}", key),
                Value::from(value.as_str()),
                metadata.annotations.get(key).map(|v| Value::from(v.as_str())),
                &mut deltas,
            );
        }

        let mut observed_spec = observed.resource.spec.clone();
        if desired.kind.is_workload() {
            // The live replica set is what counts, not the recorded number.
            if let Value::Object(map) = &mut observed_spec {
                map.insert("replicas".to_string(), Value::from(observed.replicas.len()));
            }
        }
        self.compare_value("spec", &desired.spec, Some(&observed_spec), &mut deltas);

        if desired.kind.is_workload() && !self.is_ignored(TEMPLATE_PATH) {
            let target = template_hash(&self.template_spec(&desired.spec, &observed.resource.spec));
            let stale: BTreeSet<&str> = observed
                .replicas
                .iter()
                .map(|r| r.template_hash.as_str())
                .filter(|h| *h != target)
                .collect();
            if !stale.is_empty() {
                deltas.push(FieldDelta {
                    path: TEMPLATE_PATH.to_string(),
                    desired: Some(Value::from(target)),
                    observed: Some(Value::from(stale.into_iter().collect::<Vec<_>>().join(","))),
                });
            }
        }

        deltas.sort_by(|a, b| a.path.cmp(&b.path));
        deltas
    }

    /// The desired spec with every ignored `spec.` path taken from the live
    /// object, so ignored fields never produce a template delta.
    fn template_spec(&self, desired: &Value, live: &Value) -> Value {
        let mut template = desired.clone();
        for path in &self.ignored {
            let Some(rest) = path.strip_prefix("spec.") else {
                continue;
            };
            let segments: Vec<&str> = rest.split('.').collect();
            let live_value = segments.iter().try_fold(live, |value, segment| value.get(*segment));
            overwrite_path(&mut template, &segments, live_value.cloned());
        }
        template
    }

    fn is_ignored(&self, path: &str) -> bool {
        self.ignored.iter().any(|ignored| {
            path == ignored
                || path
                    .strip_prefix(ignored.as_str())
                    .map(|rest| rest.starts_with('.') || rest.starts_with('['))
                    .unwrap_or(false)
        })
    }

    fn compare_value(&self, path: &str, desired: &Value, observed: Option<&Value>, out: &mut Vec<FieldDelta>) {
        if self.is_ignored(path) {
            return;
        }
        match desired {
            Value::Null => {}
            Value::Object(fields) => self.compare_object(path, fields, observed, out),
            Value::Array(items) => match observed {
                Some(Value::Array(live)) if live.len() == items.len() => {
                    for (idx, (d, o)) in items.iter().zip(live).enumerate() {
                        self.compare_value(&format!("{}[{}]", path, idx), d, Some(o), out);
                    }
                }
                _ => out.push(FieldDelta {
                    path: path.to_string(),
                    desired: Some(desired.clone()),
                    observed: observed.cloned(),
                }),
            },
            scalar => self.compare_scalar(path, scalar.clone(), observed.cloned(), out),
        }
    }

    fn compare_object(
        &self,
        path: &str,
        fields: &Map<String, Value>,
        observed: Option<&Value>,
        out: &mut Vec<FieldDelta>,
    ) {
        let live = match observed {
            Some(Value::Object(live)) => Some(live),
            Some(Value::Null) | None => None,
            Some(other) => {
                // Type changed under us; report the whole subtree.
                if !fields.is_empty() {
                    out.push(FieldDelta {
                        path: path.to_string(),
                        desired: Some(Value::Object(fields.clone())),
                        observed: Some(other.clone()),
                    });
                }
                return;
            }
        };
        for (key, value) in fields {
            let child = format!("{}.{}", path, key);
            self.compare_value(&child, value, live.and_then(|l| l.get(key)), out);
        }
    }

    fn compare_scalar(&self, path: &str, desired: Value, observed: Option<Value>, out: &mut Vec<FieldDelta>) {
        if self.is_ignored(path) {
            return;
        }
        let equal = match &observed {
            Some(o) => scalars_equal(&desired, o),
            None => false,
        };
        if !equal {
            out.push(FieldDelta {
                path: path.to_string(),
                desired: Some(desired),
                observed,
            });
        }
    }
}

fn overwrite_path(value: &mut Value, segments: &[&str], replacement: Option<Value>) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut cursor = value;
    for segment in parents {
        match cursor.get_mut(*segment) {
            Some(next) => cursor = next,
            None => return,
        }
    }
    if let Value::Object(map) = cursor {
        match replacement {
            Some(live) => {
                map.insert(last.to_string(), live);
            }
            None => {
                map.remove(*last);
            }
        }
    }
}

/// Numbers compare by value so `2` and `2.0` are equal.
fn scalars_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ResourceKind, Revision};
    use crate::provider::Replica;
    use chrono::Utc;
    use serde_json::json;

    fn observed(resource: Resource, replicas: Vec<Replica>) -> ObservedResource {
        ObservedResource {
            resource,
            uid: "uid-1".to_string(),
            resource_version: 7,
            created_at: Utc::now(),
            replicas,
        }
    }

    fn replicas(hash: &str, count: usize) -> Vec<Replica> {
        (0..count)
            .map(|i| Replica {
                id: format!("r{}", i),
                template_hash: hash.to_string(),
                ready: true,
                started_at: Utc::now(),
            })
            .collect()
    }

    fn web(replicas: u32, image: &str) -> Resource {
        Resource::new(
            ResourceKind::Workload,
            "shop",
            "web",
            json!({"replicas": replicas, "image": image, "ports": [8080]}),
        )
    }

    #[test]
    fn test_provider_injected_fields_are_not_drift() {
        let desired = web(2, "web:1");
        let mut live = desired.owned_by("shop");
        live.spec["revisionHistoryLimit"] = json!(10);
        live.spec["strategy"] = json!("RollingUpdate");
        let hash = template_hash(&desired.spec);

        let engine = DiffEngine::default();
        assert!(engine
            .diff_resource(&desired, &observed(live, replicas(&hash, 2)))
            .is_empty());
    }

    #[test]
    fn test_over_scale_reports_replica_delta() {
        let desired = web(2, "web:1");
        let hash = template_hash(&desired.spec);
        let deltas = DiffEngine::default().diff_resource(&desired, &observed(web(6, "web:1"), replicas(&hash, 6)));
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].path, "spec.replicas");
        assert_eq!(deltas[0].observed, Some(json!(6)));
        assert_eq!(deltas[0].desired, Some(json!(2)));
    }

    #[test]
    fn test_image_change_reports_image_and_template() {
        let desired = web(2, "web:2");
        let old = web(2, "web:1");
        let old_hash = template_hash(&old.spec);
        let deltas = DiffEngine::default().diff_resource(&desired, &observed(old, replicas(&old_hash, 2)));
        let paths: Vec<&str> = deltas.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["spec.image", "template"]);
    }

    #[test]
    fn test_array_length_change_is_wholesale() {
        let mut desired = web(1, "web:1");
        desired.spec["ports"] = json!([8080, 9090]);
        let live = web(1, "web:1");
        let hash = template_hash(&live.spec);
        let deltas = DiffEngine::default().diff_resource(&desired, &observed(live, replicas(&hash, 1)));
        assert!(deltas.iter().any(|d| d.path == "spec.ports"));
    }

    #[test]
    fn test_ignore_fields() {
        let desired = web(2, "web:1");
        let hash = template_hash(&desired.spec);
        let engine = DiffEngine::new(&DiffOptions {
            ignore_fields: vec!["spec.replicas".to_string()],
        });
        assert!(engine
            .diff_resource(&desired, &observed(web(5, "web:1"), replicas(&hash, 5)))
            .is_empty());
    }

    #[test]
    fn test_ignored_image_does_not_change_the_template() {
        let desired = web(2, "web:2");
        let live = web(2, "web:1");
        let live_hash = template_hash(&live.spec);
        let engine = DiffEngine::new(&DiffOptions {
            ignore_fields: vec!["spec.image".to_string()],
        });
        assert!(engine
            .diff_resource(&desired, &observed(live.clone(), replicas(&live_hash, 2)))
            .is_empty());

        // Other template fields still count.
        let mut with_port = web(2, "web:2");
        with_port.spec["ports"] = json!([9090]);
        let paths: Vec<String> = engine
            .diff_resource(&with_port, &observed(live, replicas(&live_hash, 2)))
            .into_iter()
            .map(|d| d.path)
            .collect();
        assert_eq!(paths, vec!["spec.ports[0]".to_string(), TEMPLATE_PATH.to_string()]);
    }

    #[test]
    fn test_label_drift() {
        let mut desired = Resource::new(ResourceKind::ConfigMap, "shop", "cfg", json!({"data": {"a": "b"}}));
        desired.metadata.labels.insert("tier".into(), "backend".into());
        let live = Resource::new(ResourceKind::ConfigMap, "shop", "cfg", json!({"data": {"a": "b"}}));
        let deltas = DiffEngine::default().diff_resource(&desired, &observed(live, vec![]));
        assert_eq!(deltas[0].path, "metadata.labels.tier");
        assert_eq!(deltas[0].observed, None);
    }

    #[test]
    fn test_compare_sorted_and_deterministic() {
        let cfg = Resource::new(ResourceKind::ConfigMap, "shop", "cfg", json!({"data": {"a": "b"}}));
        let extra = Resource::new(ResourceKind::Endpoint, "shop", "old", json!({"port": 80})).owned_by("shop");
        let unowned = Resource::new(ResourceKind::Endpoint, "shop", "foreign", json!({"port": 80}));
        let desired = ManifestSet::new(Revision::new("r1"), vec![web(2, "web:1"), cfg]);
        let live = LiveState::from_observed(vec![observed(extra, vec![]), observed(unowned, vec![])]);

        let engine = DiffEngine::default();
        let first = engine.compare(&desired, &live, "shop");
        let second = engine.compare(&desired, &live, "shop");
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        let summary: Vec<(ResourceKind, DriftKind)> = first.iter().map(|d| (d.reference.kind, d.kind)).collect();
        assert_eq!(
            summary,
            vec![
                (ResourceKind::ConfigMap, DriftKind::Missing),
                (ResourceKind::Endpoint, DriftKind::Extra),
                (ResourceKind::Workload, DriftKind::Missing),
            ]
        );
    }

    #[test]
    fn test_converged_state_has_no_drift() {
        let desired = ManifestSet::new(Revision::new("r1"), vec![web(3, "web:1")]);
        let hash = template_hash(&desired.resources()[0].spec);
        let live = LiveState::from_observed(vec![observed(
            desired.resources()[0].owned_by("shop"),
            replicas(&hash, 3),
        )]);
        assert!(DiffEngine::default().compare(&desired, &live, "shop").is_empty());
    }
}
