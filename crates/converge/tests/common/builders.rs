//! Builders for manifest YAML and controller configs.
//!
//! Manifests are produced as YAML text so tests go through the same parser
//! a real manifest directory does.

#![allow(dead_code)]

use converge::{ResourceKind, ResourceRef};

use super::harness::NAMESPACE;

/// Builder for a workload manifest.
pub struct WorkloadBuilder {
    name: String,
    image: String,
    replicas: u32,
    env: Vec<(String, String)>,
    labels: Vec<(String, String)>,
}

impl WorkloadBuilder {
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            replicas: 1,
            env: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }

    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    pub fn build(self) -> String {
        let mut yaml = format!(
            "apiVersion: converge.dev/v1\nkind: Workload\nmetadata:\n  name: {}\n",
            self.name
        );
        if !self.labels.is_empty() {
            yaml.push_str("  labels:\n");
            for (key, value) in &self.labels {
                yaml.push_str(&format!("    {}: {}\n", key, value));
            }
        }
        yaml.push_str(&format!(
            "spec:\n  replicas: {}\n  image: {}\n",
            self.replicas, self.image
        ));
        if !self.env.is_empty() {
            yaml.push_str("  env:\n");
            for (key, value) in &self.env {
                yaml.push_str(&format!("    {}: \"{}\"\n", key, value));
            }
        }
        yaml
    }
}

/// A config map manifest.
pub fn config_map(name: &str, data: &[(&str, &str)]) -> String {
    let mut yaml = format!(
        "apiVersion: converge.dev/v1\nkind: ConfigMap\nmetadata:\n  name: {}\nspec:\n  data:\n",
        name
    );
    for (key, value) in data {
        yaml.push_str(&format!("    {}: \"{}\"\n", key, value));
    }
    yaml
}

/// An endpoint manifest selecting `app=<selector>`.
pub fn endpoint(name: &str, port: u16, selector: &str) -> String {
    format!(
        "apiVersion: converge.dev/v1\nkind: Endpoint\nmetadata:\n  name: {}\nspec:\n  port: {}\n  selector:\n    app: {}\n",
        name, port, selector
    )
}

/// Joins manifests into one multi-document file.
pub fn documents(docs: &[String]) -> String {
    docs.join("---\n")
}

pub fn workload_ref(name: &str) -> ResourceRef {
    ResourceRef::new(ResourceKind::Workload, NAMESPACE, name)
}

pub fn config_map_ref(name: &str) -> ResourceRef {
    ResourceRef::new(ResourceKind::ConfigMap, NAMESPACE, name)
}

pub fn endpoint_ref(name: &str) -> ResourceRef {
    ResourceRef::new(ResourceKind::Endpoint, NAMESPACE, name)
}

/// Builder for controller config YAML.
pub struct ConfigBuilder {
    interval_secs: u64,
    poll_millis: u64,
    deadline_secs: u64,
    database: Option<String>,
    applications: Vec<String>,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            interval_secs: 180,
            poll_millis: 5,
            deadline_secs: 5,
            database: None,
            applications: Vec::new(),
        }
    }

    pub fn interval_secs(mut self, secs: u64) -> Self {
        self.interval_secs = secs;
        self
    }

    pub fn database(mut self, path: &str) -> Self {
        self.database = Some(path.to_string());
        self
    }

    /// Adds a directory-backed application.
    pub fn directory_app(mut self, name: &str, path: &str, auto_sync: bool, prune: bool) -> Self {
        self.applications.push(format!(
            "  - name: {}\n    source:\n      type: directory\n      path: {}\n    destination:\n      namespace: {}\n    syncPolicy:\n      autoSync: {}\n      prune: {}\n",
            name, path, NAMESPACE, auto_sync, prune
        ));
        self
    }

    pub fn build(self) -> String {
        let mut yaml = format!(
            "apiVersion: converge.dev/v1\nkind: ControllerConfig\nreconcileIntervalSecs: {}\nrollout:\n  readinessPollMillis: {}\n  progressDeadlineSecs: {}\n",
            self.interval_secs, self.poll_millis, self.deadline_secs
        );
        if let Some(database) = &self.database {
            yaml.push_str(&format!("database: {}\n", database));
        }
        yaml.push_str("applications:\n");
        for app in &self.applications {
            yaml.push_str(app);
        }
        yaml
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
