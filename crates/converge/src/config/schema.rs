use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app::{Application, SyncPolicy};
use crate::diff::DiffOptions;
use crate::sync::RolloutOptions;

pub const CONFIG_KIND: &str = "ControllerConfig";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    pub api_version: String,
    pub kind: String,
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_secs: u64,
    #[serde(default = "default_git_timeout")]
    pub git_timeout_secs: u64,
    #[serde(default)]
    pub rollout: RolloutConfig,
    #[serde(default)]
    pub diff: DiffConfig,
    /// SQLite file; `~` is expanded. Defaults to `~/.converge/state.db`.
    #[serde(default)]
    pub database: Option<String>,
    pub applications: Vec<ApplicationConfig>,
    /// Directory relative paths are resolved against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

fn default_reconcile_interval() -> u64 {
    180
}

fn default_provider_timeout() -> u64 {
    15
}

fn default_git_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutConfig {
    #[serde(default = "default_readiness_poll")]
    pub readiness_poll_millis: u64,
    #[serde(default = "default_progress_deadline")]
    pub progress_deadline_secs: u64,
}

fn default_readiness_poll() -> u64 {
    2000
}

fn default_progress_deadline() -> u64 {
    600
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            readiness_poll_millis: default_readiness_poll(),
            progress_deadline_secs: default_progress_deadline(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffConfig {
    /// Dotted paths never compared, e.g. `spec.replicas` for autoscaled workloads.
    #[serde(default)]
    pub ignore_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationConfig {
    pub name: String,
    pub source: SourceConfig,
    #[serde(default)]
    pub destination: DestinationConfig,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SourceConfig {
    #[serde(rename_all = "camelCase")]
    Git {
        repo_path: String,
        #[serde(default)]
        url: Option<String>,
        #[serde(default = "default_branch")]
        branch: String,
        #[serde(default)]
        path: String,
    },
    #[serde(rename_all = "camelCase")]
    Directory { path: String },
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl Default for DestinationConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
        }
    }
}

impl ControllerConfig {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_secs)
    }

    pub fn rollout_options(&self) -> RolloutOptions {
        RolloutOptions {
            poll_interval: Duration::from_millis(self.rollout.readiness_poll_millis),
            progress_deadline: Duration::from_secs(self.rollout.progress_deadline_secs),
        }
    }

    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            ignore_fields: self.diff.ignore_fields.clone(),
        }
    }

    /// Resolved database path, if one is configured.
    pub fn database_path(&self) -> Option<PathBuf> {
        self.database.as_deref().map(|p| self.resolve(p))
    }

    pub fn application(&self, name: &str) -> Option<&ApplicationConfig> {
        self.applications.iter().find(|a| a.name == name)
    }

    /// Expands `~` and resolves relative paths against the config directory.
    pub fn resolve(&self, path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        let path = Path::new(path);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl ApplicationConfig {
    /// The application model for this entry.
    pub fn to_application(&self, config: &ControllerConfig) -> Application {
        let source = match &self.source {
            SourceConfig::Git {
                repo_path,
                url,
                branch,
                path,
            } => match url {
                Some(url) => format!("{}#{}:{}", url, branch, path),
                None => format!("{}#{}:{}", config.resolve(repo_path).display(), branch, path),
            },
            SourceConfig::Directory { path } => format!("dir://{}", config.resolve(path).display()),
        };
        Application {
            name: self.name.clone(),
            namespace: self.destination.namespace.clone(),
            source,
            policy: self.sync_policy,
        }
    }
}
