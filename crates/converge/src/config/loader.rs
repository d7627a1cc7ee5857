use std::collections::HashSet;
use std::path::Path;

use crate::config::schema::{ControllerConfig, SourceConfig, CONFIG_KIND};
use crate::error::ConfigError;
use crate::manifest::API_VERSION;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ControllerConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut config = load_config_from_str(&content)?;
    config.base_dir = path.parent().map(Path::to_path_buf);
    Ok(config)
}

pub fn load_config_from_str(content: &str) -> Result<ControllerConfig, ConfigError> {
    let config: ControllerConfig = serde_yaml::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &ControllerConfig) -> Result<(), ConfigError> {
    if config.api_version != API_VERSION {
        return Err(ConfigError::Validation {
            message: format!("Unsupported apiVersion: {}", config.api_version),
        });
    }
    if config.kind != CONFIG_KIND {
        return Err(ConfigError::Validation {
            message: format!("Expected kind {}, found {}", CONFIG_KIND, config.kind),
        });
    }

    if config.reconcile_interval_secs == 0
        || config.provider_timeout_secs == 0
        || config.git_timeout_secs == 0
        || config.rollout.readiness_poll_millis == 0
        || config.rollout.progress_deadline_secs == 0
    {
        return Err(ConfigError::Validation {
            message: "Intervals and timeouts must be positive".to_string(),
        });
    }

    if config.applications.is_empty() {
        return Err(ConfigError::Validation {
            message: "At least one application must be configured".to_string(),
        });
    }

    let mut names = HashSet::new();
    for app in &config.applications {
        if app.name.trim().is_empty() {
            return Err(ConfigError::InvalidApplication {
                name: app.name.clone(),
                reason: "Name must not be empty".to_string(),
            });
        }
        if !names.insert(&app.name) {
            return Err(ConfigError::InvalidApplication {
                name: app.name.clone(),
                reason: "Duplicate application name".to_string(),
            });
        }
        if app.destination.namespace.trim().is_empty() {
            return Err(ConfigError::InvalidApplication {
                name: app.name.clone(),
                reason: "Destination namespace must not be empty".to_string(),
            });
        }
        match &app.source {
            SourceConfig::Git {
                repo_path, branch, ..
            } => {
                if repo_path.trim().is_empty() {
                    return Err(ConfigError::InvalidApplication {
                        name: app.name.clone(),
                        reason: "Git sources need a repoPath".to_string(),
                    });
                }
                if branch.trim().is_empty() {
                    return Err(ConfigError::InvalidApplication {
                        name: app.name.clone(),
                        reason: "Git sources need a branch".to_string(),
                    });
                }
            }
            SourceConfig::Directory { path } => {
                if path.trim().is_empty() {
                    return Err(ConfigError::InvalidApplication {
                        name: app.name.clone(),
                        reason: "Directory sources need a path".to_string(),
                    });
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const MINIMAL: &str = r#"
apiVersion: converge.dev/v1
kind: ControllerConfig
applications:
  - name: shop
    source:
      type: directory
      path: ./manifests/shop
"#;

    #[test]
    fn test_defaults() {
        let config = load_config_from_str(MINIMAL).unwrap();
        assert_eq!(config.reconcile_interval(), Duration::from_secs(180));
        assert_eq!(config.provider_timeout(), Duration::from_secs(15));
        assert_eq!(config.git_timeout(), Duration::from_secs(60));
        assert_eq!(config.rollout_options().poll_interval, Duration::from_millis(2000));
        assert_eq!(config.rollout_options().progress_deadline, Duration::from_secs(600));
        assert!(config.diff.ignore_fields.is_empty());
        assert!(config.database.is_none());

        let app = &config.applications[0];
        assert_eq!(app.destination.namespace, "default");
        assert!(!app.sync_policy.auto_sync);
        assert!(!app.sync_policy.prune);
    }

    #[test]
    fn test_full_config() {
        let content = r#"
apiVersion: converge.dev/v1
kind: ControllerConfig
reconcileIntervalSecs: 30
rollout:
  readinessPollMillis: 500
diff:
  ignoreFields: [spec.replicas]
database: /var/lib/converge/state.db
applications:
  - name: shop
    source:
      type: git
      repoPath: /srv/git/shop
      url: https://git.example.com/shop.git
      branch: release
      path: deploy
    destination:
      namespace: shop
    syncPolicy:
      autoSync: true
      prune: true
"#;
        let config = load_config_from_str(content).unwrap();
        assert_eq!(config.reconcile_interval_secs, 30);
        assert_eq!(config.rollout.readiness_poll_millis, 500);
        assert_eq!(config.rollout.progress_deadline_secs, 600);
        assert_eq!(config.diff_options().ignore_fields, vec!["spec.replicas"]);
        let app = config.application("shop").unwrap();
        assert!(app.sync_policy.auto_sync && app.sync_policy.prune);
        assert_eq!(
            app.to_application(&config).source,
            "https://git.example.com/shop.git#release:deploy"
        );
    }

    #[test]
    fn test_relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("converge.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(
            config.resolve("./manifests/shop"),
            dir.path().join("./manifests/shop")
        );
        assert_eq!(config.resolve("/abs"), std::path::PathBuf::from("/abs"));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let content = r#"
apiVersion: converge.dev/v1
kind: ControllerConfig
applications:
  - name: shop
    source: {type: directory, path: a}
  - name: shop
    source: {type: directory, path: b}
"#;
        let err = load_config_from_str(content).unwrap_err();
        assert!(err.to_string().contains("Duplicate"));
    }

    #[test]
    fn test_invalid_configs() {
        let empty = "apiVersion: converge.dev/v1\nkind: ControllerConfig\napplications: []\n";
        assert!(load_config_from_str(empty).is_err());

        let wrong_version = MINIMAL.replace("converge.dev/v1", "converge.dev/v2");
        assert!(load_config_from_str(&wrong_version).is_err());

        let zero = MINIMAL.replace("applications:", "reconcileIntervalSecs: 0\napplications:");
        assert!(load_config_from_str(&zero).is_err());

        let bad_type = MINIMAL.replace("type: directory", "type: s3");
        assert!(matches!(
            load_config_from_str(&bad_type),
            Err(ConfigError::ParseYaml(_))
        ));
    }
}
