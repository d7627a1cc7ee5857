use std::path::PathBuf;
use thiserror::Error;

use crate::db::DatabaseError;
use crate::provider::ProviderError;
use crate::source::SourceError;

#[derive(Error, Debug)]
pub enum ConvergeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Reconcile error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid application '{name}': {reason}")]
    InvalidApplication { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Manifest source failed: {0}")]
    Source(#[from] SourceError),

    #[error("Resource provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("State store failed: {0}")]
    Database(#[from] DatabaseError),

    #[error("Unknown application: {0}")]
    UnknownApplication(String),

    #[error("Application {0} is registered twice")]
    DuplicateApplication(String),

    #[error("Controller is shutting down")]
    ShuttingDown,
}

impl ReconcileError {
    /// Returns true if the next cycle may succeed without any change.
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::Source(e) => e.is_transient(),
            ReconcileError::Provider(e) => e.is_transient(),
            ReconcileError::Database(_) => true,
            ReconcileError::UnknownApplication(_)
            | ReconcileError::DuplicateApplication(_)
            | ReconcileError::ShuttingDown => false,
        }
    }
}
