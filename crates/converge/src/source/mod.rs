//! Manifest sources: where desired state is read from.
//!
//! A source only ever reads. Producers (build pipelines) publish new
//! revisions by committing to the source; they never get a handle to the
//! resource provider.

pub mod directory;
pub mod error;
pub mod git;
pub mod watcher;

use async_trait::async_trait;

use crate::manifest::{ManifestSet, Revision};

pub use directory::DirectorySource;
pub use error::{Result, SourceError};
pub use git::GitSource;
pub use watcher::SourceWatcher;

/// Read-only access to a versioned manifest set.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Human-readable location, used in logs and status messages.
    fn describe(&self) -> String;

    /// Resolves the latest revision available from the source.
    async fn head_revision(&self) -> Result<Revision>;

    /// Reads and parses the manifest set at `revision`.
    ///
    /// Reading the same revision twice yields identical sets.
    async fn fetch_revision(&self, revision: &Revision) -> Result<ManifestSet>;

    /// Reads the manifest set at the latest revision.
    async fn fetch(&self) -> Result<(ManifestSet, Revision)> {
        let revision = self.head_revision().await?;
        let set = self.fetch_revision(&revision).await?;
        Ok((set, revision))
    }
}
