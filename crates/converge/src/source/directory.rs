//! Plain-directory manifest source with content-hash revisions.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use walkdir::WalkDir;

use super::error::{Result, SourceError};
use super::ManifestSource;
use crate::manifest::{is_manifest_path, ManifestFile, ManifestParser, ManifestSet, Revision};

/// Files captured for one revision.
#[derive(Debug, Clone)]
struct Snapshot {
    revision: Revision,
    files: Vec<ManifestFile>,
    /// First file that is not valid UTF-8, with the decode error.
    undecodable: Option<(PathBuf, String)>,
}

/// Manifest source backed by a directory on disk.
///
/// A directory has no history, so the revision is a blake3 hash over the
/// sorted (relative path, content) pairs. The files behind the most recent
/// revision are cached so fetching that revision stays byte-identical even
/// if the directory changes in between.
pub struct DirectorySource {
    root: PathBuf,
    parser: ManifestParser,
    last: Mutex<Option<Snapshot>>,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>, default_namespace: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            parser: ManifestParser::new(default_namespace),
            last: Mutex::new(None),
        }
    }

    /// Returns the watched directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn snapshot(&self) -> Result<Snapshot> {
        if !self.root.is_dir() {
            return Err(SourceError::Unavailable(format!(
                "manifest directory '{}' not found",
                self.root.display()
            )));
        }

        let mut raw = Vec::new();
        for entry in WalkDir::new(&self.root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let relative = path.strip_prefix(&self.root).unwrap_or(path).to_path_buf();
            if !is_manifest_path(&relative) {
                continue;
            }
            let content = fs::read(path).map_err(|e| SourceError::ReadFile {
                path: path.to_path_buf(),
                source: e,
            })?;
            raw.push((relative, content));
        }
        raw.sort_by(|a, b| a.0.cmp(&b.0));

        let revision = content_revision(&raw);
        let mut files = Vec::with_capacity(raw.len());
        let mut undecodable = None;
        for (relative, content) in raw {
            match String::from_utf8(content) {
                Ok(text) => files.push(ManifestFile::new(relative, text)),
                Err(e) => {
                    undecodable.get_or_insert((relative, e.utf8_error().to_string()));
                }
            }
        }

        Ok(Snapshot {
            revision,
            files,
            undecodable,
        })
    }
}

/// Computes the content-hash revision of (relative path, bytes) pairs.
pub fn content_revision(files: &[(PathBuf, Vec<u8>)]) -> Revision {
    let mut hasher = blake3::Hasher::new();
    for (path, content) in files {
        hasher.update(path.to_string_lossy().as_bytes());
        hasher.update(&[0]);
        hasher.update(content);
        hasher.update(&[0]);
    }
    Revision::new(hasher.finalize().to_hex().to_string())
}

#[async_trait]
impl ManifestSource for DirectorySource {
    fn describe(&self) -> String {
        format!("dir://{}", self.root.display())
    }

    async fn head_revision(&self) -> Result<Revision> {
        let snapshot = self.snapshot()?;
        let revision = snapshot.revision.clone();
        if let Ok(mut last) = self.last.lock() {
            *last = Some(snapshot);
        }
        Ok(revision)
    }

    async fn fetch_revision(&self, revision: &Revision) -> Result<ManifestSet> {
        let cached = self
            .last
            .lock()
            .ok()
            .and_then(|last| last.clone())
            .filter(|s| &s.revision == revision);

        let snapshot = match cached {
            Some(snapshot) => snapshot,
            None => {
                let current = self.snapshot()?;
                if &current.revision != revision {
                    return Err(SourceError::UnknownRevision(revision.clone()));
                }
                current
            }
        };

        if let Some((path, reason)) = snapshot.undecodable {
            return Err(SourceError::ManifestInvalid {
                revision: revision.clone(),
                path,
                message: format!("not valid UTF-8: {}", reason),
            });
        }
        self.parser.parse(revision, &snapshot.files)
    }
}
