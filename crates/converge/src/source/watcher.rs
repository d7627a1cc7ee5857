//! File system watcher for directory-backed manifest sources.
//!
//! Change events are broadcast; the controller forwards them into the
//! application's trigger queue so they run through the normal cycle.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{new_debouncer, DebouncedEvent, Debouncer};
use tokio::sync::broadcast;

use super::error::{Result, SourceError};
use crate::manifest::is_manifest_path;

/// Event emitted when a manifest file changes on disk.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceChangeEvent {
    /// The file path relative to the watched directory.
    pub path: String,
    /// Whether the file still exists.
    pub removed: bool,
}

struct WatchState {
    root: PathBuf,
    sender: broadcast::Sender<SourceChangeEvent>,
    shutdown: AtomicBool,
    debounce: Duration,
}

/// Watches a manifest directory in a background thread.
pub struct SourceWatcher {
    state: Arc<WatchState>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl SourceWatcher {
    /// Creates a watcher with the default 500ms debounce.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_debounce(root, Duration::from_millis(500))
    }

    pub fn with_debounce(root: impl Into<PathBuf>, debounce: Duration) -> Self {
        let (sender, _) = broadcast::channel(100);
        Self {
            state: Arc::new(WatchState {
                root: root.into(),
                sender,
                shutdown: AtomicBool::new(false),
                debounce,
            }),
            handle: None,
        }
    }

    /// Returns a receiver for change events.
    pub fn subscribe(&self) -> broadcast::Receiver<SourceChangeEvent> {
        self.state.sender.subscribe()
    }

    /// Returns the watched directory.
    pub fn root(&self) -> &Path {
        &self.state.root
    }

    /// Starts watching in a background thread. Calling twice is a no-op.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let state = Arc::clone(&self.state);
        self.handle = Some(std::thread::spawn(move || watch(&state)));
    }

    /// Stops the watcher and joins the thread.
    pub fn stop(&mut self) {
        self.state.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            match handle.join() {
                Ok(Err(e)) => log::warn!("Source watcher exited with error: {}", e),
                Err(_) => log::error!("Source watcher thread panicked"),
                Ok(Ok(())) => {}
            }
        }
    }
}

impl Drop for SourceWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Blocks until the shutdown flag is set.
fn watch(state: &WatchState) -> Result<()> {
    let (tx, rx) = std::sync::mpsc::channel();

    let mut debouncer: Debouncer<RecommendedWatcher> = new_debouncer(state.debounce, tx)
        .map_err(|e| SourceError::WatchError(e.to_string()))?;

    debouncer
        .watcher()
        .watch(&state.root, RecursiveMode::Recursive)
        .map_err(|e| SourceError::WatchError(e.to_string()))?;

    log::info!("Started watching manifest directory: {}", state.root.display());

    loop {
        if state.shutdown.load(Ordering::Relaxed) {
            break;
        }

        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Ok(events)) => {
                for event in events {
                    if let Some(change) = process_event(&state.root, &event) {
                        let _ = state.sender.send(change);
                    }
                }
            }
            Ok(Err(e)) => log::error!("Watch error: {}", e),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("Stopped watching manifest directory");
    Ok(())
}

/// Maps a raw debounced event to a change event, dropping non-manifest paths.
fn process_event(root: &Path, event: &DebouncedEvent) -> Option<SourceChangeEvent> {
    let relative = event.path.strip_prefix(root).ok()?;
    if !is_manifest_path(relative) && !event.path.is_dir() {
        return None;
    }
    Some(SourceChangeEvent {
        path: relative.to_string_lossy().to_string(),
        removed: !event.path.exists(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify_debouncer_mini::DebouncedEventKind;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_process_event_yaml_file() {
        let dir = TempDir::new().unwrap();
        let file_path = dir.path().join("apps").join("web.yaml");
        fs::create_dir_all(file_path.parent().unwrap()).unwrap();
        fs::write(&file_path, "kind: Workload").unwrap();

        let event = DebouncedEvent {
            path: file_path,
            kind: DebouncedEventKind::Any,
        };
        let change = process_event(dir.path(), &event).unwrap();
        assert_eq!(change.path, "apps/web.yaml");
        assert!(!change.removed);
    }

    #[test]
    fn test_process_event_deleted_and_ignored_files() {
        let dir = TempDir::new().unwrap();
        let gone = DebouncedEvent {
            path: dir.path().join("gone.yml"),
            kind: DebouncedEventKind::Any,
        };
        assert!(process_event(dir.path(), &gone).unwrap().removed);

        let readme = dir.path().join("README.md");
        fs::write(&readme, "docs").unwrap();
        let ignored = DebouncedEvent {
            path: readme,
            kind: DebouncedEventKind::Any,
        };
        assert!(process_event(dir.path(), &ignored).is_none());
    }

    #[test]
    fn test_watcher_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mut watcher = SourceWatcher::with_debounce(dir.path(), Duration::from_millis(50));
        let _rx = watcher.subscribe();
        watcher.start();
        watcher.start();
        std::thread::sleep(Duration::from_millis(50));
        watcher.stop();
        assert!(watcher.handle.is_none());
    }
}
