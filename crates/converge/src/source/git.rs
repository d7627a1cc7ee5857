//! Git-backed manifest source.
//!
//! Shells out to the `git` binary. Manifests are read straight from the
//! object database (`ls-tree` / `show` at a commit), so the working tree is
//! never touched and reads at a revision are byte-identical.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::error::{classify_git_error, Result, SourceError};
use super::ManifestSource;
use crate::manifest::{is_manifest_path, ManifestFile, ManifestParser, ManifestSet, Revision};

/// Settings for a git source.
#[derive(Debug, Clone)]
pub struct GitSourceSettings {
    /// Local clone location.
    pub repo_path: PathBuf,
    /// Remote URL; when set, the clone is created on first use and fetched every cycle.
    pub url: Option<String>,
    /// Tracked branch.
    pub branch: String,
    /// Directory inside the repository holding the manifests.
    pub path: String,
    /// Upper bound for each git invocation.
    pub timeout: Duration,
}

impl Default for GitSourceSettings {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            url: None,
            branch: "main".to_string(),
            path: String::new(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Manifest source reading a branch of a git repository.
pub struct GitSource {
    settings: GitSourceSettings,
    parser: ManifestParser,
}

impl GitSource {
    pub fn new(settings: GitSourceSettings, default_namespace: impl Into<String>) -> Self {
        Self {
            settings,
            parser: ManifestParser::new(default_namespace),
        }
    }

    /// Returns the repository path.
    pub fn repo_path(&self) -> &Path {
        &self.settings.repo_path
    }

    /// Checks if the directory is a git repository.
    pub fn is_git_repo(&self) -> bool {
        self.settings.repo_path.join(".git").exists()
            || self.settings.repo_path.join("HEAD").is_file()
    }

    /// Clones the remote if no local repository exists yet.
    async fn ensure_clone(&self) -> Result<()> {
        if self.is_git_repo() {
            return Ok(());
        }
        let url = self.settings.url.as_deref().ok_or_else(|| {
            SourceError::Unavailable(format!(
                "'{}' is not a git repository and no url is configured",
                self.settings.repo_path.display()
            ))
        })?;

        if let Some(parent) = self.settings.repo_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SourceError::ReadFile {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        log::info!(
            "Cloning {} into {}",
            url,
            self.settings.repo_path.display()
        );
        let target = self.settings.repo_path.to_string_lossy().to_string();
        let output = self
            .run_git_in(
                None,
                &[
                    "clone",
                    "--no-checkout",
                    "--branch",
                    &self.settings.branch,
                    url,
                    &target,
                ],
            )
            .await?;
        if !output.status.success() {
            return Err(classify_git_error(&format_git_error(&output)));
        }
        Ok(())
    }

    /// The ref that names the tracked branch head.
    fn tracked_ref(&self) -> String {
        if self.settings.url.is_some() {
            format!("origin/{}", self.settings.branch)
        } else {
            self.settings.branch.clone()
        }
    }

    async fn list_manifest_paths(&self, revision: &Revision) -> Result<Vec<String>> {
        let mut args = vec!["ls-tree", "-r", "--name-only", revision.as_str()];
        let scope = self.settings.path.trim_matches('/');
        if !scope.is_empty() {
            args.push("--");
            args.push(scope);
        }
        let output = self.run_git(&args).await?;
        if !output.status.success() {
            return Err(classify_git_error(&format_git_error(&output)));
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        let mut paths: Vec<String> = listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter(|line| is_manifest_path(self.relative(Path::new(line))))
            .map(str::to_string)
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Path relative to the configured manifest directory.
    fn relative<'a>(&self, path: &'a Path) -> &'a Path {
        let scope = self.settings.path.trim_matches('/');
        if scope.is_empty() {
            return path;
        }
        path.strip_prefix(scope).unwrap_or(path)
    }

    async fn show(&self, revision: &Revision, path: &str) -> Result<Vec<u8>> {
        let object = format!("{}:{}", revision, path);
        let output = self.run_git(&["show", &object]).await?;
        if !output.status.success() {
            return Err(classify_git_error(&format_git_error(&output)));
        }
        Ok(output.stdout)
    }

    /// Runs a git command in the repository directory.
    async fn run_git(&self, args: &[&str]) -> Result<Output> {
        self.run_git_in(Some(&self.settings.repo_path), args).await
    }

    async fn run_git_in(&self, dir: Option<&Path>, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new("git");
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.settings.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|e| SourceError::Unavailable(e.to_string())),
            Err(_) => Err(SourceError::Timeout(self.settings.timeout.as_secs())),
        }
    }
}

#[async_trait]
impl ManifestSource for GitSource {
    fn describe(&self) -> String {
        match &self.settings.url {
            Some(url) => format!("{}#{}:{}", url, self.settings.branch, self.settings.path),
            None => format!(
                "{}#{}:{}",
                self.settings.repo_path.display(),
                self.settings.branch,
                self.settings.path
            ),
        }
    }

    async fn head_revision(&self) -> Result<Revision> {
        self.ensure_clone().await?;

        if self.settings.url.is_some() {
            let output = self
                .run_git(&["fetch", "--quiet", "origin", &self.settings.branch])
                .await?;
            if !output.status.success() {
                return Err(classify_git_error(&format_git_error(&output)));
            }
        }

        let tracked = format!("{}^{{commit}}", self.tracked_ref());
        let output = self.run_git(&["rev-parse", "--verify", &tracked]).await?;
        if !output.status.success() {
            return Err(classify_git_error(&format_git_error(&output)));
        }
        let hash = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Revision::new(hash))
    }

    async fn fetch_revision(&self, revision: &Revision) -> Result<ManifestSet> {
        let paths = self.list_manifest_paths(revision).await?;
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = self.show(revision, &path).await?;
            let relative = self.relative(Path::new(&path)).to_path_buf();
            let content = String::from_utf8(bytes).map_err(|e| SourceError::ManifestInvalid {
                revision: revision.clone(),
                path: relative.clone(),
                message: format!("not valid UTF-8: {}", e.utf8_error()),
            })?;
            files.push(ManifestFile::new(relative, content));
        }
        log::debug!(
            "Read {} manifest files from {} at {}",
            files.len(),
            self.describe(),
            revision.short()
        );
        self.parser.parse(revision, &files)
    }
}

/// Formats a git error with both stdout and stderr for better debugging.
fn format_git_error(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();

    match (stderr.is_empty(), stdout.is_empty()) {
        (true, true) => format!(
            "Command failed with exit code {}",
            output.status.code().unwrap_or(-1)
        ),
        (true, false) => stdout,
        (false, true) => stderr,
        (false, false) => format!("{}\n{}", stderr, stdout),
    }
}
