//! Content fingerprints of service source trees.
//!
//! The fingerprint covers relative paths and file contents only, sorted by
//! path, so it does not depend on directory iteration order, timestamps or
//! where the tree is checked out.

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use sha2::{Digest, Sha256};
use tokio::task::spawn_blocking;
use tracing::debug;
use walkdir::WalkDir;

use super::error::{DeployError, DeployResult};
use crate::domain::VersionId;

/// Hex characters kept from the SHA-256 digest
const VERSION_LEN: usize = 16;

/// Computes [`VersionId`]s for source trees
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    exclude: Vec<Pattern>,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new(&default_exclude())
    }
}

/// Paths that never influence a build
pub fn default_exclude() -> Vec<String> {
    vec![
        ".git/**".to_string(),
        "target/**".to_string(),
        "node_modules/**".to_string(),
        "**/__pycache__/**".to_string(),
        "**/*.pyc".to_string(),
        ".venv/**".to_string(),
        "**/.DS_Store".to_string(),
    ]
}

impl Fingerprinter {
    /// Build a fingerprinter from glob patterns; invalid patterns are skipped
    pub fn new(patterns: &[String]) -> Self {
        let exclude = patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .collect();
        Self { exclude }
    }

    /// Check if a relative path matches any exclude pattern
    pub fn is_excluded(&self, relative: &str) -> bool {
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };
        self.exclude.iter().any(|pattern| {
            pattern.matches_with(relative, options)
                // "dir/**" should also exclude "dir" itself
                || pattern
                    .as_str()
                    .strip_suffix("/**")
                    .is_some_and(|prefix| Pattern::new(prefix).is_ok_and(|p| p.matches_with(relative, options)))
        })
    }

    /// Fingerprint the tree rooted at `root`
    pub async fn compute(&self, root: &Path) -> DeployResult<VersionId> {
        let fingerprinter = self.clone();
        let root = root.to_path_buf();
        let path_for_error = root.clone();

        spawn_blocking(move || fingerprinter.compute_sync(&root))
            .await
            .map_err(|e| DeployError::SourceUnavailable {
                path: path_for_error,
                reason: format!("fingerprint task failed: {}", e),
            })?
    }

    fn compute_sync(&self, root: &Path) -> DeployResult<VersionId> {
        let unavailable = |path: &Path, reason: String| DeployError::SourceUnavailable {
            path: path.to_path_buf(),
            reason,
        };

        let metadata = std::fs::metadata(root).map_err(|e| unavailable(root, e.to_string()))?;
        if !metadata.is_dir() {
            return Err(unavailable(root, "not a directory".to_string()));
        }

        let mut entries: Vec<(String, PathBuf, bool)> = Vec::new();
        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !self.is_excluded(&relative_path(root, entry.path()))
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                unavailable(&path, e.to_string())
            })?;
            let file_type = entry.file_type();
            if file_type.is_file() || file_type.is_symlink() {
                let relative = relative_path(root, entry.path());
                entries.push((relative, entry.path().to_path_buf(), file_type.is_symlink()));
            }
        }

        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hasher = Sha256::new();
        for (relative, path, is_symlink) in &entries {
            let content = if *is_symlink {
                std::fs::read_link(path)
                    .map(|target| target.to_string_lossy().into_owned().into_bytes())
            } else {
                std::fs::read(path)
            }
            .map_err(|e| unavailable(path, e.to_string()))?;

            // Length-prefix both fields so distinct trees never collide by concatenation
            hasher.update((relative.len() as u64).to_le_bytes());
            hasher.update(relative.as_bytes());
            hasher.update([u8::from(*is_symlink)]);
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(&content);
        }

        let digest = hex::encode(hasher.finalize());
        let version = VersionId::new(&digest[..VERSION_LEN]);

        debug!(root = %root.display(), files = entries.len(), %version, "fingerprinted source");

        Ok(version)
    }
}

/// Relative path with '/' separators regardless of platform
fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
