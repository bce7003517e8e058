//! Filesystem index of built artifacts.
//!
//! One small file per (service, version) holding the artifact reference:
//! `<root>/<service>/<version>`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;

use super::{ArtifactStore, ArtifactSummary};
use crate::domain::{ArtifactRef, VersionId};

pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, service: &str, version: &VersionId) -> PathBuf {
        self.root.join(service).join(version.as_str())
    }

    async fn list_service(&self, service: &str) -> Result<Vec<ArtifactSummary>> {
        let dir = self.root.join(service);
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read artifact index: {}", dir.display()))?;

        let mut artifacts = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type().await?.is_file() {
                continue;
            }

            let version = VersionId::new(name);
            let Some(artifact) = self.exists(service, &version).await? else {
                continue;
            };

            // The index file is written once, when the build finishes
            let created_at = entry
                .metadata()
                .await
                .and_then(|m| m.modified())
                .ok()
                .map(DateTime::<Utc>::from);

            artifacts.push(ArtifactSummary {
                service: service.to_string(),
                version,
                artifact,
                created_at,
            });
        }

        artifacts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.version.cmp(&b.version)));
        Ok(artifacts)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn exists(&self, service: &str, version: &VersionId) -> Result<Option<ArtifactRef>> {
        let path = self.entry_path(service, version);

        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read artifact index: {}", path.display()))?;

        let reference = content.trim();
        if reference.is_empty() {
            return Ok(None);
        }

        Ok(Some(ArtifactRef::new(reference)))
    }

    async fn record(&self, service: &str, version: &VersionId, artifact: &ArtifactRef) -> Result<()> {
        let path = self.entry_path(service, version);
        let dir = self.root.join(service);

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create artifact index: {}", dir.display()))?;

        // Write-then-rename so a concurrent reader never sees a partial reference
        let tmp = dir.join(format!(".{}.tmp", version));
        fs::write(&tmp, format!("{}\n", artifact))
            .await
            .with_context(|| format!("Failed to write artifact index: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to commit artifact index: {}", path.display()))?;

        Ok(())
    }

    async fn list(&self, service: Option<&str>) -> Result<Vec<ArtifactSummary>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let services = match service {
            Some(service) => vec![service.to_string()],
            None => {
                let mut names = Vec::new();
                let mut entries = fs::read_dir(&self.root).await.with_context(|| {
                    format!("Failed to read artifact index: {}", self.root.display())
                })?;
                while let Some(entry) = entries.next_entry().await? {
                    let name = entry.file_name().to_string_lossy().into_owned();
                    if !name.starts_with('.') && entry.file_type().await?.is_dir() {
                        names.push(name);
                    }
                }
                names.sort();
                names
            }
        };

        let mut artifacts = Vec::new();
        for service in services {
            if self.root.join(&service).is_dir() {
                artifacts.extend(self.list_service(&service).await?);
            }
        }

        Ok(artifacts)
    }
}
