//! Service discovery from a services directory.
//!
//! Layout: `<root>/<service>/service.yaml`. A service directory without a
//! descriptor deploys with default settings.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::debug;

use super::error::{DeployError, DeployResult};
use crate::domain::{validate_name, ServiceDescriptor};

/// Descriptor file names, in lookup order
const DESCRIPTOR_FILES: &[&str] = &["service.yaml", "service.yml", "config.json"];

#[derive(Debug, Clone)]
pub struct ServiceCatalog {
    root: PathBuf,
}

impl ServiceCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of all service directories, sorted
    pub async fn names(&self) -> DeployResult<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let unavailable = |e: std::io::Error| DeployError::SourceUnavailable {
            path: self.root.clone(),
            reason: e.to_string(),
        };

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&self.root).await.map_err(unavailable)?;
        while let Some(entry) = entries.next_entry().await.map_err(unavailable)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || validate_name(&name).is_err() {
                continue;
            }
            if entry.file_type().await.map_err(unavailable)?.is_dir() {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }

    /// Resolve the descriptor of one service
    pub async fn load(&self, name: &str) -> DeployResult<ServiceDescriptor> {
        validate_name(name)?;

        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Err(DeployError::ServiceNotFound(name.to_string()));
        }

        let invalid = |source| DeployError::InvalidDescriptor {
            service: name.to_string(),
            source,
        };

        for file in DESCRIPTOR_FILES {
            let path = dir.join(file);
            if !path.is_file() {
                continue;
            }

            let content = fs::read_to_string(&path)
                .await
                .map_err(|e| DeployError::SourceUnavailable {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;

            debug!(service = name, descriptor = %path.display(), "Loaded descriptor");
            return ServiceDescriptor::from_yaml(name, &dir, &content).map_err(invalid);
        }

        ServiceDescriptor::from_yaml(name, &dir, "").map_err(invalid)
    }
}
