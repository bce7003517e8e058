//! Adapter interfaces for the external platform.
//!
//! The build service, artifact store and compute runtime are opaque
//! collaborators. Their errors are plain `anyhow` errors; the coordinators
//! in `core` decide what a failure means for a deployment.

pub mod artifacts;
pub mod process;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ArtifactRef, Endpoint, ServiceDescriptor, VersionId};

pub use artifacts::FsArtifactStore;
pub use process::{ProcessBuildService, ProcessRuntime};

/// Identifier of a submitted remote build
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildHandle(String);

impl BuildHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an in-flight rollout on the compute runtime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RolloutHandle(String);

impl RolloutHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RolloutHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to build
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub service: String,
    pub version: VersionId,
    pub source: PathBuf,
}

/// Remote build state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    Pending,
    Succeeded { artifact: ArtifactRef },
    Failed { reason: String },
}

/// Remote rollout state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutStatus {
    Pending,
    Ready,
    Failed { reason: String },
}

/// Configuration applied to a compute target alongside its artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub memory: String,
    pub cpu: String,
    pub min_instances: u32,
    pub max_instances: u32,
    pub timeout_seconds: u64,
    pub allow_unauthenticated: bool,
    pub env_vars: BTreeMap<String, String>,
}

impl RuntimeConfig {
    /// Resolve the target configuration for one environment.
    ///
    /// `ENVIRONMENT` and `SERVICE_NAME` are always injected and win over
    /// descriptor values of the same name.
    pub fn from_descriptor(descriptor: &ServiceDescriptor, environment: &str) -> Self {
        let mut env_vars = descriptor.env_for(environment);
        env_vars.insert("ENVIRONMENT".to_string(), environment.to_string());
        env_vars.insert("SERVICE_NAME".to_string(), descriptor.name.clone());

        Self {
            memory: descriptor.resources.memory.clone(),
            cpu: descriptor.resources.cpu.clone(),
            min_instances: descriptor.scaling.min_instances,
            max_instances: descriptor.scaling.max_instances,
            timeout_seconds: descriptor.timeout_seconds,
            allow_unauthenticated: descriptor.allow_unauthenticated,
            env_vars,
        }
    }
}

/// Live state of one compute target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetDescription {
    pub artifact: ArtifactRef,
    pub endpoint: Endpoint,
}

/// Entry in the artifact store's listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    pub service: String,
    pub version: VersionId,
    pub artifact: ArtifactRef,
    pub created_at: Option<DateTime<Utc>>,
}

/// Entry in the runtime's target listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSummary {
    pub service: String,
    pub environment: String,
    pub artifact: ArtifactRef,
    pub endpoint: Endpoint,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Remote build service
#[async_trait]
pub trait BuildService: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    /// Submit a build and return its handle without waiting
    async fn submit(&self, spec: &BuildSpec) -> Result<BuildHandle>;

    /// Current state of a submitted build
    async fn status(&self, handle: &BuildHandle) -> Result<BuildStatus>;
}

/// Store of immutable build artifacts
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Artifact already built for (service, version), if any
    async fn exists(&self, service: &str, version: &VersionId) -> Result<Option<ArtifactRef>>;

    /// Remember a freshly built artifact. Stores the build pushes to
    /// directly have nothing to do here.
    async fn record(
        &self,
        _service: &str,
        _version: &VersionId,
        _artifact: &ArtifactRef,
    ) -> Result<()> {
        Ok(())
    }

    /// Built artifacts, optionally for one service. Sorted by service name,
    /// newest first within a service.
    async fn list(&self, service: Option<&str>) -> Result<Vec<ArtifactSummary>>;
}

/// Platform hosting one named, versioned target per (service, environment)
#[async_trait]
pub trait ComputeRuntime: Send + Sync {
    /// Human-readable adapter name
    fn name(&self) -> &str;

    async fn describe(&self, service: &str, environment: &str)
        -> Result<Option<TargetDescription>>;

    /// Create or update the target; returns as soon as the change is accepted
    async fn upsert(
        &self,
        service: &str,
        environment: &str,
        artifact: &ArtifactRef,
        config: &RuntimeConfig,
    ) -> Result<RolloutHandle>;

    async fn status(&self, handle: &RolloutHandle) -> Result<RolloutStatus>;

    /// Targets known to the runtime, optionally limited to one environment
    async fn list(&self, environment: Option<&str>) -> Result<Vec<TargetSummary>>;
}
