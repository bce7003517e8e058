//! Per-service configuration.
//!
//! A descriptor is resolved once per orchestration and passed explicitly;
//! the orchestrator never mutates it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Immutable configuration for one deployable service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Unique service name
    pub name: String,

    /// Root of the source tree that gets fingerprinted and built
    pub source: PathBuf,

    pub resources: ResourceLimits,

    pub scaling: ScalingBounds,

    /// Environment name -> variables for that environment
    pub env: HashMap<String, BTreeMap<String, String>>,

    /// Per-request timeout on the compute target
    pub timeout_seconds: u64,

    /// Whether the target accepts unauthenticated requests
    pub allow_unauthenticated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory: String,
    pub cpu: String,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: default_memory(),
            cpu: default_cpu(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingBounds {
    pub min_instances: u32,
    pub max_instances: u32,
}

impl Default for ScalingBounds {
    fn default() -> Self {
        Self {
            min_instances: 0,
            max_instances: default_max_instances(),
        }
    }
}

/// Descriptor file schema (`service.yaml` or `config.json`), flat keys
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceFile {
    /// Source directory, relative to the service directory
    pub source: Option<String>,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpu")]
    pub cpu: String,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub min_instances: u32,
    #[serde(default = "default_max_instances")]
    pub max_instances: u32,
    #[serde(default = "default_allow_unauthenticated")]
    pub allow_unauthenticated: bool,
    #[serde(default)]
    pub env: HashMap<String, BTreeMap<String, String>>,
}

fn default_memory() -> String {
    "512Mi".to_string()
}
fn default_cpu() -> String {
    "1".to_string()
}
fn default_timeout() -> u64 {
    60
}
fn default_max_instances() -> u32 {
    100
}
fn default_allow_unauthenticated() -> bool {
    true
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("invalid name '{0}': expected letters, digits, '-', '_' or '.'")]
    InvalidName(String),

    #[error("min_instances ({min}) exceeds max_instances ({max})")]
    ScalingBounds { min: u32, max: u32 },

    #[error("max_instances must be at least 1")]
    NoInstances,

    #[error("timeout must be greater than zero")]
    ZeroTimeout,

    #[error("failed to parse descriptor: {0}")]
    Parse(String),
}

impl ServiceDescriptor {
    /// Descriptor with default limits for a service rooted at `source`
    pub fn new(name: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self::from_file(name, source.into(), ServiceFile {
            memory: default_memory(),
            cpu: default_cpu(),
            timeout: default_timeout(),
            max_instances: default_max_instances(),
            allow_unauthenticated: default_allow_unauthenticated(),
            ..Default::default()
        })
    }

    /// Parse descriptor YAML (JSON is accepted too) for the service in `service_dir`
    pub fn from_yaml(
        name: &str,
        service_dir: &Path,
        content: &str,
    ) -> Result<Self, DescriptorError> {
        let file: ServiceFile = if content.trim().is_empty() {
            serde_yaml::from_str("{}")
        } else {
            serde_yaml::from_str(content)
        }
        .map_err(|e| DescriptorError::Parse(e.to_string()))?;

        let source = match file.source.as_deref() {
            Some(path) if Path::new(path).is_absolute() => PathBuf::from(path),
            Some(path) => service_dir.join(path),
            None => service_dir.to_path_buf(),
        };

        let descriptor = Self::from_file(name, source, file);
        descriptor.validate()?;
        Ok(descriptor)
    }

    fn from_file(name: impl Into<String>, source: PathBuf, file: ServiceFile) -> Self {
        Self {
            name: name.into(),
            source,
            resources: ResourceLimits {
                memory: file.memory,
                cpu: file.cpu,
            },
            scaling: ScalingBounds {
                min_instances: file.min_instances,
                max_instances: file.max_instances,
            },
            env: file.env,
            timeout_seconds: file.timeout,
            allow_unauthenticated: file.allow_unauthenticated,
        }
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        validate_name(&self.name)?;

        if self.scaling.max_instances == 0 {
            return Err(DescriptorError::NoInstances);
        }
        if self.scaling.min_instances > self.scaling.max_instances {
            return Err(DescriptorError::ScalingBounds {
                min: self.scaling.min_instances,
                max: self.scaling.max_instances,
            });
        }
        if self.timeout_seconds == 0 {
            return Err(DescriptorError::ZeroTimeout);
        }

        Ok(())
    }

    /// Variables configured for one environment
    pub fn env_for(&self, environment: &str) -> BTreeMap<String, String> {
        self.env.get(environment).cloned().unwrap_or_default()
    }
}

/// Service and environment names end up as path components
pub fn validate_name(name: &str) -> Result<(), DescriptorError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(DescriptorError::InvalidName(name.to_string()))
    }
}
