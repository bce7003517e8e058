//! Error taxonomy for deployments.
//!
//! Every terminal failure reaches the caller with its kind; nothing here is
//! retried beyond the bounded polling in the coordinators.

use std::path::PathBuf;

use thiserror::Error;

use crate::adapters::{BuildHandle, RolloutHandle};
use crate::domain::{ArtifactRef, DescriptorError, Endpoint, VersionId};

/// Result type alias using [`DeployError`].
pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, Clone, Error)]
pub enum DeployError {
    #[error("source unavailable at {}: {reason}", path.display())]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("build failed: {reason}")]
    BuildFailed {
        reason: String,
        handle: Option<BuildHandle>,
    },

    /// The remote build may still be running
    #[error("build {handle} did not finish within {waited_ms}ms")]
    BuildTimedOut { handle: BuildHandle, waited_ms: u64 },

    #[error("rollout failed: {reason}")]
    RolloutFailed { reason: String },

    /// The in-flight rollout is neither confirmed nor rejected
    #[error("rollout {handle} was not confirmed within {waited_ms}ms")]
    RolloutTimedOut {
        handle: RolloutHandle,
        waited_ms: u64,
    },

    /// The runtime reported the rollout ready but the live target could
    /// not be read back; the new artifact may already be serving
    #[error("rollout {handle} reported ready but could not be confirmed: {reason}")]
    RolloutUnconfirmed {
        handle: RolloutHandle,
        reason: String,
    },

    #[error("history store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("version {version} has no succeeded deployment of {service} in {environment}")]
    VersionNotFound {
        service: String,
        environment: String,
        version: VersionId,
        /// Versions that could be rolled back to instead, newest first
        available: Vec<VersionId>,
    },

    /// The target is serving the new artifact but history does not say so
    #[error(
        "{artifact} is live at {endpoint} but recording version {version} failed: {reason}"
    )]
    RecordingFailed {
        version: VersionId,
        artifact: ArtifactRef,
        endpoint: Endpoint,
        reason: String,
    },

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("invalid descriptor for {service}: {source}")]
    InvalidDescriptor {
        service: String,
        #[source]
        source: DescriptorError,
    },

    #[error("{0}")]
    InvalidName(DescriptorError),

    #[error("deployment task aborted: {0}")]
    TaskAborted(String),
}

impl DeployError {
    pub fn store(error: impl std::fmt::Display) -> Self {
        Self::StoreUnavailable(error.to_string())
    }

    /// Stable identifier for the failure kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::BuildFailed { .. } => "build_failed",
            Self::BuildTimedOut { .. } => "build_timed_out",
            Self::RolloutFailed { .. } => "rollout_failed",
            Self::RolloutTimedOut { .. } => "rollout_timed_out",
            Self::RolloutUnconfirmed { .. } => "rollout_unconfirmed",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::VersionNotFound { .. } => "version_not_found",
            Self::RecordingFailed { .. } => "recording_failed",
            Self::ServiceNotFound(_) => "service_not_found",
            Self::InvalidDescriptor { .. } => "invalid_descriptor",
            Self::InvalidName(_) => "invalid_name",
            Self::TaskAborted(_) => "task_aborted",
        }
    }

    /// True when remote state is unknown or disagrees with history
    pub fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            Self::BuildTimedOut { .. }
                | Self::RolloutTimedOut { .. }
                | Self::RolloutUnconfirmed { .. }
                | Self::RecordingFailed { .. }
        )
    }
}

impl From<DescriptorError> for DeployError {
    fn from(error: DescriptorError) -> Self {
        Self::InvalidName(error)
    }
}
