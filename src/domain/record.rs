//! Deployment records for the append-only history log.
//!
//! A record is written once per completed orchestration and never edited.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::version::{ArtifactRef, Endpoint, VersionId};

/// A single fact in a (service, environment) history partition.
///
/// The current live version of a partition is derived from these records;
/// nothing else stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    /// Unique identifier for this record
    pub id: Uuid,

    /// Service name (partition key)
    pub service: String,

    /// Environment name (partition key)
    pub environment: String,

    /// Source fingerprint that was deployed
    pub version: VersionId,

    /// Artifact the compute target was pointed at
    pub artifact: ArtifactRef,

    /// How the orchestration ended
    pub outcome: Outcome,

    /// What triggered it
    pub action: Action,

    /// When the record was created (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// Endpoint reported by the runtime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,

    /// Operator that ran the deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployed_by: Option<String>,

    /// Wall-clock time of the orchestration in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl DeploymentRecord {
    /// Create a new record with the current timestamp
    pub fn new(
        service: impl Into<String>,
        environment: impl Into<String>,
        version: VersionId,
        artifact: ArtifactRef,
        outcome: Outcome,
        action: Action,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            service: service.into(),
            environment: environment.into(),
            version,
            artifact,
            outcome,
            action,
            timestamp: Utc::now(),
            endpoint: None,
            deployed_by: None,
            duration_ms: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    pub fn with_deployed_by(mut self, deployed_by: Option<String>) -> Self {
        self.deployed_by = deployed_by;
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Whether this record makes its version the live one
    pub fn is_live(&self) -> bool {
        self.outcome.is_live()
    }
}

/// Terminal outcome of an orchestration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Deployed and serving traffic
    Succeeded,

    /// Terminal failure
    Failed,

    /// An earlier succeeded version was put back in place
    RolledBack,
}

impl Outcome {
    pub fn is_live(self) -> bool {
        matches!(self, Self::Succeeded | Self::RolledBack)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// Operation that produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Deploy,
    Rollback,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deploy => "deploy",
            Self::Rollback => "rollback",
        }
    }
}
