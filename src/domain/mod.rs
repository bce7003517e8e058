//! Domain types for the shipyard orchestrator.
//!
//! This module contains the core data structures:
//! - Version: VersionId, ArtifactRef, Endpoint
//! - Record: Immutable deployment facts
//! - History: Derived queries over a partition's records
//! - Service: Per-service descriptors

pub mod history;
pub mod record;
pub mod service;
pub mod version;

// Re-export commonly used types
pub use history::DeploymentHistory;
pub use record::{Action, DeploymentRecord, Outcome};
pub use service::{
    validate_name, DescriptorError, ResourceLimits, ScalingBounds, ServiceDescriptor,
};
pub use version::{ArtifactRef, Endpoint, VersionId};
