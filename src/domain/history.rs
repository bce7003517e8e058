//! Deployment history for one (service, environment) partition.
//!
//! Current state is never stored: it is derived from the ordered records,
//! the same way a run is reconstructed by replaying its events.

use serde::{Deserialize, Serialize};

use super::record::{DeploymentRecord, Outcome};
use super::version::VersionId;

/// Ordered records of a single partition, oldest first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentHistory {
    pub records: Vec<DeploymentRecord>,
}

impl DeploymentHistory {
    pub fn new(records: Vec<DeploymentRecord>) -> Self {
        Self { records }
    }

    /// Latest record whose outcome is succeeded or rolled_back
    pub fn current(&self) -> Option<&DeploymentRecord> {
        self.records.iter().rev().find(|r| r.is_live())
    }

    /// Version of the current live record
    pub fn current_version(&self) -> Option<&VersionId> {
        self.current().map(|r| &r.version)
    }

    /// Most recent succeeded record for a version (rollback precondition)
    pub fn find_succeeded(&self, version: &VersionId) -> Option<&DeploymentRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.outcome == Outcome::Succeeded && &r.version == version)
    }

    /// Distinct versions that can be rolled back to, newest first
    pub fn succeeded_versions(&self) -> Vec<VersionId> {
        let mut versions: Vec<VersionId> = Vec::new();
        for record in self.records.iter().rev() {
            if record.outcome == Outcome::Succeeded && !versions.contains(&record.version) {
                versions.push(record.version.clone());
            }
        }
        versions
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
