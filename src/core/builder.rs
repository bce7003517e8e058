//! Build coordinator.
//!
//! Turns a (service, version) into an artifact: reuse the stored artifact when
//! one exists, otherwise submit a build and wait for it with bounded backoff.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::error::{DeployError, DeployResult};
use super::poll::{PollError, PollPolicy, PollStatus};
use crate::adapters::{ArtifactStore, BuildService, BuildSpec, BuildStatus};
use crate::domain::{ArtifactRef, ServiceDescriptor, VersionId};

pub struct BuildCoordinator {
    service: Arc<dyn BuildService>,
    artifacts: Arc<dyn ArtifactStore>,
    policy: PollPolicy,
}

impl BuildCoordinator {
    pub fn new(
        service: Arc<dyn BuildService>,
        artifacts: Arc<dyn ArtifactStore>,
        policy: PollPolicy,
    ) -> Self {
        Self {
            service,
            artifacts,
            policy,
        }
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Produce the artifact for `version` of the descriptor's service.
    ///
    /// Concurrent calls for the same version do not block each other; a
    /// second caller either builds too or finds the first caller's artifact.
    #[instrument(skip(self, descriptor), fields(service = %descriptor.name, version = %version))]
    pub async fn build(
        &self,
        descriptor: &ServiceDescriptor,
        version: &VersionId,
    ) -> DeployResult<ArtifactRef> {
        match self.artifacts.exists(&descriptor.name, version).await {
            Ok(Some(artifact)) => {
                info!(%artifact, "Artifact already built, skipping build");
                return Ok(artifact);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Artifact lookup failed, building anyway"),
        }

        let spec = BuildSpec {
            service: descriptor.name.clone(),
            version: version.clone(),
            source: descriptor.source.clone(),
        };

        let handle = self
            .service
            .submit(&spec)
            .await
            .map_err(|e| DeployError::BuildFailed {
                reason: format!("{} rejected the build: {:#}", self.service.name(), e),
                handle: None,
            })?;

        info!(%handle, builder = self.service.name(), "Build submitted");

        let result = self
            .policy
            .poll_until(|| {
                let service = Arc::clone(&self.service);
                let handle = handle.clone();
                async move {
                    match service.status(&handle).await {
                        Ok(BuildStatus::Pending) => Ok(PollStatus::Pending),
                        Ok(BuildStatus::Succeeded { artifact }) => Ok(PollStatus::Done(artifact)),
                        Ok(BuildStatus::Failed { reason }) => Err(reason),
                        Err(e) => Err(format!("status check failed: {:#}", e)),
                    }
                }
            })
            .await;

        let artifact = match result {
            Ok(artifact) => artifact,
            Err(PollError::Failed(reason)) => {
                return Err(DeployError::BuildFailed {
                    reason,
                    handle: Some(handle),
                });
            }
            Err(PollError::TimedOut { waited_ms, .. }) => {
                // The remote build is left running
                return Err(DeployError::BuildTimedOut { handle, waited_ms });
            }
        };

        info!(%artifact, "Build succeeded");

        if let Err(e) = self
            .artifacts
            .record(&descriptor.name, version, &artifact)
            .await
        {
            warn!(error = %e, "Failed to index built artifact");
        }

        Ok(artifact)
    }
}
