//! Runtime controller.
//!
//! Points a compute target at an artifact and waits until the new revision
//! serves traffic. The previous revision is never removed here; if a rollout
//! fails the runtime keeps serving whatever it served before.

use std::sync::Arc;

use tracing::{info, instrument};

use super::error::{DeployError, DeployResult};
use super::poll::{PollError, PollPolicy, PollStatus};
use crate::adapters::{ComputeRuntime, RolloutStatus, RuntimeConfig};
use crate::domain::{ArtifactRef, Endpoint, ServiceDescriptor};

pub struct RuntimeController {
    runtime: Arc<dyn ComputeRuntime>,
    policy: PollPolicy,
}

impl RuntimeController {
    pub fn new(runtime: Arc<dyn ComputeRuntime>, policy: PollPolicy) -> Self {
        Self { runtime, policy }
    }

    pub fn runtime(&self) -> &Arc<dyn ComputeRuntime> {
        &self.runtime
    }

    /// Artifact the live target is running, if the target exists
    pub async fn current_artifact(
        &self,
        service: &str,
        environment: &str,
    ) -> DeployResult<Option<ArtifactRef>> {
        self.runtime
            .describe(service, environment)
            .await
            .map(|target| target.map(|t| t.artifact))
            .map_err(|e| DeployError::RolloutFailed {
                reason: format!("describe failed: {:#}", e),
            })
    }

    /// Create or update the target and wait for it to serve `artifact`
    #[instrument(skip(self, descriptor), fields(service = %descriptor.name, artifact = %artifact))]
    pub async fn apply(
        &self,
        descriptor: &ServiceDescriptor,
        environment: &str,
        artifact: &ArtifactRef,
    ) -> DeployResult<Endpoint> {
        let service = descriptor.name.as_str();
        let config = RuntimeConfig::from_descriptor(descriptor, environment);

        let handle = self
            .runtime
            .upsert(service, environment, artifact, &config)
            .await
            .map_err(|e| DeployError::RolloutFailed {
                reason: format!("{} rejected the update: {:#}", self.runtime.name(), e),
            })?;

        info!(%handle, runtime = self.runtime.name(), "Rollout started");

        let result = self
            .policy
            .poll_until(|| {
                let runtime = Arc::clone(&self.runtime);
                let handle = handle.clone();
                async move {
                    match runtime.status(&handle).await {
                        Ok(RolloutStatus::Pending) => Ok(PollStatus::Pending),
                        Ok(RolloutStatus::Ready) => Ok(PollStatus::Done(())),
                        Ok(RolloutStatus::Failed { reason }) => Err(reason),
                        Err(e) => Err(format!("status check failed: {:#}", e)),
                    }
                }
            })
            .await;

        match result {
            Ok(()) => {}
            Err(PollError::Failed(reason)) => return Err(DeployError::RolloutFailed { reason }),
            Err(PollError::TimedOut { waited_ms, .. }) => {
                return Err(DeployError::RolloutTimedOut { handle, waited_ms });
            }
        }

        // Confirm the target actually serves what was requested
        let target = self
            .runtime
            .describe(service, environment)
            .await
            .map_err(|e| DeployError::RolloutUnconfirmed {
                handle: handle.clone(),
                reason: format!("describe failed: {:#}", e),
            })?
            .ok_or_else(|| DeployError::RolloutFailed {
                reason: format!("target {}/{} missing after rollout", service, environment),
            })?;

        if &target.artifact != artifact {
            return Err(DeployError::RolloutFailed {
                reason: format!(
                    "target {}/{} serves {} instead of {}",
                    service, environment, target.artifact, artifact
                ),
            });
        }

        info!(endpoint = %target.endpoint, "Rollout ready");
        Ok(target.endpoint)
    }
}
