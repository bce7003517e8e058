//! Deployment orchestrator for a single service.
//!
//! Drives one deployment through
//! `Idle -> ComputingVersion -> CheckingSkip -> Building -> RollingOut -> Recording -> Done`.
//! Any step after the version is known can fail; a failure names the step
//! it happened in. Only successful rollouts are ever recorded.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, instrument, Span};

use super::builder::BuildCoordinator;
use super::error::{DeployError, DeployResult};
use super::fingerprint::Fingerprinter;
use super::history::HistoryStore;
use super::runtime::RuntimeController;
use crate::domain::{
    validate_name, Action, ArtifactRef, DeploymentRecord, Endpoint, Outcome, ServiceDescriptor,
    VersionId,
};

/// Step of the deployment state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStage {
    Idle,
    ComputingVersion,
    CheckingSkip,
    /// Rollback only: looking up the target version in history
    ResolvingVersion,
    Building,
    RollingOut,
    Recording,
    Done,
}

impl DeployStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ComputingVersion => "computing_version",
            Self::CheckingSkip => "checking_skip",
            Self::ResolvingVersion => "resolving_version",
            Self::Building => "building",
            Self::RollingOut => "rolling_out",
            Self::Recording => "recording",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for DeployStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure together with the step it occurred in
#[derive(Debug, Clone, Error)]
#[error("{stage}: {error}")]
pub struct DeployFailure {
    pub stage: DeployStage,
    #[source]
    pub error: DeployError,
}

impl DeployFailure {
    pub fn new(stage: DeployStage, error: DeployError) -> Self {
        Self { stage, error }
    }

    pub fn kind(&self) -> &'static str {
        self.error.kind()
    }
}

fn at(stage: DeployStage) -> impl FnOnce(DeployError) -> DeployFailure {
    move |error| DeployFailure::new(stage, error)
}

/// What a successful call did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Deployed,
    /// Source unchanged since the live version; nothing was built or rolled out
    Skipped,
    RolledBack,
}

impl DeployStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deployed => "deployed",
            Self::Skipped => "skipped",
            Self::RolledBack => "rolled_back",
        }
    }
}

/// Result of a `deploy` or `rollback` that reached `Done`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeployOutcome {
    pub service: String,
    pub environment: String,
    pub version: VersionId,
    pub artifact: ArtifactRef,
    pub endpoint: Option<Endpoint>,
    pub status: DeployStatus,
}

impl DeployOutcome {
    fn from_record(record: &DeploymentRecord, status: DeployStatus) -> Self {
        Self {
            service: record.service.clone(),
            environment: record.environment.clone(),
            version: record.version.clone(),
            artifact: record.artifact.clone(),
            endpoint: record.endpoint.clone(),
            status,
        }
    }
}

/// Live version of one (service, environment)
#[derive(Debug, Clone, Serialize)]
pub struct LiveStatus {
    pub service: String,
    pub environment: String,
    /// Record that made the live version current; none if never deployed
    pub current: Option<DeploymentRecord>,
}

/// Deployment state machine over the history store and the two coordinators
pub struct Orchestrator {
    history: Arc<dyn HistoryStore>,
    builder: BuildCoordinator,
    runtime: RuntimeController,
    fingerprinter: Fingerprinter,
    deployed_by: Option<String>,
}

impl Orchestrator {
    pub fn new(
        history: Arc<dyn HistoryStore>,
        builder: BuildCoordinator,
        runtime: RuntimeController,
        fingerprinter: Fingerprinter,
    ) -> Self {
        Self {
            history,
            builder,
            runtime,
            fingerprinter,
            deployed_by: None,
        }
    }

    /// Operator name stamped on every record this orchestrator appends
    pub fn with_deployed_by(mut self, deployed_by: Option<String>) -> Self {
        self.deployed_by = deployed_by;
        self
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn runtime(&self) -> &RuntimeController {
        &self.runtime
    }

    /// Deploy the descriptor's current source to `environment`.
    ///
    /// Unless `force` is set, a source tree whose version is already live
    /// returns [`DeployStatus::Skipped`] without building, rolling out or
    /// recording anything.
    #[instrument(
        skip(self, descriptor),
        fields(service = %descriptor.name, version = tracing::field::Empty)
    )]
    pub async fn deploy(
        &self,
        descriptor: &ServiceDescriptor,
        environment: &str,
        force: bool,
    ) -> Result<DeployOutcome, DeployFailure> {
        let result = self.run_deploy(descriptor, environment, force).await;
        log_result(&result);
        result
    }

    async fn run_deploy(
        &self,
        descriptor: &ServiceDescriptor,
        environment: &str,
        force: bool,
    ) -> Result<DeployOutcome, DeployFailure> {
        let started = Instant::now();
        let service = descriptor.name.as_str();

        validate_name(environment).map_err(|e| DeployFailure::new(DeployStage::Idle, e.into()))?;

        info!(stage = %DeployStage::ComputingVersion, "Computing version");
        let version = self
            .fingerprinter
            .compute(&descriptor.source)
            .await
            .map_err(at(DeployStage::ComputingVersion))?;
        Span::current().record("version", version.as_str());

        if !force {
            info!(stage = %DeployStage::CheckingSkip, "Checking live version");
            let current = self
                .history
                .current(service, environment)
                .await
                .map_err(at(DeployStage::CheckingSkip))?;

            if let Some(current) = current.filter(|r| r.version == version) {
                info!("Version already live, skipping");
                return Ok(DeployOutcome::from_record(&current, DeployStatus::Skipped));
            }
        }

        info!(stage = %DeployStage::Building, "Building");
        let artifact = self
            .builder
            .build(descriptor, &version)
            .await
            .map_err(at(DeployStage::Building))?;

        info!(stage = %DeployStage::RollingOut, "Rolling out");
        let endpoint = self
            .runtime
            .apply(descriptor, environment, &artifact)
            .await
            .map_err(at(DeployStage::RollingOut))?;

        let record = DeploymentRecord::new(
            service,
            environment,
            version,
            artifact,
            Outcome::Succeeded,
            Action::Deploy,
        )
        .with_endpoint(endpoint.clone())
        .with_deployed_by(self.deployed_by.clone())
        .with_duration(started.elapsed().as_millis() as u64);

        self.record(&record, endpoint).await?;

        Ok(DeployOutcome::from_record(&record, DeployStatus::Deployed))
    }

    /// Point the target back at the artifact of a previously succeeded version.
    ///
    /// Never builds. On failure the live system and the history are left as
    /// they were.
    #[instrument(skip(self, descriptor), fields(service = %descriptor.name, version = %version))]
    pub async fn rollback(
        &self,
        descriptor: &ServiceDescriptor,
        environment: &str,
        version: &VersionId,
    ) -> Result<DeployOutcome, DeployFailure> {
        let result = self.run_rollback(descriptor, environment, version).await;
        log_result(&result);
        result
    }

    async fn run_rollback(
        &self,
        descriptor: &ServiceDescriptor,
        environment: &str,
        version: &VersionId,
    ) -> Result<DeployOutcome, DeployFailure> {
        let started = Instant::now();
        let service = descriptor.name.as_str();

        validate_name(environment).map_err(|e| DeployFailure::new(DeployStage::Idle, e.into()))?;

        info!(stage = %DeployStage::ResolvingVersion, "Looking up rollback target");
        let target = self
            .history
            .find_succeeded(service, environment, version)
            .await
            .map_err(at(DeployStage::ResolvingVersion))?;

        info!(stage = %DeployStage::RollingOut, artifact = %target.artifact, "Rolling back");
        let endpoint = self
            .runtime
            .apply(descriptor, environment, &target.artifact)
            .await
            .map_err(at(DeployStage::RollingOut))?;

        let record = DeploymentRecord::new(
            service,
            environment,
            target.version,
            target.artifact,
            Outcome::RolledBack,
            Action::Rollback,
        )
        .with_endpoint(endpoint.clone())
        .with_deployed_by(self.deployed_by.clone())
        .with_duration(started.elapsed().as_millis() as u64);

        self.record(&record, endpoint).await?;

        Ok(DeployOutcome::from_record(&record, DeployStatus::RolledBack))
    }

    /// Append a record for a rollout that already happened.
    ///
    /// Not retried: a retried append could duplicate history.
    async fn record(
        &self,
        record: &DeploymentRecord,
        endpoint: Endpoint,
    ) -> Result<(), DeployFailure> {
        info!(stage = %DeployStage::Recording, outcome = record.outcome.as_str(), "Recording");

        self.history.append(record).await.map_err(|e| {
            DeployFailure::new(
                DeployStage::Recording,
                DeployError::RecordingFailed {
                    version: record.version.clone(),
                    artifact: record.artifact.clone(),
                    endpoint,
                    reason: e.to_string(),
                },
            )
        })
    }

    /// Every record, optionally for one service, oldest first.
    ///
    /// Each partition keeps its append order; partitions are interleaved by
    /// timestamp.
    pub async fn list(&self, service: Option<&str>) -> DeployResult<Vec<DeploymentRecord>> {
        let mut partitions = Vec::new();

        for (svc, environment) in self.history.partitions().await? {
            if service.is_some_and(|s| s != svc) {
                continue;
            }
            partitions.push(self.history.history(&svc, &environment).await?.records);
        }

        Ok(merge_partitions(partitions))
    }

    /// Live version per (service, environment).
    ///
    /// Covers `services` and `environments` plus every pair the history
    /// knows about, services sorted by name.
    pub async fn status(
        &self,
        services: &[String],
        environments: &[String],
    ) -> DeployResult<Vec<LiveStatus>> {
        let partitions = self.history.partitions().await?;

        let mut all_services: BTreeSet<String> = services.iter().cloned().collect();
        let mut all_environments: Vec<String> = environments.to_vec();
        for (service, environment) in &partitions {
            all_services.insert(service.clone());
            if !all_environments.contains(environment) {
                all_environments.push(environment.clone());
            }
        }

        let mut statuses = Vec::new();
        for service in &all_services {
            for environment in &all_environments {
                let current = if partitions.contains(&(service.clone(), environment.clone())) {
                    self.history.current(service, environment).await?
                } else {
                    None
                };
                statuses.push(LiveStatus {
                    service: service.clone(),
                    environment: environment.clone(),
                    current,
                });
            }
        }

        Ok(statuses)
    }
}

/// Interleave per-partition logs by the timestamp of each partition's next
/// record, never reordering records within a partition.
fn merge_partitions(partitions: Vec<Vec<DeploymentRecord>>) -> Vec<DeploymentRecord> {
    let total = partitions.iter().map(Vec::len).sum();
    let mut queues: Vec<_> = partitions
        .into_iter()
        .map(|records| records.into_iter().peekable())
        .collect();
    let mut merged = Vec::with_capacity(total);

    loop {
        let next = queues
            .iter_mut()
            .enumerate()
            .filter_map(|(i, queue)| queue.peek().map(|r| (r.timestamp, i)))
            .min();

        match next.and_then(|(_, i)| queues[i].next()) {
            Some(record) => merged.push(record),
            None => return merged,
        }
    }
}

fn log_result(result: &Result<DeployOutcome, DeployFailure>) {
    match result {
        Ok(outcome) => info!(
            status = outcome.status.as_str(),
            version = %outcome.version,
            artifact = %outcome.artifact,
            "Deployment finished"
        ),
        Err(failure) => error!(
            stage = %failure.stage,
            kind = failure.kind(),
            ambiguous = failure.error.is_ambiguous(),
            error = %failure.error,
            "Deployment failed"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_names_stage_and_kind() {
        let failure = DeployFailure::new(
            DeployStage::RollingOut,
            DeployError::RolloutFailed {
                reason: "quota exceeded".to_string(),
            },
        );

        assert_eq!(failure.kind(), "rollout_failed");
        assert_eq!(failure.to_string(), "rolling_out: rollout failed: quota exceeded");
    }

    fn record_at(environment: &str, version: &str, seconds: i64) -> DeploymentRecord {
        let mut record = DeploymentRecord::new(
            "orders",
            environment,
            VersionId::new(version),
            ArtifactRef::new(format!("registry/orders:{}", version)),
            Outcome::Succeeded,
            Action::Deploy,
        );
        record.timestamp = chrono::DateTime::from_timestamp(1_700_000_000 + seconds, 0)
            .unwrap();
        record
    }

    #[test]
    fn test_merge_keeps_append_order_within_partition() {
        // v2 was stamped before v1 but appended after it
        let production = vec![record_at("production", "v1", 5), record_at("production", "v2", 3)];
        let staging = vec![record_at("staging", "s1", 1), record_at("staging", "s2", 6)];

        let merged = merge_partitions(vec![production, staging]);
        let order: Vec<&str> = merged.iter().map(|r| r.version.as_str()).collect();

        assert_eq!(order, vec!["s1", "v1", "v2", "s2"]);
    }

    #[test]
    fn test_merge_of_nothing_is_empty() {
        assert!(merge_partitions(Vec::new()).is_empty());
        assert!(merge_partitions(vec![Vec::new(), Vec::new()]).is_empty());
    }

    #[test]
    fn test_stage_serializes_snake_case() {
        let json = serde_json::to_string(&DeployStage::ComputingVersion).unwrap();
        assert_eq!(json, "\"computing_version\"");
        assert_eq!(DeployStatus::RolledBack.as_str(), "rolled_back");
    }
}
