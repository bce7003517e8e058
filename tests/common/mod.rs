//! Shared fakes for the integration tests.
//!
//! The fakes stand in for the remote platform and count every call so tests
//! can assert what a deployment did and did not touch.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use shipyard::adapters::{
    ArtifactStore, ArtifactSummary, BuildHandle, BuildService, BuildSpec, BuildStatus, ComputeRuntime,
    RolloutHandle, RolloutStatus, RuntimeConfig, TargetDescription, TargetSummary,
};
use shipyard::core::{
    BatchCoordinator, BuildCoordinator, DeployError, DeployResult, Fingerprinter, HistoryStore,
    MemoryHistoryStore, Orchestrator, PartitionKey, PollPolicy, RuntimeController,
    ServiceCatalog,
};
use shipyard::domain::{ArtifactRef, DeploymentHistory, DeploymentRecord, Endpoint, ServiceDescriptor, VersionId};

/// Millisecond polling so tests finish quickly
pub fn fast_policy(timeout_ms: u64) -> PollPolicy {
    PollPolicy {
        initial_interval_ms: 1,
        max_interval_ms: 5,
        backoff_multiplier: 2.0,
        timeout_ms,
    }
}

// ============================================================================
// Build service
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildBehavior {
    Succeed,
    Fail(String),
    /// Stays pending forever
    Hang,
}

/// Build service whose builds succeed after a couple of polls
pub struct FakeBuildService {
    behaviors: Mutex<HashMap<String, BuildBehavior>>,
    builds: Mutex<HashMap<BuildHandle, (BuildSpec, usize)>>,
    submissions: AtomicUsize,
}

impl FakeBuildService {
    pub fn new() -> Self {
        Self {
            behaviors: Mutex::new(HashMap::new()),
            builds: Mutex::new(HashMap::new()),
            submissions: AtomicUsize::new(0),
        }
    }

    pub fn set_behavior(&self, service: &str, behavior: BuildBehavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(service.to_string(), behavior);
    }

    /// Number of builds submitted so far
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildService for FakeBuildService {
    fn name(&self) -> &str {
        "fake-build"
    }

    async fn submit(&self, spec: &BuildSpec) -> Result<BuildHandle> {
        let n = self.submissions.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = BuildHandle::new(format!("build-{}", n));
        self.builds
            .lock()
            .unwrap()
            .insert(handle.clone(), (spec.clone(), 0));
        Ok(handle)
    }

    async fn status(&self, handle: &BuildHandle) -> Result<BuildStatus> {
        let mut builds = self.builds.lock().unwrap();
        let (spec, polls) = builds
            .get_mut(handle)
            .ok_or_else(|| anyhow!("unknown build {}", handle))?;
        *polls += 1;

        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&spec.service)
            .cloned()
            .unwrap_or(BuildBehavior::Succeed);

        Ok(match behavior {
            BuildBehavior::Hang => BuildStatus::Pending,
            _ if *polls < 2 => BuildStatus::Pending,
            BuildBehavior::Succeed => BuildStatus::Succeeded {
                artifact: ArtifactRef::new(format!("registry/{}:{}", spec.service, spec.version)),
            },
            BuildBehavior::Fail(reason) => BuildStatus::Failed { reason },
        })
    }
}

// ============================================================================
// Artifact store
// ============================================================================

#[derive(Default)]
pub struct FakeArtifactStore {
    artifacts: Mutex<HashMap<(String, VersionId), ArtifactRef>>,
    lookups: AtomicUsize,
}

impl FakeArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn contains(&self, service: &str, version: &VersionId) -> bool {
        self.artifacts
            .lock()
            .unwrap()
            .contains_key(&(service.to_string(), version.clone()))
    }
}

#[async_trait]
impl ArtifactStore for FakeArtifactStore {
    async fn exists(&self, service: &str, version: &VersionId) -> Result<Option<ArtifactRef>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .artifacts
            .lock()
            .unwrap()
            .get(&(service.to_string(), version.clone()))
            .cloned())
    }

    async fn record(&self, service: &str, version: &VersionId, artifact: &ArtifactRef) -> Result<()> {
        self.artifacts
            .lock()
            .unwrap()
            .insert((service.to_string(), version.clone()), artifact.clone());
        Ok(())
    }

    async fn list(&self, service: Option<&str>) -> Result<Vec<ArtifactSummary>> {
        let mut artifacts: Vec<ArtifactSummary> = self
            .artifacts
            .lock()
            .unwrap()
            .iter()
            .filter(|((svc, _), _)| service.map_or(true, |s| s == svc.as_str()))
            .map(|((svc, version), artifact)| ArtifactSummary {
                service: svc.clone(),
                version: version.clone(),
                artifact: artifact.clone(),
                created_at: None,
            })
            .collect();
        artifacts.sort_by(|a, b| (&a.service, &a.version).cmp(&(&b.service, &b.version)));
        Ok(artifacts)
    }
}

// ============================================================================
// Compute runtime
// ============================================================================

struct Rollout {
    service: String,
    environment: String,
    artifact: ArtifactRef,
    polls: usize,
    finished: bool,
}

/// Runtime that becomes ready after a few polls and tracks concurrency
#[derive(Default)]
pub struct FakeRuntime {
    targets: Mutex<HashMap<(String, String), TargetDescription>>,
    rollouts: Mutex<HashMap<RolloutHandle, Rollout>>,
    configs: Mutex<Vec<RuntimeConfig>>,
    upsert_order: Mutex<Vec<String>>,
    fail_services: Mutex<HashSet<String>>,
    hang_services: Mutex<HashSet<String>>,
    stall_services: Mutex<HashSet<String>>,
    blind_services: Mutex<HashSet<String>>,
    upserts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rollouts of `service` are rejected by the platform
    pub fn fail(&self, service: &str) {
        self.fail_services.lock().unwrap().insert(service.to_string());
    }

    pub fn recover(&self, service: &str) {
        self.fail_services.lock().unwrap().remove(service);
    }

    /// Rollouts of `service` never become ready
    pub fn hang(&self, service: &str) {
        self.hang_services.lock().unwrap().insert(service.to_string());
    }

    /// Status calls for `service` never return
    pub fn stall(&self, service: &str) {
        self.stall_services.lock().unwrap().insert(service.to_string());
    }

    /// `describe` for `service` errors even though rollouts go live
    pub fn blind(&self, service: &str) {
        self.blind_services.lock().unwrap().insert(service.to_string());
    }

    pub fn upserts(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    /// Services in the order their rollouts were started
    pub fn upsert_order(&self) -> Vec<String> {
        self.upsert_order.lock().unwrap().clone()
    }

    /// Highest number of rollouts that were in flight at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn target(&self, service: &str, environment: &str) -> Option<TargetDescription> {
        self.targets
            .lock()
            .unwrap()
            .get(&(service.to_string(), environment.to_string()))
            .cloned()
    }

    pub fn last_config(&self) -> Option<RuntimeConfig> {
        self.configs.lock().unwrap().last().cloned()
    }

    fn finish(&self, rollout: &mut Rollout) {
        if !rollout.finished {
            rollout.finished = true;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

pub fn endpoint_for(service: &str, environment: &str) -> Endpoint {
    Endpoint::new(format!("https://{}-{}.example", service, environment))
}

#[async_trait]
impl ComputeRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake-runtime"
    }

    async fn describe(
        &self,
        service: &str,
        environment: &str,
    ) -> Result<Option<TargetDescription>> {
        if self.blind_services.lock().unwrap().contains(service) {
            return Err(anyhow!("503 service unavailable"));
        }
        Ok(self.target(service, environment))
    }

    async fn upsert(
        &self,
        service: &str,
        environment: &str,
        artifact: &ArtifactRef,
        config: &RuntimeConfig,
    ) -> Result<RolloutHandle> {
        let n = self.upserts.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = RolloutHandle::new(format!("rollout-{}", n));

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        self.configs.lock().unwrap().push(config.clone());
        self.upsert_order.lock().unwrap().push(service.to_string());
        self.rollouts.lock().unwrap().insert(
            handle.clone(),
            Rollout {
                service: service.to_string(),
                environment: environment.to_string(),
                artifact: artifact.clone(),
                polls: 0,
                finished: false,
            },
        );

        Ok(handle)
    }

    async fn status(&self, handle: &RolloutHandle) -> Result<RolloutStatus> {
        let stalled = self
            .rollouts
            .lock()
            .unwrap()
            .get(handle)
            .is_some_and(|r| self.stall_services.lock().unwrap().contains(&r.service));
        if stalled {
            std::future::pending::<()>().await;
        }

        let mut rollouts = self.rollouts.lock().unwrap();
        let rollout = rollouts
            .get_mut(handle)
            .ok_or_else(|| anyhow!("unknown rollout {}", handle))?;
        rollout.polls += 1;

        if self.hang_services.lock().unwrap().contains(&rollout.service) || rollout.polls < 3 {
            return Ok(RolloutStatus::Pending);
        }

        self.finish(rollout);

        if self.fail_services.lock().unwrap().contains(&rollout.service) {
            return Ok(RolloutStatus::Failed {
                reason: format!("{} crashed on startup", rollout.service),
            });
        }

        self.targets.lock().unwrap().insert(
            (rollout.service.clone(), rollout.environment.clone()),
            TargetDescription {
                artifact: rollout.artifact.clone(),
                endpoint: endpoint_for(&rollout.service, &rollout.environment),
            },
        );

        Ok(RolloutStatus::Ready)
    }

    async fn list(&self, environment: Option<&str>) -> Result<Vec<TargetSummary>> {
        let mut targets: Vec<TargetSummary> = self
            .targets
            .lock()
            .unwrap()
            .iter()
            .filter(|((_, env), _)| environment.map_or(true, |e| e == env.as_str()))
            .map(|((service, env), target)| TargetSummary {
                service: service.clone(),
                environment: env.clone(),
                artifact: target.artifact.clone(),
                endpoint: target.endpoint.clone(),
                updated_at: None,
            })
            .collect();
        targets.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(targets)
    }
}

// ============================================================================
// History store that cannot append
// ============================================================================

/// Reads work, appends fail
pub struct ReadOnlyHistory {
    inner: MemoryHistoryStore,
}

impl ReadOnlyHistory {
    pub fn new() -> Self {
        Self {
            inner: MemoryHistoryStore::new(),
        }
    }
}

#[async_trait]
impl HistoryStore for ReadOnlyHistory {
    async fn append(&self, _record: &DeploymentRecord) -> DeployResult<()> {
        Err(DeployError::store("disk full"))
    }

    async fn history(&self, service: &str, environment: &str) -> DeployResult<DeploymentHistory> {
        self.inner.history(service, environment).await
    }

    async fn partitions(&self) -> DeployResult<Vec<PartitionKey>> {
        self.inner.partitions().await
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Orchestrator wired to fakes, with a services directory in a temp dir
pub struct Harness {
    pub temp: TempDir,
    pub builds: Arc<FakeBuildService>,
    pub artifacts: Arc<FakeArtifactStore>,
    pub runtime: Arc<FakeRuntime>,
    pub history: Arc<dyn HistoryStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub catalog: Arc<ServiceCatalog>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_history(Arc::new(MemoryHistoryStore::new()))
    }

    pub fn with_history(history: Arc<dyn HistoryStore>) -> Self {
        Self::build(history, fast_policy(2_000), fast_policy(2_000))
    }

    pub fn with_timeouts(build_timeout_ms: u64, rollout_timeout_ms: u64) -> Self {
        Self::build(
            Arc::new(MemoryHistoryStore::new()),
            fast_policy(build_timeout_ms),
            fast_policy(rollout_timeout_ms),
        )
    }

    fn build(history: Arc<dyn HistoryStore>, build: PollPolicy, rollout: PollPolicy) -> Self {
        let temp = TempDir::new().unwrap();
        let builds = Arc::new(FakeBuildService::new());
        let artifacts = Arc::new(FakeArtifactStore::new());
        let runtime = Arc::new(FakeRuntime::new());

        let orchestrator = Orchestrator::new(
            Arc::clone(&history),
            BuildCoordinator::new(
                Arc::clone(&builds) as Arc<dyn BuildService>,
                Arc::clone(&artifacts) as Arc<dyn ArtifactStore>,
                build,
            ),
            RuntimeController::new(Arc::clone(&runtime) as Arc<dyn ComputeRuntime>, rollout),
            Fingerprinter::default(),
        )
        .with_deployed_by(Some("ci".to_string()));

        let catalog = Arc::new(ServiceCatalog::new(temp.path().join("services")));

        Self {
            temp,
            builds,
            artifacts,
            runtime,
            history,
            orchestrator: Arc::new(orchestrator),
            catalog,
        }
    }

    pub fn services_dir(&self) -> PathBuf {
        self.temp.path().join("services")
    }

    /// Create or overwrite a service's source and return its descriptor
    pub fn write_service(&self, name: &str, source: &str) -> ServiceDescriptor {
        let dir = self.services_dir().join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("main.py"), source).unwrap();
        ServiceDescriptor::new(name, dir)
    }

    pub fn batch(&self) -> BatchCoordinator {
        BatchCoordinator::new(Arc::clone(&self.orchestrator), Arc::clone(&self.catalog))
    }

    pub async fn records(&self, service: &str, environment: &str) -> Vec<DeploymentRecord> {
        self.history
            .history(service, environment)
            .await
            .unwrap()
            .records
    }

    pub async fn current_version(&self, service: &str, environment: &str) -> Option<VersionId> {
        self.history
            .current_version(service, environment)
            .await
            .unwrap()
    }
}

/// Write `files` (relative path, content) below `root`
pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let path = root.join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}
