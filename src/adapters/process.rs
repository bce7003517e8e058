//! Subprocess-backed build service and compute runtime.
//!
//! Both run a configured shell command (`sh -c`) in the background and
//! report on it through the same submit/status contract a remote platform
//! would offer. The last non-empty stdout line is the result: an artifact
//! reference for builds, an endpoint for rollouts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    BuildHandle, BuildService, BuildSpec, BuildStatus, ComputeRuntime, RolloutHandle,
    RolloutStatus, RuntimeConfig, TargetDescription, TargetSummary,
};
use crate::domain::{ArtifactRef, Endpoint};

/// Build service that runs a shell command per build
pub struct ProcessBuildService {
    command: String,
    builds: Arc<Mutex<HashMap<BuildHandle, BuildStatus>>>,
}

impl ProcessBuildService {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            builds: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl BuildService for ProcessBuildService {
    fn name(&self) -> &str {
        "process"
    }

    async fn submit(&self, spec: &BuildSpec) -> Result<BuildHandle> {
        let handle = BuildHandle::new(format!("build-{}", Uuid::new_v4().simple()));

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&spec.source)
            .env("SHIPYARD_SERVICE", &spec.service)
            .env("SHIPYARD_VERSION", spec.version.as_str())
            .env("SHIPYARD_SOURCE", &spec.source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn build command for '{}'", spec.service))?;

        lock(&self.builds)?.insert(handle.clone(), BuildStatus::Pending);
        debug!(%handle, service = %spec.service, "build process started");

        let builds = Arc::clone(&self.builds);
        let task_handle = handle.clone();
        tokio::spawn(async move {
            let status = match child.wait_with_output().await {
                Ok(output) => match last_stdout_line(&output) {
                    Ok(line) => BuildStatus::Succeeded {
                        artifact: ArtifactRef::new(line),
                    },
                    Err(reason) => BuildStatus::Failed { reason },
                },
                Err(e) => BuildStatus::Failed {
                    reason: format!("failed to wait for build process: {}", e),
                },
            };

            match builds.lock() {
                Ok(mut builds) => {
                    builds.insert(task_handle, status);
                }
                Err(_) => warn!(handle = %task_handle, "build table poisoned, result dropped"),
            }
        });

        Ok(handle)
    }

    /// A terminal status is reported once, then the handle is forgotten
    async fn status(&self, handle: &BuildHandle) -> Result<BuildStatus> {
        let mut builds = lock(&self.builds)?;
        let status = builds
            .get(handle)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown build handle: {}", handle))?;

        if status != BuildStatus::Pending {
            builds.remove(handle);
        }
        Ok(status)
    }
}

/// Persisted state of a target managed by [`ProcessRuntime`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TargetState {
    service: String,
    environment: String,
    artifact: ArtifactRef,
    endpoint: Endpoint,
    updated_at: DateTime<Utc>,
}

/// Compute runtime that runs a deploy command and keeps target state on disk
///
/// State lives at `<state_dir>/<environment>/<service>.json` and is only
/// replaced once the deploy command has succeeded.
pub struct ProcessRuntime {
    command: String,
    state_dir: PathBuf,
    rollouts: Arc<Mutex<HashMap<RolloutHandle, RolloutStatus>>>,
}

impl ProcessRuntime {
    pub fn new(command: impl Into<String>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            state_dir: state_dir.into(),
            rollouts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn state_path(state_dir: &Path, service: &str, environment: &str) -> PathBuf {
        state_dir.join(environment).join(format!("{}.json", service))
    }

    async fn read_state(path: &Path) -> Result<Option<TargetState>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read target state: {}", path.display()))?;
        let state = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse target state: {}", path.display()))?;

        Ok(Some(state))
    }

    async fn write_state(state_dir: &Path, state: &TargetState) -> Result<()> {
        let dir = state_dir.join(&state.environment);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))?;

        let path = Self::state_path(state_dir, &state.service, &state.environment);
        let tmp = dir.join(format!(".{}.json.tmp", state.service));
        let json = serde_json::to_string_pretty(state).context("Failed to serialize target state")?;

        fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write target state: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to commit target state: {}", path.display()))?;

        Ok(())
    }
}

#[async_trait]
impl ComputeRuntime for ProcessRuntime {
    fn name(&self) -> &str {
        "process"
    }

    async fn describe(
        &self,
        service: &str,
        environment: &str,
    ) -> Result<Option<TargetDescription>> {
        let path = Self::state_path(&self.state_dir, service, environment);
        Ok(Self::read_state(&path).await?.map(|state| TargetDescription {
            artifact: state.artifact,
            endpoint: state.endpoint,
        }))
    }

    async fn upsert(
        &self,
        service: &str,
        environment: &str,
        artifact: &ArtifactRef,
        config: &RuntimeConfig,
    ) -> Result<RolloutHandle> {
        let handle = RolloutHandle::new(format!("rollout-{}", Uuid::new_v4().simple()));

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .envs(&config.env_vars)
            .env("SHIPYARD_SERVICE", service)
            .env("SHIPYARD_ENVIRONMENT", environment)
            .env("SHIPYARD_ARTIFACT", artifact.as_str())
            .env("SHIPYARD_MEMORY", &config.memory)
            .env("SHIPYARD_CPU", &config.cpu)
            .env("SHIPYARD_MIN_INSTANCES", config.min_instances.to_string())
            .env("SHIPYARD_MAX_INSTANCES", config.max_instances.to_string())
            .env("SHIPYARD_TIMEOUT", config.timeout_seconds.to_string())
            .env(
                "SHIPYARD_ALLOW_UNAUTHENTICATED",
                config.allow_unauthenticated.to_string(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn deploy command for '{}'", service))?;

        lock(&self.rollouts)?.insert(handle.clone(), RolloutStatus::Pending);
        debug!(%handle, service, environment, "deploy process started");

        let rollouts = Arc::clone(&self.rollouts);
        let state_dir = self.state_dir.clone();
        let task_handle = handle.clone();
        let mut state = TargetState {
            service: service.to_string(),
            environment: environment.to_string(),
            artifact: artifact.clone(),
            endpoint: Endpoint::new(""),
            updated_at: Utc::now(),
        };

        tokio::spawn(async move {
            let status = match child.wait_with_output().await {
                Ok(output) => match last_stdout_line(&output) {
                    Ok(line) => {
                        state.endpoint = Endpoint::new(line);
                        state.updated_at = Utc::now();
                        match Self::write_state(&state_dir, &state).await {
                            Ok(()) => RolloutStatus::Ready,
                            Err(e) => RolloutStatus::Failed {
                                reason: format!("{:#}", e),
                            },
                        }
                    }
                    Err(reason) => RolloutStatus::Failed { reason },
                },
                Err(e) => RolloutStatus::Failed {
                    reason: format!("failed to wait for deploy process: {}", e),
                },
            };

            match rollouts.lock() {
                Ok(mut rollouts) => {
                    rollouts.insert(task_handle, status);
                }
                Err(_) => warn!(handle = %task_handle, "rollout table poisoned, result dropped"),
            }
        });

        Ok(handle)
    }

    /// A terminal status is reported once, then the handle is forgotten
    async fn status(&self, handle: &RolloutHandle) -> Result<RolloutStatus> {
        let mut rollouts = lock(&self.rollouts)?;
        let status = rollouts
            .get(handle)
            .cloned()
            .ok_or_else(|| anyhow!("Unknown rollout handle: {}", handle))?;

        if status != RolloutStatus::Pending {
            rollouts.remove(handle);
        }
        Ok(status)
    }

    async fn list(&self, environment: Option<&str>) -> Result<Vec<TargetSummary>> {
        let mut targets = Vec::new();

        if !self.state_dir.exists() {
            return Ok(targets);
        }

        let mut env_dirs = fs::read_dir(&self.state_dir).await?;
        while let Some(env_dir) = env_dirs.next_entry().await? {
            if !env_dir.file_type().await?.is_dir() {
                continue;
            }
            let Some(env_name) = env_dir.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if environment.is_some_and(|wanted| wanted != env_name) {
                continue;
            }

            let mut entries = fs::read_dir(env_dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Some(state) = Self::read_state(&path).await? {
                    targets.push(TargetSummary {
                        service: state.service,
                        environment: state.environment,
                        artifact: state.artifact,
                        endpoint: state.endpoint,
                        updated_at: Some(state.updated_at),
                    });
                }
            }
        }

        targets.sort_by(|a, b| {
            (a.service.as_str(), a.environment.as_str())
                .cmp(&(b.service.as_str(), b.environment.as_str()))
        });

        Ok(targets)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| anyhow!("Process table lock poisoned"))
}

/// Last non-empty stdout line of a successful process, or a failure reason
fn last_stdout_line(output: &Output) -> std::result::Result<String, String> {
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        return Err(format!(
            "command failed with exit code {}: {}",
            exit_code,
            stderr.trim()
        ));
    }

    String::from_utf8_lossy(&output.stdout)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
        .ok_or_else(|| "command produced no output on stdout".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ServiceDescriptor, VersionId};
    use std::time::Duration;
    use tempfile::TempDir;

    async fn wait_build(service: &ProcessBuildService, handle: &BuildHandle) -> BuildStatus {
        for _ in 0..200 {
            let status = service.status(handle).await.unwrap();
            if status != BuildStatus::Pending {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("build never finished");
    }

    async fn wait_rollout(runtime: &ProcessRuntime, handle: &RolloutHandle) -> RolloutStatus {
        for _ in 0..200 {
            let status = runtime.status(handle).await.unwrap();
            if status != RolloutStatus::Pending {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("rollout never finished");
    }

    #[tokio::test]
    async fn test_build_reports_last_stdout_line() {
        let temp = TempDir::new().unwrap();
        let service = ProcessBuildService::new(
            "echo building; echo registry/$SHIPYARD_SERVICE:$SHIPYARD_VERSION",
        );
        let spec = BuildSpec {
            service: "orders".to_string(),
            version: VersionId::new("abc123"),
            source: temp.path().to_path_buf(),
        };

        let handle = service.submit(&spec).await.unwrap();
        let status = wait_build(&service, &handle).await;

        assert_eq!(
            status,
            BuildStatus::Succeeded {
                artifact: ArtifactRef::new("registry/orders:abc123")
            }
        );
    }

    #[tokio::test]
    async fn test_failed_build_reports_stderr() {
        let temp = TempDir::new().unwrap();
        let service = ProcessBuildService::new("echo compile error >&2; exit 3");
        let spec = BuildSpec {
            service: "orders".to_string(),
            version: VersionId::new("abc123"),
            source: temp.path().to_path_buf(),
        };

        let handle = service.submit(&spec).await.unwrap();
        match wait_build(&service, &handle).await {
            BuildStatus::Failed { reason } => {
                assert!(reason.contains("exit code 3"));
                assert!(reason.contains("compile error"));
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_finished_handles_are_released() {
        let temp = TempDir::new().unwrap();
        let service = ProcessBuildService::new("echo registry/orders:v1");
        let spec = BuildSpec {
            service: "orders".to_string(),
            version: VersionId::new("v1"),
            source: temp.path().to_path_buf(),
        };

        let handle = service.submit(&spec).await.unwrap();
        assert!(matches!(
            wait_build(&service, &handle).await,
            BuildStatus::Succeeded { .. }
        ));
        assert!(service.builds.lock().unwrap().is_empty());
        assert!(service.status(&handle).await.is_err());

        let descriptor = ServiceDescriptor::new("orders", temp.path());
        let config = RuntimeConfig::from_descriptor(&descriptor, "dev");
        let runtime = ProcessRuntime::new("exit 2", temp.path().join("state"));
        let handle = runtime
            .upsert("orders", "dev", &ArtifactRef::new("registry/orders:v1"), &config)
            .await
            .unwrap();
        assert!(matches!(
            wait_rollout(&runtime, &handle).await,
            RolloutStatus::Failed { .. }
        ));
        assert!(runtime.rollouts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_build_handle_is_an_error() {
        let service = ProcessBuildService::new("true");
        assert!(service.status(&BuildHandle::new("nope")).await.is_err());
    }

    #[tokio::test]
    async fn test_rollout_persists_target_state() {
        let temp = TempDir::new().unwrap();
        let runtime = ProcessRuntime::new(
            "echo https://$SHIPYARD_SERVICE-$ENVIRONMENT.example",
            temp.path(),
        );
        let descriptor = ServiceDescriptor::new("orders", temp.path());
        let config = RuntimeConfig::from_descriptor(&descriptor, "staging");
        let artifact = ArtifactRef::new("registry/orders:v1");

        assert!(runtime.describe("orders", "staging").await.unwrap().is_none());

        let handle = runtime
            .upsert("orders", "staging", &artifact, &config)
            .await
            .unwrap();
        assert_eq!(wait_rollout(&runtime, &handle).await, RolloutStatus::Ready);

        let description = runtime.describe("orders", "staging").await.unwrap().unwrap();
        assert_eq!(description.artifact, artifact);
        assert_eq!(
            description.endpoint,
            Endpoint::new("https://orders-staging.example")
        );

        let targets = runtime.list(Some("staging")).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert!(runtime.list(Some("production")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_rollout_keeps_previous_state() {
        let temp = TempDir::new().unwrap();
        let descriptor = ServiceDescriptor::new("orders", temp.path());
        let config = RuntimeConfig::from_descriptor(&descriptor, "production");

        let good = ProcessRuntime::new("echo https://orders.example", temp.path());
        let handle = good
            .upsert("orders", "production", &ArtifactRef::new("img:v1"), &config)
            .await
            .unwrap();
        assert_eq!(wait_rollout(&good, &handle).await, RolloutStatus::Ready);

        let bad = ProcessRuntime::new("exit 1", temp.path());
        let handle = bad
            .upsert("orders", "production", &ArtifactRef::new("img:v2"), &config)
            .await
            .unwrap();
        assert!(matches!(
            wait_rollout(&bad, &handle).await,
            RolloutStatus::Failed { .. }
        ));

        let description = bad.describe("orders", "production").await.unwrap().unwrap();
        assert_eq!(description.artifact, ArtifactRef::new("img:v1"));
    }
}
