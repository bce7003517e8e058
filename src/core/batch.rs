//! Batch deployments across many services.
//!
//! Each service runs its own orchestration. A failure in one never cancels
//! or blocks another, and the report keeps the input order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use super::catalog::ServiceCatalog;
use super::error::DeployError;
use super::orchestrator::{DeployFailure, DeployOutcome, DeployStage, Orchestrator};

/// How a batch is scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    /// Run orchestrations concurrently
    #[serde(default = "default_parallel")]
    pub parallel: bool,

    /// Maximum concurrent orchestrations when `parallel` is set
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_parallel() -> bool {
    true
}
fn default_concurrency() -> usize {
    4
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            parallel: default_parallel(),
            concurrency: default_concurrency(),
        }
    }
}

impl BatchOptions {
    pub fn sequential() -> Self {
        Self {
            parallel: false,
            concurrency: 1,
        }
    }

    pub fn parallel(concurrency: usize) -> Self {
        Self {
            parallel: true,
            concurrency,
        }
    }
}

/// Result for one requested service
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub service: String,
    pub result: Result<DeployOutcome, DeployFailure>,
}

impl BatchEntry {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Per-service results in input order
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub environment: String,
    pub entries: Vec<BatchEntry>,
}

impl BatchReport {
    /// True only when every entry succeeded (skips count as success)
    pub fn is_success(&self) -> bool {
        self.entries.iter().all(BatchEntry::is_success)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &BatchEntry> {
        self.entries.iter().filter(|e| e.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &BatchEntry> {
        self.entries.iter().filter(|e| !e.is_success())
    }
}

pub struct BatchCoordinator {
    orchestrator: Arc<Orchestrator>,
    catalog: Arc<ServiceCatalog>,
}

impl BatchCoordinator {
    pub fn new(orchestrator: Arc<Orchestrator>, catalog: Arc<ServiceCatalog>) -> Self {
        Self {
            orchestrator,
            catalog,
        }
    }

    /// Deploy `services` to `environment`.
    ///
    /// In parallel mode at most `concurrency` orchestrations run at once and
    /// the rest wait for a slot in input order.
    #[instrument(skip(self, services), fields(count = services.len()))]
    pub async fn deploy_all(
        &self,
        services: &[String],
        environment: &str,
        options: BatchOptions,
        force: bool,
    ) -> BatchReport {
        info!(
            parallel = options.parallel,
            concurrency = options.concurrency,
            "Starting batch deployment"
        );

        let entries = if options.parallel {
            self.run_parallel(services, environment, options.concurrency.max(1), force)
                .await
        } else {
            self.run_sequential(services, environment, force).await
        };

        let report = BatchReport {
            environment: environment.to_string(),
            entries,
        };

        let failed = report.failed().count();
        if failed > 0 {
            warn!(failed, total = report.entries.len(), "Batch finished with failures");
        } else {
            info!(total = report.entries.len(), "Batch finished");
        }

        report
    }

    async fn run_sequential(
        &self,
        services: &[String],
        environment: &str,
        force: bool,
    ) -> Vec<BatchEntry> {
        let mut entries = Vec::with_capacity(services.len());

        for service in services {
            let result =
                deploy_service(&self.orchestrator, &self.catalog, service, environment, force)
                    .await;
            entries.push(BatchEntry {
                service: service.clone(),
                result,
            });
        }

        entries
    }

    async fn run_parallel(
        &self,
        services: &[String],
        environment: &str,
        concurrency: usize,
        force: bool,
    ) -> Vec<BatchEntry> {
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut tasks: Vec<(String, Result<JoinHandle<_>, DeployFailure>)> =
            Vec::with_capacity(services.len());

        for service in services {
            // Acquired before spawning so queued services start in input order
            let permit = match Arc::clone(&semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    tasks.push((service.clone(), Err(aborted(e))));
                    continue;
                }
            };

            let orchestrator = Arc::clone(&self.orchestrator);
            let catalog = Arc::clone(&self.catalog);
            let name = service.clone();
            let environment = environment.to_string();

            let handle = tokio::spawn(async move {
                let _permit = permit;
                deploy_service(&orchestrator, &catalog, &name, &environment, force).await
            });
            tasks.push((service.clone(), Ok(handle)));
        }

        let mut entries = Vec::with_capacity(tasks.len());
        for (service, task) in tasks {
            let result = match task {
                Ok(handle) => handle.await.unwrap_or_else(|e| Err(aborted(e))),
                Err(failure) => Err(failure),
            };
            entries.push(BatchEntry { service, result });
        }

        entries
    }
}

async fn deploy_service(
    orchestrator: &Orchestrator,
    catalog: &ServiceCatalog,
    service: &str,
    environment: &str,
    force: bool,
) -> Result<DeployOutcome, DeployFailure> {
    let descriptor = catalog
        .load(service)
        .await
        .map_err(|e| DeployFailure::new(DeployStage::Idle, e))?;

    orchestrator.deploy(&descriptor, environment, force).await
}

fn aborted(error: impl std::fmt::Display) -> DeployFailure {
    DeployFailure::new(
        DeployStage::Idle,
        DeployError::TaskAborted(error.to_string()),
    )
}
