//! Append-only deployment history with file-based persistence.
//!
//! Each (service, environment) pair is its own partition, stored as
//! newline-delimited JSON (JSONL) at `<root>/<service>/<environment>.jsonl`.
//! Appends to one partition are serialized; appends to different partitions
//! never wait on each other.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use fs2::FileExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::spawn_blocking;
use tracing::debug;

use super::error::{DeployError, DeployResult};
use crate::domain::{validate_name, DeploymentHistory, DeploymentRecord, VersionId};

/// Partition key: (service, environment)
pub type PartitionKey = (String, String);

/// Durable log of deployment records.
///
/// Only `append` mutates anything. The current live version is always
/// derived from the records, never stored on the side.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a record to its partition
    async fn append(&self, record: &DeploymentRecord) -> DeployResult<()>;

    /// All records of a partition in append order
    async fn history(&self, service: &str, environment: &str) -> DeployResult<DeploymentHistory>;

    /// Every partition that has at least one record
    async fn partitions(&self) -> DeployResult<Vec<PartitionKey>>;

    /// Latest record with outcome succeeded or rolled_back
    async fn current(
        &self,
        service: &str,
        environment: &str,
    ) -> DeployResult<Option<DeploymentRecord>> {
        Ok(self.history(service, environment).await?.current().cloned())
    }

    async fn current_version(
        &self,
        service: &str,
        environment: &str,
    ) -> DeployResult<Option<VersionId>> {
        Ok(self.current(service, environment).await?.map(|r| r.version))
    }

    /// Most recent succeeded record for `version`, required before a rollback
    async fn find_succeeded(
        &self,
        service: &str,
        environment: &str,
        version: &VersionId,
    ) -> DeployResult<DeploymentRecord> {
        let history = self.history(service, environment).await?;

        match history.find_succeeded(version) {
            Some(record) => Ok(record.clone()),
            None => Err(DeployError::VersionNotFound {
                service: service.to_string(),
                environment: environment.to_string(),
                version: version.clone(),
                available: history.succeeded_versions(),
            }),
        }
    }
}

/// Per-partition locks, created on first use
#[derive(Default)]
struct PartitionLocks {
    locks: StdMutex<HashMap<PartitionKey, Arc<Mutex<()>>>>,
}

impl PartitionLocks {
    fn get(&self, service: &str, environment: &str) -> DeployResult<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| DeployError::store("partition lock table poisoned"))?;

        Ok(Arc::clone(
            locks
                .entry((service.to_string(), environment.to_string()))
                .or_default(),
        ))
    }

    /// Drop the table entry once no other append holds or waits on it
    fn release(&self, service: &str, environment: &str, lock: Arc<Mutex<()>>) {
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };

        let key = (service.to_string(), environment.to_string());
        // One reference in the table, one in `lock`
        if locks.get(&key).is_some_and(|entry| Arc::strong_count(entry) == 2) {
            locks.remove(&key);
        }
        drop(lock);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

/// File-based history store using JSONL partitions
pub struct JsonlHistoryStore {
    /// Directory containing one subdirectory per service
    root: PathBuf,

    locks: PartitionLocks,
}

impl JsonlHistoryStore {
    /// Open a store rooted at `root`; the directory is created lazily
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: PartitionLocks::default(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the path to a partition's JSONL file
    pub fn partition_path(&self, service: &str, environment: &str) -> PathBuf {
        self.root
            .join(service)
            .join(format!("{}.jsonl", environment))
    }

    fn append_sync(path: &Path, line: &str) -> std::io::Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;

        // Exclusive lock keeps other processes from interleaving lines
        file.lock_exclusive()?;
        let written = file
            .write_all(line.as_bytes())
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_data());
        let unlocked = file.unlock();

        written.and(unlocked)
    }

    fn replay_sync(path: &Path) -> DeployResult<Vec<DeploymentRecord>> {
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = std::fs::File::open(path).map_err(|e| {
            DeployError::store(format!("failed to open {}: {}", path.display(), e))
        })?;
        file.lock_shared().map_err(|e| {
            DeployError::store(format!("failed to lock {}: {}", path.display(), e))
        })?;

        let mut records = Vec::new();
        let mut result = Ok(());
        for line in BufReader::new(&file).lines() {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    result = Err(DeployError::store(format!(
                        "failed to read {}: {}",
                        path.display(),
                        e
                    )));
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DeploymentRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    result = Err(DeployError::store(format!(
                        "corrupt record in {}: {}",
                        path.display(),
                        e
                    )));
                    break;
                }
            }
        }

        let _ = file.unlock();
        result.map(|_| records)
    }
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn append(&self, record: &DeploymentRecord) -> DeployResult<()> {
        validate_name(&record.service)?;
        validate_name(&record.environment)?;

        let path = self.partition_path(&record.service, &record.environment);
        let json = serde_json::to_string(record).map_err(DeployError::store)?;
        let line = format!("{}\n", json);

        let lock = self.locks.get(&record.service, &record.environment)?;
        let written = {
            let _guard = lock.lock().await;
            let write_path = path.clone();
            spawn_blocking(move || Self::append_sync(&write_path, &line)).await
        };
        self.locks.release(&record.service, &record.environment, lock);

        written.map_err(DeployError::store)?.map_err(|e| {
            DeployError::store(format!("failed to append to {}: {}", path.display(), e))
        })?;

        debug!(
            service = %record.service,
            environment = %record.environment,
            version = %record.version,
            outcome = record.outcome.as_str(),
            "appended deployment record"
        );

        Ok(())
    }

    async fn history(&self, service: &str, environment: &str) -> DeployResult<DeploymentHistory> {
        validate_name(service)?;
        validate_name(environment)?;

        let path = self.partition_path(service, environment);
        let records = spawn_blocking(move || Self::replay_sync(&path))
            .await
            .map_err(DeployError::store)??;

        Ok(DeploymentHistory::new(records))
    }

    async fn partitions(&self) -> DeployResult<Vec<PartitionKey>> {
        let root = self.root.clone();

        spawn_blocking(move || -> DeployResult<Vec<PartitionKey>> {
            let mut partitions = Vec::new();
            if !root.exists() {
                return Ok(partitions);
            }

            let read_dir = |dir: &Path| {
                std::fs::read_dir(dir).map_err(|e| {
                    DeployError::store(format!("failed to list {}: {}", dir.display(), e))
                })
            };

            for service_dir in read_dir(&root)? {
                let service_dir = service_dir.map_err(DeployError::store)?;
                let path = service_dir.path();
                let Some(service) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !path.is_dir() || validate_name(service).is_err() {
                    continue;
                }

                for entry in read_dir(&path)? {
                    let entry = entry.map_err(DeployError::store)?;
                    let file = entry.path();
                    if file.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                        continue;
                    }
                    if let Some(environment) = file.file_stem().and_then(|s| s.to_str()) {
                        partitions.push((service.to_string(), environment.to_string()));
                    }
                }
            }

            partitions.sort();
            Ok(partitions)
        })
        .await
        .map_err(DeployError::store)?
    }
}

/// In-process history store
#[derive(Default)]
pub struct MemoryHistoryStore {
    partitions: RwLock<HashMap<PartitionKey, Arc<Mutex<Vec<DeploymentRecord>>>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn partition(&self, service: &str, environment: &str) -> Arc<Mutex<Vec<DeploymentRecord>>> {
        let key = (service.to_string(), environment.to_string());

        if let Some(partition) = self.partitions.read().await.get(&key) {
            return Arc::clone(partition);
        }

        let mut partitions = self.partitions.write().await;
        Arc::clone(partitions.entry(key).or_default())
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, record: &DeploymentRecord) -> DeployResult<()> {
        validate_name(&record.service)?;
        validate_name(&record.environment)?;

        let partition = self.partition(&record.service, &record.environment).await;
        partition.lock().await.push(record.clone());
        Ok(())
    }

    async fn history(&self, service: &str, environment: &str) -> DeployResult<DeploymentHistory> {
        let key = (service.to_string(), environment.to_string());
        let partition = self.partitions.read().await.get(&key).cloned();

        let records = match partition {
            Some(partition) => partition.lock().await.clone(),
            None => Vec::new(),
        };
        Ok(DeploymentHistory::new(records))
    }

    async fn partitions(&self) -> DeployResult<Vec<PartitionKey>> {
        let mut keys = Vec::new();
        for (key, partition) in self.partitions.read().await.iter() {
            if !partition.lock().await.is_empty() {
                keys.push(key.clone());
            }
        }
        keys.sort();
        Ok(keys)
    }
}
