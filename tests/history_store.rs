//! History Store Integration Tests
//!
//! Tests for the JSONL format, concurrent appends and replay order.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{fast_policy, FakeArtifactStore, FakeBuildService, FakeRuntime};
use shipyard::adapters::{ArtifactStore, BuildService, ComputeRuntime};
use shipyard::core::{
    BuildCoordinator, DeployStatus, Fingerprinter, HistoryStore, JsonlHistoryStore,
    Orchestrator, RuntimeController,
};
use shipyard::domain::{
    Action, ArtifactRef, DeploymentRecord, Outcome, ServiceDescriptor, VersionId,
};
use tempfile::TempDir;

fn record(service: &str, environment: &str, n: usize) -> DeploymentRecord {
    DeploymentRecord::new(
        service,
        environment,
        VersionId::new(format!("v{}", n)),
        ArtifactRef::new(format!("registry/{}:v{}", service, n)),
        Outcome::Succeeded,
        Action::Deploy,
    )
}

#[tokio::test]
async fn test_record_line_format() {
    let temp = TempDir::new().unwrap();
    let store = JsonlHistoryStore::open(temp.path());

    let original = record("orders", "production", 1).with_deployed_by(Some("ci".to_string()));
    store.append(&original).await.unwrap();

    let content =
        std::fs::read_to_string(store.partition_path("orders", "production")).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 1);

    let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(value["service"], "orders");
    assert_eq!(value["environment"], "production");
    assert_eq!(value["version"], "v1");
    assert_eq!(value["artifact"], "registry/orders:v1");
    assert_eq!(value["outcome"], "succeeded");
    assert_eq!(value["action"], "deploy");
    assert_eq!(value["deployed_by"], "ci");
    assert!(value["timestamp"].as_str().unwrap().contains('T'));

    // Reopening the store sees the same record
    let reopened = JsonlHistoryStore::open(temp.path());
    let history = reopened.history("orders", "production").await.unwrap();
    assert_eq!(history.records, vec![original]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_to_one_partition_are_all_kept() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonlHistoryStore::open(temp.path()));

    let mut handles = Vec::new();
    for n in 0..32 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store.append(&record("orders", "production", n)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let history = store.history("orders", "production").await.unwrap();
    assert_eq!(history.len(), 32);

    let versions: HashSet<&str> = history.records.iter().map(|r| r.version.as_str()).collect();
    assert_eq!(versions.len(), 32);

    // Every line is one complete record
    let content =
        std::fs::read_to_string(store.partition_path("orders", "production")).unwrap();
    assert_eq!(content.lines().count(), 32);
    for line in content.lines() {
        serde_json::from_str::<DeploymentRecord>(line).unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_separate_store_instances_share_a_partition_safely() {
    let temp = TempDir::new().unwrap();
    let first = Arc::new(JsonlHistoryStore::open(temp.path()));
    let second = Arc::new(JsonlHistoryStore::open(temp.path()));

    let mut handles = Vec::new();
    for n in 0..20 {
        let store = if n % 2 == 0 {
            Arc::clone(&first)
        } else {
            Arc::clone(&second)
        };
        handles.push(tokio::spawn(async move {
            store.append(&record("orders", "production", n)).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(first.history("orders", "production").await.unwrap().len(), 20);
}

#[tokio::test]
async fn test_sequential_appends_replay_in_order() {
    let temp = TempDir::new().unwrap();
    let store = JsonlHistoryStore::open(temp.path());

    for n in 0..10 {
        store.append(&record("orders", "production", n)).await.unwrap();
    }

    let history = store.history("orders", "production").await.unwrap();
    let versions: Vec<String> = history
        .records
        .iter()
        .map(|r| r.version.to_string())
        .collect();
    let expected: Vec<String> = (0..10).map(|n| format!("v{}", n)).collect();
    assert_eq!(versions, expected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partitions_do_not_mix() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(JsonlHistoryStore::open(temp.path()));

    let mut handles = Vec::new();
    for (service, environment) in [
        ("orders", "production"),
        ("orders", "staging"),
        ("payments", "production"),
    ] {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            for n in 0..10 {
                store.append(&record(service, environment, n)).await.unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    for (service, environment) in [
        ("orders", "production"),
        ("orders", "staging"),
        ("payments", "production"),
    ] {
        let history = store.history(service, environment).await.unwrap();
        assert_eq!(history.len(), 10);
        assert!(history
            .records
            .iter()
            .all(|r| r.service == service && r.environment == environment));
        // Each writer appended in order, so each partition replays in order
        assert_eq!(history.records[9].version, VersionId::new("v9"));
    }

    assert_eq!(store.partitions().await.unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deploys_produce_a_total_order() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("orders");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("main.py"), "print('orders')").unwrap();

    let history = Arc::new(JsonlHistoryStore::open(temp.path().join("history")));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&history) as Arc<dyn HistoryStore>,
        BuildCoordinator::new(
            Arc::new(FakeBuildService::new()) as Arc<dyn BuildService>,
            Arc::new(FakeArtifactStore::new()) as Arc<dyn ArtifactStore>,
            fast_policy(2_000),
        ),
        RuntimeController::new(
            Arc::new(FakeRuntime::new()) as Arc<dyn ComputeRuntime>,
            fast_policy(2_000),
        ),
        Fingerprinter::default(),
    ));
    let descriptor = ServiceDescriptor::new("orders", &source);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = Arc::clone(&orchestrator);
        let descriptor = descriptor.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.deploy(&descriptor, "production", true).await
        }));
    }
    for handle in handles {
        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome.status, DeployStatus::Deployed);
    }

    let records = history.history("orders", "production").await.unwrap().records;
    assert_eq!(records.len(), 8);

    let ids: HashSet<_> = records.iter().map(|r| r.id).collect();
    assert_eq!(ids.len(), 8);

    let content =
        std::fs::read_to_string(history.partition_path("orders", "production")).unwrap();
    assert_eq!(content.lines().count(), 8);
}
