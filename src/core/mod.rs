//! Core deployment logic.
//!
//! This module contains:
//! - Fingerprinter: content-addressed versions of source trees
//! - HistoryStore: append-only deployment history
//! - BuildCoordinator / RuntimeController: the remote build and rollout steps
//! - Orchestrator: the per-service deployment state machine
//! - BatchCoordinator: bounded fan-out over many services

pub mod batch;
pub mod builder;
pub mod catalog;
pub mod error;
pub mod fingerprint;
pub mod history;
pub mod orchestrator;
pub mod poll;
pub mod runtime;

// Re-export commonly used types
pub use batch::{BatchCoordinator, BatchEntry, BatchOptions, BatchReport};
pub use builder::BuildCoordinator;
pub use catalog::ServiceCatalog;
pub use error::{DeployError, DeployResult};
pub use fingerprint::{default_exclude, Fingerprinter};
pub use history::{HistoryStore, JsonlHistoryStore, MemoryHistoryStore, PartitionKey};
pub use orchestrator::{
    DeployFailure, DeployOutcome, DeployStage, DeployStatus, LiveStatus, Orchestrator,
};
pub use poll::{PollError, PollPolicy, PollStatus};
pub use runtime::RuntimeController;
