//! shipyard - deployment orchestrator for independently deployable services
//!
//! Decides whether a service needs rebuilding, drives the remote build,
//! updates the compute target and records every completed deployment in an
//! append-only history that any earlier successful version can be restored
//! from.
//!
//! # Architecture
//!
//! - History is append-only; the live version is derived from it, never
//!   stored separately
//! - A version is a fingerprint of the source tree, so unchanged source is
//!   never rebuilt or redeployed
//! - Build and rollout waits are bounded; a timeout is reported as
//!   ambiguous rather than guessed at
//!
//! # Modules
//!
//! - `adapters`: Build service, artifact store and compute runtime interfaces
//! - `core`: Orchestration logic (history, coordinators, state machine, batch)
//! - `domain`: Data structures (records, versions, service descriptors)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Deploy one service
//! shipyard deploy orders -e staging
//!
//! # Deploy everything, four at a time
//! shipyard deploy-all -c 4
//!
//! # Restore an earlier version
//! shipyard rollback orders 3f2a9c1d4b5e6f70 -e production
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{
    BatchCoordinator, BatchOptions, DeployError, DeployFailure, DeployOutcome, DeployStage,
    DeployStatus, HistoryStore, Orchestrator,
};
pub use domain::{DeploymentRecord, Outcome, ServiceDescriptor, VersionId};
