//! yarsync core library.
//!
//! This crate provides the components of a replica synchronization tool:
//! configuration, hardlinked commits and their logs, the per-replica sync
//! ledger, divergence detection, the push/pull state machine, and cloning.
//! All byte-level transfer is delegated to the `rsync` binary.

pub mod bootstrap;
pub mod commit_store;
pub mod config;
pub mod coordinator;
pub mod divergence;
pub mod errors;
pub mod layout;
pub mod ledger;
pub mod models;
pub mod rsync;
pub mod workspace;

// Re-exports for convenience.
pub use bootstrap::{CloneOptions, ReplicaBootstrap};
pub use commit_store::{CommitOptions, CommitStore};
pub use config::{ContextOptions, ReplicaContext};
pub use coordinator::{ReplicationCoordinator, SyncOptions};
pub use divergence::DivergenceDetector;
pub use errors::CoreError;
pub use ledger::SyncLedger;
pub use rsync::RsyncClient;
pub use workspace::Workspace;
