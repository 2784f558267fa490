//! capsa-core — bundle records, profile persistence, and daemon IPC.
//!
//! This crate holds everything below the install orchestrator: the data
//! model of installed bundles, the on-disk JSON profile store, the
//! in-memory registry, bundle archive metadata access, and the RPC link to
//! the privileged daemon that performs filesystem mutations.
//!
//! Install/uninstall orchestration and startup reconciliation live in the
//! `capsa-manager` crate.

pub mod config;
pub mod error;
pub mod ipc;
pub mod model;
pub mod pack;
pub mod registry;
pub mod store;

pub use error::{codes, result_message, CapsaError, Result};
pub use ipc::{DaemonLink, DaemonRequest, DaemonTransport, LinkStatus, LoopbackDaemon};
pub use model::{
    AbilityEntry, BundleKind, BundleRecord, InstallOptions, InstallSession, InstallState,
    ObserverHandle, OpKind, SessionPhase, StateEvent, StateObserver,
};
pub use pack::BundleManifest;
pub use registry::BundleRegistry;
pub use store::{BundleProfile, ProfileStore};
