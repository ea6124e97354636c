//! Cluster-wide lease lock for scarce per-key resources.
//!
//! Each protected resource (typically the single IMAP listen connection of a
//! mailbox) is guarded by a lease stored in a shared CAS-capable store. One
//! node at a time holds the lease, renews it in the background, and gives it
//! up when it shuts down; a node that dies or is partitioned away loses the
//! lease once it expires and the liveness oracle confirms its session is gone.
//!
//! The main entry points are [`ClusterLock`] for single operations,
//! [`RenewalScheduler`] for keeping a lease alive, and [`ResourceGate`] for
//! the whole acquire/open/renew/teardown sequence.

#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod lease;
pub mod liveness;
pub mod renewal;
pub mod store;

pub use config::{LockConfig, ServiceConfig};
pub use engine::{
    AcquireOutcome, ClusterLock, HeldLease, Holder, LeaseView, ReleaseOutcome, RenewOutcome,
};
pub use error::{Error, Result};
pub use guard::{GateOutcome, GatedResource, ResourceGate};
pub use lease::{LeaseValue, NodeId, Owner, ResourceKey, SessionId};
pub use liveness::{LivenessOracle, SessionRegistry};
pub use renewal::{LossReason, RenewalHandle, RenewalScheduler, StopOutcome};
pub use store::{open_store, LeaseStore, StoreConfig};
