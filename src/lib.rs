//! vmshift: batch migration of VMware vSphere VMs to Scaleway.
//!
//! The crate is organized around four subsystems:
//!
//! - **Planning**: [`filter`], [`sizing`], [`catalog`] and [`plan`] turn a
//!   VM inventory into a validated, reviewable migration plan.
//! - **Pipeline**: [`stages`], [`handlers`] and [`pipeline`] run the
//!   per-VM stage graph with idempotent, resumable stages.
//! - **Batch execution**: [`orchestrator`] drives waves of concurrent
//!   pipelines under the [`semaphore`] resource limits.
//! - **State**: [`state`] persists crash-safe batch and per-VM records
//!   that make `batch resume` possible.
//!
//! External collaborators (vSphere, object storage, the cloud provider
//! API, disk conversion tooling) are consumed through traits in
//! [`vsphere`], [`object_storage`], [`scaleway`] and [`convert`].

pub mod artifacts;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod convert;
pub mod dashboard;
pub mod error;
pub mod estimate;
pub mod filter;
pub mod handlers;
pub mod object_storage;
pub mod orchestrator;
pub mod pipeline;
pub mod plan;
pub mod scaleway;
pub mod scrub;
pub mod semaphore;
pub mod sizing;
pub mod stages;
pub mod state;
pub mod types;
pub mod vsphere;

pub use error::{Result, StageError, StageErrorKind, VmshiftError};
pub use types::{Firmware, OsFamily, PowerState, VMDescriptor};
