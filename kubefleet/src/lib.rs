//! Multi-cluster Kubernetes control plane.
//!
//! The [`control::Control`] root owns every subsystem: the cluster registry
//! and its per-cluster clients, the resource reconciler, the machine and
//! cluster lifecycle engine, federation, add-on installation and the task
//! scheduler driving all long-running work.

#[macro_use]
extern crate log;

pub mod addons;
pub mod client;
pub mod config;
pub mod control;
pub mod drivers;
pub mod errors;
pub mod federation;
pub mod hosts;
pub mod lifecycle;
pub mod locks;
pub mod metrics;
pub mod prometheus_exporter;
pub mod providers;
pub mod reconciler;
pub mod registry;
pub mod store;
pub mod tasks;
mod utils;

pub use control::{Control, ControlBuilder};
pub use errors::{Error, Result};

/// Value of the managed-by label on objects created in member clusters.
pub const MANAGER: &'static str = "kubefleet";
