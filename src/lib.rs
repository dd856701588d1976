//! fortsa - keeps mesh sidecars current with their namespace's control-plane revision
//!
//! When an operator moves a namespace's revision tag during a canary upgrade
//! of the mesh control plane, running pods keep their old sidecar until they
//! are restarted. fortsa watches for exactly that gap and closes it by
//! rolling the owning workload controllers, at a bounded rate.
//!
//! # Modules
//!
//! - [`controller`] - The namespace and pod reconcilers and their wiring
//! - [`mesh`] - Fused mesh state: revision tags, namespace index, proxy sync
//! - [`k8s`] - Cluster seams: owner resolution, rollout driver, pod ops
//! - [`ratelimit`] - Restart budget and failure backoff
//! - [`config`] - Process configuration (`FORTSA_*`)
//! - [`error`] - Error types for the controller

pub mod config;
pub mod controller;
pub mod error;
pub mod k8s;
pub mod labels;
pub mod mesh;
pub mod ratelimit;

pub use config::Config;
pub use error::Error;
