//! Dockyard library
//!
//! Provisions, monitors and tears down container-backed resources (workspaces,
//! agent sandboxes, deployments, databases, buckets) and wires them into a
//! shared reverse proxy.

pub mod api;
pub mod container;
pub mod db;
pub mod error;
pub mod lifecycle;
pub mod ports;
pub mod proxy;
pub mod readiness;
pub mod resource;
pub mod stream;

pub use error::{EngineError, EngineResult};
