//! Fleet node controller: keeps a local proxy engine in step with a remote
//! control plane
//!
//! This crate provides the per-node reconciliation controller, its periodic
//! reporting and certificate duties, and the control-plane client.

pub mod api;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod telemetry;
pub mod tls;
pub mod vitals;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
