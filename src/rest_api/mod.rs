//! REST API module for external integrations
//!
//! Exposes node health, a summary of the held node and Prometheus metrics.

mod dto;
mod handlers;
mod server;

pub use server::{router, run_server};
