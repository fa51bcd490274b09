//! Response bodies of the REST API

use serde::Serialize;

use crate::controller::{NodePhase, Phase};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub phase: Phase,
    pub node_id: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_tag: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct NodeResponse {
    pub node_tag: String,
    pub node_type: String,
    pub port: u16,
    pub node_phase: NodePhase,
    pub users: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_tag: Option<String>,
    pub relay_users: usize,
    pub rules: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
