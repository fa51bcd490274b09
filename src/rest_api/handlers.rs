//! HTTP handlers for the REST API

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use tracing::{error, instrument};

use crate::controller::{metrics, NodeController, Phase};

use super::dto::{ErrorResponse, HealthResponse, NodeResponse};

/// Health check endpoint; unhealthy until startup completed
#[instrument(skip(controller))]
pub async fn health(
    State(controller): State<Arc<NodeController>>,
) -> (StatusCode, Json<HealthResponse>) {
    let phase = controller.phase().await;
    let node_tag = controller
        .snapshot()
        .await
        .map(|snapshot| snapshot.node_tag.to_string());
    let (code, status) = match phase {
        Phase::Running => (StatusCode::OK, "healthy"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };
    (
        code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            phase,
            node_id: controller.identity().node_id,
            node_tag,
        }),
    )
}

/// Summary of the held node
#[instrument(skip(controller))]
pub async fn get_node(
    State(controller): State<Arc<NodeController>>,
) -> Result<Json<NodeResponse>, (StatusCode, Json<ErrorResponse>)> {
    let snapshot = controller.snapshot().await.ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "not_started".to_string(),
                message: "the node has not been started".to_string(),
            }),
        )
    })?;

    Ok(Json(NodeResponse {
        node_tag: snapshot.node_tag.to_string(),
        node_type: snapshot.node.node_type.to_string(),
        port: snapshot.node.port,
        node_phase: snapshot.node_phase,
        users: snapshot.users.len(),
        relay_tag: snapshot.relay.as_ref().map(|r| r.tag.to_string()),
        relay_users: snapshot.relay.as_ref().map_or(0, |r| r.bound.len()),
        rules: snapshot.rules.len(),
    }))
}

/// Prometheus text exposition
pub async fn metrics() -> Result<String, StatusCode> {
    metrics::render().map_err(|e| {
        error!("Failed to encode metrics: {:?}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
