//! Control-plane capability interface

use async_trait::async_trait;

use super::types::{
    ClientIdentity, DetectionResult, NodeDescriptor, NodeStatus, OnlineUser, RelayNodeDescriptor,
    RuleSet, UserRecord, UserTraffic,
};
use crate::error::Result;

/// Typed access to the remote control plane
///
/// Transport concerns (HTTP, authentication, retries) live behind this trait.
/// `get_user_list` signals "nothing changed since the last fetch" with
/// [`Error::UsersUnchanged`](crate::Error::UsersUnchanged); callers treat it as
/// "reuse the held set", not as a failure.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    fn describe(&self) -> ClientIdentity;

    async fn get_node_info(&self) -> Result<NodeDescriptor>;

    async fn get_relay_node_info(&self) -> Result<RelayNodeDescriptor>;

    async fn get_user_list(&self) -> Result<Vec<UserRecord>>;

    async fn get_node_rule(&self) -> Result<RuleSet>;

    async fn report_node_status(&self, status: &NodeStatus) -> Result<()>;

    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> Result<()>;

    async fn report_node_online_users(&self, online: &[OnlineUser]) -> Result<()>;

    async fn report_illegal(&self, detections: &[DetectionResult]) -> Result<()>;
}
