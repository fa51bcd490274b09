//! Proxy engine capability interface
//!
//! The controller never talks to the proxy process directly; every mutation
//! goes through [`Engine`]. Resources are named by [`Tag`]s, the only
//! cross-reference between the controller and the engine.

pub mod definitions;
pub mod memory;

use async_trait::async_trait;

use crate::api::{DetectionResult, OnlineUser, RuleSet};
use crate::controller::tags::Tag;
use crate::error::Result;

pub use definitions::{
    Account, CipherMethod, CounterHandle, DnsConfig, InboundDefinition, InboundProtocol,
    OutboundDefinition, OutboundProtocol, Security, StreamSettings, TrafficCounters,
    UserCredential, UserLimit,
};
pub use memory::{EngineOp, MemoryEngine};

/// Narrow mutation and telemetry surface of the proxy engine
///
/// Removals of resources that do not exist fail with
/// [`Error::NotFound`](crate::Error::NotFound).
#[async_trait]
pub trait Engine: Send + Sync {
    async fn add_inbound(&self, def: InboundDefinition) -> Result<()>;

    async fn remove_inbound(&self, tag: &Tag) -> Result<()>;

    async fn add_outbound(&self, def: OutboundDefinition) -> Result<()>;

    async fn remove_outbound(&self, tag: &Tag) -> Result<()>;

    async fn add_users(&self, users: Vec<UserCredential>, node_tag: &Tag) -> Result<()>;

    async fn remove_users(&self, user_tags: &[Tag], node_tag: &Tag) -> Result<()>;

    async fn add_limiter(&self, node_tag: &Tag, speed_limit: u64, users: Vec<UserLimit>)
        -> Result<()>;

    async fn update_limiter(&self, node_tag: &Tag, added: Vec<UserLimit>) -> Result<()>;

    async fn delete_limiter(&self, node_tag: &Tag) -> Result<()>;

    /// Route traffic of `user_tags` to the outbound named `outbound_tag`
    async fn add_routing_rules(&self, outbound_tag: &Tag, user_tags: &[Tag]) -> Result<()>;

    async fn remove_routing_rules(&self, user_tags: &[Tag]) -> Result<()>;

    /// Idempotent upsert of the node's detection rules
    async fn update_detection_rules(&self, node_tag: &Tag, rules: &RuleSet) -> Result<()>;

    /// Devices seen since the previous call
    async fn online_devices(&self, node_tag: &Tag) -> Result<Vec<OnlineUser>>;

    /// Detection hits since the previous call
    async fn detection_hits(&self, node_tag: &Tag) -> Result<Vec<DetectionResult>>;

    async fn traffic_counters(&self, user_tag: &Tag) -> TrafficCounters;

    /// Subtract each handle's read value from its counter
    async fn reset_counters(&self, handles: &[CounterHandle]);

    async fn register_dns(&self, config: DnsConfig) -> Result<()>;
}
