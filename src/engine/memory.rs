//! In-memory engine
//!
//! Holds every resource the controller installs so that a full node can be
//! driven without a proxy process. Mutations are logged at `info`, which makes
//! the `run` subcommand a dry run against a live control plane.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, info};

use super::definitions::{
    CounterHandle, DnsConfig, InboundDefinition, OutboundDefinition, TrafficCounters,
    UserCredential, UserLimit,
};
use super::Engine;
use crate::api::{DetectionResult, OnlineUser, RuleSet};
use crate::controller::tags::Tag;
use crate::error::{Error, Result};

/// Engine operations, used to inject failures and count calls
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EngineOp {
    AddInbound,
    RemoveInbound,
    AddOutbound,
    RemoveOutbound,
    AddUsers,
    RemoveUsers,
    AddLimiter,
    UpdateLimiter,
    DeleteLimiter,
    AddRoutingRules,
    RemoveRoutingRules,
    UpdateDetectionRules,
    OnlineDevices,
    DetectionHits,
    RegisterDns,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Limiter {
    pub speed_limit: u64,
    pub users: BTreeMap<Tag, UserLimit>,
}

#[derive(Default)]
struct MemoryState {
    inbounds: BTreeMap<Tag, InboundDefinition>,
    outbounds: BTreeMap<Tag, OutboundDefinition>,
    users: BTreeMap<Tag, BTreeMap<Tag, UserCredential>>,
    limiters: BTreeMap<Tag, Limiter>,
    /// user tag -> outbound tag
    routing: BTreeMap<Tag, Tag>,
    detection_rules: BTreeMap<Tag, RuleSet>,
    counters: HashMap<String, u64>,
    online: BTreeMap<Tag, Vec<OnlineUser>>,
    hits: BTreeMap<Tag, Vec<DetectionResult>>,
    dns: Option<DnsConfig>,
    failing: BTreeSet<EngineOp>,
    calls: BTreeMap<EngineOp, usize>,
}

impl MemoryState {
    fn enter(&mut self, op: EngineOp) -> Result<()> {
        *self.calls.entry(op).or_default() += 1;
        if self.failing.contains(&op) {
            return Err(Error::EngineError(format!("injected failure in {:?}", op)));
        }
        Ok(())
    }
}

fn uplink_counter(user_tag: &Tag) -> String {
    format!("user>>>{}>>>traffic>>>uplink", user_tag)
}

fn downlink_counter(user_tag: &Tag) -> String {
    format!("user>>>{}>>>traffic>>>downlink", user_tag)
}

#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<MemoryState>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every subsequent call of `op` fail until [`recover`](Self::recover)
    pub fn fail(&self, op: EngineOp) {
        self.lock().failing.insert(op);
    }

    pub fn recover(&self, op: EngineOp) {
        self.lock().failing.remove(&op);
    }

    /// Number of times `op` was invoked, failed calls included
    pub fn calls(&self, op: EngineOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Add traffic to a user's cumulative counters
    pub fn record_traffic(&self, user_tag: &Tag, upload: u64, download: u64) {
        let mut state = self.lock();
        *state.counters.entry(uplink_counter(user_tag)).or_default() += upload;
        *state.counters.entry(downlink_counter(user_tag)).or_default() += download;
    }

    pub fn push_online_device(&self, node_tag: &Tag, device: OnlineUser) {
        self.lock()
            .online
            .entry(node_tag.clone())
            .or_default()
            .push(device);
    }

    pub fn push_detection_hit(&self, node_tag: &Tag, hit: DetectionResult) {
        self.lock()
            .hits
            .entry(node_tag.clone())
            .or_default()
            .push(hit);
    }

    pub fn inbound(&self, tag: &Tag) -> Option<InboundDefinition> {
        self.lock().inbounds.get(tag).cloned()
    }

    pub fn inbound_tags(&self) -> Vec<Tag> {
        self.lock().inbounds.keys().cloned().collect()
    }

    pub fn outbound(&self, tag: &Tag) -> Option<OutboundDefinition> {
        self.lock().outbounds.get(tag).cloned()
    }

    pub fn outbound_tags(&self) -> Vec<Tag> {
        self.lock().outbounds.keys().cloned().collect()
    }

    /// Credential tags installed under a node tag
    pub fn user_tags(&self, node_tag: &Tag) -> Vec<Tag> {
        self.lock()
            .users
            .get(node_tag)
            .map(|users| users.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn credential(&self, node_tag: &Tag, user_tag: &Tag) -> Option<UserCredential> {
        self.lock()
            .users
            .get(node_tag)
            .and_then(|users| users.get(user_tag))
            .cloned()
    }

    pub fn limiter(&self, node_tag: &Tag) -> Option<Limiter> {
        self.lock().limiters.get(node_tag).cloned()
    }

    /// Routing rules as `user tag -> outbound tag`
    pub fn routing_rules(&self) -> BTreeMap<Tag, Tag> {
        self.lock().routing.clone()
    }

    pub fn detection_rules(&self, node_tag: &Tag) -> Option<RuleSet> {
        self.lock().detection_rules.get(node_tag).cloned()
    }

    pub fn dns(&self) -> Option<DnsConfig> {
        self.lock().dns.clone()
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn add_inbound(&self, def: InboundDefinition) -> Result<()> {
        let mut state = self.lock();
        state.enter(EngineOp::AddInbound)?;
        if state.inbounds.contains_key(&def.tag) {
            return Err(Error::EngineError(format!("inbound {} already exists", def.tag)));
        }
        info!("Added inbound {} on {}:{}", def.tag, def.listen, def.port);
        state.inbounds.insert(def.tag.clone(), def);
        Ok(())
    }

    async fn remove_inbound(&self, tag: &Tag) -> Result<()> {
        let mut state = self.lock();
        state.enter(EngineOp::RemoveInbound)?;
        if state.inbounds.remove(tag).is_none() {
            return Err(Error::NotFound(format!("inbound {}", tag)));
        }
        // Credentials live inside their inbound
        state.users.remove(tag);
        info!("Removed inbound {}", tag);
        Ok(())
    }

    async fn add_outbound(&self, def: OutboundDefinition) -> Result<()> {
        let mut state = self.lock();
        state.enter(EngineOp::AddOutbound)?;
        if state.outbounds.contains_key(&def.tag) {
            return Err(Error::EngineError(format!(
                "outbound {} already exists",
                def.tag
            )));
        }
        info!("Added outbound {}", def.tag);
        state.outbounds.insert(def.tag.clone(), def);
        Ok(())
    }

    async fn remove_outbound(&self, tag: &Tag) -> Result<()> {
        let mut state = self.lock();
        state.enter(EngineOp::RemoveOutbound)?;
        if state.outbounds.remove(tag).is_none() {
            return Err(Error::NotFound(format!("outbound {}", tag)));
        }
        info!("Removed outbound {}", tag);
        Ok(())
    }

    async fn add_users(&self, users: Vec<UserCredential>, node_tag: &Tag) -> Result<()> {
        let mut state = self.lock();
        state.enter(EngineOp::AddUsers)?;
        if !state.inbounds.contains_key(node_tag) {
            return Err(Error::NotFound(format!("inbound {}", node_tag)));
        }
        let installed = state.users.entry(node_tag.clone()).or_default();
        if let Some(dup) = users.iter().find(|u| installed.contains_key(&u.tag)) {
            return Err(Error::EngineError(format!("user {} already exists", dup.tag)));
        }
        let count = users.len();
        for user in users {
            installed.insert(user.tag.clone(), user);
        }
        info!("Added {} users to {}", count, node_tag);
        Ok(())
    }

    async fn remove_users(&self, user_tags: &[Tag], node_tag: &Tag) -> Result<()> {
        let mut state = self.lock();
        state.enter(EngineOp::RemoveUsers)?;
        let installed = state
            .users
            .get_mut(node_tag)
            .ok_or_else(|| Error::NotFound(format!("inbound {}", node_tag)))?;
        let missing: Vec<&Tag> = user_tags
            .iter()
            .filter(|tag| installed.remove(*tag).is_none())
            .collect();
        info!(
            "Removed {} users from {}",
            user_tags.len() - missing.len(),
            node_tag
        );
        if let Some(first) = missing.first() {
            return Err(Error::NotFound(format!("user {}", first)));
        }
        Ok(())
    }

    async fn add_limiter(
        &self,
        node_tag: &Tag,
        speed_limit: u64,
        users: Vec<UserLimit>,
    ) -> Result<()> {
        let mut state = self.lock();
        state.enter(EngineOp::AddLimiter)?;
        if state.limiters.contains_key(node_tag) {
            return Err(Error::EngineError(format!(
                "limiter {} already exists",
                node_tag
            )));
        }
        let users: BTreeMap<Tag, UserLimit> =
            users.into_iter().map(|u| (u.tag.clone(), u)).collect();
        info!(
            "Added limiter for {} ({} users, speed limit {})",
            node_tag,
            users.len(),
            speed_limit
        );
        state
            .limiters
            .insert(node_tag.clone(), Limiter { speed_limit, users });
        Ok(())
    }

    async fn update_limiter(&self, node_tag: &Tag, added: Vec<UserLimit>) -> Result<()> {
        let mut state = self.lock();
        state.enter(EngineOp::UpdateLimiter)?;
        let limiter = state
            .limiters
            .get_mut(node_tag)
            .ok_or_else(|| Error::NotFound(format!("limiter {}", node_tag)))?;
        let count = added.len();
        for user in added {
            limiter.users.insert(user.tag.clone(), user);
        }
        info!("Updated limiter for {} with {} users", node_tag, count);
        Ok(())
    }

    async fn delete_limiter(&self, node_tag: &Tag) -> Result<()> {
        let mut state = self.lock();
        state.enter(EngineOp::DeleteLimiter)?;
        if state.limiters.remove(node_tag).is_none() {
            return Err(Error::NotFound(format!("limiter {}", node_tag)));
        }
        info!("Deleted limiter for {}", node_tag);
        Ok(())
    }

    async fn add_routing_rules(&self, outbound_tag: &Tag, user_tags: &[Tag]) -> Result<()> {
        let mut state = self.lock();
        state.enter(EngineOp::AddRoutingRules)?;
        for user_tag in user_tags {
            state.routing.insert(user_tag.clone(), outbound_tag.clone());
        }
        debug!(
            "Routed {} users to {}",
            user_tags.len(),
            outbound_tag
        );
        Ok(())
    }

    async fn remove_routing_rules(&self, user_tags: &[Tag]) -> Result<()> {
        let mut state = self.lock();
        state.enter(EngineOp::RemoveRoutingRules)?;
        let missing: Vec<&Tag> = user_tags
            .iter()
            .filter(|tag| state.routing.remove(*tag).is_none())
            .collect();
        debug!(
            "Removed {} routing rules",
            user_tags.len() - missing.len()
        );
        if let Some(first) = missing.first() {
            return Err(Error::NotFound(format!("routing rule for {}", first)));
        }
        Ok(())
    }

    async fn update_detection_rules(&self, node_tag: &Tag, rules: &RuleSet) -> Result<()> {
        let mut state = self.lock();
        state.enter(EngineOp::UpdateDetectionRules)?;
        debug!("Installed {} detection rules for {}", rules.len(), node_tag);
        state
            .detection_rules
            .insert(node_tag.clone(), rules.clone());
        Ok(())
    }

    async fn online_devices(&self, node_tag: &Tag) -> Result<Vec<OnlineUser>> {
        let mut state = self.lock();
        state.enter(EngineOp::OnlineDevices)?;
        Ok(state.online.remove(node_tag).unwrap_or_default())
    }

    async fn detection_hits(&self, node_tag: &Tag) -> Result<Vec<DetectionResult>> {
        let mut state = self.lock();
        state.enter(EngineOp::DetectionHits)?;
        Ok(state.hits.remove(node_tag).unwrap_or_default())
    }

    async fn traffic_counters(&self, user_tag: &Tag) -> TrafficCounters {
        let state = self.lock();
        let up_name = uplink_counter(user_tag);
        let down_name = downlink_counter(user_tag);
        let upload = state.counters.get(&up_name).copied();
        let download = state.counters.get(&down_name).copied();
        TrafficCounters {
            upload: upload.unwrap_or(0),
            download: download.unwrap_or(0),
            uplink: upload.map(|read| CounterHandle {
                name: up_name,
                read,
            }),
            downlink: download.map(|read| CounterHandle {
                name: down_name,
                read,
            }),
        }
    }

    async fn reset_counters(&self, handles: &[CounterHandle]) {
        let mut state = self.lock();
        for handle in handles {
            if let Some(value) = state.counters.get_mut(handle.name()) {
                *value = value.saturating_sub(handle.read());
            }
        }
    }

    async fn register_dns(&self, config: DnsConfig) -> Result<()> {
        let mut state = self.lock();
        state.enter(EngineOp::RegisterDns)?;
        info!("Registered DNS with {} servers", config.servers.len());
        state.dns = Some(config);
        Ok(())
    }
}
