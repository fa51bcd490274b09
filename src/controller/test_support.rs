//! Scripted collaborators for controller tests

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::reconciler::NodeController;
use crate::api::{
    CertMode, ClientIdentity, ControlPlane, DetectionResult, NodeDescriptor, NodeStatus,
    NodeType, OnlineUser, RelayNodeDescriptor, RuleSet, UserRecord, UserTraffic,
};
use crate::config::Config;
use crate::engine::MemoryEngine;
use crate::error::{Error, Result};
use crate::tls::{CertRenewer, RenewOutcome};
use crate::vitals::VitalsSource;

/// Control-plane calls that can be made to fail
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Call {
    NodeInfo,
    RelayInfo,
    UserList,
    NodeRule,
    Status,
    Traffic,
    Online,
    Illegal,
}

#[derive(Default)]
struct Script {
    node: Option<NodeDescriptor>,
    relay: Option<RelayNodeDescriptor>,
    users: Vec<UserRecord>,
    users_unchanged: bool,
    rules: RuleSet,
    failing: BTreeSet<Call>,
    statuses: Vec<NodeStatus>,
    traffic: Vec<Vec<UserTraffic>>,
    online: Vec<Vec<OnlineUser>>,
    illegal: Vec<Vec<DetectionResult>>,
}

/// Holds one control-plane call until the test releases it
#[derive(Default)]
pub struct Gate {
    reached: Notify,
    released: Notify,
}

impl Gate {
    /// Resolves once the held call has been entered
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

/// Control plane serving whatever the test last scripted
#[derive(Default)]
pub struct FakeControlPlane {
    script: Mutex<Script>,
    gates: Mutex<BTreeMap<Call, Arc<Gate>>>,
}

impl FakeControlPlane {
    pub fn new(node: NodeDescriptor, users: Vec<UserRecord>) -> Self {
        let fake = Self::default();
        fake.set_node(node);
        fake.set_users(users);
        fake
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, call: Call) -> Result<()> {
        if self.lock().failing.contains(&call) {
            return Err(Error::ControlPlaneError {
                status: 503,
                message: format!("{:?} unavailable", call),
            });
        }
        Ok(())
    }

    /// Hold the next `call` until the returned gate is released
    pub fn pause(&self, call: Call) -> Arc<Gate> {
        let gate = Arc::new(Gate::default());
        self.gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(call, gate.clone());
        gate
    }

    async fn pass(&self, call: Call) {
        let gate = self
            .gates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&call);
        if let Some(gate) = gate {
            gate.reached.notify_one();
            gate.released.notified().await;
        }
    }

    pub fn set_node(&self, node: NodeDescriptor) {
        self.lock().node = Some(node);
    }

    pub fn set_relay(&self, relay: RelayNodeDescriptor) {
        self.lock().relay = Some(relay);
    }

    pub fn set_users(&self, users: Vec<UserRecord>) {
        let mut script = self.lock();
        script.users = users;
        script.users_unchanged = false;
    }

    /// Answer the next user fetch with "not modified"
    pub fn users_unchanged(&self) {
        self.lock().users_unchanged = true;
    }

    pub fn set_rules(&self, rules: RuleSet) {
        self.lock().rules = rules;
    }

    pub fn fail(&self, call: Call) {
        self.lock().failing.insert(call);
    }

    pub fn recover(&self, call: Call) {
        self.lock().failing.remove(&call);
    }

    pub fn statuses(&self) -> Vec<NodeStatus> {
        self.lock().statuses.clone()
    }

    pub fn traffic_reports(&self) -> Vec<Vec<UserTraffic>> {
        self.lock().traffic.clone()
    }

    pub fn online_reports(&self) -> Vec<Vec<OnlineUser>> {
        self.lock().online.clone()
    }

    pub fn illegal_reports(&self) -> Vec<Vec<DetectionResult>> {
        self.lock().illegal.clone()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    fn describe(&self) -> ClientIdentity {
        ClientIdentity {
            api_host: "https://panel.test".to_string(),
            node_id: self.lock().node.as_ref().map_or(0, |n| n.node_id),
        }
    }

    async fn get_node_info(&self) -> Result<NodeDescriptor> {
        self.enter(Call::NodeInfo)?;
        self.lock()
            .node
            .clone()
            .ok_or_else(|| Error::NotFound("node".to_string()))
    }

    async fn get_relay_node_info(&self) -> Result<RelayNodeDescriptor> {
        self.pass(Call::RelayInfo).await;
        self.enter(Call::RelayInfo)?;
        self.lock()
            .relay
            .clone()
            .ok_or_else(|| Error::NotFound("relay node".to_string()))
    }

    async fn get_user_list(&self) -> Result<Vec<UserRecord>> {
        self.enter(Call::UserList)?;
        let mut script = self.lock();
        if std::mem::take(&mut script.users_unchanged) {
            return Err(Error::UsersUnchanged);
        }
        Ok(script.users.clone())
    }

    async fn get_node_rule(&self) -> Result<RuleSet> {
        self.enter(Call::NodeRule)?;
        Ok(self.lock().rules.clone())
    }

    async fn report_node_status(&self, status: &NodeStatus) -> Result<()> {
        self.enter(Call::Status)?;
        self.lock().statuses.push(status.clone());
        Ok(())
    }

    async fn report_user_traffic(&self, traffic: &[UserTraffic]) -> Result<()> {
        self.enter(Call::Traffic)?;
        self.lock().traffic.push(traffic.to_vec());
        Ok(())
    }

    async fn report_node_online_users(&self, online: &[OnlineUser]) -> Result<()> {
        self.enter(Call::Online)?;
        self.lock().online.push(online.to_vec());
        Ok(())
    }

    async fn report_illegal(&self, detections: &[DetectionResult]) -> Result<()> {
        self.enter(Call::Illegal)?;
        self.lock().illegal.push(detections.to_vec());
        Ok(())
    }
}

/// Vitals source returning a fixed sample, or failing
pub struct FixedVitals(pub Option<NodeStatus>);

#[async_trait]
impl VitalsSource for FixedVitals {
    async fn sample(&self) -> Result<NodeStatus> {
        self.0
            .clone()
            .ok_or_else(|| Error::VitalsError("no /proc on this host".to_string()))
    }
}

/// Renewer recording every request
#[derive(Default)]
pub struct RecordingRenewer {
    pub requests: Mutex<Vec<(CertMode, String)>>,
}

#[async_trait]
impl CertRenewer for RecordingRenewer {
    async fn renew(&self, mode: CertMode, domain: &str) -> Result<RenewOutcome> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((mode, domain.to_string()));
        Ok(RenewOutcome::Valid { expires_at: 0 })
    }
}

pub fn test_config(update_interval_secs: u64) -> Config {
    let raw = format!(
        r#"
        [api]
        host = "https://panel.test"
        node_id = 7
        key = "k"

        [controller]
        update_interval_secs = {}
        "#,
        update_interval_secs
    );
    Config::from_toml_str(&raw).expect("valid test config")
}

pub fn user(uid: u32) -> UserRecord {
    UserRecord {
        uid,
        email: format!("u{}@example.com", uid),
        passwd: format!("passwd-of-user-{:04}-0123456789abcdef", uid),
        speed_limit: 0,
        device_limit: 0,
        uuid: format!("00000000-0000-0000-0000-{:012}", uid),
    }
}

pub fn vmess_node() -> NodeDescriptor {
    NodeDescriptor::new(NodeType::Vmess, 443, 7)
}

/// Controller wired to scripted collaborators
pub struct Harness {
    pub api: Arc<FakeControlPlane>,
    pub engine: Arc<MemoryEngine>,
    pub certs: Arc<RecordingRenewer>,
    pub controller: Arc<NodeController>,
}

impl Harness {
    pub fn new(node: NodeDescriptor, users: Vec<UserRecord>) -> Self {
        Self::with_config(node, users, test_config(60))
    }

    pub fn with_config(node: NodeDescriptor, users: Vec<UserRecord>, config: Config) -> Self {
        let vitals = NodeStatus {
            cpu: 12.5,
            mem: 40.0,
            disk: 55.0,
            uptime: 3600,
        };
        Self::build(node, users, config, Some(vitals))
    }

    /// Harness whose vitals source always fails
    pub fn without_vitals(node: NodeDescriptor, users: Vec<UserRecord>) -> Self {
        Self::build(node, users, test_config(60), None)
    }

    fn build(
        node: NodeDescriptor,
        users: Vec<UserRecord>,
        config: Config,
        vitals: Option<NodeStatus>,
    ) -> Self {
        let api = Arc::new(FakeControlPlane::new(node, users));
        let engine = Arc::new(MemoryEngine::new());
        let certs = Arc::new(RecordingRenewer::default());
        let vitals = Arc::new(FixedVitals(vitals));
        let controller = Arc::new(NodeController::new(
            &config,
            api.clone(),
            engine.clone(),
            vitals,
            certs.clone(),
        ));
        Self {
            api,
            engine,
            certs,
            controller,
        }
    }
}
