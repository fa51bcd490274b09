//! Node reconciliation controller
//!
//! Owns the held [`Snapshot`] and converges the engine onto the state
//! published by the control plane:
//!
//! 1. **Startup** - fetch node and users, install node, users, limiter,
//!    relay, rules and DNS, then launch the periodic tasks.
//! 2. **Cycle** - re-fetch, rebuild the node on any descriptor change,
//!    rebuild relay bindings when users or node changed, otherwise apply the
//!    user diff incrementally.
//!
//! The state lock is only held while the snapshot is read or replaced, never
//! across a control-plane or engine call. Every mutating step commits the
//! snapshot so an aborted cycle leaves an accurate view for the next one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::binder::{
    bind_credential, bind_dns, bind_limits, bind_node, bind_relay_user, node_resource_tags,
    relay_password, NodeProtocol, NodeResources, RelayProtocol,
};
use super::state::{
    settle, settle_removal, settle_required, ControllerState, CycleOutcome, NodePhase, Phase,
    RelayBound, RelayState, Snapshot, Step,
};
use super::tags::{node_tag, relay_tag, user_tag, Tag};
use super::users::diff_users;
use crate::api::{ClientIdentity, ControlPlane, NodeDescriptor, RuleSet, UserRecord};
use crate::config::{Config, ControllerConfig, DnsSettings};
use crate::engine::{Engine, UserCredential};
use crate::error::{Error, Result};
use crate::scheduler::{PeriodicTask, Scheduler};
use crate::tls::CertRenewer;
use crate::vitals::VitalsSource;

/// Per-node reconciliation controller
pub struct NodeController {
    pub(super) settings: ControllerConfig,
    pub(super) dns: DnsSettings,
    pub(super) identity: ClientIdentity,
    pub(super) api: Arc<dyn ControlPlane>,
    pub(super) engine: Arc<dyn Engine>,
    pub(super) vitals: Arc<dyn VitalsSource>,
    pub(super) certs: Arc<dyn CertRenewer>,
    state: Mutex<ControllerState>,
    started_at: std::sync::Mutex<Option<Instant>>,
    /// Serializes reconcile cycles
    cycle: Mutex<()>,
    scheduler: Mutex<Option<Scheduler>>,
}

impl NodeController {
    pub fn new(
        config: &Config,
        api: Arc<dyn ControlPlane>,
        engine: Arc<dyn Engine>,
        vitals: Arc<dyn VitalsSource>,
        certs: Arc<dyn CertRenewer>,
    ) -> Self {
        let identity = api.describe();
        Self {
            settings: config.controller.clone(),
            dns: config.dns.clone(),
            identity,
            api,
            engine,
            vitals,
            certs,
            state: Mutex::new(ControllerState::default()),
            started_at: std::sync::Mutex::new(None),
            cycle: Mutex::new(()),
            scheduler: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    /// Copy of the held snapshot, if startup completed
    pub async fn snapshot(&self) -> Option<Snapshot> {
        self.state.lock().await.snapshot.clone()
    }

    /// Held snapshot of a running controller
    pub(super) async fn held(&self) -> Result<Snapshot> {
        let state = self.state.lock().await;
        match (state.phase, &state.snapshot) {
            (Phase::Running, Some(snapshot)) => Ok(snapshot.clone()),
            _ => Err(Error::NotStarted),
        }
    }

    async fn commit(&self, snapshot: &Snapshot) {
        self.state.lock().await.snapshot = Some(snapshot.clone());
        #[cfg(feature = "metrics")]
        super::metrics::set_held_users(self.identity.node_id, snapshot.users.len());
    }

    async fn set_phase(&self, phase: Phase) {
        self.state.lock().await.phase = phase;
    }

    fn elapsed_since_start(&self) -> Option<Duration> {
        let started_at = *self
            .started_at
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        started_at.map(|at| at.elapsed())
    }

    /// Run the startup sequence and launch the periodic tasks
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.bootstrap().await?;

        let mut scheduler = Scheduler::new();
        scheduler.register(Arc::new(ReconcileTask {
            controller: Arc::clone(self),
        }));
        scheduler.register(Arc::new(super::reporter::ReportTask {
            controller: Arc::clone(self),
        }));
        scheduler.register(Arc::new(super::cert::CertTask {
            controller: Arc::clone(self),
        }));
        scheduler.start();
        *self.scheduler.lock().await = Some(scheduler);
        Ok(())
    }

    /// Stop the periodic tasks, waiting for in-flight runs
    pub async fn stop(&self) {
        let scheduler = self.scheduler.lock().await.take();
        if let Some(mut scheduler) = scheduler {
            scheduler.stop().await;
        }
        self.set_phase(Phase::Stopped).await;
        info!("Node controller for node {} stopped", self.identity.node_id);
    }

    /// Startup sequence without launching periodic tasks
    ///
    /// Failing to fetch or install the node or its users aborts startup;
    /// limiter and rule failures are logged.
    #[instrument(skip(self), fields(api_host = %self.identity.api_host, node_id = self.identity.node_id))]
    pub async fn bootstrap(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.phase != Phase::Uninitialized {
                return Err(Error::AlreadyStarted);
            }
            state.phase = Phase::Starting;
        }

        match self.initial_sync().await {
            Ok(snapshot) => {
                let mut state = self.state.lock().await;
                state.snapshot = Some(snapshot);
                state.phase = Phase::Running;
                *self
                    .started_at
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
                Ok(())
            }
            Err(e) => {
                self.set_phase(Phase::Uninitialized).await;
                Err(e)
            }
        }
    }

    async fn initial_sync(&self) -> Result<Snapshot> {
        let node = settle_required(Step::FetchNode, self.api.get_node_info().await)?;
        let tag = node_tag(&node);
        info!("Starting node {}", tag);

        settle_required(
            Step::RegisterDns,
            self.engine.register_dns(bind_dns(&self.dns, &node)).await,
        )?;

        let users = settle_required(Step::FetchUsers, self.api.get_user_list().await)?;

        let mut snapshot = Snapshot {
            node: node.clone(),
            node_tag: tag.clone(),
            node_phase: NodePhase::Stable,
            users: Vec::new(),
            published_users: users.clone(),
            relay: None,
            relay_pending: false,
            rules: RuleSet::new(),
        };

        if node.relay {
            let relay = self.build_relay(&tag, &users).await?;
            info!(
                "Taking detour route {} for {} users",
                relay.tag,
                relay.bound.len()
            );
            snapshot.relay = Some(relay);
        }

        let resources = settle_required(Step::AddNode, bind_node(&node, &tag, &self.settings))?;
        self.apply_node(resources).await?;

        let (held, _) = self.install_users(&node, &tag, &users).await?;
        snapshot.users = held;
        settle(
            Step::AddLimiter,
            self.engine
                .add_limiter(&tag, node.speed_limit, bind_limits(&tag, &snapshot.users))
                .await,
        )?;

        if let Some(rules) = self.fetch_rules().await? {
            if !rules.is_empty() {
                settle(
                    Step::UpdateRules,
                    self.engine.update_detection_rules(&tag, &rules).await,
                )?;
            }
            snapshot.rules = rules;
        }

        info!(
            "Node {} started with {} users",
            tag,
            snapshot.users.len()
        );
        Ok(snapshot)
    }

    /// Guarded cycle: skipped until one update interval has passed since
    /// startup
    pub async fn tick(&self) -> Result<CycleOutcome> {
        match self.elapsed_since_start() {
            Some(elapsed) if elapsed >= self.settings.update_interval() => self.reconcile().await,
            Some(_) => Ok(CycleOutcome::skipped()),
            None => Err(Error::NotStarted),
        }
    }

    /// One reconciliation cycle
    #[instrument(skip(self), fields(node_id = self.identity.node_id))]
    pub async fn reconcile(&self) -> Result<CycleOutcome> {
        let _cycle = self.cycle.lock().await;
        let started = Instant::now();
        let mut snap = self.held().await?;

        let result = self.run_cycle(&mut snap).await;

        #[cfg(feature = "metrics")]
        super::metrics::observe_reconcile_duration_seconds(
            self.identity.node_id,
            started.elapsed().as_secs_f64(),
        );
        debug!("Reconcile cycle took {:?}", started.elapsed());
        result
    }

    async fn run_cycle(&self, snap: &mut Snapshot) -> Result<CycleOutcome> {
        let mut outcome = CycleOutcome::default();

        let new_node = settle_required(Step::FetchNode, self.api.get_node_info().await)?;
        let fetched = match self.api.get_user_list().await {
            Err(Error::UsersUnchanged) => None,
            other => Some(settle_required(Step::FetchUsers, other)?),
        };
        // A "not modified" answer refers to this list, so it is committed
        // before any step that can abort the cycle
        if let Some(users) = fetched {
            snap.published_users = users;
            self.commit(snap).await;
        }
        let previous_users = snap.users.clone();
        let new_users = snap.published_users.clone();
        let users_changed = !diff_users(&previous_users, &new_users).is_empty();

        let mut relay_rebuild = snap.relay_pending;
        let mut rules_removed = false;

        // Routing rules reference user tags; drop them before any tag changes
        if users_changed {
            relay_rebuild = true;
            if let Some(relay) = &snap.relay {
                let user_tags: Vec<Tag> = relay.bound.iter().map(|b| b.user_tag.clone()).collect();
                if !user_tags.is_empty() {
                    rules_removed = settle_removal(
                        Step::RemoveRoutingRules,
                        self.engine.remove_routing_rules(&user_tags).await,
                    )?;
                }
            }
        }

        let node_changed = new_node != snap.node || snap.node_phase == NodePhase::Rebuilding;
        if node_changed {
            let new_tag = node_tag(&new_node);
            // Bind first so an unusable descriptor leaves the running node alone
            let resources =
                settle_required(Step::AddNode, bind_node(&new_node, &new_tag, &self.settings))?;

            info!("Node changed, rebuilding {} as {}", snap.node_tag, new_tag);
            snap.node_phase = NodePhase::Rebuilding;
            snap.relay_pending = true;
            self.commit(snap).await;

            self.teardown_node(&snap.node, &snap.node_tag).await?;
            snap.node = new_node.clone();
            snap.node_tag = new_tag;
            snap.users = Vec::new();
            self.commit(snap).await;

            self.apply_node(resources).await?;
            relay_rebuild = true;
            outcome.node_rebuilt = true;
            #[cfg(feature = "metrics")]
            super::metrics::inc_node_rebuild(self.identity.node_id);
        }

        if relay_rebuild {
            snap.relay_pending = true;
            self.commit(snap).await;

            if let Some(relay) = snap.relay.clone() {
                self.teardown_relay(&relay, rules_removed).await?;
                info!("Removed detour route {}", relay.tag);
                snap.relay = None;
                self.commit(snap).await;
            }

            if new_node.relay {
                match self.build_relay(&snap.node_tag, &new_users).await {
                    Ok(relay) => {
                        info!(
                            "Reloaded detour route {} for {} users",
                            relay.tag,
                            relay.bound.len()
                        );
                        snap.relay = Some(relay);
                        outcome.relay_rebuilt = true;
                    }
                    Err(e) => {
                        self.commit(snap).await;
                        return Err(e);
                    }
                }
            }
            snap.relay_pending = false;
            self.commit(snap).await;
        }

        if let Some(rules) = self.fetch_rules().await? {
            if !rules.is_empty() || rules != snap.rules {
                settle(
                    Step::UpdateRules,
                    self.engine
                        .update_detection_rules(&snap.node_tag, &rules)
                        .await,
                )?;
            }
            snap.rules = rules;
        }

        if node_changed {
            let tag = snap.node_tag.clone();
            let (held, installed) = self.install_users(&new_node, &tag, &new_users).await?;
            snap.users = held;
            self.commit(snap).await;
            settle(
                Step::AddLimiter,
                self.engine
                    .add_limiter(&tag, new_node.speed_limit, bind_limits(&tag, &snap.users))
                    .await,
            )?;
            info!("Reloading DNS for {}", tag);
            settle_required(
                Step::RegisterDns,
                self.engine.register_dns(bind_dns(&self.dns, &new_node)).await,
            )?;
            outcome.users_added = installed;
            snap.node_phase = NodePhase::Stable;
        } else if users_changed {
            let (held, added, removed) = self
                .apply_user_diff(&snap.node, &snap.node_tag, &previous_users, &new_users)
                .await?;
            snap.users = held;
            outcome.users_added = added;
            outcome.users_removed = removed;
        } else {
            snap.users = new_users;
        }

        self.commit(snap).await;
        Ok(outcome)
    }

    /// Incremental user update; returns the held set and the add/remove
    /// counts that took effect
    async fn apply_user_diff(
        &self,
        node: &NodeDescriptor,
        tag: &Tag,
        previous: &[UserRecord],
        new_users: &[UserRecord],
    ) -> Result<(Vec<UserRecord>, usize, usize)> {
        let diff = diff_users(previous, new_users);
        let mut held = new_users.to_vec();
        let mut removed = 0;

        if !diff.deleted.is_empty() {
            let tags: Vec<Tag> = diff.deleted.iter().map(|u| user_tag(tag, u)).collect();
            if settle_removal(Step::RemoveUsers, self.engine.remove_users(&tags, tag).await)? {
                removed = diff.deleted.len();
                info!("{} users deleted from {}", removed, tag);
            } else {
                // Still installed, keep them held so the next diff retries
                held.extend(diff.deleted.iter().cloned());
            }
        }

        let mut added = 0;
        if !diff.added.is_empty() {
            let protocol = settle_required(Step::AddNode, NodeProtocol::from_descriptor(node))?;
            let (credentials, bound) = bind_credentials(&protocol, tag, &diff.added);
            let accepted = credentials.is_empty()
                || settle(Step::AddUsers, self.engine.add_users(credentials, tag).await)?
                    .is_some();

            if !accepted {
                // Not installed, drop them from the held set so the next diff retries
                for user in &diff.added {
                    if let Some(pos) = held.iter().position(|h| h == user) {
                        held.remove(pos);
                    }
                }
            } else if !bound.is_empty() {
                settle(
                    Step::UpdateLimiter,
                    self.engine
                        .update_limiter(tag, bind_limits(tag, &bound))
                        .await,
                )?;
                added = bound.len();
                info!("{} new users added to {}", added, tag);
            }
        }

        Ok((held, added, removed))
    }

    async fn apply_node(&self, resources: NodeResources) -> Result<()> {
        for inbound in resources.inbounds {
            settle_required(Step::AddNode, self.engine.add_inbound(inbound).await)?;
        }
        for outbound in resources.outbounds {
            settle_required(Step::AddNode, self.engine.add_outbound(outbound).await)?;
        }
        Ok(())
    }

    async fn teardown_node(&self, node: &NodeDescriptor, tag: &Tag) -> Result<()> {
        for resource in node_resource_tags(node, tag) {
            settle_removal(Step::RemoveNode, self.engine.remove_inbound(&resource).await)?;
            settle_removal(Step::RemoveNode, self.engine.remove_outbound(&resource).await)?;
        }
        settle_removal(Step::DeleteLimiter, self.engine.delete_limiter(tag).await)?;
        info!("Removed node resources of {}", tag);
        Ok(())
    }

    /// Install the full credential set; returns the held set and the number
    /// of users actually installed
    ///
    /// Users that cannot be bound are skipped but held, since binding them
    /// again cannot succeed until the control plane changes their record.
    async fn install_users(
        &self,
        node: &NodeDescriptor,
        tag: &Tag,
        users: &[UserRecord],
    ) -> Result<(Vec<UserRecord>, usize)> {
        let protocol = settle_required(Step::AddNode, NodeProtocol::from_descriptor(node))?;
        let (credentials, bound) = bind_credentials(&protocol, tag, users);
        if !credentials.is_empty() {
            settle_required(
                Step::InstallUsers,
                self.engine.add_users(credentials, tag).await,
            )?;
        }
        info!("Added {} users to {}", bound.len(), tag);
        Ok((users.to_vec(), bound.len()))
    }

    async fn fetch_rules(&self) -> Result<Option<RuleSet>> {
        settle(Step::FetchRules, self.api.get_node_rule().await)
    }

    /// Fetch the relay upstream and bind one detour per user
    ///
    /// Users whose detour cannot be bound are skipped. An engine failure
    /// rolls back the detours installed so far.
    async fn build_relay(&self, node_tag: &Tag, users: &[UserRecord]) -> Result<RelayState> {
        let descriptor = settle_required(Step::FetchRelay, self.api.get_relay_node_info().await)?;
        let protocol = settle_required(Step::AddRelay, RelayProtocol::from_descriptor(&descriptor))?;
        let mut relay = RelayState {
            tag: relay_tag(&descriptor),
            descriptor,
            bound: Vec::new(),
        };

        if let Err(e) = self.bind_relay(&mut relay, &protocol, node_tag, users).await {
            self.discard_relay(&relay).await;
            return Err(e);
        }
        Ok(relay)
    }

    async fn bind_relay(
        &self,
        relay: &mut RelayState,
        protocol: &RelayProtocol,
        node_tag: &Tag,
        users: &[UserRecord],
    ) -> Result<()> {
        for user in users {
            let binding = relay_password(protocol, user).and_then(|password| {
                bind_relay_user(
                    &relay.descriptor,
                    protocol,
                    &relay.tag,
                    node_tag,
                    user,
                    password,
                    &self.settings,
                )
            });
            let binding = match binding {
                Ok(binding) => binding,
                Err(e) => {
                    warn!("Skipping detour for user {}: {}", user.uid, e);
                    continue;
                }
            };

            let outbound_tag = binding.outbound.tag.clone();
            settle_required(
                Step::AddRelay,
                self.engine.add_outbound(binding.outbound).await,
            )?;
            relay.bound.push(RelayBound {
                uid: user.uid,
                outbound_tag: outbound_tag.clone(),
                user_tag: binding.user_tag.clone(),
            });
            settle_required(
                Step::AddRelay,
                self.engine
                    .add_routing_rules(&outbound_tag, &[binding.user_tag])
                    .await,
            )?;
        }
        Ok(())
    }

    /// Best-effort rollback of a relay that failed half way
    async fn discard_relay(&self, relay: &RelayState) {
        if let Err(e) = self.teardown_relay(relay, false).await {
            warn!("Failed to roll back detour route {}: {}", relay.tag, e);
        }
    }

    async fn teardown_relay(&self, relay: &RelayState, rules_removed: bool) -> Result<()> {
        if !rules_removed && !relay.bound.is_empty() {
            let user_tags: Vec<Tag> = relay.bound.iter().map(|b| b.user_tag.clone()).collect();
            settle_removal(
                Step::RemoveRoutingRules,
                self.engine.remove_routing_rules(&user_tags).await,
            )?;
        }
        for bound in &relay.bound {
            settle_removal(
                Step::RemoveRelay,
                self.engine.remove_outbound(&bound.outbound_tag).await,
            )?;
        }
        Ok(())
    }
}

/// Bind credentials, skipping users whose record cannot be bound
fn bind_credentials(
    protocol: &NodeProtocol,
    tag: &Tag,
    users: &[UserRecord],
) -> (Vec<UserCredential>, Vec<UserRecord>) {
    let mut credentials = Vec::with_capacity(users.len());
    let mut bound = Vec::with_capacity(users.len());
    for user in users {
        match bind_credential(protocol, tag, user) {
            Ok(credential) => {
                credentials.push(credential);
                bound.push(user.clone());
            }
            Err(e) => warn!("Skipping user {}: {}", user.uid, e),
        }
    }
    (credentials, bound)
}

/// Periodic node/user reconciliation
pub struct ReconcileTask {
    pub controller: Arc<NodeController>,
}

#[async_trait]
impl PeriodicTask for ReconcileTask {
    fn name(&self) -> &str {
        "node monitor"
    }

    fn interval(&self) -> Duration {
        self.controller.settings.update_interval()
    }

    async fn execute(&self) -> anyhow::Result<()> {
        let outcome = self.controller.tick().await?;
        if !outcome.skipped {
            debug!(
                "Cycle done: rebuilt={} relay={} +{} -{}",
                outcome.node_rebuilt,
                outcome.relay_rebuilt,
                outcome.users_added,
                outcome.users_removed
            );
        }
        Ok(())
    }
}
