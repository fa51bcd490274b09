//! Controller state model and step error dispatch

use std::fmt;

use serde::Serialize;
use tracing::{debug, warn};

use super::tags::Tag;
use crate::api::{NodeDescriptor, RelayNodeDescriptor, RuleSet, UserRecord};
use crate::error::{Error, Result};

/// Controller lifecycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Uninitialized,
    Starting,
    Running,
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Node sub-state while running
///
/// A node left in `Rebuilding` by an aborted cycle is rebuilt again on the
/// next cycle even if the descriptor no longer differs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodePhase {
    #[default]
    Stable,
    Rebuilding,
}

/// One user's detour as installed in the engine
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayBound {
    pub uid: u32,
    pub outbound_tag: Tag,
    pub user_tag: Tag,
}

/// Active relay: the upstream and exactly the resources bound to it
#[derive(Clone, Debug, PartialEq)]
pub struct RelayState {
    pub descriptor: RelayNodeDescriptor,
    pub tag: Tag,
    pub bound: Vec<RelayBound>,
}

/// The controller's held view of the node
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub node: NodeDescriptor,
    pub node_tag: Tag,
    pub node_phase: NodePhase,
    pub users: Vec<UserRecord>,
    /// Last user list the control plane published; every cycle diffs the
    /// held users against it
    pub published_users: Vec<UserRecord>,
    /// `None` while relay is disabled
    pub relay: Option<RelayState>,
    /// Relay must be rebuilt on the next cycle
    pub relay_pending: bool,
    pub rules: RuleSet,
}

/// State guarded by the controller's lock
#[derive(Debug, Default)]
pub struct ControllerState {
    pub phase: Phase,
    pub snapshot: Option<Snapshot>,
}

/// What one reconcile cycle changed
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    /// Startup grace period had not elapsed; nothing was fetched
    pub skipped: bool,
    pub node_rebuilt: bool,
    pub relay_rebuilt: bool,
    pub users_added: usize,
    pub users_removed: usize,
}

impl CycleOutcome {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }
}

/// What one report run delivered
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub status_reported: bool,
    pub traffic_users: usize,
    pub traffic_reported: bool,
    pub online_devices: usize,
    pub detections: usize,
}

/// Whether a failed step aborts its caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Criticality {
    /// The node is non-functional without it; the error propagates
    LoadBearing,
    /// Policy refinement; the error is logged and the caller continues
    BestEffort,
}

/// Every externally visible action the controller takes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    FetchNode,
    FetchUsers,
    FetchRelay,
    FetchRules,
    RegisterDns,
    AddNode,
    RemoveNode,
    InstallUsers,
    AddUsers,
    RemoveUsers,
    AddLimiter,
    UpdateLimiter,
    DeleteLimiter,
    AddRelay,
    RemoveRelay,
    RemoveRoutingRules,
    UpdateRules,
}

impl Step {
    pub fn criticality(&self) -> Criticality {
        match self {
            Step::FetchNode
            | Step::FetchUsers
            | Step::FetchRelay
            | Step::RegisterDns
            | Step::AddNode
            | Step::RemoveNode
            | Step::InstallUsers
            | Step::AddRelay
            | Step::RemoveRelay => Criticality::LoadBearing,
            Step::FetchRules
            | Step::UpdateRules
            | Step::AddUsers
            | Step::RemoveUsers
            | Step::AddLimiter
            | Step::UpdateLimiter
            | Step::DeleteLimiter
            | Step::RemoveRoutingRules => Criticality::BestEffort,
        }
    }

    /// Steps that tear resources down; a missing resource counts as done
    pub fn is_removal(&self) -> bool {
        matches!(
            self,
            Step::RemoveNode
                | Step::RemoveUsers
                | Step::DeleteLimiter
                | Step::RemoveRelay
                | Step::RemoveRoutingRules
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Step::FetchNode => "fetch_node",
            Step::FetchUsers => "fetch_users",
            Step::FetchRelay => "fetch_relay",
            Step::FetchRules => "fetch_rules",
            Step::RegisterDns => "register_dns",
            Step::AddNode => "add_node",
            Step::RemoveNode => "remove_node",
            Step::InstallUsers => "install_users",
            Step::AddUsers => "add_users",
            Step::RemoveUsers => "remove_users",
            Step::AddLimiter => "add_limiter",
            Step::UpdateLimiter => "update_limiter",
            Step::DeleteLimiter => "delete_limiter",
            Step::AddRelay => "add_relay",
            Step::RemoveRelay => "remove_relay",
            Step::RemoveRoutingRules => "remove_routing_rules",
            Step::UpdateRules => "update_rules",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single dispatcher for step errors.
///
/// Returns `Ok(Some(value))` on success, `Ok(None)` when a best-effort step
/// failed and the error was logged, and `Err` when a load-bearing step failed.
pub fn settle<T>(step: Step, result: Result<T>) -> Result<Option<T>> {
    let err = match result {
        Ok(value) => return Ok(Some(value)),
        Err(e) => e,
    };

    #[cfg(feature = "metrics")]
    super::metrics::inc_reconcile_error(step.as_str(), err.kind());

    match step.criticality() {
        Criticality::LoadBearing => Err(err),
        Criticality::BestEffort => {
            warn!("{} failed, continuing: {}", step, err);
            Ok(None)
        }
    }
}

/// [`settle`] for a load-bearing step whose value the caller needs
pub fn settle_required<T>(step: Step, result: Result<T>) -> Result<T> {
    debug_assert_eq!(step.criticality(), Criticality::LoadBearing);
    settle(step, result)?.ok_or_else(|| Error::EngineError(format!("{} produced no value", step)))
}

/// [`settle`] for a teardown; a resource that is already gone counts as
/// removed. Returns whether the resource is gone.
pub fn settle_removal(step: Step, result: Result<()>) -> Result<bool> {
    debug_assert!(step.is_removal());
    match result {
        Err(e) if e.is_not_found() => {
            debug!("{} found nothing to remove: {}", step, e);
            Ok(true)
        }
        other => Ok(settle(step, other)?.is_some()),
    }
}
