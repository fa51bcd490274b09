//! Controller module for node reconciliation
//! This module contains the reconciliation state machine, the resource
//! binder, and the periodic reporting and certificate duties of a node.

pub mod binder;
#[cfg(test)]
mod binder_test;
mod cert;
#[cfg(feature = "metrics")]
pub mod metrics;
mod reconciler;
mod reporter;
pub mod state;
pub mod tags;
#[cfg(test)]
pub(crate) mod test_support;
pub mod users;

pub use cert::CertTask;
pub use reconciler::{NodeController, ReconcileTask};
pub use reporter::ReportTask;
pub use state::{CycleOutcome, NodePhase, Phase, RelayState, ReportSummary, Snapshot, Step};
pub use tags::Tag;
pub use users::{diff_users, UserDiff};
