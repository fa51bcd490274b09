//! Traffic and status reporting

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use super::reconciler::NodeController;
use super::state::ReportSummary;
use super::tags::user_tag;
use crate::api::UserTraffic;
use crate::engine::CounterHandle;
use crate::error::Result;
use crate::scheduler::PeriodicTask;

impl NodeController {
    /// Report vitals, traffic, online devices and detection hits
    ///
    /// Each report is independent: a failure is logged and the others still
    /// run. Traffic counters are reset only after the control plane accepted
    /// the traffic report, so unreported traffic accumulates into the next
    /// one.
    #[instrument(skip(self), fields(node_id = self.identity.node_id))]
    pub async fn report(&self) -> Result<ReportSummary> {
        let snapshot = self.held().await?;
        let tag = &snapshot.node_tag;
        let mut summary = ReportSummary::default();

        match self.vitals.sample().await {
            Ok(status) => match self.api.report_node_status(&status).await {
                Ok(()) => summary.status_reported = true,
                Err(e) => warn!("Failed to report status of {}: {}", tag, e),
            },
            Err(e) => warn!("Failed to sample host vitals: {}", e),
        }

        let mut batch = Vec::new();
        let mut handles: Vec<CounterHandle> = Vec::new();
        for user in &snapshot.users {
            let counters = self.engine.traffic_counters(&user_tag(tag, user)).await;
            if counters.is_idle() {
                continue;
            }
            handles.extend(counters.handles().cloned());
            batch.push(UserTraffic {
                uid: user.uid,
                email: user.email.clone(),
                upload: counters.upload,
                download: counters.download,
            });
        }
        summary.traffic_users = batch.len();

        if !batch.is_empty() {
            match self.api.report_user_traffic(&batch).await {
                Ok(()) => {
                    self.engine.reset_counters(&handles).await;
                    summary.traffic_reported = true;
                    #[cfg(feature = "metrics")]
                    {
                        let upload = batch.iter().map(|t| t.upload).sum();
                        let download = batch.iter().map(|t| t.download).sum();
                        super::metrics::add_reported_traffic(
                            self.identity.node_id,
                            upload,
                            download,
                        );
                    }
                    debug!("Reported traffic of {} users on {}", batch.len(), tag);
                }
                Err(e) => warn!(
                    "Failed to report traffic of {} users on {}, keeping counters: {}",
                    batch.len(),
                    tag,
                    e
                ),
            }
        }

        match self.engine.online_devices(tag).await {
            Ok(online) if !online.is_empty() => {
                match self.api.report_node_online_users(&online).await {
                    Ok(()) => summary.online_devices = online.len(),
                    Err(e) => warn!("Failed to report online users of {}: {}", tag, e),
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to read online users of {}: {}", tag, e),
        }

        match self.engine.detection_hits(tag).await {
            Ok(hits) if !hits.is_empty() => match self.api.report_illegal(&hits).await {
                Ok(()) => {
                    summary.detections = hits.len();
                    info!("Reported {} detection hits on {}", hits.len(), tag);
                }
                Err(e) => warn!("Failed to report detection hits of {}: {}", tag, e),
            },
            Ok(_) => {}
            Err(e) => warn!("Failed to read detection hits of {}: {}", tag, e),
        }

        Ok(summary)
    }
}

/// Periodic reporting
pub struct ReportTask {
    pub controller: Arc<NodeController>,
}

#[async_trait]
impl PeriodicTask for ReportTask {
    fn name(&self) -> &str {
        "user monitor"
    }

    fn interval(&self) -> Duration {
        self.controller.settings.report_interval()
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.controller.report().await?;
        Ok(())
    }
}
