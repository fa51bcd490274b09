//! Certificate renewal task

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use super::reconciler::NodeController;
use crate::error::Result;
use crate::scheduler::PeriodicTask;
use crate::tls::RenewOutcome;

impl NodeController {
    /// Renew the current node's certificate if its mode calls for it
    #[instrument(skip(self), fields(node_id = self.identity.node_id))]
    pub async fn check_certificate(&self) -> Result<RenewOutcome> {
        let node = self.held().await?.node;
        if !node.enable_tls || !node.cert_mode.is_renewable() {
            debug!("No certificate to renew in {} mode", node.cert_mode.as_str());
            return Ok(RenewOutcome::Skipped);
        }

        let outcome = self
            .certs
            .renew(node.cert_mode, &node.cert_domain)
            .await?;
        if let RenewOutcome::Issued { expires_at } = &outcome {
            info!(
                "Issued certificate for {} valid until {}",
                node.cert_domain, expires_at
            );
        }
        Ok(outcome)
    }
}

/// Periodic certificate renewal; failures are retried on the next tick
pub struct CertTask {
    pub controller: Arc<NodeController>,
}

#[async_trait]
impl PeriodicTask for CertTask {
    fn name(&self) -> &str {
        "cert monitor"
    }

    fn interval(&self) -> Duration {
        self.controller.settings.cert_check_interval()
    }

    async fn execute(&self) -> anyhow::Result<()> {
        self.controller.check_certificate().await?;
        Ok(())
    }
}
