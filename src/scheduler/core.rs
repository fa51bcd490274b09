use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// A named unit of work run on a fixed interval
#[async_trait]
pub trait PeriodicTask: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn interval(&self) -> Duration;

    async fn execute(&self) -> Result<()>;
}

/// Runs registered tasks on independent intervals
///
/// Each task gets its own tokio task, so a slow or failing task never delays
/// another. Executions of one task never overlap, and a missed tick is not
/// made up. Stopping waits for in-flight executions to finish.
pub struct Scheduler {
    tasks: Vec<Arc<dyn PeriodicTask>>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tasks: Vec::new(),
            shutdown,
            handles: Vec::new(),
        }
    }

    pub fn register(&mut self, task: Arc<dyn PeriodicTask>) {
        self.tasks.push(task);
    }

    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn start(&mut self) {
        if self.is_running() {
            warn!("Scheduler already started");
            return;
        }
        for task in &self.tasks {
            info!(
                "Task scheduler for {} started (every {:?})",
                task.name(),
                task.interval()
            );
            let handle = tokio::spawn(run_task(task.clone(), self.shutdown.subscribe()));
            self.handles.push(handle);
        }
    }

    /// Signal every task to stop and wait for in-flight executions
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                warn!("Task scheduler exited abnormally: {}", e);
            }
        }
        info!("All task schedulers stopped");
    }
}

async fn run_task(task: Arc<dyn PeriodicTask>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(task.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        // Outside the select so shutdown never cancels a running execution
        run_once(task.as_ref()).await;
    }
    debug!("Task scheduler for {} exited", task.name());
}

async fn run_once(task: &dyn PeriodicTask) {
    match AssertUnwindSafe(task.execute()).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!("Task {} failed: {:#}", task.name(), e);
            #[cfg(feature = "metrics")]
            crate::controller::metrics::inc_task_failure(task.name());
        }
        Err(_) => {
            error!("Task {} panicked", task.name());
            #[cfg(feature = "metrics")]
            crate::controller::metrics::inc_task_failure(task.name());
        }
    }
}
