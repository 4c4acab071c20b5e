//! Supervisor: per-queue monitoring (expiration, stats, backlog warnings) and
//! maintenance (retention purges), coordinated across nodes by the store.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::events::{EventBus, WarningKind};
use crate::queue::{Queue, validate_queue_name};
use crate::store::{JobStore, MaintenanceReport, MonitorReport};

/// What one supervision pass did for a queue. `None` parts were skipped
/// because another node ran them within the interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSupervision {
    pub name: String,
    pub monitor: Option<MonitorReport>,
    pub maintenance: Option<MaintenanceReport>,
}

pub struct Supervisor {
    store: Arc<dyn JobStore>,
    events: EventBus,
    supervise_interval: Duration,
    monitor_interval: Duration,
    maintenance_interval: Duration,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn JobStore>,
        events: EventBus,
        supervise_interval: Duration,
        monitor_interval: Duration,
        maintenance_interval: Duration,
    ) -> Self {
        Self {
            store,
            events,
            supervise_interval,
            monitor_interval,
            maintenance_interval,
        }
    }

    /// Monitor and maintain one queue, or all of them, right now regardless
    /// of when the last pass ran.
    pub async fn supervise(&self, name: Option<&str>) -> Result<Vec<QueueSupervision>> {
        let queues = match name {
            Some(name) => {
                validate_queue_name(name)?;
                self.store.get_queues(Some(&[name.to_string()])).await?
            }
            None => self.store.get_queues(None).await?,
        };

        let mut results = Vec::with_capacity(queues.len());
        for queue in &queues {
            results.push(self.supervise_queue(queue, Duration::ZERO, Duration::ZERO).await?);
        }
        Ok(results)
    }

    /// One scheduled pass over every queue. A failing queue is reported and
    /// the rest still run.
    pub async fn run_cycle(&self) -> Result<()> {
        let queues = self.store.get_queues(None).await?;
        for queue in &queues {
            if let Err(e) = self
                .supervise_queue(queue, self.monitor_interval, self.maintenance_interval)
                .await
            {
                self.events.error("supervisor", format!("queue {}: {e}", queue.name()));
            }
        }
        Ok(())
    }

    async fn supervise_queue(
        &self,
        queue: &Queue,
        monitor_interval: Duration,
        maintenance_interval: Duration,
    ) -> Result<QueueSupervision> {
        let name = queue.name();

        let monitor = self.store.monitor_queue(name, monitor_interval).await?;
        if let Some(ref report) = monitor {
            if report.expired.affected() > 0 {
                info!(
                    queue = name,
                    retried = report.expired.retried.len(),
                    failed = report.expired.failed.len(),
                    "Expired active jobs"
                );
            }
            let threshold = queue.config.warning_queue_size;
            if threshold > 0 && report.stats.queued_count > threshold {
                self.events.warning(
                    WarningKind::QueueBacklog,
                    format!(
                        "Queue {name} has {} queued jobs, above its warning size of {threshold}",
                        report.stats.queued_count
                    ),
                    serde_json::json!({
                        "name": name,
                        "queued_count": report.stats.queued_count,
                        "warning_queue_size": threshold,
                    }),
                );
            }
        }

        let maintenance = self
            .store
            .maintain_queue(&queue.config, maintenance_interval)
            .await?;
        if let Some(report) = maintenance
            && report.purged_settled + report.purged_unclaimed > 0
        {
            info!(
                queue = name,
                settled = report.purged_settled,
                unclaimed = report.purged_unclaimed,
                "Purged old jobs"
            );
        }

        debug!(
            queue = name,
            monitored = monitor.is_some(),
            maintained = maintenance.is_some(),
            "Supervision pass finished"
        );
        Ok(QueueSupervision {
            name: name.to_string(),
            monitor,
            maintenance,
        })
    }

    /// Run `run_cycle` every `supervise_interval` until cancelled.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.supervise_interval.as_secs(),
                "Supervisor started"
            );
            let mut ticker = tokio::time::interval(self.supervise_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cycle().await {
                            self.events.error("supervisor", e);
                        }
                    }
                }
            }
            info!("Supervisor stopped");
        })
    }
}
