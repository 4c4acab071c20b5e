//! Timekeeper: clock skew tracking and cron schedules that send jobs.

pub mod schedule;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::Result;
use crate::events::{EventBus, WarningKind};
use crate::job::Submission;
use crate::queue::{QueueRegistry, validate_queue_name};
use crate::store::JobStore;

pub use schedule::{SEND_WINDOW_SECONDS, Schedule, ScheduleOptions, parse_cron, parse_timezone};

/// Skew above which a `ClockSkew` warning is emitted.
const SKEW_WARNING_MS: i64 = 60_000;

/// Slack subtracted from the cron slot so tick jitter cannot skip a whole tick.
const CRON_SLACK: Duration = Duration::from_millis(500);

/// Store time minus local time, in milliseconds. Cloned handles share one value.
#[derive(Debug, Clone, Default)]
pub struct ClockSkew(Arc<AtomicI64>);

impl ClockSkew {
    pub fn skew_ms(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, skew_ms: i64) {
        self.0.store(skew_ms, Ordering::Relaxed);
    }

    /// Local time corrected towards the store clock.
    pub fn now(&self) -> chrono::DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(self.skew_ms())
    }
}

pub struct Timekeeper {
    store: Arc<dyn JobStore>,
    registry: Arc<QueueRegistry>,
    submission: Arc<Submission>,
    events: EventBus,
    clock: ClockSkew,
    clock_interval: Duration,
    cron_interval: Duration,
}

impl Timekeeper {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<QueueRegistry>,
        submission: Arc<Submission>,
        events: EventBus,
        clock: ClockSkew,
        clock_interval: Duration,
        cron_interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            submission,
            events,
            clock,
            clock_interval,
            cron_interval,
        }
    }

    /// Resample the skew between the store clock and the local clock.
    pub async fn sync_clock(&self) -> Result<i64> {
        let local_before = Utc::now().timestamp_millis();
        let store_now = self.store.now_ms().await?;
        let local_after = Utc::now().timestamp_millis();
        let skew = store_now - (local_before + local_after) / 2;
        self.clock.set(skew);

        if skew.abs() > SKEW_WARNING_MS {
            let direction = if skew > 0 { "ahead of" } else { "behind" };
            self.events.warning(
                WarningKind::ClockSkew,
                format!(
                    "Store clock is {}s {direction} this node",
                    skew.abs() / 1000
                ),
                serde_json::json!({ "seconds": skew / 1000, "direction": direction }),
            );
        } else {
            debug!(skew_ms = skew, "Clock skew sampled");
        }
        Ok(skew)
    }

    /// Take the cron slot and send every due schedule. Returns the number of
    /// jobs created, or `None` when another node holds the slot.
    pub async fn cron_tick(&self) -> Result<Option<usize>> {
        let slot = self.cron_interval.saturating_sub(CRON_SLACK);
        if !self.store.try_cron_tick(slot).await? {
            debug!("Cron slot held by another node");
            return Ok(None);
        }
        self.send_due().await.map(Some)
    }

    /// Send a job for every schedule whose latest trigger is within the
    /// send window. Bad schedules are reported and skipped.
    pub async fn send_due(&self) -> Result<usize> {
        let now = self.clock.now();
        let schedules = self.store.get_schedules(None, None).await?;
        let mut sent = 0;

        for schedule in schedules {
            let fired_at = match schedule.due_at(now) {
                Ok(Some(fired_at)) => fired_at,
                Ok(None) => continue,
                Err(e) => {
                    self.events.error("timekeeper", e);
                    continue;
                }
            };
            let data = schedule.data.clone().unwrap_or(serde_json::Value::Null);
            match self
                .submission
                .send_scheduled(
                    &schedule.name,
                    data,
                    schedule.send_options(),
                    fired_at.timestamp_millis(),
                )
                .await
            {
                Ok(Some(id)) => {
                    info!(queue = %schedule.name, key = %schedule.key, job_id = %id, "Scheduled job sent");
                    sent += 1;
                }
                Ok(None) => {
                    debug!(queue = %schedule.name, key = %schedule.key, "Scheduled job already sent");
                }
                Err(e) => self.events.error("timekeeper", e),
            }
        }
        Ok(sent)
    }

    /// Create or replace the schedule `(name, options.key)`.
    pub async fn schedule(
        &self,
        name: &str,
        cron: &str,
        data: Option<serde_json::Value>,
        options: ScheduleOptions,
    ) -> Result<Schedule> {
        validate_queue_name(name)?;
        parse_cron(cron)?;
        let timezone = options.tz.clone().unwrap_or_else(|| "UTC".to_string());
        parse_timezone(&timezone)?;
        self.registry.config(name).await?;
        if let Some(ref dead_letter) = options.dead_letter {
            self.registry.config(dead_letter).await?;
        }

        let now = Utc::now();
        let schedule = Schedule {
            name: name.to_string(),
            key: options.key.clone().unwrap_or_default(),
            cron: cron.trim().to_string(),
            timezone,
            data,
            options,
            created_on: now,
            updated_on: now,
        };
        self.store.upsert_schedule(&schedule).await?;
        info!(queue = name, key = %schedule.key, cron = %schedule.cron, "Schedule registered");
        Ok(schedule)
    }

    /// Remove one schedule by key, or all of the queue's schedules.
    pub async fn unschedule(&self, name: &str, key: Option<&str>) -> Result<u64> {
        validate_queue_name(name)?;
        let removed = self.store.delete_schedule(name, key).await?;
        info!(queue = name, key = ?key, removed, "Schedule removed");
        Ok(removed)
    }

    pub async fn get_schedules(&self, name: Option<&str>, key: Option<&str>) -> Result<Vec<Schedule>> {
        if let Some(name) = name {
            validate_queue_name(name)?;
        }
        Ok(self.store.get_schedules(name, key).await?)
    }

    /// Run clock sampling and cron ticks until cancelled. Failed cycles are
    /// emitted and the loop carries on.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                cron_interval_secs = self.cron_interval.as_secs(),
                "Timekeeper started"
            );
            let mut clock_tick = tokio::time::interval(self.clock_interval);
            let mut cron_tick = tokio::time::interval(self.cron_interval);
            cron_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = clock_tick.tick() => {
                        if let Err(e) = self.sync_clock().await {
                            self.events.error("timekeeper", e);
                        }
                    }
                    _ = cron_tick.tick() => {
                        if let Err(e) = self.cron_tick().await {
                            self.events.error("timekeeper", e);
                        }
                    }
                }
            }
            info!("Timekeeper stopped");
        })
    }
}

impl std::fmt::Display for ClockSkew {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.skew_ms())
    }
}
