//! Job submission: option resolution, start times and dedup time slots.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, ValidationError};
use crate::job::model::window_millis;
use crate::job::{JobInsert, NewJob, SendOptions, StartAfter, StartAt};
use crate::queue::{QueueConfig, QueueRegistry, validate_queue_name};
use crate::store::JobStore;
use crate::timekeeper::ClockSkew;

/// Start of the `window_seconds` slot containing `now_ms`.
pub fn time_slot(now_ms: i64, window_seconds: u64) -> i64 {
    let window_ms = window_millis(window_seconds).unwrap_or(i64::MAX).max(1);
    now_ms.div_euclid(window_ms) * window_ms
}

/// Resolve caller options against the queue config into an insertable row.
///
/// `now_ms` is the skew-corrected clock, used only for the dedup slot.
pub fn resolve_job(
    config: &QueueConfig,
    data: serde_json::Value,
    options: &SendOptions,
    now_ms: i64,
) -> std::result::Result<NewJob, ValidationError> {
    options.validate()?;
    if config.policy.requires_key() && options.singleton_key.is_none() {
        return Err(ValidationError::SingletonKeyRequired {
            name: config.name.clone(),
            policy: config.policy.to_string(),
        });
    }

    let retry_backoff = options.retry_backoff.unwrap_or(config.retry_backoff);
    let mut retry_delay_seconds = options
        .retry_delay_seconds
        .unwrap_or(config.retry_delay_seconds);
    if retry_backoff && retry_delay_seconds == 0 {
        retry_delay_seconds = 1;
    }
    let retry_delay_max_seconds = options
        .retry_delay_max_seconds
        .or(config.retry_delay_max_seconds);
    if let Some(max) = retry_delay_max_seconds
        && max < retry_delay_seconds
    {
        return Err(ValidationError::option(
            "retry_delay_max_seconds",
            "must not be lower than retry_delay_seconds",
        ));
    }

    let start_at = match options.start_after {
        None => StartAt::Now,
        Some(StartAfter::At(at)) => StartAt::AtMillis(at.timestamp_millis()),
        Some(StartAfter::Delay(delay)) => StartAt::OffsetMillis(delay.as_millis() as i64),
    };
    let singleton_on = options
        .singleton_seconds
        .map(|window| time_slot(now_ms, window));

    Ok(NewJob {
        id: options.id.unwrap_or_else(Uuid::now_v7),
        name: config.name.clone(),
        priority: options.priority,
        data,
        retry_limit: options.retry_limit.unwrap_or(config.retry_limit),
        retry_delay_seconds,
        retry_backoff,
        retry_delay_max_seconds,
        expire_in_seconds: options.expire_in_seconds.unwrap_or(config.expire_in_seconds),
        singleton_key: options.singleton_key.clone(),
        singleton_on,
        group_id: options.group.as_ref().map(|g| g.id.clone()),
        group_tier: options.group.as_ref().and_then(|g| g.tier.clone()),
        start_at,
        keep_until: options.keep_until.map(|t| t.timestamp_millis()),
        retention_seconds: config.retention_seconds,
        dead_letter: options.dead_letter.clone().or_else(|| config.dead_letter.clone()),
        policy: config.policy,
    })
}

/// Validates and inserts jobs.
pub struct Submission {
    store: Arc<dyn JobStore>,
    registry: Arc<QueueRegistry>,
    clock: ClockSkew,
}

impl Submission {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<QueueRegistry>, clock: ClockSkew) -> Self {
        Self {
            store,
            registry,
            clock,
        }
    }

    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis() + self.clock.skew_ms()
    }

    /// Insert one job. `None` when a policy or throttle constraint dropped it.
    pub async fn send(
        &self,
        name: &str,
        data: serde_json::Value,
        options: SendOptions,
    ) -> Result<Option<Uuid>> {
        self.send_at(name, data, options, self.now_ms()).await
    }

    /// Send a cron-generated job. The dedup slot is taken from the trigger
    /// time, so every tick that sees the same trigger lands in the same slot.
    pub(crate) async fn send_scheduled(
        &self,
        name: &str,
        data: serde_json::Value,
        options: SendOptions,
        fired_at_ms: i64,
    ) -> Result<Option<Uuid>> {
        self.send_at(name, data, options, fired_at_ms).await
    }

    async fn send_at(
        &self,
        name: &str,
        data: serde_json::Value,
        options: SendOptions,
        now_ms: i64,
    ) -> Result<Option<Uuid>> {
        validate_queue_name(name)?;
        let config = self.registry.config(name).await?;
        let job = resolve_job(&config, data, &options, now_ms)?;

        if let Some(id) = self.store.insert_job(&job).await? {
            debug!(queue = name, job_id = %id, "Job sent");
            return Ok(Some(id));
        }

        // Debounce: the current slot is taken, try the next one.
        if let (true, Some(window)) = (options.singleton_next_slot, options.singleton_seconds) {
            let next_slot = window_millis(window)
                .and_then(|ms| time_slot(now_ms, window).checked_add(ms))
                .ok_or_else(|| ValidationError::option("singleton_seconds", "window is too large"))?;
            let deferred = NewJob {
                id: Uuid::now_v7(),
                singleton_on: Some(next_slot),
                start_at: StartAt::AtMillis(next_slot),
                ..job
            };
            let id = self.store.insert_job(&deferred).await?;
            debug!(queue = name, job_id = ?id, next_slot, "Debounced job deferred to next slot");
            return Ok(id);
        }
        Ok(None)
    }

    /// Send with a start delay or start time.
    pub async fn send_after(
        &self,
        name: &str,
        data: serde_json::Value,
        options: SendOptions,
        start_after: StartAfter,
    ) -> Result<Option<Uuid>> {
        self.send(name, data, options.with_start_after(start_after)).await
    }

    /// At most one job per key per `seconds` slot; duplicates are dropped.
    pub async fn send_throttled(
        &self,
        name: &str,
        data: serde_json::Value,
        options: SendOptions,
        seconds: u64,
        key: Option<String>,
    ) -> Result<Option<Uuid>> {
        let options = SendOptions {
            singleton_seconds: Some(seconds),
            singleton_next_slot: false,
            singleton_key: key.or(options.singleton_key),
            ..options
        };
        self.send(name, data, options).await
    }

    /// Like `send_throttled`, but a duplicate is deferred to the next slot.
    pub async fn send_debounced(
        &self,
        name: &str,
        data: serde_json::Value,
        options: SendOptions,
        seconds: u64,
        key: Option<String>,
    ) -> Result<Option<Uuid>> {
        let options = SendOptions {
            singleton_seconds: Some(seconds),
            singleton_next_slot: true,
            singleton_key: key.or(options.singleton_key),
            ..options
        };
        self.send(name, data, options).await
    }

    /// Insert many jobs in one transaction. Returns the ids that were kept.
    pub async fn insert(&self, name: &str, jobs: Vec<JobInsert>) -> Result<Vec<Uuid>> {
        validate_queue_name(name)?;
        let config = self.registry.config(name).await?;
        let now_ms = self.now_ms();
        let rows = jobs
            .into_iter()
            .map(|job| resolve_job(&config, job.data, &job.options, now_ms))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let ids = self.store.insert_jobs(&rows).await?;
        debug!(queue = name, requested = rows.len(), inserted = ids.len(), "Jobs inserted");
        Ok(ids)
    }
}

/// Convenience for `StartAfter::Delay` from whole seconds.
pub fn delay_seconds(seconds: u64) -> StartAfter {
    StartAfter::Delay(Duration::from_secs(seconds))
}
