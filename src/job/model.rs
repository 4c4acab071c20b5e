//! Job data model.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::queue::QueuePolicy;

/// State of a job.
///
/// The discriminants are persisted and ordered: everything below `Active` is
/// waiting, everything above it is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created = 0,
    Retry = 1,
    Active = 2,
    Completed = 3,
    Cancelled = 4,
    Failed = 5,
}

impl JobState {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Created),
            1 => Some(Self::Retry),
            2 => Some(Self::Active),
            3 => Some(Self::Completed),
            4 => Some(Self::Cancelled),
            5 => Some(Self::Failed),
            _ => None,
        }
    }

    /// Waiting to be claimed.
    pub fn is_queued(self) -> bool {
        self < Self::Active
    }

    /// Completed, cancelled or failed.
    pub fn is_terminal(self) -> bool {
        self > Self::Active
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Retry => "retry",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Optional secondary grouping that bounds concurrently active jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobGroup {
    pub id: String,
    pub tier: Option<String>,
}

impl JobGroup {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tier: None,
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }
}

/// A claimed job as handed to a handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub data: serde_json::Value,
    pub expire_in_seconds: u64,
    pub group_id: Option<String>,
    pub group_tier: Option<String>,
    /// Full row, present when the caller asked for metadata.
    pub metadata: Option<JobDetails>,
}

/// Every persisted column of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetails {
    pub id: Uuid,
    pub name: String,
    pub priority: i64,
    pub data: serde_json::Value,
    pub state: JobState,
    pub retry_limit: u32,
    pub retry_count: u32,
    pub retry_delay_seconds: u64,
    pub retry_backoff: bool,
    pub retry_delay_max_seconds: Option<u64>,
    pub expire_in_seconds: u64,
    pub singleton_key: Option<String>,
    pub singleton_on: Option<DateTime<Utc>>,
    pub group_id: Option<String>,
    pub group_tier: Option<String>,
    pub start_after: DateTime<Utc>,
    pub created_on: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
    pub keep_until: DateTime<Utc>,
    pub output: Option<serde_json::Value>,
    pub dead_letter: Option<String>,
    pub policy: QueuePolicy,
}

impl JobDetails {
    /// Project into the handler-facing shape.
    pub fn into_job(self, include_metadata: bool) -> Job {
        let mut job = Job {
            id: self.id,
            name: self.name.clone(),
            data: self.data.clone(),
            expire_in_seconds: self.expire_in_seconds,
            group_id: self.group_id.clone(),
            group_tier: self.group_tier.clone(),
            metadata: None,
        };
        if include_metadata {
            job.metadata = Some(self);
        }
        job
    }
}

/// When a job becomes claimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAfter {
    At(DateTime<Utc>),
    Delay(Duration),
}

/// Per-send options. Unset retry/expiry fields inherit the queue's config.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub id: Option<Uuid>,
    pub priority: i64,
    pub start_after: Option<StartAfter>,
    pub singleton_key: Option<String>,
    /// Throttle window: one job per key per slot of this many seconds.
    pub singleton_seconds: Option<u64>,
    /// On a slot collision, try the next slot instead of dropping (debounce).
    pub singleton_next_slot: bool,
    pub retry_limit: Option<u32>,
    pub retry_delay_seconds: Option<u64>,
    pub retry_backoff: Option<bool>,
    pub retry_delay_max_seconds: Option<u64>,
    pub expire_in_seconds: Option<u64>,
    pub keep_until: Option<DateTime<Utc>>,
    pub dead_letter: Option<String>,
    pub group: Option<JobGroup>,
}

impl SendOptions {
    pub fn with_singleton_key(mut self, key: impl Into<String>) -> Self {
        self.singleton_key = Some(key.into());
        self
    }

    pub fn with_start_after(mut self, start_after: StartAfter) -> Self {
        self.start_after = Some(start_after);
        self
    }

    pub fn with_group(mut self, group: JobGroup) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        if let Some(0) = self.singleton_seconds {
            return Err(ValidationError::option(
                "singleton_seconds",
                "must be at least 1",
            ));
        }
        if let Some(seconds) = self.singleton_seconds
            && window_millis(seconds).is_none()
        {
            return Err(ValidationError::option("singleton_seconds", "window is too large"));
        }
        if self.singleton_next_slot && self.singleton_seconds.is_none() {
            return Err(ValidationError::option(
                "singleton_next_slot",
                "requires singleton_seconds",
            ));
        }
        if let Some(0) = self.expire_in_seconds {
            return Err(ValidationError::option(
                "expire_in_seconds",
                "must be at least 1",
            ));
        }
        if let Some(ref key) = self.singleton_key
            && key.is_empty()
        {
            return Err(ValidationError::option("singleton_key", "must not be empty"));
        }
        if let Some(ref group) = self.group
            && group.id.is_empty()
        {
            return Err(ValidationError::option("group.id", "must not be empty"));
        }
        if let Some(ref dead_letter) = self.dead_letter {
            crate::queue::validate_queue_name(dead_letter)?;
        }
        Ok(())
    }
}

/// A dedup window in milliseconds, `None` when it does not fit an `i64`.
pub(crate) fn window_millis(seconds: u64) -> Option<i64> {
    i64::try_from(seconds).ok()?.checked_mul(1000)
}

/// One entry of a bulk insert.
#[derive(Debug, Clone)]
pub struct JobInsert {
    pub data: serde_json::Value,
    pub options: SendOptions,
}

impl JobInsert {
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            options: SendOptions::default(),
        }
    }
}

/// Resolution of `StartAfter` for the store: absolute or relative to store time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAt {
    Now,
    AtMillis(i64),
    OffsetMillis(i64),
}

/// A fully resolved row, ready to insert.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: Uuid,
    pub name: String,
    pub priority: i64,
    pub data: serde_json::Value,
    pub retry_limit: u32,
    pub retry_delay_seconds: u64,
    pub retry_backoff: bool,
    pub retry_delay_max_seconds: Option<u64>,
    pub expire_in_seconds: u64,
    pub singleton_key: Option<String>,
    /// Start of the dedup slot, epoch ms.
    pub singleton_on: Option<i64>,
    pub group_id: Option<String>,
    pub group_tier: Option<String>,
    pub start_at: StartAt,
    /// Epoch ms; `None` means start time plus `retention_seconds`.
    pub keep_until: Option<i64>,
    pub retention_seconds: u64,
    pub dead_letter: Option<String>,
    pub policy: QueuePolicy,
}

/// Per-group cap on concurrently active jobs, optionally by tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupConcurrency {
    pub default: u32,
    #[serde(default)]
    pub tiers: BTreeMap<String, u32>,
}

impl GroupConcurrency {
    pub fn new(default: u32) -> Self {
        Self {
            default,
            tiers: BTreeMap::new(),
        }
    }

    pub fn with_tier(mut self, tier: impl Into<String>, limit: u32) -> Self {
        self.tiers.insert(tier.into(), limit);
        self
    }

    /// Limit that applies to a job in `tier`.
    pub fn limit_for(&self, tier: Option<&str>) -> u32 {
        tier.and_then(|t| self.tiers.get(t).copied())
            .unwrap_or(self.default)
    }

    pub(crate) fn validate(&self, field: &str) -> Result<(), ValidationError> {
        if self.default == 0 || self.tiers.values().any(|limit| *limit == 0) {
            return Err(ValidationError::option(field, "limits must be at least 1"));
        }
        Ok(())
    }
}

/// Options for one claim.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub batch_size: usize,
    /// Order by priority before creation order.
    pub priority: bool,
    pub include_metadata: bool,
    /// Store-backed, cross-node group cap.
    pub group_concurrency: Option<GroupConcurrency>,
    pub exclude_singleton_keys: Vec<String>,
    pub exclude_group_ids: Vec<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            priority: true,
            include_metadata: false,
            group_concurrency: None,
            exclude_singleton_keys: Vec::new(),
            exclude_group_ids: Vec::new(),
        }
    }
}

impl FetchOptions {
    pub fn batch(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ValidationError> {
        if self.batch_size == 0 {
            return Err(ValidationError::option("batch_size", "must be at least 1"));
        }
        if let Some(ref groups) = self.group_concurrency {
            groups.validate("group_concurrency")?;
        }
        Ok(())
    }
}

/// Filter for `find_jobs`.
#[derive(Debug, Clone, Default)]
pub struct FindJobsFilter {
    pub id: Option<Uuid>,
    pub singleton_key: Option<String>,
    pub state: Option<JobState>,
    /// Only jobs that are still waiting to be claimed.
    pub queued: bool,
}
