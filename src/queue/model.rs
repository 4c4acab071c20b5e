//! Queue data model: policies, options, resolved config, and stats.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRY_LIMIT: u32 = 2;
/// Default active-job deadline: 15 minutes.
pub const DEFAULT_EXPIRE_SECONDS: u64 = 900;
/// Default lifetime of an unclaimed job: 14 days.
pub const DEFAULT_RETENTION_SECONDS: u64 = 14 * 24 * 60 * 60;
/// Default time a settled job is kept before deletion: 7 days.
pub const DEFAULT_DELETE_AFTER_SECONDS: u64 = 7 * 24 * 60 * 60;

static QUEUE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[\w.\-/]+$").unwrap_or_else(|e| panic!("queue name regex: {e}"))
});

/// Check a queue name against the allowed character set.
pub fn validate_queue_name(name: &str) -> Result<(), ValidationError> {
    if name.len() > 255 || !QUEUE_NAME_RE.is_match(name) {
        return Err(ValidationError::InvalidQueueName(name.to_string()));
    }
    Ok(())
}

/// Per-queue invariant governing singleton-key uniqueness and concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// No key invariant.
    #[default]
    Standard,
    /// At most one queued job per key.
    Short,
    /// At most one active job per key.
    Singleton,
    /// At most one job per key in each of created, retry and active.
    Stately,
    /// At most one job per key across all non-terminal states.
    Exclusive,
    /// At most one job per key across active, retry and failed; strict per-key order.
    KeyStrictFifo,
}

impl QueuePolicy {
    pub const ALL: [QueuePolicy; 6] = [
        QueuePolicy::Standard,
        QueuePolicy::Short,
        QueuePolicy::Singleton,
        QueuePolicy::Stately,
        QueuePolicy::Exclusive,
        QueuePolicy::KeyStrictFifo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Short => "short",
            Self::Singleton => "singleton",
            Self::Stately => "stately",
            Self::Exclusive => "exclusive",
            Self::KeyStrictFifo => "key_strict_fifo",
        }
    }

    /// Whether one claim batch may hold at most one job per key.
    pub fn dedups_batch(&self) -> bool {
        matches!(self, Self::Singleton | Self::Stately | Self::KeyStrictFifo)
    }

    /// Whether every job must carry a singleton key.
    pub fn requires_key(&self) -> bool {
        matches!(self, Self::KeyStrictFifo)
    }
}

impl fmt::Display for QueuePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueuePolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QueuePolicy::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ValidationError::option("policy", format!("unknown policy '{s}'")))
    }
}

/// Caller-supplied queue settings. Unset fields take the documented defaults
/// on create, or keep their current value on update.
#[derive(Debug, Clone, Default)]
pub struct QueueOptions {
    pub policy: Option<QueuePolicy>,
    /// Give the queue its own copy of the policy index.
    pub partition: Option<bool>,
    pub dead_letter: Option<String>,
    pub retry_limit: Option<u32>,
    pub retry_delay_seconds: Option<u64>,
    pub retry_backoff: Option<bool>,
    pub retry_delay_max_seconds: Option<u64>,
    pub expire_in_seconds: Option<u64>,
    pub retention_seconds: Option<u64>,
    pub delete_after_seconds: Option<u64>,
    /// Emit a backlog warning once the queued count exceeds this (0 = off).
    pub warning_queue_size: Option<u64>,
    /// On update, remove the dead letter queue. Conflicts with `dead_letter`.
    pub clear_dead_letter: bool,
    /// On update, remove the retry delay cap. Conflicts with `retry_delay_max_seconds`.
    pub clear_retry_delay_max: bool,
}

impl QueueOptions {
    pub fn with_policy(policy: QueuePolicy) -> Self {
        Self {
            policy: Some(policy),
            ..Self::default()
        }
    }

    /// Update that removes the dead letter queue.
    pub fn without_dead_letter(mut self) -> Self {
        self.clear_dead_letter = true;
        self
    }

    /// Update that removes the retry delay cap.
    pub fn without_retry_delay_max(mut self) -> Self {
        self.clear_retry_delay_max = true;
        self
    }
}

/// New value of an optional setting on update.
fn merge_optional<T: Clone>(
    field: &str,
    current: &Option<T>,
    requested: &Option<T>,
    clear: bool,
) -> Result<Option<T>, ValidationError> {
    match (requested, clear) {
        (Some(_), true) => Err(ValidationError::option(field, "cannot be both set and cleared")),
        (Some(value), false) => Ok(Some(value.clone())),
        (None, true) => Ok(None),
        (None, false) => Ok(current.clone()),
    }
}

/// Fully resolved, validated queue configuration as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub policy: QueuePolicy,
    pub partition: bool,
    pub dead_letter: Option<String>,
    pub retry_limit: u32,
    pub retry_delay_seconds: u64,
    pub retry_backoff: bool,
    pub retry_delay_max_seconds: Option<u64>,
    pub expire_in_seconds: u64,
    pub retention_seconds: u64,
    pub delete_after_seconds: u64,
    pub warning_queue_size: u64,
}

impl QueueConfig {
    /// Resolve options for a brand-new queue.
    pub fn resolve(name: &str, options: &QueueOptions) -> Result<Self, ValidationError> {
        validate_queue_name(name)?;
        let config = Self {
            name: name.to_string(),
            policy: options.policy.unwrap_or_default(),
            partition: options.partition.unwrap_or(false),
            dead_letter: options.dead_letter.clone(),
            retry_limit: options.retry_limit.unwrap_or(DEFAULT_RETRY_LIMIT),
            retry_delay_seconds: options.retry_delay_seconds.unwrap_or(0),
            retry_backoff: options.retry_backoff.unwrap_or(false),
            retry_delay_max_seconds: options.retry_delay_max_seconds,
            expire_in_seconds: options.expire_in_seconds.unwrap_or(DEFAULT_EXPIRE_SECONDS),
            retention_seconds: options.retention_seconds.unwrap_or(DEFAULT_RETENTION_SECONDS),
            delete_after_seconds: options
                .delete_after_seconds
                .unwrap_or(DEFAULT_DELETE_AFTER_SECONDS),
            warning_queue_size: options.warning_queue_size.unwrap_or(0),
        };
        config.normalized()
    }

    /// Apply an update on top of the current config. Policy and partition are fixed.
    pub fn merge(&self, options: &QueueOptions) -> Result<Self, ValidationError> {
        if let Some(policy) = options.policy
            && policy != self.policy
        {
            return Err(ValidationError::option(
                "policy",
                "a queue's policy cannot be changed after creation",
            ));
        }
        if let Some(partition) = options.partition
            && partition != self.partition
        {
            return Err(ValidationError::option(
                "partition",
                "a queue's partition flag cannot be changed after creation",
            ));
        }

        let config = Self {
            name: self.name.clone(),
            policy: self.policy,
            partition: self.partition,
            dead_letter: merge_optional(
                "dead_letter",
                &self.dead_letter,
                &options.dead_letter,
                options.clear_dead_letter,
            )?,
            retry_limit: options.retry_limit.unwrap_or(self.retry_limit),
            retry_delay_seconds: options.retry_delay_seconds.unwrap_or(self.retry_delay_seconds),
            retry_backoff: options.retry_backoff.unwrap_or(self.retry_backoff),
            retry_delay_max_seconds: merge_optional(
                "retry_delay_max_seconds",
                &self.retry_delay_max_seconds,
                &options.retry_delay_max_seconds,
                options.clear_retry_delay_max,
            )?,
            expire_in_seconds: options.expire_in_seconds.unwrap_or(self.expire_in_seconds),
            retention_seconds: options.retention_seconds.unwrap_or(self.retention_seconds),
            delete_after_seconds: options
                .delete_after_seconds
                .unwrap_or(self.delete_after_seconds),
            warning_queue_size: options.warning_queue_size.unwrap_or(self.warning_queue_size),
        };
        config.normalized()
    }

    fn normalized(mut self) -> Result<Self, ValidationError> {
        if self.expire_in_seconds == 0 {
            return Err(ValidationError::option(
                "expire_in_seconds",
                "must be at least 1",
            ));
        }
        if self.retention_seconds == 0 {
            return Err(ValidationError::option(
                "retention_seconds",
                "must be at least 1",
            ));
        }
        if self.retry_backoff && self.retry_delay_seconds == 0 {
            self.retry_delay_seconds = 1;
        }
        if let Some(max) = self.retry_delay_max_seconds
            && max < self.retry_delay_seconds
        {
            return Err(ValidationError::option(
                "retry_delay_max_seconds",
                "must not be lower than retry_delay_seconds",
            ));
        }
        if let Some(ref dead_letter) = self.dead_letter {
            validate_queue_name(dead_letter)?;
            if *dead_letter == self.name {
                return Err(ValidationError::option(
                    "dead_letter",
                    "a queue cannot be its own dead letter queue",
                ));
            }
        }
        Ok(self)
    }
}

/// Backlog counts cached on the queue row by the monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Created jobs whose start time is still in the future.
    pub deferred_count: u64,
    /// Jobs waiting to be claimed (created or retry).
    pub queued_count: u64,
    pub active_count: u64,
    pub total_count: u64,
}

/// A queue as stored: config plus cached stats and supervision timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Queue {
    pub config: QueueConfig,
    pub stats: QueueStats,
    pub monitor_on: Option<DateTime<Utc>>,
    pub maintain_on: Option<DateTime<Utc>>,
    pub created_on: DateTime<Utc>,
    pub updated_on: DateTime<Utc>,
}

impl Queue {
    pub fn name(&self) -> &str {
        &self.config.name
    }
}
