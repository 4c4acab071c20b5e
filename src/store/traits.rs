//! `JobStore` trait: the single async interface every component persists through.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::{FetchOptions, FindJobsFilter, JobDetails, NewJob};
use crate::queue::{Queue, QueueConfig, QueuePolicy, QueueStats};
use crate::timekeeper::Schedule;

/// What `fail_jobs` did with each matching job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailReport {
    pub retried: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    /// Ids of the new jobs created in dead letter queues.
    pub dead_lettered: Vec<Uuid>,
}

impl FailReport {
    /// Jobs that changed state.
    pub fn affected(&self) -> usize {
        self.retried.len() + self.failed.len()
    }
}

/// What `restore_jobs` did with the requested active jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: u64,
    /// Still active: returning them to the queue would break the policy index,
    /// usually because another job with the same key is already queued.
    pub conflicted: Vec<Uuid>,
}

/// Outcome of one monitor pass over a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Active jobs failed for exceeding their expiration.
    pub expired: FailReport,
    pub stats: QueueStats,
}

/// Outcome of one maintenance pass over a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub purged_settled: u64,
    pub purged_unclaimed: u64,
}

/// Backend-agnostic persistence for queues, jobs and schedules.
///
/// Every mutating call runs in one transaction that excludes other writers;
/// conflicts with policy indexes surface as "nothing affected", not errors.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Store clock, epoch milliseconds.
    async fn now_ms(&self) -> Result<i64, DatabaseError>;

    // ── Queues ──────────────────────────────────────────────────────

    /// Persist a queue (and its partition index). `false` if it already existed.
    async fn create_queue(&self, config: &QueueConfig) -> Result<bool, DatabaseError>;

    /// Overwrite the mutable settings of a queue. `false` if it does not exist.
    async fn update_queue(&self, config: &QueueConfig) -> Result<bool, DatabaseError>;

    /// Drop a queue with its jobs and schedules. `false` if it did not exist.
    async fn delete_queue(&self, name: &str) -> Result<bool, DatabaseError>;

    async fn get_queue(&self, name: &str) -> Result<Option<Queue>, DatabaseError>;

    /// All queues, or only the named ones.
    async fn get_queues(&self, names: Option<&[String]>) -> Result<Vec<Queue>, DatabaseError>;

    async fn queue_exists(&self, name: &str) -> Result<bool, DatabaseError>;

    /// Counts computed from live rows.
    async fn queue_stats(&self, name: &str) -> Result<QueueStats, DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert one job. `None` when a uniqueness constraint dropped it.
    async fn insert_job(&self, job: &NewJob) -> Result<Option<Uuid>, DatabaseError>;

    /// Insert many jobs in one transaction; returns the ids that were kept.
    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<Vec<Uuid>, DatabaseError>;

    /// Atomically select and activate up to `batch_size` eligible jobs.
    async fn claim_jobs(
        &self,
        name: &str,
        policy: QueuePolicy,
        options: &FetchOptions,
    ) -> Result<Vec<JobDetails>, DatabaseError>;

    /// Active to completed. Returns the number of jobs affected.
    async fn complete_jobs(
        &self,
        name: &str,
        ids: &[Uuid],
        output: Option<&serde_json::Value>,
    ) -> Result<u64, DatabaseError>;

    /// Retry or fail non-terminal jobs, forwarding exhausted ones to their
    /// dead letter queue.
    async fn fail_jobs(
        &self,
        name: &str,
        ids: &[Uuid],
        output: Option<&serde_json::Value>,
    ) -> Result<FailReport, DatabaseError>;

    async fn cancel_jobs(&self, name: &str, ids: &[Uuid]) -> Result<u64, DatabaseError>;

    async fn resume_jobs(&self, name: &str, ids: &[Uuid]) -> Result<u64, DatabaseError>;

    async fn retry_jobs(&self, name: &str, ids: &[Uuid]) -> Result<u64, DatabaseError>;

    /// Undo the claim of active jobs. Rows a policy index keeps active are
    /// reported, not skipped silently.
    async fn restore_jobs(&self, name: &str, ids: &[Uuid]) -> Result<RestoreReport, DatabaseError>;

    async fn delete_jobs(&self, name: &str, ids: &[Uuid]) -> Result<u64, DatabaseError>;

    async fn get_jobs_by_id(
        &self,
        name: &str,
        ids: &[Uuid],
    ) -> Result<Vec<JobDetails>, DatabaseError>;

    async fn find_jobs(
        &self,
        name: &str,
        filter: &FindJobsFilter,
    ) -> Result<Vec<JobDetails>, DatabaseError>;

    /// Singleton keys held by retry or failed jobs.
    async fn blocked_keys(&self, name: &str) -> Result<Vec<String>, DatabaseError>;

    // ── Supervision ─────────────────────────────────────────────────

    /// Expire overdue active jobs and cache stats, unless another node ran a
    /// monitor pass within `interval`. `None` when skipped.
    async fn monitor_queue(
        &self,
        name: &str,
        interval: Duration,
    ) -> Result<Option<MonitorReport>, DatabaseError>;

    /// Purge settled and unclaimed jobs past retention, unless another node
    /// ran maintenance within `interval`. `None` when skipped.
    async fn maintain_queue(
        &self,
        config: &QueueConfig,
        interval: Duration,
    ) -> Result<Option<MaintenanceReport>, DatabaseError>;

    /// Take the cron slot if no node evaluated schedules within `interval`.
    async fn try_cron_tick(&self, interval: Duration) -> Result<bool, DatabaseError>;

    // ── Schedules ───────────────────────────────────────────────────

    async fn upsert_schedule(&self, schedule: &Schedule) -> Result<(), DatabaseError>;

    /// Delete one schedule by key, or every schedule of the queue.
    async fn delete_schedule(&self, name: &str, key: Option<&str>) -> Result<u64, DatabaseError>;

    async fn get_schedules(
        &self,
        name: Option<&str>,
        key: Option<&str>,
    ) -> Result<Vec<Schedule>, DatabaseError>;
}
