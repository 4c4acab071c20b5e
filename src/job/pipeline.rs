//! Completion and failure pipeline: settling, retrying and auxiliary transitions.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::Result;
use crate::job::{FindJobsFilter, JobDetails};
use crate::queue::validate_queue_name;
use crate::store::{FailReport, JobStore, RestoreReport};

/// Exponent cap for backoff growth.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Delay before a failed job becomes claimable again, in milliseconds.
///
/// Without backoff this is the fixed delay. With backoff it is
/// `delay * 2^min(16, retry_count + 1) / 2 * (1 + jitter)`, capped at the
/// maximum delay when one is configured. `jitter` is expected in `[0, 1)`.
pub fn retry_delay_ms(
    retry_delay_seconds: u64,
    retry_backoff: bool,
    retry_delay_max_seconds: Option<u64>,
    retry_count: u32,
    jitter: f64,
) -> i64 {
    let base_ms = retry_delay_seconds as f64 * 1000.0;
    if !retry_backoff {
        return base_ms as i64;
    }
    let exponent = MAX_BACKOFF_EXPONENT.min(retry_count.saturating_add(1));
    let grown = base_ms * 2f64.powi(exponent as i32) / 2.0;
    let delay = grown * (1.0 + jitter.clamp(0.0, 1.0));
    match retry_delay_max_seconds {
        Some(max) => delay.min(max as f64 * 1000.0) as i64,
        None => delay as i64,
    }
}

/// State transitions on existing jobs.
pub struct JobPipeline {
    store: Arc<dyn JobStore>,
}

impl JobPipeline {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Mark active jobs completed. Settled ids are skipped, so repeats return 0.
    pub async fn complete(
        &self,
        name: &str,
        ids: &[Uuid],
        output: Option<serde_json::Value>,
    ) -> Result<u64> {
        validate_queue_name(name)?;
        let count = self.store.complete_jobs(name, ids, output.as_ref()).await?;
        debug!(queue = name, requested = ids.len(), count, "complete");
        Ok(count)
    }

    /// Retry jobs with attempts left, fail the rest.
    pub async fn fail(
        &self,
        name: &str,
        ids: &[Uuid],
        output: Option<serde_json::Value>,
    ) -> Result<FailReport> {
        validate_queue_name(name)?;
        let report = self.store.fail_jobs(name, ids, output.as_ref()).await?;
        if !report.failed.is_empty() {
            info!(
                queue = name,
                failed = report.failed.len(),
                dead_lettered = report.dead_lettered.len(),
                "Jobs failed permanently"
            );
        }
        debug!(queue = name, retried = report.retried.len(), "fail");
        Ok(report)
    }

    /// Non-terminal to cancelled.
    pub async fn cancel(&self, name: &str, ids: &[Uuid]) -> Result<u64> {
        validate_queue_name(name)?;
        Ok(self.store.cancel_jobs(name, ids).await?)
    }

    /// Cancelled back to created.
    pub async fn resume(&self, name: &str, ids: &[Uuid]) -> Result<u64> {
        validate_queue_name(name)?;
        Ok(self.store.resume_jobs(name, ids).await?)
    }

    /// Failed back to retry, granting one more attempt.
    pub async fn retry(&self, name: &str, ids: &[Uuid]) -> Result<u64> {
        validate_queue_name(name)?;
        let count = self.store.retry_jobs(name, ids).await?;
        info!(queue = name, count, "Failed jobs queued for retry");
        Ok(count)
    }

    /// Active back to queued, undoing the claim. Jobs a policy index keeps
    /// active come back in `conflicted`.
    pub async fn restore(&self, name: &str, ids: &[Uuid]) -> Result<RestoreReport> {
        validate_queue_name(name)?;
        Ok(self.store.restore_jobs(name, ids).await?)
    }

    pub async fn delete(&self, name: &str, ids: &[Uuid]) -> Result<u64> {
        validate_queue_name(name)?;
        Ok(self.store.delete_jobs(name, ids).await?)
    }

    pub async fn get_job_by_id(&self, name: &str, id: Uuid) -> Result<Option<JobDetails>> {
        Ok(self.get_jobs_by_id(name, &[id]).await?.into_iter().next())
    }

    pub async fn get_jobs_by_id(&self, name: &str, ids: &[Uuid]) -> Result<Vec<JobDetails>> {
        validate_queue_name(name)?;
        Ok(self.store.get_jobs_by_id(name, ids).await?)
    }

    pub async fn find_jobs(&self, name: &str, filter: &FindJobsFilter) -> Result<Vec<JobDetails>> {
        validate_queue_name(name)?;
        Ok(self.store.find_jobs(name, filter).await?)
    }
}
