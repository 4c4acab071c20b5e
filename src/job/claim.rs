//! Claim engine: atomic multi-job fetch honoring queue policy and group limits.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::job::{FetchOptions, Job};
use crate::queue::{QueueRegistry, validate_queue_name};
use crate::store::JobStore;

pub struct ClaimEngine {
    store: Arc<dyn JobStore>,
    registry: Arc<QueueRegistry>,
}

impl ClaimEngine {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<QueueRegistry>) -> Self {
        Self { store, registry }
    }

    /// Activate and return up to `batch_size` eligible jobs.
    ///
    /// Ordered by priority (when enabled), then creation order, then id.
    /// Concurrent callers never receive the same job.
    pub async fn fetch(&self, name: &str, options: &FetchOptions) -> Result<Vec<Job>> {
        validate_queue_name(name)?;
        options.validate()?;
        let config = self.registry.config(name).await?;

        let claimed = self.store.claim_jobs(name, config.policy, options).await?;
        if !claimed.is_empty() {
            debug!(queue = name, policy = %config.policy, count = claimed.len(), "Fetched jobs");
        }
        Ok(claimed
            .into_iter()
            .map(|details| details.into_job(options.include_metadata))
            .collect())
    }

    /// Keys stuck behind a retry or failed job on a `key_strict_fifo` queue.
    pub async fn get_blocked_keys(&self, name: &str) -> Result<Vec<String>> {
        validate_queue_name(name)?;
        self.registry.config(name).await?;
        Ok(self.store.blocked_keys(name).await?)
    }
}
