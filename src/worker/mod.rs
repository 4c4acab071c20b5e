//! Workers: polling loops that claim batches and run a handler on them.
//!
//! - `state`: worker lifecycle (created → active → stopping → stopped)
//! - `groups`: in-process group concurrency permits
//! - `worker`: one polling loop
//! - `manager`: work/off_work registry, notifications and wip snapshots

pub mod groups;
pub mod manager;
pub mod state;
pub mod worker;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ValidationError;
use crate::job::{FetchOptions, GroupConcurrency, Job};

pub use groups::{GroupPermit, LocalGroups};
pub use manager::{StopOptions, WorkerManager};
pub use state::WorkerState;
pub use worker::{Worker, WorkerDeps, WorkerSnapshot};

pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(2);
pub const MIN_POLLING_INTERVAL: Duration = Duration::from_millis(500);

/// What a handler returns: output for a single-job batch, or an error that
/// fails the whole batch.
pub type HandlerResult = anyhow::Result<Option<serde_json::Value>>;

/// User code run on each claimed batch.
///
/// `cancel` fires when the batch deadline passes or the worker is aborted;
/// handlers that ignore it are dropped at the deadline.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, jobs: Vec<Job>, cancel: CancellationToken) -> HandlerResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Vec<Job>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, jobs: Vec<Job>, cancel: CancellationToken) -> HandlerResult {
        (self)(jobs, cancel).await
    }
}

/// Options for `work()`.
#[derive(Debug, Clone)]
pub struct WorkOptions {
    pub batch_size: usize,
    /// Idle sleep between empty fetches.
    pub polling_interval: Duration,
    /// Parallel pollers on this node.
    pub local_concurrency: usize,
    pub include_metadata: bool,
    pub priority: bool,
    /// Store-backed group limit applied at claim time.
    pub group_concurrency: Option<GroupConcurrency>,
    /// In-memory group limit across this registration's pollers.
    pub local_group_concurrency: Option<GroupConcurrency>,
}

impl Default for WorkOptions {
    fn default() -> Self {
        Self {
            batch_size: 1,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            local_concurrency: 1,
            include_metadata: false,
            priority: true,
            group_concurrency: None,
            local_group_concurrency: None,
        }
    }
}

impl WorkOptions {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.polling_interval < MIN_POLLING_INTERVAL {
            return Err(ValidationError::option(
                "polling_interval",
                format!("must be at least {}ms", MIN_POLLING_INTERVAL.as_millis()),
            ));
        }
        if self.local_concurrency == 0 {
            return Err(ValidationError::option("local_concurrency", "must be at least 1"));
        }
        if let Some(ref groups) = self.local_group_concurrency {
            groups.validate("local_group_concurrency")?;
        }
        self.fetch_options().validate()
    }

    pub(crate) fn fetch_options(&self) -> FetchOptions {
        FetchOptions {
            batch_size: self.batch_size,
            priority: self.priority,
            include_metadata: self.include_metadata,
            group_concurrency: self.group_concurrency.clone(),
            ..FetchOptions::default()
        }
    }
}
