//! One polling loop bound to a queue.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::JobError;
use crate::events::EventBus;
use crate::job::{ClaimEngine, FetchOptions, Job, JobPipeline};
use crate::worker::groups::LocalGroups;
use crate::worker::state::WorkerState;
use crate::worker::{JobHandler, WorkOptions};

/// Observable state of a worker, published in `wip` events.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WorkerSnapshot {
    pub id: Uuid,
    /// Registration returned by `work()`, shared by its pollers.
    pub work_id: Uuid,
    pub name: String,
    pub state: WorkerState,
    /// Jobs handed to the handler so far.
    pub count: u64,
    pub created_on: DateTime<Utc>,
    pub last_fetched_on: Option<DateTime<Utc>>,
    pub last_job_started_on: Option<DateTime<Utc>>,
    pub last_job_ended_on: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_on: Option<DateTime<Utc>>,
}

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub claims: Arc<ClaimEngine>,
    pub pipeline: Arc<JobPipeline>,
    pub events: EventBus,
}

/// Worker that polls one queue until stopped.
pub struct Worker {
    name: String,
    fetch: FetchOptions,
    polling_interval: Duration,
    handler: Arc<dyn JobHandler>,
    local_groups: Option<Arc<LocalGroups>>,
    deps: WorkerDeps,
    snapshot: Mutex<WorkerSnapshot>,
    wake: Notify,
    stopping: CancellationToken,
    abort: CancellationToken,
}

impl Worker {
    pub fn new(
        work_id: Uuid,
        name: &str,
        options: &WorkOptions,
        handler: Arc<dyn JobHandler>,
        local_groups: Option<Arc<LocalGroups>>,
        deps: WorkerDeps,
    ) -> Self {
        Self {
            name: name.to_string(),
            fetch: options.fetch_options(),
            polling_interval: options.polling_interval,
            handler,
            local_groups,
            deps,
            snapshot: Mutex::new(WorkerSnapshot {
                id: Uuid::new_v4(),
                work_id,
                name: name.to_string(),
                state: WorkerState::Created,
                count: 0,
                created_on: Utc::now(),
                last_fetched_on: None,
                last_job_started_on: None,
                last_job_ended_on: None,
                last_error: None,
                last_error_on: None,
            }),
            wake: Notify::new(),
            stopping: CancellationToken::new(),
            abort: CancellationToken::new(),
        }
    }

    fn update<R>(&self, f: impl FnOnce(&mut WorkerSnapshot) -> R) -> R {
        let mut snapshot = self.snapshot.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut snapshot)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        self.update(|s| s.clone())
    }

    pub fn state(&self) -> WorkerState {
        self.update(|s| s.state)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn transition_to(&self, target: WorkerState) -> bool {
        self.update(|s| {
            if !s.state.can_transition_to(target) {
                return false;
            }
            s.state = target;
            true
        })
    }

    fn record_error(&self, error: impl std::fmt::Display) {
        let message = error.to_string();
        self.update(|s| {
            s.last_error = Some(message.clone());
            s.last_error_on = Some(Utc::now());
        });
        self.deps.events.error("worker", format!("queue {}: {message}", self.name));
    }

    /// Fetch options for the next poll. Groups at their local limit are left
    /// out so their jobs stay claimable by other nodes.
    fn next_fetch(&self) -> FetchOptions {
        let mut fetch = self.fetch.clone();
        if let Some(ref groups) = self.local_groups {
            fetch.exclude_group_ids.extend(groups.saturated());
        }
        fetch
    }

    /// Cut the idle sleep short.
    pub fn notify(&self) {
        self.wake.notify_one();
    }

    /// Exit the loop after the current iteration.
    pub fn stop(&self) {
        if self.transition_to(WorkerState::Stopping) {
            tracing::debug!(queue = %self.name, "Worker stopping");
        }
        self.stopping.cancel();
        self.wake.notify_one();
    }

    /// Cancel the in-flight handler. Its jobs are failed as aborted.
    pub fn abort(&self) {
        self.stop();
        self.abort.cancel();
    }

    /// Run the polling loop until `stop()`.
    pub async fn run(self: Arc<Self>) {
        if !self.transition_to(WorkerState::Active) {
            self.transition_to(WorkerState::Stopped);
            return;
        }
        tracing::info!(queue = %self.name, batch_size = self.fetch.batch_size, "Worker started");

        while !self.stopping.is_cancelled() {
            self.update(|s| s.last_fetched_on = Some(Utc::now()));
            match self.deps.claims.fetch(&self.name, &self.next_fetch()).await {
                Ok(jobs) if !jobs.is_empty() => {
                    // Nothing admitted means every job went back; wait like an empty poll.
                    if self.process(jobs).await > 0 {
                        continue;
                    }
                }
                Ok(_) => {}
                Err(e) => self.record_error(e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.polling_interval) => {}
                _ = self.wake.notified() => {}
                _ = self.stopping.cancelled() => {}
            }
        }

        self.transition_to(WorkerState::Stopped);
        tracing::info!(queue = %self.name, "Worker stopped");
    }

    /// Run one claimed batch. Returns how many jobs reached the handler.
    async fn process(&self, jobs: Vec<Job>) -> usize {
        // Permits live until the end of this call, whatever the outcome.
        let (jobs, _permits) = match self.local_groups {
            Some(ref groups) => {
                let admission = groups.admit(jobs);
                if !admission.excess.is_empty() {
                    tracing::debug!(
                        queue = %self.name,
                        excess = admission.excess.len(),
                        "Returning jobs over the local group limit"
                    );
                    self.return_excess(&admission.excess).await;
                }
                (admission.admitted, admission.permits)
            }
            None => (jobs, Vec::new()),
        };
        if jobs.is_empty() {
            return 0;
        }

        let ids: Vec<Uuid> = jobs.iter().map(|j| j.id).collect();
        let deadline = Duration::from_secs(
            jobs.iter().map(|j| j.expire_in_seconds).max().unwrap_or(1).max(1),
        );
        self.update(|s| {
            s.count += ids.len() as u64;
            s.last_job_started_on = Some(Utc::now());
        });

        let outcome = self.invoke(jobs, deadline).await;
        self.update(|s| s.last_job_ended_on = Some(Utc::now()));

        match outcome {
            Ok(output) => {
                let output = if ids.len() == 1 { output } else { None };
                if let Err(e) = self.deps.pipeline.complete(&self.name, &ids, output).await {
                    self.record_error(e);
                }
            }
            Err(job_error) => {
                tracing::warn!(queue = %self.name, count = ids.len(), error = %job_error, "Batch failed");
                self.update(|s| {
                    s.last_error = Some(job_error.to_string());
                    s.last_error_on = Some(Utc::now());
                });
                if let Err(e) = self
                    .deps
                    .pipeline
                    .fail(&self.name, &ids, Some(job_error.to_output()))
                    .await
                {
                    self.record_error(e);
                }
            }
        }
        ids.len()
    }

    /// Put excess jobs back in the queue. A job its policy index keeps active
    /// is failed instead so it does not sit claimed until expiry.
    async fn return_excess(&self, ids: &[Uuid]) {
        let report = match self.deps.pipeline.restore(&self.name, ids).await {
            Ok(report) => report,
            Err(e) => {
                self.record_error(e);
                return;
            }
        };
        if report.conflicted.is_empty() {
            return;
        }
        let error = JobError::RequeueBlocked;
        tracing::warn!(queue = %self.name, count = report.conflicted.len(), error = %error, "Excess jobs could not be restored");
        if let Err(e) = self
            .deps
            .pipeline
            .fail(&self.name, &report.conflicted, Some(error.to_output()))
            .await
        {
            self.record_error(e);
        }
    }

    async fn invoke(
        &self,
        jobs: Vec<Job>,
        deadline: Duration,
    ) -> Result<Option<serde_json::Value>, JobError> {
        let cancel = self.abort.child_token();
        let run = AssertUnwindSafe(self.handler.handle(jobs, cancel.clone())).catch_unwind();

        let outcome = tokio::select! {
            result = tokio::time::timeout(deadline, run) => match result {
                Ok(Ok(Ok(output))) => Ok(output),
                Ok(Ok(Err(e))) => Err(JobError::Handler(format!("{e:#}"))),
                Ok(Err(_)) => Err(JobError::Handler("handler panicked".to_string())),
                Err(_) => Err(JobError::Timeout { timeout: deadline }),
            },
            _ = self.abort.cancelled() => Err(JobError::Aborted),
        };
        cancel.cancel();
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::job::{JobState, SendOptions, Submission};
    use crate::queue::{QueueOptions, QueueRegistry};
    use crate::store::{JobStore, LibSqlStore, Schema};
    use crate::timekeeper::ClockSkew;
    use crate::worker::HandlerResult;

    struct Harness {
        deps: WorkerDeps,
        submission: Submission,
        store: Arc<dyn JobStore>,
    }

    async fn harness(options: QueueOptions) -> Harness {
        let store: Arc<dyn JobStore> =
            Arc::new(LibSqlStore::new_memory(Schema::default()).await.unwrap());
        let registry = Arc::new(QueueRegistry::new(Arc::clone(&store), Duration::from_secs(60)));
        registry.create_queue("q", &options).await.unwrap();
        Harness {
            deps: WorkerDeps {
                claims: Arc::new(ClaimEngine::new(Arc::clone(&store), Arc::clone(&registry))),
                pipeline: Arc::new(JobPipeline::new(Arc::clone(&store))),
                events: EventBus::new(),
            },
            submission: Submission::new(Arc::clone(&store), registry, ClockSkew::default()),
            store,
        }
    }

    fn worker(h: &Harness, handler: Arc<dyn JobHandler>) -> Arc<Worker> {
        Arc::new(Worker::new(
            Uuid::new_v4(),
            "q",
            &WorkOptions::default(),
            handler,
            None,
            h.deps.clone(),
        ))
    }

    async fn state_of(h: &Harness, id: Uuid) -> JobState {
        h.store.get_jobs_by_id("q", &[id]).await.unwrap()[0].state
    }

    #[tokio::test]
    async fn successful_batch_completes_with_output() {
        let h = harness(QueueOptions::default()).await;
        let id = h
            .submission
            .send("q", serde_json::json!({ "n": 2 }), SendOptions::default())
            .await
            .unwrap()
            .unwrap();

        let handler = |jobs: Vec<Job>, _: CancellationToken| async move {
            let n = jobs[0].data["n"].as_i64().unwrap_or(0);
            Ok::<_, anyhow::Error>(Some(serde_json::json!({ "double": n * 2 })))
        };
        let w = worker(&h, Arc::new(handler));
        w.process(h.deps.claims.fetch("q", &FetchOptions::default()).await.unwrap()).await;

        let job = &h.store.get_jobs_by_id("q", &[id]).await.unwrap()[0];
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.output.as_ref().unwrap()["double"], 4);
        assert_eq!(w.snapshot().count, 1);
    }

    #[tokio::test]
    async fn handler_error_fails_batch() {
        let h = harness(QueueOptions {
            retry_limit: Some(0),
            ..QueueOptions::default()
        })
        .await;
        let id = h
            .submission
            .send("q", serde_json::json!({}), SendOptions::default())
            .await
            .unwrap()
            .unwrap();

        let handler = |_: Vec<Job>, _: CancellationToken| async move {
            Err::<Option<serde_json::Value>, _>(anyhow::anyhow!("downstream unavailable"))
        };
        let w = worker(&h, Arc::new(handler));
        w.process(h.deps.claims.fetch("q", &FetchOptions::default()).await.unwrap()).await;

        let job = &h.store.get_jobs_by_id("q", &[id]).await.unwrap()[0];
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.output.as_ref().unwrap()["message"], "downstream unavailable");
        assert_eq!(w.snapshot().last_error.as_deref(), Some("downstream unavailable"));
    }

    #[tokio::test]
    async fn slow_handler_times_out() {
        let h = harness(QueueOptions::default()).await;
        let id = h
            .submission
            .send(
                "q",
                serde_json::json!({}),
                SendOptions {
                    expire_in_seconds: Some(1),
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        let handler = |_: Vec<Job>, _: CancellationToken| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            HandlerResult::Ok(None)
        };
        let w = worker(&h, Arc::new(handler));
        w.process(h.deps.claims.fetch("q", &FetchOptions::default()).await.unwrap()).await;

        // Default retry limit leaves room for another attempt.
        assert_eq!(state_of(&h, id).await, JobState::Retry);
        let job = &h.store.get_jobs_by_id("q", &[id]).await.unwrap()[0];
        assert!(
            job.output.as_ref().unwrap()["message"]
                .as_str()
                .unwrap()
                .contains("exceeded")
        );
    }

    #[tokio::test]
    async fn loop_runs_until_stopped() {
        let h = harness(QueueOptions::default()).await;
        let seen = Arc::new(AtomicUsize::new(0));

        struct Counter(Arc<AtomicUsize>);

        #[async_trait::async_trait]
        impl JobHandler for Counter {
            async fn handle(&self, jobs: Vec<Job>, _: CancellationToken) -> HandlerResult {
                self.0.fetch_add(jobs.len(), Ordering::SeqCst);
                Ok(None)
            }
        }

        let w = worker(&h, Arc::new(Counter(Arc::clone(&seen))));
        assert_eq!(w.state(), WorkerState::Created);
        let task = tokio::spawn(Arc::clone(&w).run());

        for n in 0..3 {
            h.submission
                .send("q", serde_json::json!({ "n": n }), SendOptions::default())
                .await
                .unwrap();
        }
        w.notify();

        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        w.stop();
        task.await.unwrap();
        assert_eq!(w.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn abort_fails_in_flight_batch() {
        let h = harness(QueueOptions::default()).await;
        let id = h
            .submission
            .send("q", serde_json::json!({}), SendOptions::default())
            .await
            .unwrap()
            .unwrap();

        let handler = |_: Vec<Job>, cancel: CancellationToken| async move {
            cancel.cancelled().await;
            HandlerResult::Ok(None)
        };
        let w = worker(&h, Arc::new(handler));
        let task = tokio::spawn(Arc::clone(&w).run());

        for _ in 0..50 {
            if w.snapshot().count == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        w.abort();
        task.await.unwrap();

        assert_eq!(state_of(&h, id).await, JobState::Retry);
        let job = &h.store.get_jobs_by_id("q", &[id]).await.unwrap()[0];
        assert_eq!(
            job.output.as_ref().unwrap()["message"],
            "handler aborted by worker shutdown"
        );
    }

    #[tokio::test]
    async fn local_group_excess_is_restored() {
        let h = harness(QueueOptions::default()).await;
        for _ in 0..3 {
            h.submission
                .send(
                    "q",
                    serde_json::json!({}),
                    SendOptions::default().with_group(crate::job::JobGroup::new("g")),
                )
                .await
                .unwrap();
        }
        let groups = LocalGroups::new(crate::job::GroupConcurrency::new(1));
        let handler = |_: Vec<Job>, _: CancellationToken| async move { HandlerResult::Ok(None) };
        let w = Arc::new(Worker::new(
            Uuid::new_v4(),
            "q",
            &WorkOptions::default(),
            Arc::new(handler),
            Some(Arc::clone(&groups)),
            h.deps.clone(),
        ));

        let batch = h.deps.claims.fetch("q", &FetchOptions::batch(3)).await.unwrap();
        assert_eq!(batch.len(), 3);
        w.process(batch).await;

        assert_eq!(groups.active("g"), 0, "permits released after the batch");
        let stats = h.store.queue_stats("q").await.unwrap();
        assert_eq!(stats.queued_count, 2);
        assert_eq!(stats.active_count, 0);
        assert_eq!(w.snapshot().count, 1);
    }

    fn grouped_worker(h: &Harness, groups: &Arc<LocalGroups>, polling_interval: Duration) -> Arc<Worker> {
        let handler = |_: Vec<Job>, _: CancellationToken| async move { HandlerResult::Ok(None) };
        Arc::new(Worker::new(
            Uuid::new_v4(),
            "q",
            &WorkOptions {
                batch_size: 3,
                polling_interval,
                ..WorkOptions::default()
            },
            Arc::new(handler),
            Some(Arc::clone(groups)),
            h.deps.clone(),
        ))
    }

    async fn send_grouped(h: &Harness, count: usize) {
        for _ in 0..count {
            h.submission
                .send(
                    "q",
                    serde_json::json!({}),
                    SendOptions::default().with_group(crate::job::JobGroup::new("g")),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn batch_with_nothing_admitted_reports_zero() {
        let h = harness(QueueOptions::default()).await;
        send_grouped(&h, 3).await;
        let groups = LocalGroups::new(crate::job::GroupConcurrency::new(1));
        let _held = groups.try_acquire("g", None).unwrap();
        let w = grouped_worker(&h, &groups, Duration::from_secs(60));

        let batch = h.deps.claims.fetch("q", &FetchOptions::batch(3)).await.unwrap();
        assert_eq!(w.process(batch).await, 0);

        let stats = h.store.queue_stats("q").await.unwrap();
        assert_eq!(stats.queued_count, 3);
        assert_eq!(w.snapshot().count, 0);
    }

    #[tokio::test]
    async fn saturated_group_is_not_polled_again() {
        let h = harness(QueueOptions::default()).await;
        send_grouped(&h, 3).await;
        let groups = LocalGroups::new(crate::job::GroupConcurrency::new(1));
        // A peer poller holds the only slot of "g".
        let held = groups.try_acquire("g", None).unwrap();
        let w = grouped_worker(&h, &groups, Duration::from_secs(60));
        let task = tokio::spawn(Arc::clone(&w).run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let first_poll = w.snapshot().last_fetched_on;
        assert!(first_poll.is_some());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(w.snapshot().last_fetched_on, first_poll, "worker idles until woken");

        let stats = h.store.queue_stats("q").await.unwrap();
        assert_eq!(stats.queued_count, 3);
        assert_eq!(stats.active_count, 0);

        drop(held);
        w.notify();
        for _ in 0..50 {
            if w.snapshot().count == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        w.stop();
        task.await.unwrap();
        assert_eq!(w.snapshot().count, 3);
    }

    #[tokio::test]
    async fn excess_blocked_by_singleton_key_is_failed() {
        let h = harness(QueueOptions::with_policy(crate::queue::QueuePolicy::Singleton)).await;
        let keyed = || {
            SendOptions::default()
                .with_singleton_key("x")
                .with_group(crate::job::JobGroup::new("g"))
        };
        let claimed_id = h
            .submission
            .send("q", serde_json::json!({ "n": 1 }), keyed())
            .await
            .unwrap()
            .unwrap();
        let batch = h.deps.claims.fetch("q", &FetchOptions::default()).await.unwrap();
        assert_eq!(batch[0].id, claimed_id);
        let queued_id = h
            .submission
            .send("q", serde_json::json!({ "n": 2 }), keyed())
            .await
            .unwrap()
            .unwrap();

        let groups = LocalGroups::new(crate::job::GroupConcurrency::new(1));
        let _held = groups.try_acquire("g", None).unwrap();
        let w = grouped_worker(&h, &groups, Duration::from_secs(60));
        assert_eq!(w.process(batch).await, 0);

        let job = &h.store.get_jobs_by_id("q", &[claimed_id]).await.unwrap()[0];
        assert_eq!(job.state, JobState::Failed);
        assert!(
            job.output.as_ref().unwrap()["message"]
                .as_str()
                .unwrap()
                .contains("could not be returned")
        );
        assert_eq!(state_of(&h, queued_id).await, JobState::Created);
    }
}
