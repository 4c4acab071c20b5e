//! `QueueKeeper`: the single entry point composing registry, submission,
//! claims, settlement, workers, supervisor and timekeeper.

use std::sync::Arc;

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::KeeperConfig;
use crate::error::Result;
use crate::events::{EventBus, KeeperEvent};
use crate::job::{
    ClaimEngine, FetchOptions, FindJobsFilter, Job, JobDetails, JobInsert, JobPipeline,
    SendOptions, StartAfter, Submission,
};
use crate::queue::{Queue, QueueConfig, QueueOptions, QueueRegistry, QueueStats};
use crate::store::{FailReport, JobStore, LibSqlStore, RestoreReport, Schema};
use crate::supervisor::{QueueSupervision, Supervisor};
use crate::timekeeper::{ClockSkew, Schedule, ScheduleOptions, Timekeeper};
use crate::worker::{JobHandler, StopOptions, WorkOptions, WorkerDeps, WorkerManager, WorkerSnapshot};

struct Background {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub struct QueueKeeper {
    config: KeeperConfig,
    events: EventBus,
    registry: Arc<QueueRegistry>,
    submission: Arc<Submission>,
    claims: Arc<ClaimEngine>,
    pipeline: Arc<JobPipeline>,
    workers: Arc<WorkerManager>,
    supervisor: Arc<Supervisor>,
    timekeeper: Arc<Timekeeper>,
    background: Mutex<Option<Background>>,
}

impl QueueKeeper {
    /// Open (and migrate) the libSQL database named by the config.
    pub async fn open(config: KeeperConfig) -> Result<Self> {
        config.validate()?;
        let schema = Schema::new(&config.schema)?;
        let store = if config.database_path.as_os_str() == ":memory:" {
            LibSqlStore::new_memory(schema).await?
        } else {
            LibSqlStore::new_local(&config.database_path, schema).await?
        };
        Ok(Self::with_store(config, Arc::new(store)))
    }

    /// Build on an already migrated store.
    pub fn with_store(config: KeeperConfig, store: Arc<dyn JobStore>) -> Self {
        let events = EventBus::new();
        let clock = ClockSkew::default();
        let registry = Arc::new(QueueRegistry::new(
            Arc::clone(&store),
            config.queue_cache_interval,
        ));
        let submission = Arc::new(Submission::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            clock.clone(),
        ));
        let claims = Arc::new(ClaimEngine::new(Arc::clone(&store), Arc::clone(&registry)));
        let pipeline = Arc::new(JobPipeline::new(Arc::clone(&store)));
        let workers = Arc::new(WorkerManager::new(
            Arc::clone(&registry),
            WorkerDeps {
                claims: Arc::clone(&claims),
                pipeline: Arc::clone(&pipeline),
                events: events.clone(),
            },
        ));
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&store),
            events.clone(),
            config.supervise_interval,
            config.monitor_interval,
            config.maintenance_interval,
        ));
        let timekeeper = Arc::new(Timekeeper::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&submission),
            events.clone(),
            clock,
            config.clock_monitor_interval,
            config.cron_monitor_interval,
        ));

        Self {
            config,
            events,
            registry,
            submission,
            claims,
            pipeline,
            workers,
            supervisor,
            timekeeper,
            background: Mutex::new(None),
        }
    }

    /// Start the background loops enabled in the config. Calling it twice
    /// is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut background = self.background.lock().await;
        if background.is_some() {
            return Ok(());
        }

        self.timekeeper.sync_clock().await?;
        let cancel = CancellationToken::new();
        let mut handles = vec![
            Arc::clone(&self.workers).spawn_wip(self.config.wip_interval, cancel.clone()),
        ];
        if self.config.supervise {
            handles.push(Arc::clone(&self.supervisor).spawn(cancel.clone()));
        }
        if self.config.schedule {
            handles.push(Arc::clone(&self.timekeeper).spawn(cancel.clone()));
        }
        *background = Some(Background { cancel, handles });
        tracing::info!(
            supervise = self.config.supervise,
            schedule = self.config.schedule,
            "Queue keeper started"
        );
        Ok(())
    }

    /// Stop workers, then the background loops.
    pub async fn stop(&self, options: StopOptions) {
        self.workers.stop(options).await;
        if let Some(background) = self.background.lock().await.take() {
            background.cancel.cancel();
            futures::future::join_all(background.handles).await;
        }
        tracing::info!(graceful = options.graceful, "Queue keeper stopped");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KeeperEvent> {
        self.events.subscribe()
    }

    // ── Queues ──────────────────────────────────────────────────────

    pub async fn create_queue(&self, name: &str, options: &QueueOptions) -> Result<QueueConfig> {
        self.registry.create_queue(name, options).await
    }

    pub async fn update_queue(&self, name: &str, options: &QueueOptions) -> Result<QueueConfig> {
        self.registry.update_queue(name, options).await
    }

    pub async fn delete_queue(&self, name: &str) -> Result<bool> {
        self.registry.delete_queue(name).await
    }

    pub async fn get_queue(&self, name: &str) -> Result<Option<Queue>> {
        self.registry.get_queue(name).await
    }

    pub async fn get_queues(&self, names: Option<&[String]>) -> Result<Vec<Queue>> {
        self.registry.get_queues(names).await
    }

    pub async fn get_queue_stats(&self, name: &str) -> Result<QueueStats> {
        self.registry.get_queue_stats(name).await
    }

    // ── Submission ──────────────────────────────────────────────────

    pub async fn send(
        &self,
        name: &str,
        data: serde_json::Value,
        options: SendOptions,
    ) -> Result<Option<Uuid>> {
        self.submission.send(name, data, options).await
    }

    pub async fn send_after(
        &self,
        name: &str,
        data: serde_json::Value,
        options: SendOptions,
        start_after: StartAfter,
    ) -> Result<Option<Uuid>> {
        self.submission.send_after(name, data, options, start_after).await
    }

    pub async fn send_throttled(
        &self,
        name: &str,
        data: serde_json::Value,
        options: SendOptions,
        seconds: u64,
        key: Option<String>,
    ) -> Result<Option<Uuid>> {
        self.submission
            .send_throttled(name, data, options, seconds, key)
            .await
    }

    pub async fn send_debounced(
        &self,
        name: &str,
        data: serde_json::Value,
        options: SendOptions,
        seconds: u64,
        key: Option<String>,
    ) -> Result<Option<Uuid>> {
        self.submission
            .send_debounced(name, data, options, seconds, key)
            .await
    }

    pub async fn insert(&self, name: &str, jobs: Vec<JobInsert>) -> Result<Vec<Uuid>> {
        self.submission.insert(name, jobs).await
    }

    // ── Claiming and workers ────────────────────────────────────────

    pub async fn fetch(&self, name: &str, options: &FetchOptions) -> Result<Vec<Job>> {
        self.claims.fetch(name, options).await
    }

    pub async fn get_blocked_keys(&self, name: &str) -> Result<Vec<String>> {
        self.claims.get_blocked_keys(name).await
    }

    pub async fn work(
        &self,
        name: &str,
        options: WorkOptions,
        handler: impl JobHandler + 'static,
    ) -> Result<Uuid> {
        self.workers.work(name, options, Arc::new(handler)).await
    }

    pub async fn off_work(&self, name: &str, work_id: Option<Uuid>) -> Result<usize> {
        self.workers.off_work(name, work_id).await
    }

    pub async fn notify_worker(&self, work_id: Uuid) -> bool {
        self.workers.notify_worker(work_id).await
    }

    pub async fn get_wip(&self) -> Vec<WorkerSnapshot> {
        self.workers.get_wip().await
    }

    // ── Settlement ──────────────────────────────────────────────────

    pub async fn complete(
        &self,
        name: &str,
        ids: &[Uuid],
        output: Option<serde_json::Value>,
    ) -> Result<u64> {
        self.pipeline.complete(name, ids, output).await
    }

    pub async fn fail(
        &self,
        name: &str,
        ids: &[Uuid],
        output: Option<serde_json::Value>,
    ) -> Result<FailReport> {
        self.pipeline.fail(name, ids, output).await
    }

    pub async fn cancel(&self, name: &str, ids: &[Uuid]) -> Result<u64> {
        self.pipeline.cancel(name, ids).await
    }

    pub async fn resume(&self, name: &str, ids: &[Uuid]) -> Result<u64> {
        self.pipeline.resume(name, ids).await
    }

    pub async fn retry(&self, name: &str, ids: &[Uuid]) -> Result<u64> {
        self.pipeline.retry(name, ids).await
    }

    pub async fn restore(&self, name: &str, ids: &[Uuid]) -> Result<RestoreReport> {
        self.pipeline.restore(name, ids).await
    }

    pub async fn delete_jobs(&self, name: &str, ids: &[Uuid]) -> Result<u64> {
        self.pipeline.delete(name, ids).await
    }

    pub async fn get_job_by_id(&self, name: &str, id: Uuid) -> Result<Option<JobDetails>> {
        self.pipeline.get_job_by_id(name, id).await
    }

    pub async fn get_jobs_by_id(&self, name: &str, ids: &[Uuid]) -> Result<Vec<JobDetails>> {
        self.pipeline.get_jobs_by_id(name, ids).await
    }

    pub async fn find_jobs(&self, name: &str, filter: &FindJobsFilter) -> Result<Vec<JobDetails>> {
        self.pipeline.find_jobs(name, filter).await
    }

    // ── Schedules and supervision ───────────────────────────────────

    pub async fn schedule(
        &self,
        name: &str,
        cron: &str,
        data: Option<serde_json::Value>,
        options: ScheduleOptions,
    ) -> Result<Schedule> {
        self.timekeeper.schedule(name, cron, data, options).await
    }

    pub async fn unschedule(&self, name: &str, key: Option<&str>) -> Result<u64> {
        self.timekeeper.unschedule(name, key).await
    }

    pub async fn get_schedules(&self, name: Option<&str>, key: Option<&str>) -> Result<Vec<Schedule>> {
        self.timekeeper.get_schedules(name, key).await
    }

    /// Run a monitor and maintenance pass now, for one queue or all.
    pub async fn supervise(&self, name: Option<&str>) -> Result<Vec<QueueSupervision>> {
        self.supervisor.supervise(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;

    async fn keeper() -> QueueKeeper {
        QueueKeeper::open(KeeperConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn open_rejects_bad_schema() {
        let config = KeeperConfig {
            schema: "drop table;".into(),
            ..KeeperConfig::in_memory()
        };
        assert!(QueueKeeper::open(config).await.is_err());
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let keeper = QueueKeeper::open(KeeperConfig {
            supervise: true,
            schedule: true,
            ..KeeperConfig::in_memory()
        })
        .await
        .unwrap();
        keeper.start().await.unwrap();
        keeper.start().await.unwrap();
        keeper.stop(StopOptions::default()).await;
        keeper.stop(StopOptions::default()).await;
    }

    #[tokio::test]
    async fn send_fetch_complete() {
        let keeper = keeper().await;
        keeper.create_queue("email", &QueueOptions::default()).await.unwrap();
        let id = keeper
            .send("email", serde_json::json!({ "to": "a@b.c" }), SendOptions::default())
            .await
            .unwrap()
            .unwrap();

        let jobs = keeper.fetch("email", &FetchOptions::default()).await.unwrap();
        assert_eq!(jobs[0].id, id);
        assert_eq!(keeper.complete("email", &[id], None).await.unwrap(), 1);

        let job = keeper.get_job_by_id("email", id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Completed);
    }

    #[tokio::test]
    async fn cancel_resume_roundtrip() {
        let keeper = keeper().await;
        keeper.create_queue("q", &QueueOptions::default()).await.unwrap();
        let id = keeper
            .send("q", serde_json::json!({}), SendOptions::default())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(keeper.cancel("q", &[id]).await.unwrap(), 1);
        assert_eq!(keeper.cancel("q", &[id]).await.unwrap(), 0);
        assert!(keeper.fetch("q", &FetchOptions::default()).await.unwrap().is_empty());
        assert_eq!(keeper.resume("q", &[id]).await.unwrap(), 1);
        assert_eq!(keeper.fetch("q", &FetchOptions::default()).await.unwrap().len(), 1);
    }
}
