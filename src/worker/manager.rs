//! Worker registry: `work()` registrations, notifications, wip and shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::events::KeeperEvent;
use crate::queue::{QueueRegistry, validate_queue_name};
use crate::worker::groups::LocalGroups;
use crate::worker::worker::{Worker, WorkerDeps, WorkerSnapshot};
use crate::worker::{JobHandler, WorkOptions};

/// How to shut workers down.
#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    /// Let in-flight batches finish before aborting them.
    pub graceful: bool,
    /// How long a graceful stop waits before aborting.
    pub timeout: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            graceful: true,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Pollers started by one `work()` call.
struct Registration {
    name: String,
    workers: Vec<Arc<Worker>>,
    handles: Vec<JoinHandle<()>>,
}

pub struct WorkerManager {
    registry: Arc<QueueRegistry>,
    deps: WorkerDeps,
    registrations: RwLock<HashMap<Uuid, Registration>>,
}

impl WorkerManager {
    pub fn new(registry: Arc<QueueRegistry>, deps: WorkerDeps) -> Self {
        Self {
            registry,
            deps,
            registrations: RwLock::new(HashMap::new()),
        }
    }

    /// Start `local_concurrency` pollers on `name`. Returns the work id.
    pub async fn work(
        &self,
        name: &str,
        options: WorkOptions,
        handler: Arc<dyn JobHandler>,
    ) -> Result<Uuid> {
        validate_queue_name(name)?;
        options.validate()?;
        self.registry.config(name).await?;

        let work_id = Uuid::new_v4();
        let local_groups = options.local_group_concurrency.clone().map(LocalGroups::new);
        let mut workers = Vec::with_capacity(options.local_concurrency);
        let mut handles = Vec::with_capacity(options.local_concurrency);
        for _ in 0..options.local_concurrency {
            let worker = Arc::new(Worker::new(
                work_id,
                name,
                &options,
                Arc::clone(&handler),
                local_groups.clone(),
                self.deps.clone(),
            ));
            handles.push(tokio::spawn(Arc::clone(&worker).run()));
            workers.push(worker);
        }

        tracing::info!(
            queue = name,
            work_id = %work_id,
            pollers = workers.len(),
            "Work registered"
        );
        self.registrations.write().await.insert(
            work_id,
            Registration {
                name: name.to_string(),
                workers,
                handles,
            },
        );
        Ok(work_id)
    }

    /// Stop the pollers of one registration, or every registration on the
    /// queue, and wait for their in-flight batches. Returns how many
    /// registrations were stopped.
    pub async fn off_work(&self, name: &str, work_id: Option<Uuid>) -> Result<usize> {
        validate_queue_name(name)?;
        let removed: Vec<Registration> = {
            let mut registrations = self.registrations.write().await;
            let ids: Vec<Uuid> = registrations
                .iter()
                .filter(|(id, r)| r.name == name && work_id.is_none_or(|w| w == **id))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| registrations.remove(&id))
                .collect()
        };

        let count = removed.len();
        for registration in removed {
            shutdown(registration, StopOptions::default()).await;
        }
        tracing::info!(queue = name, count, "Work stopped");
        Ok(count)
    }

    /// Wake the sleeping pollers of a registration. `false` if unknown.
    pub async fn notify_worker(&self, work_id: Uuid) -> bool {
        let registrations = self.registrations.read().await;
        match registrations.get(&work_id) {
            Some(registration) => {
                for worker in &registration.workers {
                    worker.notify();
                }
                true
            }
            None => false,
        }
    }

    /// Snapshots of every registered poller.
    pub async fn get_wip(&self) -> Vec<WorkerSnapshot> {
        let registrations = self.registrations.read().await;
        registrations
            .values()
            .flat_map(|r| r.workers.iter().map(|w| w.snapshot()))
            .collect()
    }

    /// Stop every registration.
    pub async fn stop(&self, options: StopOptions) {
        let all: Vec<Registration> = {
            let mut registrations = self.registrations.write().await;
            registrations.drain().map(|(_, r)| r).collect()
        };
        join_all(all.into_iter().map(|r| shutdown(r, options))).await;
    }

    /// Emit a `Wip` event every `interval` while any worker is registered.
    pub fn spawn_wip(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let wip = self.get_wip().await;
                        if !wip.is_empty() {
                            self.deps.events.emit(KeeperEvent::Wip { workers: wip });
                        }
                    }
                }
            }
        })
    }
}

async fn shutdown(mut registration: Registration, options: StopOptions) {
    for worker in &registration.workers {
        if options.graceful {
            worker.stop();
        } else {
            worker.abort();
        }
    }

    let finished = tokio::time::timeout(
        options.timeout,
        join_all(registration.handles.iter_mut()),
    )
    .await;
    if finished.is_err() {
        tracing::warn!(
            queue = %registration.name,
            "Workers did not stop in time, aborting in-flight batches"
        );
        for worker in &registration.workers {
            worker.abort();
        }
        join_all(registration.handles.iter_mut()).await;
    }
}
