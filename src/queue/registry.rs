//! Queue registry: create/update/delete queues behind a read-through config cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{Result, ValidationError};
use crate::queue::{Queue, QueueConfig, QueueOptions, QueueStats, validate_queue_name};
use crate::store::JobStore;

struct CachedConfig {
    config: QueueConfig,
    loaded_at: Instant,
}

/// Creates and describes queues.
///
/// `config()` serves from a cache refreshed every `refresh` interval. The
/// cache may lag other nodes; claims always re-check live rows.
pub struct QueueRegistry {
    store: Arc<dyn JobStore>,
    cache: RwLock<HashMap<String, CachedConfig>>,
    refresh: Duration,
}

impl QueueRegistry {
    pub fn new(store: Arc<dyn JobStore>, refresh: Duration) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            refresh,
        }
    }

    /// Create a queue. Creating an existing queue is a no-op that returns its
    /// stored config.
    pub async fn create_queue(&self, name: &str, options: &QueueOptions) -> Result<QueueConfig> {
        let config = QueueConfig::resolve(name, options)?;
        if let Some(ref dead_letter) = config.dead_letter {
            self.require_queue(dead_letter).await?;
        }

        if !self.store.create_queue(&config).await? {
            debug!(queue = name, "Queue already exists");
            return self.reload(name).await;
        }
        self.remember(config.clone()).await;
        Ok(config)
    }

    /// Change mutable settings. Policy and partition are fixed at creation.
    pub async fn update_queue(&self, name: &str, options: &QueueOptions) -> Result<QueueConfig> {
        let current = self.reload(name).await?;
        let updated = current.merge(options)?;
        if let Some(ref dead_letter) = updated.dead_letter
            && current.dead_letter.as_ref() != Some(dead_letter)
        {
            self.require_queue(dead_letter).await?;
        }

        if !self.store.update_queue(&updated).await? {
            self.forget(name).await;
            return Err(ValidationError::QueueNotFound(name.to_string()).into());
        }
        info!(queue = name, "Queue updated");
        self.remember(updated.clone()).await;
        Ok(updated)
    }

    /// Delete a queue with its jobs and schedules. `false` if it did not exist.
    pub async fn delete_queue(&self, name: &str) -> Result<bool> {
        validate_queue_name(name)?;
        let deleted = self.store.delete_queue(name).await?;
        self.forget(name).await;
        Ok(deleted)
    }

    /// Stored queue with the stats cached by the last monitor pass.
    pub async fn get_queue(&self, name: &str) -> Result<Option<Queue>> {
        validate_queue_name(name)?;
        Ok(self.store.get_queue(name).await?)
    }

    pub async fn get_queues(&self, names: Option<&[String]>) -> Result<Vec<Queue>> {
        if let Some(names) = names {
            for name in names {
                validate_queue_name(name)?;
            }
        }
        Ok(self.store.get_queues(names).await?)
    }

    /// Counts computed from live rows.
    pub async fn get_queue_stats(&self, name: &str) -> Result<QueueStats> {
        self.require_queue(name).await?;
        Ok(self.store.queue_stats(name).await?)
    }

    /// Cached config, loaded on miss or once older than the refresh interval.
    pub async fn config(&self, name: &str) -> Result<QueueConfig> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(name)
                && entry.loaded_at.elapsed() < self.refresh
            {
                return Ok(entry.config.clone());
            }
        }
        self.reload(name).await
    }

    async fn reload(&self, name: &str) -> Result<QueueConfig> {
        validate_queue_name(name)?;
        match self.store.get_queue(name).await? {
            Some(queue) => {
                self.remember(queue.config.clone()).await;
                Ok(queue.config)
            }
            None => {
                self.forget(name).await;
                Err(ValidationError::QueueNotFound(name.to_string()).into())
            }
        }
    }

    async fn require_queue(&self, name: &str) -> Result<()> {
        validate_queue_name(name)?;
        if !self.store.queue_exists(name).await? {
            return Err(ValidationError::QueueNotFound(name.to_string()).into());
        }
        Ok(())
    }

    async fn remember(&self, config: QueueConfig) {
        self.cache.write().await.insert(
            config.name.clone(),
            CachedConfig {
                config,
                loaded_at: Instant::now(),
            },
        );
    }

    async fn forget(&self, name: &str) {
        self.cache.write().await.remove(name);
    }
}
