//! Queues: policies, configuration and the registry.

pub mod model;
pub mod registry;

pub use model::{
    DEFAULT_DELETE_AFTER_SECONDS, DEFAULT_EXPIRE_SECONDS, DEFAULT_RETENTION_SECONDS,
    DEFAULT_RETRY_LIMIT, Queue, QueueConfig, QueueOptions, QueuePolicy, QueueStats,
    validate_queue_name,
};
pub use registry::QueueRegistry;
