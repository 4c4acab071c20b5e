//! queuekeeper: a durable job queue on libSQL with retries, dead letters,
//! per-queue dispatch policies, cron schedules and polling workers.

pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod keeper;
pub mod queue;
pub mod store;
pub mod supervisor;
pub mod timekeeper;
pub mod worker;

pub use config::KeeperConfig;
pub use error::{Error, Result};
pub use events::{EventBus, KeeperEvent, WarningKind};
pub use keeper::QueueKeeper;
