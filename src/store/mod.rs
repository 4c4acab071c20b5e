//! Persistence layer: libSQL-backed storage for queues, jobs and schedules.

pub mod libsql_backend;
pub mod migrations;
pub mod plans;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use plans::Schema;
pub use traits::{FailReport, JobStore, MaintenanceReport, MonitorReport, RestoreReport};
