//! Error types for queuekeeper.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Malformed input, rejected before any I/O.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error(
        "Invalid queue name '{0}': only alphanumeric characters, underscores, hyphens, periods, or forward slashes are allowed"
    )]
    InvalidQueueName(String),

    #[error("Invalid schema name '{0}'")]
    InvalidSchema(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidOption { field: String, reason: String },

    #[error("Queue {0} does not exist")]
    QueueNotFound(String),

    #[error("Queue {name} uses policy {policy}, which requires a singleton key")]
    SingletonKeyRequired { name: String, policy: String },

    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("Invalid timezone '{0}'")]
    InvalidTimezone(String),
}

impl ValidationError {
    pub(crate) fn option(field: &str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failures produced while running a batch inside a worker.
///
/// These are serialized into the job's failure output; they never escape the
/// polling loop.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("handler execution exceeded {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("{0}")]
    Handler(String),

    #[error("handler aborted by worker shutdown")]
    Aborted,

    #[error("job could not be returned to the queue: another job holds its singleton key")]
    RequeueBlocked,
}

impl JobError {
    /// JSON body stored in the job's `output` column on failure.
    pub fn to_output(&self) -> serde_json::Value {
        serde_json::json!({ "message": self.to_string() })
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_error_output_carries_message() {
        let err = JobError::Handler("boom".to_string());
        assert_eq!(err.to_output()["message"], "boom");

        let timeout = JobError::Timeout {
            timeout: Duration::from_secs(3),
        };
        assert!(
            timeout.to_output()["message"]
                .as_str()
                .unwrap()
                .contains("3s")
        );
    }

    #[test]
    fn validation_converts_to_top_level() {
        let err: Error = ValidationError::QueueNotFound("q".into()).into();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(err.to_string(), "Validation error: Queue q does not exist");
    }
}
