//! libSQL backend: async `JobStore` implementation.
//!
//! One shared connection serves every call. Writes run inside
//! `BEGIN IMMEDIATE` transactions behind an async gate, which gives claims the
//! same guarantee a row-locking skip-locked read gives on a server database:
//! a row activated by one claimer is no longer eligible for the next.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Transaction, TransactionBehavior, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::job::pipeline::retry_delay_ms;
use crate::job::{FetchOptions, FindJobsFilter, JobDetails, JobState, NewJob, StartAt};
use crate::queue::{Queue, QueueConfig, QueuePolicy, QueueStats};
use crate::store::migrations;
use crate::store::plans::{self, Schema};
use crate::store::traits::{FailReport, JobStore, MaintenanceReport, MonitorReport, RestoreReport};
use crate::timekeeper::{Schedule, ScheduleOptions};

/// libSQL job store.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    schema: Schema,
    /// Serializes statements on the shared connection so transactions never
    /// interleave.
    gate: Mutex<()>,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path, schema: Schema) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::connect(db, schema).await?;
        store.pragma("PRAGMA journal_mode = WAL").await?;
        store.pragma("PRAGMA busy_timeout = 5000").await?;
        store.run_migrations().await?;
        info!(path = %path.display(), schema = store.schema.as_str(), "Job store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory(schema: Schema) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let store = Self::connect(db, schema).await?;
        store.run_migrations().await?;
        Ok(store)
    }

    async fn connect(db: LibSqlDatabase, schema: Schema) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            schema,
            gate: Mutex::new(()),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Run a pragma; some return a row, so read them as queries.
    async fn pragma(&self, sql: &str) -> Result<(), DatabaseError> {
        let mut rows = self
            .conn
            .query(sql, ())
            .await
            .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
        while rows
            .next()
            .await
            .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?
            .is_some()
        {}
        Ok(())
    }

    async fn begin(&self, op: &str) -> Result<Transaction, DatabaseError> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} begin: {e}")))
    }

    /// Commit on success, roll back on error.
    async fn finish<T>(
        tx: Transaction,
        result: Result<T, DatabaseError>,
        op: &str,
    ) -> Result<T, DatabaseError> {
        match result {
            Ok(value) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("{op} commit: {e}")))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(op, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Execute one statement that takes `name` and an id list, in a transaction.
    async fn update_by_ids(
        &self,
        op: &str,
        sql: String,
        name: &str,
        ids: &[Uuid],
    ) -> Result<u64, DatabaseError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let _guard = self.gate.lock().await;
        let tx = self.begin(op).await?;
        let result = tx
            .execute(&sql, positional(vec![text(name), ids_json(ids)]))
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")));
        let count = Self::finish(tx, result, op).await?;
        debug!(queue = name, count, op, "Jobs updated");
        Ok(count)
    }

    async fn create_queue_in(&self, conn: &Connection, config: &QueueConfig) -> Result<bool, DatabaseError> {
        let inserted = conn
            .execute(
                &plans::insert_queue(&self.schema),
                positional(vec![
                    text(&config.name),
                    text(config.policy.as_str()),
                    Value::Integer(config.retry_limit as i64),
                    Value::Integer(config.retry_delay_seconds as i64),
                    Value::Integer(config.retry_backoff as i64),
                    opt_int(config.retry_delay_max_seconds.map(|v| v as i64)),
                    Value::Integer(config.expire_in_seconds as i64),
                    Value::Integer(config.retention_seconds as i64),
                    Value::Integer(config.delete_after_seconds as i64),
                    opt_text(config.dead_letter.as_deref()),
                    Value::Integer(config.partition as i64),
                    Value::Integer(config.warning_queue_size as i64),
                ]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_queue: {e}")))?;

        if inserted > 0 && config.partition {
            if let Some(sql) = plans::create_partition_index(&self.schema, &config.name, config.policy)
            {
                conn.execute(&sql, ())
                    .await
                    .map_err(|e| DatabaseError::Query(format!("create_queue partition: {e}")))?;
            }
        }
        Ok(inserted > 0)
    }

    async fn delete_queue_in(&self, conn: &Connection, name: &str) -> Result<bool, DatabaseError> {
        let args = || positional(vec![text(name)]);
        conn.execute(&plans::delete_queue_jobs(&self.schema), args())
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_queue jobs: {e}")))?;
        conn.execute(&plans::delete_queue_schedules(&self.schema), args())
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_queue schedules: {e}")))?;
        conn.execute(&plans::drop_partition_index(&self.schema, name), ())
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_queue partition: {e}")))?;
        let deleted = conn
            .execute(&plans::delete_queue(&self.schema), args())
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_queue: {e}")))?;
        Ok(deleted > 0)
    }

    async fn insert_job_in(&self, conn: &Connection, job: &NewJob) -> Result<Option<Uuid>, DatabaseError> {
        let (start_at, start_offset) = match job.start_at {
            StartAt::Now => (Value::Null, 0),
            StartAt::AtMillis(ms) => (Value::Integer(ms), 0),
            StartAt::OffsetMillis(ms) => (Value::Null, ms),
        };
        let inserted = conn
            .execute(
                &plans::insert_job(&self.schema),
                positional(vec![
                    text(&job.id.to_string()),
                    text(&job.name),
                    Value::Integer(job.priority),
                    text(&job.data.to_string()),
                    Value::Integer(job.retry_limit as i64),
                    Value::Integer(job.retry_delay_seconds as i64),
                    Value::Integer(job.retry_backoff as i64),
                    opt_int(job.retry_delay_max_seconds.map(|v| v as i64)),
                    Value::Integer(job.expire_in_seconds as i64),
                    opt_text(job.singleton_key.as_deref()),
                    opt_int(job.singleton_on),
                    opt_text(job.group_id.as_deref()),
                    opt_text(job.group_tier.as_deref()),
                    start_at,
                    Value::Integer(start_offset),
                    opt_int(job.keep_until),
                    Value::Integer(job.retention_seconds as i64),
                    opt_text(job.dead_letter.as_deref()),
                    text(job.policy.as_str()),
                ]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;

        if inserted == 0 {
            debug!(queue = %job.name, singleton_key = ?job.singleton_key, "Job dropped by uniqueness constraint");
            return Ok(None);
        }
        Ok(Some(job.id))
    }

    /// Move taken rows to retry or failed, forwarding exhausted ones to their
    /// dead letter queue.
    async fn settle_failures(
        &self,
        conn: &Connection,
        jobs: Vec<JobDetails>,
        output: Option<&serde_json::Value>,
    ) -> Result<FailReport, DatabaseError> {
        let mut report = FailReport::default();
        if jobs.is_empty() {
            return Ok(report);
        }
        let now = query_now(conn).await?;
        let reinsert = plans::reinsert_job(&self.schema);

        for job in jobs {
            if job.retry_count < job.retry_limit {
                let delay = retry_delay_ms(
                    job.retry_delay_seconds,
                    job.retry_backoff,
                    job.retry_delay_max_seconds,
                    job.retry_count,
                    rand::random::<f64>(),
                );
                let start_after = now + delay;
                let window = (job.keep_until.timestamp_millis() - job.start_after.timestamp_millis()).max(0);
                let keep_until = job.keep_until.timestamp_millis().max(start_after + window);
                let row = job_values(&job, JobState::Retry, start_after, None, keep_until, output);
                let inserted = conn
                    .execute(&reinsert, positional(row))
                    .await
                    .map_err(|e| DatabaseError::Query(format!("fail_jobs retry: {e}")))?;
                if inserted > 0 {
                    debug!(job_id = %job.id, queue = %job.name, retry_count = job.retry_count, delay_ms = delay, "Job scheduled for retry");
                    report.retried.push(job.id);
                    continue;
                }
                // Another job holds the retry slot for this key.
                debug!(job_id = %job.id, queue = %job.name, "Retry blocked by policy index, failing job");
            }

            let row = job_values(
                &job,
                JobState::Failed,
                job.start_after.timestamp_millis(),
                Some(now),
                job.keep_until.timestamp_millis(),
                output,
            );
            let inserted = conn
                .execute(&reinsert, positional(row))
                .await
                .map_err(|e| DatabaseError::Query(format!("fail_jobs failed: {e}")))?;
            if inserted == 0 {
                return Err(DatabaseError::Query(format!(
                    "fail_jobs: job {} could not be stored as failed",
                    job.id
                )));
            }
            report.failed.push(job.id);

            if let Some(ref dead_letter) = job.dead_letter {
                let id = Uuid::now_v7();
                let copied = conn
                    .execute(
                        &plans::insert_dead_letter(&self.schema),
                        positional(vec![
                            text(&id.to_string()),
                            Value::Integer(job.priority),
                            text(&job.data.to_string()),
                            opt_text(job.singleton_key.as_deref()),
                            opt_text(output.map(|o| o.to_string()).as_deref()),
                            text(dead_letter),
                        ]),
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("fail_jobs dead letter: {e}")))?;
                if copied > 0 {
                    info!(job_id = %job.id, dead_letter_id = %id, dead_letter = %dead_letter, "Job forwarded to dead letter queue");
                    report.dead_lettered.push(id);
                } else {
                    warn!(job_id = %job.id, dead_letter = %dead_letter, "Dead letter queue missing or rejected the job");
                }
            }
        }
        Ok(report)
    }

    async fn stats_in(&self, conn: &Connection, name: &str) -> Result<QueueStats, DatabaseError> {
        let mut rows = conn
            .query(&plans::queue_stats(&self.schema), positional(vec![text(name)]))
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_stats: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_stats: {e}")))?
            .ok_or_else(|| DatabaseError::Query("queue_stats: no row".into()))?;
        Ok(QueueStats {
            deferred_count: req_i64(&row, 0)? as u64,
            queued_count: req_i64(&row, 1)? as u64,
            active_count: req_i64(&row, 2)? as u64,
            total_count: req_i64(&row, 3)? as u64,
        })
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn positional(values: Vec<Value>) -> Params {
    Params::Positional(values)
}

fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> Value {
    match s {
        Some(s) => Value::Text(s.to_string()),
        None => Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> Value {
    match v {
        Some(v) => Value::Integer(v),
        None => Value::Null,
    }
}

/// JSON array of ids, expanded in SQL with `json_each`.
fn ids_json(ids: &[Uuid]) -> Value {
    let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
    Value::Text(serde_json::Value::from(ids).to_string())
}

fn opt_list_json(items: &[String]) -> Value {
    if items.is_empty() {
        Value::Null
    } else {
        Value::Text(serde_json::Value::from(items.to_vec()).to_string())
    }
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn req_i64(row: &libsql::Row, idx: i32) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn req_string(row: &libsql::Row, idx: i32) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
}

fn opt_i64(row: &libsql::Row, idx: i32) -> Result<Option<i64>, DatabaseError> {
    match row.get_value(idx) {
        Ok(Value::Integer(v)) => Ok(Some(v)),
        Ok(Value::Null) => Ok(None),
        Ok(other) => Err(DatabaseError::Serialization(format!(
            "column {idx}: expected integer, got {other:?}"
        ))),
        Err(e) => Err(DatabaseError::Serialization(format!("column {idx}: {e}"))),
    }
}

fn opt_string(row: &libsql::Row, idx: i32) -> Result<Option<String>, DatabaseError> {
    match row.get_value(idx) {
        Ok(Value::Text(v)) => Ok(Some(v)),
        Ok(Value::Null) => Ok(None),
        Ok(other) => Err(DatabaseError::Serialization(format!(
            "column {idx}: expected text, got {other:?}"
        ))),
        Err(e) => Err(DatabaseError::Serialization(format!("column {idx}: {e}"))),
    }
}

fn opt_json(row: &libsql::Row, idx: i32) -> Result<Option<serde_json::Value>, DatabaseError> {
    opt_string(row, idx)?
        .map(|s| {
            serde_json::from_str(&s)
                .map_err(|e| DatabaseError::Serialization(format!("column {idx}: {e}")))
        })
        .transpose()
}

fn parse_policy(s: &str) -> Result<QueuePolicy, DatabaseError> {
    s.parse()
        .map_err(|e| DatabaseError::Serialization(format!("policy: {e}")))
}

/// Map a row to `JobDetails`. Column order matches `JOB_COLUMNS`.
fn row_to_job(row: &libsql::Row) -> Result<JobDetails, DatabaseError> {
    let id = req_string(row, 0)?;
    let state = req_i64(row, 4)?;
    Ok(JobDetails {
        id: Uuid::parse_str(&id).map_err(|e| DatabaseError::Serialization(format!("id: {e}")))?,
        name: req_string(row, 1)?,
        priority: req_i64(row, 2)?,
        data: opt_json(row, 3)?.unwrap_or(serde_json::Value::Null),
        state: JobState::from_code(state)
            .ok_or_else(|| DatabaseError::Serialization(format!("unknown job state {state}")))?,
        retry_limit: req_i64(row, 5)? as u32,
        retry_count: req_i64(row, 6)? as u32,
        retry_delay_seconds: req_i64(row, 7)? as u64,
        retry_backoff: req_i64(row, 8)? != 0,
        retry_delay_max_seconds: opt_i64(row, 9)?.map(|v| v as u64),
        expire_in_seconds: req_i64(row, 10)? as u64,
        singleton_key: opt_string(row, 11)?,
        singleton_on: opt_i64(row, 12)?.map(ms_to_datetime),
        group_id: opt_string(row, 13)?,
        group_tier: opt_string(row, 14)?,
        start_after: ms_to_datetime(req_i64(row, 15)?),
        created_on: ms_to_datetime(req_i64(row, 16)?),
        started_on: opt_i64(row, 17)?.map(ms_to_datetime),
        completed_on: opt_i64(row, 18)?.map(ms_to_datetime),
        keep_until: ms_to_datetime(req_i64(row, 19)?),
        output: opt_json(row, 20)?,
        dead_letter: opt_string(row, 21)?,
        policy: parse_policy(&req_string(row, 22)?)?,
    })
}

/// Values for `reinsert_job`, in `JOB_COLUMNS` order.
fn job_values(
    job: &JobDetails,
    state: JobState,
    start_after: i64,
    completed_on: Option<i64>,
    keep_until: i64,
    output: Option<&serde_json::Value>,
) -> Vec<Value> {
    vec![
        text(&job.id.to_string()),
        text(&job.name),
        Value::Integer(job.priority),
        text(&job.data.to_string()),
        Value::Integer(state.code()),
        Value::Integer(job.retry_limit as i64),
        Value::Integer(job.retry_count as i64),
        Value::Integer(job.retry_delay_seconds as i64),
        Value::Integer(job.retry_backoff as i64),
        opt_int(job.retry_delay_max_seconds.map(|v| v as i64)),
        Value::Integer(job.expire_in_seconds as i64),
        opt_text(job.singleton_key.as_deref()),
        opt_int(job.singleton_on.map(|t| t.timestamp_millis())),
        opt_text(job.group_id.as_deref()),
        opt_text(job.group_tier.as_deref()),
        Value::Integer(start_after),
        Value::Integer(job.created_on.timestamp_millis()),
        opt_int(job.started_on.map(|t| t.timestamp_millis())),
        opt_int(completed_on),
        Value::Integer(keep_until),
        opt_text(output.map(|o| o.to_string()).as_deref()),
        opt_text(job.dead_letter.as_deref()),
        text(job.policy.as_str()),
    ]
}

/// Map a row to `Queue`. Column order matches `QUEUE_COLUMNS`.
fn row_to_queue(row: &libsql::Row) -> Result<Queue, DatabaseError> {
    Ok(Queue {
        config: QueueConfig {
            name: req_string(row, 0)?,
            policy: parse_policy(&req_string(row, 1)?)?,
            retry_limit: req_i64(row, 2)? as u32,
            retry_delay_seconds: req_i64(row, 3)? as u64,
            retry_backoff: req_i64(row, 4)? != 0,
            retry_delay_max_seconds: opt_i64(row, 5)?.map(|v| v as u64),
            expire_in_seconds: req_i64(row, 6)? as u64,
            retention_seconds: req_i64(row, 7)? as u64,
            delete_after_seconds: req_i64(row, 8)? as u64,
            dead_letter: opt_string(row, 9)?,
            partition: req_i64(row, 10)? != 0,
            warning_queue_size: req_i64(row, 11)? as u64,
        },
        stats: QueueStats {
            deferred_count: req_i64(row, 12)? as u64,
            queued_count: req_i64(row, 13)? as u64,
            active_count: req_i64(row, 14)? as u64,
            total_count: req_i64(row, 15)? as u64,
        },
        monitor_on: opt_i64(row, 16)?.map(ms_to_datetime),
        maintain_on: opt_i64(row, 17)?.map(ms_to_datetime),
        created_on: ms_to_datetime(req_i64(row, 18)?),
        updated_on: ms_to_datetime(req_i64(row, 19)?),
    })
}

/// Map a row to `Schedule`. Column order matches `SCHEDULE_COLUMNS`.
fn row_to_schedule(row: &libsql::Row) -> Result<Schedule, DatabaseError> {
    let options: ScheduleOptions = match opt_string(row, 5)? {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| DatabaseError::Serialization(format!("schedule options: {e}")))?,
        None => ScheduleOptions::default(),
    };
    Ok(Schedule {
        name: req_string(row, 0)?,
        key: req_string(row, 1)?,
        cron: req_string(row, 2)?,
        timezone: opt_string(row, 3)?.unwrap_or_else(|| "UTC".to_string()),
        data: opt_json(row, 4)?,
        options,
        created_on: ms_to_datetime(req_i64(row, 6)?),
        updated_on: ms_to_datetime(req_i64(row, 7)?),
    })
}

async fn collect_jobs(mut rows: libsql::Rows, op: &str) -> Result<Vec<JobDetails>, DatabaseError> {
    let mut jobs = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?
    {
        jobs.push(row_to_job(&row)?);
    }
    Ok(jobs)
}

async fn query_now(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query(&plans::store_now(), ())
        .await
        .map_err(|e| DatabaseError::Query(format!("now: {e}")))?;
    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("now: {e}")))?
    {
        Some(row) => req_i64(&row, 0),
        None => Err(DatabaseError::Query("now: no row".into())),
    }
}

fn sort_claimed(jobs: &mut [JobDetails], priority: bool) {
    jobs.sort_by(|a, b| {
        let by_priority = if priority {
            b.priority.cmp(&a.priority)
        } else {
            std::cmp::Ordering::Equal
        };
        by_priority
            .then(a.created_on.cmp(&b.created_on))
            .then(a.id.cmp(&b.id))
    });
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl JobStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _guard = self.gate.lock().await;
        migrations::run_migrations(&self.conn, &self.schema).await
    }

    async fn now_ms(&self) -> Result<i64, DatabaseError> {
        let _guard = self.gate.lock().await;
        query_now(&self.conn).await
    }

    // ── Queues ──────────────────────────────────────────────────────

    async fn create_queue(&self, config: &QueueConfig) -> Result<bool, DatabaseError> {
        let _guard = self.gate.lock().await;
        let tx = self.begin("create_queue").await?;
        let result = self.create_queue_in(&tx, config).await;
        let created = Self::finish(tx, result, "create_queue").await?;
        if created {
            info!(queue = %config.name, policy = %config.policy, partition = config.partition, "Queue created");
        }
        Ok(created)
    }

    async fn update_queue(&self, config: &QueueConfig) -> Result<bool, DatabaseError> {
        let _guard = self.gate.lock().await;
        let tx = self.begin("update_queue").await?;
        let result = tx
            .execute(
                &plans::update_queue(&self.schema),
                positional(vec![
                    text(&config.name),
                    Value::Integer(config.retry_limit as i64),
                    Value::Integer(config.retry_delay_seconds as i64),
                    Value::Integer(config.retry_backoff as i64),
                    opt_int(config.retry_delay_max_seconds.map(|v| v as i64)),
                    Value::Integer(config.expire_in_seconds as i64),
                    Value::Integer(config.retention_seconds as i64),
                    Value::Integer(config.delete_after_seconds as i64),
                    opt_text(config.dead_letter.as_deref()),
                    Value::Integer(config.warning_queue_size as i64),
                ]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_queue: {e}")));
        let updated = Self::finish(tx, result, "update_queue").await?;
        debug!(queue = %config.name, updated, "Queue updated");
        Ok(updated > 0)
    }

    async fn delete_queue(&self, name: &str) -> Result<bool, DatabaseError> {
        let _guard = self.gate.lock().await;
        let tx = self.begin("delete_queue").await?;
        let result = self.delete_queue_in(&tx, name).await;
        let deleted = Self::finish(tx, result, "delete_queue").await?;
        if deleted {
            info!(queue = name, "Queue deleted");
        }
        Ok(deleted)
    }

    async fn get_queue(&self, name: &str) -> Result<Option<Queue>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(&plans::select_queue(&self.schema), positional(vec![text(name)]))
            .await
            .map_err(|e| DatabaseError::Query(format!("get_queue: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_queue(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_queue: {e}"))),
        }
    }

    async fn get_queues(&self, names: Option<&[String]>) -> Result<Vec<Queue>, DatabaseError> {
        let filter = match names {
            Some(names) => Value::Text(serde_json::Value::from(names.to_vec()).to_string()),
            None => Value::Null,
        };
        let _guard = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(&plans::select_queues(&self.schema), positional(vec![filter]))
            .await
            .map_err(|e| DatabaseError::Query(format!("get_queues: {e}")))?;

        let mut queues = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_queues: {e}")))?
        {
            queues.push(row_to_queue(&row)?);
        }
        Ok(queues)
    }

    async fn queue_exists(&self, name: &str) -> Result<bool, DatabaseError> {
        let _guard = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(&plans::count_queue(&self.schema), positional(vec![text(name)]))
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_exists: {e}")))?;
        match rows.next().await {
            Ok(Some(row)) => Ok(req_i64(&row, 0)? > 0),
            Ok(None) => Ok(false),
            Err(e) => Err(DatabaseError::Query(format!("queue_exists: {e}"))),
        }
    }

    async fn queue_stats(&self, name: &str) -> Result<QueueStats, DatabaseError> {
        let _guard = self.gate.lock().await;
        self.stats_in(&self.conn, name).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &NewJob) -> Result<Option<Uuid>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let tx = self.begin("insert_job").await?;
        let result = self.insert_job_in(&tx, job).await;
        Self::finish(tx, result, "insert_job").await
    }

    async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<Vec<Uuid>, DatabaseError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.gate.lock().await;
        let tx = self.begin("insert_jobs").await?;
        let result = async {
            let mut ids = Vec::with_capacity(jobs.len());
            for job in jobs {
                if let Some(id) = self.insert_job_in(&tx, job).await? {
                    ids.push(id);
                }
            }
            Ok(ids)
        }
        .await;
        let ids = Self::finish(tx, result, "insert_jobs").await?;
        debug!(requested = jobs.len(), inserted = ids.len(), "Jobs inserted");
        Ok(ids)
    }

    async fn claim_jobs(
        &self,
        name: &str,
        policy: QueuePolicy,
        options: &FetchOptions,
    ) -> Result<Vec<JobDetails>, DatabaseError> {
        let (group_default, group_tiers) = match options.group_concurrency {
            Some(ref groups) => (
                Value::Integer(groups.default as i64),
                if groups.tiers.is_empty() {
                    Value::Null
                } else {
                    let tiers = serde_json::to_string(&groups.tiers)
                        .map_err(|e| DatabaseError::Serialization(format!("group tiers: {e}")))?;
                    Value::Text(tiers)
                },
            ),
            None => (Value::Null, Value::Null),
        };
        let sql = plans::claim_jobs(&self.schema, policy, options.priority);
        let args = positional(vec![
            text(name),
            Value::Integer(options.batch_size as i64),
            opt_list_json(&options.exclude_singleton_keys),
            opt_list_json(&options.exclude_group_ids),
            group_default,
            group_tiers,
        ]);

        let _guard = self.gate.lock().await;
        let tx = self.begin("claim_jobs").await?;
        let result = match tx.query(&sql, args).await {
            Ok(rows) => collect_jobs(rows, "claim_jobs").await,
            Err(e) => Err(DatabaseError::Query(format!("claim_jobs: {e}"))),
        };
        let mut jobs = Self::finish(tx, result, "claim_jobs").await?;
        sort_claimed(&mut jobs, options.priority);
        if !jobs.is_empty() {
            debug!(queue = name, count = jobs.len(), "Jobs claimed");
        }
        Ok(jobs)
    }

    async fn complete_jobs(
        &self,
        name: &str,
        ids: &[Uuid],
        output: Option<&serde_json::Value>,
    ) -> Result<u64, DatabaseError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let _guard = self.gate.lock().await;
        let tx = self.begin("complete_jobs").await?;
        let result = tx
            .execute(
                &plans::complete_jobs(&self.schema),
                positional(vec![
                    text(name),
                    ids_json(ids),
                    opt_text(output.map(|o| o.to_string()).as_deref()),
                ]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_jobs: {e}")));
        let count = Self::finish(tx, result, "complete_jobs").await?;
        debug!(queue = name, count, "Jobs completed");
        Ok(count)
    }

    async fn fail_jobs(
        &self,
        name: &str,
        ids: &[Uuid],
        output: Option<&serde_json::Value>,
    ) -> Result<FailReport, DatabaseError> {
        if ids.is_empty() {
            return Ok(FailReport::default());
        }
        let _guard = self.gate.lock().await;
        let tx = self.begin("fail_jobs").await?;
        let result = async {
            let rows = tx
                .query(
                    &plans::take_failing_jobs(&self.schema),
                    positional(vec![text(name), ids_json(ids)]),
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("fail_jobs: {e}")))?;
            let taken = collect_jobs(rows, "fail_jobs").await?;
            self.settle_failures(&tx, taken, output).await
        }
        .await;
        Self::finish(tx, result, "fail_jobs").await
    }

    async fn cancel_jobs(&self, name: &str, ids: &[Uuid]) -> Result<u64, DatabaseError> {
        self.update_by_ids("cancel_jobs", plans::cancel_jobs(&self.schema), name, ids)
            .await
    }

    async fn resume_jobs(&self, name: &str, ids: &[Uuid]) -> Result<u64, DatabaseError> {
        self.update_by_ids("resume_jobs", plans::resume_jobs(&self.schema), name, ids)
            .await
    }

    async fn retry_jobs(&self, name: &str, ids: &[Uuid]) -> Result<u64, DatabaseError> {
        self.update_by_ids("retry_jobs", plans::retry_jobs(&self.schema), name, ids)
            .await
    }

    async fn restore_jobs(&self, name: &str, ids: &[Uuid]) -> Result<RestoreReport, DatabaseError> {
        if ids.is_empty() {
            return Ok(RestoreReport::default());
        }
        let _guard = self.gate.lock().await;
        let tx = self.begin("restore_jobs").await?;
        let result = async {
            // OR IGNORE skips only the rows that collide with a policy index.
            let restored = tx
                .execute(
                    &plans::restore_jobs(&self.schema),
                    positional(vec![text(name), ids_json(ids)]),
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("restore_jobs: {e}")))?;
            let mut rows = tx
                .query(
                    &plans::still_active(&self.schema),
                    positional(vec![text(name), ids_json(ids)]),
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("restore_jobs conflicts: {e}")))?;
            let mut conflicted = Vec::new();
            while let Some(row) = rows
                .next()
                .await
                .map_err(|e| DatabaseError::Query(format!("restore_jobs conflicts: {e}")))?
            {
                let id = req_string(&row, 0)?;
                conflicted.push(
                    Uuid::parse_str(&id)
                        .map_err(|e| DatabaseError::Serialization(format!("id: {e}")))?,
                );
            }
            Ok(RestoreReport { restored, conflicted })
        }
        .await;
        let report = Self::finish(tx, result, "restore_jobs").await?;
        if !report.conflicted.is_empty() {
            warn!(queue = name, conflicted = report.conflicted.len(), "Restore blocked by policy index");
        }
        debug!(queue = name, count = report.restored, "Jobs restored");
        Ok(report)
    }

    async fn delete_jobs(&self, name: &str, ids: &[Uuid]) -> Result<u64, DatabaseError> {
        self.update_by_ids("delete_jobs", plans::delete_jobs(&self.schema), name, ids)
            .await
    }

    async fn get_jobs_by_id(
        &self,
        name: &str,
        ids: &[Uuid],
    ) -> Result<Vec<JobDetails>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let _guard = self.gate.lock().await;
        let rows = self
            .conn
            .query(
                &plans::select_jobs_by_id(&self.schema),
                positional(vec![text(name), ids_json(ids)]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_jobs_by_id: {e}")))?;
        collect_jobs(rows, "get_jobs_by_id").await
    }

    async fn find_jobs(
        &self,
        name: &str,
        filter: &FindJobsFilter,
    ) -> Result<Vec<JobDetails>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let rows = self
            .conn
            .query(
                &plans::find_jobs(&self.schema),
                positional(vec![
                    text(name),
                    opt_text(filter.id.map(|id| id.to_string()).as_deref()),
                    opt_text(filter.singleton_key.as_deref()),
                    opt_int(filter.state.map(JobState::code)),
                    Value::Integer(filter.queued as i64),
                ]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_jobs: {e}")))?;
        collect_jobs(rows, "find_jobs").await
    }

    async fn blocked_keys(&self, name: &str) -> Result<Vec<String>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(&plans::blocked_keys(&self.schema), positional(vec![text(name)]))
            .await
            .map_err(|e| DatabaseError::Query(format!("blocked_keys: {e}")))?;
        let mut keys = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("blocked_keys: {e}")))?
        {
            keys.push(req_string(&row, 0)?);
        }
        Ok(keys)
    }

    // ── Supervision ─────────────────────────────────────────────────

    async fn monitor_queue(
        &self,
        name: &str,
        interval: Duration,
    ) -> Result<Option<MonitorReport>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let tx = self.begin("monitor_queue").await?;
        let result = async {
            let claimed = tx
                .execute(
                    &plans::try_monitor(&self.schema),
                    positional(vec![text(name), Value::Integer(interval.as_millis() as i64)]),
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("monitor_queue: {e}")))?;
            if claimed == 0 {
                return Ok(None);
            }

            let rows = tx
                .query(&plans::take_expired_jobs(&self.schema), positional(vec![text(name)]))
                .await
                .map_err(|e| DatabaseError::Query(format!("monitor_queue expire: {e}")))?;
            let expired = collect_jobs(rows, "monitor_queue expire").await?;
            let output = serde_json::json!({ "message": "job failed by timeout in active state" });
            let expired = self.settle_failures(&tx, expired, Some(&output)).await?;

            let stats = self.stats_in(&tx, name).await?;
            tx.execute(
                &plans::cache_queue_stats(&self.schema),
                positional(vec![
                    text(name),
                    Value::Integer(stats.deferred_count as i64),
                    Value::Integer(stats.queued_count as i64),
                    Value::Integer(stats.active_count as i64),
                    Value::Integer(stats.total_count as i64),
                ]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("monitor_queue stats: {e}")))?;

            Ok(Some(MonitorReport { expired, stats }))
        }
        .await;
        Self::finish(tx, result, "monitor_queue").await
    }

    async fn maintain_queue(
        &self,
        config: &QueueConfig,
        interval: Duration,
    ) -> Result<Option<MaintenanceReport>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let tx = self.begin("maintain_queue").await?;
        let result = async {
            let claimed = tx
                .execute(
                    &plans::try_maintain(&self.schema),
                    positional(vec![
                        text(&config.name),
                        Value::Integer(interval.as_millis() as i64),
                    ]),
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("maintain_queue: {e}")))?;
            if claimed == 0 {
                return Ok(None);
            }

            let purged_settled = tx
                .execute(
                    &plans::purge_settled(&self.schema),
                    positional(vec![
                        text(&config.name),
                        Value::Integer(config.delete_after_seconds as i64),
                    ]),
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("maintain_queue settled: {e}")))?;
            let purged_unclaimed = tx
                .execute(
                    &plans::purge_unclaimed(&self.schema),
                    positional(vec![text(&config.name)]),
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("maintain_queue unclaimed: {e}")))?;

            Ok(Some(MaintenanceReport {
                purged_settled,
                purged_unclaimed,
            }))
        }
        .await;
        Self::finish(tx, result, "maintain_queue").await
    }

    async fn try_cron_tick(&self, interval: Duration) -> Result<bool, DatabaseError> {
        let _guard = self.gate.lock().await;
        let tx = self.begin("try_cron_tick").await?;
        let result = tx
            .execute(
                &plans::try_cron(&self.schema),
                positional(vec![Value::Integer(interval.as_millis() as i64)]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("try_cron_tick: {e}")));
        let claimed = Self::finish(tx, result, "try_cron_tick").await?;
        Ok(claimed > 0)
    }

    // ── Schedules ───────────────────────────────────────────────────

    async fn upsert_schedule(&self, schedule: &Schedule) -> Result<(), DatabaseError> {
        let options = serde_json::to_string(&schedule.options)
            .map_err(|e| DatabaseError::Serialization(format!("schedule options: {e}")))?;
        let _guard = self.gate.lock().await;
        let tx = self.begin("upsert_schedule").await?;
        let result = tx
            .execute(
                &plans::upsert_schedule(&self.schema),
                positional(vec![
                    text(&schedule.name),
                    text(&schedule.key),
                    text(&schedule.cron),
                    text(&schedule.timezone),
                    opt_text(schedule.data.as_ref().map(|d| d.to_string()).as_deref()),
                    Value::Text(options),
                ]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_schedule: {e}")));
        Self::finish(tx, result, "upsert_schedule").await?;
        debug!(queue = %schedule.name, key = %schedule.key, cron = %schedule.cron, "Schedule saved");
        Ok(())
    }

    async fn delete_schedule(&self, name: &str, key: Option<&str>) -> Result<u64, DatabaseError> {
        let _guard = self.gate.lock().await;
        let tx = self.begin("delete_schedule").await?;
        let result = tx
            .execute(
                &plans::delete_schedule(&self.schema),
                positional(vec![text(name), opt_text(key)]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_schedule: {e}")));
        Self::finish(tx, result, "delete_schedule").await
    }

    async fn get_schedules(
        &self,
        name: Option<&str>,
        key: Option<&str>,
    ) -> Result<Vec<Schedule>, DatabaseError> {
        let _guard = self.gate.lock().await;
        let mut rows = self
            .conn
            .query(
                &plans::select_schedules(&self.schema),
                positional(vec![opt_text(name), opt_text(key)]),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_schedules: {e}")))?;
        let mut schedules = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_schedules: {e}")))?
        {
            schedules.push(row_to_schedule(&row)?);
        }
        Ok(schedules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{GroupConcurrency, JobGroup};
    use crate::queue::QueueOptions;

    async fn test_store() -> LibSqlStore {
        LibSqlStore::new_memory(Schema::default()).await.unwrap()
    }

    async fn make_queue(store: &LibSqlStore, name: &str, options: QueueOptions) -> QueueConfig {
        let config = QueueConfig::resolve(name, &options).unwrap();
        store.create_queue(&config).await.unwrap();
        config
    }

    fn new_job(config: &QueueConfig, key: Option<&str>) -> NewJob {
        NewJob {
            id: Uuid::now_v7(),
            name: config.name.clone(),
            priority: 0,
            data: serde_json::json!({ "n": 1 }),
            retry_limit: config.retry_limit,
            retry_delay_seconds: config.retry_delay_seconds,
            retry_backoff: config.retry_backoff,
            retry_delay_max_seconds: config.retry_delay_max_seconds,
            expire_in_seconds: config.expire_in_seconds,
            singleton_key: key.map(str::to_string),
            singleton_on: None,
            group_id: None,
            group_tier: None,
            start_at: StartAt::Now,
            keep_until: None,
            retention_seconds: config.retention_seconds,
            dead_letter: config.dead_letter.clone(),
            policy: config.policy,
        }
    }

    async fn state_of(store: &LibSqlStore, name: &str, id: Uuid) -> JobState {
        store.get_jobs_by_id(name, &[id]).await.unwrap()[0].state
    }

    // ── Queue tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn create_queue_is_idempotent() {
        let store = test_store().await;
        let config = QueueConfig::resolve("q", &QueueOptions::default()).unwrap();
        assert!(store.create_queue(&config).await.unwrap());
        assert!(!store.create_queue(&config).await.unwrap());

        let queue = store.get_queue("q").await.unwrap().unwrap();
        assert_eq!(queue.config, config);
        assert!(queue.monitor_on.is_none());
    }

    #[tokio::test]
    async fn update_and_delete_queue() {
        let store = test_store().await;
        let config = make_queue(&store, "q", QueueOptions::default()).await;
        let job = new_job(&config, None);
        store.insert_job(&job).await.unwrap();

        let updated = config
            .merge(&QueueOptions {
                retry_limit: Some(9),
                ..QueueOptions::default()
            })
            .unwrap();
        assert!(store.update_queue(&updated).await.unwrap());
        assert_eq!(
            store.get_queue("q").await.unwrap().unwrap().config.retry_limit,
            9
        );

        assert!(store.delete_queue("q").await.unwrap());
        assert!(store.get_queue("q").await.unwrap().is_none());
        assert!(store.get_jobs_by_id("q", &[job.id]).await.unwrap().is_empty());
        assert!(!store.delete_queue("q").await.unwrap());
    }

    #[tokio::test]
    async fn partitioned_queue_gets_own_index() {
        let store = test_store().await;
        make_queue(
            &store,
            "part.q",
            QueueOptions {
                policy: Some(QueuePolicy::Short),
                partition: Some(true),
                ..QueueOptions::default()
            },
        )
        .await;

        let store_ref = &store;
        let count_index = move || async move {
            let mut rows = store_ref
                .conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = 'keeper_job_part_part.q'",
                    (),
                )
                .await
                .unwrap();
            rows.next().await.unwrap().unwrap().get::<i64>(0).unwrap()
        };
        assert_eq!(count_index().await, 1);

        store.delete_queue("part.q").await.unwrap();
        assert_eq!(count_index().await, 0);
    }

    // ── Insert tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn short_policy_keeps_one_queued_job_per_key() {
        let store = test_store().await;
        let config = make_queue(&store, "q", QueueOptions::with_policy(QueuePolicy::Short)).await;

        assert!(store.insert_job(&new_job(&config, Some("k"))).await.unwrap().is_some());
        assert!(store.insert_job(&new_job(&config, Some("k"))).await.unwrap().is_none());
        assert!(store.insert_job(&new_job(&config, Some("other"))).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn singleton_slot_drops_duplicates() {
        let store = test_store().await;
        let config = make_queue(&store, "q", QueueOptions::default()).await;

        let mut first = new_job(&config, Some("k"));
        first.singleton_on = Some(60_000);
        let mut second = new_job(&config, Some("k"));
        second.singleton_on = Some(60_000);
        let mut next_slot = new_job(&config, Some("k"));
        next_slot.singleton_on = Some(120_000);

        let ids = store
            .insert_jobs(&[first.clone(), second, next_slot.clone()])
            .await
            .unwrap();
        assert_eq!(ids, vec![first.id, next_slot.id]);
    }

    #[tokio::test]
    async fn deferred_job_is_not_claimable() {
        let store = test_store().await;
        let config = make_queue(&store, "q", QueueOptions::default()).await;
        let mut job = new_job(&config, None);
        job.start_at = StartAt::OffsetMillis(60_000);
        store.insert_job(&job).await.unwrap();

        let claimed = store
            .claim_jobs("q", config.policy, &FetchOptions::default())
            .await
            .unwrap();
        assert!(claimed.is_empty());
        assert_eq!(store.queue_stats("q").await.unwrap().deferred_count, 1);
    }

    // ── Claim tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn claim_orders_by_priority_then_age() {
        let store = test_store().await;
        let config = make_queue(&store, "q", QueueOptions::default()).await;
        let low = new_job(&config, None);
        let mut high = new_job(&config, None);
        high.priority = 10;
        let later = new_job(&config, None);
        store.insert_jobs(&[low.clone(), high.clone(), later.clone()]).await.unwrap();

        let claimed = store
            .claim_jobs("q", config.policy, &FetchOptions::batch(3))
            .await
            .unwrap();
        let ids: Vec<Uuid> = claimed.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![high.id, low.id, later.id]);
        assert!(claimed.iter().all(|j| j.state == JobState::Active && j.started_on.is_some()));

        let unordered = FetchOptions {
            priority: false,
            ..FetchOptions::batch(3)
        };
        assert!(store.claim_jobs("q", config.policy, &unordered).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn singleton_claims_one_active_per_key() {
        let store = test_store().await;
        let config = make_queue(&store, "q", QueueOptions::with_policy(QueuePolicy::Singleton)).await;
        let kept = store
            .insert_jobs(&[
                new_job(&config, Some("a")),
                new_job(&config, Some("a")),
                new_job(&config, Some("b")),
            ])
            .await
            .unwrap();
        assert_eq!(kept.len(), 2, "one queued job per key");

        let first = store
            .claim_jobs("q", config.policy, &FetchOptions::batch(5))
            .await
            .unwrap();
        let mut keys: Vec<_> = first.iter().filter_map(|j| j.singleton_key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);

        // The queued slot for "a" is free again while the first one runs.
        assert!(store.insert_job(&new_job(&config, Some("a"))).await.unwrap().is_some());
        let second = store
            .claim_jobs("q", config.policy, &FetchOptions::batch(5))
            .await
            .unwrap();
        assert!(second.is_empty(), "second 'a' must wait for the active one");

        let active_a = first.iter().find(|j| j.singleton_key.as_deref() == Some("a")).unwrap();
        store.complete_jobs("q", &[active_a.id], None).await.unwrap();
        let third = store
            .claim_jobs("q", config.policy, &FetchOptions::batch(5))
            .await
            .unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].singleton_key.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn excluded_keys_and_groups_are_skipped() {
        let store = test_store().await;
        let config = make_queue(&store, "q", QueueOptions::default()).await;
        let keyed = new_job(&config, Some("skip"));
        let mut grouped = new_job(&config, None);
        grouped.group_id = Some("g".into());
        let plain = new_job(&config, None);
        store.insert_jobs(&[keyed, grouped, plain.clone()]).await.unwrap();

        let options = FetchOptions {
            exclude_singleton_keys: vec!["skip".into()],
            exclude_group_ids: vec!["g".into()],
            ..FetchOptions::batch(10)
        };
        let claimed = store.claim_jobs("q", config.policy, &options).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, plain.id);
    }

    #[tokio::test]
    async fn group_concurrency_respects_tiers() {
        let store = test_store().await;
        let config = make_queue(&store, "q", QueueOptions::default()).await;
        let mut jobs = Vec::new();
        for _ in 0..4 {
            let mut job = new_job(&config, None);
            job.group_id = Some("gold-customer".into());
            job.group_tier = Some("gold".into());
            jobs.push(job);
        }
        for _ in 0..4 {
            let mut job = new_job(&config, None);
            job.group_id = Some("basic-customer".into());
            jobs.push(job);
        }
        store.insert_jobs(&jobs).await.unwrap();

        let options = FetchOptions {
            group_concurrency: Some(GroupConcurrency::new(1).with_tier("gold", 3)),
            ..FetchOptions::batch(10)
        };
        let claimed = store.claim_jobs("q", config.policy, &options).await.unwrap();
        let gold = claimed
            .iter()
            .filter(|j| j.group_id.as_deref() == Some("gold-customer"))
            .count();
        assert_eq!(gold, 3);
        assert_eq!(claimed.len(), 4);

        // Active jobs count against the limit on the next pass.
        let again = store.claim_jobs("q", config.policy, &options).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn key_strict_fifo_blocks_key_until_cleared() {
        let store = test_store().await;
        let config = make_queue(
            &store,
            "q",
            QueueOptions {
                policy: Some(QueuePolicy::KeyStrictFifo),
                retry_limit: Some(0),
                ..QueueOptions::default()
            },
        )
        .await;
        let first = new_job(&config, Some("k"));
        let second = new_job(&config, Some("k"));
        store.insert_jobs(&[first.clone(), second.clone()]).await.unwrap();

        let claimed = store
            .claim_jobs("q", config.policy, &FetchOptions::batch(5))
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, first.id);

        store
            .fail_jobs("q", &[first.id], Some(&serde_json::json!({ "message": "boom" })))
            .await
            .unwrap();
        assert_eq!(state_of(&store, "q", first.id).await, JobState::Failed);
        assert_eq!(store.blocked_keys("q").await.unwrap(), vec!["k".to_string()]);
        assert!(store
            .claim_jobs("q", config.policy, &FetchOptions::batch(5))
            .await
            .unwrap()
            .is_empty());

        assert_eq!(store.delete_jobs("q", &[first.id]).await.unwrap(), 1);
        let claimed = store
            .claim_jobs("q", config.policy, &FetchOptions::batch(5))
            .await
            .unwrap();
        assert_eq!(claimed[0].id, second.id);
    }

    // ── Transition tests ────────────────────────────────────────────

    #[tokio::test]
    async fn complete_is_idempotent() {
        let store = test_store().await;
        let config = make_queue(&store, "q", QueueOptions::default()).await;
        let job = new_job(&config, None);
        store.insert_job(&job).await.unwrap();
        store
            .claim_jobs("q", config.policy, &FetchOptions::default())
            .await
            .unwrap();

        let output = serde_json::json!({ "ok": true });
        assert_eq!(store.complete_jobs("q", &[job.id], Some(&output)).await.unwrap(), 1);
        assert_eq!(store.complete_jobs("q", &[job.id], None).await.unwrap(), 0);

        let stored = &store.get_jobs_by_id("q", &[job.id]).await.unwrap()[0];
        assert_eq!(stored.state, JobState::Completed);
        assert_eq!(stored.output, Some(output));
        assert!(stored.completed_on.is_some());
    }

    #[tokio::test]
    async fn reclaim_counts_retries() {
        let store = test_store().await;
        let config = make_queue(&store, "q", QueueOptions::default()).await;
        let job = new_job(&config, None);
        store.insert_job(&job).await.unwrap();

        let first = store.claim_jobs("q", config.policy, &FetchOptions::default()).await.unwrap();
        assert_eq!(first[0].retry_count, 0);
        store
            .fail_jobs("q", &[job.id], None)
            .await
            .unwrap();
        let second = store.claim_jobs("q", config.policy, &FetchOptions::default()).await.unwrap();
        assert_eq!(second[0].retry_count, 1);
    }

    #[tokio::test]
    async fn cancel_resume_and_retry_report_counts() {
        let store = test_store().await;
        let config = make_queue(
            &store,
            "q",
            QueueOptions {
                retry_limit: Some(0),
                ..QueueOptions::default()
            },
        )
        .await;
        let job = new_job(&config, None);
        store.insert_job(&job).await.unwrap();

        assert_eq!(store.resume_jobs("q", &[job.id]).await.unwrap(), 0);
        assert_eq!(store.cancel_jobs("q", &[job.id]).await.unwrap(), 1);
        assert_eq!(store.cancel_jobs("q", &[job.id]).await.unwrap(), 0);
        assert_eq!(store.resume_jobs("q", &[job.id]).await.unwrap(), 1);
        assert_eq!(state_of(&store, "q", job.id).await, JobState::Created);

        store.claim_jobs("q", config.policy, &FetchOptions::default()).await.unwrap();
        let report = store
            .fail_jobs("q", &[job.id], Some(&serde_json::json!({ "message": "x" })))
            .await
            .unwrap();
        assert_eq!(report.failed, vec![job.id]);

        assert_eq!(store.retry_jobs("q", &[job.id]).await.unwrap(), 1);
        let retried = &store.get_jobs_by_id("q", &[job.id]).await.unwrap()[0];
        assert_eq!(retried.state, JobState::Retry);
        assert_eq!(retried.retry_limit, 1);
        assert!(retried.completed_on.is_none());
    }

    #[tokio::test]
    async fn restore_undoes_claim() {
        let store = test_store().await;
        let config = make_queue(&store, "q", QueueOptions::default()).await;
        let job = new_job(&config, None);
        store.insert_job(&job).await.unwrap();
        store.claim_jobs("q", config.policy, &FetchOptions::default()).await.unwrap();

        let report = store.restore_jobs("q", &[job.id]).await.unwrap();
        assert_eq!(report.restored, 1);
        assert!(report.conflicted.is_empty());
        let restored = &store.get_jobs_by_id("q", &[job.id]).await.unwrap()[0];
        assert_eq!(restored.state, JobState::Created);
        assert!(restored.started_on.is_none());
        assert_eq!(restored.retry_count, 0);
    }

    #[tokio::test]
    async fn restore_reports_singleton_conflict() {
        let store = test_store().await;
        let config = make_queue(&store, "q", QueueOptions::with_policy(QueuePolicy::Singleton)).await;
        let active = new_job(&config, Some("x"));
        store.insert_job(&active).await.unwrap();
        store.claim_jobs("q", config.policy, &FetchOptions::default()).await.unwrap();
        let queued = new_job(&config, Some("x"));
        assert!(store.insert_job(&queued).await.unwrap().is_some());

        let report = store.restore_jobs("q", &[active.id]).await.unwrap();
        assert_eq!(report.restored, 0);
        assert_eq!(report.conflicted, vec![active.id]);
        assert_eq!(state_of(&store, "q", active.id).await, JobState::Active);
        assert_eq!(state_of(&store, "q", queued.id).await, JobState::Created);
    }

    #[tokio::test]
    async fn dead_letter_receives_payload_once() {
        let store = test_store().await;
        make_queue(&store, "dlq", QueueOptions::default()).await;
        let config = make_queue(
            &store,
            "q",
            QueueOptions {
                retry_limit: Some(0),
                dead_letter: Some("dlq".into()),
                ..QueueOptions::default()
            },
        )
        .await;
        let job = new_job(&config, None);
        store.insert_job(&job).await.unwrap();
        store.claim_jobs("q", config.policy, &FetchOptions::default()).await.unwrap();

        let output = serde_json::json!({ "message": "boom" });
        let report = store.fail_jobs("q", &[job.id], Some(&output)).await.unwrap();
        assert_eq!(report.dead_lettered.len(), 1);

        let copies = store.find_jobs("dlq", &FindJobsFilter::default()).await.unwrap();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].data, job.data);
        assert_eq!(copies[0].output, Some(output.clone()));

        // Already failed: a second fail is a no-op.
        let again = store.fail_jobs("q", &[job.id], Some(&output)).await.unwrap();
        assert_eq!(again.affected(), 0);
        assert_eq!(store.find_jobs("dlq", &FindJobsFilter::default()).await.unwrap().len(), 1);
    }

    // ── Supervision tests ───────────────────────────────────────────

    #[tokio::test]
    async fn monitor_fails_expired_active_jobs() {
        let store = test_store().await;
        let config = make_queue(&store, "q", QueueOptions::default()).await;
        let job = new_job(&config, None);
        store.insert_job(&job).await.unwrap();
        store.claim_jobs("q", config.policy, &FetchOptions::default()).await.unwrap();
        store
            .conn
            .execute(
                "UPDATE keeper_job SET started_on = started_on - 3600000 WHERE id = ?1",
                positional(vec![text(&job.id.to_string())]),
            )
            .await
            .unwrap();

        let report = store.monitor_queue("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(report.expired.retried, vec![job.id]);
        assert_eq!(report.stats.active_count, 0);
        assert_eq!(report.stats.queued_count, 1);

        let stored = &store.get_jobs_by_id("q", &[job.id]).await.unwrap()[0];
        assert_eq!(stored.state, JobState::Retry);
        assert_eq!(
            stored.output.as_ref().unwrap()["message"],
            "job failed by timeout in active state"
        );
        let cached = store.get_queue("q").await.unwrap().unwrap();
        assert_eq!(cached.stats.queued_count, 1);
        assert!(cached.monitor_on.is_some());
    }

    #[tokio::test]
    async fn monitor_slot_is_shared() {
        let store = test_store().await;
        make_queue(&store, "q", QueueOptions::default()).await;
        let hour = Duration::from_secs(3600);
        assert!(store.monitor_queue("q", hour).await.unwrap().is_some());
        assert!(store.monitor_queue("q", hour).await.unwrap().is_none());
        assert!(store.try_cron_tick(hour).await.unwrap());
        assert!(!store.try_cron_tick(hour).await.unwrap());
    }

    #[tokio::test]
    async fn maintenance_purges_old_jobs() {
        let store = test_store().await;
        let config = make_queue(&store, "q", QueueOptions::default()).await;
        let done = new_job(&config, None);
        let stale = new_job(&config, None);
        let fresh = new_job(&config, None);
        store.insert_jobs(&[done.clone(), stale.clone(), fresh.clone()]).await.unwrap();
        store
            .conn
            .execute(
                "UPDATE keeper_job SET state = 3, completed_on = 0 WHERE id = ?1",
                positional(vec![text(&done.id.to_string())]),
            )
            .await
            .unwrap();
        store
            .conn
            .execute(
                "UPDATE keeper_job SET keep_until = 0 WHERE id = ?1",
                positional(vec![text(&stale.id.to_string())]),
            )
            .await
            .unwrap();

        let report = store.maintain_queue(&config, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(report.purged_settled, 1);
        assert_eq!(report.purged_unclaimed, 1);
        let left = store.find_jobs("q", &FindJobsFilter::default()).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, fresh.id);
    }

    // ── Schedule tests ──────────────────────────────────────────────

    #[tokio::test]
    async fn schedules_upsert_by_key() {
        let store = test_store().await;
        make_queue(&store, "q", QueueOptions::default()).await;
        let mut schedule = Schedule {
            name: "q".into(),
            key: String::new(),
            cron: "0 * * * *".into(),
            timezone: "UTC".into(),
            data: Some(serde_json::json!({ "report": "hourly" })),
            options: ScheduleOptions {
                group: Some(JobGroup::new("reports")),
                ..ScheduleOptions::default()
            },
            created_on: Utc::now(),
            updated_on: Utc::now(),
        };
        store.upsert_schedule(&schedule).await.unwrap();
        schedule.cron = "*/5 * * * *".into();
        store.upsert_schedule(&schedule).await.unwrap();
        schedule.key = "eu".into();
        store.upsert_schedule(&schedule).await.unwrap();

        let all = store.get_schedules(Some("q"), None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].cron, "*/5 * * * *");
        assert_eq!(all[0].options.group, Some(JobGroup::new("reports")));

        assert_eq!(store.delete_schedule("q", Some("eu")).await.unwrap(), 1);
        assert_eq!(store.delete_schedule("q", None).await.unwrap(), 1);
        assert!(store.get_schedules(None, None).await.unwrap().is_empty());
    }

    // ── Cross-connection tests ──────────────────────────────────────

    #[tokio::test]
    async fn two_stores_never_claim_the_same_job() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");
        let a = Arc::new(LibSqlStore::new_local(&path, Schema::default()).await.unwrap());
        let b = Arc::new(LibSqlStore::new_local(&path, Schema::default()).await.unwrap());

        let config = make_queue(&a, "q", QueueOptions::default()).await;
        a.insert_job(&new_job(&config, None)).await.unwrap();

        let (ra, rb) = tokio::join!(
            {
                let a = Arc::clone(&a);
                async move { a.claim_jobs("q", QueuePolicy::Standard, &FetchOptions::default()).await }
            },
            {
                let b = Arc::clone(&b);
                async move { b.claim_jobs("q", QueuePolicy::Standard, &FetchOptions::default()).await }
            }
        );
        let total = ra.unwrap().len() + rb.unwrap().len();
        assert_eq!(total, 1);
    }
}
