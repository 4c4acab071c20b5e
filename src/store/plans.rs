//! SQL text for the job store.
//!
//! Only validated structural identifiers (the schema prefix, policy names,
//! queue names for partition indexes) are interpolated. Every other value is a
//! bound parameter; lists travel as JSON text and are expanded with `json_each`.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::ValidationError;
use crate::queue::QueuePolicy;

/// Store clock in epoch milliseconds.
pub(crate) const NOW_MS: &str = "(CAST(strftime('%s','now') AS INTEGER) * 1000 + CAST(substr(strftime('%f','now'), 4) AS INTEGER))";

/// Column order shared by every statement that reads whole jobs.
///
/// 0:id, 1:name, 2:priority, 3:data, 4:state, 5:retry_limit, 6:retry_count,
/// 7:retry_delay, 8:retry_backoff, 9:retry_delay_max, 10:expire_seconds,
/// 11:singleton_key, 12:singleton_on, 13:group_id, 14:group_tier,
/// 15:start_after, 16:created_on, 17:started_on, 18:completed_on,
/// 19:keep_until, 20:output, 21:dead_letter, 22:policy
pub(crate) const JOB_COLUMNS: &str = "id, name, priority, data, state, retry_limit, retry_count, retry_delay, retry_backoff, retry_delay_max, expire_seconds, singleton_key, singleton_on, group_id, group_tier, start_after, created_on, started_on, completed_on, keep_until, output, dead_letter, policy";

/// 0:name, 1:policy, 2:retry_limit, 3:retry_delay, 4:retry_backoff,
/// 5:retry_delay_max, 6:expire_seconds, 7:retention_seconds,
/// 8:deletion_seconds, 9:dead_letter, 10:partitioned, 11:warning_queued,
/// 12:deferred_count, 13:queued_count, 14:active_count, 15:total_count,
/// 16:monitor_on, 17:maintain_on, 18:created_on, 19:updated_on
pub(crate) const QUEUE_COLUMNS: &str = "name, policy, retry_limit, retry_delay, retry_backoff, retry_delay_max, expire_seconds, retention_seconds, deletion_seconds, dead_letter, partitioned, warning_queued, deferred_count, queued_count, active_count, total_count, monitor_on, maintain_on, created_on, updated_on";

/// 0:name, 1:key, 2:cron, 3:timezone, 4:data, 5:options, 6:created_on, 7:updated_on
pub(crate) const SCHEDULE_COLUMNS: &str =
    "name, key, cron, timezone, data, options, created_on, updated_on";

static SCHEMA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,49}$").unwrap_or_else(|e| panic!("schema regex: {e}"))
});

/// Validated table-name prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema(String);

impl Schema {
    pub fn new(prefix: &str) -> Result<Self, ValidationError> {
        if !SCHEMA_RE.is_match(prefix) {
            return Err(ValidationError::InvalidSchema(prefix.to_string()));
        }
        Ok(Self(prefix.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn queue_table(&self) -> String {
        format!("{}_queue", self.0)
    }

    pub fn job_table(&self) -> String {
        format!("{}_job", self.0)
    }

    pub fn schedule_table(&self) -> String {
        format!("{}_schedule", self.0)
    }

    pub fn meta_table(&self) -> String {
        format!("{}_meta", self.0)
    }

    pub fn migrations_table(&self) -> String {
        format!("{}_migrations", self.0)
    }

    /// Expand `{schema}` placeholders in migration text.
    pub fn render(&self, template: &str) -> String {
        template.replace("{schema}", &self.0)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self("keeper".to_string())
    }
}

// ── Queues ──────────────────────────────────────────────────────────

pub(crate) fn insert_queue(schema: &Schema) -> String {
    format!(
        "INSERT INTO {queue} (name, policy, retry_limit, retry_delay, retry_backoff, retry_delay_max,
            expire_seconds, retention_seconds, deletion_seconds, dead_letter, partitioned, warning_queued,
            created_on, updated_on)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, {NOW_MS}, {NOW_MS})
         ON CONFLICT(name) DO NOTHING",
        queue = schema.queue_table(),
    )
}

pub(crate) fn update_queue(schema: &Schema) -> String {
    format!(
        "UPDATE {queue}
         SET retry_limit = ?2, retry_delay = ?3, retry_backoff = ?4, retry_delay_max = ?5,
             expire_seconds = ?6, retention_seconds = ?7, deletion_seconds = ?8,
             dead_letter = ?9, warning_queued = ?10, updated_on = {NOW_MS}
         WHERE name = ?1",
        queue = schema.queue_table(),
    )
}

pub(crate) fn select_queue(schema: &Schema) -> String {
    format!(
        "SELECT {QUEUE_COLUMNS} FROM {queue} WHERE name = ?1",
        queue = schema.queue_table(),
    )
}

pub(crate) fn select_queues(schema: &Schema) -> String {
    format!(
        "SELECT {QUEUE_COLUMNS} FROM {queue}
         WHERE ?1 IS NULL OR name IN (SELECT value FROM json_each(?1))
         ORDER BY name",
        queue = schema.queue_table(),
    )
}

pub(crate) fn count_queue(schema: &Schema) -> String {
    format!(
        "SELECT COUNT(*) FROM {queue} WHERE name = ?1",
        queue = schema.queue_table(),
    )
}

pub(crate) fn delete_queue(schema: &Schema) -> String {
    format!(
        "DELETE FROM {queue} WHERE name = ?1",
        queue = schema.queue_table()
    )
}

pub(crate) fn delete_queue_jobs(schema: &Schema) -> String {
    format!("DELETE FROM {job} WHERE name = ?1", job = schema.job_table())
}

pub(crate) fn delete_queue_schedules(schema: &Schema) -> String {
    format!(
        "DELETE FROM {schedule} WHERE name = ?1",
        schedule = schema.schedule_table()
    )
}

/// Live counts: deferred, queued, active, total.
pub(crate) fn queue_stats(schema: &Schema) -> String {
    format!(
        "SELECT
            COALESCE(SUM(CASE WHEN state = 0 AND start_after > {NOW_MS} THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN state < 2 THEN 1 ELSE 0 END), 0),
            COALESCE(SUM(CASE WHEN state = 2 THEN 1 ELSE 0 END), 0),
            COUNT(*)
         FROM {job} WHERE name = ?1",
        job = schema.job_table(),
    )
}

pub(crate) fn cache_queue_stats(schema: &Schema) -> String {
    format!(
        "UPDATE {queue}
         SET deferred_count = ?2, queued_count = ?3, active_count = ?4, total_count = ?5
         WHERE name = ?1",
        queue = schema.queue_table(),
    )
}

/// Name of the queue-scoped copy of a policy index.
pub(crate) fn partition_index_name(schema: &Schema, queue: &str) -> String {
    format!("{}_job_part_{}", schema.as_str(), queue)
}

/// Queue-scoped unique index for a partitioned queue. `None` for `standard`.
///
/// `queue` must already have passed `validate_queue_name`; partial-index
/// predicates cannot take bound parameters.
pub(crate) fn create_partition_index(
    schema: &Schema,
    queue: &str,
    policy: QueuePolicy,
) -> Option<String> {
    let (columns, predicate) = policy_index_shape(policy)?;
    Some(format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS \"{index}\" ON {job} ({columns})
         WHERE name = '{queue}' AND {predicate}",
        index = partition_index_name(schema, queue),
        job = schema.job_table(),
    ))
}

pub(crate) fn drop_partition_index(schema: &Schema, queue: &str) -> String {
    format!(
        "DROP INDEX IF EXISTS \"{}\"",
        partition_index_name(schema, queue)
    )
}

/// Indexed columns and state predicate enforcing each policy's key invariant.
pub(crate) fn policy_index_shape(policy: QueuePolicy) -> Option<(&'static str, &'static str)> {
    match policy {
        QueuePolicy::Standard => None,
        QueuePolicy::Short => Some(("name, COALESCE(singleton_key, '')", "state < 2")),
        // One queued and one active job per key.
        QueuePolicy::Singleton => Some((
            "name, state = 2, COALESCE(singleton_key, '')",
            "state <= 2",
        )),
        QueuePolicy::Stately => Some(("name, state, COALESCE(singleton_key, '')", "state <= 2")),
        QueuePolicy::Exclusive => Some(("name, COALESCE(singleton_key, '')", "state <= 2")),
        QueuePolicy::KeyStrictFifo => Some(("name, singleton_key", "state IN (1, 2, 5)")),
    }
}

// ── Jobs ────────────────────────────────────────────────────────────

/// Insert one job; start time and keep-until are resolved against store time.
///
/// ?14 absolute start (ms) or NULL, ?15 offset from now (ms),
/// ?16 keep_until (ms) or NULL for start + ?17 retention seconds.
pub(crate) fn insert_job(schema: &Schema) -> String {
    format!(
        "INSERT INTO {job} (id, name, priority, data, state, retry_limit, retry_count, retry_delay,
            retry_backoff, retry_delay_max, expire_seconds, singleton_key, singleton_on, group_id,
            group_tier, start_after, created_on, keep_until, dead_letter, policy)
         SELECT ?1, ?2, ?3, ?4, 0, ?5, 0, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
            s.start_after, s.now, COALESCE(?16, s.start_after + ?17 * 1000), ?18, ?19
         FROM (SELECT {NOW_MS} AS now, COALESCE(?14, {NOW_MS} + ?15) AS start_after) s
         WHERE true
         ON CONFLICT DO NOTHING",
        job = schema.job_table(),
    )
}

/// Re-insert a job row verbatim (all 23 columns, in `JOB_COLUMNS` order).
pub(crate) fn reinsert_job(schema: &Schema) -> String {
    format!(
        "INSERT INTO {job} ({JOB_COLUMNS})
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
            ?19, ?20, ?21, ?22, ?23)
         ON CONFLICT DO NOTHING",
        job = schema.job_table(),
    )
}

/// Clone a failed job's payload and output into its dead letter queue, using
/// that queue's defaults. Nothing is inserted if the queue no longer exists.
pub(crate) fn insert_dead_letter(schema: &Schema) -> String {
    format!(
        "INSERT INTO {job} ({JOB_COLUMNS})
         SELECT ?1, q.name, ?2, ?3, 0, q.retry_limit, 0, q.retry_delay, q.retry_backoff,
            q.retry_delay_max, q.expire_seconds, ?4, NULL, NULL, NULL, {NOW_MS}, {NOW_MS},
            NULL, NULL, {NOW_MS} + q.retention_seconds * 1000, ?5, q.dead_letter, q.policy
         FROM {queue} q
         WHERE q.name = ?6
         ON CONFLICT DO NOTHING",
        job = schema.job_table(),
        queue = schema.queue_table(),
    )
}

/// Extra eligibility predicate a policy adds on top of `state < active`.
fn claim_policy_filter(schema: &Schema, policy: QueuePolicy) -> String {
    let job = schema.job_table();
    match policy {
        QueuePolicy::Singleton | QueuePolicy::Stately => format!(
            "AND NOT EXISTS (
                SELECT 1 FROM {job} a
                WHERE a.name = j.name AND a.state = 2
                  AND COALESCE(a.singleton_key, '') = COALESCE(j.singleton_key, ''))"
        ),
        QueuePolicy::KeyStrictFifo => format!(
            "AND NOT EXISTS (
                SELECT 1 FROM {job} b
                WHERE b.name = j.name AND b.singleton_key = j.singleton_key AND b.id <> j.id
                  AND (b.state IN (2, 5)
                       OR (b.state < 2 AND (b.created_on < j.created_on
                           OR (b.created_on = j.created_on AND b.id < j.id)))))"
        ),
        QueuePolicy::Standard | QueuePolicy::Short | QueuePolicy::Exclusive => String::new(),
    }
}

/// The claim: select eligible rows, dedupe by key for single-flight policies,
/// admit per group up to the remaining limit, and activate them in the same
/// statement.
///
/// ?1 queue, ?2 batch size, ?3 excluded keys (JSON array or NULL),
/// ?4 excluded groups (JSON array or NULL), ?5 default group limit or NULL,
/// ?6 tier limits (JSON object or NULL).
pub(crate) fn claim_jobs(schema: &Schema, policy: QueuePolicy, priority: bool) -> String {
    let order = if priority {
        "priority DESC, created_on, id"
    } else {
        "created_on, id"
    };
    let dedup = if policy.dedups_batch() {
        "r.key_rank = 1"
    } else {
        "1 = 1"
    };
    format!(
        "UPDATE OR IGNORE {job}
         SET state = 2,
             started_on = {NOW_MS},
             retry_count = CASE WHEN started_on IS NOT NULL THEN retry_count + 1 ELSE retry_count END
         WHERE id IN (
            WITH candidates AS (
                SELECT j.id, j.singleton_key, j.group_id, j.group_tier, j.priority, j.created_on
                FROM {job} j
                WHERE j.name = ?1
                  AND j.state < 2
                  AND j.start_after <= {NOW_MS}
                  AND (?3 IS NULL OR j.singleton_key IS NULL
                       OR j.singleton_key NOT IN (SELECT value FROM json_each(?3)))
                  AND (?4 IS NULL OR j.group_id IS NULL
                       OR j.group_id NOT IN (SELECT value FROM json_each(?4)))
                  {filter}
                ORDER BY {order}
                LIMIT ?2
            ),
            ranked AS (
                SELECT c.*, ROW_NUMBER() OVER (
                    PARTITION BY COALESCE(c.singleton_key, '') ORDER BY {order}) AS key_rank
                FROM candidates c
            ),
            admitted AS (
                SELECT r.*, ROW_NUMBER() OVER (
                    PARTITION BY r.group_id ORDER BY {order}) AS group_rank
                FROM ranked r
                WHERE {dedup}
            ),
            active_groups AS (
                SELECT group_id, COUNT(*) AS active_count
                FROM {job}
                WHERE name = ?1 AND state = 2 AND group_id IS NOT NULL
                GROUP BY group_id
            )
            SELECT a.id
            FROM admitted a
            LEFT JOIN active_groups g ON g.group_id = a.group_id
            WHERE ?5 IS NULL OR a.group_id IS NULL
               OR COALESCE(g.active_count, 0) + a.group_rank <= COALESCE(
                    (SELECT t.value FROM json_each(?6) t WHERE t.key = a.group_tier), ?5)
         )
         RETURNING {JOB_COLUMNS}",
        job = schema.job_table(),
        filter = claim_policy_filter(schema, policy),
    )
}

pub(crate) fn complete_jobs(schema: &Schema) -> String {
    format!(
        "UPDATE {job}
         SET state = 3, completed_on = {NOW_MS}, output = ?3
         WHERE name = ?1 AND id IN (SELECT value FROM json_each(?2)) AND state = 2",
        job = schema.job_table(),
    )
}

/// Remove non-terminal jobs so they can be re-inserted as retry or failed.
pub(crate) fn take_failing_jobs(schema: &Schema) -> String {
    format!(
        "DELETE FROM {job}
         WHERE name = ?1 AND id IN (SELECT value FROM json_each(?2)) AND state < 3
         RETURNING {JOB_COLUMNS}",
        job = schema.job_table(),
    )
}

/// Remove active jobs that outlived their expiration.
pub(crate) fn take_expired_jobs(schema: &Schema) -> String {
    format!(
        "DELETE FROM {job}
         WHERE name = ?1 AND state = 2 AND started_on + expire_seconds * 1000 < {NOW_MS}
         RETURNING {JOB_COLUMNS}",
        job = schema.job_table(),
    )
}

pub(crate) fn cancel_jobs(schema: &Schema) -> String {
    format!(
        "UPDATE {job}
         SET state = 4, completed_on = {NOW_MS}
         WHERE name = ?1 AND id IN (SELECT value FROM json_each(?2)) AND state < 3",
        job = schema.job_table(),
    )
}

pub(crate) fn resume_jobs(schema: &Schema) -> String {
    format!(
        "UPDATE OR IGNORE {job}
         SET state = 0, completed_on = NULL
         WHERE name = ?1 AND id IN (SELECT value FROM json_each(?2)) AND state = 4",
        job = schema.job_table(),
    )
}

/// Failed back to retry with one more attempt available.
pub(crate) fn retry_jobs(schema: &Schema) -> String {
    format!(
        "UPDATE OR IGNORE {job}
         SET state = 1, retry_limit = retry_limit + 1, start_after = {NOW_MS}, completed_on = NULL
         WHERE name = ?1 AND id IN (SELECT value FROM json_each(?2)) AND state = 5",
        job = schema.job_table(),
    )
}

/// Undo a claim. A first claim goes back to created with no start stamp; a
/// re-claim goes back to retry with its attempt count rolled back.
pub(crate) fn restore_jobs(schema: &Schema) -> String {
    format!(
        "UPDATE OR IGNORE {job}
         SET state = CASE WHEN retry_count = 0 THEN 0 ELSE 1 END,
             started_on = CASE WHEN retry_count = 0 THEN NULL ELSE started_on END,
             retry_count = CASE WHEN retry_count = 0 THEN 0 ELSE retry_count - 1 END
         WHERE name = ?1 AND id IN (SELECT value FROM json_each(?2)) AND state = 2",
        job = schema.job_table(),
    )
}

/// Requested ids that are still active after a restore.
pub(crate) fn still_active(schema: &Schema) -> String {
    format!(
        "SELECT id FROM {job}
         WHERE name = ?1 AND id IN (SELECT value FROM json_each(?2)) AND state = 2",
        job = schema.job_table(),
    )
}

pub(crate) fn delete_jobs(schema: &Schema) -> String {
    format!(
        "DELETE FROM {job} WHERE name = ?1 AND id IN (SELECT value FROM json_each(?2))",
        job = schema.job_table(),
    )
}

pub(crate) fn select_jobs_by_id(schema: &Schema) -> String {
    format!(
        "SELECT {JOB_COLUMNS} FROM {job}
         WHERE name = ?1 AND id IN (SELECT value FROM json_each(?2))
         ORDER BY created_on, id",
        job = schema.job_table(),
    )
}

/// ?2 id, ?3 singleton key, ?4 state (each NULL for any), ?5 queued-only flag.
pub(crate) fn find_jobs(schema: &Schema) -> String {
    format!(
        "SELECT {JOB_COLUMNS} FROM {job}
         WHERE name = ?1
           AND (?2 IS NULL OR id = ?2)
           AND (?3 IS NULL OR singleton_key = ?3)
           AND (?4 IS NULL OR state = ?4)
           AND (?5 = 0 OR state < 2)
         ORDER BY created_on, id",
        job = schema.job_table(),
    )
}

pub(crate) fn blocked_keys(schema: &Schema) -> String {
    format!(
        "SELECT DISTINCT singleton_key FROM {job}
         WHERE name = ?1 AND state IN (1, 5) AND singleton_key IS NOT NULL
         ORDER BY singleton_key",
        job = schema.job_table(),
    )
}

// ── Supervision ─────────────────────────────────────────────────────

/// Claim the monitor slot for a queue if the last pass is older than ?2 ms.
pub(crate) fn try_monitor(schema: &Schema) -> String {
    format!(
        "UPDATE {queue} SET monitor_on = {NOW_MS}
         WHERE name = ?1 AND (monitor_on IS NULL OR monitor_on <= {NOW_MS} - ?2)",
        queue = schema.queue_table(),
    )
}

pub(crate) fn try_maintain(schema: &Schema) -> String {
    format!(
        "UPDATE {queue} SET maintain_on = {NOW_MS}
         WHERE name = ?1 AND (maintain_on IS NULL OR maintain_on <= {NOW_MS} - ?2)",
        queue = schema.queue_table(),
    )
}

pub(crate) fn try_cron(schema: &Schema) -> String {
    format!(
        "UPDATE {meta} SET cron_on = {NOW_MS}
         WHERE id = 1 AND (cron_on IS NULL OR cron_on <= {NOW_MS} - ?1)",
        meta = schema.meta_table(),
    )
}

/// Settled jobs older than ?2 seconds past completion.
pub(crate) fn purge_settled(schema: &Schema) -> String {
    format!(
        "DELETE FROM {job}
         WHERE name = ?1 AND state > 2 AND completed_on + ?2 * 1000 < {NOW_MS}",
        job = schema.job_table(),
    )
}

/// Queued jobs nobody claimed before their keep-until.
pub(crate) fn purge_unclaimed(schema: &Schema) -> String {
    format!(
        "DELETE FROM {job} WHERE name = ?1 AND state < 2 AND keep_until < {NOW_MS}",
        job = schema.job_table(),
    )
}

pub(crate) fn store_now() -> String {
    format!("SELECT {NOW_MS}")
}

// ── Schedules ───────────────────────────────────────────────────────

pub(crate) fn upsert_schedule(schema: &Schema) -> String {
    format!(
        "INSERT INTO {schedule} (name, key, cron, timezone, data, options, created_on, updated_on)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, {NOW_MS}, {NOW_MS})
         ON CONFLICT(name, key) DO UPDATE SET
            cron = excluded.cron,
            timezone = excluded.timezone,
            data = excluded.data,
            options = excluded.options,
            updated_on = excluded.updated_on",
        schedule = schema.schedule_table(),
    )
}

pub(crate) fn delete_schedule(schema: &Schema) -> String {
    format!(
        "DELETE FROM {schedule} WHERE name = ?1 AND (?2 IS NULL OR key = ?2)",
        schedule = schema.schedule_table(),
    )
}

pub(crate) fn select_schedules(schema: &Schema) -> String {
    format!(
        "SELECT {SCHEDULE_COLUMNS} FROM {schedule}
         WHERE (?1 IS NULL OR name = ?1) AND (?2 IS NULL OR key = ?2)
         ORDER BY name, key",
        schedule = schema.schedule_table(),
    )
}
