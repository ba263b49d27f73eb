// SQLite-backed durable job queue with priority classes, visibility
// timeouts, unique-key de-duplication and a dead-letter set.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, Pool, Sqlite};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{AgentTraceError, Result};

use super::backoff::ExponentialBackoff;
use super::job::{EnqueueOptions, Job, JobKind, JobStatus, Lease, QueueClass};

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job. If `unique_key` is held by a pending or active job,
    /// the existing job id is returned instead of creating a duplicate.
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<String>;

    /// Claim the next eligible job from the given classes, weighted 6:3:1.
    async fn dequeue(&self, queues: &[QueueClass]) -> Result<Option<Lease>>;

    /// Acknowledge successful completion.
    async fn ack(&self, lease: &Lease) -> Result<()>;

    /// Report failure. Retryable failures reschedule with backoff until
    /// `max_retry` is exhausted; permanent failures dead-letter immediately.
    async fn nack(&self, lease: &Lease, error: &str, permanent: bool) -> Result<()>;

    async fn dead_letters(&self) -> Result<Vec<Job>>;

    /// Move a dead-lettered job back to pending with a fresh attempt budget.
    async fn requeue(&self, job_id: &str) -> Result<()>;

    async fn pending_count(&self) -> Result<i64>;

    /// Jobs eligible now or currently in flight; excludes work deferred to
    /// the future and terminal states. Used by drains and health checks.
    async fn due_count(&self) -> Result<i64>;
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    kind: String,
    queue: String,
    payload: String,
    status: String,
    attempts: i64,
    max_retry: i64,
    timeout_secs: i64,
    backoff_base_ms: i64,
    unique_key: Option<String>,
    scheduled_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = AgentTraceError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id,
            kind: JobKind::parse(&row.kind)?,
            queue: QueueClass::parse(&row.queue),
            payload: serde_json::from_str(&row.payload)?,
            status: JobStatus::parse(&row.status),
            attempts: row.attempts as u32,
            max_retry: row.max_retry as u32,
            timeout_secs: row.timeout_secs as u64,
            backoff_base_ms: row.backoff_base_ms as u64,
            unique_key: row.unique_key,
            scheduled_at: row.scheduled_at,
            visible_at: row.visible_at,
            last_error: row.last_error,
            created_at: row.created_at,
        })
    }
}

/// Visit order over the requested classes: the head is picked by weighted
/// random draw, the tail falls back by descending weight.
fn weighted_order(queues: &[QueueClass], roll: f64) -> Vec<QueueClass> {
    let mut classes: Vec<QueueClass> = queues.to_vec();
    classes.sort_by_key(|c| std::cmp::Reverse(c.weight()));
    classes.dedup();
    if classes.len() <= 1 {
        return classes;
    }

    let total: u32 = classes.iter().map(|c| c.weight()).sum();
    let mut threshold = roll * total as f64;
    let mut first = classes[0];
    for class in &classes {
        threshold -= class.weight() as f64;
        if threshold < 0.0 {
            first = *class;
            break;
        }
    }

    let mut order = vec![first];
    order.extend(classes.into_iter().filter(|c| *c != first));
    order
}

pub struct SqlJobQueue {
    pool: Pool<Sqlite>,
    backoff: ExponentialBackoff,
}

impl SqlJobQueue {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self {
            pool,
            backoff: ExponentialBackoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Job::try_from).transpose()
    }

    async fn try_claim(&self, class: QueueClass, now: DateTime<Utc>) -> Result<Option<Lease>> {
        let mut tx = self.pool.begin().await?;

        let row: Option<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM jobs
            WHERE queue = ? AND status IN ('pending', 'active')
              AND visible_at <= ? AND scheduled_at <= ?
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(class.as_str())
        .bind(now)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let token = Uuid::new_v4().to_string();
        let lease_until = now + Duration::seconds(row.timeout_secs);
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'active', lease_token = ?, visible_at = ?,
                attempts = attempts + 1, updated_at = ?
            WHERE id = ? AND visible_at <= ?
            "#,
        )
        .bind(&token)
        .bind(lease_until)
        .bind(now)
        .bind(&row.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        let mut job = Job::try_from(row)?;
        job.status = JobStatus::Active;
        job.attempts += 1;
        job.visible_at = lease_until;

        debug!(job_id = %job.id, kind = job.kind.as_str(), attempt = job.attempts, "Job claimed");
        Ok(Some(Lease { job, token }))
    }
}

#[async_trait]
impl JobQueue for SqlJobQueue {
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        opts: EnqueueOptions,
    ) -> Result<String> {
        let now = Utc::now();
        let scheduled_at = opts.scheduled_at.unwrap_or(now);
        let payload = serde_json::to_string(&payload)?;

        // De-duplication rides the partial unique index over pending/active
        // keys: a concurrent duplicate turns the insert into a no-op and the
        // holder's id is handed back instead.
        for _ in 0..3 {
            let id = Uuid::new_v4().to_string();
            let inserted: Option<(String,)> = sqlx::query_as(
                r#"
                INSERT INTO jobs
                    (id, kind, queue, payload, status, attempts, max_retry, timeout_secs,
                     backoff_base_ms, unique_key, scheduled_at, visible_at, lease_token,
                     last_error, created_at, updated_at)
                VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?)
                ON CONFLICT(unique_key)
                    WHERE unique_key IS NOT NULL AND status IN ('pending', 'active')
                    DO NOTHING
                RETURNING id
                "#,
            )
            .bind(&id)
            .bind(kind.as_str())
            .bind(opts.queue.as_str())
            .bind(&payload)
            .bind(opts.max_retry as i64)
            .bind(opts.timeout_secs as i64)
            .bind(opts.backoff_base_ms as i64)
            .bind(&opts.unique_key)
            .bind(scheduled_at)
            .bind(scheduled_at)
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            if inserted.is_some() {
                metrics::counter!("agenttrace_jobs_enqueued_total", 1, "kind" => kind.as_str());
                debug!(job_id = %id, kind = kind.as_str(), queue = opts.queue.as_str(), "Job enqueued");
                return Ok(id);
            }

            let existing: Option<(String,)> = sqlx::query_as(
                "SELECT id FROM jobs WHERE unique_key = ? AND status IN ('pending', 'active')",
            )
            .bind(&opts.unique_key)
            .fetch_optional(&self.pool)
            .await?;
            if let Some((existing_id,)) = existing {
                debug!(
                    job_id = %existing_id,
                    unique_key = opts.unique_key.as_deref(),
                    "Enqueue de-duplicated"
                );
                return Ok(existing_id);
            }
            // the holder reached a terminal state between the two
            // statements; the next insert attempt will land
        }

        Err(AgentTraceError::internal(
            "enqueue kept racing on unique_key",
        ))
    }

    async fn dequeue(&self, queues: &[QueueClass]) -> Result<Option<Lease>> {
        if queues.is_empty() {
            return Ok(None);
        }
        let now = Utc::now();
        for class in weighted_order(queues, rand::random::<f64>()) {
            if let Some(lease) = self.try_claim(class, now).await? {
                return Ok(Some(lease));
            }
        }
        Ok(None)
    }

    async fn ack(&self, lease: &Lease) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'succeeded', updated_at = ? \
             WHERE id = ? AND lease_token = ? AND status = 'active'",
        )
        .bind(Utc::now())
        .bind(&lease.job.id)
        .bind(&lease.token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Lease expired and another worker took over; their outcome wins.
            warn!(job_id = %lease.job.id, "Ack after lease expiry ignored");
        } else {
            metrics::counter!("agenttrace_jobs_succeeded_total", 1, "kind" => lease.job.kind.as_str());
        }
        Ok(())
    }

    async fn nack(&self, lease: &Lease, error: &str, permanent: bool) -> Result<()> {
        let now = Utc::now();
        let exhausted = lease.job.attempts > lease.job.max_retry;

        if permanent || exhausted {
            let result = sqlx::query(
                "UPDATE jobs SET status = 'dead_letter', last_error = ?, updated_at = ? \
                 WHERE id = ? AND lease_token = ? AND status = 'active'",
            )
            .bind(error)
            .bind(now)
            .bind(&lease.job.id)
            .bind(&lease.token)
            .execute(&self.pool)
            .await?;
            if result.rows_affected() > 0 {
                metrics::counter!("agenttrace_jobs_dead_lettered_total", 1, "kind" => lease.job.kind.as_str());
                warn!(
                    job_id = %lease.job.id,
                    kind = lease.job.kind.as_str(),
                    attempts = lease.job.attempts,
                    error,
                    "Job dead-lettered"
                );
            }
            return Ok(());
        }

        // attempts already counts the claim that just failed
        let delay = self
            .backoff
            .delay(lease.job.attempts, lease.job.backoff_base_ms);
        let visible_at = now + Duration::milliseconds(delay.as_millis() as i64);
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', visible_at = ?, last_error = ?, updated_at = ? \
             WHERE id = ? AND lease_token = ? AND status = 'active'",
        )
        .bind(visible_at)
        .bind(error)
        .bind(now)
        .bind(&lease.job.id)
        .bind(&lease.token)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            metrics::counter!("agenttrace_jobs_retried_total", 1, "kind" => lease.job.kind.as_str());
            debug!(
                job_id = %lease.job.id,
                attempt = lease.job.attempts,
                delay_ms = delay.as_millis() as u64,
                "Job rescheduled after failure"
            );
        }
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE status = 'dead_letter' ORDER BY updated_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn requeue(&self, job_id: &str) -> Result<()> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', attempts = 0, visible_at = ?, \
             lease_token = NULL, updated_at = ? \
             WHERE id = ? AND status = 'dead_letter'",
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            // a newer pending job took this unique_key in the meantime
            sqlx::Error::Database(db) if db.is_unique_violation() => AgentTraceError::Conflict(
                format!("job {job_id} unique_key is held by a pending job"),
            ),
            _ => AgentTraceError::from(e),
        })?;

        if result.rows_affected() == 0 {
            return Err(AgentTraceError::NotFound(format!(
                "dead-lettered job {job_id}"
            )));
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn due_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM jobs \
             WHERE status IN ('pending', 'active') AND scheduled_at <= ?",
        )
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
