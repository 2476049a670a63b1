//! Durable work queue.
//!
//! The webhook acknowledges an upload as soon as its event is written to the
//! `jobs` table; a background [`Worker`] claims jobs and drives the
//! [`Pipeline`]. One row per event id, so redelivered notifications collapse
//! into the existing job.
//!
//! Job lifecycle:
//!
//! ```text
//! pending ──claim──▶ running ──complete──▶ done
//!    ▲                  │
//!    └──fail (backoff)──┤
//!                       └──fail (attempts exhausted)──▶ failed
//! ```
//!
//! Timestamps are unix seconds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tokio::sync::watch;

use crate::config::QueueConfig;
use crate::models::{EventStatus, UploadEvent};
use crate::pipeline::{Outcome, Pipeline};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "failed" => Ok(JobStatus::Failed),
            other => bail!("Unknown job status: '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub event_id: String,
    pub event: UploadEvent,
    pub status: JobStatus,
    pub attempts: i64,
    pub next_attempt_at: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Job {
    fn from_row(row: &SqliteRow) -> Result<Self> {
        let event_id: String = row.get("event_id");
        let payload: String = row.get("payload_json");
        let status: String = row.get("status");
        Ok(Self {
            event: serde_json::from_str(&payload)
                .with_context(|| format!("Malformed job payload for {}", event_id))?,
            status: JobStatus::parse(&status)?,
            attempts: row.get("attempts"),
            next_attempt_at: row.get("next_attempt_at"),
            last_error: row.get("last_error"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            event_id,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
}

const JOB_COLUMNS: &str =
    "event_id, payload_json, status, attempts, next_attempt_at, last_error, created_at, updated_at";

pub struct WorkQueue {
    pool: SqlitePool,
    max_attempts: i64,
    backoff_secs: i64,
}

impl WorkQueue {
    pub fn new(pool: SqlitePool, max_attempts: u32, backoff_secs: i64) -> Self {
        Self {
            pool,
            max_attempts: i64::from(max_attempts.max(1)),
            backoff_secs,
        }
    }

    pub fn from_config(config: &QueueConfig, pool: SqlitePool) -> Self {
        Self::new(pool, config.max_attempts, config.backoff_secs)
    }

    /// Insert a pending job. Returns `false` if the event id is already queued
    /// (in any state).
    pub async fn enqueue(&self, event: &UploadEvent) -> Result<bool> {
        let now = Utc::now().timestamp();
        let payload = serde_json::to_string(event)?;
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (event_id, payload_json, status, attempts, next_attempt_at, created_at, updated_at)
            VALUES (?, ?, 'pending', 0, ?, ?, ?)
            ON CONFLICT(event_id) DO NOTHING
            "#,
        )
        .bind(&event.event_id)
        .bind(payload)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn claim_next(&self) -> Result<Option<Job>> {
        self.claim_due(Utc::now()).await
    }

    /// Move the oldest `pending` job due at `now` to `running` in a single
    /// statement, bumping its attempt count.
    pub async fn claim_due(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let now = now.timestamp();
        let sql = format!(
            r#"
            UPDATE jobs
            SET status = 'running', attempts = attempts + 1, updated_at = ?
            WHERE event_id = (
                SELECT event_id FROM jobs
                WHERE status = 'pending' AND next_attempt_at <= ?
                ORDER BY next_attempt_at, created_at, event_id
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Job::from_row).transpose()
    }

    pub async fn complete(&self, event_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'done', last_error = NULL, updated_at = ? WHERE event_id = ?",
        )
        .bind(Utc::now().timestamp())
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt. The job goes back to `pending` after
    /// `backoff_secs * 2^(attempts - 1)` seconds, or to `failed` once
    /// `max_attempts` is reached. Returns the resulting status.
    pub async fn fail(&self, event_id: &str, error: &str) -> Result<JobStatus> {
        let now = Utc::now().timestamp();
        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = CASE WHEN attempts >= ?1 THEN 'failed' ELSE 'pending' END,
                next_attempt_at = CASE
                    WHEN attempts >= ?1 THEN ?2
                    ELSE ?2 + ?3 * (1 << MIN(MAX(attempts - 1, 0), 20))
                END,
                last_error = ?4,
                updated_at = ?2
            WHERE event_id = ?5
            RETURNING status
            "#,
        )
        .bind(self.max_attempts)
        .bind(now)
        .bind(self.backoff_secs)
        .bind(error)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        let status = status.with_context(|| format!("No job for event {}", event_id))?;
        JobStatus::parse(&status)
    }

    /// Return `running` jobs untouched for at least `older_than` to
    /// `pending`, recovering jobs abandoned by a crashed worker.
    pub async fn requeue_stale(&self, older_than: Duration) -> Result<u64> {
        let now = Utc::now().timestamp();
        let cutoff = now - older_than.as_secs() as i64;
        let result = sqlx::query(
            "UPDATE jobs SET status = 'pending', next_attempt_at = ?, updated_at = ? WHERE status = 'running' AND updated_at <= ?",
        )
        .bind(now)
        .bind(now)
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get(&self, event_id: &str) -> Result<Option<Job>> {
        let sql = format!("SELECT {} FROM jobs WHERE event_id = ?", JOB_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Job::from_row).transpose()
    }

    pub async fn counts(&self) -> Result<JobCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = JobCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match JobStatus::parse(&status)? {
                JobStatus::Pending => counts.pending = n,
                JobStatus::Running => counts.running = n,
                JobStatus::Done => counts.done = n,
                JobStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }
}

/// Background consumer of the [`WorkQueue`].
pub struct Worker {
    queue: Arc<WorkQueue>,
    pipeline: Arc<Pipeline>,
    poll_interval: Duration,
    stale_after: Duration,
}

impl Worker {
    /// A job left `running` for `stale_after` is assumed abandoned and
    /// returned to `pending`.
    pub fn new(
        queue: Arc<WorkQueue>,
        pipeline: Arc<Pipeline>,
        poll_interval: Duration,
        stale_after: Duration,
    ) -> Self {
        Self {
            queue,
            pipeline,
            poll_interval,
            stale_after,
        }
    }

    /// Process jobs until `shutdown` flips to `true` (or its sender drops).
    /// A job in flight when shutdown is requested is finished first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("queue worker started");
        self.requeue_stale().await;
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.queue.claim_next().await {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => {
                    self.requeue_stale().await;
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, "failed to claim job");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
        tracing::info!("queue worker stopped");
    }

    async fn requeue_stale(&self) {
        match self.queue.requeue_stale(self.stale_after).await {
            Ok(0) => {}
            Ok(n) => tracing::warn!(jobs = n, "requeued stale running jobs"),
            Err(e) => tracing::error!(error = ?e, "failed to requeue stale jobs"),
        }
    }

    /// Claim and process jobs until none are due. Returns how many ran.
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        while let Some(job) = self.queue.claim_next().await? {
            self.process(job).await;
            processed += 1;
        }
        Ok(processed)
    }

    async fn process(&self, job: Job) {
        let event_id = job.event_id.clone();
        tracing::info!(event_id = %event_id, attempt = job.attempts, "processing job");

        let result = match self.pipeline.handle_job(&job.event, job.attempts).await {
            // Another run still owns the event; completing now would lose it.
            Ok(Outcome::Duplicate {
                status: EventStatus::Processing,
            }) => {
                tracing::warn!(event_id = %event_id, "event is processing elsewhere, retrying later");
                self.fail(&event_id, "event is still processing under another run")
                    .await
            }
            Ok(outcome) => {
                tracing::debug!(event_id = %event_id, outcome = ?outcome, "job finished");
                self.queue.complete(&event_id).await
            }
            Err(e) => {
                tracing::error!(event_id = %event_id, error = ?e, "job failed");
                self.fail(&event_id, &format!("{:#}", e)).await
            }
        };
        if let Err(e) = result {
            tracing::error!(event_id = %event_id, error = ?e, "failed to update job state");
        }
    }

    async fn fail(&self, event_id: &str, error: &str) -> Result<()> {
        let status = self.queue.fail(event_id, error).await?;
        if status == JobStatus::Failed {
            tracing::warn!(event_id = %event_id, "job attempts exhausted");
        }
        Ok(())
    }
}
