//! Durable background jobs in the metadata database.
//!
//! Enqueueing rides the caller's transaction, so a committed bucket lock and
//! its drain job become visible together and a rollback erases both. The
//! runner claims due jobs with `FOR UPDATE SKIP LOCKED`, which gives
//! at-most-once-concurrent execution per job id; delivery is at-least-once,
//! so every handler is idempotent.

use crate::config::JobsConfig;
use crate::error::{classify_db_error, ServiceResult};
use crate::model::new_id;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::{FromRow, PgConnection};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const KIND_BUCKET_DELETION: &str = "bucket.deletion";
pub const KIND_BUCKET_EMPTYING: &str = "bucket.emptying";
pub const KIND_OBJECT_DELETION: &str = "object.deletion";
pub const KIND_UPLOAD_SESSION_EXPIRY: &str = "upload.session.expiry";

/// Everything the background runtime knows how to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Job {
    #[serde(rename = "bucket.deletion")]
    BucketDeletion { bucket_id: String },
    #[serde(rename = "bucket.emptying")]
    BucketEmptying { bucket_id: String },
    #[serde(rename = "object.deletion")]
    ObjectDeletion { object_id: String },
    #[serde(rename = "upload.session.expiry")]
    UploadSessionExpiry { object_id: String },
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::BucketDeletion { .. } => KIND_BUCKET_DELETION,
            Job::BucketEmptying { .. } => KIND_BUCKET_EMPTYING,
            Job::ObjectDeletion { .. } => KIND_OBJECT_DELETION,
            Job::UploadSessionExpiry { .. } => KIND_UPLOAD_SESSION_EXPIRY,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
struct JobRow {
    id: String,
    kind: String,
    payload: serde_json::Value,
    attempts: i32,
}

/// Insert a job inside the caller's metadata transaction. Commit makes both
/// the mutation and the job visible; rollback erases both.
pub async fn enqueue_tx(
    conn: &mut PgConnection,
    job: &Job,
    scheduled_at: Option<DateTime<Utc>>,
) -> ServiceResult<String> {
    let id = new_id("job");
    let payload = serde_json::to_value(job).map_err(|e| {
        crate::error::ServiceError::unknown("job.enqueue", "failed to serialize job payload")
            .with_source(e)
    })?;

    sqlx::query(
        "INSERT INTO job (id, kind, payload, scheduled_at) \
         VALUES ($1, $2, $3, COALESCE($4, NOW()))",
    )
    .bind(&id)
    .bind(job.kind())
    .bind(payload)
    .bind(scheduled_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| classify_db_error("job.enqueue", "job", e))?;

    debug!(job_id = %id, kind = job.kind(), "Job enqueued");
    Ok(id)
}

/// Handler for exactly one job kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> &'static str;
    async fn run(&self, job: Job) -> anyhow::Result<()>;
}

/// Polling executor over the job table.
pub struct JobRunner {
    pool: PgPool,
    config: JobsConfig,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
}

impl JobRunner {
    pub fn new(pool: PgPool, config: JobsConfig) -> Self {
        Self {
            pool,
            config,
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) -> anyhow::Result<()> {
        let kind = handler.kind();
        if self.handlers.insert(kind, handler).is_some() {
            anyhow::bail!("job handler for kind {kind} registered twice");
        }
        Ok(())
    }

    /// Poll until cancelled. The in-flight batch always finishes before the
    /// loop exits; anything left `running` by a crash is requeued by the
    /// stuck sweep of a later poll.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(std::time::Duration::from_millis(
            self.config.poll_interval_ms,
        ));
        info!(
            concurrency = self.config.concurrency,
            "Job runner started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.requeue_stuck().await {
                        error!(error = %e, "Failed to requeue stuck jobs");
                    }
                    match self.claim_batch().await {
                        Ok(jobs) if !jobs.is_empty() => {
                            stream::iter(jobs)
                                .for_each_concurrent(self.config.concurrency, |row| async move {
                                    self.execute(row).await;
                                })
                                .await;
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Failed to claim jobs"),
                    }
                }
            }
        }

        info!("Job runner stopped");
    }

    async fn claim_batch(&self) -> anyhow::Result<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "UPDATE job SET status = 'running', attempts = attempts + 1, updated_at = NOW() \
             WHERE id IN ( \
                 SELECT id FROM job \
                 WHERE status = 'queued' AND scheduled_at <= NOW() \
                 ORDER BY scheduled_at \
                 LIMIT $1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id, kind, payload, attempts",
        )
        .bind(self.config.concurrency as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn execute(&self, row: JobRow) {
        let job: Job = match serde_json::from_value(row.payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                error!(job_id = %row.id, kind = %row.kind, error = %e, "Unparseable job payload, parking as dead");
                self.park_dead(&row.id).await;
                return;
            }
        };

        let Some(handler) = self.handlers.get(row.kind.as_str()) else {
            error!(job_id = %row.id, kind = %row.kind, "No handler registered, parking as dead");
            self.park_dead(&row.id).await;
            return;
        };

        match handler.run(job).await {
            Ok(()) => {
                metrics::counter!("coffer.jobs.executed").increment(1);
                if let Err(e) = self.finish(&row.id).await {
                    error!(job_id = %row.id, error = %e, "Failed to finish job");
                }
            }
            Err(e) => {
                metrics::counter!("coffer.jobs.failed").increment(1);
                match retry_decision(
                    row.attempts,
                    self.config.max_attempts,
                    self.config.backoff_cap_secs,
                ) {
                    RetryDecision::Park => {
                        error!(job_id = %row.id, kind = %row.kind, attempts = row.attempts, error = %e, "Job exhausted retries, parking as dead");
                        self.park_dead(&row.id).await;
                    }
                    RetryDecision::Retry { delay_secs } => {
                        warn!(job_id = %row.id, kind = %row.kind, attempts = row.attempts, retry_in_secs = delay_secs, error = %e, "Job failed, will retry");
                        if let Err(e) = self.reschedule(&row.id, delay_secs).await {
                            error!(job_id = %row.id, error = %e, "Failed to reschedule job, stuck sweep will requeue it");
                        }
                    }
                }
            }
        }
    }

    /// A failed park leaves the row `running`; the stuck sweep requeues it
    /// and each requeue bumps `attempts`, so the next pass parks it again.
    async fn park_dead(&self, id: &str) {
        if let Err(e) = self.mark_dead(id).await {
            error!(job_id = %id, error = %e, "Failed to park job as dead");
        }
    }

    async fn finish(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM job WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reschedule(&self, id: &str, delay_secs: u64) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE job SET status = 'queued', \
                 scheduled_at = NOW() + make_interval(secs => $2), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(delay_secs as f64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_dead(&self, id: &str) -> anyhow::Result<()> {
        sqlx::query("UPDATE job SET status = 'dead', updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Jobs left `running` by a crashed runner become claimable again.
    async fn requeue_stuck(&self) -> anyhow::Result<()> {
        let requeued = sqlx::query(
            "UPDATE job SET status = 'queued', updated_at = NOW() \
             WHERE status = 'running' AND updated_at < NOW() - make_interval(secs => $1)",
        )
        .bind(self.config.stuck_after_secs as f64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if requeued > 0 {
            warn!(requeued, "Requeued stuck jobs");
        }
        Ok(())
    }
}

/// Exponential backoff in seconds, capped.
fn retry_backoff(attempts: i32, cap_secs: u64) -> u64 {
    let exp = attempts.clamp(0, 32) as u32;
    2u64.saturating_pow(exp).min(cap_secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryDecision {
    Retry { delay_secs: u64 },
    Park,
}

/// Retry with backoff until the attempts budget runs out, then park.
fn retry_decision(attempts: i32, max_attempts: i32, cap_secs: u64) -> RetryDecision {
    if attempts >= max_attempts {
        RetryDecision::Park
    } else {
        RetryDecision::Retry {
            delay_secs: retry_backoff(attempts, cap_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_kinds_are_stable() {
        assert_eq!(
            Job::BucketDeletion { bucket_id: "b".into() }.kind(),
            "bucket.deletion"
        );
        assert_eq!(
            Job::BucketEmptying { bucket_id: "b".into() }.kind(),
            "bucket.emptying"
        );
        assert_eq!(
            Job::ObjectDeletion { object_id: "o".into() }.kind(),
            "object.deletion"
        );
        assert_eq!(
            Job::UploadSessionExpiry { object_id: "o".into() }.kind(),
            "upload.session.expiry"
        );
    }

    #[test]
    fn test_payload_kind_tag_matches_kind_column() {
        let job = Job::UploadSessionExpiry {
            object_id: "obj_1".into(),
        };
        let payload = serde_json::to_value(&job).unwrap();
        assert_eq!(payload["kind"], job.kind());
        assert_eq!(payload["object_id"], "obj_1");

        let back: Job = serde_json::from_value(payload).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_retry_backoff_grows_and_caps() {
        assert_eq!(retry_backoff(1, 300), 2);
        assert_eq!(retry_backoff(3, 300), 8);
        assert_eq!(retry_backoff(10, 300), 300);
        assert_eq!(retry_backoff(40, 300), 300);
    }

    #[test]
    fn test_retry_decision_parks_after_budget() {
        assert_eq!(
            retry_decision(1, 25, 300),
            RetryDecision::Retry { delay_secs: 2 }
        );
        assert_eq!(retry_decision(24, 25, 300), RetryDecision::Retry { delay_secs: 300 });
        assert_eq!(retry_decision(25, 25, 300), RetryDecision::Park);
        assert_eq!(retry_decision(100, 25, 300), RetryDecision::Park);
    }
}
