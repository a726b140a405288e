//! Background workers behind the job queue: bucket drains, asynchronous
//! object deletion and the upload-session expiry sweep. Delivery is
//! at-least-once, so every step here tolerates rerunning: blob deletes of
//! missing keys succeed, row deletes of gone rows succeed, and promotion of
//! an already-completed object changes nothing.

use crate::blob_store::BlobStore;
use crate::job_queue::{
    Job, JobHandler, KIND_BUCKET_DELETION, KIND_BUCKET_EMPTYING, KIND_OBJECT_DELETION,
    KIND_UPLOAD_SESSION_EXPIRY,
};
use crate::metadata_store::{self, MetadataStore};
use crate::model::{Bucket, LockReason, UploadStatus};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Objects fetched per drain iteration.
const DRAIN_PAGE_SIZE: i64 = 100;

/// What the expiry sweep does with a pending object, given whether the blob
/// actually landed in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Promote,
    DeleteRow,
    Nothing,
}

/// The reconciliation table: pending + present promotes, pending + absent
/// garbage-collects, anything already completed is left alone.
pub fn reconcile_action(is_pending: bool, blob_exists: bool) -> ReconcileAction {
    match (is_pending, blob_exists) {
        (true, true) => ReconcileAction::Promote,
        (true, false) => ReconcileAction::DeleteRow,
        (false, _) => ReconcileAction::Nothing,
    }
}

/// A drain job only applies while the bucket still holds the lock that
/// scheduled it. Delivery is at-least-once: a stale retry may fire after the
/// first run already released the lock and the bucket has moved on, possibly
/// into a different lock.
pub fn drain_lock_held(bucket: &Bucket, reason: LockReason) -> bool {
    bucket.lock_reason() == Some(reason)
}

/// Shared state for all worker kinds.
pub struct Workers {
    meta: Arc<MetadataStore>,
    blobs: Arc<BlobStore>,
}

impl Workers {
    pub fn new(meta: Arc<MetadataStore>, blobs: Arc<BlobStore>) -> Self {
        Self { meta, blobs }
    }

    /// Delete every object of a bucket, blob first then row. Pages are
    /// always fetched at offset zero: each pass deletes what it fetched, so
    /// the remaining set shrinks monotonically and a retry after a partial
    /// failure resumes without skipping rows.
    async fn drain_bucket(&self, bucket_id: &str, bucket_name: &str) -> anyhow::Result<u64> {
        let mut drained = 0u64;
        loop {
            let mut conn = self.meta.acquire("worker.drain").await?;
            let page =
                metadata_store::objects_page(&mut conn, bucket_id, 0, DRAIN_PAGE_SIZE).await?;
            if page.is_empty() {
                break;
            }

            for object in page {
                self.blobs.object_delete(bucket_name, &object.name).await?;
                metadata_store::object_delete(&mut conn, &object.id).await?;
                drained += 1;
            }
        }

        metrics::counter!("coffer.objects.drained").increment(drained);
        Ok(drained)
    }

    /// Drain the bucket, then delete its row. A missing bucket means an
    /// earlier attempt already finished.
    #[instrument(skip(self))]
    pub async fn bucket_deletion(&self, bucket_id: &str) -> anyhow::Result<()> {
        let mut conn = self.meta.acquire("worker.bucket_deletion").await?;
        let Some(bucket) = metadata_store::bucket_get(&mut conn, bucket_id).await? else {
            return Ok(());
        };
        if !drain_lock_held(&bucket, LockReason::Deletion) {
            warn!(bucket_id = %bucket_id, "Skipping stale deletion job, bucket no longer holds the lock");
            return Ok(());
        }
        drop(conn);

        let drained = self.drain_bucket(bucket_id, &bucket.name).await?;

        let mut conn = self.meta.acquire("worker.bucket_deletion").await?;
        metadata_store::bucket_delete(&mut conn, bucket_id).await?;

        info!(bucket_id = %bucket_id, drained, "Bucket deleted");
        Ok(())
    }

    /// Drain the bucket, then unlock it back to active.
    #[instrument(skip(self))]
    pub async fn bucket_emptying(&self, bucket_id: &str) -> anyhow::Result<()> {
        let mut conn = self.meta.acquire("worker.bucket_emptying").await?;
        let Some(bucket) = metadata_store::bucket_get(&mut conn, bucket_id).await? else {
            return Ok(());
        };
        if !drain_lock_held(&bucket, LockReason::Emptying) {
            warn!(bucket_id = %bucket_id, "Skipping stale emptying job, bucket no longer holds the lock");
            return Ok(());
        }
        drop(conn);

        let drained = self.drain_bucket(bucket_id, &bucket.name).await?;

        let mut conn = self.meta.acquire("worker.bucket_emptying").await?;
        metadata_store::bucket_unlock(&mut conn, bucket_id, LockReason::Emptying).await?;

        info!(bucket_id = %bucket_id, drained, "Bucket emptied and unlocked");
        Ok(())
    }

    /// Delete one object, blob first then row. Already gone means done.
    #[instrument(skip(self))]
    pub async fn object_deletion(&self, object_id: &str) -> anyhow::Result<()> {
        let mut conn = self.meta.acquire("worker.object_deletion").await?;
        let Some(object) =
            metadata_store::object_get_with_bucket_name(&mut conn, object_id).await?
        else {
            return Ok(());
        };

        self.blobs
            .object_delete(&object.bucket_name, &object.name)
            .await?;
        metadata_store::object_delete(&mut conn, object_id).await?;

        info!(object_id = %object_id, "Object deleted");
        Ok(())
    }

    /// The expiry sweep: reconcile a session that was never explicitly
    /// completed. Running it twice lands in the same final state.
    #[instrument(skip(self))]
    pub async fn upload_session_expiry(&self, object_id: &str) -> anyhow::Result<()> {
        let mut conn = self.meta.acquire("worker.session_expiry").await?;
        let Some(object) =
            metadata_store::object_get_with_bucket_name(&mut conn, object_id).await?
        else {
            return Ok(());
        };

        let exists = self
            .blobs
            .object_exists(&object.bucket_name, &object.name)
            .await?;

        match reconcile_action(object.is_pending(), exists) {
            ReconcileAction::Promote => {
                metadata_store::object_set_upload_status(
                    &mut conn,
                    object_id,
                    UploadStatus::Completed,
                )
                .await?;
                info!(object_id = %object_id, "Expired session reconciled as completed");
            }
            ReconcileAction::DeleteRow => {
                // A write racing the sweep may land after the HEAD probe;
                // delete the key so no unreferenced blob survives the row.
                self.blobs
                    .object_delete(&object.bucket_name, &object.name)
                    .await?;
                metadata_store::object_delete(&mut conn, object_id).await?;
                warn!(object_id = %object_id, "Abandoned upload session cleaned up");
            }
            ReconcileAction::Nothing => {}
        }

        Ok(())
    }
}

pub struct BucketDeletionWorker(pub Arc<Workers>);

#[async_trait]
impl JobHandler for BucketDeletionWorker {
    fn kind(&self) -> &'static str {
        KIND_BUCKET_DELETION
    }

    async fn run(&self, job: Job) -> anyhow::Result<()> {
        match job {
            Job::BucketDeletion { bucket_id } => self.0.bucket_deletion(&bucket_id).await,
            other => anyhow::bail!("bucket deletion worker received {}", other.kind()),
        }
    }
}

pub struct BucketEmptyingWorker(pub Arc<Workers>);

#[async_trait]
impl JobHandler for BucketEmptyingWorker {
    fn kind(&self) -> &'static str {
        KIND_BUCKET_EMPTYING
    }

    async fn run(&self, job: Job) -> anyhow::Result<()> {
        match job {
            Job::BucketEmptying { bucket_id } => self.0.bucket_emptying(&bucket_id).await,
            other => anyhow::bail!("bucket emptying worker received {}", other.kind()),
        }
    }
}

pub struct ObjectDeletionWorker(pub Arc<Workers>);

#[async_trait]
impl JobHandler for ObjectDeletionWorker {
    fn kind(&self) -> &'static str {
        KIND_OBJECT_DELETION
    }

    async fn run(&self, job: Job) -> anyhow::Result<()> {
        match job {
            Job::ObjectDeletion { object_id } => self.0.object_deletion(&object_id).await,
            other => anyhow::bail!("object deletion worker received {}", other.kind()),
        }
    }
}

pub struct UploadSessionExpiryWorker(pub Arc<Workers>);

#[async_trait]
impl JobHandler for UploadSessionExpiryWorker {
    fn kind(&self) -> &'static str {
        KIND_UPLOAD_SESSION_EXPIRY
    }

    async fn run(&self, job: Job) -> anyhow::Result<()> {
        match job {
            Job::UploadSessionExpiry { object_id } => {
                self.0.upload_session_expiry(&object_id).await
            }
            other => anyhow::bail!("session expiry worker received {}", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_bucket;
    use chrono::Utc;

    fn locked_bucket(name: &str, reason: LockReason) -> Bucket {
        let mut bucket = test_bucket(name);
        bucket.locked = true;
        bucket.lock_reason = Some(reason.as_str().to_string());
        bucket.locked_at = Some(Utc::now());
        bucket
    }

    #[test]
    fn test_drain_applies_while_matching_lock_held() {
        let bucket = locked_bucket("avatar", LockReason::Emptying);
        assert!(drain_lock_held(&bucket, LockReason::Emptying));

        let bucket = locked_bucket("avatar", LockReason::Deletion);
        assert!(drain_lock_held(&bucket, LockReason::Deletion));
    }

    #[test]
    fn test_stale_emptying_retry_leaves_deletion_lock_alone() {
        // First emptying run unlocked the bucket, the user then scheduled
        // deletion. A requeued emptying job must not touch the new lock.
        let bucket = locked_bucket("avatar", LockReason::Deletion);
        assert!(!drain_lock_held(&bucket, LockReason::Emptying));
    }

    #[test]
    fn test_drain_skips_unlocked_bucket() {
        let bucket = test_bucket("avatar");
        assert!(!drain_lock_held(&bucket, LockReason::Emptying));
        assert!(!drain_lock_held(&bucket, LockReason::Deletion));
    }

    #[test]
    fn test_reconcile_table() {
        assert_eq!(reconcile_action(true, true), ReconcileAction::Promote);
        assert_eq!(reconcile_action(true, false), ReconcileAction::DeleteRow);
        assert_eq!(reconcile_action(false, true), ReconcileAction::Nothing);
        assert_eq!(reconcile_action(false, false), ReconcileAction::Nothing);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        // After a promote the object is no longer pending; after a row
        // delete the sweep sees nothing. Either way a second run is a no-op.
        assert_eq!(reconcile_action(false, true), ReconcileAction::Nothing);
        assert_eq!(reconcile_action(false, false), ReconcileAction::Nothing);
    }
}
