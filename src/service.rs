//! The session coordinator: bucket lifecycle commands, upload/download
//! sessions and object commands. Every mutating command loads its bucket
//! with a row lock, passes the mutation gate, writes the new state and
//! enqueues any follow-up job inside the same transaction.

use crate::blob_store::BlobStore;
use crate::config::PresignConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::job_queue::{self, Job};
use crate::metadata_store::{
    self, require_bucket, require_object, BucketChanges, MetadataStore,
};
use crate::model::{Bucket, LockReason, ObjectRecord, UploadStatus};
use crate::validate;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Grace period in seconds between URL expiry and the reconciliation sweep,
/// so a tardy blob write is still observable.
const EXPIRY_SWEEP_GRACE_SECS: i64 = 60;

/// Page size used by object search when the caller does not pass a limit.
const DEFAULT_SEARCH_LIMIT: i64 = 100;
const MAX_SEARCH_LIMIT: i64 = 1000;

#[derive(Debug, Clone)]
pub struct CreateBucketParams {
    pub name: String,
    pub allowed_mime_types: Option<Vec<String>>,
    pub max_allowed_object_size: Option<i64>,
    pub public: bool,
}

/// Field changes for a bucket update. `max_allowed_object_size` is doubled:
/// the outer `None` leaves the limit alone, `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct UpdateBucketParams {
    pub allowed_mime_types: Option<Vec<String>>,
    pub max_allowed_object_size: Option<Option<i64>>,
    pub public: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct CreateUploadSessionParams {
    pub object_name: String,
    pub mime_type: Option<String>,
    pub size: i64,
    pub metadata: Option<serde_json::Value>,
    pub expires_in_secs: Option<u64>,
}

/// What the client gets back: a metadata reservation plus a time-bounded
/// credential for the direct upload.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub object_id: String,
    pub mime_type: String,
    pub url: String,
    pub method: &'static str,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DownloadSession {
    pub object_id: String,
    pub url: String,
    pub method: &'static str,
    pub expires_at: DateTime<Utc>,
}

pub struct StorageService {
    meta: Arc<MetadataStore>,
    blobs: Arc<BlobStore>,
    presign: PresignConfig,
}

impl StorageService {
    pub fn new(meta: Arc<MetadataStore>, blobs: Arc<BlobStore>, presign: PresignConfig) -> Self {
        Self {
            meta,
            blobs,
            presign,
        }
    }

    // ---- bucket commands ----

    #[instrument(skip(self, params), fields(bucket_name = %params.name))]
    pub async fn create_bucket(&self, params: CreateBucketParams) -> ServiceResult<Bucket> {
        const OP: &str = "bucket.create";

        validate::validate_bucket_name(&params.name)?;
        let allowed = params
            .allowed_mime_types
            .unwrap_or_else(|| vec![validate::MIME_WILDCARD.to_string()]);
        validate::validate_allowed_mime_types(&allowed)?;
        if let Some(max) = params.max_allowed_object_size {
            validate::validate_max_object_size(max)?;
        }

        let mut conn = self.meta.acquire(OP).await?;
        let bucket = metadata_store::bucket_create(
            &mut conn,
            &params.name,
            &allowed,
            params.max_allowed_object_size,
            params.public,
        )
        .await?;

        info!(bucket_id = %bucket.id, bucket_name = %bucket.name, "Bucket created");
        Ok(bucket)
    }

    #[instrument(skip(self, params))]
    pub async fn update_bucket(
        &self,
        bucket_id: &str,
        params: UpdateBucketParams,
    ) -> ServiceResult<Bucket> {
        const OP: &str = "bucket.update";

        if let Some(ref allowed) = params.allowed_mime_types {
            validate::validate_allowed_mime_types(allowed)?;
        }
        if let Some(Some(max)) = params.max_allowed_object_size {
            validate::validate_max_object_size(max)?;
        }

        let mut tx = self.meta.begin(OP).await?;
        let bucket = require_bucket(
            OP,
            metadata_store::bucket_get_for_update(&mut tx, bucket_id).await?,
            bucket_id,
        )?;
        bucket.ensure_mutable(OP)?;

        let changes = BucketChanges {
            allowed_mime_types: params.allowed_mime_types,
            max_allowed_object_size: params.max_allowed_object_size,
            public: params.public,
        };
        let updated = require_bucket(
            OP,
            metadata_store::bucket_update(&mut tx, bucket_id, &changes).await?,
            bucket_id,
        )?;
        MetadataStore::commit(tx, OP).await?;

        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn enable_bucket(&self, bucket_id: &str) -> ServiceResult<Bucket> {
        const OP: &str = "bucket.enable";

        let mut tx = self.meta.begin(OP).await?;
        let bucket = require_bucket(
            OP,
            metadata_store::bucket_get_for_update(&mut tx, bucket_id).await?,
            bucket_id,
        )?;
        if bucket.locked {
            let reason = bucket.lock_reason.as_deref().unwrap_or("unknown");
            return Err(ServiceError::forbidden(
                OP,
                format!("bucket \"{}\" is locked for {}", bucket.name, reason),
            ));
        }
        if !bucket.disabled {
            return Err(ServiceError::bad_request(
                OP,
                format!("bucket \"{}\" is already enabled", bucket.name),
            ));
        }

        let updated = require_bucket(
            OP,
            metadata_store::bucket_set_disabled(&mut tx, bucket_id, false).await?,
            bucket_id,
        )?;
        MetadataStore::commit(tx, OP).await?;

        info!(bucket_id = %bucket_id, "Bucket enabled");
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn disable_bucket(&self, bucket_id: &str) -> ServiceResult<Bucket> {
        const OP: &str = "bucket.disable";

        let mut tx = self.meta.begin(OP).await?;
        let bucket = require_bucket(
            OP,
            metadata_store::bucket_get_for_update(&mut tx, bucket_id).await?,
            bucket_id,
        )?;
        if bucket.locked {
            let reason = bucket.lock_reason.as_deref().unwrap_or("unknown");
            return Err(ServiceError::forbidden(
                OP,
                format!("bucket \"{}\" is locked for {}", bucket.name, reason),
            ));
        }
        if bucket.disabled {
            return Err(ServiceError::bad_request(
                OP,
                format!("bucket \"{}\" is already disabled", bucket.name),
            ));
        }

        let updated = require_bucket(
            OP,
            metadata_store::bucket_set_disabled(&mut tx, bucket_id, true).await?,
            bucket_id,
        )?;
        MetadataStore::commit(tx, OP).await?;

        info!(bucket_id = %bucket_id, "Bucket disabled");
        Ok(updated)
    }

    /// Lock the bucket for emptying and schedule the drain. The lock row and
    /// the job commit together.
    #[instrument(skip(self))]
    pub async fn empty_bucket(&self, bucket_id: &str) -> ServiceResult<Bucket> {
        const OP: &str = "bucket.empty";

        let mut tx = self.meta.begin(OP).await?;
        let bucket = require_bucket(
            OP,
            metadata_store::bucket_get_for_update(&mut tx, bucket_id).await?,
            bucket_id,
        )?;
        let job = plan_bucket_drain(OP, &bucket, LockReason::Emptying)?;

        let locked = require_bucket(
            OP,
            metadata_store::bucket_lock(&mut tx, bucket_id, LockReason::Emptying).await?,
            bucket_id,
        )?;
        job_queue::enqueue_tx(&mut tx, &job, None).await?;
        MetadataStore::commit(tx, OP).await?;

        info!(bucket_id = %bucket_id, "Bucket emptying scheduled");
        Ok(locked)
    }

    /// Lock the bucket for deletion and schedule the terminal drain.
    #[instrument(skip(self))]
    pub async fn delete_bucket(&self, bucket_id: &str) -> ServiceResult<()> {
        const OP: &str = "bucket.delete";

        let mut tx = self.meta.begin(OP).await?;
        let bucket = require_bucket(
            OP,
            metadata_store::bucket_get_for_update(&mut tx, bucket_id).await?,
            bucket_id,
        )?;
        let job = plan_bucket_drain(OP, &bucket, LockReason::Deletion)?;

        metadata_store::bucket_lock(&mut tx, bucket_id, LockReason::Deletion).await?;
        job_queue::enqueue_tx(&mut tx, &job, None).await?;
        MetadataStore::commit(tx, OP).await?;

        info!(bucket_id = %bucket_id, "Bucket deletion scheduled");
        Ok(())
    }

    pub async fn get_bucket(&self, bucket_id: &str) -> ServiceResult<Bucket> {
        const OP: &str = "bucket.get";
        let mut conn = self.meta.acquire(OP).await?;
        require_bucket(
            OP,
            metadata_store::bucket_get(&mut conn, bucket_id).await?,
            bucket_id,
        )
    }

    pub async fn get_bucket_size(&self, bucket_id: &str) -> ServiceResult<i64> {
        const OP: &str = "bucket.size";
        let mut conn = self.meta.acquire(OP).await?;
        require_bucket(
            OP,
            metadata_store::bucket_get(&mut conn, bucket_id).await?,
            bucket_id,
        )?;
        metadata_store::bucket_size(&mut conn, bucket_id).await
    }

    pub async fn list_buckets(&self, name_filter: Option<&str>) -> ServiceResult<Vec<Bucket>> {
        const OP: &str = "bucket.list";
        let mut conn = self.meta.acquire(OP).await?;
        match name_filter {
            Some(name) if !name.is_empty() => metadata_store::bucket_search(&mut conn, name).await,
            _ => metadata_store::bucket_list(&mut conn).await,
        }
    }

    // ---- upload sessions ----

    /// Reserve metadata, issue the pre-signed PUT and schedule the expiry
    /// sweep, all in one transaction.
    #[instrument(skip(self, params), fields(object_name = %params.object_name))]
    pub async fn create_upload_session(
        &self,
        bucket_id: &str,
        params: CreateUploadSessionParams,
    ) -> ServiceResult<UploadSession> {
        const OP: &str = "upload.session.create";

        validate::validate_object_name(&params.object_name)?;
        if params.size < 0 {
            return Err(ServiceError::invalid_input(
                OP,
                format!("object size must not be negative, got {}", params.size),
            ));
        }

        let mut tx = self.meta.begin(OP).await?;
        let bucket = require_bucket(
            OP,
            metadata_store::bucket_get_for_update(&mut tx, bucket_id).await?,
            bucket_id,
        )?;
        bucket.ensure_mutable(OP)?;

        let mime_type =
            resolve_mime_type(OP, &bucket, params.mime_type.as_deref(), &params.object_name)?;
        validate::check_admission(OP, &bucket, &mime_type, params.size)?;

        let object = metadata_store::object_create(
            &mut tx,
            bucket_id,
            &params.object_name,
            &mime_type,
            params.size,
            params.metadata.unwrap_or_else(|| serde_json::json!({})),
        )
        .await?;

        let expires_in = Duration::from_secs(
            params
                .expires_in_secs
                .unwrap_or(self.presign.upload_expiry_secs),
        );
        let presigned = self
            .blobs
            .presign_upload(
                &bucket.name,
                &params.object_name,
                expires_in,
                &mime_type,
                params.size,
            )
            .await?;

        job_queue::enqueue_tx(
            &mut tx,
            &Job::UploadSessionExpiry {
                object_id: object.id.clone(),
            },
            Some(presigned.expires_at + chrono::Duration::seconds(EXPIRY_SWEEP_GRACE_SECS)),
        )
        .await?;
        MetadataStore::commit(tx, OP).await?;

        metrics::counter!("coffer.upload_sessions.created").increment(1);
        info!(
            bucket_id = %bucket_id,
            object_id = %object.id,
            mime_type = %mime_type,
            "Upload session created"
        );

        Ok(UploadSession {
            object_id: object.id,
            mime_type,
            url: presigned.url,
            method: presigned.method,
            expires_at: presigned.expires_at,
        })
    }

    /// Reconcile an explicit completion claim against the blob store.
    /// Re-completion is rejected; a missing blob stays pending.
    #[instrument(skip(self))]
    pub async fn complete_upload_session(
        &self,
        bucket_id: &str,
        object_id: &str,
    ) -> ServiceResult<ObjectRecord> {
        const OP: &str = "upload.session.complete";

        let mut tx = self.meta.begin(OP).await?;
        let bucket = require_bucket(
            OP,
            metadata_store::bucket_get_for_update(&mut tx, bucket_id).await?,
            bucket_id,
        )?;
        bucket.ensure_mutable(OP)?;

        let object = require_object(
            OP,
            metadata_store::object_get(&mut tx, object_id).await?,
            object_id,
        )?;
        if object.bucket_id != bucket.id {
            return Err(ServiceError::not_found(
                OP,
                format!("object \"{object_id}\" not found"),
            ));
        }
        let blob_exists = !object.is_completed()
            && self.blobs.object_exists(&bucket.name, &object.name).await?;
        match completion_outcome(object.is_completed(), blob_exists) {
            CompletionOutcome::AlreadyCompleted => {
                return Err(ServiceError::bad_request(
                    OP,
                    format!("object \"{}\" upload is already completed", object.name),
                ));
            }
            CompletionOutcome::MissingBlob => {
                return Err(ServiceError::bad_request(
                    OP,
                    format!("object \"{}\" has not been uploaded yet", object.name),
                ));
            }
            CompletionOutcome::Promote => {
                metadata_store::object_set_upload_status(
                    &mut tx,
                    object_id,
                    UploadStatus::Completed,
                )
                .await?;
            }
        }
        MetadataStore::commit(tx, OP).await?;

        metrics::counter!("coffer.upload_sessions.completed").increment(1);
        info!(bucket_id = %bucket_id, object_id = %object_id, "Upload session completed");

        let mut conn = self.meta.acquire(OP).await?;
        require_object(
            OP,
            metadata_store::object_get(&mut conn, object_id).await?,
            object_id,
        )
    }

    // ---- download sessions ----

    /// A pending object found in the blob store is promoted on the way; one
    /// that is genuinely absent stays pending and reads as not-found.
    #[instrument(skip(self))]
    pub async fn create_download_session(
        &self,
        bucket_id: &str,
        object_id: &str,
        expires_in_secs: Option<u64>,
    ) -> ServiceResult<DownloadSession> {
        const OP: &str = "download.session.create";

        let mut tx = self.meta.begin(OP).await?;
        let bucket = require_bucket(
            OP,
            metadata_store::bucket_get_for_update(&mut tx, bucket_id).await?,
            bucket_id,
        )?;
        bucket.ensure_mutable(OP)?;

        let object = require_object(
            OP,
            metadata_store::object_get(&mut tx, object_id).await?,
            object_id,
        )?;
        if object.bucket_id != bucket.id {
            return Err(ServiceError::not_found(
                OP,
                format!("object \"{object_id}\" not found"),
            ));
        }

        if object.is_pending() {
            if self.blobs.object_exists(&bucket.name, &object.name).await? {
                metadata_store::object_set_upload_status(
                    &mut tx,
                    object_id,
                    UploadStatus::Completed,
                )
                .await?;
                warn!(object_id = %object_id, "Promoted pending object on download");
            } else {
                return Err(ServiceError::not_found(
                    OP,
                    format!("object \"{}\" upload has not been completed", object.name),
                ));
            }
        }

        let expires_in = Duration::from_secs(
            expires_in_secs.unwrap_or(self.presign.download_expiry_secs),
        );
        let presigned = self
            .blobs
            .presign_download(&bucket.name, &object.name, expires_in)
            .await?;
        metadata_store::object_touch_last_accessed(&mut tx, object_id).await?;
        MetadataStore::commit(tx, OP).await?;

        Ok(DownloadSession {
            object_id: object.id,
            url: presigned.url,
            method: presigned.method,
            expires_at: presigned.expires_at,
        })
    }

    // ---- object commands ----

    /// Schedule asynchronous deletion of a completed object.
    #[instrument(skip(self))]
    pub async fn delete_object(&self, bucket_id: &str, object_id: &str) -> ServiceResult<()> {
        const OP: &str = "object.delete";

        let mut tx = self.meta.begin(OP).await?;
        let bucket = require_bucket(
            OP,
            metadata_store::bucket_get_for_update(&mut tx, bucket_id).await?,
            bucket_id,
        )?;
        bucket.ensure_mutable(OP)?;

        let object = require_object(
            OP,
            metadata_store::object_get(&mut tx, object_id).await?,
            object_id,
        )?;
        if object.bucket_id != bucket.id {
            return Err(ServiceError::not_found(
                OP,
                format!("object \"{object_id}\" not found"),
            ));
        }
        if object.is_pending() {
            return Err(ServiceError::bad_request(
                OP,
                format!(
                    "object \"{}\" upload is still pending and cannot be deleted",
                    object.name
                ),
            ));
        }

        job_queue::enqueue_tx(
            &mut tx,
            &Job::ObjectDeletion {
                object_id: object_id.to_string(),
            },
            None,
        )
        .await?;
        MetadataStore::commit(tx, OP).await?;

        info!(bucket_id = %bucket_id, object_id = %object_id, "Object deletion scheduled");
        Ok(())
    }

    pub async fn get_object(&self, bucket_id: &str, object_id: &str) -> ServiceResult<ObjectRecord> {
        const OP: &str = "object.get";

        let mut conn = self.meta.acquire(OP).await?;
        let object = require_object(
            OP,
            metadata_store::object_get(&mut conn, object_id).await?,
            object_id,
        )?;
        if object.bucket_id != bucket_id {
            return Err(ServiceError::not_found(
                OP,
                format!("object \"{object_id}\" not found"),
            ));
        }
        Ok(object)
    }

    pub async fn search_objects(
        &self,
        bucket_id: &str,
        object_path: &str,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> ServiceResult<Vec<ObjectRecord>> {
        const OP: &str = "object.search";

        let limit = limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, MAX_SEARCH_LIMIT);
        let offset = offset.unwrap_or(0).max(0);

        let mut conn = self.meta.acquire(OP).await?;
        require_bucket(
            OP,
            metadata_store::bucket_get(&mut conn, bucket_id).await?,
            bucket_id,
        )?;
        metadata_store::object_search(&mut conn, bucket_id, object_path, limit, offset).await
    }

    // ---- startup ----

    /// Best-effort idempotent creation of the configured default buckets.
    pub async fn bootstrap_default_buckets(&self, names: &[String]) -> ServiceResult<()> {
        const OP: &str = "bucket.bootstrap";

        for name in names {
            let mut conn = self.meta.acquire(OP).await?;
            if metadata_store::bucket_get_by_name(&mut conn, name).await?.is_some() {
                continue;
            }
            drop(conn);

            match self
                .create_bucket(CreateBucketParams {
                    name: name.clone(),
                    allowed_mime_types: None,
                    max_allowed_object_size: None,
                    public: false,
                })
                .await
            {
                Ok(bucket) => info!(bucket_name = %bucket.name, "Created default bucket"),
                Err(e) if e.kind == crate::error::ErrorKind::Conflict => {}
                Err(e) => warn!(bucket_name = %name, error = %e, "Failed to create default bucket"),
            }
        }
        Ok(())
    }
}

/// Decide whether a bucket may enter the drain lock for `reason`, and which
/// job to pair with the lock. A bucket already locked for the same reason is
/// a redundant request; any other non-active state fails the mutation gate.
fn plan_bucket_drain(
    operation: &'static str,
    bucket: &Bucket,
    reason: LockReason,
) -> ServiceResult<Job> {
    if bucket.lock_reason() == Some(reason) {
        let verb = match reason {
            LockReason::Emptying => "emptied",
            LockReason::Deletion => "deleted",
        };
        return Err(ServiceError::bad_request(
            operation,
            format!("bucket \"{}\" is already being {}", bucket.name, verb),
        ));
    }
    bucket.ensure_mutable(operation)?;

    Ok(match reason {
        LockReason::Emptying => Job::BucketEmptying {
            bucket_id: bucket.id.clone(),
        },
        LockReason::Deletion => Job::BucketDeletion {
            bucket_id: bucket.id.clone(),
        },
    })
}

/// What an explicit completion claim does, given the object's recorded state
/// and whether the blob actually landed. Re-completion is rejected and a
/// missing blob leaves the row pending; only a verified blob promotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionOutcome {
    Promote,
    AlreadyCompleted,
    MissingBlob,
}

fn completion_outcome(is_completed: bool, blob_exists: bool) -> CompletionOutcome {
    if is_completed {
        CompletionOutcome::AlreadyCompleted
    } else if blob_exists {
        CompletionOutcome::Promote
    } else {
        CompletionOutcome::MissingBlob
    }
}

/// Resolve the MIME type recorded for a new upload. Buckets that admit
/// everything let the caller omit it, in which case we infer from the
/// object name's extension and fall back to `application/octet-stream`.
pub fn resolve_mime_type(
    operation: &'static str,
    bucket: &Bucket,
    requested: Option<&str>,
    object_name: &str,
) -> ServiceResult<String> {
    if let Some(mime) = requested {
        validate::validate_mime_type(mime)?;
        return Ok(mime.to_string());
    }

    if bucket.allows_any_mime() {
        return Ok(infer_mime_type(object_name)
            .unwrap_or("application/octet-stream")
            .to_string());
    }

    Err(ServiceError::invalid_input(
        operation,
        format!(
            "mime_type is required for bucket \"{}\" (allowed: {})",
            bucket.name,
            bucket.allowed_mime_types.join(", ")
        ),
    ))
}

/// Extension-based inference over the trailing path component.
pub fn infer_mime_type(object_name: &str) -> Option<&'static str> {
    let file_name = object_name.rsplit('/').next()?;
    let ext = file_name.rsplit_once('.')?.1;

    let mime = match ext.to_ascii_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "svg" => "image/svg+xml",
        "txt" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        _ => return None,
    };
    Some(mime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::test_bucket;

    fn locked_bucket(name: &str, reason: LockReason) -> Bucket {
        let mut bucket = test_bucket(name);
        bucket.locked = true;
        bucket.lock_reason = Some(reason.as_str().to_string());
        bucket.locked_at = Some(Utc::now());
        bucket
    }

    #[test]
    fn test_drain_plan_pairs_lock_with_matching_job() {
        let bucket = test_bucket("avatar");

        let job = plan_bucket_drain("bucket.empty", &bucket, LockReason::Emptying).unwrap();
        assert_eq!(
            job,
            Job::BucketEmptying {
                bucket_id: bucket.id.clone()
            }
        );

        let job = plan_bucket_drain("bucket.delete", &bucket, LockReason::Deletion).unwrap();
        assert_eq!(
            job,
            Job::BucketDeletion {
                bucket_id: bucket.id.clone()
            }
        );
    }

    #[test]
    fn test_drain_plan_rejects_redundant_lock_as_bad_request() {
        let bucket = locked_bucket("avatar", LockReason::Emptying);
        let err = plan_bucket_drain("bucket.empty", &bucket, LockReason::Emptying).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
        assert!(err.message.contains("already being emptied"));

        let bucket = locked_bucket("avatar", LockReason::Deletion);
        let err = plan_bucket_drain("bucket.delete", &bucket, LockReason::Deletion).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
        assert!(err.message.contains("already being deleted"));
    }

    #[test]
    fn test_drain_plan_forbids_cross_lock_and_disabled() {
        // Deleting a bucket that is being emptied hits the gate, not the
        // redundancy check.
        let bucket = locked_bucket("avatar", LockReason::Emptying);
        let err = plan_bucket_drain("bucket.delete", &bucket, LockReason::Deletion).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
        assert!(err.message.contains("locked for bucket.emptying"));

        let mut bucket = test_bucket("logs");
        bucket.disabled = true;
        let err = plan_bucket_drain("bucket.empty", &bucket, LockReason::Emptying).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
    }

    #[test]
    fn test_completion_promotes_only_verified_pending_upload() {
        assert_eq!(completion_outcome(false, true), CompletionOutcome::Promote);
        assert_eq!(
            completion_outcome(false, false),
            CompletionOutcome::MissingBlob
        );
    }

    #[test]
    fn test_second_completion_is_rejected() {
        // Once completed, a repeat claim is rejected whatever the blob store
        // says; the row stays completed.
        assert_eq!(
            completion_outcome(true, true),
            CompletionOutcome::AlreadyCompleted
        );
        assert_eq!(
            completion_outcome(true, false),
            CompletionOutcome::AlreadyCompleted
        );
    }

    #[test]
    fn test_infer_mime_type_from_extension() {
        assert_eq!(infer_mime_type("notes.txt"), Some("text/plain"));
        assert_eq!(infer_mime_type("u/1/a.jpg"), Some("image/jpeg"));
        assert_eq!(infer_mime_type("archive.tar.GZ"), Some("application/gzip"));
        assert_eq!(infer_mime_type("no-extension"), None);
        assert_eq!(infer_mime_type("dir.with.dots/plain"), None);
    }

    #[test]
    fn test_resolve_prefers_caller_mime() {
        let bucket = test_bucket("inbox");
        let mime = resolve_mime_type("upload.session.create", &bucket, Some("image/png"), "a.jpg")
            .unwrap();
        assert_eq!(mime, "image/png");
    }

    #[test]
    fn test_resolve_infers_under_wildcard() {
        let bucket = test_bucket("inbox");
        let mime =
            resolve_mime_type("upload.session.create", &bucket, None, "notes.txt").unwrap();
        assert_eq!(mime, "text/plain");

        let fallback =
            resolve_mime_type("upload.session.create", &bucket, None, "blob").unwrap();
        assert_eq!(fallback, "application/octet-stream");
    }

    #[test]
    fn test_resolve_requires_mime_for_restricted_bucket() {
        let mut bucket = test_bucket("avatar");
        bucket.allowed_mime_types = vec!["image/jpeg".to_string()];

        let err =
            resolve_mime_type("upload.session.create", &bucket, None, "a.jpg").unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert!(err.message.contains("image/jpeg"));
    }

    #[test]
    fn test_resolve_rejects_malformed_caller_mime() {
        let bucket = test_bucket("inbox");
        let err = resolve_mime_type("upload.session.create", &bucket, Some("not-a-mime"), "a")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidInput);
    }
}
