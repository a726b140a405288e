//! Row types for the metadata schema plus the small state-machine helpers
//! that gate mutations on a bucket.

use crate::error::{ServiceError, ServiceResult};
use crate::validate::MIME_WILDCARD;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

/// Why a bucket is currently locked against mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    Deletion,
    Emptying,
}

impl LockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            LockReason::Deletion => "bucket.deletion",
            LockReason::Emptying => "bucket.emptying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "bucket.deletion" => Some(LockReason::Deletion),
            "bucket.emptying" => Some(LockReason::Emptying),
            _ => None,
        }
    }
}

/// Upload state of an object row. `failed` existed historically; the expiry
/// sweep deletes abandoned rows instead, so nothing writes it anymore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    Pending,
    Completed,
}

impl UploadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Completed => "completed",
        }
    }
}

/// A named namespace owning objects and an admission policy.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Bucket {
    pub id: String,
    pub version: i64,
    pub name: String,
    pub allowed_mime_types: Vec<String>,
    pub max_allowed_object_size: Option<i64>,
    pub public: bool,
    pub disabled: bool,
    pub locked: bool,
    pub lock_reason: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bucket {
    pub fn allows_any_mime(&self) -> bool {
        self.allowed_mime_types.len() == 1 && self.allowed_mime_types[0] == MIME_WILDCARD
    }

    pub fn lock_reason(&self) -> Option<LockReason> {
        self.lock_reason.as_deref().and_then(LockReason::parse)
    }

    /// The mutation gate: every mutating command and every session creation
    /// must pass through here after loading the bucket with a row lock.
    pub fn ensure_mutable(&self, operation: &'static str) -> ServiceResult<()> {
        if self.disabled {
            return Err(ServiceError::forbidden(
                operation,
                format!("bucket \"{}\" is disabled", self.name),
            ));
        }
        if self.locked {
            let reason = self.lock_reason.as_deref().unwrap_or("unknown");
            return Err(ServiceError::forbidden(
                operation,
                format!("bucket \"{}\" is locked for {}", self.name, reason),
            ));
        }
        Ok(())
    }
}

/// One stored blob plus its metadata row.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ObjectRecord {
    pub id: String,
    pub version: i64,
    pub bucket_id: String,
    pub name: String,
    pub mime_type: String,
    pub size: i64,
    pub metadata: serde_json::Value,
    pub upload_status: String,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ObjectRecord {
    pub fn is_pending(&self) -> bool {
        self.upload_status == UploadStatus::Pending.as_str()
    }

    pub fn is_completed(&self) -> bool {
        self.upload_status == UploadStatus::Completed.as_str()
    }
}

/// Object row joined with the owning bucket's name, which the blob store
/// needs to derive the key.
#[derive(Debug, Clone, FromRow)]
pub struct ObjectWithBucketName {
    pub id: String,
    pub bucket_id: String,
    pub bucket_name: String,
    pub name: String,
    pub upload_status: String,
}

impl ObjectWithBucketName {
    pub fn is_pending(&self) -> bool {
        self.upload_status == UploadStatus::Pending.as_str()
    }
}

/// Fresh sortable opaque id with a type prefix (`bkt_`, `obj_`, `job_`).
pub fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", ulid::Ulid::new())
}

#[cfg(test)]
pub(crate) fn test_bucket(name: &str) -> Bucket {
    Bucket {
        id: new_id("bkt"),
        version: 1,
        name: name.to_string(),
        allowed_mime_types: vec![MIME_WILDCARD.to_string()],
        max_allowed_object_size: None,
        public: false,
        disabled: false,
        locked: false,
        lock_reason: None,
        locked_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_lock_reason_round_trip() {
        assert_eq!(LockReason::parse("bucket.deletion"), Some(LockReason::Deletion));
        assert_eq!(LockReason::parse("bucket.emptying"), Some(LockReason::Emptying));
        assert_eq!(LockReason::parse("bucket.archival"), None);
        assert_eq!(LockReason::Deletion.as_str(), "bucket.deletion");
    }

    #[test]
    fn test_mutation_gate_rejects_disabled_bucket() {
        let mut bucket = test_bucket("logs");
        bucket.disabled = true;

        let err = bucket.ensure_mutable("bucket.update").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
        assert!(err.message.contains("disabled"));
    }

    #[test]
    fn test_mutation_gate_rejects_locked_bucket_with_reason() {
        let mut bucket = test_bucket("logs");
        bucket.locked = true;
        bucket.lock_reason = Some(LockReason::Emptying.as_str().to_string());
        bucket.locked_at = Some(Utc::now());

        let err = bucket.ensure_mutable("bucket.delete").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
        assert!(err.message.contains("locked for bucket.emptying"));
    }

    #[test]
    fn test_mutation_gate_passes_active_bucket() {
        assert!(test_bucket("logs").ensure_mutable("bucket.update").is_ok());
    }

    #[test]
    fn test_wildcard_detection() {
        let mut bucket = test_bucket("inbox");
        assert!(bucket.allows_any_mime());

        bucket.allowed_mime_types = vec!["image/jpeg".to_string()];
        assert!(!bucket.allows_any_mime());
    }

    #[test]
    fn test_new_id_is_prefixed_and_unique() {
        let a = new_id("obj");
        let b = new_id("obj");
        assert!(a.starts_with("obj_"));
        assert_ne!(a, b);
    }
}
