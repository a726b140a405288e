//! Typed gateway over the metadata schema.
//!
//! Row operations are free functions taking a `&mut PgConnection` so a
//! command can compose several of them (plus a job enqueue) inside one
//! transaction obtained from [`MetadataStore::begin`]. Errors are classified
//! at this boundary: unique violations become conflicts, missing rows stay
//! `Option::None` for the caller to name, everything else is unknown.

use crate::config::DatabaseConfig;
use crate::error::{classify_db_error, ServiceError, ServiceResult};
use crate::model::{new_id, Bucket, LockReason, ObjectRecord, ObjectWithBucketName, UploadStatus};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{PgConnection, Postgres, Transaction};
use std::time::Duration;
use tracing::info;

const BUCKET_COLS: &str = "id, version, name, allowed_mime_types, max_allowed_object_size, \
     public, disabled, locked, lock_reason, locked_at, created_at, updated_at";

const OBJECT_COLS: &str = "id, version, bucket_id, name, mime_type, size, metadata, \
     upload_status, last_accessed_at, created_at, updated_at";

/// Connection pool plus migration bootstrap for the metadata database.
pub struct MetadataStore {
    pool: PgPool,
}

impl MetadataStore {
    /// Connect a pool with the configured limits.
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Some(Duration::from_secs(config.idle_timeout_secs)))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run embedded database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        use anyhow::Context;

        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self, operation: &'static str) -> ServiceResult<Transaction<'static, Postgres>> {
        self.pool
            .begin()
            .await
            .map_err(|e| classify_db_error(operation, "transaction", e))
    }

    pub async fn acquire(
        &self,
        operation: &'static str,
    ) -> ServiceResult<sqlx::pool::PoolConnection<Postgres>> {
        self.pool
            .acquire()
            .await
            .map_err(|e| classify_db_error(operation, "connection", e))
    }

    /// Commit helper so call sites keep the same classification.
    pub async fn commit(
        tx: Transaction<'static, Postgres>,
        operation: &'static str,
    ) -> ServiceResult<()> {
        tx.commit()
            .await
            .map_err(|e| classify_db_error(operation, "transaction commit", e))
    }
}

/// Field changes applied by a bucket update. `None` leaves a field alone.
#[derive(Debug, Default)]
pub struct BucketChanges {
    pub allowed_mime_types: Option<Vec<String>>,
    pub max_allowed_object_size: Option<Option<i64>>,
    pub public: Option<bool>,
}

pub async fn bucket_create(
    conn: &mut PgConnection,
    name: &str,
    allowed_mime_types: &[String],
    max_allowed_object_size: Option<i64>,
    public: bool,
) -> ServiceResult<Bucket> {
    let query = format!(
        "INSERT INTO bucket (id, name, allowed_mime_types, max_allowed_object_size, public) \
         VALUES ($1, $2, $3, $4, $5) RETURNING {BUCKET_COLS}"
    );
    sqlx::query_as::<_, Bucket>(&query)
        .bind(new_id("bkt"))
        .bind(name)
        .bind(allowed_mime_types)
        .bind(max_allowed_object_size)
        .bind(public)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| classify_db_error("bucket.create", &format!("bucket \"{name}\""), e))
}

pub async fn bucket_get(conn: &mut PgConnection, id: &str) -> ServiceResult<Option<Bucket>> {
    let query = format!("SELECT {BUCKET_COLS} FROM bucket WHERE id = $1");
    sqlx::query_as::<_, Bucket>(&query)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| classify_db_error("bucket.get", "bucket", e))
}

/// Row-locked load, held for the rest of the enclosing transaction. This is
/// what serializes competing administrative transitions on one bucket.
pub async fn bucket_get_for_update(
    conn: &mut PgConnection,
    id: &str,
) -> ServiceResult<Option<Bucket>> {
    let query = format!("SELECT {BUCKET_COLS} FROM bucket WHERE id = $1 FOR UPDATE");
    sqlx::query_as::<_, Bucket>(&query)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| classify_db_error("bucket.get_for_update", "bucket", e))
}

pub async fn bucket_get_by_name(
    conn: &mut PgConnection,
    name: &str,
) -> ServiceResult<Option<Bucket>> {
    let query = format!("SELECT {BUCKET_COLS} FROM bucket WHERE name = $1");
    sqlx::query_as::<_, Bucket>(&query)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| classify_db_error("bucket.get_by_name", "bucket", e))
}

pub async fn bucket_update(
    conn: &mut PgConnection,
    id: &str,
    changes: &BucketChanges,
) -> ServiceResult<Option<Bucket>> {
    let query = format!(
        "UPDATE bucket SET \
             allowed_mime_types = COALESCE($2, allowed_mime_types), \
             max_allowed_object_size = CASE WHEN $3 THEN $4 ELSE max_allowed_object_size END, \
             public = COALESCE($5, public), \
             version = version + 1, updated_at = NOW() \
         WHERE id = $1 RETURNING {BUCKET_COLS}"
    );
    sqlx::query_as::<_, Bucket>(&query)
        .bind(id)
        .bind(changes.allowed_mime_types.as_deref())
        .bind(changes.max_allowed_object_size.is_some())
        .bind(changes.max_allowed_object_size.flatten())
        .bind(changes.public)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| classify_db_error("bucket.update", "bucket", e))
}

pub async fn bucket_set_disabled(
    conn: &mut PgConnection,
    id: &str,
    disabled: bool,
) -> ServiceResult<Option<Bucket>> {
    let query = format!(
        "UPDATE bucket SET disabled = $2, version = version + 1, updated_at = NOW() \
         WHERE id = $1 RETURNING {BUCKET_COLS}"
    );
    sqlx::query_as::<_, Bucket>(&query)
        .bind(id)
        .bind(disabled)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| classify_db_error("bucket.set_disabled", "bucket", e))
}

pub async fn bucket_lock(
    conn: &mut PgConnection,
    id: &str,
    reason: LockReason,
) -> ServiceResult<Option<Bucket>> {
    let query = format!(
        "UPDATE bucket SET locked = TRUE, lock_reason = $2, locked_at = NOW(), \
             version = version + 1, updated_at = NOW() \
         WHERE id = $1 RETURNING {BUCKET_COLS}"
    );
    sqlx::query_as::<_, Bucket>(&query)
        .bind(id)
        .bind(reason.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| classify_db_error("bucket.lock", "bucket", e))
}

/// Unlock only releases the lock it was asked to release. A stale retry of
/// an emptying job must not clear a deletion lock taken since.
pub async fn bucket_unlock(
    conn: &mut PgConnection,
    id: &str,
    reason: LockReason,
) -> ServiceResult<Option<Bucket>> {
    let query = format!(
        "UPDATE bucket SET locked = FALSE, lock_reason = NULL, locked_at = NULL, \
             version = version + 1, updated_at = NOW() \
         WHERE id = $1 AND lock_reason = $2 RETURNING {BUCKET_COLS}"
    );
    sqlx::query_as::<_, Bucket>(&query)
        .bind(id)
        .bind(reason.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| classify_db_error("bucket.unlock", "bucket", e))
}

/// Idempotent: deleting an already-gone bucket affects zero rows.
pub async fn bucket_delete(conn: &mut PgConnection, id: &str) -> ServiceResult<u64> {
    sqlx::query("DELETE FROM bucket WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map(|r| r.rows_affected())
        .map_err(|e| classify_db_error("bucket.delete", "bucket", e))
}

/// Aggregate size of completed objects in a bucket.
pub async fn bucket_size(conn: &mut PgConnection, id: &str) -> ServiceResult<i64> {
    // SUM over BIGINT widens to NUMERIC; cast back for the decode.
    let (size,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(size), 0)::BIGINT FROM object \
         WHERE bucket_id = $1 AND upload_status = $2",
    )
    .bind(id)
    .bind(UploadStatus::Completed.as_str())
    .fetch_one(&mut *conn)
    .await
    .map_err(|e| classify_db_error("bucket.size", "bucket size", e))?;
    Ok(size)
}

pub async fn bucket_list(conn: &mut PgConnection) -> ServiceResult<Vec<Bucket>> {
    let query = format!("SELECT {BUCKET_COLS} FROM bucket ORDER BY name");
    sqlx::query_as::<_, Bucket>(&query)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| classify_db_error("bucket.list", "buckets", e))
}

pub async fn bucket_search(conn: &mut PgConnection, name: &str) -> ServiceResult<Vec<Bucket>> {
    let query = format!("SELECT {BUCKET_COLS} FROM bucket WHERE name ILIKE $1 ORDER BY name");
    sqlx::query_as::<_, Bucket>(&query)
        .bind(format!("%{name}%"))
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| classify_db_error("bucket.search", "buckets", e))
}

pub async fn object_create(
    conn: &mut PgConnection,
    bucket_id: &str,
    name: &str,
    mime_type: &str,
    size: i64,
    metadata: serde_json::Value,
) -> ServiceResult<ObjectRecord> {
    let query = format!(
        "INSERT INTO object (id, bucket_id, name, mime_type, size, metadata, upload_status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {OBJECT_COLS}"
    );
    sqlx::query_as::<_, ObjectRecord>(&query)
        .bind(new_id("obj"))
        .bind(bucket_id)
        .bind(name)
        .bind(mime_type)
        .bind(size)
        .bind(metadata)
        .bind(UploadStatus::Pending.as_str())
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| classify_db_error("object.create", &format!("object \"{name}\""), e))
}

pub async fn object_get(
    conn: &mut PgConnection,
    id: &str,
) -> ServiceResult<Option<ObjectRecord>> {
    let query = format!("SELECT {OBJECT_COLS} FROM object WHERE id = $1");
    sqlx::query_as::<_, ObjectRecord>(&query)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| classify_db_error("object.get", "object", e))
}

pub async fn object_get_with_bucket_name(
    conn: &mut PgConnection,
    id: &str,
) -> ServiceResult<Option<ObjectWithBucketName>> {
    sqlx::query_as::<_, ObjectWithBucketName>(
        "SELECT o.id, o.bucket_id, b.name AS bucket_name, o.name, o.upload_status \
         FROM object o JOIN bucket b ON b.id = o.bucket_id WHERE o.id = $1",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(|e| classify_db_error("object.get_with_bucket", "object", e))
}

/// Status promotion is a plain write: promoting a row already in the target
/// state affects one row and changes nothing, which keeps sweeps idempotent.
pub async fn object_set_upload_status(
    conn: &mut PgConnection,
    id: &str,
    status: UploadStatus,
) -> ServiceResult<u64> {
    sqlx::query(
        "UPDATE object SET upload_status = $2, version = version + 1, updated_at = NOW() \
         WHERE id = $1",
    )
    .bind(id)
    .bind(status.as_str())
    .execute(&mut *conn)
    .await
    .map(|r| r.rows_affected())
    .map_err(|e| classify_db_error("object.set_upload_status", "object", e))
}

pub async fn object_touch_last_accessed(
    conn: &mut PgConnection,
    id: &str,
) -> ServiceResult<()> {
    sqlx::query("UPDATE object SET last_accessed_at = NOW() WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map(|_| ())
        .map_err(|e| classify_db_error("object.touch", "object", e))
}

/// Idempotent: deleting an already-gone object affects zero rows.
pub async fn object_delete(conn: &mut PgConnection, id: &str) -> ServiceResult<u64> {
    sqlx::query("DELETE FROM object WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map(|r| r.rows_affected())
        .map_err(|e| classify_db_error("object.delete", "object", e))
}

pub async fn objects_page(
    conn: &mut PgConnection,
    bucket_id: &str,
    offset: i64,
    limit: i64,
) -> ServiceResult<Vec<ObjectRecord>> {
    let query = format!(
        "SELECT {OBJECT_COLS} FROM object WHERE bucket_id = $1 ORDER BY id LIMIT $2 OFFSET $3"
    );
    sqlx::query_as::<_, ObjectRecord>(&query)
        .bind(bucket_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| classify_db_error("object.page", "objects", e))
}

pub async fn object_search(
    conn: &mut PgConnection,
    bucket_id: &str,
    path: &str,
    limit: i64,
    offset: i64,
) -> ServiceResult<Vec<ObjectRecord>> {
    let query = format!(
        "SELECT {OBJECT_COLS} FROM object WHERE bucket_id = $1 AND name LIKE $2 \
         ORDER BY name LIMIT $3 OFFSET $4"
    );
    sqlx::query_as::<_, ObjectRecord>(&query)
        .bind(bucket_id)
        .bind(format!("{path}%"))
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| classify_db_error("object.search", "objects", e))
}

/// Shorthand used by every command that must address an existing bucket.
pub fn require_bucket(
    operation: &'static str,
    bucket: Option<Bucket>,
    id: &str,
) -> ServiceResult<Bucket> {
    bucket.ok_or_else(|| ServiceError::not_found(operation, format!("bucket \"{id}\" not found")))
}

/// Shorthand used by every command that must address an existing object.
pub fn require_object(
    operation: &'static str,
    object: Option<ObjectRecord>,
    id: &str,
) -> ServiceResult<ObjectRecord> {
    object.ok_or_else(|| ServiceError::not_found(operation, format!("object \"{id}\" not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_require_bucket_names_the_missing_id() {
        let err = require_bucket("bucket.get", None, "bkt_missing").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(err.message.contains("bkt_missing"));
    }

    #[test]
    fn test_require_object_passes_through_some() {
        let err = require_object("object.get", None, "obj_missing").unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn test_bucket_changes_default_touches_nothing() {
        let changes = BucketChanges::default();
        assert!(changes.allowed_mime_types.is_none());
        assert!(changes.max_allowed_object_size.is_none());
        assert!(changes.public.is_none());
    }
}
