//! Static policy validation: identifiers, MIME patterns, size bounds and
//! admission of an upload against a bucket's policy. Pure functions, no I/O.

use crate::error::{ServiceError, ServiceResult};
use crate::model::Bucket;

/// Wildcard entry that admits every MIME type.
pub const MIME_WILDCARD: &str = "*/*";

const OPERATION: &str = "validate";

/// Bucket names follow the S3 rules: 3..=63 characters, lowercase
/// alphanumerics with `.` and `-` in the interior, alphanumeric at both ends.
pub fn validate_bucket_name(name: &str) -> ServiceResult<()> {
    let len = name.len();
    if !(3..=63).contains(&len) {
        return Err(ServiceError::invalid_input(
            OPERATION,
            format!("bucket name \"{name}\" must be between 3 and 63 characters"),
        ));
    }

    let bytes = name.as_bytes();
    let edge_ok = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[len - 1]) {
        return Err(ServiceError::invalid_input(
            OPERATION,
            format!("bucket name \"{name}\" must start and end with a lowercase letter or digit"),
        ));
    }

    if !bytes
        .iter()
        .all(|&b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-')
    {
        return Err(ServiceError::invalid_input(
            OPERATION,
            format!("bucket name \"{name}\" may only contain lowercase letters, digits, '.' and '-'"),
        ));
    }

    Ok(())
}

/// Object names are path-like: internal `/` separators are fine, but the
/// name must not start or end with one and must not carry control whitespace.
pub fn validate_object_name(name: &str) -> ServiceResult<()> {
    let len = name.len();
    if !(1..=961).contains(&len) {
        return Err(ServiceError::invalid_input(
            OPERATION,
            format!("object name must be between 1 and 961 characters, got {len}"),
        ));
    }

    if name.starts_with('/') || name.ends_with('/') {
        return Err(ServiceError::invalid_input(
            OPERATION,
            format!("object name \"{name}\" must not start or end with '/'"),
        ));
    }

    if name.contains(['\t', '\r', '\n']) {
        return Err(ServiceError::invalid_input(
            OPERATION,
            format!("object name \"{}\" must not contain tab or newline characters", name.escape_default()),
        ));
    }

    Ok(())
}

/// A MIME type is `type/subtype` where the type is alphabetic and the
/// subtype allows alphanumerics plus `.`, `+` and `-`.
pub fn validate_mime_type(mime: &str) -> ServiceResult<()> {
    let valid = match mime.split_once('/') {
        Some((ty, subty)) => {
            !ty.is_empty()
                && ty.bytes().all(|b| b.is_ascii_alphabetic())
                && !subty.is_empty()
                && subty
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'+' || b == b'-')
        }
        None => false,
    };

    if !valid {
        return Err(ServiceError::invalid_input(
            OPERATION,
            format!("\"{mime}\" is not a valid MIME type"),
        ));
    }

    Ok(())
}

/// The allowed set must be non-empty, every entry must be a valid MIME type
/// or the wildcard, and the wildcard only appears alone.
pub fn validate_allowed_mime_types(list: &[String]) -> ServiceResult<()> {
    if list.is_empty() {
        return Err(ServiceError::invalid_input(
            OPERATION,
            "allowed MIME types must not be empty",
        ));
    }

    if list.len() > 1 && list.iter().any(|m| m == MIME_WILDCARD) {
        return Err(ServiceError::invalid_input(
            OPERATION,
            format!("\"{MIME_WILDCARD}\" must be the only entry when present"),
        ));
    }

    for mime in list {
        if mime != MIME_WILDCARD {
            validate_mime_type(mime)?;
        }
    }

    Ok(())
}

pub fn validate_max_object_size(size: i64) -> ServiceResult<()> {
    if size <= 0 {
        return Err(ServiceError::invalid_input(
            OPERATION,
            format!("maximum object size must be positive, got {size}"),
        ));
    }
    Ok(())
}

/// Check a concrete upload against the bucket's policy. MIME membership is
/// rejected as bad-request so the caller can distinguish a policy denial
/// from a malformed request.
pub fn check_admission(
    operation: &'static str,
    bucket: &Bucket,
    mime_type: &str,
    size: i64,
) -> ServiceResult<()> {
    if !bucket.allows_any_mime() && !bucket.allowed_mime_types.iter().any(|m| m == mime_type) {
        return Err(ServiceError::bad_request(
            operation,
            format!(
                "MIME type \"{}\" is not allowed in bucket \"{}\" (allowed: {})",
                mime_type,
                bucket.name,
                bucket.allowed_mime_types.join(", ")
            ),
        ));
    }

    if let Some(max) = bucket.max_allowed_object_size {
        if size > max {
            return Err(ServiceError::bad_request(
                operation,
                format!(
                    "object size {} exceeds the maximum of {} bytes for bucket \"{}\"",
                    size, max, bucket.name
                ),
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::model::test_bucket;

    #[test]
    fn test_bucket_name_accepts_valid_names() {
        for name in ["avatar", "my-bucket.logs", "a1b", "0-0-0", &"a".repeat(63)] {
            assert!(validate_bucket_name(name).is_ok(), "rejected {name}");
        }
    }

    #[test]
    fn test_bucket_name_rejects_invalid_names() {
        for name in [
            "ab",                 // too short
            &"a".repeat(64),      // too long
            "-bucket",            // bad leading char
            "bucket-",            // bad trailing char
            "Bucket",             // uppercase
            "my_bucket",          // underscore
            "my bucket",          // space
        ] {
            let err = validate_bucket_name(name).unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidInput, "accepted {name}");
        }
    }

    #[test]
    fn test_object_name_allows_internal_separators() {
        assert!(validate_object_name("u/1/a.jpg").is_ok());
        assert!(validate_object_name("a").is_ok());
        assert!(validate_object_name(&"x".repeat(961)).is_ok());
    }

    #[test]
    fn test_object_name_rejects_edges_and_whitespace() {
        for name in ["/leading", "trailing/", "tab\there", "line\nbreak", "cr\rhere", ""] {
            assert!(validate_object_name(name).is_err(), "accepted {name:?}");
        }
        assert!(validate_object_name(&"x".repeat(962)).is_err());
    }

    #[test]
    fn test_mime_type_validation() {
        assert!(validate_mime_type("image/jpeg").is_ok());
        assert!(validate_mime_type("application/vnd.api+json").is_ok());
        assert!(validate_mime_type("text/x-rust").is_ok());

        assert!(validate_mime_type("image").is_err());
        assert!(validate_mime_type("image/").is_err());
        assert!(validate_mime_type("/jpeg").is_err());
        assert!(validate_mime_type("ima ge/jpeg").is_err());
        assert!(validate_mime_type("*/*").is_err());
    }

    #[test]
    fn test_allowed_mime_types_wildcard_only_alone() {
        assert!(validate_allowed_mime_types(&["*/*".to_string()]).is_ok());
        assert!(validate_allowed_mime_types(&[
            "image/jpeg".to_string(),
            "image/png".to_string()
        ])
        .is_ok());

        assert!(validate_allowed_mime_types(&[]).is_err());
        assert!(validate_allowed_mime_types(&[
            "*/*".to_string(),
            "image/png".to_string()
        ])
        .is_err());
    }

    #[test]
    fn test_max_object_size_must_be_positive() {
        assert!(validate_max_object_size(1).is_ok());
        assert!(validate_max_object_size(0).is_err());
        assert!(validate_max_object_size(-5).is_err());
    }

    #[test]
    fn test_admission_rejects_mime_outside_policy() {
        let mut bucket = test_bucket("avatar");
        bucket.allowed_mime_types = vec!["image/jpeg".to_string()];

        let err = check_admission("upload.session.create", &bucket, "image/png", 100).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
        assert!(err.message.contains("image/jpeg"));

        assert!(check_admission("upload.session.create", &bucket, "image/jpeg", 100).is_ok());
    }

    #[test]
    fn test_admission_enforces_size_bound() {
        let mut bucket = test_bucket("avatar");
        bucket.allowed_mime_types = vec!["image/jpeg".to_string()];
        bucket.max_allowed_object_size = Some(1_048_576);

        assert!(check_admission("upload.session.create", &bucket, "image/jpeg", 100_000).is_ok());
        let err =
            check_admission("upload.session.create", &bucket, "image/jpeg", 2_000_000).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadRequest);
    }

    #[test]
    fn test_admission_wildcard_accepts_anything() {
        let bucket = test_bucket("inbox");
        assert!(check_admission("upload.session.create", &bucket, "video/mp4", 1).is_ok());
        assert!(
            check_admission("upload.session.create", &bucket, "application/octet-stream", 1)
                .is_ok()
        );
    }
}
