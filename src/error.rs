use axum::http::StatusCode;
use std::fmt;

/// Classification of every service-level failure.
///
/// The kind is the only thing the HTTP layer needs to pick a status code;
/// everything else on [`ServiceError`] is message material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidInput,
    BadRequest,
    Forbidden,
    Unauthorized,
    Unknown,
}

impl ErrorKind {
    /// Total mapping from error kind to HTTP status.
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InvalidInput => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorKind::BadRequest => StatusCode::BAD_REQUEST,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Error carried through every command and gateway of the service.
///
/// `operation` labels the command or query that failed so log lines stay
/// greppable. The wrapped cause is logged, never rendered to clients.
#[derive(Debug, thiserror::Error)]
pub struct ServiceError {
    pub kind: ErrorKind,
    pub operation: &'static str,
    pub message: String,
    pub request_id: Option<String>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]: {}", self.operation, self.kind.as_str(), self.message)
    }
}

impl ServiceError {
    pub fn new(kind: ErrorKind, operation: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation,
            message: message.into(),
            request_id: None,
            source: None,
        }
    }

    pub fn not_found(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, operation, message)
    }

    pub fn conflict(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, operation, message)
    }

    pub fn invalid_input(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidInput, operation, message)
    }

    pub fn bad_request(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, operation, message)
    }

    pub fn forbidden(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, operation, message)
    }

    pub fn unauthorized(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, operation, message)
    }

    pub fn unknown(operation: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, operation, message)
    }

    pub fn with_source(
        mut self,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Classify a database error the way the metadata gateway promises:
/// unique violation is a conflict, a missing row is not-found, anything
/// else surfaces as unknown with the cause attached.
pub fn classify_db_error(
    operation: &'static str,
    what: &str,
    err: sqlx::Error,
) -> ServiceError {
    match &err {
        sqlx::Error::RowNotFound => {
            ServiceError::not_found(operation, format!("{what} not found"))
        }
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            ServiceError::conflict(operation, format!("{what} already exists"))
        }
        _ => ServiceError::unknown(operation, format!("database error while handling {what}"))
            .with_source(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_is_total() {
        assert_eq!(ErrorKind::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorKind::Conflict.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::InvalidInput.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(ErrorKind::BadRequest.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorKind::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::Unknown.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_row_not_found_classifies_as_not_found() {
        let err = classify_db_error("bucket.get", "bucket", sqlx::Error::RowNotFound);
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(err.message.contains("bucket"));
    }

    #[test]
    fn test_display_includes_operation_and_kind() {
        let err = ServiceError::forbidden("bucket.update", "bucket \"logs\" is disabled");
        let rendered = err.to_string();
        assert!(rendered.contains("bucket.update"));
        assert!(rendered.contains("forbidden"));
        assert!(rendered.contains("disabled"));
    }
}
