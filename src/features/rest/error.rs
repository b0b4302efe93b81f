use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

/// REST-surface error carrying the wire envelope
/// `{"error": {"code", "message", "details?"}}`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn unauthenticated() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Unauthenticated", "Authentication required")
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN, "Forbidden", "Insufficient privileges")
    }

    pub fn invalid_token() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "InvalidToken", "Invalid or revoked token")
    }

    pub fn token_expired() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "TokenExpired", "Token has expired")
    }

    pub fn rate_limited() -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RateLimited",
            "Too many requests, retry later",
        )
    }

    /// Internal tables answer identically to genuinely absent ones so
    /// their existence is not probeable.
    pub fn table_not_found(table: &str) -> Self {
        Self::new(
            StatusCode::NOT_FOUND,
            "TableNotFound",
            format!("Table '{}' not found", table),
        )
    }

    pub fn column_unknown(column: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "ColumnUnknown",
            format!("Column '{}' does not exist", column),
        )
    }

    pub fn type_mismatch(column: &str, expected: &str, got: &str) -> Self {
        let mut err = Self::new(
            StatusCode::BAD_REQUEST,
            "TypeMismatch",
            format!("Invalid value for column '{}'", column),
        );
        err.details = Some(json!({
            "column": column,
            "expected": expected,
            "got": got,
        }));
        err
    }

    pub fn filter_syntax(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "FilterSyntax", message)
    }

    pub fn select_syntax(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "SelectSyntax", message)
    }

    pub fn unknown_operator(op: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "UnknownOperator",
            format!("Unknown filter operator '{}'", op),
        )
    }

    pub fn rls_violation() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "RLSViolation",
            "Row violates row-level security policy",
        )
    }

    pub fn single_row_expected(returned: usize) -> Self {
        Self::new(
            StatusCode::NOT_ACCEPTABLE,
            "SingleRowExpected",
            format!("Expected a single row, got {}", returned),
        )
    }

    pub fn unique_violation() -> Self {
        Self::new(StatusCode::CONFLICT, "UniqueViolation", "Unique constraint violated")
    }

    pub fn foreign_key_violation() -> Self {
        Self::new(
            StatusCode::CONFLICT,
            "ForeignKeyViolation",
            "Foreign key constraint violated",
        )
    }

    pub fn not_null_violation() -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "NotNullViolation",
            "Not-null constraint violated",
        )
    }

    pub fn migration_failed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "MigrationFailed", message)
    }

    /// Unknown storage errors: details go to logs, never to the client.
    pub fn storage(err: &sqlx::Error) -> Self {
        tracing::error!(error = %err, "Storage error");
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "StorageError",
            "Internal storage error",
        )
    }

    /// Translate a storage-engine failure into the taxonomy; constraint
    /// errors get their specific codes, the rest become StorageError.
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            let msg = db.message();
            if msg.contains("UNIQUE constraint failed") {
                return Self::unique_violation();
            }
            if msg.contains("FOREIGN KEY constraint failed") {
                return Self::foreign_key_violation();
            }
            if msg.contains("NOT NULL constraint failed") {
                return Self::not_null_violation();
            }
            if msg.contains("has no column named") || msg.contains("no such column") {
                return Self::new(
                    StatusCode::BAD_REQUEST,
                    "ColumnUnknown",
                    "Unknown column in request",
                );
            }
        }
        Self::storage(&err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = self.details {
            error["details"] = details;
        }
        (self.status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        Self::from_sqlx(err)
    }
}

impl From<crate::features::rls::RlsError> for ApiError {
    fn from(err: crate::features::rls::RlsError) -> Self {
        use crate::features::rls::RlsError;
        match err {
            RlsError::DuplicatePolicy(name) => {
                let mut e = Self::unique_violation();
                e.message = format!("Policy '{}' already exists", name);
                e
            }
            RlsError::PolicyNotFound => {
                Self::new(StatusCode::NOT_FOUND, "NotFound", "Policy not found")
            }
            RlsError::InvalidCommand(cmd) => {
                Self::filter_syntax(format!("Unknown policy command '{}'", cmd))
            }
            RlsError::Database(e) => Self::from_sqlx(e),
        }
    }
}
