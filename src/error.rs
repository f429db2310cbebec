//! Typed errors and HTTP mapping.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Status used for every rejected request when `legacy_error_status` is on.
pub const LEGACY_STATUS: u16 = 520;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("invalid primary key: entity {entity} column {column}")]
    InvalidPrimaryKey { entity: String, column: String },
    #[error("entity {entity}: '{name}' is declared as both a field and a relation")]
    NameClash { entity: String, name: String },
    #[error("entity {entity}: relation '{relation}' has a join that does not fit its cardinality")]
    InvalidJoin { entity: String, relation: String },
    #[error("unknown field type '{0}'")]
    UnknownFieldType(String),
    #[error("cannot simultaneously specify both include columns and exclude columns")]
    IncludeAndExclude,
    #[error("collection '{0}' is already registered")]
    DuplicateCollection(String),
    #[error("config load: {0}")]
    Load(String),
    #[error("validation: {0}")]
    Validation(String),
}

/// Failures while turning a search specification into a query plan.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("malformed filter: {0}")]
    MalformedFilter(String),
    #[error("malformed search parameters: {0}")]
    MalformedSearch(String),
    #[error("unknown operator '{0}'")]
    UnknownOperator(String),
    #[error("operator '{operator}': {reason}")]
    InvalidOperatorArgument { operator: String, reason: String },
    #[error("the field '{0}' is invalid")]
    InvalidField(String),
    #[error("the order_by direction '{0}' is invalid")]
    InvalidDirection(String),
}

/// Storage-layer failures. Violations keep the type name reported to clients.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IntegrityError: {0}")]
    Integrity(String),
    #[error("DataError: {0}")]
    Data(String),
    #[error("ProgrammingError: {0}")]
    Programming(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    /// Name of the violation class, as surfaced in error bodies.
    pub fn type_name(&self) -> &'static str {
        match self {
            StoreError::Integrity(_) => "IntegrityError",
            StoreError::Data(_) => "DataError",
            StoreError::Programming(_) => "ProgrammingError",
            StoreError::Backend(_) => "BackendError",
        }
    }

    pub fn is_violation(&self) -> bool {
        !matches!(self, StoreError::Backend(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        let class = match &e {
            sqlx::Error::Database(db) => db.code().map(|c| c.chars().take(2).collect::<String>()),
            _ => None,
        };
        match class.as_deref() {
            Some("23") => StoreError::Integrity(e.to_string()),
            Some("22") => StoreError::Data(e.to_string()),
            Some("42") => StoreError::Programming(e.to_string()),
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

/// A hook's explicit refusal to let a phase continue.
#[derive(Debug, Clone)]
pub struct ProcessingError {
    pub status: StatusCode,
    /// Sent as JSON when it is an object, as plain text otherwise.
    pub message: Value,
}

impl ProcessingError {
    pub fn new(message: impl Into<String>) -> Self {
        ProcessingError {
            status: StatusCode::BAD_REQUEST,
            message: Value::String(message.into()),
        }
    }

    pub fn with_status(status: StatusCode, message: Value) -> Self {
        ProcessingError { status, message }
    }
}

impl std::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Value::String(s) => write!(f, "{} ({})", s, self.status),
            other => write!(f, "{} ({})", other, self.status),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    MalformedRequest(String),
    #[error("Request must have \"Content-Type: application/json\" header")]
    UnsupportedMediaType,
    #[error("{0}")]
    NotFound(String),
    #[error("multiple results found: {0}")]
    MultipleMatches(String),
    #[error("validation failed")]
    Validation(Map<String, Value>),
    #[error("processing aborted: {0}")]
    Processing(ProcessingError),
}

impl AppError {
    pub fn not_found() -> Self {
        AppError::NotFound("No result found".into())
    }

    /// Single-field validation failure.
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        let mut errors = Map::new();
        errors.insert(field.to_string(), Value::String(message.into()));
        AppError::Validation(errors)
    }

    /// Conventional status for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Query(_) => StatusCode::BAD_REQUEST,
            AppError::Store(StoreError::Integrity(_)) => StatusCode::CONFLICT,
            AppError::Store(StoreError::Data(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Store(StoreError::Programming(_)) => StatusCode::BAD_REQUEST,
            AppError::Store(StoreError::Backend(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            AppError::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::MultipleMatches(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Processing(p) => p.status,
        }
    }

    /// Status with the uniform 520 applied to every domain rejection. Vetoes keep their own status.
    pub fn legacy_status(&self) -> StatusCode {
        match self {
            AppError::Processing(p) => p.status,
            AppError::Store(StoreError::Backend(_)) | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::from_u16(LEGACY_STATUS).unwrap_or(StatusCode::BAD_REQUEST),
        }
    }

    /// Render with either conventional or legacy status codes.
    pub fn to_response(&self, legacy: bool) -> Response {
        let status = if legacy { self.legacy_status() } else { self.status() };
        match self {
            AppError::Processing(p) => match &p.message {
                Value::Object(_) => (status, Json(p.message.clone())).into_response(),
                Value::String(s) => (status, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], s.clone()).into_response(),
                other => (status, [(header::CONTENT_TYPE, "text/plain; charset=utf-8")], other.to_string()).into_response(),
            },
            AppError::Validation(errors) => {
                (status, Json(json!({ "validation_errors": errors }))).into_response()
            }
            AppError::Store(e) if e.is_violation() => {
                tracing::debug!(error = %e, "storage violation");
                (status, Json(crate::response::error_body(e.type_name(), Some(Value::String(e.to_string()))))).into_response()
            }
            AppError::Store(e) => {
                tracing::error!(error = %e, "storage failure");
                (status, Json(crate::response::error_body("Database error", None))).into_response()
            }
            AppError::Config(e) => {
                tracing::error!(error = %e, "configuration failure at request time");
                (status, Json(crate::response::error_body("Configuration error", None))).into_response()
            }
            other => (status, Json(crate::response::error_body(&other.to_string(), None))).into_response(),
        }
    }
}

impl From<ProcessingError> for AppError {
    fn from(e: ProcessingError) -> Self {
        AppError::Processing(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        self.to_response(false)
    }
}
