//! Response envelopes and helpers.

use axum::{
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;

/// Paginated collection envelope.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct Page {
    pub page: u64,
    pub objects: Vec<Value>,
    pub total_pages: u64,
    pub num_results: u64,
}

#[derive(Serialize)]
pub struct NumModified {
    pub num_modified: u64,
}

#[derive(Serialize)]
pub struct NumDeleted {
    pub num_deleted: u64,
}

/// JSON body with extra headers (hooks may add to them).
pub fn json_with_headers(status: StatusCode, body: Value, headers: HeaderMap) -> Response {
    (status, headers, Json(body)).into_response()
}

pub fn error_body(message: &str, detail: Option<Value>) -> Value {
    match detail {
        Some(detail) => serde_json::json!({ "message": message, "detail": detail }),
        None => serde_json::json!({ "message": message }),
    }
}

/// Serialize an envelope into a JSON value; envelopes contain only JSON-safe data.
pub fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}
