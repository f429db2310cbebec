//! Request metadata passed to the controller and to hooks.

use crate::error::AppError;
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, OriginalUri, Query},
    http::{request::Parts, HeaderMap, Method, Uri},
};
use std::collections::HashMap;

/// Method, full URI, headers and decoded query string of a request.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    pub method: Method,
    /// URI as received, before any router nesting stripped a prefix.
    pub uri: Uri,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
}

impl RequestInfo {
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// True when the Content-Type header names JSON.
    pub fn is_json(&self) -> bool {
        self.headers
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_start().starts_with("application/json"))
            .unwrap_or(false)
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestInfo
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let uri = parts
            .extensions
            .get::<OriginalUri>()
            .map(|OriginalUri(u)| u.clone())
            .unwrap_or_else(|| parts.uri.clone());
        let Query(query) = Query::<HashMap<String, String>>::try_from_uri(&uri)
            .map_err(|e| AppError::MalformedRequest(format!("unable to decode query string: {}", e)))?;
        Ok(RequestInfo {
            method: parts.method.clone(),
            uri,
            headers: parts.headers.clone(),
            query,
        })
    }
}
