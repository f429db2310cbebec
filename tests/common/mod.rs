//! Shared fixtures: a small people/pets/tags model served from the in-memory backend.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use restgen::config::EntitySchema;
use restgen::{parse_model, resolve, ApiManager, ApiSettings, MemoryDatabase, SchemaRegistry};
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

pub const MODEL: &str = r#"{
  "entities": [
    {"name": "person", "fields": [
        {"name": "id", "type": "int8", "nullable": false, "has_default": true},
        {"name": "name", "type": "text", "nullable": false},
        {"name": "age", "type": "int4"},
        {"name": "birthday", "type": "date"},
        {"name": "employer_id", "type": "int8"}
     ], "relations": [
        {"name": "pets", "target": "pet", "cardinality": "to_many",
         "join": {"kind": "foreign", "column": "owner_id"}},
        {"name": "tags", "target": "tag", "cardinality": "to_many",
         "join": {"kind": "link", "table": "person_tag", "local_column": "person_id", "remote_column": "tag_id"}},
        {"name": "employer", "target": "company", "cardinality": "to_one",
         "join": {"kind": "owned", "column": "employer_id"}}
     ]},
    {"name": "pet", "fields": [
        {"name": "id", "type": "int8", "nullable": false, "has_default": true},
        {"name": "name", "type": "text"},
        {"name": "owner_id", "type": "int8"}
    ]},
    {"name": "tag", "fields": [
        {"name": "id", "type": "int8", "nullable": false, "has_default": true},
        {"name": "label", "type": "text"}
    ]},
    {"name": "company", "fields": [
        {"name": "id", "type": "int8", "nullable": false, "has_default": true},
        {"name": "name", "type": "text"}
    ]}
  ]
}"#;

pub fn registry() -> SchemaRegistry {
    resolve(&parse_model(MODEL).unwrap()).unwrap()
}

pub struct TestApp {
    pub db: MemoryDatabase,
    pub registry: SchemaRegistry,
    pub router: Router,
}

impl TestApp {
    pub fn entity(&self, name: &str) -> &EntitySchema {
        self.registry.get(name).unwrap()
    }

    pub async fn seed(&self, entity: &str, rows: Vec<Value>) {
        self.db.seed(self.entity(entity), rows).await.unwrap();
    }

    pub async fn rows(&self, entity: &str) -> Vec<serde_json::Map<String, Value>> {
        self.db.rows(&self.entity(entity).table).await
    }

    pub async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, HeaderMap, Value) {
        send(&self.router, method, uri, body).await
    }
}

/// App with the given settings and registry; `configure` registers the collections.
pub fn app_with(
    settings: ApiSettings,
    registry: SchemaRegistry,
    configure: impl FnOnce(&mut ApiManager),
) -> TestApp {
    let db = MemoryDatabase::new();
    let mut manager = ApiManager::new(settings, registry.clone(), Arc::new(db.clone()));
    configure(&mut manager);
    TestApp {
        db,
        registry,
        router: manager.router(),
    }
}

/// `people` with every method enabled.
pub fn app() -> TestApp {
    app_with(ApiSettings::default(), registry(), |m| {
        m.create_api(restgen::ResourceDecl::new("person", "people").methods(["GET", "POST", "PUT", "DELETE"]))
            .unwrap();
    })
}

pub async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(serde_json::to_vec(&v).unwrap())
        }
        None => Body::empty(),
    };
    let response = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, headers, value)
}

/// Percent-encode a search specification for the `q` parameter.
pub fn q(spec: &Value) -> String {
    spec.to_string()
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => (b as char).to_string(),
            _ => format!("%{:02X}", b),
        })
        .collect()
}

pub fn names(page: &Value) -> Vec<String> {
    page["objects"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["name"].as_str().unwrap().to_string())
        .collect()
}
