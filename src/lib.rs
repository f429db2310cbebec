//! Restgen: declarative REST collections over relational entities.
//!
//! A JSON model declares entities, fields and relations; each registered
//! resource gets list/search, create, update, delete and relation routes with
//! pre/post hooks around every phase.

pub mod coerce;
pub mod config;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod hooks;
pub mod projection;
pub mod query;
pub mod response;
pub mod routes;
pub mod service;
pub mod sql;
pub mod store;

pub use config::{load_from_path, parse_model, resolve, ApiSettings, ModelConfig, ResourceDecl, SchemaRegistry};
pub use error::{AppError, ConfigError, ProcessingError, QueryError, StoreError};
pub use hooks::{Hook, HookContext, HookOutcome, Hooks, Phase, Stage};
pub use projection::{ProjectionRules, Record, Serializer};
pub use query::SearchParams;
pub use routes::{common_routes, ApiManager, ResourceSpec};
pub use service::{DefaultDeserializer, Deserializer};
pub use store::{Database, MemoryDatabase, PgDatabase, Session};
