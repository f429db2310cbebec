//! Storage seam: a database hands out sessions, a session runs plans inside one transaction.

mod eval;
pub mod memory;
pub mod postgres;

pub use memory::MemoryDatabase;
pub use postgres::PgDatabase;

use crate::config::{EntitySchema, FieldDef, FieldKind, LinkTable};
use crate::error::StoreError;
use crate::query::QueryPlan;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// One row keyed by column name.
pub type Row = Map<String, Value>;

/// Key equality as the backends apply it: numbers by value, uuids case-insensitively,
/// text exactly. NULL never matches.
pub fn keys_equal(kind: FieldKind, a: &Value, b: &Value) -> bool {
    eval::equal(kind, a, b)
}

#[async_trait]
pub trait Database: Send + Sync {
    /// Open a session with its own transaction.
    async fn begin(&self) -> Result<Box<dyn Session>, StoreError>;

    /// Cheap liveness probe for readiness checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Per-request unit of work. Dropping a session without `commit` discards its changes.
#[async_trait]
pub trait Session: Send {
    async fn fetch(&mut self, plan: &QueryPlan) -> Result<Vec<Row>, StoreError>;

    async fn count(&mut self, plan: &QueryPlan) -> Result<u64, StoreError>;

    /// Insert one row and return it as stored (defaults and generated keys filled in).
    async fn insert(&mut self, entity: &EntitySchema, row: &Row) -> Result<Row, StoreError>;

    async fn update_where(&mut self, plan: &QueryPlan, values: &[(FieldDef, Value)]) -> Result<u64, StoreError>;

    async fn delete_where(&mut self, plan: &QueryPlan) -> Result<u64, StoreError>;

    /// Link two rows through an association table; linking twice is a no-op.
    async fn insert_link(&mut self, link: &LinkTable, local: &Value, remote: &Value) -> Result<(), StoreError>;

    /// Remove the links of `local` (only the one to `remote` when given).
    async fn delete_links(&mut self, link: &LinkTable, local: &Value, remote: Option<&Value>) -> Result<u64, StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}
