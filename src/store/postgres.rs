//! PostgreSQL sessions over an sqlx pool; one transaction per session.

use crate::config::{EntitySchema, FieldDef, LinkTable};
use crate::error::StoreError;
use crate::query::QueryPlan;
use crate::sql::{self, PgBindValue, QueryBuf};
use crate::store::{Database, Row, Session};
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        PgDatabase { pool }
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(PgDatabase { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn begin(&self) -> Result<Box<dyn Session>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession { tx: Some(tx) }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

pub struct PgSession {
    /// Taken on commit or rollback.
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.tx
            .as_deref_mut()
            .ok_or_else(|| StoreError::Backend("session already closed".into()))
    }

    async fn query_many(&mut self, q: &QueryBuf) -> Result<Vec<Row>, StoreError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let mut query = sqlx::query(&q.sql);
        for p in &q.params {
            query = query.bind(PgBindValue::from_json(p));
        }
        let rows = query.fetch_all(self.conn()?).await?;
        Ok(rows.iter().map(row_to_json).collect())
    }

    async fn execute(&mut self, q: &QueryBuf) -> Result<u64, StoreError> {
        tracing::debug!(sql = %q.sql, params = ?q.params, "query");
        let mut query = sqlx::query(&q.sql);
        for p in &q.params {
            query = query.bind(PgBindValue::from_json(p));
        }
        Ok(query.execute(self.conn()?).await?.rows_affected())
    }
}

#[async_trait]
impl Session for PgSession {
    async fn fetch(&mut self, plan: &QueryPlan) -> Result<Vec<Row>, StoreError> {
        self.query_many(&sql::select(plan)).await
    }

    async fn count(&mut self, plan: &QueryPlan) -> Result<u64, StoreError> {
        let rows = self.query_many(&sql::count(plan)).await?;
        Ok(rows
            .first()
            .and_then(|r| r.get("count"))
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    async fn insert(&mut self, entity: &EntitySchema, row: &Row) -> Result<Row, StoreError> {
        let q = sql::insert(&entity.table, &entity.fields, row);
        self.query_many(&q)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Backend(format!("insert into {} returned no row", entity.table)))
    }

    async fn update_where(&mut self, plan: &QueryPlan, values: &[(FieldDef, Value)]) -> Result<u64, StoreError> {
        if values.is_empty() {
            return Ok(0);
        }
        self.execute(&sql::update(plan, values)).await
    }

    async fn delete_where(&mut self, plan: &QueryPlan) -> Result<u64, StoreError> {
        self.execute(&sql::delete(plan)).await
    }

    async fn insert_link(&mut self, link: &LinkTable, local: &Value, remote: &Value) -> Result<(), StoreError> {
        self.execute(&sql::insert_link(link, local, remote)).await?;
        Ok(())
    }

    async fn delete_links(&mut self, link: &LinkTable, local: &Value, remote: Option<&Value>) -> Result<u64, StoreError> {
        self.execute(&sql::delete_links(link, local, remote)).await
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

fn row_to_json(row: &PgRow) -> Row {
    use sqlx::{Column, Row as _};
    let mut map = Row::new();
    for col in row.columns() {
        let name = col.name();
        map.insert(name.to_string(), cell_to_value(row, name));
    }
    map
}

fn cell_to_value(row: &PgRow, name: &str) -> Value {
    use sqlx::Row as _;
    if let Ok(Some(n)) = row.try_get::<Option<i16>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i32>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<i64>, _>(name) {
        return Value::Number(n.into());
    }
    if let Ok(Some(n)) = row.try_get::<Option<f32>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n as f64) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(n)) = row.try_get::<Option<f64>, _>(name) {
        if let Some(n) = serde_json::Number::from_f64(n) {
            return Value::Number(n);
        }
    }
    if let Ok(Some(b)) = row.try_get::<Option<bool>, _>(name) {
        return Value::Bool(b);
    }
    if let Ok(Some(u)) = row.try_get::<Option<uuid::Uuid>, _>(name) {
        return Value::String(u.to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(name) {
        return Value::String(d.to_rfc3339_opts(SecondsFormat::AutoSi, true));
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDateTime>, _>(name) {
        return Value::String(d.format("%Y-%m-%dT%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(d)) = row.try_get::<Option<chrono::NaiveDate>, _>(name) {
        return Value::String(d.format("%Y-%m-%d").to_string());
    }
    if let Ok(Some(t)) = row.try_get::<Option<chrono::NaiveTime>, _>(name) {
        return Value::String(t.format("%H:%M:%S%.f").to_string());
    }
    if let Ok(Some(s)) = row.try_get::<Option<String>, _>(name) {
        return Value::String(s);
    }
    if let Ok(Some(j)) = row.try_get::<Option<serde_json::Value>, _>(name) {
        return j;
    }
    Value::Null
}
