//! In-process backend: tables of JSON rows behind one async mutex.
//!
//! A session holds the lock for its whole lifetime and works on a copy of the
//! tables, which replaces the shared state on commit. Sessions are therefore
//! serializable; a session that is dropped or rolled back leaves no trace.
//! Opening a second session while the same task still holds one never
//! completes. Request handlers end their session before post-hooks run, so
//! hooks may open their own.

use crate::coerce;
use crate::config::{EntitySchema, FieldDef, FieldKind, LinkTable, TableRef};
use crate::error::StoreError;
use crate::query::QueryPlan;
use crate::store::eval::{self, TableRows};
use crate::store::{Database, Row, Session};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Debug, Default)]
struct Tables {
    rows: TableRows,
    /// Last generated integer key per table.
    sequences: BTreeMap<TableRef, i64>,
}

/// Operation counters, for asserting what a request touched.
#[derive(Debug, Default)]
pub struct MemoryStats {
    pub sessions: AtomicU64,
    pub reads: AtomicU64,
    pub writes: AtomicU64,
}

#[derive(Clone, Default)]
pub struct MemoryDatabase {
    tables: Arc<Mutex<Tables>>,
    stats: Arc<MemoryStats>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    pub fn reads(&self) -> u64 {
        self.stats.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> u64 {
        self.stats.writes.load(Ordering::SeqCst)
    }

    /// Committed rows of `table`, in insertion order.
    pub async fn rows(&self, table: &TableRef) -> Vec<Row> {
        self.tables.lock().await.rows.get(table).cloned().unwrap_or_default()
    }

    /// Insert rows outside any request, bypassing the counters.
    pub async fn seed(&self, entity: &EntitySchema, rows: impl IntoIterator<Item = Value>) -> Result<Vec<Row>, StoreError> {
        let mut tables = self.tables.lock().await;
        rows.into_iter()
            .map(|v| match v {
                Value::Object(row) => insert_row(&mut tables, entity, &row),
                other => Err(StoreError::Data(format!("seed rows must be objects, got {}", other))),
            })
            .collect()
    }

    /// Link two seeded rows through an association table.
    pub async fn seed_link(&self, link: &LinkTable, local: Value, remote: Value) {
        let mut tables = self.tables.lock().await;
        link_rows(&mut tables, link, &local, &remote);
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn begin(&self) -> Result<Box<dyn Session>, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let working = (*guard).clone();
        self.stats.sessions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemorySession {
            guard: Some(guard),
            working,
            stats: self.stats.clone(),
        }))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub struct MemorySession {
    guard: Option<OwnedMutexGuard<Tables>>,
    working: Tables,
    stats: Arc<MemoryStats>,
}

impl MemorySession {
    fn open(&self) -> Result<(), StoreError> {
        match self.guard {
            Some(_) => Ok(()),
            None => Err(StoreError::Backend("session already closed".into())),
        }
    }

    fn read(&self) -> Result<(), StoreError> {
        self.open()?;
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write(&self) -> Result<(), StoreError> {
        self.open()?;
        self.stats.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn fetch(&mut self, plan: &QueryPlan) -> Result<Vec<Row>, StoreError> {
        self.read()?;
        let indices = eval::select_indices(&self.working.rows, plan);
        let rows = self.working.rows.get(&plan.table).map(Vec::as_slice).unwrap_or(&[]);
        Ok(indices.into_iter().map(|i| eval::project(&rows[i], &plan.columns)).collect())
    }

    async fn count(&mut self, plan: &QueryPlan) -> Result<u64, StoreError> {
        self.read()?;
        Ok(eval::select_indices(&self.working.rows, plan).len() as u64)
    }

    async fn insert(&mut self, entity: &EntitySchema, row: &Row) -> Result<Row, StoreError> {
        self.write()?;
        insert_row(&mut self.working, entity, row)
    }

    async fn update_where(&mut self, plan: &QueryPlan, values: &[(FieldDef, Value)]) -> Result<u64, StoreError> {
        self.write()?;
        let indices = eval::select_indices(&self.working.rows, plan);
        let checked = values
            .iter()
            .map(|(f, v)| Ok((f, check_value(f, v)?)))
            .collect::<Result<Vec<_>, StoreError>>()?;
        let Some(rows) = self.working.rows.get_mut(&plan.table) else {
            return Ok(0);
        };
        for &i in &indices {
            for (field, value) in &checked {
                if value.is_null() && !field.nullable {
                    return Err(not_null_violation(field));
                }
                if plan.primary_key.as_ref().map(|pk| pk.name == field.name).unwrap_or(false) {
                    let clash = rows
                        .iter()
                        .enumerate()
                        .any(|(j, r)| j != i && eval::equal(field.kind, r.get(&field.name).unwrap_or(&Value::Null), value));
                    if clash {
                        return Err(duplicate_key(&plan.table, field, value));
                    }
                }
                rows[i].insert(field.name.clone(), value.clone());
            }
        }
        Ok(indices.len() as u64)
    }

    async fn delete_where(&mut self, plan: &QueryPlan) -> Result<u64, StoreError> {
        self.write()?;
        let mut indices = eval::select_indices(&self.working.rows, plan);
        let Some(rows) = self.working.rows.get_mut(&plan.table) else {
            return Ok(0);
        };
        indices.sort_unstable();
        for &i in indices.iter().rev() {
            rows.remove(i);
        }
        Ok(indices.len() as u64)
    }

    async fn insert_link(&mut self, link: &LinkTable, local: &Value, remote: &Value) -> Result<(), StoreError> {
        self.write()?;
        link_rows(&mut self.working, link, local, remote);
        Ok(())
    }

    async fn delete_links(&mut self, link: &LinkTable, local: &Value, remote: Option<&Value>) -> Result<u64, StoreError> {
        self.write()?;
        let Some(rows) = self.working.rows.get_mut(&link.table) else {
            return Ok(0);
        };
        let before = rows.len();
        rows.retain(|r| {
            let same_local = eval::equal(link.local.kind, r.get(&link.local.name).unwrap_or(&Value::Null), local);
            let same_remote = remote
                .map(|rv| eval::equal(link.remote.kind, r.get(&link.remote.name).unwrap_or(&Value::Null), rv))
                .unwrap_or(true);
            !(same_local && same_remote)
        });
        Ok((before - rows.len()) as u64)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(mut guard) = self.guard.take() {
            *guard = std::mem::take(&mut self.working);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.guard.take();
        Ok(())
    }
}

fn not_null_violation(field: &FieldDef) -> StoreError {
    StoreError::Integrity(format!(
        "null value in column \"{}\" violates not-null constraint",
        field.name
    ))
}

fn duplicate_key(table: &TableRef, field: &FieldDef, value: &Value) -> StoreError {
    StoreError::Integrity(format!(
        "duplicate key value violates unique constraint on {}: ({})=({})",
        table, field.name, value
    ))
}

/// Value as the column would store it; mirrors the server-side text casts.
fn check_value(field: &FieldDef, value: &Value) -> Result<Value, StoreError> {
    let invalid = || StoreError::Data(format!("invalid input syntax for type {}: {}", field.sql_type, value));
    if value.is_null() {
        return Ok(Value::Null);
    }
    Ok(match field.kind {
        FieldKind::Integer => match value {
            Value::Number(n) if n.is_i64() => value.clone(),
            Value::String(s) => s.trim().parse::<i64>().map(Value::from).map_err(|_| invalid())?,
            _ => return Err(invalid()),
        },
        FieldKind::Float | FieldKind::Numeric => match value {
            Value::Number(_) => value.clone(),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(invalid)?,
            _ => return Err(invalid()),
        },
        FieldKind::Boolean => match value {
            Value::Bool(_) => value.clone(),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "1" => Value::Bool(true),
                "false" | "f" | "no" | "0" => Value::Bool(false),
                _ => return Err(invalid()),
            },
            _ => return Err(invalid()),
        },
        FieldKind::Uuid => match value {
            Value::String(s) => uuid::Uuid::parse_str(s)
                .map(|u| Value::String(u.to_string()))
                .map_err(|_| invalid())?,
            _ => return Err(invalid()),
        },
        FieldKind::Date | FieldKind::DateTime | FieldKind::Time => match value {
            Value::String(s) => coerce::normalize_temporal(field, s).map_err(StoreError::Data)?,
            _ => return Err(invalid()),
        },
        FieldKind::Text => match value {
            Value::String(_) => value.clone(),
            Value::Number(_) | Value::Bool(_) => Value::String(value.to_string()),
            _ => return Err(invalid()),
        },
        FieldKind::Json => value.clone(),
    })
}

fn insert_row(tables: &mut Tables, entity: &EntitySchema, row: &Row) -> Result<Row, StoreError> {
    let pk = entity.pk_field();
    let mut stored = Row::new();
    for field in &entity.fields {
        let value = match row.get(&field.name) {
            Some(v) => check_value(field, v)?,
            None if field.name == pk.name && field.kind == FieldKind::Integer => {
                let next = tables.sequences.get(&entity.table).copied().unwrap_or(0) + 1;
                Value::from(next)
            }
            None if field.name == pk.name && field.kind == FieldKind::Uuid => {
                Value::String(uuid::Uuid::new_v4().to_string())
            }
            None if !field.nullable && !field.has_default => return Err(not_null_violation(field)),
            None => Value::Null,
        };
        if value.is_null() && !field.nullable {
            return Err(not_null_violation(field));
        }
        stored.insert(field.name.clone(), value);
    }

    let key = stored.get(&pk.name).cloned().unwrap_or(Value::Null);
    let rows = tables.rows.entry(entity.table.clone()).or_default();
    if rows
        .iter()
        .any(|r| eval::equal(pk.kind, r.get(&pk.name).unwrap_or(&Value::Null), &key))
    {
        return Err(duplicate_key(&entity.table, pk, &key));
    }
    rows.push(stored.clone());
    if let Some(n) = key.as_i64() {
        let seq = tables.sequences.entry(entity.table.clone()).or_insert(0);
        *seq = (*seq).max(n);
    }
    Ok(stored)
}

fn link_rows(tables: &mut Tables, link: &LinkTable, local: &Value, remote: &Value) {
    let rows = tables.rows.entry(link.table.clone()).or_default();
    let exists = rows.iter().any(|r| {
        eval::equal(link.local.kind, r.get(&link.local.name).unwrap_or(&Value::Null), local)
            && eval::equal(link.remote.kind, r.get(&link.remote.name).unwrap_or(&Value::Null), remote)
    });
    if !exists {
        let mut row = Row::new();
        row.insert(link.local.name.clone(), local.clone());
        row.insert(link.remote.name.clone(), remote.clone());
        rows.push(row);
    }
}
