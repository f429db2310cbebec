//! Relation mutation: `add`/`remove`/`set` against to-one and to-many relations,
//! and get-or-create for nested relation payloads.

use crate::coerce;
use crate::config::{EntitySchema, FieldDef, Join, RelationDef, SchemaRegistry};
use crate::error::AppError;
use crate::query::{CompareOp, Operand, Predicate, QueryPlan};
use crate::store::{Row, Session};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;

const DELETE_FLAG: &str = "__delete__";

type RowFuture<'a> = Pin<Box<dyn Future<Output = Result<Row, AppError>> + Send + 'a>>;

/// Scalar part of a payload plus its relation entries. Unknown keys are rejected.
pub(crate) fn split_payload<'e>(
    entity: &'e EntitySchema,
    data: &Map<String, Value>,
) -> Result<(Row, Vec<(&'e RelationDef, Value)>), AppError> {
    let mut scalars = Row::new();
    let mut relations = Vec::new();
    for (key, value) in data {
        if entity.field(key).is_some() {
            scalars.insert(key.clone(), value.clone());
        } else if let Some(relation) = entity.relation(key) {
            relations.push((relation, value.clone()));
        } else {
            return Err(AppError::invalid(key, format!("Model does not have field '{}'", key)));
        }
    }
    coerce::strings_to_dates(entity, &mut scalars)?;
    Ok((scalars, relations))
}

fn key_of(row: &Row, field: &FieldDef) -> Value {
    row.get(&field.name).cloned().unwrap_or(Value::Null)
}

fn eq(field: &FieldDef, value: Value) -> Predicate {
    if value.is_null() {
        return Predicate::Null {
            field: field.clone(),
            negated: false,
        };
    }
    Predicate::Compare {
        field: field.clone(),
        op: CompareOp::Eq,
        operand: Operand::Value(value),
    }
}

fn target_of<'r>(registry: &'r SchemaRegistry, relation: &RelationDef) -> Result<&'r EntitySchema, AppError> {
    Ok(registry.entity(&relation.target)?)
}

/// Resolve to-one relations whose key lives on this entity into foreign-key
/// values in `scalars`. Returns the relation entries that still need the row to exist.
pub(crate) async fn resolve_owned<'e>(
    session: &mut dyn Session,
    registry: &SchemaRegistry,
    scalars: &mut Row,
    relations: Vec<(&'e RelationDef, Value)>,
) -> Result<Vec<(&'e RelationDef, Value)>, AppError> {
    let mut remaining = Vec::new();
    for (relation, value) in relations {
        let Join::Owned { column } = &relation.join else {
            remaining.push((relation, value));
            continue;
        };
        if is_add_remove(&value) {
            remaining.push((relation, value));
            continue;
        }
        let target = target_of(registry, relation)?;
        let key = match value {
            Value::Null => Value::Null,
            Value::Array(_) => return Err(AppError::invalid(&relation.name, "expects a single object")),
            other => {
                let child = get_or_create(session, registry, target, other).await?;
                key_of(&child, target.pk_field())
            }
        };
        scalars.insert(column.clone(), key);
    }
    Ok(remaining)
}

/// Find a row matching `payload` or insert it.
///
/// An object carrying the primary key is looked up by key (and updated with
/// its other fields when found). Otherwise the first row equal on every given
/// scalar is reused. A bare scalar is taken as a primary key that must exist.
pub fn get_or_create<'a>(
    session: &'a mut dyn Session,
    registry: &'a SchemaRegistry,
    entity: &'a EntitySchema,
    payload: Value,
) -> RowFuture<'a> {
    Box::pin(async move {
        let pk = entity.pk_field();
        let data = match payload {
            Value::Object(map) => map,
            Value::Array(_) | Value::Null => {
                return Err(AppError::invalid(&entity.name, "expects an object or a key"));
            }
            key => {
                let key = coerce::parse_instance_id(pk, &key_text(&key))?;
                return session
                    .fetch(&QueryPlan::by_key(entity, pk, key.clone()))
                    .await?
                    .into_iter()
                    .next()
                    .ok_or_else(|| AppError::invalid(&entity.name, format!("no {} with {} {}", entity.name, pk.name, key)));
            }
        };

        let (mut scalars, relations) = split_payload(entity, &data)?;
        let relations = resolve_owned(&mut *session, registry, &mut scalars, relations).await?;

        let key = scalars.get(&pk.name).cloned().filter(|v| !v.is_null());
        let existing = match &key {
            Some(key) => {
                let plan = QueryPlan::by_key(entity, pk, key.clone());
                let found = session.fetch(&plan).await?.into_iter().next();
                if found.is_some() {
                    let changes: Vec<(FieldDef, Value)> = scalars
                        .iter()
                        .filter(|(name, _)| **name != pk.name)
                        .filter_map(|(name, v)| entity.field(name).map(|f| (f.clone(), v.clone())))
                        .collect();
                    if !changes.is_empty() {
                        session.update_where(&plan, &changes).await?;
                        session.fetch(&plan).await?.into_iter().next()
                    } else {
                        found
                    }
                } else {
                    None
                }
            }
            None if scalars.is_empty() => None,
            None => {
                let mut plan = QueryPlan::scan(entity);
                for (name, value) in &scalars {
                    if let Some(field) = entity.field(name) {
                        plan = plan.filter(eq(field, value.clone()));
                    }
                }
                plan.limit = Some(1);
                session.fetch(&plan).await?.into_iter().next()
            }
        };

        let row = match existing {
            Some(row) => row,
            None => {
                tracing::debug!(entity = %entity.name, "get_or_create inserting");
                session.insert(entity, &scalars).await?
            }
        };

        let parents = [row];
        for (relation, value) in relations {
            apply_one(&mut *session, registry, entity, relation, &parents, value).await?;
        }
        let [row] = parents;
        Ok(row)
    })
}

fn key_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_add_remove(value: &Value) -> bool {
    matches!(value, Value::Object(m) if m.contains_key("add") || m.contains_key("remove"))
}

/// Apply every relation entry of `data` to each of `parents`.
/// Returns the names of the relations touched.
pub async fn apply_relations(
    session: &mut dyn Session,
    registry: &SchemaRegistry,
    entity: &EntitySchema,
    parents: &[Row],
    data: &Map<String, Value>,
) -> Result<BTreeSet<String>, AppError> {
    let mut touched = BTreeSet::new();
    for (name, value) in data {
        let Some(relation) = entity.relation(name) else { continue };
        apply_one(&mut *session, registry, entity, relation, parents, value.clone()).await?;
        touched.insert(name.clone());
    }
    Ok(touched)
}

async fn apply_one(
    session: &mut dyn Session,
    registry: &SchemaRegistry,
    entity: &EntitySchema,
    relation: &RelationDef,
    parents: &[Row],
    value: Value,
) -> Result<(), AppError> {
    if is_add_remove(&value) {
        let Value::Object(mut ops) = value else { return Ok(()) };
        if let Some(items) = ops.remove("add") {
            add_to_relation(&mut *session, registry, entity, relation, parents, items).await?;
        }
        if let Some(items) = ops.remove("remove") {
            remove_from_relation(&mut *session, registry, entity, relation, parents, items).await?;
        }
        Ok(())
    } else {
        set_on_relation(session, registry, entity, relation, parents, value).await
    }
}

fn items_of(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        single => vec![single],
    }
}

async fn add_to_relation(
    session: &mut dyn Session,
    registry: &SchemaRegistry,
    entity: &EntitySchema,
    relation: &RelationDef,
    parents: &[Row],
    items: Value,
) -> Result<(), AppError> {
    let target = target_of(registry, relation)?;
    for item in items_of(items) {
        let child = get_or_create(&mut *session, registry, target, item).await?;
        for parent in parents {
            if !relation.is_like_list() {
                unlink_all(&mut *session, entity, target, relation, parent).await?;
            }
            link(&mut *session, entity, target, relation, parent, &child).await?;
        }
    }
    Ok(())
}

async fn remove_from_relation(
    session: &mut dyn Session,
    registry: &SchemaRegistry,
    entity: &EntitySchema,
    relation: &RelationDef,
    parents: &[Row],
    items: Value,
) -> Result<(), AppError> {
    let target = target_of(registry, relation)?;
    let target_pk = target.pk_field();
    for item in items_of(items) {
        let Value::Object(mut spec) = item else {
            return Err(AppError::invalid(&relation.name, "remove expects objects"));
        };
        let delete = spec.remove(DELETE_FLAG).map(|v| v.as_bool().unwrap_or(false)).unwrap_or(false);
        let (scalars, _) = split_payload(target, &spec)?;
        let plan = match scalars.get(&target_pk.name) {
            Some(key) => QueryPlan::by_key(target, target_pk, key.clone()),
            None => {
                let mut plan = QueryPlan::scan(target);
                for (name, value) in &scalars {
                    if let Some(field) = target.field(name) {
                        plan = plan.filter(eq(field, value.clone()));
                    }
                }
                plan.limit = Some(1);
                plan
            }
        };
        let child = session
            .fetch(&plan)
            .await?
            .into_iter()
            .next()
            .ok_or_else(AppError::not_found)?;
        for parent in parents {
            unlink(&mut *session, entity, target, relation, parent, &child).await?;
        }
        if delete {
            let key = key_of(&child, target_pk);
            session.delete_where(&QueryPlan::by_key(target, target_pk, key).without_order()).await?;
        }
    }
    Ok(())
}

async fn set_on_relation(
    session: &mut dyn Session,
    registry: &SchemaRegistry,
    entity: &EntitySchema,
    relation: &RelationDef,
    parents: &[Row],
    value: Value,
) -> Result<(), AppError> {
    let target = target_of(registry, relation)?;
    let children = match (relation.is_like_list(), value) {
        (true, Value::Array(items)) => {
            let mut children = Vec::with_capacity(items.len());
            for item in items {
                children.push(get_or_create(&mut *session, registry, target, item).await?);
            }
            children
        }
        (true, _) => return Err(AppError::invalid(&relation.name, "expects a list")),
        (false, Value::Null) => Vec::new(),
        (false, Value::Array(_)) => return Err(AppError::invalid(&relation.name, "expects a single object")),
        (false, item) => vec![get_or_create(&mut *session, registry, target, item).await?],
    };
    for parent in parents {
        unlink_all(&mut *session, entity, target, relation, parent).await?;
        for child in &children {
            link(&mut *session, entity, target, relation, parent, child).await?;
        }
    }
    Ok(())
}

async fn link(
    session: &mut dyn Session,
    entity: &EntitySchema,
    target: &EntitySchema,
    relation: &RelationDef,
    parent: &Row,
    child: &Row,
) -> Result<(), AppError> {
    let pk = entity.pk_field();
    let target_pk = target.pk_field();
    match &relation.join {
        Join::Owned { column } => {
            let Some(fk) = entity.field(column) else { return Ok(()) };
            let plan = QueryPlan::by_key(entity, pk, key_of(parent, pk)).without_order();
            session.update_where(&plan, &[(fk.clone(), key_of(child, target_pk))]).await?;
        }
        Join::Foreign { column } => {
            let Some(fk) = target.field(column) else { return Ok(()) };
            let plan = QueryPlan::by_key(target, target_pk, key_of(child, target_pk)).without_order();
            session.update_where(&plan, &[(fk.clone(), key_of(parent, pk))]).await?;
        }
        Join::Link(link) => {
            session
                .insert_link(link, &key_of(parent, pk), &key_of(child, target_pk))
                .await?;
        }
    }
    Ok(())
}

async fn unlink(
    session: &mut dyn Session,
    entity: &EntitySchema,
    target: &EntitySchema,
    relation: &RelationDef,
    parent: &Row,
    child: &Row,
) -> Result<u64, AppError> {
    let pk = entity.pk_field();
    let target_pk = target.pk_field();
    Ok(match &relation.join {
        Join::Owned { column } => {
            let Some(fk) = entity.field(column) else { return Ok(0) };
            let plan = QueryPlan::by_key(entity, pk, key_of(parent, pk))
                .filter(eq(fk, key_of(child, target_pk)))
                .without_order();
            session.update_where(&plan, &[(fk.clone(), Value::Null)]).await?
        }
        Join::Foreign { column } => {
            let Some(fk) = target.field(column) else { return Ok(0) };
            let plan = QueryPlan::by_key(target, target_pk, key_of(child, target_pk))
                .filter(eq(fk, key_of(parent, pk)))
                .without_order();
            session.update_where(&plan, &[(fk.clone(), Value::Null)]).await?
        }
        Join::Link(link) => {
            session
                .delete_links(link, &key_of(parent, pk), Some(&key_of(child, target_pk)))
                .await?
        }
    })
}

/// Detach everything currently related to `parent`.
async fn unlink_all(
    session: &mut dyn Session,
    entity: &EntitySchema,
    target: &EntitySchema,
    relation: &RelationDef,
    parent: &Row,
) -> Result<(), AppError> {
    let pk = entity.pk_field();
    match &relation.join {
        Join::Owned { column } => {
            let Some(fk) = entity.field(column) else { return Ok(()) };
            let plan = QueryPlan::by_key(entity, pk, key_of(parent, pk)).without_order();
            session.update_where(&plan, &[(fk.clone(), Value::Null)]).await?;
        }
        Join::Foreign { column } => {
            let Some(fk) = target.field(column) else { return Ok(()) };
            let plan = QueryPlan::by_key(target, fk, key_of(parent, pk)).without_order();
            session.update_where(&plan, &[(fk.clone(), Value::Null)]).await?;
        }
        Join::Link(link) => {
            session.delete_links(link, &key_of(parent, pk), None).await?;
        }
    }
    Ok(())
}

/// Unlink one related row from `parent` and, when `delete` is set, delete it too.
/// Returns false when the row was not related to `parent`.
pub async fn unlink_related(
    session: &mut dyn Session,
    entity: &EntitySchema,
    target: &EntitySchema,
    relation: &RelationDef,
    parent: &Row,
    child: &Row,
    delete: bool,
) -> Result<bool, AppError> {
    if unlink(&mut *session, entity, target, relation, parent, child).await? == 0 {
        return Ok(false);
    }
    if delete {
        let target_pk = target.pk_field();
        let plan = QueryPlan::by_key(target, target_pk, key_of(child, target_pk)).without_order();
        session.delete_where(&plan).await?;
    }
    Ok(true)
}
