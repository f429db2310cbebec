//! Batch loading of related rows: one IN query per relation and level.

use crate::config::{EntitySchema, FieldDef, FieldKind, Join, SchemaRegistry};
use crate::error::AppError;
use crate::projection::{Record, Related};
use crate::query::{Predicate, QueryPlan};
use crate::store::{keys_equal, Row, Session};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// Tree of relation names to load below a record.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Deep {
    pub relations: BTreeMap<String, Deep>,
}

impl Deep {
    /// Every relation of `entity`, without nesting.
    pub fn one_level(entity: &EntitySchema) -> Self {
        Deep {
            relations: entity
                .relation_names()
                .map(|r| (r.to_string(), Deep::default()))
                .collect(),
        }
    }

    /// Add a dotted path such as `pets.toys`.
    pub fn add_path(&mut self, path: &str) {
        let mut node = self;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            node = node.relations.entry(segment.to_string()).or_default();
        }
    }
}

type LoadFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<Record>, AppError>> + Send + 'a>>;

fn distinct_keys<'r>(rows: impl Iterator<Item = &'r Row>, column: &str, kind: FieldKind) -> Vec<Value> {
    let mut keys: Vec<Value> = Vec::new();
    for row in rows {
        if let Some(v) = row.get(column).filter(|v| !v.is_null()) {
            if !keys.iter().any(|k| keys_equal(kind, k, v)) {
                keys.push(v.clone());
            }
        }
    }
    keys
}

fn rows_in(entity: &EntitySchema, field: &FieldDef, keys: Vec<Value>) -> QueryPlan {
    QueryPlan::scan(entity).filter(Predicate::In {
        field: field.clone(),
        values: keys,
        negated: false,
    })
}

/// Wrap `rows` as records of `entity` and attach the relations named in `deep`.
pub fn load<'a>(
    session: &'a mut dyn Session,
    registry: &'a SchemaRegistry,
    entity: &'a EntitySchema,
    rows: Vec<Row>,
    deep: &'a Deep,
) -> LoadFuture<'a> {
    Box::pin(async move {
        let mut records: Vec<Record> = rows.into_iter().map(|r| Record::new(&entity.name, r)).collect();
        if records.is_empty() {
            return Ok(records);
        }
        for (name, sub) in &deep.relations {
            let Some(relation) = entity.relation(name) else {
                tracing::warn!(entity = %entity.name, relation = %name, "skipping unknown relation");
                continue;
            };
            let target = registry.entity(&relation.target)?;
            let pk = entity.pk_field();
            let target_pk = target.pk_field();
            match &relation.join {
                Join::Owned { column } => {
                    let keys = distinct_keys(records.iter().map(|r| &r.row), column, target_pk.kind);
                    let children = if keys.is_empty() {
                        Vec::new()
                    } else {
                        let rows = session.fetch(&rows_in(target, target_pk, keys)).await?;
                        load(&mut *session, registry, target, rows, sub).await?
                    };
                    for record in &mut records {
                        let key = record.get(column).clone();
                        let child = children.iter().find(|c| keys_equal(target_pk.kind, c.get(&target_pk.name), &key));
                        record
                            .related
                            .insert(name.clone(), Related::One(child.cloned().map(Box::new)));
                    }
                }
                Join::Foreign { column } => {
                    let keys = distinct_keys(records.iter().map(|r| &r.row), &pk.name, pk.kind);
                    let fk = target.field(column).unwrap_or(target_pk);
                    let rows = session.fetch(&rows_in(target, fk, keys)).await?;
                    let children = load(&mut *session, registry, target, rows, sub).await?;
                    for record in &mut records {
                        let key = record.get(&pk.name).clone();
                        let mut mine = children.iter().filter(|c| keys_equal(pk.kind, c.get(column), &key)).cloned();
                        let related = if relation.is_like_list() {
                            Related::Many(mine.collect())
                        } else {
                            Related::One(mine.next().map(Box::new))
                        };
                        record.related.insert(name.clone(), related);
                    }
                }
                Join::Link(link) => {
                    let keys = distinct_keys(records.iter().map(|r| &r.row), &pk.name, pk.kind);
                    let link_plan = QueryPlan::scan_link(link).filter(Predicate::In {
                        field: link.local.clone(),
                        values: keys,
                        negated: false,
                    });
                    let links = session.fetch(&link_plan).await?;
                    let remote_keys = distinct_keys(links.iter(), &link.remote.name, target_pk.kind);
                    let children = if remote_keys.is_empty() {
                        Vec::new()
                    } else {
                        let rows = session.fetch(&rows_in(target, target_pk, remote_keys)).await?;
                        load(&mut *session, registry, target, rows, sub).await?
                    };
                    for record in &mut records {
                        let key = record.get(&pk.name).clone();
                        let linked: Vec<&Value> = links
                            .iter()
                            .filter(|l| keys_equal(pk.kind, l.get(&link.local.name).unwrap_or(&Value::Null), &key))
                            .filter_map(|l| l.get(&link.remote.name))
                            .collect();
                        let mine = children
                            .iter()
                            .filter(|c| linked.iter().any(|k| keys_equal(target_pk.kind, c.get(&target_pk.name), k)))
                            .cloned()
                            .collect();
                        record.related.insert(name.clone(), Related::Many(mine));
                    }
                }
            }
        }
        Ok(records)
    })
}

/// Load a single row as a record.
pub async fn load_one(
    session: &mut dyn Session,
    registry: &SchemaRegistry,
    entity: &EntitySchema,
    row: Row,
    deep: &Deep,
) -> Result<Record, AppError> {
    let mut records = load(session, registry, entity, vec![row], deep).await?;
    records
        .pop()
        .ok_or_else(|| AppError::NotFound("No result found".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_paths_nest() {
        let mut deep = Deep::default();
        deep.add_path("pets.toys");
        deep.add_path("pets");
        deep.add_path("friends");
        assert_eq!(deep.relations.len(), 2);
        assert!(deep.relations["pets"].relations.contains_key("toys"));
        assert!(deep.relations["friends"].relations.is_empty());
    }

    #[test]
    fn distinct_keys_follow_column_kind() {
        let rows: Vec<Row> = ["a", "A", "a"]
            .iter()
            .map(|k| serde_json::json!({ "code": k }).as_object().cloned().unwrap_or_default())
            .collect();
        assert_eq!(distinct_keys(rows.iter(), "code", FieldKind::Text).len(), 2);

        let ids: Vec<Row> = ["0A1B2C3D-0000-0000-0000-000000000000", "0a1b2c3d-0000-0000-0000-000000000000"]
            .iter()
            .map(|k| serde_json::json!({ "id": k }).as_object().cloned().unwrap_or_default())
            .collect();
        assert_eq!(distinct_keys(ids.iter(), "id", FieldKind::Uuid).len(), 1);

        let nums: Vec<Row> = [serde_json::json!({"id": 1}), serde_json::json!({"id": 1.0}), serde_json::json!({"id": null})]
            .iter()
            .map(|v| v.as_object().cloned().unwrap_or_default())
            .collect();
        assert_eq!(distinct_keys(nums.iter(), "id", FieldKind::Integer), vec![serde_json::json!(1)]);
    }
}
