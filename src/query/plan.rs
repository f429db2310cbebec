//! Query plans: a backend-neutral, not-yet-executed description of a read or
//! bulk mutation, built from search parameters against the schema registry.

use crate::coerce;
use crate::config::{EntitySchema, FieldDef, Join, LinkTable, RelationDef, SchemaRegistry, TableRef};
use crate::error::QueryError;
use crate::query::filter::Filter;
use crate::query::operators::{self, Operator, Subject};
use crate::query::params::SearchParams;
use serde_json::Value;
use std::cmp::Ordering;

/// Largest row offset a plan carries (Postgres `OFFSET` is a bigint).
pub const MAX_OFFSET: u64 = i64::MAX as u64;

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Value(Value),
    /// Another column of the same row.
    Column(FieldDef),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn sql(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
        }
    }

    pub fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    pub fn parse(token: &str) -> Result<Self, QueryError> {
        match token.to_ascii_lowercase().as_str() {
            "asc" => Ok(Direction::Asc),
            "desc" => Ok(Direction::Desc),
            _ => Err(QueryError::InvalidDirection(token.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare {
        field: FieldDef,
        op: CompareOp,
        operand: Operand,
    },
    Null {
        field: FieldDef,
        negated: bool,
    },
    In {
        field: FieldDef,
        values: Vec<Value>,
        negated: bool,
    },
    Like {
        field: FieldDef,
        pattern: String,
        case_insensitive: bool,
        negated: bool,
    },
    /// Some related row exists (optionally matching a predicate).
    Related(Box<Correlated>),
}

/// Correlated existence test against a related table.
///
/// Rows of `target` qualify when `target.inner` equals the outer row's `outer`
/// column (through `link` when present) and `predicate` holds.
#[derive(Clone, Debug, PartialEq)]
pub struct Correlated {
    pub outer: FieldDef,
    pub link: Option<LinkTable>,
    pub target: TableRef,
    pub inner: FieldDef,
    pub predicate: Option<Predicate>,
}

/// Entity against which filter fields are resolved.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    pub registry: &'a SchemaRegistry,
    pub entity: &'a EntitySchema,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryPlan {
    pub table: TableRef,
    pub columns: Vec<FieldDef>,
    /// `None` for link tables.
    pub primary_key: Option<FieldDef>,
    pub predicate: Option<Predicate>,
    pub order_by: Vec<(FieldDef, Direction)>,
    pub group_by: Vec<FieldDef>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryPlan {
    /// All rows of an entity, ordered by primary key.
    pub fn scan(entity: &EntitySchema) -> Self {
        QueryPlan {
            table: entity.table.clone(),
            columns: entity.fields.clone(),
            primary_key: Some(entity.pk_field().clone()),
            predicate: None,
            order_by: vec![(entity.pk_field().clone(), Direction::Asc)],
            group_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    pub fn scan_link(link: &LinkTable) -> Self {
        QueryPlan {
            table: link.table.clone(),
            columns: vec![link.local.clone(), link.remote.clone()],
            primary_key: None,
            predicate: None,
            order_by: Vec::new(),
            group_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Rows whose `field` equals `value`.
    pub fn by_key(entity: &EntitySchema, field: &FieldDef, value: Value) -> Self {
        Self::scan(entity).filter(Predicate::Compare {
            field: field.clone(),
            op: CompareOp::Eq,
            operand: Operand::Value(value),
        })
    }

    /// AND `predicate` into the existing restriction.
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(match self.predicate.take() {
            None => predicate,
            Some(Predicate::And(mut parts)) => {
                parts.push(predicate);
                Predicate::And(parts)
            }
            Some(existing) => Predicate::And(vec![existing, predicate]),
        });
        self
    }

    /// Restrict to `len` rows starting at `start`, relative to the current limit/offset.
    pub fn window(mut self, start: u64, len: u64) -> Self {
        let offset = self.offset.unwrap_or(0).saturating_add(start).min(MAX_OFFSET);
        self.limit = Some(match self.limit {
            Some(limit) => len.min(limit.saturating_sub(start)),
            None => len,
        });
        self.offset = if offset > 0 { Some(offset) } else { None };
        self
    }

    pub fn without_order(mut self) -> Self {
        self.order_by.clear();
        self
    }
}

/// Build a plan from search parameters. Ordering is skipped when `ignore_order_by` is set.
pub fn build(
    registry: &SchemaRegistry,
    entity: &EntitySchema,
    params: &SearchParams,
    ignore_order_by: bool,
) -> Result<QueryPlan, QueryError> {
    let scope = Scope { registry, entity };
    let mut plan = QueryPlan::scan(entity);

    if let Some(filter) = &params.filters {
        plan.predicate = Some(build_predicate(&scope, filter)?);
    }

    if ignore_order_by {
        plan.order_by.clear();
    } else if !params.order_by.is_empty() {
        plan.order_by = params
            .order_by
            .iter()
            .map(|o| {
                let field = entity
                    .field(&o.field)
                    .ok_or_else(|| QueryError::InvalidField(o.field.clone()))?;
                Ok((field.clone(), Direction::parse(&o.direction)?))
            })
            .collect::<Result<_, QueryError>>()?;
    }

    if !params.group_by.is_empty() {
        plan.group_by = params
            .group_by
            .iter()
            .map(|name| {
                entity
                    .field(name)
                    .cloned()
                    .ok_or_else(|| QueryError::InvalidField(name.clone()))
            })
            .collect::<Result<_, _>>()?;
        if params.order_by.is_empty() {
            plan.order_by.clear();
        }
    }

    plan.limit = params.limit;
    plan.offset = params.offset;
    tracing::debug!(entity = %entity.name, filters = ?params.filters.as_ref().map(|f| f.to_string()), "query plan built");
    Ok(plan)
}

/// Translate a filter tree into a predicate over `scope.entity`.
pub fn build_predicate(scope: &Scope<'_>, filter: &Filter) -> Result<Predicate, QueryError> {
    match filter {
        Filter::Conjunction(children) => children
            .iter()
            .map(|c| build_predicate(scope, c))
            .collect::<Result<_, _>>()
            .map(Predicate::And),
        Filter::Disjunction(children) => children
            .iter()
            .map(|c| build_predicate(scope, c))
            .collect::<Result<_, _>>()
            .map(Predicate::Or),
        Filter::Comparison {
            field,
            operator,
            argument,
            other_field,
        } => {
            let op = operators::lookup(operator).ok_or_else(|| QueryError::UnknownOperator(operator.clone()))?;
            if let Some(column) = scope.entity.field(field) {
                column_predicate(scope, column, operator, op, argument.as_ref(), other_field.as_deref())
            } else if let Some(relation) = scope.entity.relation(field) {
                relation_predicate(scope, relation, operator, op, argument.as_ref())
            } else {
                Err(QueryError::InvalidField(field.clone()))
            }
        }
    }
}

fn column_predicate(
    scope: &Scope<'_>,
    column: &FieldDef,
    operator: &str,
    op: Operator,
    argument: Option<&Value>,
    other_field: Option<&str>,
) -> Result<Predicate, QueryError> {
    match op {
        Operator::Unary(f) => Ok(f(Subject::Column(column.clone()))),
        Operator::Binary(f) => {
            let operand = match other_field {
                Some(other) => Operand::Column(
                    scope
                        .entity
                        .field(other)
                        .cloned()
                        .ok_or_else(|| QueryError::InvalidField(other.to_string()))?,
                ),
                None => {
                    let raw = argument.unwrap_or(&Value::Null);
                    let value = coerce::coerce_argument(column, raw).map_err(|reason| {
                        QueryError::InvalidOperatorArgument {
                            operator: operator.to_string(),
                            reason,
                        }
                    })?;
                    Operand::Value(value)
                }
            };
            f(operator, column, operand)
        }
        Operator::Ternary(_) => Err(QueryError::InvalidOperatorArgument {
            operator: operator.to_string(),
            reason: format!("'{}' is not a relation", column.name),
        }),
    }
}

fn relation_predicate(
    scope: &Scope<'_>,
    relation: &RelationDef,
    operator: &str,
    op: Operator,
    argument: Option<&Value>,
) -> Result<Predicate, QueryError> {
    match op {
        Operator::Unary(f) => {
            let target = scope
                .registry
                .get(&relation.target)
                .ok_or_else(|| QueryError::InvalidField(relation.target.clone()))?;
            Ok(f(Subject::Related(correlate(scope.entity, relation, target, None))))
        }
        Operator::Ternary(f) => f(scope, &relation.name, argument.unwrap_or(&Value::Null)),
        Operator::Binary(_) => Err(QueryError::InvalidOperatorArgument {
            operator: operator.to_string(),
            reason: format!("'{}' is a relation; use has, any, is_null or is_not_null", relation.name),
        }),
    }
}

/// Existence predicate for `relation` of `entity`, restricted by `inner` over the target.
pub fn correlate(
    entity: &EntitySchema,
    relation: &RelationDef,
    target: &EntitySchema,
    inner: Option<Predicate>,
) -> Predicate {
    let column_of = |schema: &EntitySchema, column: &str, referenced: &FieldDef| {
        schema.field(column).cloned().unwrap_or_else(|| FieldDef {
            name: column.to_string(),
            ..referenced.clone()
        })
    };
    let (outer, link, inner_column) = match &relation.join {
        Join::Owned { column } => (column_of(entity, column, target.pk_field()), None, target.pk_field().clone()),
        Join::Foreign { column } => (
            entity.pk_field().clone(),
            None,
            column_of(target, column, entity.pk_field()),
        ),
        Join::Link(link) => (entity.pk_field().clone(), Some(link.clone()), target.pk_field().clone()),
    };
    Predicate::Related(Box::new(Correlated {
        outer,
        link,
        target: target.table.clone(),
        inner: inner_column,
        predicate: inner,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_model, resolve};
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        resolve(
            &parse_model(
                r#"{"entities": [
                {"name": "person", "fields": [
                    {"name": "id", "type": "int8", "nullable": false, "has_default": true},
                    {"name": "name", "type": "text"},
                    {"name": "age", "type": "int4"},
                    {"name": "birthday", "type": "date"}
                ], "relations": [
                    {"name": "pets", "target": "pet", "cardinality": "to_many",
                     "join": {"kind": "foreign", "column": "owner_id"}}
                ]},
                {"name": "pet", "fields": [
                    {"name": "id", "type": "int8", "nullable": false, "has_default": true},
                    {"name": "name", "type": "text"},
                    {"name": "owner_id", "type": "int8"}
                ], "relations": [
                    {"name": "owner", "target": "person", "cardinality": "to_one",
                     "join": {"kind": "owned", "column": "owner_id"}}
                ]}
            ]}"#,
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn plan(q: serde_json::Value) -> Result<QueryPlan, QueryError> {
        let r = registry();
        let params = SearchParams::from_json(&q)?;
        build(&r, r.get("person").unwrap(), &params, false)
    }

    #[test]
    fn default_order_is_primary_key() {
        let p = plan(json!({})).unwrap();
        assert_eq!(p.order_by.len(), 1);
        assert_eq!(p.order_by[0].0.name, "id");
        assert!(p.predicate.is_none());
    }

    #[test]
    fn order_by_sequence_is_kept() {
        let p = plan(json!({"order_by": [
            {"field": "name", "direction": "asc"},
            {"field": "age", "direction": "DESC"}
        ]}))
        .unwrap();
        let order: Vec<_> = p.order_by.iter().map(|(f, d)| (f.name.as_str(), *d)).collect();
        assert_eq!(order, vec![("name", Direction::Asc), ("age", Direction::Desc)]);
    }

    #[test]
    fn invalid_order_field_and_direction() {
        assert_eq!(
            plan(json!({"order_by": [{"field": "nope"}]})).unwrap_err(),
            QueryError::InvalidField("nope".into())
        );
        assert_eq!(
            plan(json!({"order_by": [{"field": "name", "direction": "up"}]})).unwrap_err(),
            QueryError::InvalidDirection("up".into())
        );
        assert!(matches!(
            plan(json!({"group_by": [{"field": "nope"}]})),
            Err(QueryError::InvalidField(_))
        ));
    }

    #[test]
    fn unknown_filter_field() {
        assert_eq!(
            plan(json!({"filters": {"shoe_size": {"eq": 9}}})).unwrap_err(),
            QueryError::InvalidField("shoe_size".into())
        );
    }

    #[test]
    fn disjunction_with_null_test() {
        let p = plan(json!({"filters": {"$or": [{"age": {"gt": 18}}, {"age": {"is_null": null}}]}})).unwrap();
        match p.predicate.unwrap() {
            Predicate::Or(parts) => {
                assert!(matches!(parts[0], Predicate::Compare { op: CompareOp::Gt, .. }));
                assert!(matches!(parts[1], Predicate::Null { negated: false, .. }));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn date_arguments_are_coerced() {
        let p = plan(json!({"filters": {"birthday": {"lt": "2000-01-01T12:00:00"}}})).unwrap();
        assert!(matches!(
            p.predicate,
            Some(Predicate::Compare { operand: Operand::Value(ref v), .. }) if v == &json!("2000-01-01")
        ));
        assert!(matches!(
            plan(json!({"filters": {"birthday": {"lt": "soon"}}})),
            Err(QueryError::InvalidOperatorArgument { .. })
        ));
    }

    #[test]
    fn any_builds_correlated_subquery() {
        let p = plan(json!({"filters": {"pets": {"any": {"name": {"eq": "Rex"}}}}})).unwrap();
        match p.predicate.unwrap() {
            Predicate::Related(c) => {
                assert_eq!(c.outer.name, "id");
                assert_eq!(c.inner.name, "owner_id");
                assert!(c.predicate.is_some());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            plan(json!({"filters": {"pets": {"has": 1}}})),
            Err(QueryError::InvalidOperatorArgument { .. })
        ));
        assert!(matches!(
            plan(json!({"filters": {"pets": {"eq": 1}}})),
            Err(QueryError::InvalidOperatorArgument { .. })
        ));
    }

    #[test]
    fn relation_is_null_negates_existence() {
        let p = plan(json!({"filters": {"pets": {"is_null": null}}})).unwrap();
        assert!(matches!(p.predicate, Some(Predicate::Not(_))));
    }

    #[test]
    fn window_composes_with_limit() {
        let base = QueryPlan::scan(registry().get("person").unwrap());
        let w = base.clone().window(20, 10);
        assert_eq!((w.offset, w.limit), (Some(20), Some(10)));
        let mut limited = base;
        limited.limit = Some(25);
        limited.offset = Some(5);
        let w = limited.window(20, 10);
        assert_eq!((w.offset, w.limit), (Some(25), Some(5)));
    }

    #[test]
    fn has_on_owned_relation_correlates_through_foreign_key() {
        let r = registry();
        let params = SearchParams::from_json(&json!({"filters": {"owner": {"has": {"name": {"eq": "Ann"}}}}})).unwrap();
        let p = build(&r, r.get("pet").unwrap(), &params, false).unwrap();
        let Some(Predicate::Related(c)) = &p.predicate else {
            panic!("expected a correlated predicate, got {:?}", p.predicate);
        };
        assert_eq!(c.outer.name, "owner_id");
        assert_eq!(c.inner.name, "id");
        assert!(c.link.is_none());
        assert!(c.predicate.is_some());

        let params = SearchParams::from_json(&json!({"filters": {"owner": {"has": 3}}})).unwrap();
        let p = build(&r, r.get("pet").unwrap(), &params, false).unwrap();
        let Some(Predicate::Related(c)) = &p.predicate else {
            panic!("expected a correlated predicate");
        };
        assert!(matches!(c.predicate, Some(Predicate::Compare { .. })));
    }

    #[test]
    fn window_past_the_end_saturates() {
        let mut p = QueryPlan::scan(registry().get("person").unwrap());
        p.offset = Some(1);
        let w = p.window(u64::MAX, 10);
        assert_eq!((w.offset, w.limit), (Some(MAX_OFFSET), Some(10)));
    }
}
