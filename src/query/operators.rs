//! Operator table: operator name → predicate builder, tagged by arity.

use crate::config::{Cardinality, FieldDef};
use crate::error::QueryError;
use crate::query::filter::Filter;
use crate::query::plan::{build_predicate, correlate, CompareOp, Operand, Predicate, Scope};
use serde_json::Value;

/// What a unary operator is applied to.
pub enum Subject {
    Column(FieldDef),
    /// Existence of related rows (for relations).
    Related(Predicate),
}

#[derive(Clone, Copy)]
pub enum Operator {
    Unary(fn(Subject) -> Predicate),
    Binary(fn(&str, &FieldDef, Operand) -> Result<Predicate, QueryError>),
    /// Receives the scope, the field name and the raw argument.
    Ternary(fn(&Scope<'_>, &str, &Value) -> Result<Predicate, QueryError>),
}

impl Operator {
    pub fn arity(&self) -> u8 {
        match self {
            Operator::Unary(_) => 1,
            Operator::Binary(_) => 2,
            Operator::Ternary(_) => 3,
        }
    }
}

pub fn lookup(name: &str) -> Option<Operator> {
    Some(match name {
        "is_null" => Operator::Unary(is_null),
        "is_not_null" => Operator::Unary(is_not_null),
        "==" | "eq" | "equals" | "equal_to" => Operator::Binary(eq),
        "!=" | "ne" | "neq" | "not_equal_to" | "does_not_equal" => Operator::Binary(ne),
        ">" | "gt" => Operator::Binary(gt),
        "<" | "lt" => Operator::Binary(lt),
        ">=" | "ge" | "gte" | "geq" => Operator::Binary(ge),
        "<=" | "le" | "lte" | "leq" => Operator::Binary(le),
        "like" => Operator::Binary(like),
        "ilike" => Operator::Binary(ilike),
        "not_like" => Operator::Binary(not_like),
        "in" => Operator::Binary(in_list),
        "not_in" => Operator::Binary(not_in_list),
        "has" => Operator::Ternary(has),
        "any" => Operator::Ternary(any),
        _ => return None,
    })
}

fn is_null(subject: Subject) -> Predicate {
    match subject {
        Subject::Column(field) => Predicate::Null { field, negated: false },
        Subject::Related(exists) => Predicate::Not(Box::new(exists)),
    }
}

fn is_not_null(subject: Subject) -> Predicate {
    match subject {
        Subject::Column(field) => Predicate::Null { field, negated: true },
        Subject::Related(exists) => exists,
    }
}

fn compare(field: &FieldDef, op: CompareOp, operand: Operand) -> Predicate {
    Predicate::Compare {
        field: field.clone(),
        op,
        operand,
    }
}

fn eq(_: &str, field: &FieldDef, operand: Operand) -> Result<Predicate, QueryError> {
    Ok(compare(field, CompareOp::Eq, operand))
}

fn ne(_: &str, field: &FieldDef, operand: Operand) -> Result<Predicate, QueryError> {
    Ok(compare(field, CompareOp::Ne, operand))
}

fn gt(_: &str, field: &FieldDef, operand: Operand) -> Result<Predicate, QueryError> {
    Ok(compare(field, CompareOp::Gt, operand))
}

fn lt(_: &str, field: &FieldDef, operand: Operand) -> Result<Predicate, QueryError> {
    Ok(compare(field, CompareOp::Lt, operand))
}

fn ge(_: &str, field: &FieldDef, operand: Operand) -> Result<Predicate, QueryError> {
    Ok(compare(field, CompareOp::Ge, operand))
}

fn le(_: &str, field: &FieldDef, operand: Operand) -> Result<Predicate, QueryError> {
    Ok(compare(field, CompareOp::Le, operand))
}

fn pattern(operator: &str, operand: Operand) -> Result<String, QueryError> {
    match operand {
        Operand::Value(Value::String(s)) => Ok(s),
        _ => Err(QueryError::InvalidOperatorArgument {
            operator: operator.to_string(),
            reason: "expects a string pattern".into(),
        }),
    }
}

fn like(operator: &str, field: &FieldDef, operand: Operand) -> Result<Predicate, QueryError> {
    Ok(Predicate::Like {
        field: field.clone(),
        pattern: pattern(operator, operand)?,
        case_insensitive: false,
        negated: false,
    })
}

fn ilike(operator: &str, field: &FieldDef, operand: Operand) -> Result<Predicate, QueryError> {
    Ok(Predicate::Like {
        field: field.clone(),
        pattern: pattern(operator, operand)?,
        case_insensitive: true,
        negated: false,
    })
}

fn not_like(operator: &str, field: &FieldDef, operand: Operand) -> Result<Predicate, QueryError> {
    Ok(Predicate::Like {
        field: field.clone(),
        pattern: pattern(operator, operand)?,
        case_insensitive: false,
        negated: true,
    })
}

fn list(operator: &str, operand: Operand) -> Result<Vec<Value>, QueryError> {
    match operand {
        Operand::Value(Value::Array(values)) => Ok(values),
        _ => Err(QueryError::InvalidOperatorArgument {
            operator: operator.to_string(),
            reason: "expects an array".into(),
        }),
    }
}

fn in_list(operator: &str, field: &FieldDef, operand: Operand) -> Result<Predicate, QueryError> {
    Ok(Predicate::In {
        field: field.clone(),
        values: list(operator, operand)?,
        negated: false,
    })
}

fn not_in_list(operator: &str, field: &FieldDef, operand: Operand) -> Result<Predicate, QueryError> {
    Ok(Predicate::In {
        field: field.clone(),
        values: list(operator, operand)?,
        negated: true,
    })
}

fn has(scope: &Scope<'_>, field: &str, argument: &Value) -> Result<Predicate, QueryError> {
    related(scope, "has", Cardinality::ToOne, field, argument)
}

fn any(scope: &Scope<'_>, field: &str, argument: &Value) -> Result<Predicate, QueryError> {
    related(scope, "any", Cardinality::ToMany, field, argument)
}

/// `has`/`any`: an object argument is a filter over the related entity,
/// anything else is matched against the related primary key.
fn related(
    scope: &Scope<'_>,
    operator: &str,
    cardinality: Cardinality,
    field: &str,
    argument: &Value,
) -> Result<Predicate, QueryError> {
    let relation = scope
        .entity
        .relation(field)
        .ok_or_else(|| QueryError::InvalidOperatorArgument {
            operator: operator.to_string(),
            reason: format!("'{}' is not a relation", field),
        })?;
    if relation.cardinality != cardinality {
        return Err(QueryError::InvalidOperatorArgument {
            operator: operator.to_string(),
            reason: match cardinality {
                Cardinality::ToOne => format!("'{}' is a to-many relation; use 'any'", field),
                Cardinality::ToMany => format!("'{}' is a to-one relation; use 'has'", field),
            },
        });
    }
    let target = scope
        .registry
        .get(&relation.target)
        .ok_or_else(|| QueryError::InvalidField(relation.target.clone()))?;
    let inner_scope = Scope {
        registry: scope.registry,
        entity: target,
    };
    let inner = match argument {
        Value::Object(_) => match Filter::from_json(argument)? {
            Some(filter) => Some(build_predicate(&inner_scope, &filter)?),
            None => None,
        },
        other => {
            let pk = target.pk_field();
            let value = crate::coerce::coerce_argument(pk, other).map_err(|reason| {
                QueryError::InvalidOperatorArgument {
                    operator: operator.to_string(),
                    reason,
                }
            })?;
            Some(compare(pk, CompareOp::Eq, Operand::Value(value)))
        }
    };
    Ok(correlate(scope.entity, relation, target, inner))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arities() {
        assert_eq!(lookup("is_null").unwrap().arity(), 1);
        assert_eq!(lookup("gte").unwrap().arity(), 2);
        assert_eq!(lookup(">=").unwrap().arity(), 2);
        assert_eq!(lookup("any").unwrap().arity(), 3);
        assert!(lookup("between").is_none());
    }

    #[test]
    fn in_requires_array() {
        let field = FieldDef {
            name: "age".into(),
            kind: crate::config::FieldKind::Integer,
            sql_type: "int8".into(),
            nullable: true,
            has_default: false,
        };
        let Operator::Binary(f) = lookup("in").unwrap() else {
            panic!("in should be binary")
        };
        assert!(f("in", &field, Operand::Value(serde_json::json!([1, 2]))).is_ok());
        assert!(matches!(
            f("in", &field, Operand::Value(serde_json::json!(1))),
            Err(QueryError::InvalidOperatorArgument { .. })
        ));
    }
}
