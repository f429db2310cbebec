//! Boolean filter trees decoded from the `filters` member of a search specification.
//!
//! Accepted shapes:
//! - `{"$or": [f, ...]}` / `{"$and": [f, ...]}`
//! - `{"<field>": {"<operator>": <argument>}}`
//! - `{"<field>": {"<operator>": {"$field": "<other field>"}}}` compares two columns.

use crate::error::QueryError;
use crate::query::operators::{self, Operator};
use serde_json::{Map, Value};
use std::fmt;

const OR: &str = "$or";
const AND: &str = "$and";
const OTHER_FIELD: &str = "$field";

#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    Comparison {
        field: String,
        operator: String,
        argument: Option<Value>,
        other_field: Option<String>,
    },
    Conjunction(Vec<Filter>),
    Disjunction(Vec<Filter>),
}

impl Filter {
    /// Decode a filter tree. `null` and `{}` mean "no filtering".
    pub fn from_json(value: &Value) -> Result<Option<Filter>, QueryError> {
        match value {
            Value::Null => Ok(None),
            Value::Object(map) if map.is_empty() => Ok(None),
            Value::Object(map) => parse_node(map).map(Some),
            other => Err(QueryError::MalformedFilter(format!(
                "expected an object, got {}",
                other
            ))),
        }
    }

    /// Number of leaf comparisons in the tree.
    pub fn leaf_count(&self) -> usize {
        match self {
            Filter::Comparison { .. } => 1,
            Filter::Conjunction(c) | Filter::Disjunction(c) => c.iter().map(Filter::leaf_count).sum(),
        }
    }
}

fn parse_node(map: &Map<String, Value>) -> Result<Filter, QueryError> {
    for (key, junction) in [(OR, Filter::Disjunction as fn(Vec<Filter>) -> Filter), (AND, Filter::Conjunction)] {
        if let Some(children) = map.get(key) {
            if map.len() != 1 {
                return Err(QueryError::MalformedFilter(format!(
                    "'{}' cannot be combined with other keys",
                    key
                )));
            }
            let children = children.as_array().ok_or_else(|| {
                QueryError::MalformedFilter(format!("'{}' expects an array of filters", key))
            })?;
            let parsed = children
                .iter()
                .map(|child| match child {
                    Value::Object(m) if !m.is_empty() => parse_node(m),
                    other => Err(QueryError::MalformedFilter(format!(
                        "'{}' members must be non-empty objects, got {}",
                        key, other
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(junction(parsed));
        }
    }
    parse_leaf(map)
}

fn parse_leaf(map: &Map<String, Value>) -> Result<Filter, QueryError> {
    let (field, comparison) = sole_entry(map, "a filter names exactly one field")?;
    let comparison = comparison.as_object().ok_or_else(|| {
        QueryError::MalformedFilter(format!("field '{}' expects {{operator: argument}}", field))
    })?;
    let (operator, argument) = sole_entry(comparison, "a comparison has exactly one operator")?;

    let op = operators::lookup(operator).ok_or_else(|| QueryError::UnknownOperator(operator.clone()))?;

    let other_field = match argument {
        _ if matches!(op, Operator::Unary(_)) => None,
        Value::Object(m) if m.len() == 1 && m.contains_key(OTHER_FIELD) => Some(
            m[OTHER_FIELD]
                .as_str()
                .ok_or_else(|| QueryError::MalformedFilter("'$field' expects a field name".into()))?
                .to_string(),
        ),
        _ => None,
    };
    let argument = match (&op, other_field.is_some(), argument) {
        (Operator::Unary(_), _, _) => None,
        (_, true, _) => None,
        (_, false, Value::Null) => {
            return Err(QueryError::InvalidOperatorArgument {
                operator: operator.clone(),
                reason: "to compare a value to NULL, use the is_null/is_not_null operators".into(),
            })
        }
        (_, false, v) => Some(v.clone()),
    };
    if other_field.is_some() && !matches!(op, Operator::Binary(_)) {
        return Err(QueryError::InvalidOperatorArgument {
            operator: operator.clone(),
            reason: "only comparison operators accept a '$field' argument".into(),
        });
    }

    Ok(Filter::Comparison {
        field: field.clone(),
        operator: operator.clone(),
        argument,
        other_field,
    })
}

fn sole_entry<'a>(map: &'a Map<String, Value>, what: &str) -> Result<(&'a String, &'a Value), QueryError> {
    let mut entries = map.iter();
    match (entries.next(), entries.next()) {
        (Some(entry), None) => Ok(entry),
        _ => Err(QueryError::MalformedFilter(format!("{} (found {} keys)", what, map.len()))),
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Comparison {
                field,
                operator,
                argument,
                other_field,
            } => match (argument, other_field) {
                (_, Some(other)) => write!(f, "{} {} ${}", field, operator, other),
                (Some(arg), None) => write!(f, "{} {} {}", field, operator, arg),
                (None, None) => write!(f, "{} {}", field, operator),
            },
            Filter::Conjunction(children) | Filter::Disjunction(children) => {
                let sep = if matches!(self, Filter::Conjunction(_)) { " AND " } else { " OR " };
                f.write_str("(")?;
                for (i, c) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(sep)?;
                    }
                    write!(f, "{}", c)?;
                }
                f.write_str(")")
            }
        }
    }
}
