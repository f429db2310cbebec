//! Search parameters: the decoded `q` specification.

use crate::error::QueryError;
use crate::query::filter::Filter;
use serde_json::Value;

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub field: String,
    /// Validated when the plan is built.
    pub direction: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchParams {
    pub filters: Option<Filter>,
    pub order_by: Vec<OrderBy>,
    pub group_by: Vec<String>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl SearchParams {
    /// Decode the raw `q` text; an absent or empty string means no restrictions.
    pub fn parse(text: &str) -> Result<Self, QueryError> {
        if text.trim().is_empty() {
            return Ok(SearchParams::default());
        }
        let value: Value = serde_json::from_str(text)
            .map_err(|e| QueryError::MalformedSearch(format!("unable to decode search query: {}", e)))?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<Self, QueryError> {
        let map = match value {
            Value::Null => return Ok(SearchParams::default()),
            Value::Object(m) => m,
            other => {
                return Err(QueryError::MalformedSearch(format!(
                    "expected an object, got {}",
                    other
                )))
            }
        };

        let filters = match map.get("filters") {
            Some(f) => Filter::from_json(f)?,
            None => None,
        };

        let order_by = entries(map.get("order_by"), "order_by")?
            .into_iter()
            .map(|entry| {
                let field = required_str(entry, "order_by", "field")?;
                let direction = match entry.get("direction") {
                    None | Some(Value::Null) => "asc".to_string(),
                    Some(Value::String(d)) => d.clone(),
                    Some(other) => return Err(QueryError::InvalidDirection(other.to_string())),
                };
                Ok(OrderBy { field, direction })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let group_by = entries(map.get("group_by"), "group_by")?
            .into_iter()
            .map(|entry| required_str(entry, "group_by", "field"))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SearchParams {
            filters,
            order_by,
            group_by,
            limit: positive(map.get("limit"), "limit")?,
            offset: positive(map.get("offset"), "offset")?,
        })
    }
}

fn entries<'a>(value: Option<&'a Value>, key: &str) -> Result<Vec<&'a Value>, QueryError> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.iter().collect()),
        Some(_) => Err(QueryError::MalformedSearch(format!("'{}' must be an array", key))),
    }
}

fn required_str(entry: &Value, key: &str, member: &str) -> Result<String, QueryError> {
    entry
        .get(member)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| QueryError::MalformedSearch(format!("each '{}' entry needs a '{}' string", key, member)))
}

/// Integers ≤ 0 are ignored rather than rejected.
fn positive(value: Option<&Value>, key: &str) -> Result<Option<u64>, QueryError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => match n.as_i64() {
            Some(i) if i > 0 => Ok(Some(i as u64)),
            Some(_) => Ok(None),
            None => Err(QueryError::MalformedSearch(format!("'{}' must be an integer", key))),
        },
        Some(_) => Err(QueryError::MalformedSearch(format!("'{}' must be an integer", key))),
    }
}
