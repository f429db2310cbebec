//! String → typed value coercion for temporal columns and path identifiers.
//!
//! Temporal values travel as canonical strings:
//! - date: `YYYY-MM-DD`
//! - timestamp with time zone: RFC 3339 in UTC with a `Z` suffix
//! - timestamp without time zone: `YYYY-MM-DDTHH:MM:SS[.fff]`
//! - time: `HH:MM:SS[.fff]`

use crate::config::{EntitySchema, FieldDef, FieldKind};
use crate::error::AppError;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

const DATE_FORMAT: &str = "%Y-%m-%d";
const NAIVE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const TIME_FORMAT: &str = "%H:%M:%S%.f";

fn has_time_zone(field: &FieldDef) -> bool {
    let t = field.sql_type.to_lowercase();
    t == "timestamptz" || t.contains("with time zone")
}

/// Parse any accepted textual timestamp into a UTC instant.
fn parse_instant(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%#z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, fmt) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    parse_naive(s).map(|n| n.and_utc())
}

fn parse_naive(s: &str) -> Option<NaiveDateTime> {
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(s, DATE_FORMAT)
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    ["%H:%M:%S%.f", "%H:%M"]
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(s, fmt).ok())
}

/// Canonical string for a temporal value, or an error message.
pub fn normalize_temporal(field: &FieldDef, s: &str) -> Result<Value, String> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(Value::Null);
    }
    let now = Utc::now();
    let special = s.to_ascii_uppercase();
    let text = match field.kind {
        FieldKind::Date => {
            let date = if special == "CURRENT_DATE" || special == "CURRENT_TIMESTAMP" {
                Some(now.date_naive())
            } else {
                NaiveDate::parse_from_str(s, DATE_FORMAT)
                    .ok()
                    .or_else(|| parse_instant(s).map(|dt| dt.date_naive()))
            };
            date.map(|d| d.format(DATE_FORMAT).to_string())
        }
        FieldKind::DateTime => {
            let instant = if special == "CURRENT_TIMESTAMP" || special == "CURRENT_DATE" {
                Some(now)
            } else {
                parse_instant(s)
            };
            instant.map(|dt| {
                if has_time_zone(field) {
                    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
                } else {
                    dt.naive_utc().format(NAIVE_FORMAT).to_string()
                }
            })
        }
        FieldKind::Time => {
            let time = if special == "CURRENT_TIME" || special == "CURRENT_TIMESTAMP" {
                Some(now.time())
            } else {
                parse_time(s).or_else(|| parse_instant(s).map(|dt| dt.time()))
            };
            time.map(|t| t.format(TIME_FORMAT).to_string())
        }
        _ => return Ok(Value::String(s.to_string())),
    };
    text.map(Value::String)
        .ok_or_else(|| format!("'{}' is not a valid {}", s, field.sql_type))
}

/// Coerce a filter argument for `field`; arrays are coerced element-wise.
pub fn coerce_argument(field: &FieldDef, value: &Value) -> Result<Value, String> {
    if !field.kind.is_temporal() {
        return Ok(value.clone());
    }
    match value {
        Value::String(s) => normalize_temporal(field, s),
        Value::Array(items) => items
            .iter()
            .map(|v| coerce_argument(field, v))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

/// Replace string values of temporal fields in `data` with their canonical form.
pub fn strings_to_dates(entity: &EntitySchema, data: &mut Map<String, Value>) -> Result<(), AppError> {
    for field in entity.fields.iter().filter(|f| f.kind.is_temporal()) {
        if let Some(Value::String(s)) = data.get(&field.name) {
            let normalized = normalize_temporal(field, s).map_err(|msg| AppError::invalid(&field.name, msg))?;
            data.insert(field.name.clone(), normalized);
        }
    }
    Ok(())
}

/// Instant used to order and compare temporal values.
pub fn temporal_key(kind: FieldKind, s: &str) -> Option<NaiveDateTime> {
    match kind {
        FieldKind::Time => {
            let epoch = NaiveDate::from_ymd_opt(1970, 1, 1)?;
            parse_time(s).map(|t| epoch.and_time(t))
        }
        _ => parse_instant(s).map(|dt| dt.naive_utc()),
    }
}

/// Turn a path segment into a value typed like `field`.
pub fn parse_instance_id(field: &FieldDef, raw: &str) -> Result<Value, AppError> {
    let malformed = || AppError::MalformedRequest(format!("invalid identifier '{}' for {}", raw, field.name));
    match field.kind {
        FieldKind::Integer => raw.parse::<i64>().map(Value::from).map_err(|_| malformed()),
        FieldKind::Float | FieldKind::Numeric => raw
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number)
            .ok_or_else(malformed),
        FieldKind::Uuid => uuid::Uuid::parse_str(raw)
            .map(|u| Value::String(u.to_string()))
            .map_err(|_| malformed()),
        FieldKind::Boolean => raw.parse::<bool>().map(Value::Bool).map_err(|_| malformed()),
        kind if kind.is_temporal() => normalize_temporal(field, raw).map_err(|_| malformed()),
        _ => Ok(Value::String(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn field(kind: FieldKind, sql_type: &str) -> FieldDef {
        FieldDef {
            name: "f".into(),
            kind,
            sql_type: sql_type.into(),
            nullable: true,
            has_default: false,
        }
    }

    #[test]
    fn dates_and_timestamps() {
        let date = field(FieldKind::Date, "date");
        assert_eq!(normalize_temporal(&date, "2024-02-29").unwrap(), json!("2024-02-29"));
        assert_eq!(normalize_temporal(&date, "2024-02-29T10:00:00Z").unwrap(), json!("2024-02-29"));
        assert!(normalize_temporal(&date, "yesterday").is_err());

        let tz = field(FieldKind::DateTime, "timestamptz");
        assert_eq!(
            normalize_temporal(&tz, "2024-01-01T02:00:00+02:00").unwrap(),
            json!("2024-01-01T00:00:00Z")
        );
        let naive = field(FieldKind::DateTime, "timestamp");
        assert_eq!(
            normalize_temporal(&naive, "2024-01-01 08:30:00").unwrap(),
            json!("2024-01-01T08:30:00")
        );
    }

    #[test]
    fn empty_string_becomes_null() {
        assert_eq!(normalize_temporal(&field(FieldKind::Date, "date"), "").unwrap(), Value::Null);
    }

    #[test]
    fn current_keywords() {
        let v = normalize_temporal(&field(FieldKind::Date, "date"), "current_date").unwrap();
        assert_eq!(v, json!(Utc::now().date_naive().format(DATE_FORMAT).to_string()));
    }

    #[test]
    fn instance_ids() {
        let int = field(FieldKind::Integer, "int8");
        assert_eq!(parse_instance_id(&int, "42").unwrap(), json!(42));
        assert!(matches!(parse_instance_id(&int, "abc"), Err(AppError::MalformedRequest(_))));
        assert_eq!(parse_instance_id(&field(FieldKind::Text, "text"), "abc").unwrap(), json!("abc"));
    }

    #[test]
    fn temporal_keys_order_fractional_seconds() {
        let a = temporal_key(FieldKind::DateTime, "2024-01-01T00:00:00Z").unwrap();
        let b = temporal_key(FieldKind::DateTime, "2024-01-01T00:00:00.5Z").unwrap();
        assert!(a < b);
    }
}
