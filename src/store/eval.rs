//! Plan evaluation over in-memory rows with SQL three-valued logic.

use crate::coerce;
use crate::config::{FieldDef, FieldKind, TableRef};
use crate::query::{Correlated, Direction, Operand, Predicate, QueryPlan};
use crate::store::Row;
use regex::RegexBuilder;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

pub(super) type TableRows = BTreeMap<TableRef, Vec<Row>>;

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// SQL comparison of two values of `kind`; `None` when either side is NULL or they are incomparable.
pub(super) fn compare(kind: FieldKind, a: &Value, b: &Value) -> Option<Ordering> {
    if a.is_null() || b.is_null() {
        return None;
    }
    match kind {
        FieldKind::Integer | FieldKind::Float | FieldKind::Numeric => number(a)?.partial_cmp(&number(b)?),
        FieldKind::Boolean => match (a, b) {
            (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
            _ => Some(text(a).cmp(&text(b))),
        },
        FieldKind::Date | FieldKind::DateTime | FieldKind::Time => {
            match (coerce::temporal_key(kind, &text(a)), coerce::temporal_key(kind, &text(b))) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => Some(text(a).cmp(&text(b))),
            }
        }
        FieldKind::Uuid => Some(text(a).to_lowercase().cmp(&text(b).to_lowercase())),
        FieldKind::Json => (a == b).then_some(Ordering::Equal),
        FieldKind::Text => Some(text(a).cmp(&text(b))),
    }
}

pub(super) fn equal(kind: FieldKind, a: &Value, b: &Value) -> bool {
    compare(kind, a, b) == Some(Ordering::Equal)
}

fn cell<'a>(row: &'a Row, field: &FieldDef) -> &'a Value {
    row.get(&field.name).unwrap_or(&Value::Null)
}

/// LIKE pattern → anchored regex. `\` escapes the next character.
fn like_matches(pattern: &str, subject: &str, case_insensitive: bool) -> Option<bool> {
    let mut re = String::from("^");
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            '\\' => {
                if let Some(next) = chars.next() {
                    re.push_str(&regex::escape(&next.to_string()));
                }
            }
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    let compiled = RegexBuilder::new(&re)
        .case_insensitive(case_insensitive)
        .dot_matches_new_line(true)
        .build()
        .ok()?;
    Some(compiled.is_match(subject))
}

fn and(values: impl Iterator<Item = Option<bool>>) -> Option<bool> {
    let mut unknown = false;
    for v in values {
        match v {
            Some(false) => return Some(false),
            None => unknown = true,
            Some(true) => {}
        }
    }
    if unknown { None } else { Some(true) }
}

fn or(values: impl Iterator<Item = Option<bool>>) -> Option<bool> {
    let mut unknown = false;
    for v in values {
        match v {
            Some(true) => return Some(true),
            None => unknown = true,
            Some(false) => {}
        }
    }
    if unknown { None } else { Some(false) }
}

pub(super) fn matches(tables: &TableRows, predicate: &Predicate, row: &Row) -> Option<bool> {
    match predicate {
        Predicate::And(parts) => and(parts.iter().map(|p| matches(tables, p, row))),
        Predicate::Or(parts) => or(parts.iter().map(|p| matches(tables, p, row))),
        Predicate::Not(inner) => matches(tables, inner, row).map(|b| !b),
        Predicate::Compare { field, op, operand } => {
            let rhs = match operand {
                Operand::Value(v) => v,
                Operand::Column(other) => cell(row, other),
            };
            compare(field.kind, cell(row, field), rhs).map(|o| op.holds(o))
        }
        Predicate::Null { field, negated } => Some(cell(row, field).is_null() != *negated),
        Predicate::In { field, values, negated } => {
            let lhs = cell(row, field);
            if lhs.is_null() {
                return if values.is_empty() { Some(*negated) } else { None };
            }
            let found = or(values.iter().map(|v| compare(field.kind, lhs, v).map(|o| o == Ordering::Equal)));
            found.map(|b| b != *negated)
        }
        Predicate::Like {
            field,
            pattern,
            case_insensitive,
            negated,
        } => {
            let lhs = cell(row, field);
            if lhs.is_null() {
                return None;
            }
            like_matches(pattern, &text(lhs), *case_insensitive).map(|b| b != *negated)
        }
        Predicate::Related(c) => Some(related_exists(tables, c, row)),
    }
}

fn related_exists(tables: &TableRows, c: &Correlated, row: &Row) -> bool {
    let outer = cell(row, &c.outer);
    if outer.is_null() {
        return false;
    }
    let keys: Vec<Value> = match &c.link {
        Some(link) => tables
            .get(&link.table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| equal(link.local.kind, cell(r, &link.local), outer))
                    .map(|r| cell(r, &link.remote).clone())
                    .collect()
            })
            .unwrap_or_default(),
        None => vec![outer.clone()],
    };
    let Some(targets) = tables.get(&c.target) else {
        return false;
    };
    targets.iter().any(|t| {
        let key = cell(t, &c.inner);
        keys.iter().any(|k| equal(c.inner.kind, key, k))
            && c.predicate
                .as_ref()
                .map_or(true, |p| matches(tables, p, t) == Some(true))
    })
}

/// NULLs sort last ascending and first descending.
fn order(kind: FieldKind, a: &Value, b: &Value, direction: Direction) -> Ordering {
    let natural = match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => compare(kind, a, b).unwrap_or(Ordering::Equal),
    };
    match direction {
        Direction::Asc => natural,
        Direction::Desc => natural.reverse(),
    }
}

/// Indices of the rows of `plan.table` the plan yields, in result order.
pub(super) fn select_indices(tables: &TableRows, plan: &QueryPlan) -> Vec<usize> {
    let Some(rows) = tables.get(&plan.table) else {
        return Vec::new();
    };
    let mut selected: Vec<usize> = (0..rows.len())
        .filter(|&i| match &plan.predicate {
            Some(p) => matches(tables, p, &rows[i]) == Some(true),
            None => true,
        })
        .collect();

    if !plan.group_by.is_empty() {
        let mut seen: Vec<Vec<&Value>> = Vec::new();
        selected.retain(|&i| {
            let key: Vec<&Value> = plan.group_by.iter().map(|f| cell(&rows[i], f)).collect();
            let duplicate = seen.iter().any(|k| {
                k.iter()
                    .zip(&key)
                    .zip(&plan.group_by)
                    .all(|((a, b), f)| (a.is_null() && b.is_null()) || equal(f.kind, a, b))
            });
            if !duplicate {
                seen.push(key);
            }
            !duplicate
        });
    }

    if !plan.order_by.is_empty() {
        selected.sort_by(|&a, &b| {
            plan.order_by
                .iter()
                .map(|(f, d)| order(f.kind, cell(&rows[a], f), cell(&rows[b], f), *d))
                .find(|o| *o != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
    }

    let offset = plan.offset.unwrap_or(0) as usize;
    let limit = plan.limit.map(|l| l as usize).unwrap_or(usize::MAX);
    selected.into_iter().skip(offset).take(limit).collect()
}

pub(super) fn project(row: &Row, columns: &[FieldDef]) -> Row {
    columns
        .iter()
        .map(|f| (f.name.clone(), cell(row, f).clone()))
        .collect()
}
