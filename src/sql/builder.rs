//! Renders query plans and row mutations as parameterized PostgreSQL.
//! Identifiers come from the schema registry only; values are always bound.

use crate::config::{FieldDef, FieldKind, LinkTable, TableRef};
use crate::query::{Direction, Operand, Predicate, QueryPlan};
use serde_json::{Map, Value};

/// Quote identifier for PostgreSQL (safe: only from config).
fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

/// Full qualified table name.
fn qualified_table(table: &TableRef) -> String {
    match &table.schema {
        Some(schema) => format!("{}.{}", quoted(schema), quoted(&table.name)),
        None => quoted(&table.name),
    }
}

fn column(alias: &str, field: &FieldDef) -> String {
    format!("{}.{}", alias, quoted(&field.name))
}

#[derive(Debug)]
pub struct QueryBuf {
    pub sql: String,
    pub params: Vec<Value>,
}

impl QueryBuf {
    fn new() -> Self {
        QueryBuf {
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push_param(&mut self, v: Value) -> u32 {
        let n = self.params.len() as u32 + 1;
        self.params.push(v);
        n
    }

    /// Bind `v` and return its placeholder cast to the column type.
    fn placeholder(&mut self, sql_type: &str, v: Value) -> String {
        let n = self.push_param(v);
        format!("${}::{}", n, sql_type)
    }
}

/// Custom enum (schema.typename) and numeric columns are read back as text.
fn select_expr(alias: &str, field: &FieldDef) -> String {
    let c = column(alias, field);
    if field.sql_type.contains('.') || field.kind == FieldKind::Numeric {
        format!("{}::text AS {}", c, quoted(&field.name))
    } else {
        c
    }
}

fn returning_list(columns: &[FieldDef]) -> String {
    columns
        .iter()
        .map(|f| {
            let q = quoted(&f.name);
            if f.sql_type.contains('.') || f.kind == FieldKind::Numeric {
                format!("{}::text AS {}", q, q)
            } else {
                q
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn alias(depth: usize) -> String {
    format!("t{}", depth)
}

fn render_predicate(q: &mut QueryBuf, p: &Predicate, depth: usize) -> String {
    let a = alias(depth);
    match p {
        Predicate::And(parts) if parts.is_empty() => "TRUE".into(),
        Predicate::Or(parts) if parts.is_empty() => "FALSE".into(),
        Predicate::And(parts) | Predicate::Or(parts) => {
            let sep = if matches!(p, Predicate::And(_)) { " AND " } else { " OR " };
            let rendered: Vec<String> = parts
                .iter()
                .map(|part| format!("({})", render_predicate(q, part, depth)))
                .collect();
            rendered.join(sep)
        }
        Predicate::Not(inner) => format!("NOT ({})", render_predicate(q, inner, depth)),
        Predicate::Compare { field, op, operand } => {
            let rhs = match operand {
                Operand::Value(v) => q.placeholder(&field.sql_type, v.clone()),
                Operand::Column(other) => column(&a, other),
            };
            format!("{} {} {}", column(&a, field), op.sql(), rhs)
        }
        Predicate::Null { field, negated } => format!(
            "{} IS {}NULL",
            column(&a, field),
            if *negated { "NOT " } else { "" }
        ),
        Predicate::In { values, negated, .. } if values.is_empty() => {
            if *negated { "TRUE".into() } else { "FALSE".into() }
        }
        Predicate::In { field, values, negated } => {
            let placeholders: Vec<String> = values
                .iter()
                .map(|v| q.placeholder(&field.sql_type, v.clone()))
                .collect();
            format!(
                "{} {}IN ({})",
                column(&a, field),
                if *negated { "NOT " } else { "" },
                placeholders.join(", ")
            )
        }
        Predicate::Like {
            field,
            pattern,
            case_insensitive,
            negated,
        } => {
            let lhs = if field.kind == FieldKind::Text {
                column(&a, field)
            } else {
                format!("{}::text", column(&a, field))
            };
            let keyword = if *case_insensitive { "ILIKE" } else { "LIKE" };
            format!(
                "{} {}{} {}",
                lhs,
                if *negated { "NOT " } else { "" },
                keyword,
                q.placeholder("text", Value::String(pattern.clone()))
            )
        }
        Predicate::Related(c) => {
            let inner = alias(depth + 1);
            let mut sql = format!("EXISTS (SELECT 1 FROM {} {}", qualified_table(&c.target), inner);
            match &c.link {
                Some(link) => {
                    let l = format!("l{}", depth + 1);
                    sql.push_str(&format!(
                        " JOIN {} {} ON {} = {} WHERE {} = {}",
                        qualified_table(&link.table),
                        l,
                        column(&l, &link.remote),
                        column(&inner, &c.inner),
                        column(&l, &link.local),
                        column(&a, &c.outer)
                    ));
                }
                None => sql.push_str(&format!(" WHERE {} = {}", column(&inner, &c.inner), column(&a, &c.outer))),
            }
            if let Some(pred) = &c.predicate {
                let rendered = render_predicate(q, pred, depth + 1);
                sql.push_str(&format!(" AND ({})", rendered));
            }
            sql.push(')');
            sql
        }
    }
}

/// FROM, WHERE, GROUP BY, ORDER BY, LIMIT and OFFSET of `plan` at `depth`.
fn render_tail(q: &mut QueryBuf, plan: &QueryPlan, depth: usize, with_order: bool) -> String {
    let a = alias(depth);
    let mut sql = format!(" FROM {} {}", qualified_table(&plan.table), a);
    if let Some(p) = &plan.predicate {
        let rendered = render_predicate(q, p, depth);
        sql.push_str(&format!(" WHERE {}", rendered));
    }
    if !plan.group_by.is_empty() {
        let cols: Vec<String> = plan.group_by.iter().map(|f| column(&a, f)).collect();
        sql.push_str(&format!(" GROUP BY {}", cols.join(", ")));
    }
    if with_order && !plan.order_by.is_empty() {
        let cols: Vec<String> = plan
            .order_by
            .iter()
            .map(|(f, d)| {
                let dir = match d {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                format!("{} {}", column(&a, f), dir)
            })
            .collect();
        sql.push_str(&format!(" ORDER BY {}", cols.join(", ")));
    }
    if let Some(n) = plan.limit {
        sql.push_str(&format!(" LIMIT {}", n));
    }
    if let Some(n) = plan.offset {
        sql.push_str(&format!(" OFFSET {}", n.min(crate::query::plan::MAX_OFFSET)));
    }
    sql
}

/// SELECT every plan column.
pub fn select(plan: &QueryPlan) -> QueryBuf {
    let mut q = QueryBuf::new();
    let a = alias(0);
    let cols: Vec<String> = plan.columns.iter().map(|f| select_expr(&a, f)).collect();
    let tail = render_tail(&mut q, plan, 0, true);
    q.sql = format!("SELECT {}{}", cols.join(", "), tail);
    q
}

/// Number of rows the plan yields (limit and offset included).
pub fn count(plan: &QueryPlan) -> QueryBuf {
    let mut q = QueryBuf::new();
    let tail = render_tail(&mut q, plan, 0, false);
    q.sql = format!("SELECT COUNT(*) AS \"count\" FROM (SELECT 1{}) counted", tail);
    q
}

/// WHERE clause selecting the plan's rows in an UPDATE/DELETE target aliased `t0`.
fn restriction(q: &mut QueryBuf, plan: &QueryPlan) -> String {
    let windowed = plan.limit.is_some() || plan.offset.is_some() || !plan.group_by.is_empty();
    match (&plan.primary_key, windowed) {
        (Some(pk), true) => {
            let inner = alias(1);
            let tail = render_tail(q, plan, 1, true);
            format!(" WHERE {} IN (SELECT {}{})", column(&alias(0), pk), column(&inner, pk), tail)
        }
        _ => match &plan.predicate {
            Some(p) => format!(" WHERE {}", render_predicate(q, p, 0)),
            None => String::new(),
        },
    }
}

/// INSERT the columns present in `row`; absent columns take the database default.
pub fn insert(table: &TableRef, columns: &[FieldDef], row: &Map<String, Value>) -> QueryBuf {
    let mut q = QueryBuf::new();
    let mut cols = Vec::new();
    let mut placeholders = Vec::new();
    for c in columns {
        let Some(val) = row.get(&c.name) else { continue };
        placeholders.push(q.placeholder(&c.sql_type, val.clone()));
        cols.push(quoted(&c.name));
    }
    let returning = returning_list(columns);
    q.sql = if cols.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES RETURNING {}", qualified_table(table), returning)
    } else {
        format!(
            "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
            qualified_table(table),
            cols.join(", "),
            placeholders.join(", "),
            returning
        )
    };
    q
}

/// UPDATE the plan's rows, setting each (column, value) pair.
pub fn update(plan: &QueryPlan, values: &[(FieldDef, Value)]) -> QueryBuf {
    let mut q = QueryBuf::new();
    let sets: Vec<String> = values
        .iter()
        .map(|(f, v)| format!("{} = {}", quoted(&f.name), q.placeholder(&f.sql_type, v.clone())))
        .collect();
    let where_clause = restriction(&mut q, plan);
    q.sql = format!(
        "UPDATE {} AS {} SET {}{}",
        qualified_table(&plan.table),
        alias(0),
        sets.join(", "),
        where_clause
    );
    q
}

pub fn delete(plan: &QueryPlan) -> QueryBuf {
    let mut q = QueryBuf::new();
    let where_clause = restriction(&mut q, plan);
    q.sql = format!("DELETE FROM {} AS {}{}", qualified_table(&plan.table), alias(0), where_clause);
    q
}

/// Insert a link row unless the pair is already linked.
pub fn insert_link(link: &LinkTable, local: &Value, remote: &Value) -> QueryBuf {
    let mut q = QueryBuf::new();
    let l = q.placeholder(&link.local.sql_type, local.clone());
    let r = q.placeholder(&link.remote.sql_type, remote.clone());
    let table = qualified_table(&link.table);
    let (lc, rc) = (quoted(&link.local.name), quoted(&link.remote.name));
    q.sql = format!(
        "INSERT INTO {table} ({lc}, {rc}) SELECT {l}, {r} WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE {lc} = {l} AND {rc} = {r})"
    );
    q
}

/// Delete link rows of `local`, or only the pair with `remote` when given.
pub fn delete_links(link: &LinkTable, local: &Value, remote: Option<&Value>) -> QueryBuf {
    let mut q = QueryBuf::new();
    let l = q.placeholder(&link.local.sql_type, local.clone());
    let mut sql = format!(
        "DELETE FROM {} WHERE {} = {}",
        qualified_table(&link.table),
        quoted(&link.local.name),
        l
    );
    if let Some(remote) = remote {
        let r = q.placeholder(&link.remote.sql_type, remote.clone());
        sql.push_str(&format!(" AND {} = {}", quoted(&link.remote.name), r));
    }
    q.sql = sql;
    q
}
