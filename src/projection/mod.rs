//! Projection engine: loaded records → JSON under include/exclude rules.

mod loader;

pub use loader::{load, load_one, Deep};

use crate::config::{EntitySchema, ResourceDecl, SchemaRegistry};
use crate::error::ConfigError;
use crate::store::Row;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// A row plus whichever relations were loaded for it.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub entity: String,
    pub row: Row,
    pub related: BTreeMap<String, Related>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Related {
    One(Option<Box<Record>>),
    Many(Vec<Record>),
}

impl Record {
    pub fn new(entity: &str, row: Row) -> Self {
        Record {
            entity: entity.to_string(),
            row,
            related: BTreeMap::new(),
        }
    }

    pub fn get(&self, field: &str) -> &Value {
        self.row.get(field).unwrap_or(&Value::Null)
    }
}

/// Column and relation selection for one level of serialization.
///
/// Dotted names (`relation.field`) select inside a relation. With include
/// rules a dotted name counts only when its relation is itself included;
/// with exclude rules it counts only when the relation is not excluded whole.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProjectionRules {
    pub include_columns: Option<BTreeSet<String>>,
    pub include_relations: BTreeMap<String, Vec<String>>,
    pub exclude_columns: Option<BTreeSet<String>>,
    pub exclude_relations: BTreeMap<String, Vec<String>>,
    pub include_methods: Vec<String>,
}

fn split_dotted(names: &[String]) -> (BTreeSet<String>, Vec<(String, String)>) {
    let mut columns = BTreeSet::new();
    let mut dotted = Vec::new();
    for name in names {
        match name.split_once('.') {
            Some((relation, field)) => dotted.push((relation.to_string(), field.to_string())),
            None => {
                columns.insert(name.clone());
            }
        }
    }
    (columns, dotted)
}

impl ProjectionRules {
    /// No restrictions.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(
        include: Option<&[String]>,
        exclude: Option<&[String]>,
        methods: Option<&[String]>,
    ) -> Result<Self, ConfigError> {
        let mut rules = ProjectionRules::default();
        match (include, exclude) {
            (Some(_), Some(_)) => return Err(ConfigError::IncludeAndExclude),
            (Some(names), None) => {
                let (mut columns, dotted) = split_dotted(names);
                for (relation, field) in dotted {
                    if columns.contains(&relation) {
                        rules.include_relations.entry(relation).or_default().push(field);
                    }
                }
                for relation in rules.include_relations.keys() {
                    columns.remove(relation);
                }
                rules.include_columns = Some(columns);
            }
            (None, Some(names)) => {
                let (columns, dotted) = split_dotted(names);
                for (relation, field) in dotted {
                    if !columns.contains(&relation) {
                        rules.exclude_relations.entry(relation).or_default().push(field);
                    }
                }
                rules.exclude_columns = Some(columns);
            }
            (None, None) => {}
        }
        rules.include_methods = methods.map(<[String]>::to_vec).unwrap_or_default();
        Ok(rules)
    }

    pub fn from_decl(decl: &ResourceDecl) -> Result<Self, ConfigError> {
        Self::new(
            decl.include_columns.as_deref(),
            decl.exclude_columns.as_deref(),
            decl.include_methods.as_deref(),
        )
    }

    fn allows_column(&self, name: &str) -> bool {
        if let Some(include) = &self.include_columns {
            return include.contains(name);
        }
        if let Some(exclude) = &self.exclude_columns {
            return !exclude.contains(name);
        }
        true
    }

    pub fn allows_relation(&self, name: &str) -> bool {
        if let Some(include) = &self.include_columns {
            return include.contains(name) || self.include_relations.contains_key(name);
        }
        if let Some(exclude) = &self.exclude_columns {
            return !exclude.contains(name);
        }
        true
    }

    /// Rules applied to the records of relation `name`.
    pub fn for_relation(&self, name: &str) -> ProjectionRules {
        let mut rules = ProjectionRules::default();
        if let Some(fields) = self.include_relations.get(name) {
            let (columns, _) = split_dotted(fields);
            rules.include_columns = Some(columns);
        } else if let Some(fields) = self.exclude_relations.get(name) {
            let (columns, _) = split_dotted(fields);
            rules.exclude_columns = Some(columns);
        }
        rules.include_methods = self
            .include_methods
            .iter()
            .filter_map(|m| m.split_once('.'))
            .filter(|(relation, _)| *relation == name)
            .map(|(_, method)| method.to_string())
            .collect();
        rules
    }

    /// Relations loaded by default: every surviving relation, one level deep,
    /// plus the dotted `expand` paths.
    pub fn deep(&self, entity: &EntitySchema, expand: &[String]) -> Deep {
        let mut deep = Deep::default();
        for name in entity.relation_names().filter(|r| self.allows_relation(r)) {
            deep.relations.entry(name.to_string()).or_default();
        }
        for path in expand {
            deep.add_path(path);
        }
        deep
    }
}

/// Custom rendering of a record, replacing the rule-driven projection.
pub trait Serializer: Send + Sync {
    fn serialize(&self, record: &Record) -> Value;
}

/// JSON object for `record` under `rules`. Relations appear only if loaded.
pub fn serialize(registry: &SchemaRegistry, record: &Record, rules: &ProjectionRules) -> Value {
    let mut out = Map::new();
    for (name, value) in &record.row {
        if rules.allows_column(name) {
            out.insert(name.clone(), value.clone());
        }
    }
    for (name, related) in &record.related {
        if !rules.allows_relation(name) {
            continue;
        }
        let sub = rules.for_relation(name);
        let value = match related {
            Related::One(None) => Value::Null,
            Related::One(Some(child)) => serialize(registry, child, &sub),
            Related::Many(children) => Value::Array(children.iter().map(|c| serialize(registry, c, &sub)).collect()),
        };
        out.insert(name.clone(), value);
    }
    if let Some(entity) = registry.get(&record.entity) {
        for method in rules.include_methods.iter().filter(|m| !m.contains('.')) {
            if let Some(f) = entity.methods.get(method) {
                out.insert(method.clone(), f(record));
            }
        }
    }
    Value::Object(out)
}
