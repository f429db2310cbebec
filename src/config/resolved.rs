//! Resolved schema: declarations validated and flattened into typed lookup tables.
//! Consulted by the query builder, projection and relation code instead of runtime reflection.

use crate::error::ConfigError;
use crate::projection::Record;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Value category of a scalar column; drives coercion, comparison and SQL casts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Float,
    Numeric,
    Text,
    Boolean,
    Date,
    DateTime,
    Time,
    Uuid,
    Json,
}

impl FieldKind {
    /// Map a PostgreSQL type name (as written in declarations) to a kind.
    /// Schema-qualified names (custom enums) are treated as text.
    pub fn from_sql_type(sql_type: &str) -> Option<Self> {
        let t = sql_type.trim().to_lowercase();
        if t.contains('.') {
            return Some(FieldKind::Text);
        }
        let base = t.split('(').next().unwrap_or("").trim();
        Some(match base {
            "int" | "int2" | "int4" | "int8" | "integer" | "smallint" | "bigint" | "serial" | "bigserial" => {
                FieldKind::Integer
            }
            "float4" | "float8" | "real" | "double precision" => FieldKind::Float,
            "numeric" | "decimal" => FieldKind::Numeric,
            "text" | "varchar" | "character varying" | "char" | "character" | "citext" => FieldKind::Text,
            "bool" | "boolean" => FieldKind::Boolean,
            "date" => FieldKind::Date,
            "timestamp" | "timestamptz" | "timestamp with time zone" | "timestamp without time zone" => {
                FieldKind::DateTime
            }
            "time" | "timetz" => FieldKind::Time,
            "uuid" => FieldKind::Uuid,
            "json" | "jsonb" => FieldKind::Json,
            _ => return None,
        })
    }

    pub fn is_temporal(self) -> bool {
        matches!(self, FieldKind::Date | FieldKind::DateTime | FieldKind::Time)
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, FieldKind::Integer | FieldKind::Float | FieldKind::Numeric)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldDef {
    pub name: String,
    pub kind: FieldKind,
    /// PostgreSQL type used for parameter casts (e.g. "timestamptz").
    pub sql_type: String,
    pub nullable: bool,
    /// Whether the store fills the column when a value is not supplied.
    pub has_default: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    ToOne,
    ToMany,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: Option<&str>, name: &str) -> Self {
        TableRef {
            schema: schema.map(str::to_string),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(s) => write!(f, "{}.{}", s, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Association table for many-to-many relations.
#[derive(Clone, Debug, PartialEq)]
pub struct LinkTable {
    pub table: TableRef,
    /// Column referencing the owning entity's primary key.
    pub local: FieldDef,
    /// Column referencing the related entity's primary key.
    pub remote: FieldDef,
}

/// How two entities are joined.
#[derive(Clone, Debug, PartialEq)]
pub enum Join {
    /// This entity holds `column`, referencing the target primary key.
    Owned { column: String },
    /// The target holds `column`, referencing this entity's primary key.
    Foreign { column: String },
    Link(LinkTable),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RelationDef {
    pub name: String,
    pub cardinality: Cardinality,
    /// Name of the related entity.
    pub target: String,
    pub join: Join,
}

impl RelationDef {
    pub fn is_like_list(&self) -> bool {
        self.cardinality == Cardinality::ToMany
    }
}

/// A zero-argument derived value computed from a loaded record.
pub type DerivedField = Arc<dyn Fn(&Record) -> Value + Send + Sync>;

#[derive(Clone)]
pub struct EntitySchema {
    pub name: String,
    pub table: TableRef,
    pub primary_key: String,
    pub fields: Vec<FieldDef>,
    pub relations: Vec<RelationDef>,
    pub methods: BTreeMap<String, DerivedField>,
    pub(crate) pk_index: usize,
}

impl fmt::Debug for EntitySchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntitySchema")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("primary_key", &self.primary_key)
            .field("fields", &self.fields)
            .field("relations", &self.relations)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EntitySchema {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// True for scalar fields and relations alike.
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some() || self.relation(name).is_some()
    }

    pub fn pk_field(&self) -> &FieldDef {
        &self.fields[self.pk_index]
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    pub fn relation_names(&self) -> impl Iterator<Item = &str> {
        self.relations.iter().map(|r| r.name.as_str())
    }
}

/// Immutable table of all entities, built once at registration time.
#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    pub(crate) entities: BTreeMap<String, EntitySchema>,
}

impl SchemaRegistry {
    pub fn get(&self, name: &str) -> Option<&EntitySchema> {
        self.entities.get(name)
    }

    pub fn entity(&self, name: &str) -> Result<&EntitySchema, ConfigError> {
        self.get(name).ok_or_else(|| ConfigError::MissingReference {
            kind: "entity",
            id: name.to_string(),
        })
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntitySchema> {
        self.entities.values()
    }

    /// Attach a derived field to an entity. Must run before the registry is shared.
    pub fn with_method<F>(mut self, entity: &str, name: &str, method: F) -> Result<Self, ConfigError>
    where
        F: Fn(&Record) -> Value + Send + Sync + 'static,
    {
        let schema = self.entities.get_mut(entity).ok_or_else(|| ConfigError::MissingReference {
            kind: "entity",
            id: entity.to_string(),
        })?;
        if schema.has_field(name) {
            return Err(ConfigError::NameClash {
                entity: entity.to_string(),
                name: name.to_string(),
            });
        }
        schema.methods.insert(name.to_string(), Arc::new(method));
        Ok(self)
    }
}
