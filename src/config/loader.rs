//! Load declarations from JSON and resolve them into a schema registry.

use crate::config::resolved::{
    EntitySchema, FieldDef, FieldKind, Join, LinkTable, RelationDef, SchemaRegistry, TableRef,
};
use crate::config::types::*;
use crate::config::validate;
use crate::error::ConfigError;
use std::collections::BTreeMap;
use std::path::Path;

/// Build the schema registry from declarations (validates first).
pub fn resolve(config: &ModelConfig) -> Result<SchemaRegistry, ConfigError> {
    validate(config)?;

    let mut entities = BTreeMap::new();
    for e in &config.entities {
        let fields: Vec<FieldDef> = e
            .fields
            .iter()
            .map(|f| {
                let kind = FieldKind::from_sql_type(&f.type_)
                    .ok_or_else(|| ConfigError::UnknownFieldType(f.type_.clone()))?;
                Ok(FieldDef {
                    name: f.name.clone(),
                    kind,
                    sql_type: f.type_.clone(),
                    nullable: f.nullable,
                    has_default: f.has_default,
                })
            })
            .collect::<Result<_, ConfigError>>()?;
        let pk_index = fields
            .iter()
            .position(|f| f.name == e.primary_key)
            .ok_or_else(|| ConfigError::InvalidPrimaryKey {
                entity: e.name.clone(),
                column: e.primary_key.clone(),
            })?;
        let table = TableRef::new(e.schema.as_deref(), e.table.as_deref().unwrap_or(&e.name));
        entities.insert(
            e.name.clone(),
            EntitySchema {
                name: e.name.clone(),
                table,
                primary_key: e.primary_key.clone(),
                fields,
                relations: Vec::new(),
                methods: BTreeMap::new(),
                pk_index,
            },
        );
    }

    // Relations need every entity's primary key, so they resolve in a second pass.
    for e in &config.entities {
        let mut relations = Vec::with_capacity(e.relations.len());
        for r in &e.relations {
            let join = match &r.join {
                JoinConfig::Owned { column } => Join::Owned { column: column.clone() },
                JoinConfig::Foreign { column } => Join::Foreign { column: column.clone() },
                JoinConfig::Link {
                    schema,
                    table,
                    local_column,
                    remote_column,
                } => {
                    let local_pk = entities[&e.name].pk_field().clone();
                    let remote_pk = entities
                        .get(&r.target)
                        .map(|t| t.pk_field().clone())
                        .ok_or_else(|| ConfigError::MissingReference {
                            kind: "relation target",
                            id: r.target.clone(),
                        })?;
                    let schema = schema.as_deref().or(e.schema.as_deref());
                    Join::Link(LinkTable {
                        table: TableRef::new(schema, table),
                        local: link_column(local_column, &local_pk),
                        remote: link_column(remote_column, &remote_pk),
                    })
                }
            };
            relations.push(RelationDef {
                name: r.name.clone(),
                cardinality: r.cardinality,
                target: r.target.clone(),
                join,
            });
        }
        if let Some(entity) = entities.get_mut(&e.name) {
            entity.relations = relations;
        }
    }

    Ok(SchemaRegistry { entities })
}

fn link_column(name: &str, referenced: &FieldDef) -> FieldDef {
    FieldDef {
        name: name.to_string(),
        kind: referenced.kind,
        sql_type: referenced.sql_type.clone(),
        nullable: false,
        has_default: false,
    }
}

/// Read a model declaration file.
pub async fn load_from_path(path: impl AsRef<Path>) -> Result<ModelConfig, ConfigError> {
    let path = path.as_ref();
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConfigError::Load(format!("{}: {}", path.display(), e)))?;
    parse_model(&text)
}

pub fn parse_model(text: &str) -> Result<ModelConfig, ConfigError> {
    serde_json::from_str(text).map_err(|e| ConfigError::Load(e.to_string()))
}

impl ApiSettings {
    /// Defaults overridden by `RESTGEN_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = ApiSettings::default();
        if let Ok(prefix) = std::env::var("RESTGEN_URL_PREFIX") {
            settings.url_prefix = prefix;
        }
        if let Some(n) = env_number("RESTGEN_RESULTS_PER_PAGE")? {
            settings.results_per_page = n;
        }
        if let Some(n) = env_number("RESTGEN_MAX_RESULTS_PER_PAGE")? {
            settings.max_results_per_page = n;
        }
        if let Some(n) = env_number("RESTGEN_MAX_BODY_BYTES")? {
            settings.max_body_bytes = usize::try_from(n).unwrap_or(usize::MAX);
        }
        if let Ok(v) = std::env::var("RESTGEN_LEGACY_STATUS") {
            settings.legacy_error_status = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        Ok(settings)
    }
}

fn env_number(key: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Validation(format!("{} must be a non-negative integer", key))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::resolved::Cardinality;

    const MODEL: &str = r#"{
        "entities": [
            {"name": "person", "schema": "app", "table": "people", "fields": [
                {"name": "id", "type": "int8", "nullable": false, "has_default": true},
                {"name": "name", "type": "text"},
                {"name": "birth_date", "type": "date"}
            ], "relations": [
                {"name": "tags", "target": "tag", "cardinality": "to_many",
                 "join": {"kind": "link", "table": "person_tags", "local_column": "person_id", "remote_column": "tag_id"}}
            ]},
            {"name": "tag", "primary_key": "slug", "fields": [
                {"name": "slug", "type": "text", "nullable": false}
            ]}
        ]
    }"#;

    #[test]
    fn resolves_tables_and_link_columns() {
        let registry = resolve(&parse_model(MODEL).unwrap()).unwrap();
        let person = registry.get("person").unwrap();
        assert_eq!(person.table.to_string(), "app.people");
        assert_eq!(person.pk_field().kind, FieldKind::Integer);
        assert_eq!(person.field("birth_date").unwrap().kind, FieldKind::Date);

        let tags = person.relation("tags").unwrap();
        assert_eq!(tags.cardinality, Cardinality::ToMany);
        match &tags.join {
            Join::Link(link) => {
                assert_eq!(link.table.to_string(), "app.person_tags");
                assert_eq!(link.local.kind, FieldKind::Integer);
                assert_eq!(link.remote.kind, FieldKind::Text);
            }
            other => panic!("unexpected join {:?}", other),
        }
        assert_eq!(registry.get("tag").unwrap().table.to_string(), "tag");
    }

    #[test]
    fn methods_cannot_shadow_fields() {
        let registry = resolve(&parse_model(MODEL).unwrap()).unwrap();
        let err = registry.with_method("person", "name", |_| serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, ConfigError::NameClash { .. }));
    }
}
