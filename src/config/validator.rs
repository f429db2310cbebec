//! Declaration validation: referential integrity and API consistency.

use crate::config::resolved::{Cardinality, FieldKind};
use crate::config::{JoinConfig, ModelConfig};
use crate::error::ConfigError;
use std::collections::{HashMap, HashSet};

pub fn validate(config: &ModelConfig) -> Result<(), ConfigError> {
    let mut entity_fields: HashMap<&str, HashSet<&str>> = HashMap::new();
    for e in &config.entities {
        let mut fields = HashSet::new();
        for f in &e.fields {
            if FieldKind::from_sql_type(&f.type_).is_none() {
                return Err(ConfigError::UnknownFieldType(f.type_.clone()));
            }
            if !fields.insert(f.name.as_str()) {
                return Err(ConfigError::NameClash {
                    entity: e.name.clone(),
                    name: f.name.clone(),
                });
            }
        }
        if !fields.contains(e.primary_key.as_str()) {
            return Err(ConfigError::InvalidPrimaryKey {
                entity: e.name.clone(),
                column: e.primary_key.clone(),
            });
        }
        if entity_fields.insert(e.name.as_str(), fields).is_some() {
            return Err(ConfigError::Validation(format!("entity '{}' declared twice", e.name)));
        }
    }

    for e in &config.entities {
        let fields = &entity_fields[e.name.as_str()];
        let mut relation_names = HashSet::new();
        for r in &e.relations {
            if fields.contains(r.name.as_str()) || !relation_names.insert(r.name.as_str()) {
                return Err(ConfigError::NameClash {
                    entity: e.name.clone(),
                    name: r.name.clone(),
                });
            }
            let target_fields = entity_fields
                .get(r.target.as_str())
                .ok_or_else(|| ConfigError::MissingReference {
                    kind: "relation target",
                    id: r.target.clone(),
                })?;
            let fits = match (&r.join, r.cardinality) {
                (JoinConfig::Owned { column }, Cardinality::ToOne) => fields.contains(column.as_str()),
                (JoinConfig::Owned { .. }, Cardinality::ToMany) => false,
                (JoinConfig::Foreign { column }, _) => target_fields.contains(column.as_str()),
                (JoinConfig::Link { .. }, Cardinality::ToMany) => true,
                (JoinConfig::Link { .. }, Cardinality::ToOne) => false,
            };
            if !fits {
                return Err(ConfigError::InvalidJoin {
                    entity: e.name.clone(),
                    relation: r.name.clone(),
                });
            }
        }
    }

    let mut collections = HashSet::new();
    for res in &config.resources {
        let fields = entity_fields
            .get(res.entity.as_str())
            .ok_or_else(|| ConfigError::MissingReference {
                kind: "entity",
                id: res.entity.clone(),
            })?;
        if res.include_columns.is_some() && res.exclude_columns.is_some() {
            return Err(ConfigError::IncludeAndExclude);
        }
        if let Some(pk) = &res.primary_key {
            if !fields.contains(pk.as_str()) {
                return Err(ConfigError::InvalidPrimaryKey {
                    entity: res.entity.clone(),
                    column: pk.clone(),
                });
            }
        }
        if res.collection_name.is_empty() || res.collection_name.contains('/') {
            return Err(ConfigError::Validation(format!(
                "collection name '{}' is not valid",
                res.collection_name
            )));
        }
        if !collections.insert(res.collection_name.as_str()) {
            return Err(ConfigError::DuplicateCollection(res.collection_name.clone()));
        }
    }

    Ok(())
}
