//! Raw declaration types matching the JSON model format.

use crate::config::resolved::Cardinality;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    pub entities: Vec<EntityConfig>,
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,
    #[serde(default)]
    pub schema: Option<String>,
    /// Table name; defaults to the entity name.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    pub fields: Vec<FieldConfig>,
    #[serde(default)]
    pub relations: Vec<RelationConfig>,
}

fn default_primary_key() -> String {
    "id".into()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub has_default: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelationConfig {
    pub name: String,
    pub target: String,
    pub cardinality: Cardinality,
    pub join: JoinConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JoinConfig {
    Owned {
        column: String,
    },
    Foreign {
        column: String,
    },
    Link {
        #[serde(default)]
        schema: Option<String>,
        table: String,
        local_column: String,
        remote_column: String,
    },
}

/// One exposed collection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceDecl {
    pub entity: String,
    pub collection_name: String,
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,
    #[serde(default)]
    pub include_columns: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_columns: Option<Vec<String>>,
    #[serde(default)]
    pub include_methods: Option<Vec<String>>,
    /// Dotted relation paths serialized beyond the default single level.
    #[serde(default)]
    pub expand: Vec<String>,
    #[serde(default)]
    pub results_per_page: Option<u64>,
    #[serde(default)]
    pub max_results_per_page: Option<u64>,
    /// Field used for instance lookups instead of the entity's primary key.
    #[serde(default)]
    pub primary_key: Option<String>,
}

fn default_methods() -> Vec<String> {
    vec!["GET".into()]
}

impl ResourceDecl {
    pub fn new(entity: &str, collection_name: &str) -> Self {
        ResourceDecl {
            entity: entity.to_string(),
            collection_name: collection_name.to_string(),
            methods: default_methods(),
            include_columns: None,
            exclude_columns: None,
            include_methods: None,
            expand: Vec::new(),
            results_per_page: None,
            max_results_per_page: None,
            primary_key: None,
        }
    }

    pub fn methods<I, S>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.methods = methods.into_iter().map(Into::into).collect();
        self
    }

    pub fn allows(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }
}

/// Process-level API settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiSettings {
    pub url_prefix: String,
    pub results_per_page: u64,
    pub max_results_per_page: u64,
    /// Answer every domain rejection with status 520.
    pub legacy_error_status: bool,
    pub max_body_bytes: usize,
}

impl Default for ApiSettings {
    fn default() -> Self {
        ApiSettings {
            url_prefix: "/api".into(),
            results_per_page: 10,
            max_results_per_page: 100,
            legacy_error_status: false,
            max_body_bytes: 2 * 1024 * 1024,
        }
    }
}
