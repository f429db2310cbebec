//! Route assembly: one set of collection/instance/relation routes per registered resource.

mod common;

pub use common::common_routes;

use crate::config::{ApiSettings, ModelConfig, ResourceDecl, SchemaRegistry};
use crate::error::ConfigError;
use crate::handlers::resource::{self, Resource};
use crate::hooks::Hooks;
use crate::projection::Serializer;
use crate::service::{DefaultDeserializer, Deserializer};
use crate::store::Database;
use axum::routing::MethodRouter;
use axum::Router;
use std::collections::BTreeSet;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

const METHODS: [&str; 4] = ["GET", "POST", "PUT", "DELETE"];

/// A resource declaration plus its code-level collaborators.
pub struct ResourceSpec {
    pub decl: ResourceDecl,
    pub hooks: Hooks,
    pub serializer: Option<Arc<dyn Serializer>>,
    pub deserializer: Option<Arc<dyn Deserializer>>,
}

impl ResourceSpec {
    pub fn new(decl: ResourceDecl) -> Self {
        ResourceSpec {
            decl,
            hooks: Hooks::default(),
            serializer: None,
            deserializer: None,
        }
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn serializer(mut self, serializer: impl Serializer + 'static) -> Self {
        self.serializer = Some(Arc::new(serializer));
        self
    }

    pub fn deserializer(mut self, deserializer: impl Deserializer + 'static) -> Self {
        self.deserializer = Some(Arc::new(deserializer));
        self
    }
}

impl From<ResourceDecl> for ResourceSpec {
    fn from(decl: ResourceDecl) -> Self {
        ResourceSpec::new(decl)
    }
}

/// Owns everything shared by the generated APIs of one application.
pub struct ApiManager {
    settings: Arc<ApiSettings>,
    registry: Arc<SchemaRegistry>,
    db: Arc<dyn Database>,
    universal: Hooks,
    resources: Vec<Arc<Resource>>,
    names: BTreeSet<String>,
}

impl ApiManager {
    pub fn new(settings: ApiSettings, registry: SchemaRegistry, db: Arc<dyn Database>) -> Self {
        ApiManager {
            settings: Arc::new(settings),
            registry: Arc::new(registry),
            db,
            universal: Hooks::default(),
            resources: Vec::new(),
            names: BTreeSet::new(),
        }
    }

    /// Hooks run before each resource's own hooks. Applies to resources created afterwards.
    pub fn universal_hooks(mut self, hooks: Hooks) -> Self {
        self.universal = hooks;
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Register one collection. Names must be unique per manager.
    pub fn create_api(&mut self, spec: impl Into<ResourceSpec>) -> Result<&mut Self, ConfigError> {
        let spec = spec.into();
        let name = spec.decl.collection_name.clone();
        if self.names.contains(&name) {
            return Err(ConfigError::DuplicateCollection(name));
        }
        if let Some(bad) = spec
            .decl
            .methods
            .iter()
            .find(|m| !METHODS.iter().any(|k| k.eq_ignore_ascii_case(m)))
        {
            return Err(ConfigError::Validation(format!(
                "collection '{}': unsupported method '{}'",
                name, bad
            )));
        }
        let resource = Resource::new(
            self.settings.clone(),
            self.registry.clone(),
            self.db.clone(),
            spec.decl,
            spec.hooks.after(&self.universal),
            spec.serializer,
            spec.deserializer.unwrap_or_else(|| Arc::new(DefaultDeserializer)),
        )?;
        tracing::info!(collection = %name, entity = %resource.decl().entity, "registered collection");
        self.names.insert(name);
        self.resources.push(Arc::new(resource));
        Ok(self)
    }

    /// Register every resource declared in a model file.
    pub fn create_apis(&mut self, model: &ModelConfig) -> Result<&mut Self, ConfigError> {
        for decl in &model.resources {
            self.create_api(decl.clone())?;
        }
        Ok(self)
    }

    /// Collection routes under the URL prefix, common routes, body limit and request tracing.
    pub fn router(&self) -> Router {
        let prefix = self.settings.url_prefix.trim_end_matches('/');
        let mut app = Router::new();
        for res in &self.resources {
            app = app.merge(resource_routes(prefix, res.clone()));
        }
        app.merge(common_routes(self.db.clone())).layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(self.settings.max_body_bytes)),
        )
    }
}

fn resource_routes(prefix: &str, res: Arc<Resource>) -> Router {
    let decl = res.decl();
    let base = format!("{}/{}", prefix, decl.collection_name);
    let allowed = |m: &str| decl.allows(m);

    let mut collection: MethodRouter<Arc<Resource>> = MethodRouter::new();
    let mut instance: MethodRouter<Arc<Resource>> = MethodRouter::new();
    let mut relation: MethodRouter<Arc<Resource>> = MethodRouter::new();
    let mut related: MethodRouter<Arc<Resource>> = MethodRouter::new();
    if allowed("GET") {
        collection = collection.get(resource::get_collection);
        instance = instance.get(resource::get_instance);
        relation = relation.get(resource::get_relation);
        related = related.get(resource::get_related);
    }
    if allowed("POST") {
        collection = collection.post(resource::post_collection);
    }
    if allowed("PUT") {
        collection = collection.put(resource::put_collection);
        instance = instance.put(resource::put_instance);
    }
    if allowed("DELETE") {
        collection = collection.delete(resource::delete_collection);
        instance = instance.delete(resource::delete_instance);
        relation = relation.delete(resource::delete_relation);
        related = related.delete(resource::delete_related);
    }

    Router::new()
        .route(&base, collection)
        .route(&format!("{}/:instid", base), instance)
        .route(&format!("{}/:instid/:relation", base), relation)
        .route(&format!("{}/:instid/:relation/:relid", base), related)
        .with_state(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_model, resolve};
    use crate::store::MemoryDatabase;

    fn manager() -> ApiManager {
        let registry = resolve(
            &parse_model(
                r#"{"entities": [{"name": "person", "fields": [
                    {"name": "id", "type": "int8", "nullable": false, "has_default": true},
                    {"name": "name", "type": "text"}
                ]}]}"#,
            )
            .unwrap(),
        )
        .unwrap();
        ApiManager::new(ApiSettings::default(), registry, Arc::new(MemoryDatabase::new()))
    }

    #[test]
    fn duplicate_collection_is_rejected() {
        let mut m = manager();
        m.create_api(ResourceDecl::new("person", "people")).unwrap();
        let err = m.create_api(ResourceDecl::new("person", "people")).err().unwrap();
        assert!(matches!(err, ConfigError::DuplicateCollection(n) if n == "people"));
        m.create_api(ResourceDecl::new("person", "folks")).unwrap();
    }

    #[test]
    fn unknown_entity_and_method_are_rejected() {
        let mut m = manager();
        assert!(matches!(
            m.create_api(ResourceDecl::new("ghost", "ghosts")).err(),
            Some(ConfigError::MissingReference { .. })
        ));
        assert!(matches!(
            m.create_api(ResourceDecl::new("person", "people").methods(["GET", "PATCH"])).err(),
            Some(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn include_and_exclude_fail_at_registration() {
        let mut m = manager();
        let mut decl = ResourceDecl::new("person", "people");
        decl.include_columns = Some(vec!["name".into()]);
        decl.exclude_columns = Some(vec!["id".into()]);
        assert!(matches!(m.create_api(decl).err(), Some(ConfigError::IncludeAndExclude)));
    }
}
