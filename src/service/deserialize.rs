//! Turning a POST body into a stored row.

use crate::config::{EntitySchema, SchemaRegistry};
use crate::error::AppError;
use crate::service::relations;
use crate::store::{Row, Session};
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Builds and stores a new row (with its relations) from a request body.
#[async_trait]
pub trait Deserializer: Send + Sync {
    async fn deserialize(
        &self,
        session: &mut dyn Session,
        registry: &SchemaRegistry,
        entity: &EntitySchema,
        data: Map<String, Value>,
    ) -> Result<Row, AppError>;
}

/// Field-by-field construction: unknown keys are rejected, temporal strings are
/// parsed, to-one relations held by this entity are resolved before the insert
/// and the rest are attached afterwards.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultDeserializer;

#[async_trait]
impl Deserializer for DefaultDeserializer {
    async fn deserialize(
        &self,
        session: &mut dyn Session,
        registry: &SchemaRegistry,
        entity: &EntitySchema,
        data: Map<String, Value>,
    ) -> Result<Row, AppError> {
        let (mut scalars, relations) = relations::split_payload(entity, &data)?;
        let remaining = relations::resolve_owned(&mut *session, registry, &mut scalars, relations).await?;
        let row = session.insert(entity, &scalars).await?;

        let deferred: Map<String, Value> = remaining
            .into_iter()
            .map(|(relation, value)| (relation.name.clone(), value))
            .collect();
        if !deferred.is_empty() {
            let parents = [row];
            relations::apply_relations(&mut *session, registry, entity, &parents, &deferred).await?;
            let [row] = parents;
            return Ok(row);
        }
        Ok(row)
    }
}
