//! Resource controller: decode, pre-hooks, execute, serialize, post-hooks, respond.
//!
//! A session is opened lazily on first database access, so a request answered
//! by a pre-hook never touches the store.

use crate::coerce;
use crate::config::{ApiSettings, EntitySchema, FieldDef, ResourceDecl, SchemaRegistry};
use crate::error::{AppError, ConfigError, QueryError};
use crate::extractors::RequestInfo;
use crate::handlers::pagination::{link_header, PageRequest};
use crate::hooks::{HookContext, Hooks, Phase, Stage};
use crate::projection::{self, Deep, ProjectionRules, Record, Related, Serializer};
use crate::query::{self, Predicate, QueryPlan, SearchParams};
use crate::response::{json_with_headers, to_value, NumDeleted, NumModified, Page};
use crate::service::{relations, Deserializer};
use crate::store::{keys_equal, Database, Row, Session};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::Response,
};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Immutable per-collection state shared by every request to it.
pub struct Resource {
    settings: Arc<ApiSettings>,
    registry: Arc<SchemaRegistry>,
    db: Arc<dyn Database>,
    decl: ResourceDecl,
    rules: ProjectionRules,
    deep: Deep,
    hooks: Hooks,
    serializer: Option<Arc<dyn Serializer>>,
    deserializer: Arc<dyn Deserializer>,
}

impl Resource {
    pub(crate) fn new(
        settings: Arc<ApiSettings>,
        registry: Arc<SchemaRegistry>,
        db: Arc<dyn Database>,
        decl: ResourceDecl,
        hooks: Hooks,
        serializer: Option<Arc<dyn Serializer>>,
        deserializer: Arc<dyn Deserializer>,
    ) -> Result<Self, ConfigError> {
        let entity = registry.entity(&decl.entity)?;
        if let Some(key) = &decl.primary_key {
            if entity.field(key).is_none() {
                return Err(ConfigError::InvalidPrimaryKey {
                    entity: entity.name.clone(),
                    column: key.clone(),
                });
            }
        }
        let rules = ProjectionRules::from_decl(&decl)?;
        let deep = rules.deep(entity, &decl.expand);
        Ok(Resource {
            settings,
            registry,
            db,
            decl,
            rules,
            deep,
            hooks,
            serializer,
            deserializer,
        })
    }

    pub fn decl(&self) -> &ResourceDecl {
        &self.decl
    }

    fn entity(&self) -> Result<&EntitySchema, AppError> {
        Ok(self.registry.entity(&self.decl.entity)?)
    }

    /// Field used to address instances: the override, else the primary key.
    fn lookup_field<'e>(&self, entity: &'e EntitySchema) -> &'e FieldDef {
        self.decl
            .primary_key
            .as_deref()
            .and_then(|k| entity.field(k))
            .unwrap_or_else(|| entity.pk_field())
    }

    fn page_request(&self, req: &RequestInfo) -> PageRequest {
        PageRequest::from_query(
            &req.query,
            self.decl.results_per_page.unwrap_or(self.settings.results_per_page),
            self.decl.max_results_per_page.unwrap_or(self.settings.max_results_per_page),
        )
    }

    fn render(&self, record: &Record) -> Value {
        match &self.serializer {
            Some(s) => s.serialize(record),
            None => projection::serialize(&self.registry, record, &self.rules),
        }
    }

    /// Load depth for the records of relation `name`: one level, plus any configured expansion.
    fn relation_deep(&self, name: &str, target: &EntitySchema) -> Deep {
        let mut sub = Deep::one_level(target);
        if let Some(extra) = self.deep.relations.get(name) {
            for (k, v) in &extra.relations {
                sub.relations.insert(k.clone(), v.clone());
            }
        }
        sub
    }

    fn context(&self, phase: Phase, req: &RequestInfo) -> HookContext {
        HookContext::new(
            phase,
            req.method.clone(),
            req.uri.clone(),
            req.headers.clone(),
            &self.decl.collection_name,
            &self.decl.entity,
        )
    }

    fn respond(&self, status: StatusCode, ctx: &mut HookContext) -> Response {
        let body = ctx.result.take().unwrap_or_else(|| Value::Object(Map::new()));
        json_with_headers(status, body, std::mem::take(&mut ctx.headers))
    }

    /// Empty body with the not-found status, for deletes that affected nothing.
    fn nothing_affected(&self, ctx: &mut HookContext) -> Response {
        let status = if self.settings.legacy_error_status {
            AppError::not_found().legacy_status()
        } else {
            StatusCode::NOT_FOUND
        };
        json_with_headers(status, Value::Object(Map::new()), std::mem::take(&mut ctx.headers))
    }

    async fn finish(&self, mut tx: Tx<'_>, outcome: Result<Response, AppError>) -> Response {
        match outcome {
            Ok(response) => response,
            Err(e) => {
                tx.rollback().await;
                tracing::debug!(collection = %self.decl.collection_name, error = %e, "request rejected");
                e.to_response(self.settings.legacy_error_status)
            }
        }
    }
}

/// Session bound to one request, opened on first use.
struct Tx<'a> {
    db: &'a dyn Database,
    session: Option<Box<dyn Session>>,
}

impl<'a> Tx<'a> {
    fn new(db: &'a dyn Database) -> Self {
        Tx { db, session: None }
    }

    async fn session(&mut self) -> Result<&mut dyn Session, AppError> {
        if self.session.is_none() {
            self.session = Some(self.db.begin().await?);
        }
        match self.session.as_deref_mut() {
            Some(s) => Ok(s),
            None => Err(AppError::Store(crate::error::StoreError::Backend("session unavailable".into()))),
        }
    }

    /// Commit and release; a failed commit is rolled back before the error is returned.
    async fn commit(&mut self) -> Result<(), AppError> {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.commit().await {
                if let Err(rb) = session.rollback().await {
                    tracing::warn!(error = %rb, "rollback after failed commit failed");
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// End a session that made no changes.
    async fn release(&mut self) {
        self.rollback().await
    }

    async fn rollback(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.rollback().await {
                tracing::warn!(error = %e, "rollback failed");
            }
        }
    }
}

fn decode_object(body: &Bytes) -> Result<Map<String, Value>, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(_) => Err(AppError::MalformedRequest("Request body must be a JSON object".into())),
        Err(_) => Err(AppError::MalformedRequest("Unable to decode data".into())),
    }
}

fn take_object(data: Option<Value>) -> Result<Map<String, Value>, AppError> {
    match data {
        Some(Value::Object(map)) => Ok(map),
        None | Some(Value::Null) => Ok(Map::new()),
        Some(_) => Err(AppError::MalformedRequest("Request body must be a JSON object".into())),
    }
}

/// Typed key from the (possibly hook-replaced) instance id.
fn instance_key(field: &FieldDef, id: Option<&Value>) -> Result<Value, AppError> {
    match id {
        Some(Value::String(s)) => coerce::parse_instance_id(field, s),
        Some(Value::Null) | None => Err(AppError::MalformedRequest("missing instance identifier".into())),
        Some(other) => coerce::parse_instance_id(field, &other.to_string()),
    }
}

fn key_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The single row of `entity` whose `field` equals `key`, if any.
async fn find_by(
    session: &mut dyn Session,
    entity: &EntitySchema,
    field: &FieldDef,
    key: Value,
) -> Result<Option<Row>, AppError> {
    let mut plan = QueryPlan::by_key(entity, field, key.clone());
    plan.limit = Some(2);
    let mut rows = session.fetch(&plan).await?;
    if rows.len() > 1 {
        return Err(AppError::MultipleMatches(format!("{} with {} {}", entity.name, field.name, key)));
    }
    Ok(rows.pop())
}

async fn get_many(res: &Resource, req: &RequestInfo, tx: &mut Tx<'_>) -> Result<Response, AppError> {
    let entity = res.entity()?;
    let mut ctx = res.context(Phase::GetMany, req);
    ctx.search_params = Some(SearchParams::parse(req.query_param("q").unwrap_or(""))?);
    if let Some(response) = res.hooks.run(Stage::Pre, &mut ctx).await? {
        return Ok(response);
    }

    let params = ctx.search_params.take().unwrap_or_default();
    let plan = query::build(&res.registry, entity, &params, false)?;
    let page = res.page_request(req);

    let session = tx.session().await?;
    let num_results = session.count(&plan).await?;
    let rows = session
        .fetch(&plan.window(page.start(), page.results_per_page))
        .await?;
    let records = projection::load(&mut *session, &res.registry, entity, rows, &res.deep).await?;
    let total_pages = page.total_pages(num_results);
    tracing::debug!(collection = %res.decl.collection_name, num_results, page = page.page, "search");

    ctx.result = Some(to_value(&Page {
        page: page.page,
        objects: records.iter().map(|r| res.render(r)).collect(),
        total_pages,
        num_results,
    }));
    ctx.search_params = Some(params);
    tx.release().await;
    if let Some(link) = link_header(&req.uri, page, total_pages) {
        ctx.headers.insert(header::LINK, link);
    }
    if let Some(response) = res.hooks.run(Stage::Post, &mut ctx).await? {
        return Ok(response);
    }
    Ok(res.respond(StatusCode::OK, &mut ctx))
}

async fn get_single(
    res: &Resource,
    req: &RequestInfo,
    tx: &mut Tx<'_>,
    instid: String,
    relation: Option<String>,
    relid: Option<String>,
) -> Result<Response, AppError> {
    let entity = res.entity()?;
    let mut ctx = res.context(Phase::GetSingle, req);
    ctx.instance_id = Some(Value::String(instid));
    ctx.relation = relation.clone();
    ctx.relation_instance_id = relid.clone();
    if let Some(response) = res.hooks.run(Stage::Pre, &mut ctx).await? {
        return Ok(response);
    }

    let field = res.lookup_field(entity);
    let key = instance_key(field, ctx.instance_id.as_ref())?;
    let session = tx.session().await?;
    let row = find_by(&mut *session, entity, field, key)
        .await?
        .ok_or_else(AppError::not_found)?;

    let result = match relation {
        None => {
            let record = projection::load_one(&mut *session, &res.registry, entity, row, &res.deep).await?;
            res.render(&record)
        }
        Some(name) => {
            let rel = entity
                .relation(&name)
                .ok_or_else(|| AppError::NotFound(format!("No relation named '{}'", name)))?;
            let target = res.registry.entity(&rel.target)?;
            let mut deep = Deep::default();
            deep.relations.insert(name.clone(), res.relation_deep(&name, target));
            let mut record = projection::load_one(&mut *session, &res.registry, entity, row, &deep).await?;
            let rules = res.rules.for_relation(&name);
            let related = record.related.remove(&name).ok_or_else(AppError::not_found)?;
            let children: Vec<Record> = match related {
                Related::One(child) => child.map(|c| vec![*c]).unwrap_or_default(),
                Related::Many(children) => children,
            };
            match relid {
                Some(relid) => {
                    let target_pk = target.pk_field();
                    let relkey = coerce::parse_instance_id(target_pk, &relid)?;
                    let child = children
                        .iter()
                        .find(|c| keys_equal(target_pk.kind, c.get(&target_pk.name), &relkey))
                        .ok_or_else(AppError::not_found)?;
                    projection::serialize(&res.registry, child, &rules)
                }
                None if rel.is_like_list() => {
                    let page = res.page_request(req);
                    let num_results = children.len() as u64;
                    let total_pages = page.total_pages(num_results);
                    to_value(&Page {
                        page: page.page,
                        objects: children
                            .iter()
                            .skip(page.start() as usize)
                            .take(page.results_per_page as usize)
                            .map(|c| projection::serialize(&res.registry, c, &rules))
                            .collect(),
                        total_pages,
                        num_results,
                    })
                }
                None => {
                    let child = children.first().ok_or_else(AppError::not_found)?;
                    projection::serialize(&res.registry, child, &rules)
                }
            }
        }
    };

    tx.release().await;
    ctx.result = Some(result);
    if let Some(response) = res.hooks.run(Stage::Post, &mut ctx).await? {
        return Ok(response);
    }
    Ok(res.respond(StatusCode::OK, &mut ctx))
}

async fn post(res: &Resource, req: &RequestInfo, tx: &mut Tx<'_>, body: Bytes) -> Result<Response, AppError> {
    if !req.is_json() {
        return Err(AppError::UnsupportedMediaType);
    }
    let entity = res.entity()?;
    let mut ctx = res.context(Phase::Post, req);
    ctx.data = Some(Value::Object(decode_object(&body)?));
    if let Some(response) = res.hooks.run(Stage::Pre, &mut ctx).await? {
        return Ok(response);
    }
    let data = take_object(ctx.data.clone())?;

    let session = tx.session().await?;
    let row = res
        .deserializer
        .deserialize(&mut *session, &res.registry, entity, data)
        .await?;
    let record = projection::load_one(&mut *session, &res.registry, entity, row, &res.deep).await?;
    let result = res.render(&record);
    tx.commit().await?;

    let key = key_text(record.get(&res.lookup_field(entity).name));
    let location = format!("{}/{}", req.uri.path().trim_end_matches('/'), key);
    match HeaderValue::from_str(&location) {
        Ok(v) => {
            ctx.headers.insert(header::LOCATION, v);
        }
        Err(_) => tracing::warn!(location = %location, "Location header is not a valid header value"),
    }
    ctx.result = Some(result);
    if let Some(response) = res.hooks.run(Stage::Post, &mut ctx).await? {
        return Ok(response);
    }
    Ok(res.respond(StatusCode::CREATED, &mut ctx))
}

async fn put(
    res: &Resource,
    req: &RequestInfo,
    tx: &mut Tx<'_>,
    instid: Option<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    if !req.is_json() {
        return Err(AppError::UnsupportedMediaType);
    }
    let entity = res.entity()?;
    let mut data = decode_object(&body)?;
    let many = instid.is_none();
    let mut ctx = res.context(if many { Phase::PutMany } else { Phase::PutSingle }, req);
    match instid {
        None => {
            let q = data.remove("q").unwrap_or(Value::Null);
            ctx.search_params = Some(SearchParams::from_json(&q)?);
        }
        Some(id) => ctx.instance_id = Some(Value::String(id)),
    }
    ctx.data = Some(Value::Object(data));
    if let Some(response) = res.hooks.run(Stage::Pre, &mut ctx).await? {
        return Ok(response);
    }

    let data = take_object(ctx.data.clone())?;
    if let Some(unknown) = data.keys().find(|k| !entity.has_field(k)) {
        return Err(QueryError::InvalidField(unknown.clone()).into());
    }

    let field = res.lookup_field(entity);
    let (plan, key) = if many {
        let params = ctx.search_params.clone().unwrap_or_default();
        (query::build(&res.registry, entity, &params, false)?, None)
    } else {
        let key = instance_key(field, ctx.instance_id.as_ref())?;
        (QueryPlan::by_key(entity, field, key.clone()), Some(key))
    };

    let session = tx.session().await?;
    if !many {
        match session.count(&plan).await? {
            0 => return Err(AppError::not_found()),
            1 => {}
            _ => return Err(AppError::MultipleMatches("Multiple rows with same ID".into())),
        }
    }
    let parents = session.fetch(&plan).await?;
    let touched = relations::apply_relations(&mut *session, &res.registry, entity, &parents, &data).await?;

    let mut scalars: Map<String, Value> = data.into_iter().filter(|(k, _)| !touched.contains(k)).collect();
    coerce::strings_to_dates(entity, &mut scalars)?;
    let mut num_modified = 0;
    if !scalars.is_empty() && !parents.is_empty() {
        let values: Vec<(FieldDef, Value)> = scalars
            .iter()
            .filter_map(|(k, v)| entity.field(k).map(|f| (f.clone(), v.clone())))
            .collect();
        let pk = entity.pk_field();
        let targets = QueryPlan::scan(entity)
            .filter(Predicate::In {
                field: pk.clone(),
                values: parents.iter().map(|r| r.get(&pk.name).cloned().unwrap_or(Value::Null)).collect(),
                negated: false,
            })
            .without_order();
        session.update_where(&targets, &values).await?;
        num_modified = parents.len() as u64;
    }

    let result = match key {
        None => to_value(&NumModified { num_modified }),
        Some(key) => {
            let key = match scalars.get(&field.name) {
                Some(changed) => instance_key(field, Some(changed))?,
                None => key,
            };
            let row = find_by(&mut *session, entity, field, key)
                .await?
                .ok_or_else(AppError::not_found)?;
            let record = projection::load_one(&mut *session, &res.registry, entity, row, &res.deep).await?;
            res.render(&record)
        }
    };
    tx.commit().await?;

    ctx.result = Some(result);
    if let Some(response) = res.hooks.run(Stage::Post, &mut ctx).await? {
        return Ok(response);
    }
    Ok(res.respond(StatusCode::OK, &mut ctx))
}

async fn delete_many(res: &Resource, req: &RequestInfo, tx: &mut Tx<'_>) -> Result<Response, AppError> {
    let entity = res.entity()?;
    let mut ctx = res.context(Phase::DeleteMany, req);
    ctx.search_params = Some(SearchParams::parse(req.query_param("q").unwrap_or(""))?);
    if let Some(response) = res.hooks.run(Stage::Pre, &mut ctx).await? {
        return Ok(response);
    }

    let params = ctx.search_params.clone().unwrap_or_default();
    let plan = query::build(&res.registry, entity, &params, true)?;
    let session = tx.session().await?;
    let num_deleted = session.delete_where(&plan).await?;
    tx.commit().await?;
    tracing::debug!(collection = %res.decl.collection_name, num_deleted, "bulk delete");

    ctx.result = Some(to_value(&NumDeleted { num_deleted }));
    if let Some(response) = res.hooks.run(Stage::Post, &mut ctx).await? {
        return Ok(response);
    }
    if num_deleted == 0 {
        return Ok(res.nothing_affected(&mut ctx));
    }
    Ok(res.respond(StatusCode::OK, &mut ctx))
}

async fn delete_single(
    res: &Resource,
    req: &RequestInfo,
    tx: &mut Tx<'_>,
    instid: String,
    relation: Option<String>,
    relid: Option<String>,
) -> Result<Response, AppError> {
    let entity = res.entity()?;
    let mut ctx = res.context(Phase::DeleteSingle, req);
    ctx.instance_id = Some(Value::String(instid));
    ctx.relation = relation.clone();
    ctx.relation_instance_id = relid.clone();
    if let Some(response) = res.hooks.run(Stage::Pre, &mut ctx).await? {
        return Ok(response);
    }

    let relation = match (relation, relid) {
        (Some(name), None) => {
            return Err(AppError::MalformedRequest(format!("Cannot DELETE entire \"{}\" relation", name)));
        }
        (Some(name), Some(relid)) => {
            let rel = entity
                .relation(&name)
                .ok_or_else(|| AppError::NotFound(format!("No relation named '{}'", name)))?;
            Some((rel, relid))
        }
        (None, _) => None,
    };

    let field = res.lookup_field(entity);
    let key = instance_key(field, ctx.instance_id.as_ref())?;
    let session = tx.session().await?;
    let was_deleted = match (find_by(&mut *session, entity, field, key).await?, relation) {
        (None, _) => false,
        (Some(row), None) => {
            let pk = entity.pk_field();
            let plan = QueryPlan::by_key(entity, pk, row.get(&pk.name).cloned().unwrap_or(Value::Null)).without_order();
            session.delete_where(&plan).await? > 0
        }
        (Some(row), Some((rel, relid))) => {
            let target = res.registry.entity(&rel.target)?;
            let relkey = coerce::parse_instance_id(target.pk_field(), &relid)?;
            match find_by(&mut *session, target, target.pk_field(), relkey).await? {
                Some(child) => {
                    let delete = req
                        .query_param("delete")
                        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                        .unwrap_or(false);
                    relations::unlink_related(&mut *session, entity, target, rel, &row, &child, delete).await?
                }
                None => false,
            }
        }
    };
    if was_deleted {
        tx.commit().await?;
    } else {
        tx.release().await;
    }
    tracing::debug!(collection = %res.decl.collection_name, was_deleted, "delete");

    ctx.was_deleted = Some(was_deleted);
    if let Some(response) = res.hooks.run(Stage::Post, &mut ctx).await? {
        return Ok(response);
    }
    if !was_deleted {
        return Ok(res.nothing_affected(&mut ctx));
    }
    Ok(res.respond(StatusCode::OK, &mut ctx))
}

pub async fn get_collection(State(res): State<Arc<Resource>>, req: RequestInfo) -> Response {
    let mut tx = Tx::new(res.db.as_ref());
    let outcome = get_many(&res, &req, &mut tx).await;
    res.finish(tx, outcome).await
}

pub async fn get_instance(State(res): State<Arc<Resource>>, Path(instid): Path<String>, req: RequestInfo) -> Response {
    let mut tx = Tx::new(res.db.as_ref());
    let outcome = get_single(&res, &req, &mut tx, instid, None, None).await;
    res.finish(tx, outcome).await
}

pub async fn get_relation(
    State(res): State<Arc<Resource>>,
    Path((instid, relation)): Path<(String, String)>,
    req: RequestInfo,
) -> Response {
    let mut tx = Tx::new(res.db.as_ref());
    let outcome = get_single(&res, &req, &mut tx, instid, Some(relation), None).await;
    res.finish(tx, outcome).await
}

pub async fn get_related(
    State(res): State<Arc<Resource>>,
    Path((instid, relation, relid)): Path<(String, String, String)>,
    req: RequestInfo,
) -> Response {
    let mut tx = Tx::new(res.db.as_ref());
    let outcome = get_single(&res, &req, &mut tx, instid, Some(relation), Some(relid)).await;
    res.finish(tx, outcome).await
}

pub async fn post_collection(State(res): State<Arc<Resource>>, req: RequestInfo, body: Bytes) -> Response {
    let mut tx = Tx::new(res.db.as_ref());
    let outcome = post(&res, &req, &mut tx, body).await;
    res.finish(tx, outcome).await
}

pub async fn put_collection(State(res): State<Arc<Resource>>, req: RequestInfo, body: Bytes) -> Response {
    let mut tx = Tx::new(res.db.as_ref());
    let outcome = put(&res, &req, &mut tx, None, body).await;
    res.finish(tx, outcome).await
}

pub async fn put_instance(
    State(res): State<Arc<Resource>>,
    Path(instid): Path<String>,
    req: RequestInfo,
    body: Bytes,
) -> Response {
    let mut tx = Tx::new(res.db.as_ref());
    let outcome = put(&res, &req, &mut tx, Some(instid), body).await;
    res.finish(tx, outcome).await
}

pub async fn delete_collection(State(res): State<Arc<Resource>>, req: RequestInfo) -> Response {
    let mut tx = Tx::new(res.db.as_ref());
    let outcome = delete_many(&res, &req, &mut tx).await;
    res.finish(tx, outcome).await
}

pub async fn delete_instance(State(res): State<Arc<Resource>>, Path(instid): Path<String>, req: RequestInfo) -> Response {
    let mut tx = Tx::new(res.db.as_ref());
    let outcome = delete_single(&res, &req, &mut tx, instid, None, None).await;
    res.finish(tx, outcome).await
}

pub async fn delete_relation(
    State(res): State<Arc<Resource>>,
    Path((instid, relation)): Path<(String, String)>,
    req: RequestInfo,
) -> Response {
    let mut tx = Tx::new(res.db.as_ref());
    let outcome = delete_single(&res, &req, &mut tx, instid, Some(relation), None).await;
    res.finish(tx, outcome).await
}

pub async fn delete_related(
    State(res): State<Arc<Resource>>,
    Path((instid, relation, relid)): Path<(String, String, String)>,
    req: RequestInfo,
) -> Response {
    let mut tx = Tx::new(res.db.as_ref());
    let outcome = delete_single(&res, &req, &mut tx, instid, Some(relation), Some(relid)).await;
    res.finish(tx, outcome).await
}
