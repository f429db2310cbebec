//! Pre/post interceptors around each CRUD phase.

use crate::error::{AppError, ProcessingError};
use crate::query::SearchParams;
use async_trait::async_trait;
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    GetSingle,
    GetMany,
    Post,
    PutSingle,
    PutMany,
    DeleteSingle,
    DeleteMany,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::GetSingle => "GET_SINGLE",
            Phase::GetMany => "GET_MANY",
            Phase::Post => "POST",
            Phase::PutSingle => "PUT_SINGLE",
            Phase::PutMany => "PUT_MANY",
            Phase::DeleteSingle => "DELETE_SINGLE",
            Phase::DeleteMany => "DELETE_MANY",
        }
    }

    /// Single-instance phases whose pre-hooks may swap the instance id.
    fn accepts_replacement(self) -> bool {
        matches!(self, Phase::GetSingle | Phase::PutSingle | Phase::DeleteSingle)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Pre,
    Post,
}

/// Everything a hook can see and change. Fields not relevant to the phase stay `None`.
#[derive(Debug)]
pub struct HookContext {
    pub phase: Phase,
    pub method: Method,
    pub uri: Uri,
    pub request_headers: HeaderMap,
    pub collection: String,
    pub entity: String,
    pub instance_id: Option<Value>,
    pub relation: Option<String>,
    pub relation_instance_id: Option<String>,
    pub search_params: Option<SearchParams>,
    /// Request body (POST/PUT).
    pub data: Option<Value>,
    /// Serialized result; post-hooks may rewrite it.
    pub result: Option<Value>,
    pub was_deleted: Option<bool>,
    /// Extra headers merged into the final response.
    pub headers: HeaderMap,
}

impl HookContext {
    pub fn new(phase: Phase, method: Method, uri: Uri, request_headers: HeaderMap, collection: &str, entity: &str) -> Self {
        HookContext {
            phase,
            method,
            uri,
            request_headers,
            collection: collection.to_string(),
            entity: entity.to_string(),
            instance_id: None,
            relation: None,
            relation_instance_id: None,
            search_params: None,
            data: None,
            result: None,
            was_deleted: None,
            headers: HeaderMap::new(),
        }
    }
}

pub enum HookOutcome {
    Continue,
    /// New instance id; honored only by single-instance pre-hooks.
    Replace(Value),
    /// Finish the request with this response.
    ShortCircuit(Response),
    Abort(ProcessingError),
}

#[async_trait]
pub trait Hook: Send + Sync {
    async fn call(&self, ctx: &mut HookContext) -> HookOutcome;
}

/// Adapter for plain closures.
pub struct FnHook<F>(pub F);

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&mut HookContext) -> HookOutcome + Send + Sync,
{
    async fn call(&self, ctx: &mut HookContext) -> HookOutcome {
        (self.0)(ctx)
    }
}

/// Ordered hooks per phase and stage.
#[derive(Clone, Default)]
pub struct Hooks {
    pre: BTreeMap<Phase, Vec<Arc<dyn Hook>>>,
    post: BTreeMap<Phase, Vec<Arc<dyn Hook>>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = |m: &BTreeMap<Phase, Vec<Arc<dyn Hook>>>| m.iter().map(|(p, v)| (p.name(), v.len())).collect::<Vec<_>>();
        f.debug_struct("Hooks")
            .field("pre", &counts(&self.pre))
            .field("post", &counts(&self.post))
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pre(mut self, phase: Phase, hook: impl Hook + 'static) -> Self {
        self.pre.entry(phase).or_default().push(Arc::new(hook));
        self
    }

    pub fn post(mut self, phase: Phase, hook: impl Hook + 'static) -> Self {
        self.post.entry(phase).or_default().push(Arc::new(hook));
        self
    }

    pub fn pre_fn<F>(self, phase: Phase, f: F) -> Self
    where
        F: Fn(&mut HookContext) -> HookOutcome + Send + Sync + 'static,
    {
        self.pre(phase, FnHook(f))
    }

    pub fn post_fn<F>(self, phase: Phase, f: F) -> Self
    where
        F: Fn(&mut HookContext) -> HookOutcome + Send + Sync + 'static,
    {
        self.post(phase, FnHook(f))
    }

    /// `first` runs before `self` in every phase.
    pub fn after(self, first: &Hooks) -> Hooks {
        let join = |a: &BTreeMap<Phase, Vec<Arc<dyn Hook>>>, b: BTreeMap<Phase, Vec<Arc<dyn Hook>>>| {
            let mut out = a.clone();
            for (phase, hooks) in b {
                out.entry(phase).or_default().extend(hooks);
            }
            out
        };
        Hooks {
            pre: join(&first.pre, self.pre),
            post: join(&first.post, self.post),
        }
    }

    /// Run the hooks of `ctx.phase` in order. `Ok(Some(_))` ends the request with that response.
    pub async fn run(&self, stage: Stage, ctx: &mut HookContext) -> Result<Option<Response>, AppError> {
        let table = match stage {
            Stage::Pre => &self.pre,
            Stage::Post => &self.post,
        };
        let Some(hooks) = table.get(&ctx.phase) else {
            return Ok(None);
        };
        for hook in hooks {
            match hook.call(ctx).await {
                HookOutcome::Continue => {}
                HookOutcome::Replace(id) if stage == Stage::Pre && ctx.phase.accepts_replacement() => {
                    tracing::debug!(phase = %ctx.phase, id = %id, "hook replaced instance id");
                    ctx.instance_id = Some(id);
                }
                HookOutcome::Replace(_) => {
                    tracing::warn!(phase = %ctx.phase, ?stage, "ignoring replacement value from hook");
                }
                HookOutcome::ShortCircuit(response) => {
                    tracing::debug!(phase = %ctx.phase, ?stage, status = %response.status(), "hook short-circuited");
                    return Ok(Some(response));
                }
                HookOutcome::Abort(e) => {
                    tracing::debug!(phase = %ctx.phase, ?stage, error = %e, "hook aborted");
                    return Err(AppError::Processing(e));
                }
            }
        }
        Ok(None)
    }
}
