//! Built router and server-side caller

use super::builder::RouterBuilder;
use crate::procedure::ValueStream;
use crate::{
    Context, ErrorConfig, ErrorShape, Procedure, ProcedureOutput, ProcedureType, RpcError,
    RpcResult,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace};

struct RouterInner {
    procedures: HashMap<String, Procedure>,
    error_config: ErrorConfig,
}

/// Immutable path → procedure registry.
///
/// Cloning shares the same registry.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Start building a router.
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    pub(crate) fn from_parts(
        procedures: HashMap<String, Procedure>,
        error_config: ErrorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                procedures,
                error_config,
            }),
        }
    }

    /// Procedure registered at `path`.
    pub fn lookup(&self, path: &str) -> Option<&Procedure> {
        self.inner.procedures.get(path)
    }

    /// Procedure at `path`, provided it has the requested type.
    ///
    /// A missing path and a type mismatch are both `NOT_FOUND`.
    pub fn resolve(&self, procedure_type: ProcedureType, path: &str) -> RpcResult<&Procedure> {
        match self.lookup(path) {
            Some(procedure) if procedure.kind() == procedure_type => Ok(procedure),
            _ => {
                debug!(path = %path, procedure_type = %procedure_type, "No matching procedure");
                Err(RpcError::not_found(format!(
                    "No \"{procedure_type}\"-procedure on path \"{path}\""
                )))
            }
        }
    }

    /// All registered paths, sorted.
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<_> = self.inner.procedures.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    /// Number of registered procedures.
    pub fn len(&self) -> usize {
        self.inner.procedures.len()
    }

    /// Whether the router has no procedures.
    pub fn is_empty(&self) -> bool {
        self.inner.procedures.is_empty()
    }

    /// Error shaping configured at build time.
    pub fn error_config(&self) -> &ErrorConfig {
        &self.inner.error_config
    }

    /// Shape `error` for the wire using this router's configuration.
    pub fn error_shape(&self, error: &RpcError, path: Option<&str>) -> ErrorShape {
        error.to_shape(path, &self.inner.error_config)
    }

    /// Resolve and invoke one call.
    pub async fn call(
        &self,
        ctx: Context,
        procedure_type: ProcedureType,
        path: &str,
        input: Value,
    ) -> RpcResult<ProcedureOutput> {
        trace!(path = %path, procedure_type = %procedure_type, "Calling procedure");
        let procedure = self.resolve(procedure_type, path)?;
        procedure.invoke(ctx, path, input).await
    }

    /// Server-side caller bound to `ctx`.
    pub fn caller(&self, ctx: Context) -> Caller {
        Caller {
            router: self.clone(),
            ctx,
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("procedures", &self.paths())
            .field("error_config", &self.inner.error_config)
            .finish()
    }
}

/// Calls procedures in-process, without a transport.
///
/// ```rust,ignore
/// let caller = router.caller(Context::new().with(db));
/// let user = caller.query("users.get", json!({"id": "u1"})).await?;
/// ```
#[derive(Clone, Debug)]
pub struct Caller {
    router: Router,
    ctx: Context,
}

impl Caller {
    /// Run a query. Streamed queries are collected into an array.
    pub async fn query(&self, path: &str, input: impl Serialize) -> RpcResult<Value> {
        self.value_call(ProcedureType::Query, path, input).await
    }

    /// Run a mutation.
    pub async fn mutation(&self, path: &str, input: impl Serialize) -> RpcResult<Value> {
        self.value_call(ProcedureType::Mutation, path, input).await
    }

    /// Start a subscription and return its stream.
    pub async fn subscription(&self, path: &str, input: impl Serialize) -> RpcResult<ValueStream> {
        let input = encode_input(input)?;
        match self
            .router
            .call(self.ctx.clone(), ProcedureType::Subscription, path, input)
            .await?
        {
            ProcedureOutput::Stream(stream) => Ok(stream),
            ProcedureOutput::Value(_) => Err(RpcError::internal(
                "Subscription procedure did not return a stream",
            )),
        }
    }

    async fn value_call(
        &self,
        procedure_type: ProcedureType,
        path: &str,
        input: impl Serialize,
    ) -> RpcResult<Value> {
        let input = encode_input(input)?;
        self.router
            .call(self.ctx.clone(), procedure_type, path, input)
            .await?
            .collect()
            .await
    }
}

fn encode_input(input: impl Serialize) -> RpcResult<Value> {
    serde_json::to_value(input)
        .map_err(|e| RpcError::internal(format!("Failed to serialize input: {e}")))
}
