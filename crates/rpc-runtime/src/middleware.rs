//! Middleware support and the chain executor
//!
//! A procedure is an ordered list of middleware frames whose last frame wraps the
//! resolver. Frame `i` runs until it calls [`Next::run`], which invokes frame `i + 1`
//! with the merged context and the (possibly replaced) input. Failures travel back up
//! as data inside a [`MiddlewareResult`], so outer frames always get to observe them.

use crate::{Context, ProcedureOutput, RpcError, RpcResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use futures::FutureExt;

/// Type of procedure being called
#[derive(Clone, Debug, PartialEq, Eq, Hash, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ProcedureType {
    /// Read-only operation
    Query,
    /// Write operation
    Mutation,
    /// Streaming subscription
    Subscription,
}

impl ProcedureType {
    /// Procedure type served by an HTTP method, if any.
    pub fn from_http_method(method: &str) -> Option<Self> {
        match method.to_ascii_uppercase().as_str() {
            "GET" => Some(Self::Query),
            "POST" => Some(Self::Mutation),
            _ => None,
        }
    }

    /// Lowercase name, as used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Mutation => "mutation",
            Self::Subscription => "subscription",
        }
    }
}

impl fmt::Display for ProcedureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request information passed to middleware
#[derive(Clone, Debug)]
pub struct Request {
    /// Full path of the procedure (e.g., "users.get")
    pub path: Arc<str>,
    /// Type of procedure
    pub procedure_type: ProcedureType,
    /// Current input: the raw input until a parser replaces it
    pub input: Value,
    /// Input exactly as it arrived from the transport
    pub raw_input: Value,
    /// Procedure meta, if the builder set one
    pub meta: Option<Arc<Value>>,
}

impl Request {
    /// Get the namespace (first part of path)
    pub fn namespace(&self) -> Option<&str> {
        self.path.split('.').next()
    }

    /// Get the procedure name (last part of path)
    pub fn procedure(&self) -> &str {
        self.path.split('.').next_back().unwrap_or(&self.path)
    }
}

// =============================================================================
// Middleware Result
// =============================================================================

#[derive(Debug)]
struct Resolved {
    data: ProcedureOutput,
    ctx: Context,
}

/// Outcome of a middleware frame.
///
/// A successful result can only be produced by the resolver at the bottom of the
/// chain, so every frame must obtain it from [`Next::run`]. A frame can short
/// circuit with [`MiddlewareResult::error`].
#[derive(Debug)]
#[must_use = "a middleware must return the result it got from next"]
pub struct MiddlewareResult {
    inner: Result<Resolved, RpcError>,
}

impl MiddlewareResult {
    pub(crate) fn ok(data: ProcedureOutput, ctx: Context) -> Self {
        Self {
            inner: Ok(Resolved { data, ctx }),
        }
    }

    /// A failed result, used to reject a call without running the rest of the chain.
    pub fn error(error: RpcError) -> Self {
        Self { inner: Err(error) }
    }

    /// Whether the chain below this frame succeeded.
    pub fn is_ok(&self) -> bool {
        self.inner.is_ok()
    }

    /// Whether the chain below this frame failed.
    pub fn is_err(&self) -> bool {
        self.inner.is_err()
    }

    /// The resolver's output, on success.
    pub fn data(&self) -> Option<&ProcedureOutput> {
        self.inner.as_ref().ok().map(|resolved| &resolved.data)
    }

    /// The context the resolver ran with, on success.
    pub fn ctx(&self) -> Option<&Context> {
        self.inner.as_ref().ok().map(|resolved| &resolved.ctx)
    }

    /// The carried error, on failure.
    pub fn err(&self) -> Option<&RpcError> {
        self.inner.as_ref().err()
    }

    /// Rewrite the carried error. Successful results pass through.
    pub fn map_err(self, f: impl FnOnce(RpcError) -> RpcError) -> Self {
        Self {
            inner: self.inner.map_err(f),
        }
    }

    /// Post-process successful output; a returned error turns the result into a failure.
    pub fn and_then_data(
        self,
        f: impl FnOnce(ProcedureOutput) -> RpcResult<ProcedureOutput>,
    ) -> Self {
        match self.inner {
            Ok(Resolved { data, ctx }) => match f(data) {
                Ok(data) => Self::ok(data, ctx),
                Err(error) => Self::error(error),
            },
            Err(error) => Self::error(error),
        }
    }

    /// Unwrap into the plain result seen by callers of the chain.
    pub fn into_result(self) -> RpcResult<ProcedureOutput> {
        self.inner.map(|resolved| resolved.data)
    }
}

impl From<RpcError> for MiddlewareResult {
    fn from(error: RpcError) -> Self {
        Self::error(error)
    }
}

// =============================================================================
// Chain Types
// =============================================================================

/// Boxed future returned by a middleware frame
pub type MiddlewareFuture = Pin<Box<dyn Future<Output = MiddlewareResult> + Send>>;

/// Middleware function type
pub type MiddlewareFn = Arc<dyn Fn(Context, Request, Next) -> MiddlewareFuture + Send + Sync>;

/// Handle to the rest of the chain.
///
/// Consumed by [`Next::run`], so a frame can forward control at most once.
pub struct Next {
    frames: Arc<[MiddlewareFn]>,
    index: usize,
    ctx: Context,
}

impl Next {
    /// Invoke the next frame.
    ///
    /// `ctx` is shallow-merged onto the context this frame received, so passing
    /// either the received context, an extended copy of it, or a partial context
    /// holding only the new values all work. `req.input` replaces the input seen by
    /// later frames; `req.raw_input` is never changed.
    pub async fn run(self, ctx: Context, req: Request) -> MiddlewareResult {
        let ctx = self.ctx.merge(&ctx);
        dispatch(self.frames, self.index, ctx, req).await
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next")
            .field("index", &self.index)
            .field("frames", &self.frames.len())
            .finish()
    }
}

/// Trait for implementing custom middleware
pub trait Middleware: Send + Sync {
    /// Process the request, usually by calling `next.run(ctx, req)`
    fn handle(&self, ctx: Context, req: Request, next: Next) -> MiddlewareFuture;
}

/// Allows async functions and closures to be used as middleware.
///
/// ```rust,ignore
/// async fn timing(ctx: Context, req: Request, next: Next) -> MiddlewareResult {
///     let start = std::time::Instant::now();
///     let result = next.run(ctx, req).await;
///     tracing::debug!(elapsed = ?start.elapsed(), "call finished");
///     result
/// }
/// ```
impl<F, Fut> Middleware for F
where
    F: Fn(Context, Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MiddlewareResult> + Send + 'static,
{
    fn handle(&self, ctx: Context, req: Request, next: Next) -> MiddlewareFuture {
        Box::pin(self(ctx, req, next))
    }
}

/// Create middleware from an async function
pub fn from_fn<F, Fut>(f: F) -> MiddlewareFn
where
    F: Fn(Context, Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = MiddlewareResult> + Send + 'static,
{
    Arc::new(move |ctx, req, next| Box::pin(f(ctx, req, next)))
}

/// Create middleware from a [`Middleware`] implementor
pub fn from_middleware<M: Middleware + 'static>(middleware: M) -> MiddlewareFn {
    Arc::new(move |ctx, req, next| middleware.handle(ctx, req, next))
}

// =============================================================================
// Executor
// =============================================================================

/// Run frame `index` of `frames`.
///
/// A panic inside the frame is caught here and becomes that frame's error, so
/// frames above it still see a regular failed result.
pub(crate) fn dispatch(
    frames: Arc<[MiddlewareFn]>,
    index: usize,
    ctx: Context,
    req: Request,
) -> MiddlewareFuture {
    Box::pin(async move {
        let Some(frame) = frames.get(index).cloned() else {
            return MiddlewareResult::error(RpcError::internal(
                "No result from middlewares - did you forget to `return next()`?",
            ));
        };
        let next = Next {
            frames,
            index: index + 1,
            ctx: ctx.clone(),
        };

        let future = match std::panic::catch_unwind(AssertUnwindSafe(|| frame(ctx, req, next))) {
            Ok(future) => future,
            Err(payload) => return MiddlewareResult::error(RpcError::from_panic(payload)),
        };
        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => MiddlewareResult::error(RpcError::from_panic(payload)),
        }
    })
}
