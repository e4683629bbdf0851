//! Procedure builder API
//!
//! A procedure is built from an ordered list of middleware plus exactly one resolver.
//! Input and output parsers are middleware too, placed wherever `.input(..)` and
//! `.output(..)` appear in the builder chain.
//!
//! # Example
//!
//! ```rust,ignore
//! use rpc_runtime::prelude::*;
//!
//! let get_user = Procedure::builder()
//!     .use_middleware(auth)
//!     .input(schema::<GetUserInput>())
//!     .query(|ctx: Context, input: GetUserInput| async move {
//!         let db = ctx.require::<Db>()?;
//!         db.find_user(&input.id).await
//!     });
//!
//! let on_message = Procedure::builder().subscription(|_ctx: Context, room: String| async move {
//!     Ok(messages_for(room))
//! });
//! ```

use crate::handler::{self, Handler, Resolver, StreamHandler};
use crate::middleware::{
    Middleware, MiddlewareFn, MiddlewareResult, ProcedureType, Request, dispatch,
    from_middleware,
};
use crate::parser::{ParseError, Parser};
use crate::{Context, RpcError, RpcResult};
use futures::{Stream, TryStreamExt};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Stream of JSON values produced by a subscription or streamed query
pub type ValueStream = Pin<Box<dyn Stream<Item = RpcResult<Value>> + Send>>;

/// What a resolver produced.
pub enum ProcedureOutput {
    /// A single value
    Value(Value),
    /// A sequence of values delivered over time
    Stream(ValueStream),
}

impl ProcedureOutput {
    /// Serialize `value` into a single-value output.
    pub fn value(value: impl Serialize) -> RpcResult<Self> {
        serde_json::to_value(value)
            .map(Self::Value)
            .map_err(|e| RpcError::internal(format!("Failed to serialize output: {e}")))
    }

    /// Wrap an arbitrary stream of results.
    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = RpcResult<Value>> + Send + 'static,
    {
        Self::Stream(Box::pin(stream))
    }

    /// Whether this output is a stream.
    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// The single value, if this output is not a stream.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Self::Value(value) => Some(value),
            Self::Stream(_) => None,
        }
    }

    /// Resolve to one value, draining a stream into a JSON array.
    ///
    /// The first stream error aborts collection.
    pub async fn collect(self) -> RpcResult<Value> {
        match self {
            Self::Value(value) => Ok(value),
            Self::Stream(stream) => Ok(Value::Array(stream.try_collect().await?)),
        }
    }
}

impl fmt::Debug for ProcedureOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

// =============================================================================
// Procedure
// =============================================================================

struct ProcedureDef {
    kind: ProcedureType,
    frames: Arc<[MiddlewareFn]>,
    meta: Option<Arc<Value>>,
}

/// A built procedure: its type, its middleware chain and its resolver.
///
/// Cheap to clone. Procedures are registered into a router with
/// [`RouterBuilder::procedure`](crate::RouterBuilder::procedure).
#[derive(Clone)]
pub struct Procedure {
    inner: Arc<ProcedureDef>,
}

impl Procedure {
    /// Start building a procedure.
    pub fn builder() -> ProcedureBuilder {
        ProcedureBuilder::new()
    }

    /// Whether this is a query, mutation or subscription.
    pub fn kind(&self) -> ProcedureType {
        self.inner.kind
    }

    /// Meta attached with [`ProcedureBuilder::meta`].
    pub fn meta(&self) -> Option<&Value> {
        self.inner.meta.as_deref()
    }

    /// Number of middleware frames in front of the resolver.
    pub fn middleware_count(&self) -> usize {
        self.inner.frames.len().saturating_sub(1)
    }

    /// Run the chain for one call.
    ///
    /// `input` is the raw input as decoded by the transport. Errors raised (or
    /// panics thrown) anywhere in the chain come back as `Err`.
    pub async fn invoke(
        &self,
        ctx: Context,
        path: impl Into<Arc<str>>,
        input: Value,
    ) -> RpcResult<ProcedureOutput> {
        let req = Request {
            path: path.into(),
            procedure_type: self.inner.kind,
            input: input.clone(),
            raw_input: input,
            meta: self.inner.meta.clone(),
        };
        dispatch(self.inner.frames.clone(), 0, ctx, req)
            .await
            .into_result()
    }
}

impl fmt::Debug for Procedure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedure")
            .field("kind", &self.inner.kind)
            .field("middleware", &self.middleware_count())
            .field("meta", &self.inner.meta)
            .finish()
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Fluent builder for [`Procedure`].
///
/// The builder is `Clone`, so a partially configured builder (for example one with
/// an auth middleware) can be reused as the base for many procedures.
#[derive(Clone, Default)]
pub struct ProcedureBuilder {
    frames: Vec<MiddlewareFn>,
    meta: Option<Arc<Value>>,
}

impl fmt::Debug for ProcedureBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureBuilder")
            .field("middleware", &self.frames.len())
            .field("meta", &self.meta)
            .finish()
    }
}

impl ProcedureBuilder {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware.
    #[must_use = "This method returns a new ProcedureBuilder and does not modify self"]
    pub fn use_middleware<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.frames.push(from_middleware(middleware));
        self
    }

    /// Append an already boxed middleware (see [`from_fn`](crate::middleware::from_fn)).
    #[must_use = "This method returns a new ProcedureBuilder and does not modify self"]
    pub fn use_middleware_fn(mut self, middleware: MiddlewareFn) -> Self {
        self.frames.push(middleware);
        self
    }

    /// Append an input parser.
    ///
    /// The parser sees the raw input. Its result becomes the input of every later
    /// frame and of the resolver. A failure short circuits with `BAD_REQUEST`.
    #[must_use = "This method returns a new ProcedureBuilder and does not modify self"]
    pub fn input<P: Parser + 'static>(mut self, parser: P) -> Self {
        let parser = Arc::new(parser);
        self.frames.push(Arc::new(move |ctx, mut req: Request, next| {
            let parsed = parser.parse(req.raw_input.clone());
            Box::pin(async move {
                match parsed {
                    Ok(input) => {
                        req.input = input;
                        next.run(ctx, req).await
                    }
                    Err(error) => {
                        debug!(path = %req.path, error = %error, "Input parsing failed");
                        MiddlewareResult::error(input_error(error))
                    }
                }
            })
        }));
        self
    }

    /// Append an output parser.
    ///
    /// Runs on the value returned by the rest of the chain. A failure becomes
    /// `INTERNAL_SERVER_ERROR` "Output validation failed". Errors from below and
    /// streamed outputs pass through untouched.
    #[must_use = "This method returns a new ProcedureBuilder and does not modify self"]
    pub fn output<P: Parser + 'static>(mut self, parser: P) -> Self {
        let parser = Arc::new(parser);
        self.frames.push(Arc::new(move |ctx, req: Request, next| {
            let parser = parser.clone();
            Box::pin(async move {
                let path = req.path.clone();
                next.run(ctx, req).await.and_then_data(|data| match data {
                    ProcedureOutput::Value(value) => parser
                        .parse(value)
                        .map(ProcedureOutput::Value)
                        .map_err(|error| {
                            warn!(path = %path, error = %error, "Output validation failed");
                            output_error(error)
                        }),
                    stream => Ok(stream),
                })
            })
        }));
        self
    }

    /// Attach static meta, visible to middleware as `req.meta`.
    #[must_use = "This method returns a new ProcedureBuilder and does not modify self"]
    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(Arc::new(meta));
        self
    }

    /// Finish as a query with a typed handler.
    pub fn query<Input, Output, H>(self, handler: H) -> Procedure
    where
        Input: DeserializeOwned + Send + 'static,
        Output: Serialize + Send + 'static,
        H: Handler<Input, Output>,
    {
        self.finish(ProcedureType::Query, handler::into_resolver(handler))
    }

    /// Finish as a mutation with a typed handler.
    pub fn mutation<Input, Output, H>(self, handler: H) -> Procedure
    where
        Input: DeserializeOwned + Send + 'static,
        Output: Serialize + Send + 'static,
        H: Handler<Input, Output>,
    {
        self.finish(ProcedureType::Mutation, handler::into_resolver(handler))
    }

    /// Finish as a subscription whose handler resolves to a stream.
    pub fn subscription<Input, Output, H>(self, handler: H) -> Procedure
    where
        Input: DeserializeOwned + Send + 'static,
        Output: Serialize + Send + 'static,
        H: StreamHandler<Input, Output>,
    {
        self.finish(
            ProcedureType::Subscription,
            handler::into_stream_resolver(handler),
        )
    }

    /// Finish as a query that streams its result in chunks.
    ///
    /// Streaming HTTP responses deliver each chunk as it is produced; buffered
    /// responses collect the chunks into an array.
    pub fn query_stream<Input, Output, H>(self, handler: H) -> Procedure
    where
        Input: DeserializeOwned + Send + 'static,
        Output: Serialize + Send + 'static,
        H: StreamHandler<Input, Output>,
    {
        self.finish(ProcedureType::Query, handler::into_stream_resolver(handler))
    }

    /// Finish with an untyped resolver that sees the whole [`Request`].
    pub fn resolve<F, Fut>(self, kind: ProcedureType, resolver: F) -> Procedure
    where
        F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<ProcedureOutput>> + Send + 'static,
    {
        self.finish(kind, handler::raw_resolver(resolver))
    }

    fn finish(self, kind: ProcedureType, resolver: Resolver) -> Procedure {
        let mut frames = self.frames;
        frames.push(resolver_frame(resolver));
        Procedure {
            inner: Arc::new(ProcedureDef {
                kind,
                frames: frames.into(),
                meta: self.meta,
            }),
        }
    }
}

fn resolver_frame(resolver: Resolver) -> MiddlewareFn {
    Arc::new(move |ctx, req, _next| {
        let resolved = resolver(ctx.clone(), req);
        Box::pin(async move {
            match resolved.await {
                Ok(data) => MiddlewareResult::ok(data, ctx),
                Err(error) => MiddlewareResult::error(error),
            }
        })
    })
}

fn input_error(error: ParseError) -> RpcError {
    let mut rpc_error = RpcError::bad_request(error.message.clone()).with_cause(error.message);
    if !error.issues.is_empty() {
        rpc_error = rpc_error.with_details(serde_json::json!({ "issues": error.issues }));
    }
    rpc_error
}

fn output_error(error: ParseError) -> RpcError {
    let mut rpc_error = RpcError::internal("Output validation failed").with_cause(error.message);
    if !error.issues.is_empty() {
        rpc_error = rpc_error.with_details(serde_json::json!({ "issues": error.issues }));
    }
    rpc_error
}
