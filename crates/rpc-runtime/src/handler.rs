//! Handler traits and utilities
//!
//! Typed resolvers are plain async functions `async fn(Context, Input) -> RpcResult<Output>`.
//! This module erases them into [`Resolver`]s working on JSON values, which is what
//! the chain executor stores.

use crate::middleware::Request;
use crate::procedure::{ProcedureOutput, ValueStream};
use crate::{Context, RpcError, RpcResult};
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{trace, warn};

/// Type-erased resolver at the bottom of a procedure's chain
pub type Resolver =
    Arc<dyn Fn(Context, Request) -> BoxFuture<'static, RpcResult<ProcedureOutput>> + Send + Sync>;

/// Trait for handler functions
///
/// Automatically implemented for async functions with the signature:
/// `async fn(Context, Input) -> RpcResult<Output>`
pub trait Handler<Input, Output>: Send + Sync + 'static
where
    Input: DeserializeOwned + Send + 'static,
    Output: Serialize + Send + 'static,
{
    /// The future type returned by the handler
    type Future: Future<Output = RpcResult<Output>> + Send + 'static;

    /// Call the handler with context and input
    fn call(&self, ctx: Context, input: Input) -> Self::Future;
}

impl<Input, Output, F, Fut> Handler<Input, Output> for F
where
    Input: DeserializeOwned + Send + 'static,
    Output: Serialize + Send + 'static,
    F: Fn(Context, Input) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<Output>> + Send + 'static,
{
    type Future = Fut;

    fn call(&self, ctx: Context, input: Input) -> Self::Future {
        (self)(ctx, input)
    }
}

/// Trait for handlers that produce a stream of values
///
/// Implemented for `async fn(Context, Input) -> RpcResult<impl Stream<Item = RpcResult<Output>>>`.
/// Used by subscriptions and streamed queries.
pub trait StreamHandler<Input, Output>: Send + Sync + 'static
where
    Input: DeserializeOwned + Send + 'static,
    Output: Serialize + Send + 'static,
{
    /// The stream type the handler resolves to
    type Stream: Stream<Item = RpcResult<Output>> + Send + 'static;
    /// The future type returned by the handler
    type Future: Future<Output = RpcResult<Self::Stream>> + Send + 'static;

    /// Call the handler with context and input
    fn call(&self, ctx: Context, input: Input) -> Self::Future;
}

impl<Input, Output, F, Fut, S> StreamHandler<Input, Output> for F
where
    Input: DeserializeOwned + Send + 'static,
    Output: Serialize + Send + 'static,
    F: Fn(Context, Input) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<S>> + Send + 'static,
    S: Stream<Item = RpcResult<Output>> + Send + 'static,
{
    type Stream = S;
    type Future = Fut;

    fn call(&self, ctx: Context, input: Input) -> Self::Future {
        (self)(ctx, input)
    }
}

fn decode_input<Input: DeserializeOwned>(path: &str, input: Value) -> RpcResult<Input> {
    serde_json::from_value(input).map_err(|e| {
        warn!(path = %path, error = %e, "Handler input deserialization failed");
        RpcError::bad_request(format!("Invalid input: {e}")).with_cause(e.to_string())
    })
}

fn encode_output<Output: Serialize>(output: Output) -> RpcResult<Value> {
    serde_json::to_value(output).map_err(|e| {
        warn!(error = %e, "Handler output serialization failed");
        RpcError::internal(format!("Failed to serialize output: {e}"))
    })
}

/// Erase a typed handler into a [`Resolver`].
pub(crate) fn into_resolver<Input, Output, H>(handler: H) -> Resolver
where
    Input: DeserializeOwned + Send + 'static,
    Output: Serialize + Send + 'static,
    H: Handler<Input, Output>,
{
    let handler = Arc::new(handler);
    Arc::new(move |ctx, req| {
        let handler = handler.clone();
        Box::pin(async move {
            trace!(path = %req.path, "Executing handler");
            let input: Input = decode_input(&req.path, req.input)?;
            let output = handler.call(ctx, input).await.inspect_err(|e| {
                trace!(error_code = %e.code, error_message = %e.message, "Handler returned error");
            })?;
            encode_output(output).map(ProcedureOutput::Value)
        })
    })
}

/// Erase a typed stream handler into a [`Resolver`] yielding [`ProcedureOutput::Stream`].
pub(crate) fn into_stream_resolver<Input, Output, H>(handler: H) -> Resolver
where
    Input: DeserializeOwned + Send + 'static,
    Output: Serialize + Send + 'static,
    H: StreamHandler<Input, Output>,
{
    let handler = Arc::new(handler);
    Arc::new(move |ctx, req| {
        let handler = handler.clone();
        Box::pin(async move {
            trace!(path = %req.path, "Executing stream handler");
            let input: Input = decode_input(&req.path, req.input)?;
            let stream = handler.call(ctx, input).await?;
            let values: ValueStream =
                Box::pin(stream.map(|item| item.and_then(encode_output)));
            Ok(ProcedureOutput::Stream(values))
        })
    })
}

/// Box a raw resolver working on the request directly.
pub(crate) fn raw_resolver<F, Fut>(f: F) -> Resolver
where
    F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RpcResult<ProcedureOutput>> + Send + 'static,
{
    Arc::new(move |ctx, req| Box::pin(f(ctx, req)))
}
