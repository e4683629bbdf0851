#![warn(missing_docs)]
//! # RPC Runtime
//!
//! Request resolution and subscription engine for tRPC-style procedure routers.
//!
//! ## Overview
//!
//! - **Procedures** with ordered middleware, input/output parsers and typed resolvers
//! - **Router registry** that flattens nested routers into dotted paths
//! - **HTTP pipeline** with batching, concurrent execution and four response styles
//! - **Socket protocol** with queries, mutations and long-lived subscriptions
//! - **Structured errors** with fifteen codes and one wire shape for every transport
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐   ┌──────────────────────────────┐
//! │  HttpHandler                 │   │  SocketHandler / Connection  │
//! │  method → type, ?batch=1,    │   │  envelopes, subscription map │
//! │  context once, decode inputs │   │  context once per connection │
//! └──────────────┬───────────────┘   └──────────────┬───────────────┘
//!                │ N concurrent calls               │ one call per request
//!                ▼                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Router: path → Procedure                                       │
//! └────────────────────────────────┬────────────────────────────────┘
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Middleware chain: mw₀ → mw₁ → … → input parser → resolver      │
//! │  errors travel back up as data                                  │
//! └─────────────────────────────────────────────────────────────────┘
//!                │                                  │
//!                ▼                                  ▼
//!   BodyFormatter (single, batch,        {id, result:{type:"data"}}
//!   json-stream, event-stream)           {id, error:{..}}
//! ```
//!
//! ## Quick Start
//!
//! ### 1. Define procedures
//!
//! ```rust,ignore
//! use rpc_runtime::prelude::*;
//!
//! #[derive(Deserialize, Serialize)]
//! struct GetUser { id: String }
//!
//! let get_user = Procedure::builder()
//!     .input(schema::<GetUser>())
//!     .query(|ctx: Context, input: GetUser| async move {
//!         let db = ctx.require::<Db>()?;
//!         db.find_user(&input.id).ok_or_else(|| RpcError::not_found("User not found"))
//!     });
//!
//! let on_event = Procedure::builder().subscription(|_ctx: Context, offset: i64| async move {
//!     Ok(events().map(move |n| Ok(n + offset)))
//! });
//! ```
//!
//! ### 2. Build the router
//!
//! ```rust,ignore
//! let router = Router::builder()
//!     .router("users", Router::builder().procedure("get", get_user))
//!     .procedure("onEvent", on_event)
//!     .build()?;
//! ```
//!
//! ### 3. Serve it
//!
//! ```rust,ignore
//! let http = HttpHandler::new(router.clone())
//!     .with_create_context(create_context(|_req: &HttpRequest| async { Ok(Context::new().with(db())) }));
//! let response = http.handle(request, "users.get").await;
//!
//! let sockets = SocketHandler::new(router);
//! let (connection, outbound) = sockets.connect(&upgrade_request);
//! connection.handle_message(r#"{"id":1,"method":"subscription","params":{"path":"onEvent","input":5}}"#).await;
//! ```
//!
//! ## Middleware
//!
//! ```rust,ignore
//! let authed = Procedure::builder().use_middleware(|ctx: Context, req: Request, next: Next| async move {
//!     let Some(user) = ctx.get::<Session>().and_then(|s| s.user.clone()) else {
//!         return MiddlewareResult::error(RpcError::unauthorized("Sign in first"));
//!     };
//!     next.run(Context::new().with(user), req).await
//! });
//! ```
//!
//! ## Module Structure
//!
//! - [`procedure`] - Procedure builder and outputs
//! - [`middleware`] - Chain executor, [`Next`] and [`MiddlewareResult`]
//! - [`parser`] / [`validation`] - Input and output parsers
//! - [`Router`] - Registry and server-side [`Caller`]
//! - [`http`] - HTTP resolution pipeline and response formatter
//! - [`ws`] - Socket protocol handler
//! - [`logging`] - Structured logging helpers and middleware

mod config;
mod context;
mod error;
mod handler;
pub mod http;
pub mod logging;
pub mod middleware;
pub mod parser;
pub mod procedure;
mod router;
pub mod validation;
pub mod ws;

#[cfg(test)]
mod tests;

// Public API
pub use config::{BatchConfig, ConfigValidationError, HttpConfig, SocketConfig};
pub use context::{Context, ContextFactory, create_context, empty_context};
pub use error::{
    ErrorConfig, ErrorData, ErrorEvent, ErrorShape, ErrorTransformer, OnErrorFn, RpcError,
    RpcErrorCode, RpcResult, on_error,
};
pub use handler::{Handler, Resolver, StreamHandler};
pub use middleware::{
    Middleware, MiddlewareFn, MiddlewareResult, Next, ProcedureType, Request, from_fn,
};
pub use parser::{ParseError, Parser, schema, validated};
pub use procedure::{Procedure, ProcedureBuilder, ProcedureOutput, ValueStream};
pub use router::{Caller, RESERVED_KEYS, Router, RouterBuildError, RouterBuilder, RouterNode};
pub use validation::{FieldError, Validate, ValidationResult, ValidationRules};

/// Prelude for convenient imports
///
/// ```rust,ignore
/// use rpc_runtime::prelude::*;
/// ```
pub mod prelude {
    pub use crate::http::{HttpHandler, HttpRequest, HttpResponse};
    pub use crate::ws::{Connection, Outbound, SocketHandler};
    pub use crate::{
        BatchConfig, Context, ErrorConfig, HttpConfig, Middleware, MiddlewareResult, Next,
        Procedure, ProcedureOutput, ProcedureType, Request, Router, RpcError, RpcErrorCode,
        RpcResult, SocketConfig, Validate, ValidationRules, create_context, from_fn, on_error,
        schema, validated,
    };
    pub use serde::{Deserialize, Serialize};
}
