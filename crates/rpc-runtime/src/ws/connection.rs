//! Socket protocol handler
//!
//! A [`SocketHandler`] serves a router to any number of persistent connections.
//! [`SocketHandler::connect`] returns a [`Connection`] to feed inbound text into
//! and a receiver of [`Outbound`] items for the transport adapter to write out.
//!
//! # Example
//! ```rust,ignore
//! let sockets = SocketHandler::new(router);
//! let (conn, mut outbound) = sockets.connect(&upgrade_request);
//!
//! tokio::spawn(async move {
//!     while let Some(item) = outbound.recv().await {
//!         match item {
//!             Outbound::Message(text) => ws_tx.send(text).await?,
//!             Outbound::Close => break,
//!         }
//!     }
//! });
//!
//! while let Some(text) = ws_rx.next().await {
//!     conn.handle_message(&text).await;
//! }
//! conn.close().await;
//! ```

use super::envelope::{
    EnvelopeId, JsonRpcVersion, ReconnectNotification, SocketMethod, SocketRequest,
    SocketResponse, SocketResult, parse_message,
};
use super::subscription::{CancellationSignal, ConnectionId, SubscriptionHandle, SubscriptionId};
use crate::config::{ConfigValidationError, SocketConfig};
use crate::context::{ContextFactory, empty_context};
use crate::error::{ErrorEvent, OnErrorFn, catch_panic};
use crate::http::HttpRequest;
use crate::logging::{
    ConnectionLogEvent, SubscriptionLogEvent, log_connection_event, log_subscription_event,
};
use crate::procedure::ValueStream;
use crate::{Context, ProcedureOutput, ProcedureType, Router, RpcError, RpcResult};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::StreamExt;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Item for the transport adapter to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text frame to send
    Message(String),
    /// Close the connection
    Close,
}

type SharedContext = Shared<BoxFuture<'static, RpcResult<Context>>>;

/// Serves a [`Router`] over persistent connections.
///
/// Cheap to clone; clones share the connection registry used by
/// [`broadcast_reconnect`](Self::broadcast_reconnect).
#[derive(Clone)]
pub struct SocketHandler {
    router: Router,
    config: Arc<SocketConfig>,
    create_context: ContextFactory,
    on_error: Option<OnErrorFn>,
    connections: Arc<DashMap<ConnectionId, mpsc::UnboundedSender<Outbound>>>,
}

impl fmt::Debug for SocketHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketHandler")
            .field("router", &self.router)
            .field("config", &self.config)
            .field("connections", &self.connections.len())
            .finish()
    }
}

impl SocketHandler {
    /// Handler with default configuration and an empty context.
    pub fn new(router: Router) -> Self {
        Self {
            router,
            config: Arc::new(SocketConfig::default()),
            create_context: empty_context(),
            on_error: None,
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Set the per-connection context factory. It receives the upgrade request.
    #[must_use = "This method returns a new SocketHandler and does not modify self"]
    pub fn with_create_context(mut self, factory: ContextFactory) -> Self {
        self.create_context = factory;
        self
    }

    /// Set the configuration after validating it.
    pub fn with_config(mut self, config: SocketConfig) -> Result<Self, ConfigValidationError> {
        config.validate()?;
        self.config = Arc::new(config);
        Ok(self)
    }

    /// Set the observer called with every error.
    #[must_use = "This method returns a new SocketHandler and does not modify self"]
    pub fn with_on_error(mut self, hook: OnErrorFn) -> Self {
        self.on_error = Some(hook);
        self
    }

    /// The served router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Open a connection for the upgrade request `req`.
    ///
    /// Context creation starts immediately. If it fails, the connection sends one
    /// `{"id":null,"error":..}` message followed by [`Outbound::Close`].
    pub fn connect(&self, req: &HttpRequest) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, receiver) = mpsc::unbounded_channel();
        let id = ConnectionId::new();
        let ctx: SharedContext = catch_panic((self.create_context)(req)).boxed().shared();

        let state = Arc::new(ConnectionState {
            id,
            handler: self.clone(),
            ctx: ctx.clone(),
            subscriptions: DashMap::new(),
            outbound: outbound.clone(),
            closed: AtomicBool::new(false),
        });
        self.connections.insert(id, outbound);
        log_connection_event(&id.to_string(), ConnectionLogEvent::Opened);

        let watcher = Arc::clone(&state);
        tokio::spawn(async move {
            if let Err(error) = ctx.await {
                log_connection_event(
                    &watcher.id.to_string(),
                    ConnectionLogEvent::ContextFailed { code: error.code },
                );
                watcher.report(&error, None, None, None, None);
                let shape = watcher.handler.router.error_shape(&error, None);
                watcher.send(SocketResponse::error(None, None, shape));
                watcher.send_raw(Outbound::Close);
            }
        });

        (Connection { state }, receiver)
    }

    /// Tell every open connection to reconnect. Returns how many were notified.
    pub fn broadcast_reconnect(&self) -> usize {
        let text = match serde_json::to_string(&ReconnectNotification::default()) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to serialize reconnect notification");
                return 0;
            }
        };
        let mut notified = 0;
        self.connections.retain(|id, outbound| {
            let delivered = outbound.send(Outbound::Message(text.clone())).is_ok();
            if delivered {
                notified += 1;
                log_connection_event(&id.to_string(), ConnectionLogEvent::ReconnectSent);
            }
            delivered
        });
        notified
    }
}

// =============================================================================
// Connection
// =============================================================================

struct ConnectionState {
    id: ConnectionId,
    handler: SocketHandler,
    ctx: SharedContext,
    subscriptions: DashMap<EnvelopeId, SubscriptionHandle>,
    outbound: mpsc::UnboundedSender<Outbound>,
    closed: AtomicBool,
}

/// One open socket connection.
///
/// Cheap to clone. Messages may be handled from several tasks at once; the
/// subscription map is shared by the clones of this connection only.
#[derive(Clone)]
pub struct Connection {
    state: Arc<ConnectionState>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.state.id)
            .field("subscriptions", &self.state.subscriptions.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.state.id
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.state.subscriptions.len()
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// Handle one inbound text message.
    ///
    /// Returns once every query and mutation in the message has been answered and
    /// every subscription has been started or rejected. Subscription values keep
    /// flowing from their own tasks afterwards.
    pub async fn handle_message(&self, text: &str) {
        let state = &self.state;
        if state.closed.load(Ordering::SeqCst) {
            trace!(connection_id = %state.id, "Ignoring message on closed connection");
            return;
        }

        let max = state.handler.config.max_message_size;
        if text.len() > max {
            let error = RpcError::payload_too_large(format!(
                "Message of {} bytes exceeds the maximum of {max} bytes",
                text.len()
            ));
            state.reject_message(error);
            return;
        }

        let requests = match parse_message(text) {
            Ok(requests) => requests,
            Err(error) => {
                state.reject_message(error);
                return;
            }
        };
        futures::future::join_all(
            requests
                .into_iter()
                .map(|request| Arc::clone(state).handle_request(request)),
        )
        .await;
    }

    /// Close the connection: stop every live subscription without answering and
    /// wait until each has released its source.
    pub async fn close(&self) {
        let state = &self.state;
        if state.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        state.handler.connections.remove(&state.id);

        let ids: Vec<EnvelopeId> = state
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, handle)) = state.subscriptions.remove(&id) {
                log_subscription_event(&handle.id().to_string(), handle.path(), SubscriptionLogEvent::Stopped);
                handle.stop().await;
                cancelled += 1;
            }
        }
        log_connection_event(
            &state.id.to_string(),
            ConnectionLogEvent::Closed {
                cancelled_subscriptions: cancelled,
            },
        );
    }
}

/// How a subscription's pump loop ended.
enum PumpEnd {
    Cancelled,
    Disconnected,
    Completed,
    Failed(RpcError),
}

impl Drop for ConnectionState {
    fn drop(&mut self) {
        self.handler.connections.remove(&self.id);
    }
}

impl ConnectionState {
    /// Queue `item` for the adapter. Returns `false` once the receiver is gone.
    fn send_raw(&self, item: Outbound) -> bool {
        if self.outbound.send(item).is_ok() {
            return true;
        }
        trace!(connection_id = %self.id, "Outbound receiver dropped");
        // Nobody is listening; stop offering this connection to broadcasts.
        self.handler.connections.remove(&self.id);
        false
    }

    /// Serialize and queue `response`. Returns `false` if it was not delivered.
    fn send(&self, response: SocketResponse) -> bool {
        match serde_json::to_string(&response) {
            Ok(text) => self.send_raw(Outbound::Message(text)),
            Err(e) => {
                warn!(connection_id = %self.id, error = %e, "Failed to serialize response");
                false
            }
        }
    }

    fn report(
        &self,
        error: &RpcError,
        path: Option<&str>,
        procedure_type: Option<ProcedureType>,
        input: Option<&Value>,
        ctx: Option<&Context>,
    ) {
        if let Some(hook) = &self.handler.on_error {
            hook(ErrorEvent {
                error,
                path,
                procedure_type,
                input,
                ctx,
            });
        }
    }

    /// Answer a message that could not be read at all.
    fn reject_message(&self, error: RpcError) {
        warn!(
            connection_id = %self.id,
            error_code = %error.code,
            error_message = %error.message,
            "Rejected socket message"
        );
        self.report(&error, None, None, None, None);
        let shape = self.handler.router.error_shape(&error, None);
        self.send(SocketResponse::error(None, None, shape));
    }

    async fn handle_request(self: Arc<Self>, request: SocketRequest) {
        let SocketRequest {
            id,
            jsonrpc,
            method,
            params,
        } = request;

        let Some(id) = id else {
            self.reject_message(RpcError::parse_error("`id` is required"));
            return;
        };

        let Some(procedure_type) = method.procedure_type() else {
            self.stop_subscription(id, jsonrpc).await;
            return;
        };
        let Some(params) = params else {
            self.reject_message(RpcError::parse_error("`params` is required"));
            return;
        };

        let ctx = match self.ctx.clone().await {
            Ok(ctx) => ctx,
            Err(error) => {
                self.fail(id, jsonrpc, &error, &params.path, procedure_type, &params.input, None);
                return;
            }
        };

        let output = self
            .handler
            .router
            .call(ctx.clone(), procedure_type, &params.path, params.input.clone())
            .await;

        let result = match (method, output) {
            (SocketMethod::Subscription, Ok(ProcedureOutput::Stream(stream))) => {
                self.start_subscription(id, jsonrpc, params.path, params.input, ctx, stream);
                return;
            }
            (SocketMethod::Subscription, Ok(ProcedureOutput::Value(_))) => Err(RpcError::internal(
                format!("Subscription {} did not return a stream", params.path),
            )),
            (_, Ok(output)) => catch_panic(output.collect()).await,
            (_, Err(error)) => Err(error),
        };

        match result {
            Ok(data) => {
                self.send(SocketResponse::result(Some(id), jsonrpc, SocketResult::Data { data }));
            }
            Err(error) => {
                self.fail(id, jsonrpc, &error, &params.path, procedure_type, &params.input, Some(&ctx))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn fail(
        &self,
        id: EnvelopeId,
        jsonrpc: Option<JsonRpcVersion>,
        error: &RpcError,
        path: &str,
        procedure_type: ProcedureType,
        input: &Value,
        ctx: Option<&Context>,
    ) {
        debug!(
            connection_id = %self.id,
            request_id = %id,
            path = %path,
            error_code = %error.code,
            "Socket request failed"
        );
        self.report(error, Some(path), Some(procedure_type), Some(input), ctx);
        let shape = self.handler.router.error_shape(error, Some(path));
        self.send(SocketResponse::error(Some(id), jsonrpc, shape));
    }

    fn start_subscription(
        self: Arc<Self>,
        id: EnvelopeId,
        jsonrpc: Option<JsonRpcVersion>,
        path: String,
        input: Value,
        ctx: Context,
        stream: ValueStream,
    ) {
        if self.closed.load(Ordering::SeqCst) {
            debug!(connection_id = %self.id, path = %path, "Connection closed while subscribing");
            return;
        }

        let signal = Arc::new(CancellationSignal::new());
        let handle = SubscriptionHandle::new(path.as_str(), Arc::clone(&signal));
        let subscription_id = handle.id();

        let live = self.subscriptions.len();
        let max = self.handler.config.max_subscriptions_per_connection;
        let rejection = match self.subscriptions.entry(id.clone()) {
            Entry::Occupied(_) => {
                log_subscription_event(
                    &subscription_id.to_string(),
                    &path,
                    SubscriptionLogEvent::DuplicateRejected,
                );
                Some(RpcError::bad_request(format!("Duplicate id {id}")))
            }
            Entry::Vacant(_) if live >= max => Some(RpcError::too_many_requests(format!(
                "Too many subscriptions on this connection (max {max})"
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(handle);
                None
            }
        };
        if let Some(error) = rejection {
            // The new subscription loses; its source is released right here.
            drop(stream);
            self.fail(id, jsonrpc, &error, &path, ProcedureType::Subscription, &input, Some(&ctx));
            return;
        }
        // `close` may have swept the map between the first check and the insert.
        if self.closed.load(Ordering::SeqCst) {
            self.subscriptions
                .remove_if(&id, |_, handle| handle.id() == subscription_id);
            drop(stream);
            debug!(connection_id = %self.id, path = %path, "Connection closed while subscribing");
            return;
        }

        log_subscription_event(&subscription_id.to_string(), &path, SubscriptionLogEvent::Started);
        if !self.send(SocketResponse::result(Some(id.clone()), jsonrpc, SocketResult::Started)) {
            self.subscriptions
                .remove_if(&id, |_, handle| handle.id() == subscription_id);
            return;
        }

        let task = tokio::spawn(Arc::clone(&self).pump(
            id.clone(),
            jsonrpc,
            subscription_id,
            path,
            input,
            ctx,
            stream,
            signal,
        ));
        match self.subscriptions.get_mut(&id) {
            Some(mut entry) if entry.id() == subscription_id => entry.set_task(task),
            // Already finished and removed itself.
            _ => drop(task),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn pump(
        self: Arc<Self>,
        id: EnvelopeId,
        jsonrpc: Option<JsonRpcVersion>,
        subscription_id: SubscriptionId,
        path: String,
        input: Value,
        ctx: Context,
        mut stream: ValueStream,
        signal: Arc<CancellationSignal>,
    ) {
        let sub_id = subscription_id.to_string();
        let end = loop {
            tokio::select! {
                biased;
                _ = signal.cancelled() => break PumpEnd::Cancelled,
                next = catch_panic(async { stream.next().await.transpose() }) => match next {
                    Ok(Some(data)) => {
                        let delivered = self.send(SocketResponse::result(
                            Some(id.clone()),
                            jsonrpc,
                            SocketResult::Data { data },
                        ));
                        if !delivered {
                            break PumpEnd::Disconnected;
                        }
                        log_subscription_event(&sub_id, &path, SubscriptionLogEvent::DataSent);
                    }
                    Ok(None) => break PumpEnd::Completed,
                    Err(error) => break PumpEnd::Failed(error),
                },
            }
        };
        drop(stream);

        if let PumpEnd::Cancelled = end {
            return;
        }
        if let Some((_, mut handle)) = self
            .subscriptions
            .remove_if(&id, |_, handle| handle.id() == subscription_id)
        {
            handle.detach();
        }

        match end {
            PumpEnd::Completed => {
                log_subscription_event(&sub_id, &path, SubscriptionLogEvent::Completed);
                self.send(SocketResponse::result(Some(id), jsonrpc, SocketResult::Stopped));
            }
            PumpEnd::Failed(error) => {
                log_subscription_event(
                    &sub_id,
                    &path,
                    SubscriptionLogEvent::Error {
                        code: error.code,
                        message: error.message.clone(),
                    },
                );
                self.fail(id, jsonrpc, &error, &path, ProcedureType::Subscription, &input, Some(&ctx));
            }
            PumpEnd::Disconnected => {
                log_subscription_event(&sub_id, &path, SubscriptionLogEvent::Stopped);
            }
            PumpEnd::Cancelled => {}
        }
    }

    /// Stop the subscription `id` and answer `stopped`, whether or not it was live.
    async fn stop_subscription(&self, id: EnvelopeId, jsonrpc: Option<JsonRpcVersion>) {
        match self.subscriptions.remove(&id) {
            Some((_, handle)) => {
                log_subscription_event(&handle.id().to_string(), handle.path(), SubscriptionLogEvent::Stopped);
                handle.stop().await;
            }
            None => trace!(connection_id = %self.id, request_id = %id, "Stop for unknown subscription"),
        }
        self.send(SocketResponse::result(Some(id), jsonrpc, SocketResult::Stopped));
    }
}
