//! HTTP request resolution
//!
//! [`HttpHandler::handle`] turns one [`HttpRequest`] into one [`HttpResponse`]:
//!
//! 1. `HEAD` is answered with 204. `GET` maps to queries and `POST` to mutations.
//! 2. `?batch=1` splits the comma-joined path into several calls.
//! 3. Limits are checked, the context is created once and the inputs are decoded.
//! 4. All calls run concurrently and share the context.
//! 5. The results are written in the negotiated [`ResponseStyle`].
//!
//! Anything that fails before step 4 produces a single error item instead of
//! one item per call.

use super::content_type::{ContentTypeDecoder, DecodedInputs, JsonDecoder, OctetStreamDecoder};
use super::formatter::{
    BodyFormatter, ResponseItem, ResponseMetaArgs, ResponseMetaFn, ResponseStyle, StreamMode,
    aggregate_status,
};
use super::types::{HttpRequest, HttpResponse, ResponseBody, percent_decode};
use crate::config::{ConfigValidationError, HttpConfig};
use crate::context::{ContextFactory, empty_context};
use crate::error::{ErrorEvent, OnErrorFn, catch_panic};
use crate::logging::{RequestId, log_batch_request};
use crate::procedure::ValueStream;
use crate::{Context, ProcedureOutput, ProcedureType, Router, RpcError, RpcResult};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, debug, info_span, warn};

/// Serves a [`Router`] over HTTP.
///
/// Cheap to clone; every clone shares the router, hooks and decoders.
///
/// # Example
/// ```rust,ignore
/// let handler = HttpHandler::new(router)
///     .with_create_context(create_context(|req: &HttpRequest| {
///         let user = req.header("x-user").map(str::to_owned);
///         async move { Ok(Context::new().with(CurrentUser(user))) }
///     }))
///     .with_on_error(on_error(|event| {
///         tracing::error!(path = ?event.path, code = %event.error.code, "Call failed");
///     }));
///
/// let response = handler.handle(request, "users.get").await;
/// ```
#[derive(Clone)]
pub struct HttpHandler {
    router: Router,
    config: Arc<HttpConfig>,
    create_context: ContextFactory,
    decoders: Vec<Arc<dyn ContentTypeDecoder>>,
    response_meta: Option<ResponseMetaFn>,
    on_error: Option<OnErrorFn>,
}

impl fmt::Debug for HttpHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let decoders: Vec<_> = self.decoders.iter().map(|d| d.name()).collect();
        f.debug_struct("HttpHandler")
            .field("router", &self.router)
            .field("config", &self.config)
            .field("decoders", &decoders)
            .field("has_response_meta", &self.response_meta.is_some())
            .field("has_on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Failure before any call ran, with the context if it was already created.
struct EarlyError {
    error: RpcError,
    ctx: Option<Context>,
}

impl From<RpcError> for EarlyError {
    fn from(error: RpcError) -> Self {
        Self { error, ctx: None }
    }
}

/// Everything needed to run the calls of one request.
struct Prepared {
    procedure_type: ProcedureType,
    ctx: Context,
    inputs: DecodedInputs,
}

/// Outcome of one step of a streamed call.
enum Settled {
    /// The call finished with a single item.
    Done { index: usize, item: ResponseItem },
    /// A streaming call produced its next chunk, ended, or failed.
    Chunk {
        index: usize,
        path: String,
        input: Value,
        chunk: RpcResult<Option<Value>>,
        stream: ValueStream,
    },
}

impl HttpHandler {
    /// Handler with default configuration, an empty context and the JSON and
    /// octet-stream decoders.
    pub fn new(router: Router) -> Self {
        Self {
            router,
            config: Arc::new(HttpConfig::default()),
            create_context: empty_context(),
            decoders: vec![Arc::new(JsonDecoder), Arc::new(OctetStreamDecoder)],
            response_meta: None,
            on_error: None,
        }
    }

    /// Set the per-request context factory.
    #[must_use = "This method returns a new HttpHandler and does not modify self"]
    pub fn with_create_context(mut self, factory: ContextFactory) -> Self {
        self.create_context = factory;
        self
    }

    /// Set the configuration after validating it.
    pub fn with_config(mut self, config: HttpConfig) -> Result<Self, ConfigValidationError> {
        config.validate()?;
        self.config = Arc::new(config);
        Ok(self)
    }

    /// Register a decoder. It is tried before the ones already registered.
    #[must_use = "This method returns a new HttpHandler and does not modify self"]
    pub fn with_decoder<D: ContentTypeDecoder + 'static>(mut self, decoder: D) -> Self {
        self.decoders.insert(0, Arc::new(decoder));
        self
    }

    /// Set the hook deciding status and extra headers.
    #[must_use = "This method returns a new HttpHandler and does not modify self"]
    pub fn with_response_meta(mut self, hook: ResponseMetaFn) -> Self {
        self.response_meta = Some(hook);
        self
    }

    /// Set the observer called with every error.
    #[must_use = "This method returns a new HttpHandler and does not modify self"]
    pub fn with_on_error(mut self, hook: OnErrorFn) -> Self {
        self.on_error = Some(hook);
        self
    }

    /// The served router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The active configuration.
    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Resolve `req` addressed to `path` (the URL path below the mount point).
    pub async fn handle(&self, req: HttpRequest, path: &str) -> HttpResponse {
        let request_id = RequestId::new();
        let span = info_span!("rpc.http", request_id = %request_id, method = %req.method);
        self.resolve(req, path, request_id).instrument(span).await
    }

    async fn resolve(&self, req: HttpRequest, path: &str, request_id: RequestId) -> HttpResponse {
        let start = Instant::now();
        if req.method.eq_ignore_ascii_case("HEAD") {
            debug!("Answering HEAD request");
            return HttpResponse::new(204);
        }

        let procedure_type = ProcedureType::from_http_method(&req.method);
        let is_batch = is_batch_request(&req);
        let paths: Vec<String> = if is_batch {
            percent_decode(path).split(',').map(str::to_string).collect()
        } else {
            vec![path.to_string()]
        };
        debug!(path = %path, batch_size = paths.len(), is_batch, "Resolving request");

        let Prepared {
            procedure_type,
            ctx,
            inputs,
        } = match self.prepare(&req, procedure_type, is_batch, &paths).await {
            Ok(prepared) => prepared,
            Err(EarlyError { error, ctx }) => {
                let response = self.early_error(error, procedure_type, &paths, ctx.as_ref());
                log_batch_request(
                    &request_id,
                    paths.len(),
                    paths.len(),
                    response.status,
                    start.elapsed().as_millis() as u64,
                );
                return response;
            }
        };

        let style = self.negotiate_style(&req, is_batch);
        if style.is_streaming() {
            return self.respond_streaming(style, procedure_type, paths, ctx, inputs, request_id, start);
        }

        let (response, error_count) = self
            .respond_buffered(style, procedure_type, &paths, &ctx, &inputs)
            .await;
        log_batch_request(
            &request_id,
            paths.len(),
            error_count,
            response.status,
            start.elapsed().as_millis() as u64,
        );
        response
    }

    /// Steps that fail the whole request: method, batching, limits, context, decoding.
    async fn prepare(
        &self,
        req: &HttpRequest,
        procedure_type: Option<ProcedureType>,
        is_batch: bool,
        paths: &[String],
    ) -> Result<Prepared, EarlyError> {
        let procedure_type = procedure_type.ok_or_else(|| {
            RpcError::method_not_supported(format!("Unsupported HTTP method \"{}\"", req.method))
        })?;

        if is_batch && !self.config.batching.enabled {
            return Err(RpcError::bad_request("Batching is not enabled on the server").into());
        }
        if paths.len() > self.config.batching.max_batch_size {
            return Err(RpcError::bad_request(format!(
                "Batch size {} exceeds the maximum of {}",
                paths.len(),
                self.config.batching.max_batch_size
            ))
            .into());
        }

        let size = req
            .body
            .len()
            .max(req.query_param("input").map_or(0, str::len));
        if size > self.config.max_body_size {
            return Err(RpcError::payload_too_large(format!(
                "Request of {size} bytes exceeds the maximum of {} bytes",
                self.config.max_body_size
            ))
            .into());
        }

        let ctx = catch_panic((self.create_context)(req)).await?;

        let Some(decoder) = self.decoders.iter().find(|decoder| decoder.is_match(req)) else {
            return Err(EarlyError {
                error: RpcError::bad_request(format!(
                    "Unsupported content-type \"{}\"",
                    req.content_type().unwrap_or_default()
                )),
                ctx: Some(ctx),
            });
        };
        debug!(decoder = decoder.name(), "Decoding inputs");

        match catch_panic(decoder.decode_inputs(req, is_batch)).await {
            Ok(inputs) => Ok(Prepared {
                procedure_type,
                ctx,
                inputs,
            }),
            Err(error) => Err(EarlyError {
                error,
                ctx: Some(ctx),
            }),
        }
    }

    /// Pick the response style from the batch flag and `trpc-batch-mode`.
    fn negotiate_style(&self, req: &HttpRequest, is_batch: bool) -> ResponseStyle {
        let requested = req
            .header(StreamMode::HEADER)
            .and_then(StreamMode::from_header);
        match (requested, is_batch) {
            (Some(mode), true) if self.config.streaming_enabled => mode.style(),
            (Some(mode), true) => {
                warn!(requested = ?mode, "Streaming is disabled, answering with a buffered batch");
                ResponseStyle::Batch
            }
            (Some(mode), false) => {
                warn!(requested = ?mode, "Streaming needs a batch call, answering with a single result");
                ResponseStyle::Single
            }
            (None, true) => ResponseStyle::Batch,
            (None, false) => ResponseStyle::Single,
        }
    }

    async fn call(
        &self,
        ctx: Context,
        procedure_type: ProcedureType,
        path: &str,
        input: Value,
    ) -> RpcResult<ProcedureOutput> {
        let kind = self.router.lookup(path).map(|procedure| procedure.kind());
        if kind == Some(ProcedureType::Subscription) {
            return Err(RpcError::method_not_supported(
                "Subscriptions are only served over the socket transport",
            ));
        }
        // POST normally maps to mutations only.
        let procedure_type = match (procedure_type, kind) {
            (ProcedureType::Mutation, Some(ProcedureType::Query)) if self.config.allow_method_override => {
                ProcedureType::Query
            }
            _ => procedure_type,
        };
        self.router.call(ctx, procedure_type, path, input).await
    }

    /// Report `error` to the observer and shape it as an item.
    fn error_item(
        &self,
        error: &RpcError,
        path: Option<&str>,
        procedure_type: Option<ProcedureType>,
        input: Option<&Value>,
        ctx: Option<&Context>,
    ) -> ResponseItem {
        if let Some(hook) = &self.on_error {
            hook(ErrorEvent {
                error,
                path,
                procedure_type,
                input,
                ctx,
            });
        }
        ResponseItem::error(self.router.error_shape(error, path))
    }

    /// Response head: content type, streaming headers, then the meta hook's overrides.
    fn head(&self, style: ResponseStyle, status: u16, args: ResponseMetaArgs<'_>) -> HttpResponse {
        let mut response = HttpResponse::new(status);
        response.headers.insert("content-type", style.content_type());
        if style.is_streaming() {
            response.headers.insert("transfer-encoding", "chunked");
            response.headers.append("vary", StreamMode::HEADER);
        }
        if let Some(hook) = &self.response_meta {
            let meta = hook(args);
            if let Some(status) = meta.status {
                response.status = status;
            }
            for (name, value) in meta.headers.iter() {
                response.headers.insert(name, value.clone());
            }
        }
        response
    }

    fn early_error(
        &self,
        error: RpcError,
        procedure_type: Option<ProcedureType>,
        paths: &[String],
        ctx: Option<&Context>,
    ) -> HttpResponse {
        warn!(
            error_code = %error.code,
            error_message = %error.message,
            "Request failed before any call ran"
        );
        let item = self.error_item(&error, None, procedure_type, None, ctx);
        let items = [item];
        let mut response = self.head(
            ResponseStyle::Single,
            items[0].http_status(),
            ResponseMetaArgs {
                paths,
                procedure_type,
                ctx,
                items: &items,
                errors: std::slice::from_ref(&error),
                eager_generation: false,
            },
        );

        let mut formatter = BodyFormatter::new(ResponseStyle::Single);
        let [item] = items;
        formatter.format(0, item);
        response.body = ResponseBody::Full(formatter.end());
        response
    }

    /// Run every call, wait for all of them and write an index-ordered body.
    async fn respond_buffered(
        &self,
        style: ResponseStyle,
        procedure_type: ProcedureType,
        paths: &[String],
        ctx: &Context,
        inputs: &DecodedInputs,
    ) -> (HttpResponse, usize) {
        let mut pending: FuturesUnordered<_> = paths
            .iter()
            .enumerate()
            .map(|(index, path)| {
                let input = inputs.get(index);
                async move {
                    let result = match self.call(ctx.clone(), procedure_type, path, input.clone()).await {
                        Ok(output) => catch_panic(output.collect()).await,
                        Err(error) => Err(error),
                    };
                    (index, path, input, result)
                }
            })
            .collect();

        let mut items = BTreeMap::new();
        let mut errors = Vec::new();
        while let Some((index, path, input, result)) = pending.next().await {
            let item = match result {
                Ok(data) => {
                    debug!(index, path = %path, "Call succeeded");
                    ResponseItem::data(data)
                }
                Err(error) => {
                    warn!(
                        index,
                        path = %path,
                        error_code = %error.code,
                        error_message = %error.message,
                        "Call failed"
                    );
                    let item = self.error_item(
                        &error,
                        Some(path.as_str()),
                        Some(procedure_type),
                        Some(&input),
                        Some(ctx),
                    );
                    errors.push(error);
                    item
                }
            };
            items.insert(index, item);
        }

        let items: Vec<ResponseItem> = items.into_values().collect();
        let mut response = self.head(
            style,
            aggregate_status(&items),
            ResponseMetaArgs {
                paths,
                procedure_type: Some(procedure_type),
                ctx: Some(ctx),
                items: &items,
                errors: &errors,
                eager_generation: false,
            },
        );

        let mut formatter = BodyFormatter::new(style);
        formatter.open();
        for (index, item) in items.into_iter().enumerate() {
            formatter.format(index, item);
        }
        response.body = ResponseBody::Full(formatter.end());
        (response, errors.len())
    }

    /// Write the head now and each frame as its call settles.
    fn respond_streaming(
        &self,
        style: ResponseStyle,
        procedure_type: ProcedureType,
        paths: Vec<String>,
        ctx: Context,
        inputs: DecodedInputs,
        request_id: RequestId,
        start: Instant,
    ) -> HttpResponse {
        let mut response = self.head(
            style,
            aggregate_status(&[]),
            ResponseMetaArgs {
                paths: &paths,
                procedure_type: Some(procedure_type),
                ctx: Some(&ctx),
                items: &[],
                errors: &[],
                eager_generation: true,
            },
        );
        debug!(?style, status = response.status, "Streaming response");

        let handler = self.clone();
        let batch_size = paths.len();
        let body = async_stream::stream! {
            let mut formatter = BodyFormatter::new(style);
            let opening = formatter.open();
            if !opening.is_empty() {
                yield opening;
            }

            let mut pending: FuturesUnordered<BoxFuture<'static, Settled>> = paths
                .iter()
                .enumerate()
                .map(|(index, path)| {
                    handler.clone().settle(ctx.clone(), procedure_type, index, path.clone(), inputs.get(index))
                })
                .collect();
            let mut next_chunk_index = batch_size;
            let mut error_count = 0;

            while let Some(settled) = pending.next().await {
                let frame = match settled {
                    Settled::Done { index, item } => {
                        if item.is_error() {
                            error_count += 1;
                        }
                        formatter.format(index, item)
                    }
                    Settled::Chunk { index, path, input, chunk: Ok(Some(data)), stream } => {
                        pending.push(next_chunk(index, path, input, stream));
                        let chunk_index = next_chunk_index;
                        next_chunk_index += 1;
                        formatter.format(chunk_index, ResponseItem::chunk(index, data))
                    }
                    Settled::Chunk { index, chunk: Ok(None), .. } => {
                        formatter.format(index, ResponseItem::data(Value::Null))
                    }
                    Settled::Chunk { index, path, input, chunk: Err(error), .. } => {
                        error_count += 1;
                        warn!(
                            index,
                            path = %path,
                            error_code = %error.code,
                            "Streamed call failed"
                        );
                        let item = handler.error_item(
                            &error,
                            Some(&path),
                            Some(procedure_type),
                            Some(&input),
                            Some(&ctx),
                        );
                        formatter.format(index, item)
                    }
                };
                if let Some(frame) = frame {
                    yield frame;
                }
            }

            yield formatter.end();
            log_batch_request(
                &request_id,
                batch_size,
                error_count,
                200,
                start.elapsed().as_millis() as u64,
            );
        };
        response.body = ResponseBody::Stream(Box::pin(body));
        response
    }

    /// Run one call to its first outcome.
    fn settle(
        self,
        ctx: Context,
        procedure_type: ProcedureType,
        index: usize,
        path: String,
        input: Value,
    ) -> BoxFuture<'static, Settled> {
        Box::pin(async move {
            match self.call(ctx.clone(), procedure_type, &path, input.clone()).await {
                Ok(ProcedureOutput::Value(data)) => Settled::Done {
                    index,
                    item: ResponseItem::data(data),
                },
                Ok(ProcedureOutput::Stream(stream)) => next_chunk(index, path, input, stream).await,
                Err(error) => {
                    warn!(index, path = %path, error_code = %error.code, "Call failed");
                    let item = self.error_item(
                        &error,
                        Some(&path),
                        Some(procedure_type),
                        Some(&input),
                        Some(&ctx),
                    );
                    Settled::Done { index, item }
                }
            }
        })
    }
}

/// Poll the next chunk of a streamed call.
fn next_chunk(
    index: usize,
    path: String,
    input: Value,
    mut stream: ValueStream,
) -> BoxFuture<'static, Settled> {
    Box::pin(async move {
        let chunk = catch_panic(async { stream.next().await.transpose() }).await;
        Settled::Chunk {
            index,
            path,
            input,
            chunk,
            stream,
        }
    })
}

fn is_batch_request(req: &HttpRequest) -> bool {
    matches!(req.query_param("batch"), Some("1" | "true"))
}
