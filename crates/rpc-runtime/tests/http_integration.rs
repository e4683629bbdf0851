//! Integration tests for the HTTP transport
//!
//! These tests drive a small blog API end to end: context from headers,
//! an auth middleware, parsers, batching and streamed responses.

use futures::StreamExt;
use rpc_runtime::http::{HttpHandler, HttpRequest, ResponseBody, StreamMode};
use rpc_runtime::{
    Context, ErrorConfig, MiddlewareResult, Next, Procedure, Request, Router, RpcError,
    RpcErrorCode, RpcResult, Validate, ValidationRules, create_context, validated,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

// =============================================================================
// Test API
// =============================================================================

#[derive(Debug, Clone)]
struct Session {
    user: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct Store {
    posts: Arc<Mutex<Vec<Post>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Post {
    id: usize,
    title: String,
    author: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct NewPost {
    title: String,
}

impl Validate for NewPost {
    fn validate(&self) -> rpc_runtime::ValidationResult {
        ValidationRules::new()
            .required("title", &self.title)
            .max_length("title", &self.title, 20)
            .build()
    }
}

struct Author(String);

fn app() -> HttpHandler {
    let authed = Procedure::builder().use_middleware(|ctx: Context, req: Request, next: Next| async move {
        let user = ctx.get::<Session>().and_then(|session| session.user.clone());
        let Some(user) = user else {
            return MiddlewareResult::error(RpcError::unauthorized("Sign in first"));
        };
        next.run(Context::new().with(Author(user)), req).await
    });

    let router = Router::builder()
        .router(
            "post",
            Router::builder()
                .procedure(
                    "list",
                    Procedure::builder().query(|ctx: Context, _input: Value| async move {
                        let store = ctx.require::<Store>()?;
                        let posts = store.posts.lock().unwrap().clone();
                        RpcResult::Ok(posts)
                    }),
                )
                .procedure(
                    "byId",
                    Procedure::builder().query(|ctx: Context, id: usize| async move {
                        let store = ctx.require::<Store>()?;
                        let post = store.posts.lock().unwrap().iter().find(|p| p.id == id).cloned();
                        post.ok_or_else(|| RpcError::not_found(format!("Post {id} not found")))
                    }),
                )
                .procedure(
                    "create",
                    authed
                        .clone()
                        .input(validated::<NewPost>())
                        .mutation(|ctx: Context, input: NewPost| async move {
                            let store = ctx.require::<Store>()?;
                            let author = ctx.require::<Author>()?.0.clone();
                            let mut posts = store.posts.lock().unwrap();
                            let post = Post {
                                id: posts.len() + 1,
                                title: input.title,
                                author,
                            };
                            posts.push(post.clone());
                            RpcResult::Ok(post)
                        }),
                )
                .procedure(
                    "titles",
                    Procedure::builder().query_stream(|ctx: Context, _input: Value| async move {
                        let store = ctx.require::<Store>()?;
                        let titles: Vec<_> = store
                            .posts
                            .lock()
                            .unwrap()
                            .iter()
                            .map(|p| RpcResult::Ok(p.title.clone()))
                            .collect();
                        RpcResult::Ok(futures::stream::iter(titles))
                    }),
                ),
        )
        .with_error_config(ErrorConfig::production())
        .build()
        .unwrap();

    let store = Store::default();
    HttpHandler::new(router).with_create_context(create_context(move |req: &HttpRequest| {
        let session = Session {
            user: req.header("authorization").map(|v| v.trim_start_matches("Bearer ").to_string()),
        };
        let store = store.clone();
        async move { RpcResult::Ok(Context::new().with(session).with(store)) }
    }))
}

async fn json(response: rpc_runtime::http::HttpResponse) -> Value {
    serde_json::from_str(&response.text().await).unwrap()
}

fn create(title: &str) -> HttpRequest {
    HttpRequest::post()
        .with_header("content-type", "application/json")
        .with_header("authorization", "Bearer ada")
        .with_body(json!({ "title": title }).to_string())
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn test_create_then_read() {
    let app = app();

    let created = json(app.handle(create("Hello"), "post.create").await).await;
    assert_eq!(
        created,
        json!({"result": {"data": {"id": 1, "title": "Hello", "author": "ada"}}})
    );

    let req = HttpRequest::get().with_query("input", "1");
    let post = json(app.handle(req, "post.byId").await).await;
    assert_eq!(post["result"]["data"]["title"], json!("Hello"));
}

#[tokio::test]
async fn test_unauthenticated_mutation() {
    let req = HttpRequest::post().with_body(r#"{"title":"Hi"}"#);
    let response = app().handle(req, "post.create").await;

    assert_eq!(response.status, 401);
    let body = json(response).await;
    assert_eq!(body["error"]["code"], json!(-32001));
    assert_eq!(body["error"]["data"]["code"], json!("UNAUTHORIZED"));
    assert_eq!(body["error"]["data"]["path"], json!("post.create"));
}

#[tokio::test]
async fn test_validation_failure_reports_issues() {
    let response = app().handle(create(""), "post.create").await;

    assert_eq!(response.status, 400);
    let body = json(response).await;
    assert_eq!(body["error"]["data"]["code"], json!("BAD_REQUEST"));
    assert!(body["error"]["data"]["details"]["issues"].is_array());
    // Production mode never leaks stacks.
    assert!(body["error"]["data"].get("stack").is_none());
}

#[tokio::test]
async fn test_batch_with_mixed_outcomes() {
    let app = app();
    app.handle(create("First"), "post.create").await;

    let req = HttpRequest::get()
        .with_query("batch", "1")
        .with_query("input", r#"{"0":1,"1":99}"#);
    let response = app.handle(req, "post.byId,post.byId,post.list").await;

    assert_eq!(response.status, 207);
    let body = json(response).await;
    assert_eq!(body[0]["result"]["data"]["title"], json!("First"));
    assert_eq!(body[1]["error"]["message"], json!("Post 99 not found"));
    assert_eq!(body[2]["result"]["data"].as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn test_streamed_titles() {
    let app = app();
    app.handle(create("One"), "post.create").await;
    app.handle(create("Two"), "post.create").await;

    let req = HttpRequest::get()
        .with_query("batch", "1")
        .with_header(StreamMode::HEADER, "stream/sse");
    let response = app.handle(req, "post.titles").await;
    assert_eq!(response.header("content-type"), Some("text/event-stream"));

    let ResponseBody::Stream(body) = response.body else {
        panic!("expected a streamed body");
    };
    let frames: Vec<String> = body.collect().await;
    assert_eq!(frames.first().map(String::as_str), Some("data: {\"type\":\"start\"}\n\n"));
    assert_eq!(frames.last().map(String::as_str), Some("data: {\"type\":\"end\"}\n\n"));

    let payloads: Vec<Value> = frames[1..frames.len() - 1]
        .iter()
        .map(|frame| {
            let data = frame.lines().find_map(|line| line.strip_prefix("data: ")).unwrap();
            serde_json::from_str(data).unwrap()
        })
        .collect();
    assert_eq!(
        payloads,
        vec![
            json!({"result": {"data": "One"}, "id": 0}),
            json!({"result": {"data": "Two"}, "id": 0}),
            json!({"result": {"data": null}}),
        ]
    );
}

#[tokio::test]
async fn test_head_and_unsupported_methods() {
    let app = app();
    assert_eq!(app.handle(HttpRequest::new("HEAD"), "post.list").await.status, 204);

    let response = app.handle(HttpRequest::new("DELETE"), "post.list").await;
    assert_eq!(response.status, 405);
    assert_eq!(
        json(response).await["error"]["data"]["code"],
        json!(RpcErrorCode::MethodNotSupported.as_str())
    );
}
