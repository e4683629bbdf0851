//! Socket protocol scenarios: subscriptions, duplicates, close and reconnect

use crate::http::HttpRequest;
use crate::ws::{Connection, Outbound, SocketHandler};
use crate::{
    Context, Procedure, Router, RpcError, RpcErrorCode, RpcResult, SocketConfig, create_context,
    on_error,
};
use async_stream::stream;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

/// Counts how many subscription sources were released.
struct DropGuard(Arc<AtomicUsize>);

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn router(released: Arc<AtomicUsize>) -> Router {
    let idle_released = released.clone();
    let late_released = released.clone();
    Router::builder()
        .procedure(
            "greet",
            Procedure::builder().query(|_ctx: Context, name: String| async move {
                RpcResult::Ok(format!("hello {name}"))
            }),
        )
        .procedure(
            "addOne",
            Procedure::builder().mutation(|_ctx: Context, n: i64| async move { RpcResult::Ok(n + 1) }),
        )
        .procedure(
            "onEvent",
            Procedure::builder().subscription(|_ctx: Context, offset: i64| async move {
                RpcResult::Ok(futures::stream::iter([RpcResult::Ok(10 + offset)]))
            }),
        )
        .procedure(
            "ticks",
            Procedure::builder().subscription(move |_ctx: Context, _input: Value| {
                let guard = DropGuard(released.clone());
                async move {
                    RpcResult::Ok(stream! {
                        let _guard = guard;
                        let mut n = 0i64;
                        loop {
                            yield RpcResult::Ok(n);
                            n += 1;
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                    })
                }
            }),
        )
        .procedure(
            "idle",
            Procedure::builder().subscription(move |_ctx: Context, _input: Value| {
                let guard = DropGuard(idle_released.clone());
                async move {
                    RpcResult::Ok(stream! {
                        let _guard = guard;
                        futures::future::pending::<()>().await;
                        yield RpcResult::Ok(0i64);
                    })
                }
            }),
        )
        .procedure(
            "late",
            Procedure::builder().subscription(move |_ctx: Context, _input: Value| {
                let guard = DropGuard(late_released.clone());
                async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    RpcResult::Ok(stream! {
                        let _guard = guard;
                        futures::future::pending::<()>().await;
                        yield RpcResult::Ok(0i64);
                    })
                }
            }),
        )
        .procedure(
            "flaky",
            Procedure::builder().subscription(|_ctx: Context, _input: Value| async move {
                RpcResult::Ok(futures::stream::iter([
                    RpcResult::Ok(1),
                    Err(RpcError::internal("Feed went away")),
                ]))
            }),
        )
        .procedure(
            "notAStream",
            Procedure::builder().query(|_ctx: Context, _input: Value| async move { RpcResult::Ok(1) }),
        )
        .build()
        .unwrap()
}

fn setup() -> (SocketHandler, Arc<AtomicUsize>) {
    let released = Arc::new(AtomicUsize::new(0));
    (SocketHandler::new(router(released.clone())), released)
}

async fn recv(outbound: &mut UnboundedReceiver<Outbound>) -> Outbound {
    tokio::time::timeout(Duration::from_secs(1), outbound.recv())
        .await
        .expect("timed out waiting for outbound item")
        .expect("outbound channel closed")
}

async fn recv_json(outbound: &mut UnboundedReceiver<Outbound>) -> Value {
    match recv(outbound).await {
        Outbound::Message(text) => serde_json::from_str(&text).unwrap(),
        Outbound::Close => panic!("expected a message, got close"),
    }
}

/// Next message that is not a `data` frame.
async fn recv_control(outbound: &mut UnboundedReceiver<Outbound>) -> Value {
    loop {
        let message = recv_json(outbound).await;
        if message["result"]["type"] != json!("data") {
            return message;
        }
    }
}

fn subscribe(id: i64, path: &str) -> String {
    json!({"id": id, "method": "subscription", "params": {"path": path}}).to_string()
}

fn connect(handler: &SocketHandler) -> (Connection, UnboundedReceiver<Outbound>) {
    handler.connect(&HttpRequest::get())
}

/// Poll `released` until it reaches `expected`.
async fn wait_released(released: &AtomicUsize, expected: usize) {
    let reached = tokio::time::timeout(Duration::from_secs(1), async {
        while released.load(Ordering::SeqCst) < expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "released {} of {expected} sources",
        released.load(Ordering::SeqCst)
    );
}

/// Next message whose `id` is `id`, skipping frames for other ids.
async fn recv_for(outbound: &mut UnboundedReceiver<Outbound>, id: Value) -> Value {
    loop {
        let message = recv_json(outbound).await;
        if message["id"] == id {
            return message;
        }
    }
}

// =============================================================================
// Queries and mutations
// =============================================================================

#[tokio::test]
async fn test_query_response() {
    let (handler, _) = setup();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(
        r#"{"id":"q","jsonrpc":"2.0","method":"query","params":{"path":"greet","input":"bob"}}"#,
    )
    .await;
    assert_eq!(
        recv_json(&mut outbound).await,
        json!({"id": "q", "jsonrpc": "2.0", "result": {"type": "data", "data": "hello bob"}})
    );
}

#[tokio::test]
async fn test_array_message_answers_each_request() {
    let (handler, _) = setup();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(
        r#"[{"id":1,"method":"query","params":{"path":"greet","input":"a"}},
            {"id":2,"method":"mutation","params":{"path":"addOne","input":41}}]"#,
    )
    .await;

    let mut answers = vec![recv_json(&mut outbound).await, recv_json(&mut outbound).await];
    answers.sort_by_key(|answer| answer["id"].as_i64());
    assert_eq!(answers[0]["result"]["data"], json!("hello a"));
    assert_eq!(answers[1]["result"]["data"], json!(42));
}

#[tokio::test]
async fn test_wrong_method_for_path_is_not_found() {
    let (handler, _) = setup();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(r#"{"id":3,"method":"mutation","params":{"path":"greet","input":"x"}}"#)
        .await;
    let answer = recv_json(&mut outbound).await;
    assert_eq!(answer["id"], json!(3));
    assert_eq!(answer["error"]["data"]["code"], json!("NOT_FOUND"));
    assert_eq!(answer["error"]["data"]["path"], json!("greet"));
}

#[tokio::test]
async fn test_null_id_is_rejected() {
    let (handler, _) = setup();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(r#"{"id":null,"method":"query","params":{"path":"greet","input":"x"}}"#)
        .await;
    let answer = recv_json(&mut outbound).await;
    assert_eq!(answer["id"], Value::Null);
    assert_eq!(answer["error"]["data"]["code"], json!("PARSE_ERROR"));
}

#[tokio::test]
async fn test_unparseable_message_is_parse_error() {
    let (handler, _) = setup();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message("definitely not json").await;
    let answer = recv_json(&mut outbound).await;
    assert_eq!(answer["id"], Value::Null);
    assert_eq!(answer["error"]["code"], json!(-32700));
}

#[tokio::test]
async fn test_oversized_message_is_rejected() {
    let released = Arc::new(AtomicUsize::new(0));
    let handler = SocketHandler::new(router(released))
        .with_config(SocketConfig::new().with_max_message_size(32))
        .unwrap();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(&subscribe(1, "onEvent")).await;
    let answer = recv_json(&mut outbound).await;
    assert_eq!(answer["id"], Value::Null);
    assert_eq!(answer["error"]["data"]["code"], json!("PAYLOAD_TOO_LARGE"));
    assert_eq!(conn.subscription_count(), 0);
}

// =============================================================================
// Subscriptions
// =============================================================================

#[tokio::test]
async fn test_subscription_started_data_stopped() {
    let (handler, _) = setup();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(
        r#"{"id":1,"method":"subscription","params":{"path":"onEvent","input":5}}"#,
    )
    .await;

    assert_eq!(
        recv_json(&mut outbound).await,
        json!({"id": 1, "result": {"type": "started"}})
    );
    assert_eq!(
        recv_json(&mut outbound).await,
        json!({"id": 1, "result": {"type": "data", "data": 15}})
    );
    assert_eq!(
        recv_json(&mut outbound).await,
        json!({"id": 1, "result": {"type": "stopped"}})
    );
    assert_eq!(conn.subscription_count(), 0);
}

#[tokio::test]
async fn test_subscription_stop_releases_source() {
    let (handler, released) = setup();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(&subscribe(7, "ticks")).await;
    assert_eq!(recv_json(&mut outbound).await["result"]["type"], json!("started"));
    assert_eq!(recv_json(&mut outbound).await["result"]["type"], json!("data"));
    assert_eq!(conn.subscription_count(), 1);

    conn.handle_message(r#"{"id":7,"method":"subscription.stop"}"#).await;
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(conn.subscription_count(), 0);
    assert_eq!(
        recv_control(&mut outbound).await,
        json!({"id": 7, "result": {"type": "stopped"}})
    );
}

#[tokio::test]
async fn test_stopping_unknown_id_still_answers_stopped() {
    let (handler, _) = setup();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(r#"{"id":"ghost","method":"subscription.stop"}"#).await;
    assert_eq!(
        recv_json(&mut outbound).await,
        json!({"id": "ghost", "result": {"type": "stopped"}})
    );
}

#[tokio::test]
async fn test_duplicate_id_keeps_first_subscription() {
    let (handler, released) = setup();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(&subscribe(1, "ticks")).await;
    assert_eq!(recv_json(&mut outbound).await["result"]["type"], json!("started"));

    conn.handle_message(&subscribe(1, "ticks")).await;
    let answer = loop {
        let message = recv_json(&mut outbound).await;
        if message.get("error").is_some() {
            break message;
        }
        assert_eq!(message["result"]["type"], json!("data"));
    };
    assert_eq!(answer["id"], json!(1));
    assert_eq!(answer["error"]["data"]["code"], json!("BAD_REQUEST"));
    assert_eq!(answer["error"]["message"], json!("Duplicate id 1"));

    // Only the rejected source was released; the first one keeps emitting.
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(conn.subscription_count(), 1);
    let mut last = -1;
    for _ in 0..3 {
        let frame = recv_json(&mut outbound).await;
        assert_eq!(frame["id"], json!(1));
        assert_eq!(frame["result"]["type"], json!("data"));
        let n = frame["result"]["data"].as_i64().unwrap();
        assert!(n > last);
        last = n;
    }

    conn.handle_message(r#"{"id":1,"method":"subscription.stop"}"#).await;
    assert_eq!(released.load(Ordering::SeqCst), 2);
    assert_eq!(recv_control(&mut outbound).await["result"]["type"], json!("stopped"));
}

#[tokio::test]
async fn test_id_can_be_reused_after_completion() {
    let (handler, _) = setup();
    let (conn, mut outbound) = connect(&handler);

    for offset in [1, 2] {
        let message = json!({"id": 9, "method": "subscription", "params": {"path": "onEvent", "input": offset}});
        conn.handle_message(&message.to_string()).await;
        assert_eq!(recv_json(&mut outbound).await["result"]["type"], json!("started"));
        assert_eq!(
            recv_json(&mut outbound).await["result"]["data"],
            json!(10 + offset)
        );
        assert_eq!(recv_json(&mut outbound).await["result"]["type"], json!("stopped"));
    }
}

#[tokio::test]
async fn test_subscription_error_sends_error_frame() {
    let (handler, _) = setup();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(&subscribe(4, "flaky")).await;
    assert_eq!(recv_json(&mut outbound).await["result"]["type"], json!("started"));
    assert_eq!(recv_json(&mut outbound).await["result"]["data"], json!(1));

    let answer = recv_json(&mut outbound).await;
    assert_eq!(answer["id"], json!(4));
    assert_eq!(answer["error"]["data"]["code"], json!("INTERNAL_SERVER_ERROR"));
    assert_eq!(answer["error"]["message"], json!("Feed went away"));
    assert_eq!(conn.subscription_count(), 0);
}

#[tokio::test]
async fn test_subscription_method_on_query_path_is_not_found() {
    let (handler, _) = setup();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(&subscribe(5, "notAStream")).await;
    let answer = recv_json(&mut outbound).await;
    assert_eq!(answer["error"]["data"]["code"], json!("NOT_FOUND"));
}

#[tokio::test]
async fn test_subscription_cap_per_connection() {
    let released = Arc::new(AtomicUsize::new(0));
    let handler = SocketHandler::new(router(released))
        .with_config(SocketConfig::new().with_max_subscriptions(1))
        .unwrap();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(&subscribe(1, "idle")).await;
    assert_eq!(recv_json(&mut outbound).await["result"]["type"], json!("started"));

    conn.handle_message(&subscribe(2, "idle")).await;
    let answer = recv_json(&mut outbound).await;
    assert_eq!(answer["id"], json!(2));
    assert_eq!(answer["error"]["data"]["code"], json!("TOO_MANY_REQUESTS"));
    assert_eq!(conn.subscription_count(), 1);
}

// =============================================================================
// Connection lifecycle
// =============================================================================

#[tokio::test]
async fn test_close_cancels_every_subscription() {
    let (handler, released) = setup();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(&subscribe(1, "ticks")).await;
    conn.handle_message(&subscribe(2, "idle")).await;
    assert_eq!(conn.subscription_count(), 2);
    assert_eq!(recv_json(&mut outbound).await["result"]["type"], json!("started"));

    conn.close().await;
    assert!(conn.is_closed());
    assert_eq!(conn.subscription_count(), 0);
    assert_eq!(released.load(Ordering::SeqCst), 2);
    assert_eq!(handler.connection_count(), 0);

    // Closing answers nothing and later messages are ignored.
    conn.handle_message(&subscribe(3, "onEvent")).await;
    while let Ok(item) = outbound.try_recv() {
        if let Outbound::Message(text) = item {
            let message: Value = serde_json::from_str(&text).unwrap();
            assert_ne!(message["result"]["type"], json!("stopped"));
            assert_ne!(message["id"], json!(3));
        }
    }
}

#[tokio::test]
async fn test_close_leaves_other_connections_alone() {
    let (handler, released) = setup();
    let (first, mut first_out) = connect(&handler);
    let (second, mut second_out) = connect(&handler);

    first.handle_message(&subscribe(1, "ticks")).await;
    second.handle_message(&subscribe(1, "ticks")).await;
    assert_eq!(recv_json(&mut first_out).await["result"]["type"], json!("started"));
    assert_eq!(recv_json(&mut second_out).await["result"]["type"], json!("started"));

    first.close().await;
    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(second.subscription_count(), 1);
    assert_eq!(handler.connection_count(), 1);

    while second_out.try_recv().is_ok() {}
    for _ in 0..2 {
        let frame = recv_json(&mut second_out).await;
        assert_eq!(frame["id"], json!(1));
        assert_eq!(frame["result"]["type"], json!("data"));
    }
    assert_eq!(released.load(Ordering::SeqCst), 1);

    second.close().await;
    assert_eq!(released.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_dropped_peer_releases_subscription() {
    let (handler, released) = setup();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(&subscribe(1, "ticks")).await;
    assert_eq!(recv_json(&mut outbound).await["result"]["type"], json!("started"));

    // The adapter went away without calling close.
    drop(outbound);
    drop(conn);
    wait_released(&released, 1).await;
    assert_eq!(handler.connection_count(), 0);
}

#[tokio::test]
async fn test_dropped_receiver_ends_pump_on_open_connection() {
    let (handler, released) = setup();
    let (conn, outbound) = connect(&handler);

    conn.handle_message(&subscribe(1, "ticks")).await;
    drop(outbound);
    wait_released(&released, 1).await;

    tokio::time::timeout(Duration::from_secs(1), async {
        while conn.subscription_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscription entry was not removed");
    assert_eq!(handler.connection_count(), 0);
    assert_eq!(handler.broadcast_reconnect(), 0);
}

#[tokio::test]
async fn test_close_while_subscription_resolves() {
    let (handler, released) = setup();
    let (conn, mut outbound) = connect(&handler);

    let pending = tokio::spawn({
        let conn = conn.clone();
        async move { conn.handle_message(&subscribe(1, "late")).await }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    conn.close().await;
    pending.await.unwrap();

    assert_eq!(released.load(Ordering::SeqCst), 1);
    assert_eq!(conn.subscription_count(), 0);
    while let Ok(item) = outbound.try_recv() {
        if let Outbound::Message(text) = item {
            let message: Value = serde_json::from_str(&text).unwrap();
            assert_ne!(message["result"]["type"], json!("started"));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_racing_subscribe_never_leaks() {
    let opened = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));
    let router = Router::builder()
        .procedure(
            "ticks",
            Procedure::builder().subscription({
                let opened = opened.clone();
                let released = released.clone();
                move |_ctx: Context, _input: Value| {
                    opened.fetch_add(1, Ordering::SeqCst);
                    let guard = DropGuard(released.clone());
                    async move {
                        RpcResult::Ok(stream! {
                            let _guard = guard;
                            loop {
                                yield RpcResult::Ok(0i64);
                                tokio::time::sleep(Duration::from_millis(1)).await;
                            }
                        })
                    }
                }
            }),
        )
        .build()
        .unwrap();
    let handler = SocketHandler::new(router);

    for _ in 0..200 {
        let (conn, _outbound) = connect(&handler);
        let subscribing = tokio::spawn({
            let conn = conn.clone();
            async move { conn.handle_message(&subscribe(1, "ticks")).await }
        });
        let closing = tokio::spawn({
            let conn = conn.clone();
            async move { conn.close().await }
        });
        subscribing.await.unwrap();
        closing.await.unwrap();
        assert_eq!(conn.subscription_count(), 0);
    }

    wait_released(&released, opened.load(Ordering::SeqCst)).await;
    assert_eq!(handler.connection_count(), 0);
}

#[tokio::test]
async fn test_fractional_id_is_echoed() {
    let (handler, _) = setup();
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(r#"{"id":1.5,"method":"query","params":{"path":"greet","input":"ann"}}"#)
        .await;
    let answer = recv_for(&mut outbound, json!(1.5)).await;
    assert_eq!(answer["result"]["data"], json!("hello ann"));
}

#[tokio::test]
async fn test_reconnect_broadcast() {
    let (handler, _) = setup();
    let (first, mut first_out) = connect(&handler);
    let (_second, mut second_out) = connect(&handler);
    assert_eq!(handler.connection_count(), 2);

    assert_eq!(handler.broadcast_reconnect(), 2);
    let expected = json!({"id": null, "method": "reconnect"});
    assert_eq!(recv_json(&mut first_out).await, expected);
    assert_eq!(recv_json(&mut second_out).await, expected);

    first.close().await;
    assert_eq!(handler.broadcast_reconnect(), 1);
}

#[tokio::test]
async fn test_context_created_once_per_connection() {
    let created = Arc::new(AtomicUsize::new(0));
    let released = Arc::new(AtomicUsize::new(0));
    let handler = SocketHandler::new(router(released)).with_create_context(create_context({
        let created = created.clone();
        move |_req: &HttpRequest| {
            let created = created.clone();
            async move {
                created.fetch_add(1, Ordering::SeqCst);
                RpcResult::Ok(Context::new())
            }
        }
    }));
    let (conn, mut outbound) = connect(&handler);

    for id in 0..3 {
        let message = json!({"id": id, "method": "query", "params": {"path": "greet", "input": "x"}});
        conn.handle_message(&message.to_string()).await;
        recv_json(&mut outbound).await;
    }
    assert_eq!(created.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_context_failure_errors_and_closes() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let released = Arc::new(AtomicUsize::new(0));
    let handler = SocketHandler::new(router(released))
        .with_create_context(create_context(|_req: &HttpRequest| async move {
            RpcResult::<Context>::Err(RpcError::unauthorized("Bad token"))
        }))
        .with_on_error(on_error({
            let seen = seen.clone();
            move |event| seen.lock().unwrap().push(event.error.code)
        }));
    let (conn, mut outbound) = connect(&handler);

    let notice = recv_json(&mut outbound).await;
    assert_eq!(notice["id"], Value::Null);
    assert_eq!(notice["error"]["data"]["code"], json!("UNAUTHORIZED"));
    assert_eq!(recv(&mut outbound).await, Outbound::Close);

    conn.handle_message(r#"{"id":1,"method":"query","params":{"path":"greet","input":"x"}}"#)
        .await;
    let answer = recv_json(&mut outbound).await;
    assert_eq!(answer["id"], json!(1));
    assert_eq!(answer["error"]["message"], json!("Bad token"));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![RpcErrorCode::Unauthorized, RpcErrorCode::Unauthorized]
    );
}

#[tokio::test]
async fn test_context_is_shared_by_subscriptions() {
    #[derive(Debug)]
    struct Tenant(&'static str);

    let router = Router::builder()
        .procedure(
            "tenant",
            Procedure::builder().subscription(|ctx: Context, _input: Value| async move {
                let tenant = ctx.require::<Tenant>()?.0;
                RpcResult::Ok(futures::stream::iter([RpcResult::Ok(tenant)]))
            }),
        )
        .build()
        .unwrap();
    let handler = SocketHandler::new(router).with_create_context(create_context(
        |_req: &HttpRequest| async move { RpcResult::Ok(Context::new().with(Tenant("acme"))) },
    ));
    let (conn, mut outbound) = connect(&handler);

    conn.handle_message(&subscribe(1, "tenant")).await;
    assert_eq!(recv_json(&mut outbound).await["result"]["type"], json!("started"));
    assert_eq!(recv_json(&mut outbound).await["result"]["data"], json!("acme"));
}
