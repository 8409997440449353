//! Session correlation tests over the in-process fake transport

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use mcplink::error::McpError;
use mcplink::session::McpSession;
use mcplink::transport::fake::{FakeTransport, FakeTransportHandle};
use mcplink::types::{JsonRpcMessage, JsonRpcResponse, RequestId, METHOD_NOT_FOUND};

const WAIT: Duration = Duration::from_secs(5);

async fn session_with_handle() -> (Arc<McpSession>, FakeTransportHandle) {
    let (transport, handle) = FakeTransport::new();
    let session = McpSession::builder(Arc::new(transport))
        .request_timeout(Duration::from_secs(5))
        .connect()
        .await
        .unwrap();
    (Arc::new(session), handle)
}

async fn next_request(handle: &mut FakeTransportHandle) -> (RequestId, String, Option<Value>) {
    let message = tokio::time::timeout(WAIT, handle.outbound_rx.recv())
        .await
        .expect("client sent nothing")
        .expect("outbound channel closed");
    match message {
        JsonRpcMessage::Request(r) => (r.id, r.method, r.params),
        other => panic!("expected a request, got {:?}", other),
    }
}

async fn next_response(handle: &mut FakeTransportHandle) -> JsonRpcResponse {
    let message = tokio::time::timeout(WAIT, handle.outbound_rx.recv())
        .await
        .expect("client sent nothing")
        .expect("outbound channel closed");
    match message {
        JsonRpcMessage::Response(r) => r,
        other => panic!("expected a response, got {:?}", other),
    }
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let (session, mut handle) = session_with_handle().await;

    let mut calls = Vec::new();
    for n in 0..3 {
        let s = Arc::clone(&session);
        calls.push(tokio::spawn(async move {
            s.send_request::<_, Value>("echo", json!({ "n": n }), None)
                .await
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(next_request(&mut handle).await);
    }
    for (id, _, params) in requests.into_iter().rev() {
        let n = params.unwrap()["n"].clone();
        handle.inject(json!({"jsonrpc": "2.0", "id": id, "result": {"n": n}}));
    }

    for (n, call) in calls.into_iter().enumerate() {
        let result = call.await.unwrap().unwrap();
        assert_eq!(result["n"], json!(n));
    }
    assert_eq!(session.pending_count().await, 0);
}

#[tokio::test]
async fn test_concurrent_request_ids_are_unique() {
    let (session, mut handle) = session_with_handle().await;

    let mut calls = Vec::new();
    for _ in 0..50 {
        let s = Arc::clone(&session);
        calls.push(tokio::spawn(async move {
            s.send_request::<_, Value>("ping", (), None).await
        }));
    }

    let mut ids = HashSet::new();
    for _ in 0..50 {
        let (id, method, params) = next_request(&mut handle).await;
        assert_eq!(method, "ping");
        assert!(params.is_none());
        assert!(ids.insert(id.to_string()), "duplicate id {id}");
        handle.inject(json!({"jsonrpc": "2.0", "id": id, "result": {}}));
    }
    for call in calls {
        call.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_late_response_after_timeout_is_dropped() {
    let (session, mut handle) = session_with_handle().await;

    let err = session
        .send_request::<_, Value>("slow", (), Some(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(err.downcast_ref::<McpError>().unwrap().is_timeout());
    let (late_id, _, _) = next_request(&mut handle).await;

    // The late answer must not disturb the next request.
    handle.inject(json!({"jsonrpc": "2.0", "id": late_id, "result": "late"}));

    let s = Arc::clone(&session);
    let call = tokio::spawn(async move { s.send_request::<_, String>("fast", (), None).await });
    let (id, method, _) = next_request(&mut handle).await;
    assert_eq!(method, "fast");
    assert_ne!(id, late_id);
    handle.inject(json!({"jsonrpc": "2.0", "id": id, "result": "on time"}));

    assert_eq!(call.await.unwrap().unwrap(), "on time");
    assert_eq!(session.pending_count().await, 0);
}

#[tokio::test]
async fn test_unknown_inbound_request_gets_method_not_found() {
    let (_session, mut handle) = session_with_handle().await;

    handle.inject(json!({"jsonrpc": "2.0", "id": 42, "method": "sampling/createMessage"}));
    let response = next_response(&mut handle).await;
    assert_eq!(response.id, Some(RequestId::Number(42)));
    let error = response.error.expect("error response");
    assert_eq!(error.code, METHOD_NOT_FOUND);
    assert_eq!(error.message, "Method not found: sampling/createMessage");
}

#[tokio::test]
async fn test_custom_request_handler_answers_with_same_id() {
    let (transport, mut handle) = FakeTransport::new();
    let _session = McpSession::builder(Arc::new(transport))
        .on_request("custom/double", |params: Value| async move {
            let n = params["n"].as_i64().unwrap_or_default();
            Ok::<_, anyhow::Error>(json!({ "n": n * 2 }))
        })
        .connect()
        .await
        .unwrap();

    handle.inject(json!({"jsonrpc": "2.0", "id": "srv-7", "method": "custom/double", "params": {"n": 21}}));
    let response = next_response(&mut handle).await;
    assert_eq!(response.id, Some(RequestId::String("srv-7".to_string())));
    assert_eq!(response.result, Some(json!({"n": 42})));
    assert!(response.error.is_none());
}

#[tokio::test]
async fn test_unknown_response_id_is_ignored() {
    let (session, mut handle) = session_with_handle().await;

    handle.inject(json!({"jsonrpc": "2.0", "id": "nobody-1", "result": {}}));

    let s = Arc::clone(&session);
    let call = tokio::spawn(async move { s.send_request::<_, Value>("ok", (), None).await });
    let (id, _, _) = next_request(&mut handle).await;
    handle.inject(json!({"jsonrpc": "2.0", "id": id, "result": {"fine": true}}));
    assert_eq!(call.await.unwrap().unwrap(), json!({"fine": true}));
}

#[tokio::test]
async fn test_server_going_away_fails_pending_requests() {
    let (session, mut handle) = session_with_handle().await;

    let s = Arc::clone(&session);
    let call = tokio::spawn(async move { s.send_request::<_, Value>("hang", (), None).await });
    let _ = next_request(&mut handle).await;

    drop(handle);

    let err = tokio::time::timeout(WAIT, call)
        .await
        .expect("pending request never failed")
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<McpError>(),
        Some(McpError::TransportClosed)
    ));
    assert!(session.is_closed());

    let err = session
        .send_request::<_, Value>("after", (), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<McpError>(),
        Some(McpError::TransportClosed)
    ));
}

#[tokio::test]
async fn test_duplicate_response_is_delivered_at_most_once() {
    let (session, mut handle) = session_with_handle().await;

    let s = Arc::clone(&session);
    let first = tokio::spawn(async move { s.send_request::<_, Value>("first", (), None).await });
    let (id, _, _) = next_request(&mut handle).await;
    handle.inject(json!({"jsonrpc": "2.0", "id": id, "result": 1}));
    handle.inject(json!({"jsonrpc": "2.0", "id": id, "result": 2}));
    assert_eq!(first.await.unwrap().unwrap(), json!(1));

    // The duplicate must not leak into the next exchange.
    let s = Arc::clone(&session);
    let second = tokio::spawn(async move { s.send_request::<_, Value>("second", (), None).await });
    let (next_id, _, _) = next_request(&mut handle).await;
    assert_ne!(next_id, id);
    handle.inject(json!({"jsonrpc": "2.0", "id": next_id, "result": 3}));
    assert_eq!(second.await.unwrap().unwrap(), json!(3));
    assert_eq!(session.pending_count().await, 0);
}

#[tokio::test]
async fn test_unregistered_notification_produces_no_traffic() {
    let (session, mut handle) = session_with_handle().await;

    handle.inject(json!({"jsonrpc": "2.0", "method": "notifications/custom/unheard", "params": {"x": 1}}));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(handle.outbound_rx.try_recv().is_err());
    assert!(!session.is_closed());

    let s = Arc::clone(&session);
    let call = tokio::spawn(async move { s.send_request::<_, Value>("still/alive", (), None).await });
    let (id, method, _) = next_request(&mut handle).await;
    assert_eq!(method, "still/alive");
    handle.inject(json!({"jsonrpc": "2.0", "id": id, "result": {}}));
    call.await.unwrap().unwrap();
}
