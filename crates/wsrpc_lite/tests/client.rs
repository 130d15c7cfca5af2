//! Integration tests against in-process wsrpc servers: a websocket peer
//! speaking the wire protocol and a stateless HTTP endpoint with
//! long-poll semantics (one response per POST for streams).

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use wsrpc_lite::{
    CallError, CallSpec, ClientConfig, ConnectionState, Envelope, StreamUpdate, WireError,
    WsrpcClient, decode_payload, encode_group,
};

// Envelope literals below leave request-only fields unset the way the
// real server does on responses.

const WAIT: Duration = Duration::from_secs(5);

fn reply(id: u64, result: Value, header: Option<Value>) -> Envelope {
    Envelope {
        jsonrpc: String::new(),
        id,
        kind: None,
        method: None,
        params: None,
        header,
        result: Some(result),
        error: None,
    }
}

fn error_reply(id: u64, error: WireError) -> Envelope {
    Envelope {
        jsonrpc: String::new(),
        id,
        kind: None,
        method: None,
        params: None,
        header: None,
        result: None,
        error: Some(error),
    }
}

fn eof_reply(id: u64) -> Envelope {
    error_reply(id, WireError::eof())
}

async fn bind() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

async fn accept_ws(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

fn client_for(addr: SocketAddr) -> WsrpcClient {
    WsrpcClient::new(ClientConfig::new(addr.to_string())).unwrap()
}

/// Answer CALL envelopes by method: ping -> "pong", square -> params^2,
/// anything else -> a server error.
fn answer_call(env: &Envelope) -> Envelope {
    match env.method.as_deref() {
        Some("ping") => reply(env.id, json!("pong"), None),
        Some("square") => {
            let n = env.params.as_ref().and_then(Value::as_i64).unwrap_or(0);
            reply(env.id, json!(n * n), None)
        }
        _ => error_reply(env.id, WireError::server_error("boom")),
    }
}

#[tokio::test]
async fn test_call_resolves_with_result_over_websocket() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        while let Some(Ok(Message::Text(text))) = ws.next().await {
            for env in decode_payload(text.as_str()).unwrap() {
                let out = encode_group(&[answer_call(&env)]).unwrap();
                ws.send(Message::text(out)).await.unwrap();
            }
        }
    });

    let client = client_for(addr);
    let mut state = client.state_watch();
    timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Open))
        .await
        .unwrap()
        .unwrap();

    let handle = client.call(CallSpec::new("ping")).await.unwrap();
    let envelope = timeout(WAIT, handle).await.unwrap().unwrap();
    assert_eq!(envelope.result, Some(json!("pong")));
}

#[tokio::test]
async fn test_call_batch_members_resolve_independently() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        while let Some(Ok(Message::Text(text))) = ws.next().await {
            let group = decode_payload(text.as_str()).unwrap();
            // The submission arrives as one atomic array.
            assert_eq!(group.len(), 2);
            let answers: Vec<Envelope> = group.iter().map(answer_call).collect();
            ws.send(Message::text(encode_group(&answers).unwrap()))
                .await
                .unwrap();
        }
    });

    let client = client_for(addr);
    let handles = client
        .call_batch(vec![
            CallSpec::new("square").with_params(json!(3)),
            CallSpec::new("explode"),
        ])
        .await
        .unwrap();
    let mut handles = handles.into_iter();

    let ok = timeout(WAIT, handles.next().unwrap()).await.unwrap();
    assert_eq!(ok.unwrap().result, Some(json!(9)));

    let err = timeout(WAIT, handles.next().unwrap()).await.unwrap();
    match err {
        Err(CallError::Rpc(wire)) => assert_eq!(wire.code, WireError::CODE_SERVER_ERROR),
        other => panic!("expected rpc error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stream_sentinel_ends_only_that_batch_member() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("expected stream submission");
        };
        let group = decode_payload(text.as_str()).unwrap();
        assert_eq!(group.len(), 2);
        let (first, second) = (group[0].id, group[1].id);

        // First member ends immediately; the second keeps delivering.
        let frames = [
            encode_group(&[eof_reply(first)]).unwrap(),
            encode_group(&[reply(second, json!("tick"), None)]).unwrap(),
            encode_group(&[eof_reply(second)]).unwrap(),
        ];
        for frame in frames {
            ws.send(Message::text(frame)).await.unwrap();
        }
        // Hold the socket open while the client drains.
        while ws.next().await.is_some() {}
    });

    let client = client_for(addr);
    let handles = client
        .stream_batch(vec![CallSpec::new("alpha"), CallSpec::new("beta")])
        .await
        .unwrap();
    let mut handles = handles.into_iter();
    let mut alpha = handles.next().unwrap();
    let mut beta = handles.next().unwrap();

    match timeout(WAIT, alpha.next_update()).await.unwrap() {
        Some(StreamUpdate::Complete(env)) => assert!(env.is_terminal()),
        other => panic!("expected completion, got {other:?}"),
    }
    assert!(timeout(WAIT, alpha.next_update()).await.unwrap().is_none());

    match timeout(WAIT, beta.next_update()).await.unwrap() {
        Some(StreamUpdate::Event(env)) => assert_eq!(env.result, Some(json!("tick"))),
        other => panic!("expected event, got {other:?}"),
    }
    match timeout(WAIT, beta.next_update()).await.unwrap() {
        Some(StreamUpdate::Complete(_)) => {}
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_non_terminal_error_keeps_stream_open() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("expected stream submission");
        };
        let id = decode_payload(text.as_str()).unwrap()[0].id;
        let frames = [
            encode_group(&[error_reply(id, WireError::server_error("transient"))]).unwrap(),
            encode_group(&[reply(id, json!(1), None)]).unwrap(),
            encode_group(&[eof_reply(id)]).unwrap(),
        ];
        for frame in frames {
            ws.send(Message::text(frame)).await.unwrap();
        }
        while ws.next().await.is_some() {}
    });

    let client = client_for(addr);
    let mut ticks = client.stream(CallSpec::new("tick")).await.unwrap();

    match timeout(WAIT, ticks.next_update()).await.unwrap() {
        Some(StreamUpdate::Error(err)) => assert_eq!(err.code, WireError::CODE_SERVER_ERROR),
        other => panic!("expected error update, got {other:?}"),
    }
    match timeout(WAIT, ticks.next_update()).await.unwrap() {
        Some(StreamUpdate::Event(env)) => assert_eq!(env.result, Some(json!(1))),
        other => panic!("expected event after error, got {other:?}"),
    }
    match timeout(WAIT, ticks.next_update()).await.unwrap() {
        Some(StreamUpdate::Complete(_)) => {}
        other => panic!("expected completion, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stray_response_is_dropped_without_effect() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        // An id the client never submitted, wrapped in an array.
        let stray = encode_group(&[reply(99, json!("ghost"), None)]).unwrap();
        ws.send(Message::text(format!("[{stray}]"))).await.unwrap();
        while let Some(Ok(Message::Text(text))) = ws.next().await {
            for env in decode_payload(text.as_str()).unwrap() {
                let out = encode_group(&[answer_call(&env)]).unwrap();
                ws.send(Message::text(out)).await.unwrap();
            }
        }
    });

    let client = client_for(addr);
    let handle = client.call(CallSpec::new("ping")).await.unwrap();
    let envelope = timeout(WAIT, handle).await.unwrap().unwrap();
    assert_eq!(envelope.result, Some(json!("pong")));
}

#[tokio::test]
async fn test_queued_submissions_flush_in_order_on_open() {
    let (listener, addr) = bind().await;
    let client = client_for(addr);

    // Neither call can leave before the handshake finishes below.
    let first = client.call(CallSpec::new("square").with_params(json!(2))).await.unwrap();
    let second = client.call(CallSpec::new("square").with_params(json!(4))).await.unwrap();

    let (order_tx, order_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let mut seen = Vec::new();
        while let Some(Ok(Message::Text(text))) = ws.next().await {
            for env in decode_payload(text.as_str()).unwrap() {
                seen.push(env.params.clone());
                let out = encode_group(&[answer_call(&env)]).unwrap();
                ws.send(Message::text(out)).await.unwrap();
            }
            if seen.len() == 2 {
                let _ = order_tx.send(seen);
                break;
            }
        }
        while ws.next().await.is_some() {}
    });

    assert_eq!(timeout(WAIT, first).await.unwrap().unwrap().result, Some(json!(4)));
    assert_eq!(timeout(WAIT, second).await.unwrap().unwrap().result, Some(json!(16)));
    let seen = timeout(WAIT, order_rx).await.unwrap().unwrap();
    assert_eq!(seen, vec![Some(json!(2)), Some(json!(4))]);
}

#[tokio::test]
async fn test_ids_restart_on_fresh_connection() {
    let (listener, addr) = bind().await;
    let (id_tx, id_rx) = oneshot::channel();
    tokio::spawn(async move {
        // First connection: answer one call, then drop the socket.
        let mut ws = accept_ws(&listener).await;
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            let env = &decode_payload(text.as_str()).unwrap()[0];
            let out = encode_group(&[answer_call(env)]).unwrap();
            ws.send(Message::text(out)).await.unwrap();
        }
        drop(ws);

        // Second connection: the id counter restarted.
        let mut ws = accept_ws(&listener).await;
        if let Some(Ok(Message::Text(text))) = ws.next().await {
            let env = &decode_payload(text.as_str()).unwrap()[0];
            let _ = id_tx.send(env.id);
            let out = encode_group(&[answer_call(env)]).unwrap();
            ws.send(Message::text(out)).await.unwrap();
        }
        while ws.next().await.is_some() {}
    });

    let client = client_for(addr);
    let first = client.call(CallSpec::new("ping")).await.unwrap();
    assert_eq!(first.id(), 1);
    timeout(WAIT, first).await.unwrap().unwrap();

    // Wait out the drop and the reconnect handshake.
    let mut state = client.state_watch();
    timeout(WAIT, state.wait_for(|s| *s != ConnectionState::Open))
        .await
        .unwrap()
        .unwrap();
    timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Open))
        .await
        .unwrap()
        .unwrap();

    let second = client.call(CallSpec::new("ping")).await.unwrap();
    timeout(WAIT, second).await.unwrap().unwrap();
    assert_eq!(timeout(WAIT, id_rx).await.unwrap().unwrap(), 1);
}

#[tokio::test]
async fn test_cancel_stops_updates_and_later_pushes_are_strays() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("expected stream submission");
        };
        let id = decode_payload(text.as_str()).unwrap()[0].id;
        ws.send(Message::text(encode_group(&[reply(id, json!(1), None)]).unwrap()))
            .await
            .unwrap();
        // Keep pushing after the client cancels; these become strays.
        loop {
            tokio::select! {
                frame = ws.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            for env in decode_payload(text.as_str()).unwrap() {
                                let out = encode_group(&[answer_call(&env)]).unwrap();
                                ws.send(Message::text(out)).await.unwrap();
                            }
                        }
                        Some(Ok(_)) => {}
                        _ => break,
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(20)) => {
                    let push = encode_group(&[reply(id, json!(0), None)]).unwrap();
                    if ws.send(Message::text(push)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let client = client_for(addr);
    let mut ticks = client.stream(CallSpec::new("tick")).await.unwrap();
    match timeout(WAIT, ticks.next_update()).await.unwrap() {
        Some(StreamUpdate::Event(_)) => {}
        other => panic!("expected event, got {other:?}"),
    }

    ticks.cancel();
    loop {
        match timeout(WAIT, ticks.next_update()).await.unwrap() {
            Some(StreamUpdate::Event(_)) => continue, // delivered before the cancel landed
            Some(StreamUpdate::Complete(_)) => panic!("canceled stream must not complete"),
            Some(StreamUpdate::Error(_)) => panic!("canceled stream must not error"),
            None => break,
        }
    }

    // The client keeps working; the ongoing pushes are dropped as strays.
    let handle = client.call(CallSpec::new("ping")).await.unwrap();
    let envelope = timeout(WAIT, handle).await.unwrap().unwrap();
    assert_eq!(envelope.result, Some(json!("pong")));
}

// ---------------------------------------------------------------------
// Stateless transport
// ---------------------------------------------------------------------

/// Long-poll endpoint: each POST is answered with exactly one envelope
/// for the first request in the group. Streams use the `countdown`
/// method, resuming from the continuation header so the server itself
/// stays stateless.
async fn long_poll(body: String) -> String {
    let envelopes = decode_payload(&body).unwrap();
    let env = &envelopes[0];
    let response = match env.method.as_deref() {
        Some("countdown") => {
            let remaining = env
                .header
                .as_ref()
                .and_then(|h| h.get("remaining"))
                .and_then(Value::as_i64)
                .or_else(|| env.params.as_ref().and_then(Value::as_i64))
                .unwrap_or(0);
            if remaining == 0 {
                eof_reply(env.id)
            } else {
                reply(env.id, json!(remaining), Some(json!({"remaining": remaining - 1})))
            }
        }
        _ => answer_call(env),
    };
    encode_group(&[response]).unwrap()
}

async fn spawn_long_poll_server() -> SocketAddr {
    let (listener, addr) = bind().await;
    let app = Router::new().route("/", post(long_poll));
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

fn degraded_client_for(addr: SocketAddr) -> WsrpcClient {
    WsrpcClient::new(
        ClientConfig::new(addr.to_string())
            .with_websocket_disabled(true)
            .with_poll_interval(Duration::from_millis(10)),
    )
    .unwrap()
}

#[tokio::test]
async fn test_disabled_websocket_starts_degraded_and_calls_poll_through() {
    let addr = spawn_long_poll_server().await;
    let client = degraded_client_for(addr);
    assert_eq!(client.state(), ConnectionState::Degraded);

    let handle = client.call(CallSpec::new("ping")).await.unwrap();
    let envelope = timeout(WAIT, handle).await.unwrap().unwrap();
    assert_eq!(envelope.result, Some(json!("pong")));
}

#[tokio::test]
async fn test_degraded_stream_resumes_from_header_cursor() {
    let addr = spawn_long_poll_server().await;
    let client = degraded_client_for(addr);

    let mut countdown = client
        .stream(CallSpec::new("countdown").with_params(json!(3)))
        .await
        .unwrap();

    let mut events = Vec::new();
    loop {
        match timeout(WAIT, countdown.next_update()).await.unwrap() {
            Some(StreamUpdate::Event(env)) => events.push(env.result.clone()),
            Some(StreamUpdate::Complete(env)) => {
                assert!(env.is_terminal());
                break;
            }
            other => panic!("unexpected update: {other:?}"),
        }
    }
    assert_eq!(events, vec![Some(json!(3)), Some(json!(2)), Some(json!(1))]);
    assert!(timeout(WAIT, countdown.next_update()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_degraded_batch_members_poll_together_until_each_completes() {
    let addr = spawn_long_poll_server().await;
    let client = degraded_client_for(addr);

    let handles = client
        .stream_batch(vec![
            CallSpec::new("countdown").with_params(json!(2)),
            CallSpec::new("countdown").with_params(json!(1)),
        ])
        .await
        .unwrap();
    let mut handles = handles.into_iter();
    let mut first = handles.next().unwrap();
    let mut second = handles.next().unwrap();
    assert_eq!(first.batch_id(), second.batch_id());
    assert!(first.batch_id().is_some());

    // The long-poll server answers the group's first member, so the
    // first stream drains fully before the second starts.
    let mut first_events = Vec::new();
    loop {
        match timeout(WAIT, first.next_update()).await.unwrap() {
            Some(StreamUpdate::Event(env)) => first_events.push(env.result.clone()),
            Some(StreamUpdate::Complete(_)) => break,
            other => panic!("unexpected update: {other:?}"),
        }
    }
    assert_eq!(first_events, vec![Some(json!(2)), Some(json!(1))]);

    let mut second_events = Vec::new();
    loop {
        match timeout(WAIT, second.next_update()).await.unwrap() {
            Some(StreamUpdate::Event(env)) => second_events.push(env.result.clone()),
            Some(StreamUpdate::Complete(_)) => break,
            other => panic!("unexpected update: {other:?}"),
        }
    }
    assert_eq!(second_events, vec![Some(json!(1))]);
}

#[tokio::test]
async fn test_error_rate_latches_degraded_and_socket_is_never_retried() {
    let (listener, addr) = bind().await;
    let upgrade_attempts = Arc::new(AtomicUsize::new(0));
    let hits = upgrade_attempts.clone();
    let app = Router::new().route(
        "/",
        get(move || {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                // A plain 200 fails the websocket handshake.
                "no websocket here"
            }
        })
        .post(long_poll),
    );
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let client = WsrpcClient::new(
        ClientConfig::new(addr.to_string())
            .with_reconnect_backoff(Duration::from_millis(1), Duration::from_millis(2), 2)
            .with_error_sampling(Duration::from_millis(100), 2)
            .with_poll_interval(Duration::from_millis(10)),
    )
    .unwrap();

    let mut state = client.state_watch();
    timeout(WAIT, state.wait_for(|s| *s == ConnectionState::Degraded))
        .await
        .unwrap()
        .unwrap();

    // Let any attempt that was already in flight at latch time land.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Once latched, the socket is left alone for good.
    let after_latch = upgrade_attempts.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(upgrade_attempts.load(Ordering::SeqCst), after_latch);

    // Calls made afterward ride the stateless transport.
    let handle = client.call(CallSpec::new("ping")).await.unwrap();
    let envelope = timeout(WAIT, handle).await.unwrap().unwrap();
    assert_eq!(envelope.result, Some(json!("pong")));
}

#[tokio::test]
async fn test_shutdown_resolves_pending_calls_as_closed() {
    let (listener, addr) = bind().await;
    tokio::spawn(async move {
        // Accept the socket but never answer anything.
        let mut ws = accept_ws(&listener).await;
        while ws.next().await.is_some() {}
    });

    let client = client_for(addr);
    let handle = client.call(CallSpec::new("ping")).await.unwrap();
    client.shutdown();
    match timeout(WAIT, handle).await.unwrap() {
        Err(CallError::Closed) => {}
        other => panic!("expected closed, got {other:?}"),
    }
}
