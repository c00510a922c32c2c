//! RPC service integration tests
//!
//! Two services share one in-memory transport; published messages are fed
//! back into the transport so each peer receives what the other sends.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use ulms_realtime::error::RpcError;
use ulms_realtime::retry::{reject_by_timeout, retry};
use ulms_realtime::rpc::{Labels, RpcService};
use ulms_realtime::testing::{MockPubSub, PublishedMessage};
use ulms_realtime::transport::InboundMessage;

const CLIENT_IN: &str = "agents/web.alice/api/v1/in/conference";
const SERVER_IN: &str = "apps/conference/api/v1/in";

fn inbound(message: &PublishedMessage) -> InboundMessage {
    InboundMessage {
        topic: message.topic.clone(),
        payload: message.payload.clone(),
        properties: message.properties.clone(),
    }
}

/// Deliver every message published after `already_seen`
fn pump(mock: &MockPubSub, already_seen: usize) -> usize {
    let published = mock.published();
    for message in &published[already_seen..] {
        mock.deliver(inbound(message));
    }
    published.len()
}

fn peers(mock: &Arc<MockPubSub>) -> (RpcService<MockPubSub>, RpcService<MockPubSub>) {
    let client = RpcService::new(Arc::clone(mock), CLIENT_IN, SERVER_IN).unwrap();
    let server = RpcService::new(Arc::clone(mock), SERVER_IN, CLIENT_IN).unwrap();
    (client, server)
}

#[tokio::test]
async fn test_request_response_between_peers() {
    let mock = Arc::new(MockPubSub::connected());
    let (client, server) = peers(&mock);
    server
        .register("room.read", |params: Value| {
            json!({"id": params["id"], "audience": "example.org"})
        })
        .unwrap();
    server.set_labels(Labels::new().app_label("conference").app_version("3.1"));

    let response = client.send("room.read", json!({"id": "r-42"}));

    let request = mock.wait_for_published(1).await;
    pump(&mock, 0);
    let published = mock.wait_for_published(2).await;
    let reply = &published[1];
    assert_eq!(reply.topic, CLIENT_IN);
    assert_eq!(reply.user_property("type"), Some("response"));
    assert_eq!(reply.user_property("status"), Some("200"));
    assert_eq!(reply.user_property("app_label"), Some("conference"));
    assert_eq!(
        reply.properties.correlation_data,
        request[0].properties.correlation_data
    );

    pump(&mock, 1);
    assert_eq!(
        response.await,
        Ok(json!({"id": "r-42", "audience": "example.org"}))
    );
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_redelivered_request_is_answered_once() {
    let mock = Arc::new(MockPubSub::connected());
    let (client, server) = peers(&mock);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    server
        .register("room.enter", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            json!({})
        })
        .unwrap();

    let response = client.send("room.enter", json!({"id": "r1"}));
    let request = mock.wait_for_published(1).await;
    mock.deliver(inbound(&request[0]));
    mock.deliver(inbound(&request[0]));

    let published = mock.wait_for_published(2).await;
    pump(&mock, 1);
    assert_eq!(response.await, Ok(json!({})));

    tokio::task::yield_now().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(mock.published().len(), published.len());
}

#[tokio::test]
async fn test_event_broadcast_reaches_notification_handler() {
    let mock = Arc::new(MockPubSub::connected());
    let received = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let listener = RpcService::builder(Arc::clone(&mock), CLIENT_IN, SERVER_IN)
        .with_notification("room.close", move |data| {
            sink.lock().unwrap().push(data);
        })
        .build()
        .unwrap();
    let server = RpcService::new(Arc::clone(&mock), SERVER_IN, CLIENT_IN).unwrap();

    server
        .broadcast(CLIENT_IN, "room.close", json!({"id": "r1"}))
        .await
        .unwrap();
    pump(&mock, 0);

    assert_eq!(*received.lock().unwrap(), vec![json!({"id": "r1"})]);
    assert_eq!(listener.pending_count(), 0);
}

#[tokio::test]
async fn test_unanswered_request_times_out_and_is_forgotten() {
    let mock = Arc::new(MockPubSub::connected());
    let client = RpcService::new(Arc::clone(&mock), CLIENT_IN, SERVER_IN).unwrap();

    let outcome = reject_by_timeout(
        client.send("room.read", json!({"id": "r1"})),
        Duration::from_millis(50),
        Some("room.read"),
    )
    .await;

    let error = outcome.unwrap_err();
    assert_eq!(error.timeout_ms, 50);
    assert!(error.to_string().contains("room.read"));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_after_reconnect() {
    let mock = Arc::new(MockPubSub::new());
    let client = RpcService::new(Arc::clone(&mock), CLIENT_IN, SERVER_IN).unwrap();

    let responder = {
        let mock = Arc::clone(&mock);
        tokio::spawn(async move {
            let published = mock.wait_for_published(1).await;
            let id = published[0].properties.correlation_data.clone().unwrap();
            mock.deliver(InboundMessage {
                topic: CLIENT_IN.to_string(),
                payload: bytes::Bytes::from(r#"{"ok":true}"#),
                properties: ulms_realtime::transport::MessageProperties {
                    correlation_data: Some(id),
                    ..Default::default()
                }
                .with_user_property("type", "response")
                .with_user_property("status", "201"),
            });
        })
    };

    let attempts = Arc::new(AtomicUsize::new(0));
    let result = retry(
        || {
            attempts.fetch_add(1, Ordering::SeqCst);
            client.send("room.read", json!({}))
        },
        |error, _| {
            assert!(matches!(error, RpcError::Disconnected { .. }));
            mock.simulate_connect();
            false
        },
        3,
    )
    .await;

    assert_eq!(result, Ok(json!({"ok": true})));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    responder.await.unwrap();
}

#[tokio::test]
async fn test_connection_loss_fails_outstanding_requests() {
    let mock = Arc::new(MockPubSub::connected());
    let client = RpcService::new(Arc::clone(&mock), CLIENT_IN, SERVER_IN).unwrap();

    let first = client.send("room.read", json!({"id": "r1"}));
    let second = client.send("room.list", json!({}));
    mock.wait_for_published(2).await;
    mock.simulate_close();

    assert_eq!(
        first.await,
        Err(RpcError::ConnectionClosed {
            method: "room.read".to_string()
        })
    );
    assert_eq!(
        second.await,
        Err(RpcError::ConnectionClosed {
            method: "room.list".to_string()
        })
    );
    assert!(matches!(
        client.send("room.read", json!({})).await,
        Err(RpcError::Disconnected { .. })
    ));
}
