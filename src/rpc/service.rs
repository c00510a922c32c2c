//! Request/response over a pub/sub transport
//!
//! One inbound and one outbound topic carry three kinds of messages,
//! told apart by the `type` user property: requests, responses and
//! events. Outgoing requests are correlated with their responses through
//! the MQTT correlation data; incoming requests are answered by handlers
//! registered per method.

use super::pending::{PendingRequest, PendingRequests, ResponseFuture, SeenRequests};
use super::Labels;
use crate::codec::{Codec, JsonCodec};
use crate::config::RpcWireNames;
use crate::deferred::Deferred;
use crate::emitter::ListenerId;
use crate::error::{sanitize_error_message, RpcError};
use crate::observability::metrics;
use crate::transport::{
    InboundMessage, MessageProperties, MqttError, PubSubTransport, TopicParams, TransportEvent,
    TransportEventKind,
};
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn, Instrument};
use uuid::Uuid;

/// Answers one incoming request; the return value is the response payload
pub type RequestHandler = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// Receives the payload of one incoming event
pub type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn local_timestamp() -> String {
    chrono::Utc::now().timestamp_millis().to_string()
}

fn is_success_status(status: Option<&str>) -> bool {
    status
        .and_then(|s| s.trim().parse::<u16>().ok())
        .is_some_and(|code| (200..300).contains(&code))
}

#[derive(Default)]
struct ServiceState {
    handlers: HashMap<String, RequestHandler>,
    incoming_seen: SeenRequests,
    notifications: HashMap<String, NotificationHandler>,
    labels: Labels,
    subscription: Option<Deferred<(), String>>,
    destroyed: bool,
}

/// A request waiting for its turn on the outbound topic
struct Outbound {
    id: String,
    method: String,
    payload: Bytes,
    properties: MessageProperties,
    /// Subscription that was in flight when the request was sent
    gate: Option<Deferred<(), String>>,
}

struct ServiceInner<T: PubSubTransport> {
    transport: Arc<T>,
    topic_in: String,
    codec: Arc<dyn Codec>,
    wire: RpcWireNames,
    pending: Arc<Mutex<PendingRequests>>,
    state: Mutex<ServiceState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    listeners: Mutex<Vec<(TransportEventKind, ListenerId)>>,
}

/// RPC endpoint bound to an inbound and an outbound topic
pub struct RpcService<T: PubSubTransport> {
    inner: Arc<ServiceInner<T>>,
}

impl<T: PubSubTransport> Clone for RpcService<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`RpcService`]
pub struct RpcServiceBuilder<T: PubSubTransport> {
    transport: Arc<T>,
    topic_in: String,
    topic_out: String,
    codec: Arc<dyn Codec>,
    wire: RpcWireNames,
    labels: Labels,
    notifications: HashMap<String, NotificationHandler>,
}

impl<T: PubSubTransport> RpcServiceBuilder<T> {
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn wire_names(mut self, wire: RpcWireNames) -> Self {
        self.wire = wire;
        self
    }

    pub fn labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }

    /// Handle events carrying `label` from the start
    pub fn with_notification<F>(mut self, label: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.notifications.insert(label.into(), Arc::new(handler));
        self
    }

    /// Attach the inbound route and start listening for transport events.
    ///
    /// Must be called from within a tokio runtime. Subscribes to the
    /// inbound topic right away when the transport is already connected.
    pub fn build(self) -> Result<RpcService<T>, MqttError> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(PendingRequests::default()));

        let inner = Arc::new(ServiceInner {
            transport: Arc::clone(&self.transport),
            topic_in: self.topic_in,
            codec: self.codec,
            wire: self.wire,
            pending: Arc::clone(&pending),
            state: Mutex::new(ServiceState {
                labels: self.labels,
                notifications: self.notifications,
                ..ServiceState::default()
            }),
            outbound,
            listeners: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        inner.transport.attach_route(
            &inner.topic_in,
            Arc::new(move |_params: &TopicParams, message: &InboundMessage| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_message_event(message);
                }
            }),
        )?;

        let weak = Arc::downgrade(&inner);
        let on_connect = inner.transport.on(
            TransportEventKind::Connect,
            Arc::new(move |_event: &TransportEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.subscribe_in();
                }
            }),
        );
        let weak = Arc::downgrade(&inner);
        let on_close = inner.transport.on(
            TransportEventKind::Close,
            Arc::new(move |_event: &TransportEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.discard_all_requests();
                }
            }),
        );
        lock(&inner.listeners).extend([
            (TransportEventKind::Connect, on_connect),
            (TransportEventKind::Close, on_close),
        ]);

        let span = crate::rpc_span!(topic_out = %self.topic_out);
        tokio::spawn(
            run_outbound(
                self.transport,
                self.topic_out,
                Arc::downgrade(&pending),
                outbound_rx,
            )
            .instrument(span),
        );

        if inner.transport.is_connected() {
            inner.subscribe_in();
        }

        info!(target: "rpc", topic_in = %inner.topic_in, "RPC service started");
        Ok(RpcService { inner })
    }
}

impl<T: PubSubTransport> RpcService<T> {
    pub fn builder(
        transport: Arc<T>,
        topic_in: impl Into<String>,
        topic_out: impl Into<String>,
    ) -> RpcServiceBuilder<T> {
        RpcServiceBuilder {
            transport,
            topic_in: topic_in.into(),
            topic_out: topic_out.into(),
            codec: Arc::new(JsonCodec),
            wire: RpcWireNames::default(),
            labels: Labels::default(),
            notifications: HashMap::new(),
        }
    }

    /// Service with the JSON codec and default wire names
    pub fn new(
        transport: Arc<T>,
        topic_in: impl Into<String>,
        topic_out: impl Into<String>,
    ) -> Result<Self, MqttError> {
        Self::builder(transport, topic_in, topic_out).build()
    }

    /// Send a request and wait for the peer's response.
    ///
    /// Fails at once with [`RpcError::Disconnected`] when the transport is
    /// not connected. There is no built-in timeout; bound the returned
    /// future with [`crate::retry::reject_by_timeout`] if needed.
    pub fn send(&self, method: &str, params: Value) -> ResponseFuture {
        self.inner.send(method, params)
    }

    /// Publish an event with `label` to an arbitrary topic
    pub async fn broadcast(&self, topic: &str, label: &str, params: Value) -> Result<(), RpcError> {
        let inner = &self.inner;
        if !inner.transport.is_connected() || inner.is_destroyed() {
            return Err(RpcError::Disconnected {
                context: label.to_string(),
            });
        }

        let wire = &inner.wire;
        let mut properties = MessageProperties::default()
            .with_user_property(&wire.label_key, label)
            .with_user_property(&wire.local_timestamp_key, local_timestamp())
            .with_user_property(&wire.type_key, &wire.event_type);
        properties
            .user_properties
            .extend(inner.labels().to_user_properties());

        let payload = inner.codec.encode(&params);
        inner
            .transport
            .publish(topic, payload, properties)
            .await
            .map_err(|e| RpcError::Transport {
                method: label.to_string(),
                message: sanitize_error_message(&e.to_string()),
            })?;

        metrics().rpc_broadcast_sent();
        debug!(target: "rpc", topic, label, "Broadcast published");
        Ok(())
    }

    /// Dispatch one inbound message by its `type` user property
    pub fn handle_message_event(&self, message: &InboundMessage) {
        self.inner.handle_message_event(message);
    }

    /// Answer an incoming request, at most once per correlation id
    pub fn process_incoming_request(&self, message: &InboundMessage) {
        self.inner.process_incoming_request(message);
    }

    /// Reject every outstanding request with [`RpcError::ConnectionClosed`]
    pub fn discard_all_requests(&self) {
        self.inner.discard_all_requests();
    }

    /// Replace the labels attached to outgoing messages
    pub fn set_labels(&self, labels: Labels) {
        lock(&self.inner.state).labels = labels;
    }

    pub fn clear_labels(&self) {
        lock(&self.inner.state).labels = Labels::default();
    }

    pub fn labels(&self) -> Labels {
        self.inner.labels()
    }

    /// Answer incoming requests for `method` with `handler`
    pub fn register<F>(&self, method: &str, handler: F) -> Result<(), RpcError>
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        let mut state = lock(&self.inner.state);
        if state.handlers.contains_key(method) {
            return Err(RpcError::AlreadyRegistered {
                method: method.to_string(),
            });
        }
        state.handlers.insert(method.to_string(), Arc::new(handler));
        Ok(())
    }

    pub fn unregister(&self, method: &str) -> Result<(), RpcError> {
        lock(&self.inner.state)
            .handlers
            .remove(method)
            .map(|_| ())
            .ok_or_else(|| RpcError::NotRegistered {
                method: method.to_string(),
            })
    }

    /// Handle events carrying `label`, replacing any previous handler
    pub fn set_notification_handler<F>(&self, label: &str, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        lock(&self.inner.state)
            .notifications
            .insert(label.to_string(), Arc::new(handler));
    }

    pub fn remove_notification_handler(&self, label: &str) -> bool {
        lock(&self.inner.state)
            .notifications
            .remove(label)
            .is_some()
    }

    /// Number of requests still waiting for a response
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    pub fn topic_in(&self) -> &str {
        &self.inner.topic_in
    }

    /// Detach from the transport and clear all state.
    ///
    /// Outstanding requests fail with [`RpcError::Cancelled`]; later sends
    /// fail with [`RpcError::Disconnected`].
    pub async fn destroy(&self) {
        let inner = &self.inner;
        {
            let mut state = lock(&inner.state);
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.handlers.clear();
            state.incoming_seen.clear();
            state.notifications.clear();
            state.labels = Labels::default();
            state.subscription = None;
        }

        let listeners: Vec<_> = lock(&inner.listeners).drain(..).collect();
        for (kind, id) in listeners {
            inner.transport.off(kind, id);
        }
        inner.transport.detach_route(&inner.topic_in);

        let requests = lock(&inner.pending).drain();
        for request in requests {
            let _ = request.reply.send(Err(RpcError::Cancelled {
                method: request.method,
            }));
        }

        if inner.transport.is_connected() {
            if let Err(e) = inner.transport.unsubscribe(&inner.topic_in).await {
                debug!(target: "rpc", error = %e, "Unsubscribe on destroy failed");
            }
        }

        info!(target: "rpc", topic_in = %inner.topic_in, "RPC service destroyed");
    }
}

impl<T: PubSubTransport> ServiceInner<T> {
    fn is_destroyed(&self) -> bool {
        lock(&self.state).destroyed
    }

    fn labels(&self) -> Labels {
        lock(&self.state).labels.clone()
    }

    fn send(&self, method: &str, params: Value) -> ResponseFuture {
        let disconnected = || {
            ResponseFuture::ready(RpcError::Disconnected {
                context: method.to_string(),
            })
        };

        let (labels, gate) = {
            let state = lock(&self.state);
            if state.destroyed {
                return disconnected();
            }
            let gate = state
                .subscription
                .as_ref()
                .filter(|subscription| subscription.is_pending())
                .cloned();
            (state.labels.clone(), gate)
        };
        if !self.transport.is_connected() {
            debug!(target: "rpc", method, "Request refused, transport disconnected");
            return disconnected();
        }

        let id = Uuid::new_v4().simple().to_string();
        let wire = &self.wire;
        let mut properties = MessageProperties {
            correlation_data: Some(id.clone()),
            response_topic: Some(self.topic_in.clone()),
            user_properties: Vec::new(),
        }
        .with_user_property(&wire.local_timestamp_key, local_timestamp())
        .with_user_property(&wire.method_key, method)
        .with_user_property(&wire.type_key, &wire.request_type);
        properties
            .user_properties
            .extend(labels.to_user_properties());

        let payload = self.codec.encode(&params);
        let (reply, rx) = oneshot::channel();
        lock(&self.pending).insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                sent_at: Instant::now(),
                reply,
            },
        );

        let queued = self.outbound.send(Outbound {
            id: id.clone(),
            method: method.to_string(),
            payload,
            properties,
            gate,
        });
        if queued.is_err() {
            lock(&self.pending).take(&id);
            return disconnected();
        }

        metrics().rpc_request_sent();
        trace!(target: "rpc", method, correlation_id = %id, "Request queued");
        ResponseFuture::waiting(
            id,
            method.to_string(),
            rx,
            Arc::downgrade(&self.pending),
        )
    }

    fn subscribe_in(self: &Arc<Self>) {
        let subscription = Deferred::new();
        {
            let mut state = lock(&self.state);
            if state.destroyed {
                return;
            }
            state.subscription = Some(subscription.clone());
        }

        let weak = Arc::downgrade(self);
        let transport = Arc::clone(&self.transport);
        let topic = self.topic_in.clone();
        tokio::spawn(async move {
            let outcome = transport.subscribe(&topic).await;
            if let Some(inner) = weak.upgrade() {
                let mut state = lock(&inner.state);
                if state
                    .subscription
                    .as_ref()
                    .is_some_and(|current| current.same_as(&subscription))
                {
                    state.subscription = None;
                }
            }

            match outcome {
                Ok(()) => {
                    debug!(target: "rpc", topic = %topic, "Subscribed to inbound topic");
                    subscription.resolve(());
                }
                Err(e) => {
                    let message = sanitize_error_message(&e.to_string());
                    warn!(target: "rpc", topic = %topic, error = %message, "Inbound subscription failed");
                    subscription.reject(message);
                }
            }
        });
    }

    fn handle_message_event(&self, message: &InboundMessage) {
        let wire = &self.wire;
        let properties = &message.properties;

        match properties.user_property(&wire.type_key) {
            Some(kind) if kind == wire.response_type => {
                if let Some(id) = properties.correlation_data.as_deref() {
                    self.process_response(id, message);
                }
            }
            Some(kind) if kind == wire.request_type => {
                if properties.user_property(&wire.method_key).is_some()
                    && properties.correlation_data.is_some()
                {
                    self.process_incoming_request(message);
                }
            }
            Some(kind) if kind == wire.event_type => {
                if let Some(label) = properties.user_property(&wire.label_key) {
                    self.process_notification(label, message);
                }
            }
            other => {
                trace!(target: "rpc", topic = %message.topic, kind = ?other, "Ignoring message");
            }
        }
    }

    fn process_response(&self, id: &str, message: &InboundMessage) {
        let Some(request) = lock(&self.pending).take(id) else {
            debug!(target: "rpc", correlation_id = %id, "Response for unknown request dropped");
            return;
        };

        let round_trip = request.sent_at.elapsed();
        let payload = self.codec.decode(&message.payload);
        let status = message.properties.user_property(&self.wire.status_key);

        let outcome = if is_success_status(status) {
            metrics().rpc_request_resolved(round_trip);
            Ok(payload)
        } else {
            metrics().rpc_request_rejected(round_trip);
            Err(RpcError::rejected(payload, status.unwrap_or_default()))
        };

        debug!(
            target: "rpc",
            method = %request.method,
            correlation_id = %id,
            status = status.unwrap_or_default(),
            elapsed_ms = round_trip.as_millis() as u64,
            "Response received"
        );
        // the caller may have stopped waiting
        let _ = request.reply.send(outcome);
    }

    fn process_incoming_request(&self, message: &InboundMessage) {
        let properties = &message.properties;
        let (Some(method), Some(id)) = (
            properties.user_property(&self.wire.method_key),
            properties.correlation_data.as_deref(),
        ) else {
            return;
        };

        let (handler, labels) = {
            let mut state = lock(&self.state);
            let Some(handler) = state.handlers.get(method).cloned() else {
                trace!(target: "rpc", method, "No handler for incoming request");
                return;
            };
            if !state.incoming_seen.insert(id) {
                drop(state);
                metrics().rpc_duplicate_dropped();
                debug!(target: "rpc", method, correlation_id = %id, "Duplicate request dropped");
                return;
            }
            (handler, state.labels.clone())
        };

        let result = handler(self.codec.decode(&message.payload));
        metrics().rpc_incoming_handled();

        let Some(response_topic) = properties.response_topic.clone() else {
            warn!(target: "rpc", method, correlation_id = %id, "Request without response topic");
            return;
        };

        let wire = &self.wire;
        let mut response_properties = MessageProperties {
            correlation_data: Some(id.to_string()),
            response_topic: None,
            user_properties: Vec::new(),
        }
        .with_user_property(&wire.local_timestamp_key, local_timestamp())
        .with_user_property(&wire.status_key, "200")
        .with_user_property(&wire.type_key, &wire.response_type);
        response_properties
            .user_properties
            .extend(labels.to_user_properties());

        let payload = self.codec.encode(&result);
        let transport = Arc::clone(&self.transport);
        let method = method.to_string();
        tokio::spawn(async move {
            if let Err(e) = transport
                .publish(&response_topic, payload, response_properties)
                .await
            {
                warn!(
                    target: "rpc",
                    method = %method,
                    error = %sanitize_error_message(&e.to_string()),
                    "Failed to publish response"
                );
            }
        });
    }

    fn process_notification(&self, label: &str, message: &InboundMessage) {
        let handler = lock(&self.state).notifications.get(label).cloned();
        match handler {
            Some(handler) => {
                handler(self.codec.decode(&message.payload));
                metrics().rpc_notification_dispatched();
            }
            None => trace!(target: "rpc", label, "No handler for event"),
        }
    }

    fn discard_all_requests(&self) {
        let requests = lock(&self.pending).drain();
        if requests.is_empty() {
            return;
        }

        metrics().rpc_requests_discarded(requests.len());
        info!(target: "rpc", count = requests.len(), "Connection closed, discarding pending requests");
        for request in requests {
            let _ = request.reply.send(Err(RpcError::ConnectionClosed {
                method: request.method,
            }));
        }
    }
}

fn fail_request(pending: &Mutex<PendingRequests>, id: &str, message: String) {
    if let Some(request) = lock(pending).take(id) {
        let _ = request.reply.send(Err(RpcError::Transport {
            method: request.method,
            message,
        }));
    }
}

/// Publishes queued requests in order, holding each back until the
/// subscription that was in flight at send time has settled
async fn run_outbound<T: PubSubTransport>(
    transport: Arc<T>,
    topic_out: String,
    pending: Weak<Mutex<PendingRequests>>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = queue.recv().await {
        if let Some(gate) = outbound.gate {
            if let Err(reason) = gate.wait().await {
                let Some(pending) = pending.upgrade() else { break };
                fail_request(&pending, &outbound.id, reason);
                continue;
            }
        }

        let Some(pending) = pending.upgrade() else { break };
        if !lock(&pending).contains(&outbound.id) {
            trace!(target: "rpc", method = %outbound.method, "Request settled before publish");
            continue;
        }

        if let Err(e) = transport
            .publish(&topic_out, outbound.payload, outbound.properties)
            .await
        {
            let message = sanitize_error_message(&e.to_string());
            warn!(target: "rpc", method = %outbound.method, error = %message, "Request publish failed");
            fail_request(&pending, &outbound.id, message);
        }
    }
    trace!(target: "rpc", "Outbound queue closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockPubSub;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOPIC_IN: &str = "agents/a1/api/v1/in/conference";
    const TOPIC_OUT: &str = "agents/a1/api/v1/out/conference";

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn service(mock: &Arc<MockPubSub>) -> RpcService<MockPubSub> {
        RpcService::new(Arc::clone(mock), TOPIC_IN, TOPIC_OUT).unwrap()
    }

    fn response(id: &str, status: &str, payload: Value) -> InboundMessage {
        InboundMessage {
            topic: TOPIC_IN.to_string(),
            payload: Bytes::from(payload.to_string()),
            properties: MessageProperties {
                correlation_data: Some(id.to_string()),
                ..MessageProperties::default()
            }
            .with_user_property("type", "response")
            .with_user_property("status", status),
        }
    }

    fn request(id: &str, method: &str, payload: Value) -> InboundMessage {
        InboundMessage {
            topic: TOPIC_IN.to_string(),
            payload: Bytes::from(payload.to_string()),
            properties: MessageProperties {
                correlation_data: Some(id.to_string()),
                response_topic: Some("agents/peer/api/v1/in".to_string()),
                user_properties: Vec::new(),
            }
            .with_user_property("type", "request")
            .with_user_property("method", method),
        }
    }

    #[test]
    fn test_success_status_range() {
        assert!(is_success_status(Some("200")));
        assert!(is_success_status(Some("204")));
        assert!(!is_success_status(Some("403")));
        assert!(!is_success_status(Some("abc")));
        assert!(!is_success_status(None));
    }

    #[tokio::test]
    async fn test_send_resolves_on_success_response() {
        let mock = Arc::new(MockPubSub::connected());
        let rpc = service(&mock);
        rpc.set_labels(Labels::new().app_label("portal").app_version("1.2.0"));

        let future = rpc.send("room.enter", json!({"id": "r1"}));
        let id = future.correlation_id().unwrap().to_string();

        let published = mock.wait_for_published(1).await;
        let sent = &published[0];
        assert_eq!(sent.topic, TOPIC_OUT);
        assert_eq!(sent.json(), json!({"id": "r1"}));
        assert_eq!(sent.properties.correlation_data.as_deref(), Some(id.as_str()));
        assert_eq!(sent.properties.response_topic.as_deref(), Some(TOPIC_IN));
        assert_eq!(sent.user_property("type"), Some("request"));
        assert_eq!(sent.user_property("method"), Some("room.enter"));
        assert_eq!(sent.user_property("app_label"), Some("portal"));
        assert!(sent.user_property("local_timestamp").is_some());

        mock.deliver(response(&id, "200", json!({"entered": true})));
        assert_eq!(future.await, Ok(json!({"entered": true})));
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_rejects_on_error_status() {
        let mock = Arc::new(MockPubSub::connected());
        let rpc = service(&mock);

        let future = rpc.send("room.enter", json!({"id": "r1"}));
        let id = future.correlation_id().unwrap().to_string();
        mock.deliver(response(&id, "403", json!({"title": "access denied"})));

        let error = future.await.unwrap_err();
        assert_eq!(
            error,
            RpcError::rejected(json!({"title": "access denied"}), "403")
        );
        assert_eq!(error.status_code(), Some(403));
    }

    #[tokio::test]
    async fn test_send_while_disconnected_fails_without_publishing() {
        let mock = Arc::new(MockPubSub::new());
        let rpc = service(&mock);

        let result = rpc.send("room.enter", json!({})).await;
        assert_eq!(
            result,
            Err(RpcError::Disconnected {
                context: "room.enter".to_string()
            })
        );
        settle().await;
        assert!(mock.published().is_empty());
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_correlation_ids_are_unique() {
        let mock = Arc::new(MockPubSub::connected());
        let rpc = service(&mock);

        let futures: Vec<_> = (0..20).map(|_| rpc.send("m", json!({}))).collect();
        let ids: HashSet<_> = futures
            .iter()
            .map(|f| f.correlation_id().unwrap().to_string())
            .collect();
        assert_eq!(ids.len(), 20);
        assert_eq!(rpc.pending_count(), 20);
    }

    #[tokio::test]
    async fn test_unmatched_response_is_ignored() {
        let mock = Arc::new(MockPubSub::connected());
        let rpc = service(&mock);

        mock.deliver(response("nobody", "200", json!({})));
        assert_eq!(rpc.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_future_forgets_request() {
        let mock = Arc::new(MockPubSub::connected());
        let rpc = service(&mock);

        let future = rpc.send("room.enter", json!({}));
        let id = future.correlation_id().unwrap().to_string();
        assert_eq!(rpc.pending_count(), 1);

        drop(future);
        assert_eq!(rpc.pending_count(), 0);
        mock.deliver(response(&id, "200", json!({})));
    }

    #[tokio::test]
    async fn test_incoming_request_handled_once() {
        let mock = Arc::new(MockPubSub::connected());
        let rpc = service(&mock);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        rpc.register("echo", move |params| {
            counter.fetch_add(1, Ordering::SeqCst);
            json!({"echo": params})
        })
        .unwrap();

        let message = request("corr-1", "echo", json!({"x": 1}));
        mock.deliver(message.clone());
        mock.deliver(message);

        let published = mock.wait_for_published(1).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(mock.published().len(), 1);

        let reply = &published[0];
        assert_eq!(reply.topic, "agents/peer/api/v1/in");
        assert_eq!(reply.json(), json!({"echo": {"x": 1}}));
        assert_eq!(reply.properties.correlation_data.as_deref(), Some("corr-1"));
        assert_eq!(reply.user_property("status"), Some("200"));
        assert_eq!(reply.user_property("type"), Some("response"));
    }

    #[tokio::test]
    async fn test_request_for_unregistered_method_is_ignored() {
        let mock = Arc::new(MockPubSub::connected());
        let _rpc = service(&mock);

        mock.deliver(request("corr-2", "unknown", json!({})));
        settle().await;
        assert!(mock.published().is_empty());
    }

    #[tokio::test]
    async fn test_notification_dispatch_by_label() {
        let mock = Arc::new(MockPubSub::connected());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let rpc = RpcService::builder(Arc::clone(&mock), TOPIC_IN, TOPIC_OUT)
            .with_notification("room.close", move |payload| {
                sink.lock().unwrap().push(payload);
            })
            .build()
            .unwrap();

        let event = |label: &str| InboundMessage {
            topic: TOPIC_IN.to_string(),
            payload: Bytes::from_static(b"{\"id\":\"r1\"}"),
            properties: MessageProperties::default()
                .with_user_property("type", "event")
                .with_user_property("label", label),
        };
        mock.deliver(event("room.close"));
        mock.deliver(event("room.unknown"));
        assert_eq!(*seen.lock().unwrap(), vec![json!({"id": "r1"})]);

        assert!(rpc.remove_notification_handler("room.close"));
        mock.deliver(event("room.close"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_rejects_all_pending_requests() {
        let mock = Arc::new(MockPubSub::connected());
        let rpc = service(&mock);

        let enter = rpc.send("room.enter", json!({}));
        let leave = rpc.send("room.leave", json!({}));
        mock.simulate_close();

        assert_eq!(rpc.pending_count(), 0);
        assert_eq!(
            enter.await,
            Err(RpcError::ConnectionClosed {
                method: "room.enter".to_string()
            })
        );
        assert_eq!(
            leave.await,
            Err(RpcError::ConnectionClosed {
                method: "room.leave".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_register_contract() {
        let mock = Arc::new(MockPubSub::connected());
        let rpc = service(&mock);

        rpc.register("echo", |p| p).unwrap();
        assert_eq!(
            rpc.register("echo", |p| p),
            Err(RpcError::AlreadyRegistered {
                method: "echo".to_string()
            })
        );
        assert_eq!(rpc.unregister("echo"), Ok(()));
        assert_eq!(
            rpc.unregister("echo"),
            Err(RpcError::NotRegistered {
                method: "echo".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_subscribes_on_start_and_on_connect() {
        let mock = Arc::new(MockPubSub::new());
        let _rpc = service(&mock);
        settle().await;
        assert!(mock.subscriptions().is_empty());

        mock.simulate_connect();
        settle().await;
        assert_eq!(mock.subscriptions(), vec![TOPIC_IN.to_string()]);

        let connected = Arc::new(MockPubSub::connected());
        let _rpc = service(&connected);
        settle().await;
        assert_eq!(connected.subscriptions(), vec![TOPIC_IN.to_string()]);
    }

    #[tokio::test]
    async fn test_requests_wait_for_inflight_subscription_in_order() {
        let mock = Arc::new(MockPubSub::new());
        mock.hold_subscriptions();
        let rpc = service(&mock);
        mock.simulate_connect();

        let first = rpc.send("room.enter", json!({"n": 1}));
        let second = rpc.send("room.leave", json!({"n": 2}));
        settle().await;
        assert!(mock.published().is_empty());

        mock.release_subscriptions(Ok(()));
        let published = mock.wait_for_published(2).await;
        let methods: Vec<_> = published
            .iter()
            .map(|m| m.user_property("method").unwrap().to_string())
            .collect();
        assert_eq!(methods, vec!["room.enter", "room.leave"]);

        drop((first, second));
    }

    #[tokio::test]
    async fn test_failed_subscription_rejects_waiting_requests() {
        let mock = Arc::new(MockPubSub::new());
        mock.hold_subscriptions();
        let rpc = service(&mock);
        mock.simulate_connect();

        let future = rpc.send("room.enter", json!({}));
        settle().await;
        mock.release_subscriptions(Err("NotAuthorized".to_string()));

        let error = future.await.unwrap_err();
        assert!(matches!(error, RpcError::Transport { ref method, .. } if method == "room.enter"));
        assert!(mock.published().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_rejects_request() {
        let mock = Arc::new(MockPubSub::connected());
        mock.fail_publishes(true);
        let rpc = service(&mock);

        let result = rpc.send("room.enter", json!({})).await;
        assert!(matches!(result, Err(RpcError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_broadcast() {
        let mock = Arc::new(MockPubSub::connected());
        let rpc = service(&mock);
        rpc.set_labels(Labels::new().scope("webinar-1"));

        rpc.broadcast("broadcasts/room-1", "message.create", json!({"text": "hi"}))
            .await
            .unwrap();

        let sent = &mock.published()[0];
        assert_eq!(sent.topic, "broadcasts/room-1");
        assert_eq!(sent.user_property("type"), Some("event"));
        assert_eq!(sent.user_property("label"), Some("message.create"));
        assert_eq!(sent.user_property("scope"), Some("webinar-1"));

        mock.set_connected(false);
        assert_eq!(
            rpc.broadcast("broadcasts/room-1", "message.create", json!({})).await,
            Err(RpcError::Disconnected {
                context: "message.create".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_labels_apply_to_next_send_only() {
        let mock = Arc::new(MockPubSub::connected());
        let rpc = service(&mock);

        rpc.set_labels(Labels::new().app_audience("example.org"));
        let _first = rpc.send("a", json!({}));
        rpc.clear_labels();
        let _second = rpc.send("b", json!({}));

        let published = mock.wait_for_published(2).await;
        assert_eq!(published[0].user_property("app_audience"), Some("example.org"));
        assert_eq!(published[1].user_property("app_audience"), None);
    }

    #[tokio::test]
    async fn test_destroy_detaches_everything() {
        let mock = Arc::new(MockPubSub::connected());
        let rpc = service(&mock);
        rpc.register("echo", |p| p).unwrap();
        let pending = rpc.send("room.enter", json!({}));

        rpc.destroy().await;

        assert_eq!(mock.route_count(), 0);
        assert_eq!(mock.listener_count(TransportEventKind::Connect), 0);
        assert_eq!(mock.listener_count(TransportEventKind::Close), 0);
        assert_eq!(mock.unsubscriptions(), vec![TOPIC_IN.to_string()]);
        assert_eq!(
            pending.await,
            Err(RpcError::Cancelled {
                method: "room.enter".to_string()
            })
        );
        assert!(matches!(
            rpc.send("room.enter", json!({})).await,
            Err(RpcError::Disconnected { .. })
        ));
    }
}
