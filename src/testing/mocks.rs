//! Mock implementations for testing
//!
//! Provides an in-memory pub/sub transport, an in-memory WebSocket
//! connector with a scriptable server side, and a counting token provider,
//! so the RPC service and presence sessions can be tested without a broker
//! or a presence server.

use crate::deferred::Deferred;
use crate::emitter::{EventEmitter, ListenerId};
use crate::token::{TokenError, TokenProvider};
use crate::transport::mqtt::routes::{dispatch, RouteTable};
use crate::transport::ws::{LinkCommand, LinkEvent, WsConnector, WsLink};
use crate::transport::{
    InboundMessage, MessageProperties, MqttError, PubSubTransport, RouteHandler, TransportEvent,
    TransportEventKind, TransportListener,
};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// One message handed to [`MockPubSub::publish`]
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub properties: MessageProperties,
}

impl PublishedMessage {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }

    pub fn user_property(&self, key: &str) -> Option<&str> {
        self.properties.user_property(key)
    }
}

/// In-memory [`PubSubTransport`]
///
/// Starts disconnected. Subscriptions succeed at once unless held with
/// [`MockPubSub::hold_subscriptions`].
pub struct MockPubSub {
    connected: AtomicBool,
    fail_publish: AtomicBool,
    published: Mutex<Vec<PublishedMessage>>,
    published_count: watch::Sender<usize>,
    subscriptions: Mutex<Vec<String>>,
    unsubscriptions: Mutex<Vec<String>>,
    subscription_gate: Mutex<Option<Deferred<(), String>>>,
    events: EventEmitter<TransportEventKind, TransportEvent>,
    routes: Mutex<RouteTable>,
}

impl MockPubSub {
    pub fn new() -> Self {
        let (published_count, _) = watch::channel(0);
        Self {
            connected: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
            published_count,
            subscriptions: Mutex::new(Vec::new()),
            unsubscriptions: Mutex::new(Vec::new()),
            subscription_gate: Mutex::new(None),
            events: EventEmitter::new(),
            routes: Mutex::new(RouteTable::new()),
        }
    }

    pub fn connected() -> Self {
        let mock = Self::new();
        mock.set_connected(true);
        mock
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Mark connected and emit `connect`
    pub fn simulate_connect(&self) {
        self.set_connected(true);
        self.events
            .emit(&TransportEventKind::Connect, &TransportEvent::Connect);
    }

    /// Mark disconnected and emit an unforced `close`
    pub fn simulate_close(&self) {
        self.set_connected(false);
        self.events.emit(
            &TransportEventKind::Close,
            &TransportEvent::Close { forced: false },
        );
    }

    /// Deliver an inbound message to matching routes and `message` listeners
    pub fn deliver(&self, message: InboundMessage) -> usize {
        let matches = lock(&self.routes).resolve(&message);
        let called = dispatch(matches, &message);
        self.events.emit(
            &TransportEventKind::Message,
            &TransportEvent::Message(message),
        );
        called
    }

    /// Make subsequent subscriptions wait for [`MockPubSub::release_subscriptions`]
    pub fn hold_subscriptions(&self) {
        *lock(&self.subscription_gate) = Some(Deferred::new());
    }

    /// Settle held subscriptions; `Err` rejects them with the given reason
    pub fn release_subscriptions(&self, outcome: Result<(), String>) {
        if let Some(gate) = lock(&self.subscription_gate).take() {
            match outcome {
                Ok(()) => gate.resolve(()),
                Err(reason) => gate.reject(reason),
            };
        }
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.published).clone()
    }

    /// Wait until at least `count` messages were published
    pub async fn wait_for_published(&self, count: usize) -> Vec<PublishedMessage> {
        let mut rx = self.published_count.subscribe();
        let wait = rx.wait_for(|published| *published >= count);
        let _ = tokio::time::timeout(Duration::from_secs(5), wait).await;
        self.published()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    pub fn unsubscriptions(&self) -> Vec<String> {
        lock(&self.unsubscriptions).clone()
    }

    pub fn listener_count(&self, kind: TransportEventKind) -> usize {
        self.events.listener_count(&kind)
    }

    pub fn route_count(&self) -> usize {
        lock(&self.routes).len()
    }
}

#[async_trait]
impl PubSubTransport for MockPubSub {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        properties: MessageProperties,
    ) -> Result<(), MqttError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed("mock publish failure".into()));
        }

        lock(&self.published).push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            properties,
        });
        self.published_count.send_modify(|count| *count += 1);
        Ok(())
    }

    async fn subscribe(&self, filter: &str) -> Result<(), MqttError> {
        lock(&self.subscriptions).push(filter.to_string());

        let gate = lock(&self.subscription_gate).clone();
        match gate {
            Some(gate) => gate
                .wait()
                .await
                .map_err(MqttError::SubscriptionRejected),
            None => Ok(()),
        }
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), MqttError> {
        lock(&self.unsubscriptions).push(filter.to_string());
        Ok(())
    }

    fn on(&self, kind: TransportEventKind, listener: TransportListener) -> ListenerId {
        self.events
            .on(kind, move |event: &TransportEvent| listener(event))
    }

    fn off(&self, kind: TransportEventKind, id: ListenerId) -> bool {
        self.events.off(&kind, id)
    }

    fn attach_route(&self, pattern: &str, handler: RouteHandler) -> Result<(), MqttError> {
        lock(&self.routes).attach(pattern, handler)
    }

    fn detach_route(&self, pattern: &str) -> bool {
        lock(&self.routes).detach(pattern)
    }
}

/// Server side of one mock WebSocket connection
pub struct MockWsServer {
    url: String,
    events: mpsc::UnboundedSender<LinkEvent>,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
}

impl MockWsServer {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn open(&self) {
        let _ = self.events.send(LinkEvent::Open);
    }

    pub fn send_text(&self, text: &str) {
        let _ = self.events.send(LinkEvent::Text(text.to_string()));
    }

    pub fn send_json(&self, message: Value) {
        let _ = self.events.send(LinkEvent::Text(message.to_string()));
    }

    pub fn error(&self, error: &str) {
        let _ = self.events.send(LinkEvent::Error(error.to_string()));
    }

    pub fn close(&self, code: u16, was_clean: bool) {
        let _ = self.events.send(LinkEvent::Closed { code, was_clean });
    }

    /// Next frame or close request from the client; `None` once the client is gone
    pub async fn next_command(&mut self) -> Option<LinkCommand> {
        tokio::time::timeout(Duration::from_secs(5), self.commands.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next JSON frame from the client, skipping keep-alive replies
    pub async fn next_json(&mut self) -> Option<Value> {
        loop {
            match self.next_command().await? {
                LinkCommand::Text(text) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        if value.is_object() {
                            return Some(value);
                        }
                    }
                }
                LinkCommand::Close => return None,
            }
        }
    }

    /// Wait until the client asks to close the socket
    pub async fn closed_by_client(&mut self) -> bool {
        while let Some(command) = self.next_command().await {
            if command == LinkCommand::Close {
                return true;
            }
        }
        false
    }
}

/// In-memory [`WsConnector`]; every `open` yields a [`MockWsServer`] from `accept`
#[derive(Clone)]
pub struct MockWsConnector {
    opened: Arc<AtomicUsize>,
    incoming_tx: mpsc::UnboundedSender<MockWsServer>,
    incoming_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MockWsServer>>>,
}

impl MockWsConnector {
    pub fn new() -> Self {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        Self {
            opened: Arc::new(AtomicUsize::new(0)),
            incoming_tx,
            incoming_rx: Arc::new(tokio::sync::Mutex::new(incoming_rx)),
        }
    }

    /// Next connection opened by a client
    pub async fn accept(&self) -> MockWsServer {
        let mut incoming = self.incoming_rx.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), incoming.recv()).await {
            Ok(Some(server)) => server,
            _ => panic!("no WebSocket connection was opened"),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Default for MockPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl Default for MockWsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WsConnector for MockWsConnector {
    fn open(&self, url: &str) -> WsLink {
        let (link, events, commands) = WsLink::pair();
        self.opened.fetch_add(1, Ordering::SeqCst);
        let _ = self.incoming_tx.send(MockWsServer {
            url: url.to_string(),
            events,
            commands,
        });
        link
    }
}

/// Token provider returning `token-1`, `token-2`, ... and counting calls
#[derive(Default)]
pub struct MockTokenProvider {
    calls: AtomicUsize,
    failure: Mutex<Option<TokenError>>,
    delay: Mutex<Option<Duration>>,
}

impl MockTokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(error: TokenError) -> Self {
        let provider = Self::new();
        provider.fail_with(Some(error));
        provider
    }

    pub fn fail_with(&self, error: Option<TokenError>) {
        *lock(&self.failure) = error;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for MockTokenProvider {
    async fn get_token(&self) -> Result<String, TokenError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match lock(&self.failure).clone() {
            Some(error) => Err(error),
            None => Ok(format!("token-{call}")),
        }
    }
}
