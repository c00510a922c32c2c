//! Impure I/O operations for MQTT client
//!
//! This module owns the rumqttc client and its event loop. A single
//! supervisor task polls the event loop, dispatches inbound messages to
//! routes and listeners, and runs the token-refreshing reconnect policy.
//! Because only the supervisor reconnects, concurrent close events can
//! never start two token fetches.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError};
use super::health_monitor::{
    ConnectionEvent, DisconnectAction, HealthMonitor, ReconnectionDecision, RETRY_LIMIT_EXCEEDED,
};
use super::message_handler::{EventRoute, MessageHandler};
use super::routes::{dispatch, RouteTable};
use crate::backoff::Backoff;
use crate::config::{BackoffSection, MqttSection};
use crate::emitter::{EventEmitter, ListenerId};
use crate::error::sanitize_error_message;
use crate::observability::metrics;
use crate::token::TokenProvider;
use crate::transport::{
    InboundMessage, MessageProperties, PubSubTransport, RouteHandler, TransportEvent,
    TransportEventKind, TransportListener,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop};
use rumqttc::Outgoing;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

const REQUEST_CHANNEL_CAPACITY: usize = 10;
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const SUPERVISOR_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

type SubackSender = oneshot::Sender<Result<(), MqttError>>;

/// SUBSCRIBE requests waiting for their packet id, then for their SUBACK
#[derive(Default)]
struct SubackTracker {
    queued: VecDeque<SubackSender>,
    by_packet_id: HashMap<u16, SubackSender>,
}

impl SubackTracker {
    fn assign(&mut self, packet_id: u16) {
        if let Some(sender) = self.queued.pop_front() {
            self.by_packet_id.insert(packet_id, sender);
        }
    }

    fn complete(&mut self, packet_id: u16, rejected: Vec<String>) {
        let Some(sender) = self.by_packet_id.remove(&packet_id) else {
            return;
        };
        let result = if rejected.is_empty() {
            Ok(())
        } else {
            Err(MqttError::SubscriptionRejected(rejected.join(", ")))
        };
        let _ = sender.send(result);
    }

    fn fail_all(&mut self, reason: &str) {
        for sender in self
            .queued
            .drain(..)
            .chain(self.by_packet_id.drain().map(|(_, s)| s))
        {
            let _ = sender.send(Err(MqttError::Disconnected(reason.to_string())));
        }
    }
}

struct ClientInner {
    config: MqttSection,
    backoff_config: BackoffSection,
    token_provider: Arc<dyn TokenProvider>,
    client: Mutex<Option<AsyncClient>>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    events: EventEmitter<TransportEventKind, TransportEvent>,
    routes: Mutex<RouteTable>,
    subacks: Mutex<SubackTracker>,
    subscribe_gate: tokio::sync::Mutex<()>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl ClientInner {
    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            HealthMonitor::log_state_transition(&previous, &next);
        }
    }

    fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    fn emit(&self, event: TransportEvent) {
        self.events.emit(&event.kind(), &event);
    }

    fn current_client(&self) -> Result<AsyncClient, MqttError> {
        let state = self.state();
        if !HealthMonitor::can_publish(&state) {
            return Err(MqttError::NotConnected { state });
        }
        lock(&self.client)
            .clone()
            .ok_or(MqttError::NotConnected { state })
    }

    fn create_connection(&self, token: &str) -> Result<EventLoop, MqttError> {
        let options = configure_mqtt_options(&self.config, token)?;
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        *lock(&self.client) = Some(client);
        Ok(event_loop)
    }
}

/// Reconnecting MQTT 5 client with pattern routes
///
/// Every connect and reconnect uses a fresh token from the provider as the
/// broker password. Cloning is cheap; clones share one connection.
#[derive(Clone)]
pub struct MqttClient {
    inner: Arc<ClientInner>,
}

impl MqttClient {
    pub fn new(config: MqttSection, token_provider: Arc<dyn TokenProvider>) -> Self {
        Self::with_backoff(config, BackoffSection::default(), token_provider)
    }

    pub fn with_backoff(
        config: MqttSection,
        backoff_config: BackoffSection,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(ClientInner {
                config,
                backoff_config,
                token_provider,
                client: Mutex::new(None),
                state_tx,
                shutdown_tx,
                events: EventEmitter::new(),
                routes: Mutex::new(RouteTable::new()),
                subacks: Mutex::new(SubackTracker::default()),
                subscribe_gate: tokio::sync::Mutex::new(()),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Connect to the broker
    ///
    /// Resolves on the first CONNACK. Fails if the token cannot be fetched,
    /// if the first connection attempt fails, or if the broker terminally
    /// refuses the session. Failures after the first CONNACK surface only
    /// through `close`/`reconnect` events.
    pub async fn connect(&self) -> Result<(), MqttError> {
        {
            let supervisor = lock(&self.inner.supervisor);
            if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
                return Err(MqttError::AlreadyStarted);
            }
        }

        self.inner.shutdown_tx.send_replace(false);
        self.inner.set_state(ConnectionState::Connecting);
        metrics().mqtt_connection_attempt();

        let token = match self.inner.token_provider.get_token().await {
            Ok(token) => token,
            Err(e) => {
                self.inner
                    .set_state(ConnectionState::Disconnected(e.to_string()));
                metrics().mqtt_connection_failed();
                return Err(MqttError::Token(e));
            }
        };
        let event_loop = self.inner.create_connection(&token)?;

        let (connect_tx, connect_rx) = oneshot::channel();
        let supervisor = Supervisor {
            inner: Arc::clone(&self.inner),
            event_loop,
            shutdown_rx: self.inner.shutdown_tx.subscribe(),
            connect_tx: Some(connect_tx),
            backoff: Backoff::with_config(self.inner.backoff_config.clone()),
            reconnect_count: 0,
        };
        let span = crate::mqtt_span!(broker = %self.inner.config.broker_url);
        let handle = tokio::spawn(supervisor.run().instrument(span));
        *lock(&self.inner.supervisor) = Some(handle);

        connect_rx
            .await
            .map_err(|_| MqttError::Disconnected("supervisor stopped".to_string()))?
    }

    /// Close the connection for good. Safe to call repeatedly.
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        let client = lock(&self.inner.client).take();
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                debug!(target: "mqtt_transport", "Disconnect request not delivered: {}", e);
            }
        }

        self.inner.shutdown_tx.send_replace(true);

        let handle = lock(&self.inner.supervisor).take();
        let Some(handle) = handle else {
            return Ok(());
        };

        match tokio::time::timeout(SUPERVISOR_JOIN_TIMEOUT, handle).await {
            Ok(Ok(())) => info!(target: "mqtt_transport", "MQTT supervisor shut down gracefully"),
            Ok(Err(e)) if !e.is_cancelled() => {
                warn!(target: "mqtt_transport", "MQTT supervisor ended with error: {}", e)
            }
            Err(_) => {
                warn!(target: "mqtt_transport", "MQTT supervisor didn't shut down in time")
            }
            _ => {}
        }

        if !matches!(
            self.inner.state(),
            ConnectionState::PermanentlyDisconnected(_)
        ) {
            self.inner.set_state(HealthMonitor::determine_next_state(
                ConnectionEvent::ClientDisconnected,
            ));
            lock(&self.inner.subacks).fail_all("client disconnected");
            metrics().mqtt_connection_lost();
            self.inner.emit(TransportEvent::Close { forced: true });
        }

        info!(target: "mqtt_transport", "MQTT client disconnected");
        Ok(())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Watch connection state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        matches!(
            self.inner.state(),
            ConnectionState::PermanentlyDisconnected(_)
        )
    }
}

#[async_trait]
impl PubSubTransport for MqttClient {
    fn is_connected(&self) -> bool {
        HealthMonitor::can_publish(&self.inner.state())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        properties: MessageProperties,
    ) -> Result<(), MqttError> {
        let client = self.inner.current_client()?;
        let properties = MessageHandler::build_publish_properties(properties);

        match client
            .publish_with_properties(topic, QoS::AtLeastOnce, false, payload, properties)
            .await
        {
            Ok(()) => {
                metrics().mqtt_message_published();
                debug!(target: "mqtt_transport", "Published to {}", topic);
                Ok(())
            }
            Err(e) => {
                metrics().mqtt_publish_failed();
                Err(MqttError::PublishFailed(Box::new(e)))
            }
        }
    }

    async fn subscribe(&self, filter: &str) -> Result<(), MqttError> {
        let _gate = self.inner.subscribe_gate.lock().await;
        let client = self.inner.current_client()?;

        let (ack_tx, ack_rx) = oneshot::channel();
        lock(&self.inner.subacks).queued.push_back(ack_tx);

        if let Err(e) = client.subscribe(filter, QoS::AtLeastOnce).await {
            lock(&self.inner.subacks).queued.pop_back();
            return Err(MqttError::SubscriptionFailed(Box::new(e)));
        }

        let result = ack_rx
            .await
            .map_err(|_| MqttError::Disconnected("subscription abandoned".to_string()))?;
        match &result {
            Ok(()) => debug!(target: "mqtt_transport", "Subscribed to {}", filter),
            Err(e) => warn!(target: "mqtt_transport", "Subscription to {} failed: {}", filter, e),
        }
        result
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), MqttError> {
        let client = self.inner.current_client()?;
        client
            .unsubscribe(filter)
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))
    }

    fn on(&self, kind: TransportEventKind, listener: TransportListener) -> ListenerId {
        self.inner
            .events
            .on(kind, move |event: &TransportEvent| listener(event))
    }

    fn off(&self, kind: TransportEventKind, id: ListenerId) -> bool {
        self.inner.events.off(&kind, id)
    }

    fn attach_route(&self, pattern: &str, handler: RouteHandler) -> Result<(), MqttError> {
        lock(&self.inner.routes).attach(pattern, handler)
    }

    fn detach_route(&self, pattern: &str) -> bool {
        lock(&self.inner.routes).detach(pattern)
    }
}

/// Completes once shutdown is requested
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown_rx.borrow_and_update() {
            return;
        }
        if shutdown_rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

/// Event loop owner. Runs until shutdown or a terminal disconnect.
struct Supervisor {
    inner: Arc<ClientInner>,
    event_loop: EventLoop,
    shutdown_rx: watch::Receiver<bool>,
    connect_tx: Option<oneshot::Sender<Result<(), MqttError>>>,
    backoff: Backoff,
    reconnect_count: u32,
}

impl Supervisor {
    async fn run(mut self) {
        info!(target: "mqtt_transport", broker = %self.inner.config.broker_url, "Starting MQTT supervisor");

        loop {
            let flow = tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => {
                    if *self.shutdown_rx.borrow() {
                        self.drain_disconnect().await;
                        Flow::Stop
                    } else {
                        Flow::Continue
                    }
                }

                result = self.event_loop.poll() => match result {
                    Ok(event) => self.handle_event(&event),
                    Err(e) => self.handle_connection_error(e).await,
                },
            };

            if matches!(flow, Flow::Stop) {
                break;
            }
        }

        if let Some(connect_tx) = self.connect_tx.take() {
            let _ = connect_tx.send(Err(MqttError::Disconnected(
                "disconnected before connack".to_string(),
            )));
        }
        info!(target: "mqtt_transport", "MQTT supervisor stopped");
    }

    fn handle_event(&mut self, event: &Event) -> Flow {
        match MessageHandler::route_mqtt_event(event) {
            EventRoute::ConnectionAcknowledged => {
                self.on_connack();
                Flow::Continue
            }
            EventRoute::MessageReceived(message) => {
                self.on_message(message);
                Flow::Continue
            }
            EventRoute::SubscribeSent { packet_id } => {
                lock(&self.inner.subacks).assign(packet_id);
                Flow::Continue
            }
            EventRoute::SubscriptionConfirmed {
                packet_id,
                rejected,
            } => {
                lock(&self.inner.subacks).complete(packet_id, rejected);
                Flow::Continue
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                Flow::Continue
            }
            EventRoute::OutgoingEvent => Flow::Continue,
        }
    }

    fn on_connack(&mut self) {
        self.reconnect_count = 0;
        self.backoff.reset();

        self.inner
            .set_state(HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived));
        metrics().mqtt_connection_established();

        if let Some(connect_tx) = self.connect_tx.take() {
            let _ = connect_tx.send(Ok(()));
        }
        self.inner.emit(TransportEvent::Connect);
    }

    fn on_message(&mut self, message: InboundMessage) {
        metrics().mqtt_message_received();
        debug!(target: "mqtt_transport", "Received MQTT message on topic: {}", message.topic);

        let matches = lock(&self.inner.routes).resolve(&message);
        dispatch(matches, &message);
        self.inner.emit(TransportEvent::Message(message));
    }

    async fn handle_connection_error(&mut self, error: ConnectionError) -> Flow {
        let message = sanitize_error_message(&error.to_string());
        self.inner.emit(TransportEvent::Error(message.clone()));

        if let Some(reason_code) = MessageHandler::broker_disconnect_code(&error) {
            if let Some(flow) = self.on_broker_disconnect(reason_code).await {
                return flow;
            }
        }

        if self.connect_tx.is_some() && !HealthMonitor::is_retryable_connect_error(&error) {
            error!(target: "mqtt_transport", "Initial MQTT connection failed: {}", message);
            metrics().mqtt_connection_failed();
            if let Some(connect_tx) = self.connect_tx.take() {
                let _ = connect_tx.send(Err(MqttError::ConnectionFailed(Box::new(error))));
            }
            self.inner.set_state(ConnectionState::Disconnected(message));
            lock(&self.inner.client).take();
            return Flow::Stop;
        }

        if matches!(self.inner.state(), ConnectionState::Connected) {
            self.connection_lost(&message);
        }
        self.reconnect().await
    }

    /// Apply the DISCONNECT policy; `None` leaves the regular close handling to run
    async fn on_broker_disconnect(&mut self, reason_code: u8) -> Option<Flow> {
        debug!(
            target: "mqtt_transport",
            reason_code,
            reason = HealthMonitor::reason_code_name(reason_code),
            "Broker sent DISCONNECT"
        );

        match HealthMonitor::classify_disconnect(reason_code) {
            DisconnectAction::Ignore => None,
            DisconnectAction::Terminate(reason) => {
                self.terminate(reason);
                Some(Flow::Stop)
            }
            DisconnectAction::ReconnectImmediately(reason) => {
                warn!(target: "mqtt_transport", "Broker dropped the session ({}), reconnecting", reason);
                if matches!(self.inner.state(), ConnectionState::Connected) {
                    self.connection_lost(reason);
                }
                self.reconnect_count = 0;
                self.backoff.reset();
                Some(self.reconnect().await)
            }
        }
    }

    /// Report a lost connection to listeners
    fn connection_lost(&mut self, reason: &str) {
        warn!(target: "mqtt_transport", "MQTT connection lost: {}", reason);
        self.inner
            .set_state(HealthMonitor::determine_next_state(ConnectionEvent::NetworkError(
                reason.to_string(),
            )));
        metrics().mqtt_connection_lost();
        lock(&self.inner.subacks).fail_all(reason);
        self.inner.emit(TransportEvent::Close { forced: false });
    }

    async fn reconnect(&mut self) -> Flow {
        let decision = HealthMonitor::should_attempt_reconnection(
            self.reconnect_count,
            self.inner.config.reconnect_limit,
            *self.shutdown_rx.borrow(),
            self.backoff.value(),
        );

        let (attempt, delay_ms) = match decision {
            ReconnectionDecision::Proceed { attempt, delay_ms } => (attempt, delay_ms),
            ReconnectionDecision::AbortShutdownRequested => return Flow::Stop,
            ReconnectionDecision::AbortMaxAttemptsExceeded => {
                self.terminate(RETRY_LIMIT_EXCEEDED);
                return Flow::Stop;
            }
        };

        self.inner
            .set_state(HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(
                attempt,
            )));

        if delay_ms > 0 {
            info!(target: "mqtt_transport", "Reconnection {} after {}ms delay", attempt, delay_ms);
            if !self.interruptible_sleep(Duration::from_millis(delay_ms)).await {
                return Flow::Stop;
            }
            self.backoff.next();
        }

        let token = tokio::select! {
            biased;
            _ = shutdown_requested(&mut self.shutdown_rx) => return Flow::Stop,
            token = self.inner.token_provider.get_token() => token,
        };
        let token = match token {
            Ok(token) => token,
            Err(e) => {
                self.terminate(&e.to_string());
                return Flow::Stop;
            }
        };
        metrics().mqtt_token_refreshed();

        match self.inner.create_connection(&token) {
            Ok(event_loop) => self.event_loop = event_loop,
            Err(e) => {
                self.terminate(&e.to_string());
                return Flow::Stop;
            }
        }

        self.reconnect_count = attempt;
        metrics().mqtt_reconnect_attempt();
        self.inner.emit(TransportEvent::Reconnect { attempt });
        Flow::Continue
    }

    /// Returns false if shutdown was requested while sleeping
    async fn interruptible_sleep(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = shutdown_requested(&mut self.shutdown_rx) => {
                info!(target: "mqtt_transport", "Shutdown signal received during reconnection delay");
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    fn terminate(&mut self, reason: &str) {
        error!(target: "mqtt_transport", "MQTT disconnected terminally: {}", reason);
        self.inner
            .set_state(HealthMonitor::determine_next_state(ConnectionEvent::PermanentFailure(
                reason.to_string(),
            )));
        metrics().mqtt_terminal_disconnect();

        if let Some(connect_tx) = self.connect_tx.take() {
            let _ = connect_tx.send(Err(MqttError::Disconnected(reason.to_string())));
        }
        lock(&self.inner.client).take();
        lock(&self.inner.subacks).fail_all(reason);
        self.inner.emit(TransportEvent::Close { forced: true });
    }

    /// Let the queued DISCONNECT packet reach the broker
    async fn drain_disconnect(&mut self) {
        let drained = tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;

        if drained.is_err() {
            debug!(target: "mqtt_transport", "DISCONNECT not flushed before shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{StaticTokenProvider, TokenError};
    use crate::transport::TopicParams;

    fn client() -> MqttClient {
        MqttClient::new(
            MqttSection::new("mqtt://127.0.0.1:1"),
            Arc::new(StaticTokenProvider::new("token")),
        )
    }

    #[test]
    fn test_suback_tracker_assigns_in_order() {
        let mut tracker = SubackTracker::default();
        let (first_tx, mut first_rx) = oneshot::channel();
        let (second_tx, mut second_rx) = oneshot::channel();
        tracker.queued.push_back(first_tx);
        tracker.queued.push_back(second_tx);

        tracker.assign(4);
        tracker.assign(5);
        tracker.complete(5, vec!["NotAuthorized".to_string()]);
        tracker.complete(4, vec![]);

        assert!(matches!(first_rx.try_recv(), Ok(Ok(()))));
        assert!(matches!(
            second_rx.try_recv(),
            Ok(Err(MqttError::SubscriptionRejected(_)))
        ));
    }

    #[test]
    fn test_suback_tracker_fail_all() {
        let mut tracker = SubackTracker::default();
        let (queued_tx, mut queued_rx) = oneshot::channel();
        let (sent_tx, mut sent_rx) = oneshot::channel();
        tracker.queued.push_back(sent_tx);
        tracker.assign(1);
        tracker.queued.push_back(queued_tx);

        tracker.fail_all("connection lost");

        assert!(matches!(queued_rx.try_recv(), Ok(Err(MqttError::Disconnected(_)))));
        assert!(matches!(sent_rx.try_recv(), Ok(Err(MqttError::Disconnected(_)))));
        assert!(tracker.by_packet_id.is_empty());
    }

    #[tokio::test]
    async fn test_new_client_is_idle_and_refuses_publish() {
        let client = client();

        assert_eq!(client.connection_state(), ConnectionState::Idle);
        assert!(!client.is_connected());

        let result = client
            .publish("a/b", Bytes::from_static(b"{}"), MessageProperties::default())
            .await;
        assert!(matches!(
            result,
            Err(MqttError::NotConnected {
                state: ConnectionState::Idle
            })
        ));
    }

    #[tokio::test]
    async fn test_connect_fails_when_token_unavailable() {
        struct FailingProvider;

        #[async_trait]
        impl TokenProvider for FailingProvider {
            async fn get_token(&self) -> Result<String, TokenError> {
                Err(TokenError::Unauthenticated("expired".to_string()))
            }
        }

        let client = MqttClient::new(
            MqttSection::new("mqtt://127.0.0.1:1"),
            Arc::new(FailingProvider),
        );

        let result = client.connect().await;
        assert!(matches!(result, Err(MqttError::Token(TokenError::Unauthenticated(_)))));
        assert!(matches!(
            client.connection_state(),
            ConnectionState::Disconnected(_)
        ));
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_broker_rejects() {
        let client = client();

        let result = tokio::time::timeout(Duration::from_secs(10), client.connect())
            .await
            .expect("connect should settle");
        assert!(result.is_err());
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_routes_attach_and_detach() {
        let client = client();
        let handler: RouteHandler = Arc::new(|_: &TopicParams, _: &InboundMessage| {});

        client
            .attach_route("apps/+app/api/v1/rooms/+roomId/events", handler.clone())
            .unwrap();
        assert!(client.detach_route("apps/+app/api/v1/rooms/+roomId/events"));
        assert!(!client.detach_route("apps/+app/api/v1/rooms/+roomId/events"));
        assert!(client.attach_route("a/#rest/b", handler).is_err());
    }

    #[tokio::test]
    async fn test_disconnect_without_connect_is_noop() {
        let client = client();
        client.disconnect().await.unwrap();
        client.disconnect().await.unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Idle);
    }
}
