//! Transport layer for realtime messaging
//!
//! [`PubSubTransport`] is the seam between the RPC service and the MQTT
//! client, so the protocol logic can run against an in-memory transport in
//! tests. The WebSocket transport used by presence sessions lives in [`ws`].

use crate::emitter::ListenerId;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;

pub mod mqtt;
pub mod ws;

pub use mqtt::MqttError;

/// Transport-level metadata carried next to the payload
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub correlation_data: Option<String>,
    pub response_topic: Option<String>,
    pub user_properties: Vec<(String, String)>,
}

impl MessageProperties {
    /// First value of a user property
    pub fn user_property(&self, key: &str) -> Option<&str> {
        self.user_properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn with_user_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.user_properties.push((key.into(), value.into()));
        self
    }
}

/// Message delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub properties: MessageProperties,
}

/// Values captured by named wildcards of a topic pattern
pub type TopicParams = HashMap<String, String>;

/// Raw transport event names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportEventKind {
    Connect,
    Close,
    Reconnect,
    Message,
    Error,
}

/// Raw transport events
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Broker acknowledged a connection (first or after a reconnect)
    Connect,
    /// Connection closed; `forced` when closed locally or terminally
    Close { forced: bool },
    /// New connection attempt issued with a refreshed token
    Reconnect { attempt: u32 },
    Message(InboundMessage),
    Error(String),
}

impl TransportEvent {
    pub fn kind(&self) -> TransportEventKind {
        match self {
            Self::Connect => TransportEventKind::Connect,
            Self::Close { .. } => TransportEventKind::Close,
            Self::Reconnect { .. } => TransportEventKind::Reconnect,
            Self::Message(_) => TransportEventKind::Message,
            Self::Error(_) => TransportEventKind::Error,
        }
    }
}

pub type TransportListener = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Handler attached to a topic pattern
pub type RouteHandler = Arc<dyn Fn(&TopicParams, &InboundMessage) + Send + Sync>;

/// Publish/subscribe transport with pattern routing
///
/// Listeners and route handlers are called synchronously from the
/// transport's event loop and must not block.
#[async_trait::async_trait]
pub trait PubSubTransport: Send + Sync + 'static {
    fn is_connected(&self) -> bool;

    /// Publish with QoS 1; resolves once the message is handed to the transport
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        properties: MessageProperties,
    ) -> Result<(), MqttError>;

    /// Subscribe with QoS 1; resolves once the broker acknowledges
    async fn subscribe(&self, filter: &str) -> Result<(), MqttError>;

    async fn unsubscribe(&self, filter: &str) -> Result<(), MqttError>;

    fn on(&self, kind: TransportEventKind, listener: TransportListener) -> ListenerId;

    fn off(&self, kind: TransportEventKind, id: ListenerId) -> bool;

    /// Route inbound messages matching `pattern` to `handler`.
    /// Attaching the same pattern again replaces its handler.
    fn attach_route(&self, pattern: &str, handler: RouteHandler) -> Result<(), MqttError>;

    fn detach_route(&self, pattern: &str) -> bool;
}
