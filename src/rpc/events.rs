//! Room-scoped notifications
//!
//! Applications publish events for a room on
//! `apps/{app}/api/v1/rooms/{room_id}/events`; each event carries its
//! name in the `label` user property.

use crate::codec::{Codec, JsonCodec};
use crate::config::RpcWireNames;
use crate::emitter::{EventEmitter, ListenerId};
use crate::transport::{InboundMessage, MqttError, PubSubTransport, TopicParams};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace};

/// One notification delivered for a room
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoomEvent {
    pub room_id: String,
    pub label: String,
    pub data: Value,
}

/// Listens on an application's room event topics and emits events by label
pub struct RoomEventService<T: PubSubTransport> {
    transport: Arc<T>,
    pattern: String,
    emitter: Arc<EventEmitter<String, RoomEvent>>,
}

impl<T: PubSubTransport> RoomEventService<T> {
    pub fn new(transport: Arc<T>, app_name: &str) -> Result<Self, MqttError> {
        Self::with_codec(transport, app_name, Arc::new(JsonCodec), RpcWireNames::default())
    }

    pub fn with_codec(
        transport: Arc<T>,
        app_name: &str,
        codec: Arc<dyn Codec>,
        wire: RpcWireNames,
    ) -> Result<Self, MqttError> {
        let pattern = Self::topic_pattern(app_name);
        let emitter = Arc::new(EventEmitter::new());

        let sink = Arc::clone(&emitter);
        transport.attach_route(
            &pattern,
            Arc::new(move |params: &TopicParams, message: &InboundMessage| {
                if let Some(event) = decode_event(params, message, codec.as_ref(), &wire) {
                    let listeners = sink.emit(&event.label, &event);
                    trace!(target: "rpc", label = %event.label, listeners, "Room event emitted");
                }
            }),
        )?;

        debug!(target: "rpc", pattern = %pattern, "Room event routes attached");
        Ok(Self {
            transport,
            pattern,
            emitter,
        })
    }

    pub fn topic_pattern(app_name: &str) -> String {
        format!("apps/{app_name}/api/v1/rooms/+roomId/events")
    }

    /// Subscription filter covering every room of the application
    pub fn subscription_filter(&self) -> String {
        self.pattern.replace("+roomId", "+")
    }

    pub fn on<F>(&self, label: impl Into<String>, listener: F) -> ListenerId
    where
        F: Fn(&RoomEvent) + Send + Sync + 'static,
    {
        self.emitter.on(label.into(), listener)
    }

    pub fn off(&self, label: &str, id: ListenerId) -> bool {
        self.emitter.off(&label.to_string(), id)
    }

    /// Detach the route and drop every listener
    pub fn destroy(&self) {
        self.transport.detach_route(&self.pattern);
        self.emitter.remove_all();
    }
}

fn decode_event(
    params: &TopicParams,
    message: &InboundMessage,
    codec: &dyn Codec,
    wire: &RpcWireNames,
) -> Option<RoomEvent> {
    let properties = &message.properties;
    if properties.user_property(&wire.type_key) != Some(wire.event_type.as_str()) {
        return None;
    }
    let label = properties.user_property(&wire.label_key)?;

    Some(RoomEvent {
        room_id: params.get("roomId").cloned().unwrap_or_default(),
        label: label.to_string(),
        data: codec.decode(&message.payload),
    })
}
