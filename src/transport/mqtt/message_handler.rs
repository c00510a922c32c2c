//! Pure message routing and processing logic for MQTT events
//!
//! Converts rumqttc events into [`EventRoute`] decisions and translates
//! between rumqttc publish properties and [`MessageProperties`].

use crate::transport::{InboundMessage, MessageProperties};
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, PublishProperties, SubscribeReasonCode};
use rumqttc::v5::{ConnectionError, Event, StateError};
use rumqttc::Outgoing;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    properties: Self::extract_properties(publish.properties.as_ref()),
                }),
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    rejected: Self::rejected_reason_codes(&suback.return_codes),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Subscribe(packet_id)) => {
                EventRoute::SubscribeSent { packet_id: *packet_id }
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Convert rumqttc publish properties (pure function)
    pub fn extract_properties(properties: Option<&PublishProperties>) -> MessageProperties {
        let Some(properties) = properties else {
            return MessageProperties::default();
        };

        MessageProperties {
            correlation_data: properties
                .correlation_data
                .as_ref()
                .map(|data| String::from_utf8_lossy(data).to_string()),
            response_topic: properties.response_topic.clone(),
            user_properties: properties.user_properties.clone(),
        }
    }

    /// Build rumqttc publish properties (pure function)
    pub fn build_publish_properties(properties: MessageProperties) -> PublishProperties {
        PublishProperties {
            correlation_data: properties.correlation_data.map(Bytes::from),
            response_topic: properties.response_topic,
            user_properties: properties.user_properties,
            ..Default::default()
        }
    }

    /// Reason code of a broker DISCONNECT (pure function)
    ///
    /// rumqttc reports an incoming DISCONNECT as an event loop error rather
    /// than as an incoming packet.
    pub fn broker_disconnect_code(error: &ConnectionError) -> Option<u8> {
        match error {
            ConnectionError::MqttState(StateError::ServerDisconnect { reason_code, .. }) => {
                Some(*reason_code as u8)
            }
            _ => None,
        }
    }

    /// Debug names of failed SUBACK reason codes, empty when all succeeded (pure function)
    pub fn rejected_reason_codes(codes: &[SubscribeReasonCode]) -> Vec<String> {
        codes
            .iter()
            .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
            .map(|code| format!("{code:?}"))
            .collect()
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived(InboundMessage),
    /// SUBSCRIBE packet left with this packet id
    SubscribeSent { packet_id: u16 },
    /// SUBACK arrived; `rejected` lists failed reason codes
    SubscriptionConfirmed { packet_id: u16, rejected: Vec<String> },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}
