//! MQTT 5 transport with pattern routes and token-refreshing reconnects
//!
//! This module separates pure functions from I/O operations for better
//! testability.
//!
//! # Architecture
//!
//! - [`connection`] - Pure connection state, broker options and errors
//! - [`routes`] - Topic patterns with named wildcards and the route table
//! - [`message_handler`] - Pure translation of rumqttc events
//! - [`health_monitor`] - Pure reconnection and disconnect-policy decisions
//! - [`client`] - Impure I/O operations and coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ulms_realtime::config::MqttSection;
//! use ulms_realtime::token::StaticTokenProvider;
//! use ulms_realtime::transport::mqtt::MqttClient;
//! use ulms_realtime::transport::{InboundMessage, PubSubTransport, TopicParams};
//!
//! # tokio_test::block_on(async {
//! let client = MqttClient::new(
//!     MqttSection::new("mqtts://broker.example.org"),
//!     Arc::new(StaticTokenProvider::new("access-token")),
//! );
//!
//! client.attach_route(
//!     "apps/conference/api/v1/rooms/+roomId/events",
//!     Arc::new(|params: &TopicParams, message: &InboundMessage| {
//!         println!("{:?} {}", params.get("roomId"), message.topic);
//!     }),
//! )?;
//! client.connect().await?;
//! client.subscribe("apps/conference/api/v1/rooms/+/events").await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;
pub mod routes;

pub use client::MqttClient;
pub use connection::{ConnectionState, MqttError};
pub use health_monitor::{
    ConnectionEvent, DisconnectAction, HealthMonitor, ReconnectionDecision,
};
pub use message_handler::{EventRoute, MessageHandler};
pub use routes::{RouteTable, TopicPattern};
