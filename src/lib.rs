//! ULMS Realtime - Rust Implementation
//!
//! Reliable bidirectional messaging for ULMS clients: request/response over
//! MQTT v5 and presence sessions over WebSocket.
//!
//! # Overview
//!
//! This crate provides:
//! - An MQTT client with pattern routes and token-refreshing reconnects
//! - An RPC service correlating requests and responses over pub/sub topics
//! - A WebSocket transport with keep-alive handling
//! - Presence sessions that survive server-initiated transport handovers
//! - Backoff, retry and timeout helpers for callers
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use ulms_realtime::config::MqttSection;
//! use ulms_realtime::rpc::RpcService;
//! use ulms_realtime::token::StaticTokenProvider;
//! use ulms_realtime::transport::mqtt::MqttClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Arc::new(MqttClient::new(
//!     MqttSection::new("mqtts://broker.example.org:8883"),
//!     Arc::new(StaticTokenProvider::new("secret")),
//! ));
//! client.connect().await?;
//!
//! let rpc = RpcService::new(
//!     Arc::clone(&client),
//!     "agents/web.user.example.org/api/v1/in/conference.example.org",
//!     "agents/web.user.example.org/api/v1/out/conference.example.org",
//! )?;
//! let room = rpc.send("room.read", json!({"id": "r1"})).await?;
//! println!("{room}");
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod codec;
pub mod config;
pub mod deferred;
pub mod emitter;
pub mod error;
pub mod observability;
pub mod presence;
pub mod retry;
pub mod rpc;
pub mod testing;
pub mod token;
pub mod transport;

pub use backoff::Backoff;
pub use codec::{Codec, FnCodec, JsonCodec};
pub use config::{SdkConfig, WireNames};
pub use deferred::{Deferred, DeferredState};
pub use error::{
    CloseReason, PresenceError, PresenceErrorKind, RpcError, SdkError, SdkResult, TimeoutError,
};
pub use presence::{ConnectOptions, PresenceSession, SessionEvent, SessionEventKind, SessionState};
pub use retry::{reject_by_timeout, retry};
pub use rpc::{Labels, RoomEventService, RpcService};
pub use token::{TokenError, TokenProvider};
pub use transport::mqtt::MqttClient;
pub use transport::ws::WsTransport;
pub use transport::{InboundMessage, MessageProperties, PubSubTransport};
