//! Request/response and notification protocol over MQTT
//!
//! [`RpcService`] correlates requests with responses over a pair of topics
//! and answers incoming requests with registered handlers.
//! [`RoomEventService`] delivers room-scoped notifications by label.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use ulms_realtime::rpc::{Labels, RpcService};
//! use ulms_realtime::testing::MockPubSub;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(MockPubSub::connected());
//! let rpc = RpcService::new(transport, "agents/me/api/v1/in/app", "agents/me/api/v1/out/app")?;
//! rpc.set_labels(Labels::new().app_label("portal"));
//!
//! let room = rpc.send("room.read", json!({"id": "r1"})).await?;
//! println!("{room}");
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod pending;
pub mod service;

pub use events::{RoomEvent, RoomEventService};
pub use pending::ResponseFuture;
pub use service::{NotificationHandler, RequestHandler, RpcService, RpcServiceBuilder};

use serde::{Deserialize, Serialize};

/// Optional attributes attached to every outgoing message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Labels {
    pub app_audience: Option<String>,
    pub app_label: Option<String>,
    pub app_version: Option<String>,
    pub scope: Option<String>,
}

impl Labels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app_audience(mut self, value: impl Into<String>) -> Self {
        self.app_audience = Some(value.into());
        self
    }

    pub fn app_label(mut self, value: impl Into<String>) -> Self {
        self.app_label = Some(value.into());
        self
    }

    pub fn app_version(mut self, value: impl Into<String>) -> Self {
        self.app_version = Some(value.into());
        self
    }

    pub fn scope(mut self, value: impl Into<String>) -> Self {
        self.scope = Some(value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.to_user_properties().is_empty()
    }

    /// Set labels as MQTT user properties
    pub fn to_user_properties(&self) -> Vec<(String, String)> {
        [
            ("app_audience", &self.app_audience),
            ("app_label", &self.app_label),
            ("app_version", &self.app_version),
            ("scope", &self.scope),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), v.clone())))
        .collect()
    }
}
