//! Presence service sessions
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ulms_realtime::config::PresenceWireNames;
//! use ulms_realtime::presence::{ConnectOptions, PresenceSession, SessionEventKind};
//! use ulms_realtime::token::StaticTokenProvider;
//! use ulms_realtime::transport::ws::TungsteniteConnector;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = PresenceSession::new(
//!     "wss://presence.example.org/ws",
//!     Arc::new(StaticTokenProvider::new("secret")),
//!     Arc::new(TungsteniteConnector::new()),
//!     PresenceWireNames::default(),
//! );
//! session.on(SessionEventKind::Event, |event| println!("{event:?}"));
//!
//! session.connect(ConnectOptions::new("web", "classroom-1")).await?;
//! let reason = session.disconnected().await?;
//! println!("session ended: {reason}");
//! # Ok(())
//! # }
//! ```

pub mod session;

pub use session::{ConnectOptions, PresenceSession, SessionEvent, SessionEventKind, SessionState};
