//! WebSocket transport for presence sessions
//!
//! A [`WsConnector`] opens raw links; a link is a pair of channels carrying
//! socket lifecycle events one way and outgoing frames the other. The
//! [`WsTransport`] wraps one link with connect/disconnect futures, JSON
//! message delivery and keep-alive handling.
//!
//! - [`connector`] - tokio-tungstenite backed links
//! - [`transport`] - the per-connection wrapper

use tokio::sync::mpsc;

pub mod connector;
pub mod transport;

pub use connector::TungsteniteConnector;
pub use transport::{WsMessageHandler, WsTransport};

/// Close code reported when a socket ends without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;
/// Close code reported when a close frame carries no status
pub const NO_STATUS_RECEIVED: u16 = 1005;

/// Socket lifecycle as seen by the client
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Open,
    Text(String),
    Error(String),
    /// Always the last event of a link
    Closed { code: u16, was_clean: bool },
}

/// Frames the client asks the link to send
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    Text(String),
    Close,
}

/// One raw WebSocket connection
pub struct WsLink {
    pub commands: mpsc::UnboundedSender<LinkCommand>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl WsLink {
    /// Connected pair of channels: the link and the socket-side ends
    pub fn pair() -> (
        Self,
        mpsc::UnboundedSender<LinkEvent>,
        mpsc::UnboundedReceiver<LinkCommand>,
    ) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                commands: command_tx,
                events: event_rx,
            },
            event_tx,
            command_rx,
        )
    }
}

/// Opens WebSocket links
///
/// `open` returns immediately; the outcome of the handshake arrives as the
/// first [`LinkEvent`] (`Open`, or `Error`/`Closed`).
pub trait WsConnector: Send + Sync + 'static {
    fn open(&self, url: &str) -> WsLink;
}
