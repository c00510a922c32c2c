//! Per-connection WebSocket wrapper
//!
//! A transport is created for one connection attempt and never reused.
//! How it ends depends on whether the socket had opened and whether the
//! close was requested locally:
//!
//! | opened | forced | outcome                                                 |
//! |--------|--------|---------------------------------------------------------|
//! | no     | no     | `connect` and `disconnected` reject with the socket reason |
//! | no     | yes    | both reject with the caller's reason, socket events ignored |
//! | yes    | no     | `disconnected` resolves with the last error or close code |
//! | yes    | yes    | `disconnected` resolves with the caller's reason         |

use super::{LinkCommand, LinkEvent, WsConnector};
use crate::config::PresenceWireNames;
use crate::deferred::Deferred;
use crate::error::CloseReason;
use crate::observability::metrics;
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Receives every decoded JSON frame
pub type WsMessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

#[derive(Default)]
struct WsState {
    commands: Option<mpsc::UnboundedSender<LinkCommand>>,
    opened: bool,
    connected: bool,
    forced: bool,
    last_error: Option<String>,
    handler: Option<WsMessageHandler>,
    idle_timeout: Option<Duration>,
    idle_timer: Option<JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

struct WsInner {
    id: String,
    connector: Arc<dyn WsConnector>,
    ping: String,
    pong: String,
    connected: Deferred<(), CloseReason>,
    disconnected: Deferred<CloseReason, CloseReason>,
    state: Mutex<WsState>,
}

/// One WebSocket connection with keep-alive handling
#[derive(Clone)]
pub struct WsTransport {
    inner: Arc<WsInner>,
}

impl WsTransport {
    pub fn new(connector: Arc<dyn WsConnector>, wire: &PresenceWireNames) -> Self {
        let id = Uuid::new_v4().simple().to_string();

        Self {
            inner: Arc::new(WsInner {
                id: id[..8].to_string(),
                connector,
                ping: wire.ping.clone(),
                pong: wire.pong.clone(),
                connected: Deferred::new(),
                disconnected: Deferred::new(),
                state: Mutex::new(WsState::default()),
            }),
        }
    }

    /// Short id used in log lines
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Open the socket. Resolves on open, fails if the socket closes first.
    pub fn connect(&self, url: &str) -> impl Future<Output = Result<(), CloseReason>> + Send + 'static {
        let wait = self.inner.connected.wait();

        let mut state = self.inner.lock();
        if state.commands.is_none() && !state.forced && !state.opened {
            debug!(target: "ws_transport", id = %self.inner.id, url, "Opening socket");
            let link = self.inner.connector.open(url);
            state.commands = Some(link.commands);
            state.pump = Some(tokio::spawn(pump(Arc::downgrade(&self.inner), link.events)));
        }

        wait
    }

    /// Resolves with the close reason once an opened socket closes.
    /// Fails with the reason if the socket never opened.
    pub fn disconnected(&self) -> impl Future<Output = Result<CloseReason, CloseReason>> + Send + 'static {
        self.inner.disconnected.wait()
    }

    /// Force a local shutdown, settling whichever future is still pending
    pub fn close(&self, reason: CloseReason) {
        self.inner.close(reason);
    }

    /// Send a JSON frame. Returns false when not connected.
    pub fn send(&self, payload: &Value) -> bool {
        let state = self.inner.lock();
        if !state.connected {
            return false;
        }
        match &state.commands {
            Some(commands) => commands.send(LinkCommand::Text(payload.to_string())).is_ok(),
            None => false,
        }
    }

    pub fn set_message_handler(&self, handler: Option<WsMessageHandler>) {
        self.inner.lock().handler = handler;
    }

    /// Close the transport if no keep-alive ping arrives within `timeout`
    /// of the previous one. `None` disables the check.
    pub fn set_idle_timeout(&self, timeout: Option<Duration>) {
        let mut state = self.inner.lock();
        state.idle_timeout = timeout;
        if timeout.is_none() {
            if let Some(timer) = state.idle_timer.take() {
                timer.abort();
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }
}

impl WsInner {
    fn lock(&self) -> MutexGuard<'_, WsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_open(&self) {
        let mut state = self.lock();
        if state.forced {
            return;
        }
        state.opened = true;
        state.connected = true;
        drop(state);

        debug!(target: "ws_transport", id = %self.id, "Socket open");
        self.connected.resolve(());
    }

    fn on_error(&self, error: String) {
        let mut state = self.lock();
        if state.forced {
            return;
        }
        debug!(target: "ws_transport", id = %self.id, error = %error, "Socket error");
        state.last_error = Some(error);
    }

    fn on_close(&self, code: u16, was_clean: bool) {
        let mut state = self.lock();
        if state.forced {
            return;
        }
        let reason = match state.last_error.take() {
            Some(error) => CloseReason::TransportError(error),
            None => CloseReason::Socket { code, was_clean },
        };
        let was_connected = state.connected;
        state.connected = false;
        state.commands = None;
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        drop(state);

        debug!(target: "ws_transport", id = %self.id, %reason, "Socket closed");
        if was_connected {
            self.disconnected.resolve(reason);
        } else {
            self.connected.reject(reason.clone());
            self.disconnected.reject(reason);
        }
    }

    fn on_text(self: &Arc<Self>, text: String) {
        if text == self.ping {
            self.on_ping();
            return;
        }

        let handler = {
            let state = self.lock();
            if state.forced {
                return;
            }
            state.handler.clone()
        };
        let Some(handler) = handler else {
            return;
        };

        match serde_json::from_str::<Value>(&text) {
            Ok(message) => handler(message),
            Err(e) => warn!(target: "ws_transport", id = %self.id, "Dropping malformed frame: {}", e),
        }
    }

    fn on_ping(self: &Arc<Self>) {
        let mut state = self.lock();
        if state.forced || !state.connected {
            return;
        }
        if let Some(commands) = &state.commands {
            let _ = commands.send(LinkCommand::Text(self.pong.clone()));
        }

        let Some(timeout) = state.idle_timeout else {
            return;
        };
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        let weak = Arc::downgrade(self);
        state.idle_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                warn!(target: "ws_transport", id = %inner.id, "No keep-alive ping within {:?}", timeout);
                metrics().presence_keep_alive_timeout();
                inner.close(CloseReason::KeepAliveTimedOut);
            }
        }));
    }

    fn close(&self, reason: CloseReason) {
        let mut state = self.lock();
        if state.forced || state.commands.is_none() {
            return;
        }
        state.forced = true;
        if let Some(commands) = state.commands.take() {
            let _ = commands.send(LinkCommand::Close);
        }
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        let was_connected = state.connected;
        state.connected = false;
        drop(state);

        debug!(target: "ws_transport", id = %self.id, %reason, "Closing socket");
        if was_connected {
            self.disconnected.resolve(reason);
        } else {
            self.connected.reject(reason.clone());
            self.disconnected.reject(reason);
        }
    }
}

impl Drop for WsInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(commands) = state.commands.take() {
            let _ = commands.send(LinkCommand::Close);
        }
        for task in [state.idle_timer.take(), state.pump.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

async fn pump(inner: Weak<WsInner>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            LinkEvent::Open => inner.on_open(),
            LinkEvent::Text(text) => inner.on_text(text),
            LinkEvent::Error(error) => inner.on_error(error),
            LinkEvent::Closed { code, was_clean } => {
                inner.on_close(code, was_clean);
                return;
            }
        }
    }

    if let Some(inner) = inner.upgrade() {
        inner.on_close(super::ABNORMAL_CLOSURE, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferred::DeferredState;
    use crate::testing::MockWsConnector;
    use serde_json::json;

    fn transport(connector: &MockWsConnector) -> WsTransport {
        WsTransport::new(Arc::new(connector.clone()), &PresenceWireNames::default())
    }

    #[tokio::test]
    async fn test_connect_resolves_on_open() {
        let connector = MockWsConnector::new();
        let transport = transport(&connector);

        let connected = transport.connect("ws://presence.test/ws");
        let server = connector.accept().await;
        assert_eq!(server.url(), "ws://presence.test/ws");
        server.open();

        connected.await.unwrap();
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_close_before_open_rejects_both_futures() {
        let connector = MockWsConnector::new();
        let transport = transport(&connector);

        let connected = transport.connect("ws://presence.test/ws");
        let server = connector.accept().await;
        server.error("connection refused");
        server.close(1006, false);

        let error = connected.await.unwrap_err();
        assert_eq!(error, CloseReason::TransportError("connection refused".to_string()));
        assert_eq!(transport.disconnected().await.unwrap_err(), error);
    }

    #[tokio::test]
    async fn test_remote_close_after_open_resolves_disconnected() {
        let connector = MockWsConnector::new();
        let transport = transport(&connector);

        let connected = transport.connect("ws://presence.test/ws");
        let server = connector.accept().await;
        server.open();
        connected.await.unwrap();

        server.close(1001, true);
        let reason = transport.disconnected().await.unwrap();
        assert_eq!(
            reason,
            CloseReason::Socket {
                code: 1001,
                was_clean: true
            }
        );
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_forced_close_after_open_uses_caller_reason() {
        let connector = MockWsConnector::new();
        let transport = transport(&connector);

        let connected = transport.connect("ws://presence.test/ws");
        let mut server = connector.accept().await;
        server.open();
        connected.await.unwrap();

        transport.close(CloseReason::Requested);
        assert_eq!(transport.disconnected().await.unwrap(), CloseReason::Requested);
        assert_eq!(server.next_command().await, Some(LinkCommand::Close));

        // socket events after a local close are ignored
        server.close(1000, true);
        transport.close(CloseReason::KeepAliveTimedOut);
        assert_eq!(transport.disconnected().await.unwrap(), CloseReason::Requested);
    }

    #[tokio::test]
    async fn test_forced_close_before_open_rejects() {
        let connector = MockWsConnector::new();
        let transport = transport(&connector);

        let connected = transport.connect("ws://presence.test/ws");
        let server = connector.accept().await;
        transport.close(CloseReason::Requested);
        server.open();

        assert_eq!(connected.await.unwrap_err(), CloseReason::Requested);
        assert_eq!(transport.disconnected().await.unwrap_err(), CloseReason::Requested);
    }

    #[tokio::test]
    async fn test_send_is_noop_when_not_connected() {
        let connector = MockWsConnector::new();
        let transport = transport(&connector);

        assert!(!transport.send(&json!({"type": "connect_request"})));
    }

    #[tokio::test]
    async fn test_messages_reach_handler_and_malformed_frames_are_dropped() {
        let connector = MockWsConnector::new();
        let transport = transport(&connector);
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_message_handler(Some(Arc::new(move |message: Value| {
            let _ = tx.send(message);
        })));

        let connected = transport.connect("ws://presence.test/ws");
        let mut server = connector.accept().await;
        server.open();
        connected.await.unwrap();

        server.send_text("{not json");
        server.send_json(json!({"type": "event", "payload": {"n": 1}}));

        assert_eq!(rx.recv().await.unwrap()["payload"]["n"], 1);

        assert!(transport.send(&json!({"type": "hello"})));
        assert_eq!(server.next_json().await.unwrap()["type"], "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_answered_with_pong() {
        let connector = MockWsConnector::new();
        let transport = transport(&connector);

        let connected = transport.connect("ws://presence.test/ws");
        let mut server = connector.accept().await;
        server.open();
        connected.await.unwrap();

        server.send_text("2");
        assert_eq!(
            server.next_command().await,
            Some(LinkCommand::Text("3".to_string()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_timeout_force_closes() {
        let connector = MockWsConnector::new();
        let transport = transport(&connector);
        transport.set_idle_timeout(Some(Duration::from_millis(1000)));

        let connected = transport.connect("ws://presence.test/ws");
        let mut server = connector.accept().await;
        server.open();
        connected.await.unwrap();

        server.send_text("2");
        assert_eq!(
            server.next_command().await,
            Some(LinkCommand::Text("3".to_string()))
        );

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(
            transport.disconnected().await.unwrap(),
            CloseReason::KeepAliveTimedOut
        );
        assert_eq!(server.next_command().await, Some(LinkCommand::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_ping_resets_idle_timer() {
        let connector = MockWsConnector::new();
        let transport = transport(&connector);
        transport.set_idle_timeout(Some(Duration::from_millis(1000)));

        let connected = transport.connect("ws://presence.test/ws");
        let mut server = connector.accept().await;
        server.open();
        connected.await.unwrap();

        for _ in 0..3 {
            server.send_text("2");
            assert!(server.next_command().await.is_some());
            tokio::time::sleep(Duration::from_millis(800)).await;
        }

        assert!(transport.is_connected());
        assert_eq!(
            transport.inner.disconnected.state(),
            DeferredState::Pending
        );
    }
}
