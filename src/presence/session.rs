//! Presence session over replaceable WebSocket transports
//!
//! A session outlives the sockets it runs on. When the server reports a
//! recoverable condition on the current socket, a replacement is opened
//! and authenticated while the old one stays up; callers only see the
//! `connect` event fire again. Any other failure ends the session, and
//! [`PresenceSession::disconnected`] resolves with the reason.

use crate::config::PresenceWireNames;
use crate::deferred::Deferred;
use crate::emitter::{EventEmitter, ListenerId};
use crate::error::{CloseReason, PresenceError, PresenceErrorKind};
use crate::observability::metrics;
use crate::token::TokenProvider;
use crate::transport::ws::{WsConnector, WsTransport};
use futures::future::{self, Either};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tracing::{debug, info, warn, Instrument};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Identity presented in the handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectOptions {
    pub agent_label: String,
    pub classroom_id: String,
}

impl ConnectOptions {
    pub fn new(agent_label: impl Into<String>, classroom_id: impl Into<String>) -> Self {
        Self {
            agent_label: agent_label.into(),
            classroom_id: classroom_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// `connect` was never called
    Idle,
    Connecting,
    Connected,
    /// Connected, with a replacement transport being established
    HandoverPending,
    /// The last connect cycle ended
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionEventKind {
    Connect,
    Event,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A transport completed the handshake (first connect or handover)
    Connect,
    /// Notification frame from the server, as received
    Event(Value),
}

/// Futures scoped to one `connect` call
#[derive(Clone)]
struct Cycle {
    connected: Deferred<(), CloseReason>,
    disconnected: Deferred<CloseReason, CloseReason>,
    /// Settled to cancel whatever the flow is waiting on
    cancel: Deferred<(), ()>,
}

impl Cycle {
    fn new() -> Self {
        Self {
            connected: Deferred::new(),
            disconnected: Deferred::new(),
            cancel: Deferred::new(),
        }
    }

    fn same_as(&self, other: &Cycle) -> bool {
        self.cancel.same_as(&other.cancel)
    }

    fn cancelled(&self) -> bool {
        !self.cancel.is_pending()
    }

    /// Resolves once the cycle is cancelled
    fn on_cancel(&self) -> impl Future<Output = ()> + Send + 'static {
        let wait = self.cancel.wait();
        async move {
            let _ = wait.await;
        }
    }
}

struct SessionCore {
    state: SessionState,
    connected: bool,
    active: bool,
    cycle: Cycle,
    transport: Option<WsTransport>,
    last_protocol_error: Option<PresenceError>,
    recoverable: Deferred<PresenceError, ()>,
}

struct SessionInner {
    url: String,
    token_provider: Arc<dyn TokenProvider>,
    connector: Arc<dyn WsConnector>,
    wire: PresenceWireNames,
    events: EventEmitter<SessionEventKind, SessionEvent>,
    core: Mutex<SessionCore>,
}

/// One logical presence session
#[derive(Clone)]
pub struct PresenceSession {
    inner: Arc<SessionInner>,
}

impl PresenceSession {
    pub fn new(
        url: impl Into<String>,
        token_provider: Arc<dyn TokenProvider>,
        connector: Arc<dyn WsConnector>,
        wire: PresenceWireNames,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                url: url.into(),
                token_provider,
                connector,
                wire,
                events: EventEmitter::new(),
                core: Mutex::new(SessionCore {
                    state: SessionState::Idle,
                    connected: false,
                    active: false,
                    cycle: Cycle::new(),
                    transport: None,
                    last_protocol_error: None,
                    recoverable: Deferred::new(),
                }),
            }),
        }
    }

    /// Start a connect cycle and return its connected future.
    ///
    /// While a cycle is running, the running cycle's future is returned.
    /// After a cycle has ended, a new one starts from scratch. There is no
    /// handshake timeout; bound the future externally if needed.
    pub fn connect(
        &self,
        options: ConnectOptions,
    ) -> impl Future<Output = Result<(), CloseReason>> + Send + 'static {
        let mut core = lock(&self.inner.core);
        if core.active {
            debug!(target: "presence", "Connect cycle already running");
            return core.cycle.connected.wait();
        }

        let cycle = Cycle::new();
        core.cycle = cycle.clone();
        core.active = true;
        core.connected = false;
        core.state = SessionState::Connecting;
        core.last_protocol_error = None;
        core.recoverable = Deferred::new();
        drop(core);

        metrics().presence_session_started();
        let span = crate::presence_span!(
            agent_label = %options.agent_label,
            classroom_id = %options.classroom_id
        );
        let wait = cycle.connected.wait();
        tokio::spawn(flow(Arc::clone(&self.inner), options, cycle).instrument(span));
        wait
    }

    /// End the session. Safe to call at any time, any number of times.
    pub fn disconnect(&self) {
        let (cycle, transport) = {
            let mut core = lock(&self.inner.core);
            core.connected = false;
            if core.active {
                // Detach the cycle so a following `connect` starts a new one
                core.active = false;
                core.state = SessionState::Disconnected;
            }
            (core.cycle.clone(), core.transport.take())
        };

        info!(target: "presence", "Disconnect requested");
        cycle.connected.reject(CloseReason::Requested);
        cycle.cancel.resolve(());
        if let Some(transport) = transport {
            transport.close(CloseReason::Requested);
        }
    }

    /// Resolves with the reason once a connected session ends.
    ///
    /// Fails at once with `NOT_CONNECTED` when the session is not connected.
    pub fn disconnected(
        &self,
    ) -> impl Future<Output = Result<CloseReason, CloseReason>> + Send + 'static {
        let core = lock(&self.inner.core);
        if core.connected {
            Either::Left(core.cycle.disconnected.wait())
        } else {
            Either::Right(future::ready(Err(CloseReason::protocol(
                PresenceErrorKind::NotConnected,
            ))))
        }
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner.core).state
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.core).connected
    }

    /// Most recent error reported by the server in this cycle
    pub fn last_protocol_error(&self) -> Option<PresenceError> {
        lock(&self.inner.core).last_protocol_error.clone()
    }

    pub fn on<F>(&self, kind: SessionEventKind, listener: F) -> ListenerId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.inner.events.on(kind, listener)
    }

    pub fn off(&self, kind: SessionEventKind, id: ListenerId) -> bool {
        self.inner.events.off(&kind, id)
    }
}

impl SessionInner {
    fn set_state(&self, cycle: &Cycle, state: SessionState) {
        let mut core = lock(&self.core);
        if core.cycle.same_as(cycle) {
            core.state = state;
        }
    }

    fn handle_message(&self, message: Value) {
        let kind = message.get("type").and_then(Value::as_str);
        match kind {
            Some(kind) if kind == self.wire.event_type => {
                self.events
                    .emit(&SessionEventKind::Event, &SessionEvent::Event(message));
            }
            Some(kind) if kind == self.wire.error_type => {
                let error = PresenceError::from_payload(message.get("payload").unwrap_or(&Value::Null));
                let recoverable = {
                    let mut core = lock(&self.core);
                    core.last_protocol_error = Some(error.clone());
                    core.recoverable.clone()
                };

                if error.is_recoverable() {
                    info!(target: "presence", kind = %error.kind, "Recoverable session error");
                    recoverable.resolve(error);
                } else {
                    warn!(target: "presence", kind = %error.kind, "Session error");
                }
            }
            other => debug!(target: "presence", kind = ?other, "Ignoring frame"),
        }
    }

    /// Open a transport and complete the handshake on it
    async fn create_transport(
        &self,
        options: &ConnectOptions,
        cycle: &Cycle,
    ) -> Result<WsTransport, CloseReason> {
        let token = tokio::select! {
            biased;
            _ = cycle.on_cancel() => return Err(CloseReason::Requested),
            token = self.token_provider.get_token() => token.map_err(CloseReason::Token)?,
        };

        let transport = WsTransport::new(Arc::clone(&self.connector), &self.wire);
        let reply: Deferred<Value, ()> = Deferred::new();
        let first_reply = reply.clone();
        transport.set_message_handler(Some(Arc::new(move |message: Value| {
            first_reply.resolve(message);
        })));

        match self.handshake(&transport, options, token, cycle, reply).await {
            Ok(()) => Ok(transport),
            Err(reason) => {
                debug!(target: "presence", id = transport.id(), %reason, "Handshake failed");
                transport.close(reason.clone());
                Err(reason)
            }
        }
    }

    async fn handshake(
        &self,
        transport: &WsTransport,
        options: &ConnectOptions,
        token: String,
        cycle: &Cycle,
        reply: Deferred<Value, ()>,
    ) -> Result<(), CloseReason> {
        tokio::select! {
            biased;
            _ = cycle.on_cancel() => return Err(CloseReason::Requested),
            opened = transport.connect(&self.url) => opened?,
        }

        let mut payload = Map::new();
        payload.insert("agent_label".to_string(), json!(options.agent_label));
        payload.insert("classroom_id".to_string(), json!(options.classroom_id));
        payload.insert(self.wire.token_field.clone(), json!(token));
        transport.send(&json!({
            "type": self.wire.connect_request_type,
            "payload": payload,
        }));

        let message = tokio::select! {
            biased;
            _ = cycle.on_cancel() => return Err(CloseReason::Requested),
            closed = transport.disconnected() => return Err(closed.unwrap_or_else(|reason| reason)),
            message = reply.wait() => message.map_err(|_| CloseReason::protocol(PresenceErrorKind::UnknownError))?,
        };

        let kind = message.get("type").and_then(Value::as_str).unwrap_or_default();
        if self.wire.connect_success_types.iter().any(|t| t == kind) {
            let idle_timeout = message.get("payload").and_then(|payload| {
                self.wire
                    .idle_timeout_fields
                    .iter()
                    .find_map(|field| payload.get(field).and_then(Value::as_u64))
            });
            if let Some(ms) = idle_timeout {
                transport.set_idle_timeout(Some(Duration::from_millis(ms)));
            }
            return Ok(());
        }

        let error = if kind == self.wire.error_type {
            PresenceError::from_payload(message.get("payload").unwrap_or(&Value::Null))
        } else {
            PresenceError::new(PresenceErrorKind::UnknownError)
        };
        lock(&self.core).last_protocol_error = Some(error.clone());
        Err(CloseReason::Protocol(error))
    }

    /// Whether a previous transport closing mid-handover leaves the new
    /// attempt running
    fn tolerates_previous_close(&self, reason: &CloseReason) -> bool {
        let last = lock(&self.core).last_protocol_error.clone();
        let by_last_error = last.is_some_and(|error| {
            error.is_recoverable() || error.kind == PresenceErrorKind::SessionReplaced
        });
        let by_reason = reason.kind().is_some_and(|kind| kind.is_recoverable());
        by_last_error || by_reason
    }
}

async fn flow(inner: Arc<SessionInner>, options: ConnectOptions, cycle: Cycle) {
    let mut previous: Option<WsTransport> = None;
    let mut ever_connected = false;

    let reason = loop {
        let attempt = inner.create_transport(&options, &cycle);

        let result = match &previous {
            None => attempt.await,
            Some(old) => {
                inner.set_state(&cycle, SessionState::HandoverPending);
                tokio::pin!(attempt);
                tokio::select! {
                    biased;
                    result = &mut attempt => result,
                    closed = old.disconnected() => {
                        let closed = closed.unwrap_or_else(|reason| reason);
                        if inner.tolerates_previous_close(&closed) {
                            debug!(target: "presence", id = old.id(), reason = %closed, "Previous transport closed during handover");
                            attempt.await
                        } else {
                            Err(closed)
                        }
                    }
                }
            }
        };

        let transport = match result {
            Ok(transport) => transport,
            Err(reason) => break reason,
        };

        let recoverable = Deferred::new();
        let installed = {
            let mut core = lock(&inner.core);
            let current = core.cycle.same_as(&cycle) && !cycle.cancelled();
            if current {
                core.last_protocol_error = None;
                core.recoverable = recoverable.clone();
                core.transport = Some(transport.clone());
                core.state = SessionState::Connected;
                if !ever_connected {
                    core.connected = true;
                }
            }
            current
        };
        if !installed {
            transport.close(CloseReason::Requested);
            break CloseReason::Requested;
        }

        info!(target: "presence", id = transport.id(), handover = previous.is_some(), "Transport connected");
        inner
            .events
            .emit(&SessionEventKind::Connect, &SessionEvent::Connect);

        if let Some(old) = previous.take() {
            old.close(CloseReason::Requested);
        }

        let weak: Weak<SessionInner> = Arc::downgrade(&inner);
        transport.set_message_handler(Some(Arc::new(move |message: Value| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_message(message);
            }
        })));

        if !ever_connected {
            ever_connected = true;
            metrics().presence_session_connected();
            cycle.connected.resolve(());
        }

        tokio::select! {
            biased;
            _ = cycle.on_cancel() => break CloseReason::Requested,
            error = recoverable.wait() => {
                if let Ok(error) = error {
                    info!(target: "presence", id = transport.id(), kind = %error.kind, "Starting handover");
                    metrics().presence_handover();
                }
                previous = Some(transport);
            }
            closed = transport.disconnected() => {
                break closed.unwrap_or_else(|reason| reason);
            }
        }
    };

    cycle.cancel.resolve(());
    if let Some(old) = previous.take() {
        old.close(CloseReason::Requested);
    }

    let (reason, transport) = {
        let mut core = lock(&inner.core);
        if core.cycle.same_as(&cycle) {
            let reason = core
                .last_protocol_error
                .clone()
                .map(CloseReason::Protocol)
                .unwrap_or(reason);
            core.connected = false;
            core.active = false;
            core.state = SessionState::Disconnected;
            (reason, core.transport.take())
        } else {
            (reason, None)
        }
    };
    if let Some(transport) = transport {
        transport.close(CloseReason::Requested);
    }

    if !ever_connected {
        cycle.connected.reject(reason.clone());
    }
    metrics().presence_session_ended();
    info!(target: "presence", %reason, "Session ended");
    cycle.disconnected.resolve(reason);
}
