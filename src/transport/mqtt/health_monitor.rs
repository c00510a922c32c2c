//! Pure health monitoring and reconnection logic for MQTT client
//!
//! This module contains pure functions for reconnection decisions, broker
//! disconnect classification, and connection state tracking.

use super::connection::ConnectionState;
use rumqttc::v5::ConnectionError;
use tracing::{error, info, warn};

/// Broker reason code that is informational only (implementation specific limits)
pub const REASON_IMPLEMENTATION_SPECIFIC: u8 = 131;
/// Broker reason code for a missed keep-alive; the client reconnects immediately
pub const REASON_KEEP_ALIVE_TIMEOUT: u8 = 141;

/// Reason used when the reconnect ceiling is hit
pub const RETRY_LIMIT_EXCEEDED: &str = "retry_limit_exceeded";

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide what to do after an unforced close (pure function)
    ///
    /// The first reconnect after a successful connection is immediate; later
    /// ones wait `backoff_delay_ms`.
    pub fn should_attempt_reconnection(
        reconnect_count: u32,
        reconnect_limit: u32,
        shutdown_requested: bool,
        backoff_delay_ms: u64,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if reconnect_count >= reconnect_limit {
            return ReconnectionDecision::AbortMaxAttemptsExceeded;
        }

        ReconnectionDecision::Proceed {
            attempt: reconnect_count + 1,
            delay_ms: if reconnect_count == 0 { 0 } else { backoff_delay_ms },
        }
    }

    /// Classify a broker DISCONNECT reason code (pure function)
    pub fn classify_disconnect(reason_code: u8) -> DisconnectAction {
        match reason_code {
            0 | REASON_IMPLEMENTATION_SPECIFIC => DisconnectAction::Ignore,
            REASON_KEEP_ALIVE_TIMEOUT => {
                DisconnectAction::ReconnectImmediately(Self::reason_code_name(reason_code))
            }
            code => DisconnectAction::Terminate(Self::reason_code_name(code)),
        }
    }

    /// MQTT 5 reason code names (pure function)
    pub fn reason_code_name(reason_code: u8) -> &'static str {
        match reason_code {
            0 => "Normal disconnection",
            4 => "Disconnect with Will Message",
            128 => "Unspecified error",
            129 => "Malformed Packet",
            130 => "Protocol Error",
            131 => "Implementation specific error",
            135 => "Not authorized",
            137 => "Server busy",
            139 => "Server shutting down",
            141 => "Keep Alive timeout",
            142 => "Session taken over",
            143 => "Topic Filter invalid",
            144 => "Topic Name invalid",
            147 => "Receive Maximum exceeded",
            148 => "Topic Alias invalid",
            149 => "Packet too large",
            150 => "Message rate too high",
            151 => "Quota exceeded",
            152 => "Administrative action",
            153 => "Payload format invalid",
            154 => "Retain not supported",
            155 => "QoS not supported",
            156 => "Use another server",
            157 => "Server moved",
            158 => "Shared Subscriptions not supported",
            159 => "Connection rate exceeded",
            160 => "Maximum connect time",
            161 => "Subscription Identifiers not supported",
            162 => "Wildcard Subscriptions not supported",
            _ => "Unknown reason code",
        }
    }

    /// Determine next state after connection event (pure function)
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Connected,
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
            ConnectionEvent::ClientDisconnected => {
                ConnectionState::Disconnected("Client disconnected".to_string())
            }
        }
    }

    /// Check if connection state allows publishing (pure function)
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// Errors that do not end the first connection attempt (pure function)
    ///
    /// A timed out network connect is retried through the reconnect path.
    pub fn is_retryable_connect_error(error: &ConnectionError) -> bool {
        matches!(error, ConnectionError::Timeout(_))
    }

    /// Log connection state transition (pure logging function)
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!(target: "mqtt_transport", "MQTT connection established successfully");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(target: "mqtt_transport", "MQTT connection lost: {}", reason);
            }
            (_, ConnectionState::Reconnecting(attempt)) => {
                info!(target: "mqtt_transport", "Starting reconnection attempt {}", attempt);
            }
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!(target: "mqtt_transport", "Reconnection successful");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(target: "mqtt_transport", "MQTT connection permanently failed: {}", reason);
            }
            _ => {
                info!(target: "mqtt_transport", "MQTT connection state: {:?} -> {:?}", from, to);
            }
        }
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Proceed with reconnection attempt
    Proceed { attempt: u32, delay_ms: u64 },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// What a broker DISCONNECT reason code asks the client to do
#[derive(Debug, PartialEq)]
pub enum DisconnectAction {
    /// Let the regular close handling run
    Ignore,
    /// Drop the connection and reconnect at once with a fresh token
    ReconnectImmediately(&'static str),
    /// Stop for good
    Terminate(&'static str),
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// ConnAck received from broker
    ConnAckReceived,
    /// Network or protocol error
    NetworkError(String),
    /// Reconnection attempt started
    ReconnectionStarted(u32),
    /// Permanent failure - no more retries
    PermanentFailure(String),
    /// Local disconnect
    ClientDisconnected,
}
