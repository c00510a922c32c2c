//! Thread-safe metrics collection system
//!
//! Provides atomic counters and mutex-protected collections for tracking
//! operational statistics across the MQTT transport, the RPC service and
//! presence sessions.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_RECORDED_ROUND_TRIPS: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // MQTT transport
    mqtt_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    reconnect_attempts: AtomicU64,
    token_refreshes: AtomicU64,
    terminal_disconnects: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    connection_start_time: AtomicU64,

    // RPC service
    requests_sent: AtomicU64,
    requests_resolved: AtomicU64,
    requests_rejected: AtomicU64,
    requests_discarded: AtomicU64,
    incoming_handled: AtomicU64,
    duplicates_dropped: AtomicU64,
    notifications_dispatched: AtomicU64,
    broadcasts_sent: AtomicU64,
    round_trip_times: Mutex<Vec<u64>>, // in milliseconds

    // Presence sessions
    sessions_started: AtomicU64,
    sessions_connected: AtomicU64,
    handovers: AtomicU64,
    keep_alive_timeouts: AtomicU64,
    sessions_ended: AtomicU64,

    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            mqtt_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            reconnect_attempts: AtomicU64::new(0),
            token_refreshes: AtomicU64::new(0),
            terminal_disconnects: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            requests_resolved: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
            requests_discarded: AtomicU64::new(0),
            incoming_handled: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            notifications_dispatched: AtomicU64::new(0),
            broadcasts_sent: AtomicU64::new(0),
            round_trip_times: Mutex::new(Vec::new()),
            sessions_started: AtomicU64::new(0),
            sessions_connected: AtomicU64::new(0),
            handovers: AtomicU64::new(0),
            keep_alive_timeouts: AtomicU64::new(0),
            sessions_ended: AtomicU64::new(0),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // MQTT metrics
    pub fn mqtt_connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn mqtt_connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn mqtt_connection_lost(&self) {
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_token_refreshed(&self) {
        self.token_refreshes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_terminal_disconnect(&self) {
        self.terminal_disconnects.fetch_add(1, Ordering::Relaxed);
        self.mqtt_connected.store(false, Ordering::Relaxed);
    }

    pub fn mqtt_message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // RPC metrics
    pub fn rpc_request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rpc_request_resolved(&self, round_trip: Duration) {
        self.requests_resolved.fetch_add(1, Ordering::Relaxed);
        self.record_round_trip(round_trip);
    }

    pub fn rpc_request_rejected(&self, round_trip: Duration) {
        self.requests_rejected.fetch_add(1, Ordering::Relaxed);
        self.record_round_trip(round_trip);
    }

    pub fn rpc_requests_discarded(&self, count: usize) {
        self.requests_discarded
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn rpc_incoming_handled(&self) {
        self.incoming_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rpc_duplicate_dropped(&self) {
        self.duplicates_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rpc_notification_dispatched(&self) {
        self.notifications_dispatched
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn rpc_broadcast_sent(&self) {
        self.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
    }

    fn record_round_trip(&self, duration: Duration) {
        if let Ok(mut times) = self.round_trip_times.lock() {
            times.push(duration.as_millis() as u64);

            if times.len() > MAX_RECORDED_ROUND_TRIPS {
                times.remove(0);
            }
        }
    }

    // Presence metrics
    pub fn presence_session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn presence_session_connected(&self) {
        self.sessions_connected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn presence_handover(&self) {
        self.handovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn presence_keep_alive_timeout(&self) {
        self.keep_alive_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn presence_session_ended(&self) {
        self.sessions_ended.fetch_add(1, Ordering::Relaxed);
    }

    // Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.reconnect_attempts,
            &self.token_refreshes,
            &self.terminal_disconnects,
            &self.messages_published,
            &self.publish_failures,
            &self.messages_received,
            &self.connection_start_time,
            &self.requests_sent,
            &self.requests_resolved,
            &self.requests_rejected,
            &self.requests_discarded,
            &self.incoming_handled,
            &self.duplicates_dropped,
            &self.notifications_dispatched,
            &self.broadcasts_sent,
            &self.sessions_started,
            &self.sessions_connected,
            &self.handovers,
            &self.keep_alive_timeouts,
            &self.sessions_ended,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.mqtt_connected.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);
        if let Ok(mut times) = self.round_trip_times.lock() {
            times.clear();
        }
    }

    /// Calculate round-trip statistics (pure function)
    fn calculate_round_trip_statistics(&self) -> (f64, f64, f64, f64) {
        if let Ok(times) = self.round_trip_times.lock() {
            if times.is_empty() {
                (0.0, 0.0, 0.0, 0.0)
            } else {
                let mut sorted_times = times.clone();
                sorted_times.sort_unstable();

                let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
                let p50 = percentile(&sorted_times, 50.0);
                let p95 = percentile(&sorted_times, 95.0);
                let p99 = percentile(&sorted_times, 99.0);

                (avg, p50, p95, p99)
            }
        } else {
            (0.0, 0.0, 0.0, 0.0)
        }
    }

    /// Calculate connection duration (pure function)
    fn calculate_connection_duration(&self, now: u64) -> u64 {
        if !self.mqtt_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        if start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        }
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_round_trip_ms, p50, p95, p99) = self.calculate_round_trip_statistics();

        MetricsSnapshot {
            mqtt: MqttMetrics {
                connected: self.mqtt_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
                token_refreshes: self.token_refreshes.load(Ordering::Relaxed),
                terminal_disconnects: self.terminal_disconnects.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                connection_duration_seconds: self.calculate_connection_duration(now),
            },
            rpc: RpcMetrics {
                requests_sent: self.requests_sent.load(Ordering::Relaxed),
                requests_resolved: self.requests_resolved.load(Ordering::Relaxed),
                requests_rejected: self.requests_rejected.load(Ordering::Relaxed),
                requests_discarded: self.requests_discarded.load(Ordering::Relaxed),
                incoming_handled: self.incoming_handled.load(Ordering::Relaxed),
                duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
                notifications_dispatched: self.notifications_dispatched.load(Ordering::Relaxed),
                broadcasts_sent: self.broadcasts_sent.load(Ordering::Relaxed),
                avg_round_trip_ms,
                round_trip_p50_ms: p50,
                round_trip_p95_ms: p95,
                round_trip_p99_ms: p99,
            },
            presence: PresenceMetrics {
                sessions_started: self.sessions_started.load(Ordering::Relaxed),
                sessions_connected: self.sessions_connected.load(Ordering::Relaxed),
                handovers: self.handovers.load(Ordering::Relaxed),
                keep_alive_timeouts: self.keep_alive_timeouts.load(Ordering::Relaxed),
                sessions_ended: self.sessions_ended.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

// Public metrics structures
#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub mqtt: MqttMetrics,
    pub rpc: RpcMetrics,
    pub presence: PresenceMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct MqttMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub reconnect_attempts: u64,
    pub token_refreshes: u64,
    pub terminal_disconnects: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct RpcMetrics {
    pub requests_sent: u64,
    pub requests_resolved: u64,
    pub requests_rejected: u64,
    pub requests_discarded: u64,
    pub incoming_handled: u64,
    pub duplicates_dropped: u64,
    pub notifications_dispatched: u64,
    pub broadcasts_sent: u64,
    pub avg_round_trip_ms: f64,
    pub round_trip_p50_ms: f64,
    pub round_trip_p95_ms: f64,
    pub round_trip_p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct PresenceMetrics {
    pub sessions_started: u64,
    pub sessions_connected: u64,
    pub handovers: u64,
    pub keep_alive_timeouts: u64,
    pub sessions_ended: u64,
}

// Helper functions
fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_index = index.floor() as usize;
        let upper_index = index.ceil() as usize;
        let lower_value = sorted_data[lower_index] as f64;
        let upper_value = sorted_data[upper_index] as f64;

        lower_value + (upper_value - lower_value) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_mqtt_metrics() {
        let collector = MetricsCollector::new();

        collector.mqtt_connection_attempt();
        collector.mqtt_connection_established();
        collector.mqtt_reconnect_attempt();
        collector.mqtt_token_refreshed();
        collector.mqtt_message_published();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.mqtt.connection_attempts, 1);
        assert_eq!(metrics.mqtt.connections_established, 1);
        assert_eq!(metrics.mqtt.reconnect_attempts, 1);
        assert_eq!(metrics.mqtt.token_refreshes, 1);
        assert_eq!(metrics.mqtt.messages_published, 1);
        assert!(metrics.mqtt.connected);

        collector.mqtt_terminal_disconnect();
        let metrics = collector.get_metrics();
        assert!(!metrics.mqtt.connected);
        assert_eq!(metrics.mqtt.terminal_disconnects, 1);
    }

    #[test]
    fn test_rpc_metrics() {
        let collector = MetricsCollector::new();

        collector.rpc_request_sent();
        collector.rpc_request_sent();
        collector.rpc_request_resolved(Duration::from_millis(120));
        collector.rpc_request_rejected(Duration::from_millis(80));
        collector.rpc_requests_discarded(3);
        collector.rpc_duplicate_dropped();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.rpc.requests_sent, 2);
        assert_eq!(metrics.rpc.requests_resolved, 1);
        assert_eq!(metrics.rpc.requests_rejected, 1);
        assert_eq!(metrics.rpc.requests_discarded, 3);
        assert_eq!(metrics.rpc.duplicates_dropped, 1);
        assert!((metrics.rpc.avg_round_trip_ms - 100.0).abs() < 0.1);
    }

    #[test]
    fn test_presence_metrics() {
        let collector = MetricsCollector::new();

        collector.presence_session_started();
        collector.presence_session_connected();
        collector.presence_handover();
        collector.presence_keep_alive_timeout();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.presence.sessions_started, 1);
        assert_eq!(metrics.presence.handovers, 1);
        assert_eq!(metrics.presence.keep_alive_timeouts, 1);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let mut handles = vec![];

        for _ in 0..10 {
            let collector_clone = Arc::clone(&collector);
            let handle = thread::spawn(move || {
                for _ in 0..100 {
                    collector_clone.rpc_request_sent();
                    collector_clone.mqtt_message_published();
                }
            });
            handles.push(handle);
        }

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.rpc.requests_sent, 1000);
        assert_eq!(metrics.mqtt.messages_published, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        let p50 = percentile(&data, 50.0);
        let p95 = percentile(&data, 95.0);

        assert!((p50 - 5.5).abs() < 0.1, "P50: expected ~5.5, got {p50}");
        assert!((p95 - 9.5).abs() < 0.1, "P95: expected ~9.5, got {p95}");
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_round_trip_bounds() {
        let collector = MetricsCollector::new();

        for i in 0..1500 {
            collector.rpc_request_resolved(Duration::from_millis(i));
        }

        assert_eq!(
            collector.round_trip_times.lock().unwrap().len(),
            MAX_RECORDED_ROUND_TRIPS
        );
    }

    #[test]
    fn test_snapshot_serializes() {
        let collector = MetricsCollector::new();
        collector.rpc_notification_dispatched();

        let json = serde_json::to_value(collector.get_metrics()).unwrap();
        assert_eq!(json["rpc"]["notifications_dispatched"], 1);
        assert!(json["presence"].is_object());
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.rpc_request_sent();
        collector.mqtt_connection_established();
        collector.presence_handover();

        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.rpc.requests_sent, 0);
        assert_eq!(metrics.presence.handovers, 0);
        assert!(!metrics.mqtt.connected);
    }
}
