//! Observability for the realtime core
//!
//! Structured logging setup and span macros, plus a process-wide metrics
//! collector fed by the transport, RPC and presence layers.

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

pub use logging::{mqtt_span, presence_span, rpc_span};
