//! Observability for the managed MQTT client
//!
//! Structured logging setup; connection health numbers are exposed through
//! [`crate::transport::mqtt::HealthMetrics`].

pub mod logging;

// Re-export for convenience
pub use logging::{init_default_logging, init_logging, LogFormat, LogSettings};

// Span macros for structured logging
pub use logging::{dispatch_span, mqtt_span};
