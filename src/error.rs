//! Crate-level error types
//!
//! Component errors live next to their components (`MqttError`, `HandlerError`,
//! `ConfigError`); this module ties them together for callers that only want a
//! single error type, and provides redaction for error text that ends up in logs.

use crate::config::ConfigError;
use crate::transport::mqtt::MqttError;
use regex::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Umbrella error for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),
}

impl ClientError {
    /// Error text safe to log: credentials redacted, length bounded
    pub fn sanitized_message(&self) -> String {
        sanitize_error_message(&self.to_string())
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

const MAX_MESSAGE_LEN: usize = 500;

fn secret_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(password|passwd|token|secret)[=:]\s*\S+").expect("valid regex")
    })
}

fn userinfo_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b((?:mqtts?|tcp|ssl|wss?)://)[^/@\s:]+:[^/@\s]+@").expect("valid regex")
    })
}

/// Redact credentials from error text before it is logged
///
/// Handles `password=...` style pairs and `user:pass@` userinfo in broker URLs.
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = secret_pattern()
        .replace_all(message, "${1}=***")
        .to_string();

    sanitized = userinfo_pattern()
        .replace_all(&sanitized, "${1}***@")
        .to_string();

    if sanitized.len() > MAX_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}
