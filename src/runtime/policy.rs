//! Runtime timing and restart policy.
//!
//! Every knob has a serde default so a config file only names what it
//! changes. Durations are plain millisecond counts.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default value for the hosted platform's API base URL.
pub const DEFAULT_PLATFORM_API_URL: &str = "http://localhost:8000";

/// Protocol revision announced in `initialize`.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

/// Timing and restart settings shared by the supervisor and its handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Base URL of the hosting platform's own API, injected into children.
    #[serde(default = "default_platform_api_url")]
    pub platform_api_url: String,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Consecutive failed health checks that count as a crash.
    #[serde(default = "default_health_failure_threshold")]
    pub health_failure_threshold: u32,
    /// Failed attempts per incident before a handle is parked in ERROR.
    #[serde(default = "default_max_restart_attempts")]
    pub max_restart_attempts: u32,
    #[serde(default)]
    pub restart_backoff: BackoffConfig,
    /// Wait after closing stdin before the child is killed.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
    #[serde(default = "default_max_pending_requests")]
    pub max_pending_requests: usize,
}

fn default_platform_api_url() -> String {
    DEFAULT_PLATFORM_API_URL.to_string()
}
fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}
fn default_handshake_timeout_ms() -> u64 {
    10_000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_health_check_interval_ms() -> u64 {
    30_000
}
fn default_health_failure_threshold() -> u32 {
    2
}
fn default_max_restart_attempts() -> u32 {
    3
}
fn default_shutdown_grace_ms() -> u64 {
    5_000
}
fn default_max_pending_requests() -> usize {
    256
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            platform_api_url: default_platform_api_url(),
            protocol_version: default_protocol_version(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_failure_threshold: default_health_failure_threshold(),
            max_restart_attempts: default_max_restart_attempts(),
            restart_backoff: BackoffConfig::default(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_pending_requests: default_max_pending_requests(),
        }
    }
}

impl RuntimeSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Delay between automatic restart attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffConfig {
    /// Same delay before every attempt.
    Fixed { delay_ms: u64 },
    /// `initial_ms * 2^(attempt-1)`, capped at `max_ms`.
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::Fixed { delay_ms: 2_000 }
    }
}

impl BackoffConfig {
    /// Delay before restart attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            Self::Exponential { initial_ms, max_ms } => {
                let shift = attempt.saturating_sub(1).min(32);
                let delay = initial_ms.saturating_mul(1u64 << shift);
                Duration::from_millis(delay.min(*max_ms))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = RuntimeSettings::default();
        assert_eq!(settings.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(settings.request_timeout(), Duration::from_secs(30));
        assert_eq!(settings.health_check_interval(), Duration::from_secs(30));
        assert_eq!(settings.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(settings.max_restart_attempts, 3);
        assert_eq!(settings.health_failure_threshold, 2);
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = BackoffConfig::default();
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(2));
    }

    #[test]
    fn test_exponential_backoff_caps() {
        let backoff = BackoffConfig::Exponential {
            initial_ms: 1_000,
            max_ms: 3_000,
        };
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(3));
        assert_eq!(backoff.delay_for_attempt(60), Duration::from_secs(3));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
            request_timeout_ms: 500
            restart_backoff:
              type: exponential
              initial_ms: 100
              max_ms: 400
        "#;
        let settings: RuntimeSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.request_timeout_ms, 500);
        assert_eq!(settings.handshake_timeout_ms, 10_000);
        assert!(matches!(
            settings.restart_backoff,
            BackoffConfig::Exponential { initial_ms: 100, .. }
        ));
    }
}
