//! Runtime error types.
//!
//! Text a child authored (stderr tails, JSON-RPC error messages) passes
//! through that child's redactor before it lands in an error, so no injected
//! credential value reaches the control surface.

use thiserror::Error;

/// Errors raised by the process supervision and protocol bridging layer.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The launch spec is unusable (empty command, missing working dir).
    /// Fatal; never retried automatically.
    #[error("configuration error for '{integration}': {reason}")]
    Configuration { integration: String, reason: String },

    /// No launch spec has been registered for this key.
    #[error("integration '{integration}' is not configured")]
    NotConfigured { integration: String },

    /// The OS refused to create the child process.
    #[error("failed to spawn process for '{integration}': {reason}")]
    SpawnFailed { integration: String, reason: String },

    /// The child did not answer `initialize` in time.
    #[error("handshake with '{integration}' timed out after {timeout_ms}ms")]
    HandshakeTimeout { integration: String, timeout_ms: u64 },

    /// The child exited or answered `initialize` with an error.
    #[error("handshake with '{integration}' failed: {reason}")]
    HandshakeFailed { integration: String, reason: String },

    /// The process has exited or is not RUNNING. Caller-retryable.
    #[error("process for '{integration}' is unavailable: {reason}")]
    ProcessUnavailable { integration: String, reason: String },

    /// A single request received no response in time. The process is left
    /// running.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    RequestTimeout { method: String, timeout_ms: u64 },

    /// The child produced a frame that could not be interpreted.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    /// The child answered with a JSON-RPC error object.
    #[error("server error [{code}]: {message}")]
    Server {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The first start of a handle never reached RUNNING.
    #[error("failed to start '{integration}': {reason}")]
    StartFailed { integration: String, reason: String },

    /// The restart budget is spent; an operator restart is required.
    #[error("'{integration}' failed after {attempts} attempts; manual restart required")]
    MaxRestartsExceeded { integration: String, attempts: u32 },

    /// The credential store could not be queried.
    #[error("credential lookup failed for '{integration}': {reason}")]
    Credential { integration: String, reason: String },
}

impl RuntimeError {
    /// Whether the immediate caller may retry the same call.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RuntimeError::ProcessUnavailable { .. }
                | RuntimeError::RequestTimeout { .. }
                | RuntimeError::Protocol { .. }
        )
    }

    /// Whether this error belongs to the startup class absorbed by the
    /// restart policy.
    pub fn is_startup_failure(&self) -> bool {
        matches!(
            self,
            RuntimeError::SpawnFailed { .. }
                | RuntimeError::HandshakeTimeout { .. }
                | RuntimeError::HandshakeFailed { .. }
        )
    }
}

impl From<serde_json::Error> for RuntimeError {
    fn from(e: serde_json::Error) -> Self {
        RuntimeError::Protocol {
            reason: format!("invalid JSON: {e}"),
        }
    }
}
