//! Hosted integration runtime — process supervision and stdio protocol bridge.
//!
//! This module handles:
//! - Building the environment of each hosted child (identifiers, injected
//!   credential, namespaced user configuration)
//! - Spawning children and completing the `initialize` handshake
//! - Multiplexing JSON-RPC calls over each child's stdio
//! - Health checks, bounded automatic restarts, and graceful stops
//! - The unified capability interface shared with in-process handlers
//! - The status / restart / terminate control surface
//!
//! Dependency order (leaves first): environment → handle → supervisor →
//! control.

pub mod capability;
pub mod codec;
pub mod control;
pub mod credentials;
pub mod environment;
pub mod errors;
pub mod handle;
pub mod policy;
pub mod redact;
pub mod supervisor;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use capability::{Capability, ExternalHandler, HandlerRegistry, IntegrationHandler};
pub use codec::Framing;
pub use control::{Ack, ControlSurface, ProcessStatusView};
pub use credentials::{Credential, CredentialStore, StaticCredentialStore};
pub use environment::{build_environment, ProcessEnvironment};
pub use errors::RuntimeError;
pub use handle::{ProcessHandle, TerminationOutcome};
pub use policy::{BackoffConfig, RuntimeSettings};
pub use supervisor::Supervisor;
pub use types::{
    CapabilityList, IntegrationKey, IntegrationLaunchSpec, ProcessRecord, ProcessStatus,
    ResourceDefinition, ResourceLimits, ResourceReadResult, RuntimeKind, ToolCallResult,
    ToolDefinition,
};
