//! Shared types for the runtime.
//!
//! JSON-RPC 2.0 message types, protocol payloads, and the data model for
//! launch specs and process records.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::codec::Framing;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no `id`, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Normalize a response `id` to the numeric form used for outgoing requests.
///
/// Children may echo the id as a number or as a numeric string.
pub fn parse_request_id(id: &serde_json::Value) -> Option<u64> {
    match id {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ─── Protocol Payloads ──────────────────────────────────────────────────────

/// Method names consumed from the child.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
    pub const RESOURCES_LIST: &str = "resources/list";
    pub const RESOURCES_READ: &str = "resources/read";
    pub const PING: &str = "ping";
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// A tool exposed by an integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema", alias = "input_schema")]
    pub input_schema: serde_json::Value,
}

/// A resource exposed by an integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinition {
    pub uri: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "mimeType", alias = "mime_type")]
    pub mime_type: Option<String>,
}

/// Everything an integration exposes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityList {
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub resources: Vec<ResourceDefinition>,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,
}

/// `resources/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ResourcesListResult {
    #[serde(default)]
    pub resources: Vec<ResourceDefinition>,
}

/// Result of invoking a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<serde_json::Value>,
    #[serde(default, rename = "isError", alias = "is_error")]
    pub is_error: bool,
}

impl ToolCallResult {
    /// Build a single-text-block result (used by in-process handlers).
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![serde_json::json!({"type": "text", "text": text.into()})],
            is_error: false,
        }
    }

    /// Concatenate every text block in the result.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| block.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One content item of a resource read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceContent {
    pub uri: String,
    #[serde(default, rename = "mimeType", alias = "mime_type")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// `resources/read` response payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceReadResult {
    #[serde(default)]
    pub contents: Vec<ResourceContent>,
}

// ─── Data Model ─────────────────────────────────────────────────────────────

/// Identifies one hosted integration of one tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IntegrationKey {
    pub tenant_id: Uuid,
    pub integration_id: Uuid,
}

impl IntegrationKey {
    pub fn new(tenant_id: Uuid, integration_id: Uuid) -> Self {
        Self {
            tenant_id,
            integration_id,
        }
    }
}

impl fmt::Display for IntegrationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.integration_id)
    }
}

/// How the external server is implemented. Informational only; every kind is
/// launched the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    ExternalPython,
    #[serde(alias = "external_node")]
    ExternalNodejs,
    ExternalGo,
    #[default]
    ExternalCustom,
}

impl RuntimeKind {
    /// Map an integration type string to a runtime kind, if it names one.
    pub fn from_integration_type(value: &str) -> Option<Self> {
        match value {
            "external_python" => Some(Self::ExternalPython),
            "external_nodejs" | "external_node" => Some(Self::ExternalNodejs),
            "external_go" => Some(Self::ExternalGo),
            "external_custom" => Some(Self::ExternalCustom),
            _ => None,
        }
    }
}

/// CPU / memory hints. Recorded on the process record, not enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpu_millicores: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u32>,
}

/// Immutable launch description for one hosted integration.
///
/// Replaced, never mutated, on reconfiguration.
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrationLaunchSpec {
    pub key: IntegrationKey,
    pub runtime: RuntimeKind,
    /// Executable followed by its arguments.
    pub command: Vec<String>,
    /// Declared environment: literal values or `${NAME}` placeholders.
    pub env: BTreeMap<String, String>,
    /// User-supplied configuration, exposed under a namespaced prefix.
    pub config: BTreeMap<String, serde_json::Value>,
    pub working_dir: Option<PathBuf>,
    pub framing: Framing,
    pub resource_limits: ResourceLimits,
}

impl IntegrationLaunchSpec {
    /// Minimal spec: command only, everything else defaulted.
    pub fn new(key: IntegrationKey, command: Vec<String>) -> Self {
        Self {
            key,
            runtime: RuntimeKind::default(),
            command,
            env: BTreeMap::new(),
            config: BTreeMap::new(),
            working_dir: None,
            framing: Framing::default(),
            resource_limits: ResourceLimits::default(),
        }
    }
}

/// Lifecycle status of a hosted process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Restarting,
    Error,
    Stopped,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Restarting => "restarting",
            ProcessStatus::Error => "error",
            ProcessStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Observability record for one (tenant, integration) pair.
///
/// Never carries credential material.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessRecord {
    pub tenant_id: Uuid,
    pub integration_id: Uuid,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub restart_count: u32,
    pub runtime: RuntimeKind,
    pub resource_limits: ResourceLimits,
}

impl ProcessRecord {
    pub(crate) fn new(spec: &IntegrationLaunchSpec) -> Self {
        Self {
            tenant_id: spec.key.tenant_id,
            integration_id: spec.key.integration_id,
            pid: None,
            status: ProcessStatus::Starting,
            started_at: None,
            last_health_check: None,
            last_error: None,
            restart_count: 0,
            runtime: spec.runtime,
            resource_limits: spec.resource_limits,
        }
    }

    pub fn key(&self) -> IntegrationKey {
        IntegrationKey::new(self.tenant_id, self.integration_id)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
