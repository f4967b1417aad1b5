//! Process handle — one hosted child process and its protocol bridge.
//!
//! A handle is only returned once the `initialize` handshake has completed.
//! After that it serves capability calls until the child exits, the
//! supervisor marks it unavailable, or it is terminated. A handle is never
//! revived; the supervisor replaces it with a fresh one.

use std::borrow::Cow;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use super::capability::Capability;
use super::environment::ProcessEnvironment;
use super::errors::RuntimeError;
use super::policy::RuntimeSettings;
use super::redact::SecretRedactor;
use super::transport::StdioTransport;
use super::types::{
    error_codes, methods, CapabilityList, InitializeResult, IntegrationKey, IntegrationLaunchSpec,
    ResourceReadResult, ResourcesListResult, ServerInfo, ToolCallResult, ToolsListResult,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Name announced in `clientInfo`.
const CLIENT_NAME: &str = "mcp-host";

/// Redacted stderr kept for startup diagnostics.
const STDERR_TAIL_BYTES: usize = 2000;

/// How long a failed launch waits for the child's last stderr output.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Upper bound on waiting for a killed child to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

// ─── ProcessHandle ───────────────────────────────────────────────────────────

/// How a terminate request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The child exited on its own after stdin was closed.
    Graceful,
    /// The grace period ran out and the child was killed.
    Forced,
    /// The child had already exited.
    AlreadyExited,
}

/// A running, handshake-complete child process.
pub struct ProcessHandle {
    key: IntegrationKey,
    label: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    transport: StdioTransport,
    /// Set once with a description of how the process exited.
    exit_rx: watch::Receiver<Option<String>>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
    server_info: ServerInfo,
    server_capabilities: serde_json::Value,
    request_timeout: Duration,
    redactor: SecretRedactor,
    stderr_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("key", &self.key)
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ProcessHandle {
    /// Spawn the child described by `spec` with environment `env` and
    /// complete the handshake.
    ///
    /// `env` is consumed: the credential it may carry is handed to the OS and
    /// not retained, except as the redaction list for child-supplied text.
    pub async fn launch(
        spec: &IntegrationLaunchSpec,
        env: ProcessEnvironment,
        settings: &RuntimeSettings,
    ) -> Result<Self, RuntimeError> {
        let label = spec.key.to_string();
        let Some((program, args)) = spec.command.split_first() else {
            return Err(RuntimeError::Configuration {
                integration: label,
                reason: "launch command is empty".into(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(env.iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let redactor = env.redactor();
        let mut child = cmd.spawn().map_err(|e| RuntimeError::SpawnFailed {
            integration: label.clone(),
            reason: e.to_string(),
        })?;
        drop(cmd);
        drop(env);

        let pid = child.id();
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.start_kill();
            return Err(RuntimeError::SpawnFailed {
                integration: label,
                reason: "failed to capture stdio".into(),
            });
        };

        let stderr_tail = Arc::new(Mutex::new(String::new()));
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(pump_stderr(
                stderr,
                label.clone(),
                redactor.clone(),
                stderr_tail.clone(),
            ))
        });

        let transport = StdioTransport::new(
            &label,
            stdout,
            stdin,
            spec.framing,
            settings.max_pending_requests,
            redactor.clone(),
        );

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_exit(child, kill_rx, exit_tx, label.clone()));

        tracing::info!(integration = %label, pid, "process spawned; starting handshake");

        let mut handle = Self {
            key: spec.key,
            label,
            pid,
            started_at: Utc::now(),
            transport,
            exit_rx,
            kill_tx: Mutex::new(Some(kill_tx)),
            server_info: ServerInfo::default(),
            server_capabilities: serde_json::Value::Null,
            request_timeout: settings.request_timeout(),
            redactor: redactor.clone(),
            stderr_task,
        };

        match handle.handshake(settings).await {
            Ok(init) => {
                handle.server_info = init.server_info.unwrap_or_default();
                handle.server_capabilities = init.capabilities;
                tracing::info!(
                    integration = %handle.label,
                    pid,
                    server = handle.server_info.name.as_deref().unwrap_or("unknown"),
                    "handshake complete"
                );
                Ok(handle)
            }
            Err(err) => {
                let err = handle.fail_launch(err, &redactor, &stderr_tail).await;
                tracing::warn!(integration = %spec.key, pid, error = %err, "launch failed");
                Err(err)
            }
        }
    }

    async fn handshake(&self, settings: &RuntimeSettings) -> Result<InitializeResult, RuntimeError> {
        let params = serde_json::json!({
            "protocolVersion": settings.protocol_version,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let result = self
            .transport
            .request(methods::INITIALIZE, Some(params), settings.handshake_timeout())
            .await?;
        let init: InitializeResult = serde_json::from_value(result)?;
        self.transport
            .notify(methods::INITIALIZED, None, settings.handshake_timeout())
            .await?;
        Ok(init)
    }

    /// Kill the half-started child and turn the failure into a startup error
    /// carrying the redacted stderr tail.
    async fn fail_launch(
        &mut self,
        err: RuntimeError,
        redactor: &SecretRedactor,
        stderr_tail: &Arc<Mutex<String>>,
    ) -> RuntimeError {
        self.transport.close("handshake failed");
        self.kill();
        let _ = tokio::time::timeout(REAP_TIMEOUT, self.wait_exit()).await;
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await;
        }

        let tail = stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .trim()
            .to_string();
        let suffix = if tail.is_empty() {
            String::new()
        } else {
            format!(" | stderr: {tail}")
        };
        let integration = self.label.clone();

        match err {
            RuntimeError::RequestTimeout { timeout_ms, .. } => RuntimeError::HandshakeTimeout {
                integration,
                timeout_ms,
            },
            RuntimeError::ProcessUnavailable { .. } => {
                let exit = self.exit_description().unwrap_or_else(|| "stdout closed".into());
                RuntimeError::HandshakeFailed {
                    integration,
                    reason: format!("process exited before handshake ({exit}){suffix}"),
                }
            }
            RuntimeError::Server { code, message, .. } => RuntimeError::HandshakeFailed {
                integration,
                reason: redactor
                    .redact(&format!("initialize rejected [{code}]: {message}{suffix}"))
                    .into_owned(),
            },
            other => RuntimeError::HandshakeFailed {
                integration,
                reason: redactor.redact(&format!("{other}{suffix}")).into_owned(),
            },
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────────

    pub fn key(&self) -> IntegrationKey {
        self.key
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }

    pub fn server_capabilities(&self) -> &serde_json::Value {
        &self.server_capabilities
    }

    /// Malformed frames received from this child so far.
    pub fn protocol_error_count(&self) -> u64 {
        self.transport.protocol_error_count()
    }

    /// Whether the handle accepts capability calls.
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none() && self.transport.is_open()
    }

    /// How the process exited, if it has.
    pub fn exit_description(&self) -> Option<String> {
        self.exit_rx.borrow().clone()
    }

    /// Resolve once the process has exited.
    pub async fn wait_exit(&self) -> String {
        let mut rx = self.exit_rx.clone();
        let result = rx.wait_for(Option::is_some).await.map(|v| v.clone());
        match result {
            Ok(Some(desc)) => desc,
            _ => "exit watcher gone".to_string(),
        }
    }

    // ─── Capability Calls ────────────────────────────────────────────────

    fn ensure_running(&self) -> Result<(), RuntimeError> {
        if let Some(exit) = self.exit_description() {
            return Err(RuntimeError::ProcessUnavailable {
                integration: self.label.clone(),
                reason: exit,
            });
        }
        Ok(())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<T, RuntimeError> {
        self.ensure_running()?;
        let value = self
            .transport
            .request(method, params, self.request_timeout)
            .await
            .map_err(|e| self.scrub(e))?;
        serde_json::from_value(value).map_err(|e| RuntimeError::Protocol {
            reason: self
                .redactor
                .redact(&format!("unexpected '{method}' result shape: {e}"))
                .into_owned(),
        })
    }

    /// Strip injected secrets from an error the child authored.
    fn scrub(&self, err: RuntimeError) -> RuntimeError {
        match err {
            RuntimeError::Server {
                code,
                message,
                data,
            } => RuntimeError::Server {
                code,
                message: self.redactor.redact(&message).into_owned(),
                data: data.filter(|d| {
                    matches!(self.redactor.redact(&d.to_string()), Cow::Borrowed(_))
                }),
            },
            other => other,
        }
    }

    /// Enumerate tools and resources.
    ///
    /// A child without resource support (`-32601` on `resources/list`)
    /// reports an empty resource list.
    pub async fn list_capabilities(&self) -> Result<CapabilityList, RuntimeError> {
        let tools: ToolsListResult = self.call(methods::TOOLS_LIST, None).await?;
        let resources = match self
            .call::<ResourcesListResult>(methods::RESOURCES_LIST, None)
            .await
        {
            Ok(list) => list.resources,
            Err(RuntimeError::Server { code, .. }) if code == error_codes::METHOD_NOT_FOUND => {
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        Ok(CapabilityList {
            tools: tools.tools,
            resources,
        })
    }

    /// Call a tool by name.
    pub async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, RuntimeError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        self.call(methods::TOOLS_CALL, Some(params)).await
    }

    /// Read a resource by URI.
    pub async fn read_resource(&self, uri: &str) -> Result<ResourceReadResult, RuntimeError> {
        let params = serde_json::json!({ "uri": uri });
        self.call(methods::RESOURCES_READ, Some(params)).await
    }

    /// Lightweight liveness check: a `tools/list` round trip.
    pub async fn health_check(&self) -> Result<(), RuntimeError> {
        self.call::<serde_json::Value>(methods::TOOLS_LIST, None)
            .await
            .map(|_| ())
    }

    // ─── Teardown ────────────────────────────────────────────────────────

    /// Stop accepting calls; in-flight callers fail with `ProcessUnavailable`.
    pub fn mark_unavailable(&self, reason: &str) -> bool {
        self.transport.close(reason)
    }

    /// Kill the process without a grace period.
    pub fn kill(&self) {
        let tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    /// Close stdin, wait up to `grace` for the child to exit, then kill it.
    pub async fn terminate(&self, grace: Duration) -> TerminationOutcome {
        self.mark_unavailable("terminated");
        if self.exit_description().is_some() {
            return TerminationOutcome::AlreadyExited;
        }

        let stop = async {
            self.transport.close_input().await;
            self.wait_exit().await
        };
        if tokio::time::timeout(grace, stop).await.is_ok() {
            tracing::info!(integration = %self.label, pid = self.pid, "process stopped gracefully");
            return TerminationOutcome::Graceful;
        }

        self.kill();
        let _ = tokio::time::timeout(REAP_TIMEOUT, self.wait_exit()).await;
        tracing::warn!(
            integration = %self.label,
            pid = self.pid,
            grace_ms = grace.as_millis() as u64,
            "process ignored stop signal; killed"
        );
        TerminationOutcome::Forced
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

#[async_trait]
impl Capability for ProcessHandle {
    async fn list_capabilities(&self) -> Result<CapabilityList, RuntimeError> {
        ProcessHandle::list_capabilities(self).await
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, RuntimeError> {
        ProcessHandle::invoke(self, name, arguments).await
    }

    async fn read_resource(&self, uri: &str) -> Result<ResourceReadResult, RuntimeError> {
        ProcessHandle::read_resource(self, uri).await
    }
}

// ─── Background Tasks ────────────────────────────────────────────────────────

/// Own the child until it exits (or is told to die), then publish how it
/// ended. Dropping the kill sender also kills the child.
async fn watch_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<String>>,
    label: String,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            let _ = child.start_kill();
            child.wait().await
        }
    };

    let description = match status {
        Ok(status) => format!("process exited ({status})"),
        Err(e) => format!("failed to wait for process: {e}"),
    };
    tracing::debug!(integration = %label, description = %description, "process exit observed");
    let _ = exit_tx.send(Some(description));
}

/// Forward child stderr to `debug!` with credential values redacted, keeping
/// a bounded tail for startup error messages.
async fn pump_stderr(
    stderr: ChildStderr,
    label: String,
    redactor: SecretRedactor,
    tail: Arc<Mutex<String>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let clean = redactor.redact(&line);
        tracing::debug!(target: "mcp_host::child_stderr", integration = %label, "{clean}");

        let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
        tail.push_str(&clean);
        tail.push('\n');
        if tail.len() > STDERR_TAIL_BYTES {
            let mut cut = tail.len() - STDERR_TAIL_BYTES;
            while !tail.is_char_boundary(cut) {
                cut += 1;
            }
            tail.drain(..cut);
        }
    }
}
