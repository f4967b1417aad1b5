//! Multiplexed JSON-RPC transport over a child process's stdio.
//!
//! Handles:
//! - Writing framed requests to the child's stdin (writes are serialized)
//! - A background reader that matches responses to waiting callers by `id`
//! - Per-request timeouts, covering both the write and the wait, that
//!   abandon only the timed-out call
//! - Failing every waiter at once when the child's stdout closes
//!
//! Responses may arrive in any order; correlation is strictly by `id`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::codec::Framing;
use super::errors::RuntimeError;
use super::redact::SecretRedactor;
use super::types::{
    error_codes, methods, parse_request_id, JsonRpcError, JsonRpcNotification, JsonRpcRequest,
};

type Reply = Result<serde_json::Value, RuntimeError>;

/// Upper bound on writing a reply to a request the child sent us.
const SERVER_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<tokio::sync::Mutex<Option<BoxedWriter>>>;

// ─── Pending Table ───────────────────────────────────────────────────────────

/// Callers waiting for a response, keyed by request id.
///
/// Once closed, no new caller can register; closing and registering share
/// one lock so a call either fails fast or is failed by the close.
struct PendingTable {
    open: bool,
    closed_reason: String,
    waiters: HashMap<u64, oneshot::Sender<Reply>>,
}

type SharedPending = Arc<Mutex<PendingTable>>;

fn lock(pending: &SharedPending) -> MutexGuard<'_, PendingTable> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes a waiter when the call finishes, times out, or is dropped.
struct PendingGuard<'a> {
    pending: &'a SharedPending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).waiters.remove(&self.id);
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    label: String,
    framing: Framing,
    writer: SharedWriter,
    pending: SharedPending,
    next_id: AtomicU64,
    max_pending: usize,
    protocol_errors: Arc<AtomicU64>,
    reader_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Create a transport and start its reader task.
    ///
    /// `label` identifies the integration in logs and errors; it must not
    /// contain secrets. `redactor` scrubs child output before it is logged.
    pub fn new<R, W>(
        label: &str,
        reader: R,
        writer: W,
        framing: Framing,
        max_pending: usize,
        redactor: SecretRedactor,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(Some(Box::new(writer))));
        let pending: SharedPending = Arc::new(Mutex::new(PendingTable {
            open: true,
            closed_reason: String::new(),
            waiters: HashMap::new(),
        }));
        let protocol_errors = Arc::new(AtomicU64::new(0));

        let reader_task = tokio::spawn(read_loop(
            label.to_string(),
            framing,
            BufReader::new(reader),
            pending.clone(),
            writer.clone(),
            protocol_errors.clone(),
            redactor,
        ));

        Self {
            label: label.to_string(),
            framing,
            writer,
            pending,
            next_id: AtomicU64::new(1),
            max_pending,
            protocol_errors,
            reader_task,
        }
    }

    /// Send a request and wait for the response with the same `id`.
    ///
    /// `timeout` bounds the write as well as the wait, so a child that
    /// stops reading stdin cannot block the caller. On timeout only this
    /// call is abandoned; its waiter is purged and a late response for it is
    /// discarded by the reader.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, RuntimeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut table = lock(&self.pending);
            if !table.open {
                return Err(self.unavailable(table.closed_reason.clone()));
            }
            if table.waiters.len() >= self.max_pending {
                return Err(self.unavailable(format!(
                    "too many in-flight requests ({})",
                    self.max_pending
                )));
            }
            table.waiters.insert(id, tx);
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let payload = serde_json::to_vec(&JsonRpcRequest::new(id, method, params))?;
        let exchange = async {
            self.write_frame(&payload).await?;
            tracing::trace!(integration = %self.label, method, id, "request sent");
            match rx.await {
                Ok(reply) => reply,
                Err(_) => Err(self.unavailable("transport closed".into())),
            }
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(reply) => reply,
            Err(_) => {
                tracing::debug!(
                    integration = %self.label,
                    method,
                    id,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out; abandoning"
                );
                Err(RuntimeError::RequestTimeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification (no response expected), giving up after
    /// `timeout` if the child is not reading.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<(), RuntimeError> {
        if !self.is_open() {
            return Err(self.unavailable(lock(&self.pending).closed_reason.clone()));
        }
        let payload = serde_json::to_vec(&JsonRpcNotification::new(method, params))?;
        match tokio::time::timeout(timeout, self.write_frame(&payload)).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::RequestTimeout {
                method: method.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Stop accepting calls and fail every waiter with `ProcessUnavailable`.
    ///
    /// Returns `false` if the transport was already closed.
    pub fn close(&self, reason: &str) -> bool {
        fail_all(&self.pending, &self.label, reason)
    }

    /// Close the child's stdin. For stdio servers this is the stop signal.
    pub async fn close_input(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            let _ = w.shutdown().await;
        }
    }

    /// Whether new calls are accepted.
    pub fn is_open(&self) -> bool {
        lock(&self.pending).open
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).waiters.len()
    }

    /// Malformed frames received so far.
    pub fn protocol_error_count(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    async fn write_frame(&self, payload: &[u8]) -> Result<(), RuntimeError> {
        let frame = self.framing.encode(payload);
        write_raw(&self.writer, &frame)
            .await
            .map_err(|reason| self.unavailable(reason))
    }

    fn unavailable(&self, reason: String) -> RuntimeError {
        RuntimeError::ProcessUnavailable {
            integration: self.label.clone(),
            reason,
        }
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
        fail_all(&self.pending, &self.label, "transport dropped");
    }
}

/// The writer is taken out for the duration of the write: if the future is
/// dropped mid-frame, stdin goes with it rather than carrying a torn frame.
async fn write_raw(writer: &SharedWriter, frame: &[u8]) -> Result<(), String> {
    let mut guard = writer.lock().await;
    let Some(mut w) = guard.take() else {
        return Err("stdin closed".into());
    };
    w.write_all(frame)
        .await
        .map_err(|e| format!("failed to write to stdin: {e}"))?;
    w.flush()
        .await
        .map_err(|e| format!("failed to flush stdin: {e}"))?;
    *guard = Some(w);
    Ok(())
}

fn fail_all(pending: &SharedPending, label: &str, reason: &str) -> bool {
    let drained: Vec<_> = {
        let mut table = lock(pending);
        if !table.open {
            return false;
        }
        table.open = false;
        table.closed_reason = reason.to_string();
        table.waiters.drain().collect()
    };

    if !drained.is_empty() {
        tracing::warn!(
            integration = label,
            count = drained.len(),
            reason,
            "failing in-flight requests"
        );
    }
    for (_, tx) in drained {
        let _ = tx.send(Err(RuntimeError::ProcessUnavailable {
            integration: label.to_string(),
            reason: reason.to_string(),
        }));
    }
    true
}

// ─── Reader ──────────────────────────────────────────────────────────────────

async fn read_loop<R>(
    label: String,
    framing: Framing,
    mut reader: BufReader<R>,
    pending: SharedPending,
    writer: SharedWriter,
    protocol_errors: Arc<AtomicU64>,
    redactor: SecretRedactor,
) where
    R: AsyncRead + Unpin,
{
    let ctx = ReaderContext {
        label,
        framing,
        pending,
        writer,
        protocol_errors,
        redactor,
    };
    let reason = loop {
        match ctx.framing.read_frame(&mut reader).await {
            Ok(Some(frame)) => ctx.dispatch_frame(&frame),
            Ok(None) => break "process closed stdout".to_string(),
            Err(e) => break format!("failed to read from stdout: {e}"),
        }
    };
    tracing::debug!(integration = %ctx.label, reason = %reason, "reader finished");
    fail_all(&ctx.pending, &ctx.label, &reason);
}

/// State the reader task needs to route frames.
struct ReaderContext {
    label: String,
    framing: Framing,
    pending: SharedPending,
    writer: SharedWriter,
    protocol_errors: Arc<AtomicU64>,
    redactor: SecretRedactor,
}

impl ReaderContext {
    /// Route one frame. Never awaits, so a child that stops reading its
    /// stdin cannot stall delivery of responses.
    fn dispatch_frame(&self, frame: &[u8]) {
        let label = self.label.as_str();
        let message = match serde_json::from_slice::<serde_json::Value>(frame) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => {
                self.malformed_frame(frame);
                return;
            }
        };

        if let Some(method) = message.get("method").and_then(|m| m.as_str()) {
            match message.get("id") {
                Some(id) if !id.is_null() => {
                    tokio::spawn(answer_server_request(
                        self.label.clone(),
                        self.framing,
                        self.writer.clone(),
                        id.clone(),
                        method.to_string(),
                    ));
                }
                _ => tracing::debug!(integration = label, method, "notification from child ignored"),
            }
            return;
        }

        let Some(id) = message.get("id").and_then(parse_request_id) else {
            self.malformed_frame(frame);
            return;
        };

        let Some(tx) = lock(&self.pending).waiters.remove(&id) else {
            tracing::warn!(integration = label, id, "response for unknown request id; discarding");
            return;
        };

        let reply = match message.get("error").filter(|e| !e.is_null()) {
            Some(error) => match serde_json::from_value::<JsonRpcError>(error.clone()) {
                Ok(err) => Err(RuntimeError::Server {
                    code: err.code,
                    message: err.message,
                    data: err.data,
                }),
                Err(_) => Err(self.protocol_error(frame, "malformed error object")),
            },
            None => match message.get("result") {
                Some(result) => Ok(result.clone()),
                None => Err(self.protocol_error(frame, "response carries neither result nor error")),
            },
        };

        if tx.send(reply).is_err() {
            tracing::debug!(integration = label, id, "caller gone before response arrived");
        }
    }

    /// A frame that is not a JSON object with a usable `id`.
    ///
    /// It cannot be correlated, so it fails the sole in-flight call if there
    /// is exactly one; otherwise it is only logged.
    fn malformed_frame(&self, frame: &[u8]) {
        let err = self.protocol_error(frame, "unparsable frame");
        let sole = {
            let mut table = lock(&self.pending);
            if table.waiters.len() == 1 {
                let id = table.waiters.keys().next().copied();
                id.and_then(|id| table.waiters.remove(&id))
            } else {
                None
            }
        };
        if let Some(tx) = sole {
            let _ = tx.send(Err(err));
        }
    }

    fn protocol_error(&self, frame: &[u8], what: &str) -> RuntimeError {
        let count = self.protocol_errors.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(
            integration = %self.label,
            frame = %self.redactor.preview(frame),
            protocol_errors = count,
            "{what} from child"
        );
        RuntimeError::Protocol {
            reason: format!("{what} from child ({} bytes)", frame.len()),
        }
    }
}

async fn answer_server_request(
    label: String,
    framing: Framing,
    writer: SharedWriter,
    id: serde_json::Value,
    method: String,
) {
    let response = if method == methods::PING {
        serde_json::json!({"jsonrpc": "2.0", "id": id, "result": {}})
    } else {
        tracing::debug!(integration = %label, method = %method, "unsupported request from child");
        serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": error_codes::METHOD_NOT_FOUND,
                "message": format!("method not supported by host: {method}"),
            },
        })
    };

    let Ok(payload) = serde_json::to_vec(&response) else {
        return;
    };
    let encoded = framing.encode(&payload);
    let write = write_raw(&writer, &encoded);
    match tokio::time::timeout(SERVER_REPLY_TIMEOUT, write).await {
        Ok(Ok(())) => {}
        Ok(Err(reason)) => {
            tracing::debug!(integration = %label, reason = %reason, "failed to answer child request")
        }
        Err(_) => tracing::debug!(integration = %label, "child stopped reading; reply dropped"),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
