//! Shared fixtures for the process-level tests.

#![allow(dead_code)]

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcp_host::runtime::{
    BackoffConfig, IntegrationKey, IntegrationLaunchSpec, ProcessRecord, ProcessStatus,
    RuntimeSettings, StaticCredentialStore, Supervisor,
};
use uuid::Uuid;

pub const ECHO_SERVER: &str = env!("CARGO_BIN_EXE_echo-server");

/// Short timeouts so failure paths finish quickly. Health checks are
/// effectively off unless a test turns them on.
pub fn fast_settings() -> RuntimeSettings {
    RuntimeSettings {
        handshake_timeout_ms: 2_000,
        request_timeout_ms: 500,
        health_check_interval_ms: 60_000,
        restart_backoff: BackoffConfig::Fixed { delay_ms: 50 },
        shutdown_grace_ms: 1_000,
        ..RuntimeSettings::default()
    }
}

pub fn new_key() -> IntegrationKey {
    IntegrationKey::new(Uuid::new_v4(), Uuid::new_v4())
}

/// Launch spec running `echo-server` with extra arguments.
pub fn echo_spec(key: IntegrationKey, args: &[&str]) -> IntegrationLaunchSpec {
    let mut command = vec![ECHO_SERVER.to_string()];
    command.extend(args.iter().map(|a| a.to_string()));
    IntegrationLaunchSpec::new(key, command)
}

pub struct Host {
    pub supervisor: Supervisor,
    pub credentials: Arc<StaticCredentialStore>,
}

pub fn host(settings: RuntimeSettings) -> Host {
    let credentials = Arc::new(StaticCredentialStore::new());
    let supervisor = Supervisor::new(settings, credentials.clone());
    Host {
        supervisor,
        credentials,
    }
}

/// Launch count recorded by `echo-server --counter-file`.
pub fn launches(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

/// Poll the record for `key` until `pred` holds or `timeout` passes.
pub async fn wait_for_record<F>(
    supervisor: &Supervisor,
    key: &IntegrationKey,
    timeout: Duration,
    pred: F,
) -> ProcessRecord
where
    F: Fn(&ProcessRecord) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(record) = supervisor.status(key) {
            if pred(&record) {
                return record;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("condition not reached in {timeout:?}; last record: {record:?}");
            }
        } else if tokio::time::Instant::now() >= deadline {
            panic!("no record for {key} after {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn is_running(record: &ProcessRecord) -> bool {
    record.status == ProcessStatus::Running
}

// ─── Log capture ─────────────────────────────────────────────────────────────

/// `MakeWriter` collecting every formatted log line in memory.
#[derive(Clone, Default)]
pub struct LogBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl LogBuffer {
    pub fn contents(&self) -> String {
        let bytes = self.bytes.lock().unwrap();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.bytes.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Capture all `mcp_host` output at TRACE on the current thread.
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(buffer.clone())
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .finish();
    let guard = tracing::subscriber::set_default(subscriber);
    (buffer, guard)
}
