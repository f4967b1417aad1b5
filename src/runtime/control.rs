//! Control surface consumed by the admin layer.
//!
//! Shapes supervisor state for the admin API. No lifecycle decisions are
//! made here.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::supervisor::Supervisor;
use super::types::{IntegrationKey, ProcessRecord};

/// Status string reported for keys that never started.
pub const NOT_STARTED: &str = "not_started";

/// Status of one hosted integration as shown to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatusView {
    pub tenant_id: String,
    pub integration_id: String,
    pub process_id: Option<u32>,
    pub status: String,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub restart_count: u32,
    pub runtime: Option<String>,
}

impl ProcessStatusView {
    fn not_started(key: &IntegrationKey) -> Self {
        Self {
            tenant_id: key.tenant_id.to_string(),
            integration_id: key.integration_id.to_string(),
            process_id: None,
            status: NOT_STARTED.to_string(),
            started_at: None,
            last_health_check: None,
            last_error: None,
            restart_count: 0,
            runtime: None,
        }
    }
}

impl From<ProcessRecord> for ProcessStatusView {
    fn from(record: ProcessRecord) -> Self {
        let runtime = serde_json::to_value(record.runtime)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string));
        Self {
            tenant_id: record.tenant_id.to_string(),
            integration_id: record.integration_id.to_string(),
            process_id: record.pid,
            status: record.status.to_string(),
            started_at: record.started_at,
            last_health_check: record.last_health_check,
            last_error: record.last_error,
            restart_count: record.restart_count,
            runtime,
        }
    }
}

/// Acknowledgement for restart / terminate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub success: bool,
    pub message: String,
}

/// Admin-facing adapter over a [`Supervisor`].
#[derive(Debug, Clone)]
pub struct ControlSurface {
    supervisor: Supervisor,
}

impl ControlSurface {
    pub fn new(supervisor: Supervisor) -> Self {
        Self { supervisor }
    }

    pub fn status(&self, key: &IntegrationKey) -> ProcessStatusView {
        match self.supervisor.status(key) {
            Some(record) => record.into(),
            None => ProcessStatusView::not_started(key),
        }
    }

    pub fn list(&self) -> Vec<ProcessStatusView> {
        self.supervisor
            .records()
            .into_iter()
            .map(ProcessStatusView::from)
            .collect()
    }

    pub async fn restart(&self, key: &IntegrationKey) -> Ack {
        match self.supervisor.restart(key).await {
            Ok(handle) => Ack {
                success: true,
                message: match handle.pid() {
                    Some(pid) => format!("restarted {key} (pid {pid})"),
                    None => format!("restarted {key}"),
                },
            },
            Err(e) => Ack {
                success: false,
                message: e.to_string(),
            },
        }
    }

    pub async fn terminate(&self, key: &IntegrationKey) -> Ack {
        self.supervisor.terminate(key).await;
        Ack {
            success: true,
            message: format!("terminated {key}"),
        }
    }
}
