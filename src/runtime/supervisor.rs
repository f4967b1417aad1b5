//! Supervisor — the single owner of hosted process handles.
//!
//! One slot exists per configured (tenant, integration) key that has been
//! started at least once. A slot holds the key's `ProcessRecord` and an async
//! lifecycle lock; every start, restart, recovery, and stop of that key runs
//! under the lock, so at most one process per key is ever alive and a second
//! concurrent `get_or_start` reuses the first one's result.
//!
//! Each live handle has a monitor task that watches for process exit and
//! runs the periodic health check. Monitors are aborted when their handle is
//! terminated or superseded.
//!
//! Recovery (backoff sleeps and respawns) runs under the lifecycle lock, so a
//! stop announces itself through the slot's stop-request count first; any
//! recovery in progress sees it and yields without spawning.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::credentials::CredentialStore;
use super::environment::{build_environment, validate_launch_spec};
use super::errors::RuntimeError;
use super::handle::{ProcessHandle, TerminationOutcome};
use super::policy::RuntimeSettings;
use super::types::{
    CapabilityList, IntegrationKey, IntegrationLaunchSpec, ProcessRecord, ProcessStatus,
    ResourceReadResult, ToolCallResult,
};

// ─── Slot ────────────────────────────────────────────────────────────────────

/// Lifecycle state guarded by the slot's async lock.
#[derive(Default)]
struct Lifecycle {
    handle: Option<Arc<ProcessHandle>>,
    monitor: Option<JoinHandle<()>>,
    /// Failed attempts since the handle last reached RUNNING.
    incident_failures: u32,
}

struct Slot {
    key: IntegrationKey,
    record: RwLock<ProcessRecord>,
    /// The RUNNING handle, readable without waiting on `lifecycle`.
    current: RwLock<Option<Arc<ProcessHandle>>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    /// Stops waiting for `lifecycle`. Recovery gives way while nonzero.
    stop_requests: watch::Sender<u32>,
}

impl Slot {
    fn new(spec: &IntegrationLaunchSpec) -> Self {
        Self {
            key: spec.key,
            record: RwLock::new(ProcessRecord::new(spec)),
            current: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            stop_requests: watch::channel(0).0,
        }
    }

    /// Announce a stop until the returned guard is dropped.
    fn request_stop(&self) -> StopRequest<'_> {
        self.stop_requests.send_modify(|n| *n += 1);
        StopRequest { slot: self }
    }

    fn snapshot(&self) -> ProcessRecord {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn status(&self) -> ProcessStatus {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    fn update<R>(&self, f: impl FnOnce(&mut ProcessRecord) -> R) -> R {
        let mut record = self.record.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut record)
    }

    fn live_handle(&self) -> Option<Arc<ProcessHandle>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|h| h.is_running())
            .cloned()
    }

    fn set_current(&self, handle: Option<Arc<ProcessHandle>>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = handle;
    }
}

struct StopRequest<'a> {
    slot: &'a Slot,
}

impl Drop for StopRequest<'_> {
    fn drop(&mut self) {
        self.slot.stop_requests.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Resolve once a stop has been requested for the slot.
async fn stop_requested(rx: &mut watch::Receiver<u32>) {
    let sender_gone = rx.wait_for(|n| *n > 0).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

struct Inner {
    settings: RuntimeSettings,
    credentials: Arc<dyn CredentialStore>,
    specs: RwLock<HashMap<IntegrationKey, IntegrationLaunchSpec>>,
    slots: Mutex<HashMap<IntegrationKey, Arc<Slot>>>,
    closed: AtomicBool,
}

/// Registry of hosted process handles with start-on-demand, health checks
/// and restart policy. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("configured", &self.configured().len())
            .field("slots", &self.slots().len())
            .finish()
    }
}

impl Supervisor {
    pub fn new(settings: RuntimeSettings, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                credentials,
                specs: RwLock::new(HashMap::new()),
                slots: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.inner.settings
    }

    // ─── Configuration ───────────────────────────────────────────────────

    /// Register or replace the launch spec for `spec.key`.
    ///
    /// Replacing the launch spec of a live handle restarts it with the new one.
    pub async fn configure(&self, spec: IntegrationLaunchSpec) -> Result<(), RuntimeError> {
        validate_launch_spec(&spec)?;
        let key = spec.key;
        let replaced = self
            .inner
            .specs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, spec.clone())
            .is_some_and(|old| old != spec);

        let Some(slot) = self.existing_slot(&key) else {
            tracing::info!(integration = %key, "integration configured");
            return Ok(());
        };
        slot.update(|r| {
            r.runtime = spec.runtime;
            r.resource_limits = spec.resource_limits;
        });

        let live = slot.lifecycle.lock().await.handle.is_some();
        if replaced && live {
            tracing::info!(integration = %key, "launch spec replaced; restarting");
            self.restart(&key).await?;
        }
        Ok(())
    }

    /// Terminate the handle and forget both the launch spec and the record.
    ///
    /// Returns `false` if nothing was known about `key`.
    pub async fn remove(&self, key: &IntegrationKey) -> bool {
        // Without a spec no start can spawn; without the slot no caller can
        // find it again. Anything already running is stopped below.
        let spec = self
            .inner
            .specs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        let slot = self
            .inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        if let Some(slot) = &slot {
            self.stop_slot(slot, "integration removed").await;
        }
        if spec.is_some() || slot.is_some() {
            tracing::info!(integration = %key, "integration removed");
            true
        } else {
            false
        }
    }

    /// Keys with a registered launch spec, sorted.
    pub fn configured(&self) -> Vec<IntegrationKey> {
        let mut keys: Vec<IntegrationKey> = self
            .inner
            .specs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        keys.sort();
        keys
    }

    fn spec(&self, key: &IntegrationKey) -> Result<IntegrationLaunchSpec, RuntimeError> {
        self.inner
            .specs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| RuntimeError::NotConfigured {
                integration: key.to_string(),
            })
    }

    fn existing_slot(&self, key: &IntegrationKey) -> Option<Arc<Slot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn slot(&self, key: &IntegrationKey) -> Result<Arc<Slot>, RuntimeError> {
        let spec = self.spec(key)?;
        let mut slots = self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(slots
            .entry(*key)
            .or_insert_with(|| Arc::new(Slot::new(&spec)))
            .clone())
    }

    fn slots(&self) -> Vec<Arc<Slot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Return a RUNNING handle for `key`, starting one if none exists or
    /// the last one was stopped.
    ///
    /// The very first start runs the restart policy inline and fails with
    /// `StartFailed` when it is exhausted. Once the record is in ERROR every
    /// call fails fast with `MaxRestartsExceeded`.
    pub async fn get_or_start(
        &self,
        key: &IntegrationKey,
    ) -> Result<Arc<ProcessHandle>, RuntimeError> {
        self.ensure_open(key)?;
        let slot = self.slot(key)?;
        if let Some(handle) = slot.live_handle() {
            return Ok(handle);
        }

        let mut life = slot.lifecycle.lock().await;
        self.ensure_open(key)?;
        if let Some(handle) = life.handle.as_ref().filter(|h| h.is_running()) {
            return Ok(handle.clone());
        }

        match slot.status() {
            ProcessStatus::Error => Err(self.exhausted(key)),
            ProcessStatus::Running | ProcessStatus::Restarting if life.handle.is_some() => {
                // The process died and its monitor has not handled it yet.
                let reason = life
                    .handle
                    .as_ref()
                    .and_then(|h| h.exit_description())
                    .unwrap_or_else(|| "transport closed".into());
                if let Some(monitor) = life.monitor.take() {
                    monitor.abort();
                }
                self.recover(&slot, &mut life, format!("unexpected exit: {reason}"))
                    .await
            }
            ProcessStatus::Stopped => {
                slot.update(|r| r.restart_count = 0);
                self.first_start(&slot, &mut life).await
            }
            _ => self.first_start(&slot, &mut life).await,
        }
    }

    /// Operator restart: stop any live handle, reset the restart count and
    /// start fresh. Fails with `NotConfigured` for unknown keys.
    pub async fn restart(&self, key: &IntegrationKey) -> Result<Arc<ProcessHandle>, RuntimeError> {
        self.ensure_open(key)?;
        let slot = self.slot(key)?;
        let stop = slot.request_stop();
        let mut life = slot.lifecycle.lock().await;
        self.stop_locked(&slot, &mut life, "restart requested").await;
        drop(stop);
        slot.update(|r| r.restart_count = 0);
        tracing::info!(integration = %key, "operator restart");
        self.first_start(&slot, &mut life).await
    }

    /// Stop the handle gracefully (kill after the grace period) and mark it
    /// STOPPED. No-op for keys that never started.
    pub async fn terminate(&self, key: &IntegrationKey) {
        let Some(slot) = self.existing_slot(key) else {
            return;
        };
        self.stop_slot(&slot, "terminated").await;
    }

    /// Terminate every handle. Later starts fail with `ProcessUnavailable`.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let slots = self.slots();
        tracing::info!(count = slots.len(), "shutting down hosted processes");
        futures::future::join_all(
            slots
                .iter()
                .map(|slot| self.stop_slot(slot, "host shutting down")),
        )
        .await;
    }

    fn ensure_open(&self, key: &IntegrationKey) -> Result<(), RuntimeError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(RuntimeError::ProcessUnavailable {
                integration: key.to_string(),
                reason: "host is shutting down".into(),
            });
        }
        Ok(())
    }

    fn exhausted(&self, key: &IntegrationKey) -> RuntimeError {
        RuntimeError::MaxRestartsExceeded {
            integration: key.to_string(),
            attempts: self.inner.settings.max_restart_attempts,
        }
    }

    // ─── Observability ───────────────────────────────────────────────────

    /// Snapshot of the record for `key`; `None` if it never started.
    pub fn status(&self, key: &IntegrationKey) -> Option<ProcessRecord> {
        self.existing_slot(key).map(|slot| slot.snapshot())
    }

    /// Snapshots of every record, sorted by key.
    pub fn records(&self) -> Vec<ProcessRecord> {
        let mut records: Vec<ProcessRecord> = self.slots().iter().map(|s| s.snapshot()).collect();
        records.sort_by_key(|r| r.key());
        records
    }

    // ─── Capability Calls ────────────────────────────────────────────────

    /// Run `call` against a RUNNING handle. A call that finds the process
    /// gone is retried once against a freshly started handle.
    async fn with_handle<T, F, Fut>(&self, key: &IntegrationKey, call: F) -> Result<T, RuntimeError>
    where
        F: Fn(Arc<ProcessHandle>) -> Fut,
        Fut: Future<Output = Result<T, RuntimeError>>,
    {
        let handle = self.get_or_start(key).await?;
        match call(handle.clone()).await {
            Err(RuntimeError::ProcessUnavailable { reason, .. }) => {
                tracing::debug!(integration = %key, reason = %reason, "process unavailable; retrying once");
                let handle = self.get_or_start(key).await?;
                call(handle).await
            }
            Err(RuntimeError::Protocol { reason }) => {
                tracing::warn!(
                    integration = %key,
                    protocol_errors = handle.protocol_error_count(),
                    "malformed response from hosted process"
                );
                Err(RuntimeError::Protocol { reason })
            }
            other => other,
        }
    }

    pub async fn list_capabilities(
        &self,
        key: &IntegrationKey,
    ) -> Result<CapabilityList, RuntimeError> {
        self.with_handle(key, |h| async move { h.list_capabilities().await })
            .await
    }

    pub async fn invoke(
        &self,
        key: &IntegrationKey,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, RuntimeError> {
        self.with_handle(key, move |h| {
            let arguments = arguments.clone();
            async move { h.invoke(name, arguments).await }
        })
        .await
    }

    pub async fn read_resource(
        &self,
        key: &IntegrationKey,
        uri: &str,
    ) -> Result<ResourceReadResult, RuntimeError> {
        self.with_handle(key, move |h| async move { h.read_resource(uri).await })
            .await
    }

    // ─── Internals (callers hold the slot's lifecycle lock) ──────────────

    /// Start from nothing; on a startup failure run the restart policy
    /// inline, reporting exhaustion as `StartFailed`.
    async fn first_start(
        &self,
        slot: &Arc<Slot>,
        life: &mut Lifecycle,
    ) -> Result<Arc<ProcessHandle>, RuntimeError> {
        life.incident_failures = 0;
        slot.update(|r| {
            r.status = ProcessStatus::Starting;
            r.pid = None;
        });
        tracing::info!(integration = %slot.key, "starting hosted process");

        let mut stop_rx = slot.stop_requests.subscribe();
        let err = match self.spawn_unless_stopped(slot, life, &mut stop_rx).await {
            Ok(handle) => return Ok(handle),
            Err(e) => e,
        };
        if *stop_rx.borrow() > 0 {
            return Err(err);
        }
        match self.run_policy(slot, life, err).await {
            Err(RuntimeError::MaxRestartsExceeded { .. }) => Err(RuntimeError::StartFailed {
                integration: slot.key.to_string(),
                reason: slot
                    .snapshot()
                    .last_error
                    .unwrap_or_else(|| "startup failed".into()),
            }),
            other => other,
        }
    }

    /// Tear down a failed handle and run the restart policy.
    async fn recover(
        &self,
        slot: &Arc<Slot>,
        life: &mut Lifecycle,
        reason: String,
    ) -> Result<Arc<ProcessHandle>, RuntimeError> {
        slot.set_current(None);
        if let Some(old) = life.handle.take() {
            old.mark_unavailable(&reason);
            old.kill();
        }
        tracing::warn!(integration = %slot.key, reason = %reason, "hosted process failed");
        self.run_policy(
            slot,
            life,
            RuntimeError::ProcessUnavailable {
                integration: slot.key.to_string(),
                reason,
            },
        )
        .await
    }

    /// Count `failure` against the current incident and keep respawning
    /// (with backoff) until a handle reaches RUNNING or the budget is spent.
    async fn run_policy(
        &self,
        slot: &Arc<Slot>,
        life: &mut Lifecycle,
        mut failure: RuntimeError,
    ) -> Result<Arc<ProcessHandle>, RuntimeError> {
        let settings = &self.inner.settings;
        let mut stop_rx = slot.stop_requests.subscribe();
        loop {
            let message = failure.to_string();
            let fatal = !(failure.is_startup_failure()
                || matches!(
                    failure,
                    RuntimeError::ProcessUnavailable { .. } | RuntimeError::Credential { .. }
                ));
            if fatal {
                slot.update(|r| {
                    r.status = ProcessStatus::Error;
                    r.last_error = Some(message.clone());
                    r.pid = None;
                });
                tracing::error!(integration = %slot.key, error = %message, "fatal startup error");
                return Err(failure);
            }

            life.incident_failures += 1;
            let exhausted = life.incident_failures >= settings.max_restart_attempts;
            let restart_count = slot.update(|r| {
                r.restart_count += 1;
                r.last_error = Some(message.clone());
                r.pid = None;
                r.status = if exhausted {
                    ProcessStatus::Error
                } else {
                    ProcessStatus::Restarting
                };
                r.restart_count
            });

            if exhausted {
                tracing::error!(
                    integration = %slot.key,
                    restart_count,
                    attempts = life.incident_failures,
                    error = %message,
                    "restart budget exhausted; manual restart required"
                );
                return Err(self.exhausted(&slot.key));
            }

            let delay = settings
                .restart_backoff
                .delay_for_attempt(life.incident_failures);
            tracing::warn!(
                integration = %slot.key,
                restart_count,
                attempt = life.incident_failures,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "restarting hosted process"
            );
            tokio::select! {
                biased;
                _ = stop_requested(&mut stop_rx) => return Err(self.stopping(&slot.key)),
                _ = tokio::time::sleep(delay) => {}
            }

            match self.spawn_unless_stopped(slot, life, &mut stop_rx).await {
                Ok(handle) => return Ok(handle),
                Err(e) if *stop_rx.borrow() > 0 => return Err(e),
                Err(e) => failure = e,
            }
        }
    }

    /// `spawn`, abandoned (and the half-started child killed) as soon as a
    /// stop is requested.
    async fn spawn_unless_stopped(
        &self,
        slot: &Arc<Slot>,
        life: &mut Lifecycle,
        stop_rx: &mut watch::Receiver<u32>,
    ) -> Result<Arc<ProcessHandle>, RuntimeError> {
        tokio::select! {
            biased;
            _ = stop_requested(stop_rx) => Err(self.stopping(&slot.key)),
            result = self.spawn(slot, life) => result,
        }
    }

    fn stopping(&self, key: &IntegrationKey) -> RuntimeError {
        tracing::info!(integration = %key, "stop requested; abandoning start");
        RuntimeError::ProcessUnavailable {
            integration: key.to_string(),
            reason: "stop requested".into(),
        }
    }

    /// Stop the slot's handle, preempting any recovery that holds the lock.
    async fn stop_slot(&self, slot: &Arc<Slot>, reason: &str) {
        let _stop = slot.request_stop();
        let mut life = slot.lifecycle.lock().await;
        self.stop_locked(slot, &mut life, reason).await;
    }

    /// Launch one process for `slot` and install it as the RUNNING handle.
    async fn spawn(
        &self,
        slot: &Arc<Slot>,
        life: &mut Lifecycle,
    ) -> Result<Arc<ProcessHandle>, RuntimeError> {
        let settings = &self.inner.settings;
        let spec = self.spec(&slot.key)?;
        let credential = self.inner.credentials.access_token(&slot.key).await?;
        let env = build_environment(&spec, credential.as_ref(), &settings.platform_api_url)?;
        drop(credential);

        let handle = Arc::new(ProcessHandle::launch(&spec, env, settings).await?);

        life.incident_failures = 0;
        life.handle = Some(handle.clone());
        life.monitor = Some(tokio::spawn(monitor(
            Arc::downgrade(&self.inner),
            slot.clone(),
            handle.clone(),
        )));
        let restart_count = slot.update(|r| {
            r.status = ProcessStatus::Running;
            r.pid = handle.pid();
            r.started_at = Some(handle.started_at());
            r.restart_count
        });
        slot.set_current(Some(handle.clone()));

        tracing::info!(
            integration = %slot.key,
            pid = handle.pid(),
            restart_count,
            "hosted process running"
        );
        Ok(handle)
    }

    async fn stop_locked(&self, slot: &Arc<Slot>, life: &mut Lifecycle, reason: &str) {
        if let Some(monitor) = life.monitor.take() {
            monitor.abort();
        }
        slot.set_current(None);
        life.incident_failures = 0;

        if let Some(handle) = life.handle.take() {
            let outcome = handle
                .terminate(self.inner.settings.shutdown_grace())
                .await;
            tracing::info!(
                integration = %slot.key,
                pid = handle.pid(),
                reason,
                forced = outcome == TerminationOutcome::Forced,
                "hosted process stopped"
            );
        }
        slot.update(|r| {
            r.status = ProcessStatus::Stopped;
            r.pid = None;
        });
    }

    /// Called by a monitor once its handle has failed.
    async fn handle_failure(&self, slot: &Arc<Slot>, failed: &Arc<ProcessHandle>, reason: String) {
        let mut life = slot.lifecycle.lock().await;
        let current = life
            .handle
            .as_ref()
            .is_some_and(|h| Arc::ptr_eq(h, failed));
        if !current {
            return;
        }
        // The calling task is the monitor itself; release it without abort.
        life.monitor.take();
        let _ = self.recover(slot, &mut life, reason).await;
    }
}

// ─── Monitor ─────────────────────────────────────────────────────────────────

/// Watch one handle: exit, or `health_failure_threshold` consecutive failed
/// health checks, hands it to the restart path.
fn monitor(inner: Weak<Inner>, slot: Arc<Slot>, handle: Arc<ProcessHandle>) -> BoxFuture<'static, ()> {
    Box::pin(run_monitor(inner, slot, handle))
}

async fn run_monitor(inner: Weak<Inner>, slot: Arc<Slot>, handle: Arc<ProcessHandle>) {
    let (interval, threshold) = match inner.upgrade() {
        Some(inner) => (
            inner.settings.health_check_interval(),
            inner.settings.health_failure_threshold.max(1),
        ),
        None => return,
    };

    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut consecutive = 0u32;

    let reason = loop {
        tokio::select! {
            exit = handle.wait_exit() => break format!("unexpected exit: {exit}"),
            _ = ticker.tick() => {
                let result = handle.health_check().await;
                let checked_at = Utc::now();
                match result {
                    Ok(()) => {
                        consecutive = 0;
                        slot.update(|r| r.last_health_check = Some(checked_at));
                        tracing::debug!(integration = %slot.key, "health check ok");
                    }
                    Err(e) => {
                        consecutive += 1;
                        let message = e.to_string();
                        slot.update(|r| {
                            r.last_health_check = Some(checked_at);
                            r.last_error = Some(format!("health check failed: {message}"));
                        });
                        tracing::warn!(
                            integration = %slot.key,
                            consecutive,
                            error = %message,
                            "health check failed"
                        );
                        if consecutive >= threshold {
                            break format!("{consecutive} consecutive health checks failed: {message}");
                        }
                    }
                }
            }
        }
    };

    let Some(inner) = inner.upgrade() else {
        return;
    };
    Supervisor { inner }
        .handle_failure(&slot, &handle, reason)
        .await;
}
