//! `mcp-host` daemon: loads `mcp-host.yaml`, hosts every configured
//! integration, and stops all children on Ctrl-C.

use std::sync::Arc;

use anyhow::Context;
use mcp_host::config::{self, HostConfig};
use mcp_host::runtime::{
    Capability, ControlSurface, HandlerRegistry, IntegrationHandler, StaticCredentialStore,
    Supervisor,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let config_path = config::find_config_path(&cwd)?;
    let host_config = config::load_host_config(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let log_dir = host_config
        .log_dir
        .clone()
        .unwrap_or_else(mcp_host::data_dir);
    let log_path = mcp_host::init_tracing(&log_dir)
        .with_context(|| format!("failed to initialize logging in {}", log_dir.display()))?;
    eprintln!("mcp-host: logging to {}", log_path.display());

    run(host_config).await
}

async fn run(host_config: HostConfig) -> anyhow::Result<()> {
    let credentials = Arc::new(StaticCredentialStore::new());
    let supervisor = Supervisor::new(host_config.runtime_settings(), credentials.clone());
    let registry = HandlerRegistry::new(supervisor.clone());
    let control = ControlSurface::new(supervisor.clone());

    let handlers = config::install(&host_config, &supervisor, &registry, &credentials)
        .await
        .context("failed to install integrations")?;
    tracing::info!(
        integrations = handlers.len(),
        external = handlers.values().filter(|h| h.is_external()).count(),
        "integrations installed"
    );

    if host_config.warm_start {
        let starts = handlers.iter().filter_map(|(key, handler)| match handler {
            IntegrationHandler::External(_) => Some(async move {
                match handler.list_capabilities().await {
                    Ok(caps) => tracing::info!(
                        integration = %key,
                        tools = caps.tools.len(),
                        resources = caps.resources.len(),
                        "warm start complete"
                    ),
                    Err(e) => tracing::warn!(integration = %key, error = %e, "warm start failed"),
                }
            }),
            IntegrationHandler::Native(_) => None,
        });
        futures::future::join_all(starts).await;
    }

    for view in control.list() {
        tracing::info!(
            tenant = %view.tenant_id,
            integration = %view.integration_id,
            status = %view.status,
            pid = view.process_id,
            "process status"
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("shutdown requested");
    supervisor.shutdown().await;
    tracing::info!("=== mcp-host stopped ===");
    Ok(())
}
