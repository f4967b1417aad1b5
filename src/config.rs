//! Host configuration file.
//!
//! `mcp-host.yaml` lists the runtime settings and every integration to host.
//! String values may reference the host environment as `${VAR}` or
//! `${VAR:-default}`; these are resolved once, before parsing. A launch
//! template that must reach the child unresolved (for example the injected
//! token) is written with a doubled dollar: `$${OAUTH_TOKEN}`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::runtime::{
    Credential, Framing, HandlerRegistry, IntegrationHandler, IntegrationKey,
    IntegrationLaunchSpec, ResourceLimits, RuntimeError, RuntimeKind, RuntimeSettings,
    StaticCredentialStore, Supervisor,
};

/// File name looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "mcp-host.yaml";

/// Environment variable naming an explicit config path.
pub const CONFIG_PATH_ENV: &str = "MCP_HOST_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not find mcp-host.yaml (set MCP_HOST_CONFIG to override)")]
    NotFound,

    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Schema ──────────────────────────────────────────────────────────────────

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostConfig {
    /// Overrides `runtime.platform_api_url` when set.
    #[serde(default)]
    pub platform_api_url: Option<String>,
    /// Directory for `host.log`. Defaults to the platform data directory.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub integrations: Vec<IntegrationEntry>,
    /// Start every external integration at boot instead of on first use.
    #[serde(default)]
    pub warm_start: bool,
}

/// One configured integration.
#[derive(Debug, Clone, Deserialize)]
pub struct IntegrationEntry {
    pub tenant_id: Uuid,
    pub integration_id: Uuid,
    /// `external_python`, `external_nodejs`, `external_go`, `external_custom`,
    /// or the name of an in-process handler.
    #[serde(default = "default_integration_type")]
    pub integration_type: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub config: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub framing: Framing,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    /// Host environment variable holding this integration's access token.
    #[serde(default)]
    pub credential_env: Option<String>,
}

fn default_integration_type() -> String {
    "external_custom".into()
}

impl IntegrationEntry {
    pub fn key(&self) -> IntegrationKey {
        IntegrationKey::new(self.tenant_id, self.integration_id)
    }

    /// Launch spec for external integrations; `None` for in-process ones.
    pub fn launch_spec(&self) -> Option<IntegrationLaunchSpec> {
        let runtime = RuntimeKind::from_integration_type(&self.integration_type)?;
        Some(IntegrationLaunchSpec {
            key: self.key(),
            runtime,
            command: self.command.clone(),
            env: self.env.clone(),
            config: self.config.clone(),
            working_dir: self.working_dir.clone(),
            framing: self.framing,
            resource_limits: self.resource_limits,
        })
    }

    /// Read the token named by `credential_env` from the host environment.
    pub fn credential(&self) -> Option<Credential> {
        let name = self.credential_env.as_deref()?;
        std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .map(Credential::new)
    }
}

impl HostConfig {
    /// Runtime settings with the top-level overrides applied.
    pub fn runtime_settings(&self) -> RuntimeSettings {
        let mut settings = self.runtime.clone();
        if let Some(url) = &self.platform_api_url {
            settings.platform_api_url = url.clone();
        }
        settings
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for entry in &self.integrations {
            if !seen.insert(entry.key()) {
                return Err(ConfigError::Invalid {
                    reason: format!("integration {} is listed twice", entry.key()),
                });
            }
        }
        if self.runtime.max_restart_attempts == 0 {
            return Err(ConfigError::Invalid {
                reason: "runtime.max_restart_attempts must be at least 1".into(),
            });
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file: `$MCP_HOST_CONFIG`, then `./mcp-host.yaml`.
pub fn find_config_path(start: &Path) -> Result<PathBuf, ConfigError> {
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let candidate = start.join(DEFAULT_CONFIG_FILE);
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(ConfigError::NotFound)
}

/// Load, interpolate, parse and validate a config file.
pub fn load_host_config(path: &Path) -> Result<HostConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    parse_host_config(&raw)
}

pub fn parse_host_config(raw: &str) -> Result<HostConfig, ConfigError> {
    let interpolated = interpolate_env_vars(raw);
    let config: HostConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
    config.validate()?;
    Ok(config)
}

/// Register every integration with the supervisor and resolve its handler.
///
/// Tokens named by `credential_env` go into `credentials`; they never become
/// part of a launch spec.
pub async fn install(
    config: &HostConfig,
    supervisor: &Supervisor,
    registry: &HandlerRegistry,
    credentials: &StaticCredentialStore,
) -> Result<BTreeMap<IntegrationKey, IntegrationHandler>, RuntimeError> {
    let mut handlers = BTreeMap::new();
    for entry in &config.integrations {
        let key = entry.key();
        let handler = registry.resolve(&entry.integration_type, key)?;

        if let Some(spec) = entry.launch_spec() {
            supervisor.configure(spec).await?;
            match entry.credential() {
                Some(credential) => credentials.insert(key, credential),
                None => {
                    if let Some(name) = &entry.credential_env {
                        tracing::warn!(integration = %key, var = %name, "credential variable is unset");
                    }
                }
            }
        }

        tracing::info!(
            integration = %key,
            integration_type = %entry.integration_type,
            external = handler.is_external(),
            "integration installed"
        );
        handlers.insert(key, handler);
    }
    Ok(handlers)
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string. `$${` is kept as a
/// literal `${`.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
                result.push('$');
            }
            Some('{') => {
                chars.next(); // consume '{'
                let mut var_expr = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    var_expr.push(c);
                }
                result.push_str(&resolve_var_expr(&var_expr));
            }
            _ => result.push(ch),
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{BackoffConfig, CredentialStore};
    use std::sync::Arc;

    const TENANT: &str = "7f1c2a52-3a38-4a86-9a3e-0a7b8a9d1c01";
    const INTEGRATION: &str = "0c5d7e1e-52e4-4b5f-8f5e-6e2a1b3c4d05";

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__MCP_HOST_TEST_MISSING__");
        let result = interpolate_env_vars("${__MCP_HOST_TEST_MISSING__:-/fallback/path}");
        assert_eq!(result, "/fallback/path");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__MCP_HOST_TEST_VAR__", "/custom/path");
        let result = interpolate_env_vars("${__MCP_HOST_TEST_VAR__:-/fallback/path}");
        assert_eq!(result, "/custom/path");
        std::env::remove_var("__MCP_HOST_TEST_VAR__");
    }

    #[test]
    fn test_double_dollar_is_literal() {
        assert_eq!(interpolate_env_vars("$${OAUTH_TOKEN}"), "${OAUTH_TOKEN}");
        assert_eq!(interpolate_env_vars("cost: 5$"), "cost: 5$");
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/logs");
        assert!(!result.starts_with('~'), "tilde should be expanded");
        assert!(result.ends_with("/logs"));
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = format!(
            r#"
platform_api_url: https://platform.example
warm_start: true
runtime:
  request_timeout_ms: 1500
  restart_backoff:
    type: fixed
    delay_ms: 100
integrations:
  - tenant_id: {TENANT}
    integration_id: {INTEGRATION}
    integration_type: external_python
    command: ["python", "server.py"]
    framing: content_length
    env:
      GITHUB_TOKEN: "$${{OAUTH_TOKEN}}"
    config:
      org: acme
      page_size: 50
    resource_limits:
      memory_mb: 256
    credential_env: __MCP_HOST_TEST_TOKEN__
"#
        );
        let config = parse_host_config(&yaml).unwrap();
        assert!(config.warm_start);

        let settings = config.runtime_settings();
        assert_eq!(settings.platform_api_url, "https://platform.example");
        assert_eq!(settings.request_timeout_ms, 1500);
        assert_eq!(settings.restart_backoff, BackoffConfig::Fixed { delay_ms: 100 });

        let entry = &config.integrations[0];
        let spec = entry.launch_spec().unwrap();
        assert_eq!(spec.runtime, RuntimeKind::ExternalPython);
        assert_eq!(spec.framing, Framing::ContentLength);
        assert_eq!(spec.env["GITHUB_TOKEN"], "${OAUTH_TOKEN}");
        assert_eq!(spec.config["page_size"], serde_json::json!(50));
        assert_eq!(spec.resource_limits.memory_mb, Some(256));
    }

    #[test]
    fn test_duplicate_integration_rejected() {
        let yaml = format!(
            r#"
integrations:
  - {{ tenant_id: {TENANT}, integration_id: {INTEGRATION}, command: [a] }}
  - {{ tenant_id: {TENANT}, integration_id: {INTEGRATION}, command: [b] }}
"#
        );
        let err = parse_host_config(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_native_entry_has_no_launch_spec() {
        let yaml = format!(
            r#"
integrations:
  - {{ tenant_id: {TENANT}, integration_id: {INTEGRATION}, integration_type: github }}
"#
        );
        let config = parse_host_config(&yaml).unwrap();
        assert!(config.integrations[0].launch_spec().is_none());
    }

    #[tokio::test]
    async fn test_install_moves_token_into_store() {
        std::env::set_var("__MCP_HOST_INSTALL_TOKEN__", "tok-install");
        let yaml = format!(
            r#"
integrations:
  - tenant_id: {TENANT}
    integration_id: {INTEGRATION}
    command: ["server"]
    credential_env: __MCP_HOST_INSTALL_TOKEN__
"#
        );
        let config = parse_host_config(&yaml).unwrap();
        let store = Arc::new(StaticCredentialStore::new());
        let supervisor = Supervisor::new(config.runtime_settings(), store.clone());
        let registry = HandlerRegistry::new(supervisor.clone());

        let handlers = install(&config, &supervisor, &registry, &store)
            .await
            .unwrap();
        std::env::remove_var("__MCP_HOST_INSTALL_TOKEN__");

        let key = config.integrations[0].key();
        assert!(handlers[&key].is_external());
        assert_eq!(supervisor.configured(), vec![key]);
        let token = store.access_token(&key).await.unwrap().unwrap();
        assert_eq!(token.expose(), "tok-install");
    }

    #[tokio::test]
    async fn test_install_rejects_unknown_type() {
        let yaml = format!(
            r#"
integrations:
  - {{ tenant_id: {TENANT}, integration_id: {INTEGRATION}, integration_type: jira }}
"#
        );
        let config = parse_host_config(&yaml).unwrap();
        let store = Arc::new(StaticCredentialStore::new());
        let supervisor = Supervisor::new(config.runtime_settings(), store.clone());
        let registry = HandlerRegistry::new(supervisor.clone());
        let err = install(&config, &supervisor, &registry, &store)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration { .. }));
    }
}
