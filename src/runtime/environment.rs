//! Child process environment construction.
//!
//! The environment is assembled in layers, later layers winning:
//! 1. A small allowlist of host variables (`PATH`, `HOME`, locale, temp dirs)
//! 2. The integration's declared template, with `${NAME}` placeholders resolved
//! 3. User configuration, namespaced under `SAGEMCP_CONFIG_`
//! 4. Platform values: identifiers, hosted-mode marker, API base URL, token
//!
//! Nothing here spawns a process or logs a value.

use std::collections::BTreeMap;

use super::credentials::Credential;
use super::errors::RuntimeError;
use super::redact::SecretRedactor;
use super::types::IntegrationLaunchSpec;

// ─── Variable Names ─────────────────────────────────────────────────────────

pub const ENV_TENANT_ID: &str = "TENANT_ID";
pub const ENV_INTEGRATION_ID: &str = "CONNECTOR_ID";
pub const ENV_MODE: &str = "SAGEMCP_MODE";
pub const ENV_API_URL: &str = "SAGEMCP_API_URL";
/// Primary token name.
pub const ENV_OAUTH_TOKEN: &str = "OAUTH_TOKEN";
/// Alternate token name for servers written against the other convention.
pub const ENV_ACCESS_TOKEN: &str = "ACCESS_TOKEN";
/// Prefix for user-supplied configuration keys.
pub const CONFIG_PREFIX: &str = "SAGEMCP_CONFIG_";
/// Value of [`ENV_MODE`] for processes launched by this host.
pub const HOSTED_MODE: &str = "hosted";

/// Host variables a child may inherit. Everything else is withheld.
const PASSTHROUGH_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "LC_ALL",
    "TMPDIR",
    "TEMP",
    "TMP",
    "SYSTEMROOT",
    "USERPROFILE",
];

// ─── ProcessEnvironment ─────────────────────────────────────────────────────

/// The exact environment handed to a new child process.
///
/// `Debug` lists keys only.
#[derive(Clone, Default)]
pub struct ProcessEnvironment {
    vars: BTreeMap<String, String>,
    secret_keys: Vec<String>,
}

impl std::fmt::Debug for ProcessEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessEnvironment")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProcessEnvironment {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// A redactor covering every value derived from the credential.
    pub fn redactor(&self) -> SecretRedactor {
        SecretRedactor::new(
            self.secret_keys
                .iter()
                .filter_map(|k| self.vars.get(k))
                .cloned(),
        )
    }
}

// ─── Validation ─────────────────────────────────────────────────────────────

/// Check a launch spec before it is accepted or used.
pub fn validate_launch_spec(spec: &IntegrationLaunchSpec) -> Result<(), RuntimeError> {
    let program = spec.command.first().map(|s| s.trim()).unwrap_or_default();
    if program.is_empty() {
        return Err(RuntimeError::Configuration {
            integration: spec.key.to_string(),
            reason: "launch command is empty".into(),
        });
    }

    if let Some(dir) = &spec.working_dir {
        if !dir.is_dir() {
            return Err(RuntimeError::Configuration {
                integration: spec.key.to_string(),
                reason: format!("working directory does not exist: {}", dir.display()),
            });
        }
    }

    Ok(())
}

// ─── Building ───────────────────────────────────────────────────────────────

/// Build the environment for a child of `spec`, reading passthrough values
/// from the host process environment.
pub fn build_environment(
    spec: &IntegrationLaunchSpec,
    credential: Option<&Credential>,
    platform_api_url: &str,
) -> Result<ProcessEnvironment, RuntimeError> {
    build_environment_with(spec, credential, platform_api_url, |name| {
        std::env::var(name).ok()
    })
}

/// Same as [`build_environment`] with an explicit host lookup.
pub fn build_environment_with<F>(
    spec: &IntegrationLaunchSpec,
    credential: Option<&Credential>,
    platform_api_url: &str,
    host: F,
) -> Result<ProcessEnvironment, RuntimeError>
where
    F: Fn(&str) -> Option<String>,
{
    validate_launch_spec(spec)?;

    let platform = platform_vars(spec, credential, platform_api_url);
    let mut vars = BTreeMap::new();
    let mut secret_keys: Vec<String> = Vec::new();

    for name in PASSTHROUGH_VARS {
        if let Some(value) = host(name) {
            vars.insert((*name).to_string(), value);
        }
    }

    for (key, template) in &spec.env {
        let (value, used_secret) = interpolate(template, &platform, &host);
        if used_secret {
            secret_keys.push(key.clone());
        }
        vars.insert(key.clone(), value);
    }

    for (key, value) in &spec.config {
        vars.insert(config_var_name(key), config_value(value));
    }

    for (key, value) in platform {
        if key == ENV_OAUTH_TOKEN || key == ENV_ACCESS_TOKEN {
            secret_keys.push(key.to_string());
        }
        vars.insert(key.to_string(), value);
    }

    Ok(ProcessEnvironment { vars, secret_keys })
}

fn platform_vars(
    spec: &IntegrationLaunchSpec,
    credential: Option<&Credential>,
    platform_api_url: &str,
) -> Vec<(&'static str, String)> {
    let mut vars = vec![
        (ENV_TENANT_ID, spec.key.tenant_id.to_string()),
        (ENV_INTEGRATION_ID, spec.key.integration_id.to_string()),
        (ENV_MODE, HOSTED_MODE.to_string()),
        (ENV_API_URL, platform_api_url.to_string()),
    ];
    if let Some(cred) = credential {
        vars.push((ENV_OAUTH_TOKEN, cred.expose().to_string()));
        vars.push((ENV_ACCESS_TOKEN, cred.expose().to_string()));
    }
    vars
}

/// `"api-base.url"` → `"SAGEMCP_CONFIG_API_BASE_URL"`.
pub fn config_var_name(key: &str) -> String {
    let normalized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{CONFIG_PREFIX}{normalized}")
}

fn config_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Replace `${NAME}` and `${NAME:-default}` in a template value.
///
/// Names resolve against platform values first, then the host. Returns the
/// resolved string and whether a credential value was substituted.
fn interpolate<F>(template: &str, platform: &[(&'static str, String)], host: &F) -> (String, bool)
where
    F: Fn(&str) -> Option<String>,
{
    let mut result = String::with_capacity(template.len());
    let mut used_secret = false;
    let mut chars = template.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                expr.push(c);
            }
            let (name, default) = match expr.split_once(":-") {
                Some((name, default)) => (name, Some(default)),
                None => (expr.as_str(), None),
            };
            if name == ENV_OAUTH_TOKEN || name == ENV_ACCESS_TOKEN {
                used_secret = true;
            }
            let resolved = platform
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| v.clone())
                .or_else(|| host(name))
                .or_else(|| default.map(str::to_string))
                .unwrap_or_default();
            result.push_str(&resolved);
        } else {
            result.push(ch);
        }
    }

    (result, used_secret)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::types::IntegrationKey;
    use uuid::Uuid;

    fn spec() -> IntegrationLaunchSpec {
        IntegrationLaunchSpec::new(
            IntegrationKey::new(Uuid::new_v4(), Uuid::new_v4()),
            vec!["python".into(), "server.py".into()],
        )
    }

    fn no_host(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_identifiers_always_set() {
        let spec = spec();
        let env = build_environment_with(&spec, None, "http://api.local", no_host).unwrap();
        assert_eq!(env.get(ENV_TENANT_ID), Some(spec.key.tenant_id.to_string().as_str()));
        assert_eq!(
            env.get(ENV_INTEGRATION_ID),
            Some(spec.key.integration_id.to_string().as_str())
        );
        assert_eq!(env.get(ENV_MODE), Some(HOSTED_MODE));
        assert_eq!(env.get(ENV_API_URL), Some("http://api.local"));
        assert!(!env.contains_key(ENV_OAUTH_TOKEN));
        assert!(!env.contains_key(ENV_ACCESS_TOKEN));
        assert!(env.redactor().is_empty());
    }

    #[test]
    fn test_token_set_under_both_names() {
        let cred = Credential::new("gho_abc123");
        let env = build_environment_with(&spec(), Some(&cred), "http://api.local", no_host).unwrap();
        assert_eq!(env.get(ENV_OAUTH_TOKEN), Some("gho_abc123"));
        assert_eq!(env.get(ENV_ACCESS_TOKEN), Some("gho_abc123"));
        assert_eq!(env.redactor().redact("x gho_abc123 y"), "x [REDACTED] y");
    }

    #[test]
    fn test_user_config_is_namespaced() {
        let mut spec = spec();
        spec.config
            .insert("org-name".into(), serde_json::json!("acme"));
        spec.config.insert("max_items".into(), serde_json::json!(25));
        let env = build_environment_with(&spec, None, "http://api.local", no_host).unwrap();
        assert_eq!(env.get("SAGEMCP_CONFIG_ORG_NAME"), Some("acme"));
        assert_eq!(env.get("SAGEMCP_CONFIG_MAX_ITEMS"), Some("25"));
        assert!(!env.contains_key("org-name"));
    }

    #[test]
    fn test_platform_values_override_template() {
        let mut spec = spec();
        spec.env.insert(ENV_TENANT_ID.into(), "spoofed".into());
        let env = build_environment_with(&spec, None, "http://api.local", no_host).unwrap();
        assert_eq!(env.get(ENV_TENANT_ID), Some(spec.key.tenant_id.to_string().as_str()));
    }

    #[test]
    fn test_template_placeholders() {
        let mut spec = spec();
        spec.env.insert("GITHUB_TOKEN".into(), "${OAUTH_TOKEN}".into());
        spec.env.insert("LOG_LEVEL".into(), "${LOG_LEVEL:-info}".into());
        spec.env.insert("REGION".into(), "${HOST_REGION}".into());
        spec.env.insert("LITERAL".into(), "plain".into());
        let cred = Credential::new("tok-xyz");
        let host = |name: &str| (name == "HOST_REGION").then(|| "eu-west".to_string());
        let env = build_environment_with(&spec, Some(&cred), "http://api.local", host).unwrap();
        assert_eq!(env.get("GITHUB_TOKEN"), Some("tok-xyz"));
        assert_eq!(env.get("LOG_LEVEL"), Some("info"));
        assert_eq!(env.get("REGION"), Some("eu-west"));
        assert_eq!(env.get("LITERAL"), Some("plain"));
    }

    #[test]
    fn test_host_environment_is_allowlisted() {
        let host = |name: &str| match name {
            "PATH" => Some("/usr/bin".to_string()),
            "DATABASE_URL" => Some("postgres://secret".to_string()),
            _ => None,
        };
        let env = build_environment_with(&spec(), None, "http://api.local", host).unwrap();
        assert_eq!(env.get("PATH"), Some("/usr/bin"));
        assert!(!env.contains_key("DATABASE_URL"));
    }

    #[test]
    fn test_empty_command_rejected() {
        let mut spec = spec();
        spec.command = vec![];
        let err = build_environment_with(&spec, None, "http://api.local", no_host).unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration { .. }));

        spec.command = vec!["  ".into()];
        assert!(validate_launch_spec(&spec).is_err());
    }

    #[test]
    fn test_missing_working_dir_rejected() {
        let mut spec = spec();
        spec.working_dir = Some("/definitely/not/a/real/dir/for/tests".into());
        let err = validate_launch_spec(&spec).unwrap_err();
        assert!(err.to_string().contains("working directory does not exist"));

        let dir = tempfile::tempdir().unwrap();
        spec.working_dir = Some(dir.path().to_path_buf());
        assert!(validate_launch_spec(&spec).is_ok());
    }

    #[test]
    fn test_debug_lists_keys_only() {
        let cred = Credential::new("tok-hidden");
        let env = build_environment_with(&spec(), Some(&cred), "http://api.local", no_host).unwrap();
        let debug = format!("{env:?}");
        assert!(debug.contains(ENV_OAUTH_TOKEN));
        assert!(!debug.contains("tok-hidden"));
    }

    #[test]
    fn test_config_var_name() {
        assert_eq!(config_var_name("api.base-url"), "SAGEMCP_CONFIG_API_BASE_URL");
    }
}
