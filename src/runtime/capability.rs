//! Unified capability interface.
//!
//! The dispatch layer talks to every integration through [`Capability`],
//! whether the integration runs in-process or as a hosted child. Which of the
//! two backs an integration is decided once, when its configuration is
//! loaded, by [`HandlerRegistry::resolve`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::errors::RuntimeError;
use super::supervisor::Supervisor;
use super::types::{
    CapabilityList, IntegrationKey, ResourceReadResult, RuntimeKind, ToolCallResult,
};

/// List tools/resources, call a tool, read a resource.
#[async_trait]
pub trait Capability: Send + Sync {
    async fn list_capabilities(&self) -> Result<CapabilityList, RuntimeError>;

    async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, RuntimeError>;

    async fn read_resource(&self, uri: &str) -> Result<ResourceReadResult, RuntimeError>;
}

// ─── ExternalHandler ─────────────────────────────────────────────────────────

/// Capability backed by a supervised child process.
///
/// Starts the process on demand. A call that finds the process gone is
/// retried once against a freshly started handle.
#[derive(Clone)]
pub struct ExternalHandler {
    supervisor: Supervisor,
    key: IntegrationKey,
}

impl ExternalHandler {
    pub fn new(supervisor: Supervisor, key: IntegrationKey) -> Self {
        Self { supervisor, key }
    }

    pub fn key(&self) -> IntegrationKey {
        self.key
    }
}

#[async_trait]
impl Capability for ExternalHandler {
    async fn list_capabilities(&self) -> Result<CapabilityList, RuntimeError> {
        self.supervisor.list_capabilities(&self.key).await
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, RuntimeError> {
        self.supervisor.invoke(&self.key, name, arguments).await
    }

    async fn read_resource(&self, uri: &str) -> Result<ResourceReadResult, RuntimeError> {
        self.supervisor.read_resource(&self.key, uri).await
    }
}

// ─── IntegrationHandler ──────────────────────────────────────────────────────

/// The handler chosen for one integration.
#[derive(Clone)]
pub enum IntegrationHandler {
    /// Implemented inside this process.
    Native(Arc<dyn Capability>),
    /// Hosted as a supervised child process.
    External(ExternalHandler),
}

impl IntegrationHandler {
    pub fn is_external(&self) -> bool {
        matches!(self, IntegrationHandler::External(_))
    }
}

impl std::fmt::Debug for IntegrationHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrationHandler::Native(_) => f.write_str("IntegrationHandler::Native"),
            IntegrationHandler::External(h) => {
                write!(f, "IntegrationHandler::External({})", h.key)
            }
        }
    }
}

#[async_trait]
impl Capability for IntegrationHandler {
    async fn list_capabilities(&self) -> Result<CapabilityList, RuntimeError> {
        match self {
            IntegrationHandler::Native(h) => h.list_capabilities().await,
            IntegrationHandler::External(h) => h.list_capabilities().await,
        }
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolCallResult, RuntimeError> {
        match self {
            IntegrationHandler::Native(h) => h.invoke(name, arguments).await,
            IntegrationHandler::External(h) => h.invoke(name, arguments).await,
        }
    }

    async fn read_resource(&self, uri: &str) -> Result<ResourceReadResult, RuntimeError> {
        match self {
            IntegrationHandler::Native(h) => h.read_resource(uri).await,
            IntegrationHandler::External(h) => h.read_resource(uri).await,
        }
    }
}

// ─── HandlerRegistry ─────────────────────────────────────────────────────────

/// Builds an in-process handler for one integration.
pub type NativeFactory = Arc<dyn Fn(IntegrationKey) -> Arc<dyn Capability> + Send + Sync>;

/// Map from integration type to the way its handler is built.
///
/// Filled explicitly at startup; `external_*` types always resolve to a
/// supervisor-backed handler.
#[derive(Clone)]
pub struct HandlerRegistry {
    supervisor: Supervisor,
    native: HashMap<String, NativeFactory>,
}

impl HandlerRegistry {
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            supervisor,
            native: HashMap::new(),
        }
    }

    /// Register an in-process handler factory for `integration_type`.
    pub fn register_native<F>(&mut self, integration_type: &str, factory: F)
    where
        F: Fn(IntegrationKey) -> Arc<dyn Capability> + Send + Sync + 'static,
    {
        self.native
            .insert(integration_type.to_string(), Arc::new(factory));
    }

    /// Registered in-process integration types, sorted.
    pub fn native_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.native.keys().cloned().collect();
        types.sort();
        types
    }

    /// Choose the handler for one integration.
    pub fn resolve(
        &self,
        integration_type: &str,
        key: IntegrationKey,
    ) -> Result<IntegrationHandler, RuntimeError> {
        if RuntimeKind::from_integration_type(integration_type).is_some() {
            return Ok(IntegrationHandler::External(ExternalHandler::new(
                self.supervisor.clone(),
                key,
            )));
        }
        match self.native.get(integration_type) {
            Some(factory) => Ok(IntegrationHandler::Native(factory(key))),
            None => Err(RuntimeError::Configuration {
                integration: key.to_string(),
                reason: format!("unknown integration type '{integration_type}'"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::credentials::StaticCredentialStore;
    use crate::runtime::policy::RuntimeSettings;
    use uuid::Uuid;

    struct Static;

    #[async_trait]
    impl Capability for Static {
        async fn list_capabilities(&self) -> Result<CapabilityList, RuntimeError> {
            Ok(CapabilityList::default())
        }

        async fn invoke(
            &self,
            name: &str,
            _arguments: serde_json::Value,
        ) -> Result<ToolCallResult, RuntimeError> {
            Ok(ToolCallResult::text(format!("native {name}")))
        }

        async fn read_resource(&self, uri: &str) -> Result<ResourceReadResult, RuntimeError> {
            Err(RuntimeError::Protocol {
                reason: format!("no resource {uri}"),
            })
        }
    }

    fn registry() -> HandlerRegistry {
        let supervisor = Supervisor::new(
            RuntimeSettings::default(),
            Arc::new(StaticCredentialStore::new()),
        );
        let mut registry = HandlerRegistry::new(supervisor);
        registry.register_native("github", |_key| Arc::new(Static) as Arc<dyn Capability>);
        registry
    }

    fn key() -> IntegrationKey {
        IntegrationKey::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_native_type_resolves_to_native() {
        let handler = registry().resolve("github", key()).unwrap();
        assert!(!handler.is_external());
        let result = handler.invoke("list_repos", serde_json::json!({})).await.unwrap();
        assert_eq!(result.joined_text(), "native list_repos");
    }

    #[tokio::test]
    async fn test_external_types_resolve_to_external() {
        let registry = registry();
        for kind in ["external_python", "external_nodejs", "external_go", "external_custom"] {
            let handler = registry.resolve(kind, key()).unwrap();
            assert!(handler.is_external(), "{kind}");
        }
    }

    #[tokio::test]
    async fn test_unknown_type_is_configuration_error() {
        let err = registry().resolve("gitlab", key()).unwrap_err();
        assert!(matches!(err, RuntimeError::Configuration { .. }));
    }

    #[tokio::test]
    async fn test_external_without_spec_is_not_configured() {
        let handler = registry().resolve("external_python", key()).unwrap();
        let err = handler.list_capabilities().await.unwrap_err();
        assert!(matches!(err, RuntimeError::NotConfigured { .. }));
    }
}
