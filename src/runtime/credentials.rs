//! Credential lookup seam.
//!
//! Tokens are fetched right before a process is spawned and exist only in the
//! environment handed to that process. The storage behind the lookup (and
//! the OAuth flow that fills it) lives outside this crate.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::errors::RuntimeError;
use super::types::IntegrationKey;

/// An already-valid access token.
///
/// Has no `Display`; `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token. Only the environment builder should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

/// Source of per-(tenant, integration) access tokens.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Look up the token for a key. `Ok(None)` means no credential is
    /// configured, which is not an error.
    async fn access_token(&self, key: &IntegrationKey) -> Result<Option<Credential>, RuntimeError>;
}

/// In-memory credential store used by the daemon and tests.
#[derive(Debug, Default)]
pub struct StaticCredentialStore {
    tokens: RwLock<HashMap<IntegrationKey, Credential>>,
}

impl StaticCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: IntegrationKey, credential: Credential) {
        self.tokens
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key, credential);
    }

    pub fn remove(&self, key: &IntegrationKey) {
        self.tokens
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }
}

#[async_trait]
impl CredentialStore for StaticCredentialStore {
    async fn access_token(&self, key: &IntegrationKey) -> Result<Option<Credential>, RuntimeError> {
        Ok(self
            .tokens
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_credential_debug_is_redacted() {
        let cred = Credential::new("ghp_supersecret");
        assert_eq!(format!("{cred:?}"), "Credential([REDACTED])");
        assert_eq!(cred.expose(), "ghp_supersecret");
    }

    #[tokio::test]
    async fn test_static_store_lookup() {
        let store = StaticCredentialStore::new();
        let key = IntegrationKey::new(Uuid::new_v4(), Uuid::new_v4());
        assert!(store.access_token(&key).await.unwrap().is_none());

        store.insert(key, Credential::new("tok"));
        let found = store.access_token(&key).await.unwrap();
        assert_eq!(found, Some(Credential::new("tok")));

        store.remove(&key);
        assert!(store.access_token(&key).await.unwrap().is_none());
    }
}
