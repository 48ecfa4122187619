//! ABOUTME: Secret resolution: namespace and flow maps merged through a keeper
//! ABOUTME: Flow secrets override namespace secrets; variables stay separate

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use wf_core::{Error, Result};
use wf_db::SecretRepository;

/// Decrypts secret values. The real keeper is an external service; the
/// engine only sees plaintext through this seam.
#[async_trait]
pub trait Keeper: Send + Sync {
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<String>;
}

/// Pass-through keeper for deployments without an external keystore: values
/// are stored as UTF-8 plaintext.
pub struct PlainKeeper;

#[async_trait]
impl Keeper for PlainKeeper {
    async fn decrypt(&self, ciphertext: &[u8]) -> Result<String> {
        String::from_utf8(ciphertext.to_vec())
            .map_err(|_| Error::Validation("Secret value is not valid UTF-8".to_string()))
    }
}

/// Resolves the merged secret map for one flow execution
#[async_trait]
pub trait SecretsProvider: Send + Sync {
    async fn secrets_for(&self, namespace_id: i64, flow_id: i64)
        -> Result<HashMap<String, String>>;
}

/// Database-backed provider: namespace secrets first, flow secrets layered
/// on top so a flow-level key wins.
pub struct DbSecretsProvider {
    repo: SecretRepository,
    keeper: Arc<dyn Keeper>,
}

impl DbSecretsProvider {
    pub fn new(repo: SecretRepository, keeper: Arc<dyn Keeper>) -> Self {
        Self { repo, keeper }
    }
}

#[async_trait]
impl SecretsProvider for DbSecretsProvider {
    async fn secrets_for(
        &self,
        namespace_id: i64,
        flow_id: i64,
    ) -> Result<HashMap<String, String>> {
        let mut merged = HashMap::new();
        for (key, ciphertext) in self.repo.namespace_secrets(namespace_id).await? {
            merged.insert(key, self.keeper.decrypt(&ciphertext).await?);
        }
        for (key, ciphertext) in self.repo.flow_secrets(flow_id).await? {
            merged.insert(key, self.keeper.decrypt(&ciphertext).await?);
        }
        Ok(merged)
    }
}

/// Fixed secret map for tests
pub struct StaticSecrets(pub HashMap<String, String>);

#[async_trait]
impl SecretsProvider for StaticSecrets {
    async fn secrets_for(
        &self,
        _namespace_id: i64,
        _flow_id: i64,
    ) -> Result<HashMap<String, String>> {
        Ok(self.0.clone())
    }
}
