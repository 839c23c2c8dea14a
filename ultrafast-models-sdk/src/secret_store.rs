//! Secret store abstraction: fetches provider credentials by an opaque
//! `secretId`, after `{env}`/`{region}` placeholder expansion.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("secret not found: {0}")]
    NotFound(String),
    #[error("secret payload for {secret_id} is not valid JSON: {source}")]
    InvalidJson {
        secret_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("secret payload for {0} is missing required field 'current'")]
    MissingCurrent(String),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// `{"current": "...", "previous": "..."?}` as returned by the external
/// secret manager.
#[derive(Debug, Clone, Deserialize)]
pub struct SecretString {
    pub current: String,
    #[serde(default)]
    pub previous: Option<String>,
}

impl SecretString {
    fn parse(secret_id: &str, raw: &str) -> Result<Self, SecretStoreError> {
        let value: serde_json::Value =
            serde_json::from_str(raw).map_err(|source| SecretStoreError::InvalidJson {
                secret_id: secret_id.to_string(),
                source,
            })?;
        let current = value
            .get("current")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SecretStoreError::MissingCurrent(secret_id.to_string()))?
            .to_string();
        let previous = value
            .get("previous")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Ok(Self { current, previous })
    }
}

/// Expands `{env}` and `{region}` placeholders in a templated `secretId`.
pub fn expand_secret_id(template: &str, env: &str, region: &str) -> String {
    template.replace("{env}", env).replace("{region}", region)
}

#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, secret_id: &str) -> Result<SecretString, SecretStoreError>;
}

/// Looks secrets up as environment variables holding a JSON blob, named
/// after the (already expanded) `secretId` with non-alphanumeric characters
/// turned into `_` and upper-cased, e.g. `openai/{env}/{region}` expanded to
/// `openai/prod/us-east-1` becomes `OPENAI_PROD_US_EAST_1`.
#[derive(Default)]
pub struct EnvSecretStore;

impl EnvSecretStore {
    pub fn new() -> Self {
        Self
    }

    fn env_var_name(secret_id: &str) -> String {
        secret_id
            .chars()
            .map(|c| if c.is_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect()
    }
}

#[async_trait::async_trait]
impl SecretStore for EnvSecretStore {
    async fn get_secret(&self, secret_id: &str) -> Result<SecretString, SecretStoreError> {
        let var_name = Self::env_var_name(secret_id);
        let raw = std::env::var(&var_name)
            .map_err(|_| SecretStoreError::NotFound(secret_id.to_string()))?;
        SecretString::parse(secret_id, &raw)
    }
}

/// In-memory secret store for tests and explicit credential injection.
#[derive(Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, String>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secret(mut self, secret_id: impl Into<String>, raw_json: impl Into<String>) -> Self {
        self.secrets.insert(secret_id.into(), raw_json.into());
        self
    }
}

#[async_trait::async_trait]
impl SecretStore for StaticSecretStore {
    async fn get_secret(&self, secret_id: &str) -> Result<SecretString, SecretStoreError> {
        let raw = self
            .secrets
            .get(secret_id)
            .ok_or_else(|| SecretStoreError::NotFound(secret_id.to_string()))?;
        SecretString::parse(secret_id, raw)
    }
}

pub fn shared_static(secrets: StaticSecretStore) -> Arc<dyn SecretStore> {
    Arc::new(secrets)
}
