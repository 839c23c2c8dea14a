//! The routing-level configuration record (`ServiceConfig`) and the store
//! that loads, caches, validates and updates it.
//!
//! This is distinct from [`crate::providers::ProviderConfig`], which
//! configures a single vendor HTTP client (api key, base url, timeout...).
//! `config_store::ProviderConfig` instead describes a provider from the
//! router's point of view: which models it offers, at what cost, and where
//! its credentials live.

use crate::kv_store::{KvStore, KvStoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

pub const ACTIVE_CONFIG_KEY: &str = "service_config:active";
const WEIGHT_TOLERANCE: f64 = 0.001;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration invalid: {0:?}")]
    Invalid(Vec<String>),
    #[error("kv store error: {0}")]
    KvStore(#[from] KvStoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingWeights {
    pub cost: f64,
    pub quality: f64,
    pub latency: f64,
    pub availability: f64,
}

impl Default for RoutingWeights {
    fn default() -> Self {
        Self {
            cost: 0.7,
            quality: 0.1,
            latency: 0.1,
            availability: 0.1,
        }
    }
}

impl RoutingWeights {
    pub fn sum(&self) -> f64 {
        self.cost + self.quality + self.latency + self.availability
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RoutingConfig {
    pub weights: RoutingWeights,
    pub provider_preference_order: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub cost_per_million_input_tokens: f64,
    pub cost_per_million_output_tokens: f64,
    pub context_window: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub streaming_support: bool,
    pub function_calling_support: bool,
    pub vision_support: bool,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollout_percentage: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RateLimits {
    pub rpm: u32,
    pub tpm: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub active: bool,
    /// Must contain `{env}` and `{region}` placeholders; expanded by
    /// [`crate::secret_store::expand_secret_id`] before lookup.
    pub secret_id: String,
    pub default_model: String,
    pub models: HashMap<String, ModelConfig>,
    pub rate_limits: RateLimits,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_config: Option<RetryConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceConfig {
    pub config_version: String,
    pub schema_version: String,
    pub updated_at: DateTime<Utc>,
    pub providers: HashMap<String, ProviderConfig>,
    pub routing: RoutingConfig,
    #[serde(default)]
    pub feature_flags: HashMap<String, bool>,
}

impl ServiceConfig {
    /// A minimal but internally consistent config used on first boot and
    /// whenever the persisted record is missing or fails validation.
    pub fn bootstrap_default() -> Self {
        let mut models = HashMap::new();
        models.insert(
            "gpt-4o-mini".to_string(),
            ModelConfig {
                name: "gpt-4o-mini".to_string(),
                description: "Default bootstrap model".to_string(),
                cost_per_million_input_tokens: 0.15,
                cost_per_million_output_tokens: 0.6,
                context_window: 128_000,
                max_output_tokens: Some(16_384),
                capabilities: vec!["chat".to_string()],
                streaming_support: true,
                function_calling_support: true,
                vision_support: false,
                active: true,
                system_prompt: None,
                rollout_percentage: None,
            },
        );

        let mut providers = HashMap::new();
        providers.insert(
            "openai".to_string(),
            ProviderConfig {
                active: true,
                secret_id: "providers/{env}/{region}/openai".to_string(),
                default_model: "gpt-4o-mini".to_string(),
                models,
                rate_limits: RateLimits { rpm: 500, tpm: 200_000 },
                retry_config: None,
                api_version: None,
            },
        );

        Self {
            config_version: "0.0.0".to_string(),
            schema_version: "1".to_string(),
            updated_at: Utc::now(),
            providers,
            routing: RoutingConfig {
                weights: RoutingWeights::default(),
                provider_preference_order: vec!["openai".to_string()],
                default_model: Some("gpt-4o-mini".to_string()),
            },
            feature_flags: HashMap::new(),
        }
    }
}

/// Runs every §4.1 validator rule, returning every violation found (never
/// short-circuits on the first one).
pub fn validate(cfg: &ServiceConfig) -> Vec<String> {
    let mut errors = Vec::new();

    let sum = cfg.routing.weights.sum();
    if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
        errors.push(format!(
            "routing.weights must sum to 1.0 (+/- {WEIGHT_TOLERANCE}), got {sum}"
        ));
    }

    if cfg.routing.provider_preference_order.is_empty() {
        errors.push("routing.providerPreferenceOrder must be nonempty".to_string());
    }

    for name in &cfg.routing.provider_preference_order {
        if !cfg.providers.contains_key(name) {
            errors.push(format!(
                "routing.providerPreferenceOrder references unknown provider '{name}'"
            ));
        }
    }

    if let Some(default_model) = &cfg.routing.default_model {
        let found = cfg
            .providers
            .values()
            .any(|p| p.models.contains_key(default_model));
        if !found {
            errors.push(format!(
                "routing.defaultModel '{default_model}' does not key any provider's models"
            ));
        }
    }

    for (provider_name, provider) in &cfg.providers {
        if !provider.secret_id.contains("{env}") || !provider.secret_id.contains("{region}") {
            errors.push(format!(
                "provider '{provider_name}' secretId must contain '{{env}}' and '{{region}}' placeholders"
            ));
        }

        if !provider.models.contains_key(&provider.default_model) {
            errors.push(format!(
                "provider '{provider_name}' defaultModel '{}' is not declared in its models",
                provider.default_model
            ));
        }

        for (model_id, model) in &provider.models {
            if model.cost_per_million_input_tokens < 0.0 || model.cost_per_million_output_tokens < 0.0 {
                errors.push(format!(
                    "provider '{provider_name}' model '{model_id}' has a negative cost"
                ));
            }
            if model.context_window == 0 {
                errors.push(format!(
                    "provider '{provider_name}' model '{model_id}' contextWindow must be > 0"
                ));
            }
            if model.capabilities.is_empty() {
                errors.push(format!(
                    "provider '{provider_name}' model '{model_id}' capabilities must be nonempty"
                ));
            }
            if let Some(pct) = model.rollout_percentage {
                if pct > 0.0 && !model.active {
                    errors.push(format!(
                        "provider '{provider_name}' model '{model_id}' has rolloutPercentage > 0 but active=false"
                    ));
                }
                if !(0.0..=100.0).contains(&pct) {
                    errors.push(format!(
                        "provider '{provider_name}' model '{model_id}' rolloutPercentage must be in [0,100]"
                    ));
                }
            }
        }
    }

    errors
}

struct CachedConfig {
    config: ServiceConfig,
    fetched_at: Instant,
}

/// Loads, caches, validates and updates the active [`ServiceConfig`].
/// `get()` never fails: on any error it logs and returns the best value it
/// has (cached, then bootstrap default).
pub struct ConfigStore {
    kv: Arc<dyn KvStore>,
    cache: RwLock<Option<CachedConfig>>,
    cache_ttl: Duration,
    config_key: String,
}

impl ConfigStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_options(kv, Duration::from_secs(60), ACTIVE_CONFIG_KEY.to_string())
    }

    pub fn with_options(kv: Arc<dyn KvStore>, cache_ttl: Duration, config_key: String) -> Self {
        Self {
            kv,
            cache: RwLock::new(None),
            cache_ttl,
            config_key,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self) -> ServiceConfig {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return cached.config.clone();
                }
            }
        }

        match self.kv.get(&self.config_key).await {
            Ok(Some(raw)) => match serde_json::from_value::<ServiceConfig>(raw) {
                Ok(candidate) => {
                    let errors = validate(&candidate);
                    if errors.is_empty() {
                        let mut cache = self.cache.write().await;
                        *cache = Some(CachedConfig {
                            config: candidate.clone(),
                            fetched_at: Instant::now(),
                        });
                        candidate
                    } else {
                        tracing::warn!(?errors, "persisted service config failed validation, retaining previous value");
                        self.retained_or_bootstrap().await
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to deserialize persisted service config");
                    self.retained_or_bootstrap().await
                }
            },
            Ok(None) => {
                tracing::debug!("no persisted service config found, using retained/bootstrap value");
                self.retained_or_bootstrap().await
            }
            Err(e) => {
                tracing::warn!(error = %e, "kv store read failed while loading service config");
                self.retained_or_bootstrap().await
            }
        }
    }

    async fn retained_or_bootstrap(&self) -> ServiceConfig {
        let cache = self.cache.read().await;
        match cache.as_ref() {
            Some(cached) => cached.config.clone(),
            None => ServiceConfig::bootstrap_default(),
        }
    }

    #[tracing::instrument(skip(self, cfg))]
    pub async fn update(&self, mut cfg: ServiceConfig) -> Result<(), ConfigError> {
        let errors = validate(&cfg);
        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }

        cfg.updated_at = Utc::now();
        let value = serde_json::to_value(&cfg).map_err(KvStoreError::Serialization)?;
        self.kv.set(&self.config_key, value, 0).await?;

        let mut cache = self.cache.write().await;
        *cache = Some(CachedConfig {
            config: cfg,
            fetched_at: Instant::now(),
        });
        Ok(())
    }
}
