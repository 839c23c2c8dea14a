//! ProviderAdapter: credential loading, request/response translation, and
//! vendor error normalization (§4.4), wrapped around the existing
//! [`crate::providers::Provider`] vendor clients rather than reimplementing
//! HTTP plumbing.
//!
//! The abstract contract is `name`/`can_fulfill`/`generate`; `can_fulfill`
//! and `standardize_error` are shared (vendor-agnostic) helpers, matching
//! how `providers::Provider` already factors shared behavior one layer down.
//! Concrete adapters differ only in protocol translation: [`OpenAiAdapter`]
//! passes `system`-role messages straight through in the message array,
//! while [`AnthropicAdapter`] resolves a single top-level `system` string
//! and filters `system`-role entries out of the message array.

use crate::config_store::ModelConfig;
use crate::error::ProviderError;
use crate::gateway_types::{AdapterError, ErrorCode, Request, ResultMeta, Success, TokenUsage};
use crate::models::{ChatRequest, Message};
use crate::providers::anthropic::AnthropicProvider;
use crate::providers::openai::OpenAIProvider;
use crate::providers::{Provider, ProviderConfig as VendorProviderConfig};
use crate::secret_store::{expand_secret_id, SecretStore};
use crate::token_bucket::{estimate_tokens, TokenBucket};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::OnceCell;

/// Uniform generate/canFulfill contract the Router depends on.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Shared across adapters: a capability check against the resolved
    /// model config. No vendor call involved.
    fn can_fulfill(&self, req: &Request, model: &ModelConfig) -> bool {
        if !model.active {
            return false;
        }
        if !req
            .required_capabilities
            .iter()
            .all(|c| model.capabilities.iter().any(|m| m == c))
        {
            return false;
        }
        if !req.tools.is_empty() && !model.function_calling_support {
            return false;
        }
        true
    }

    async fn generate(
        &self,
        req: &Request,
        model_id: &str,
        model: &ModelConfig,
    ) -> Result<Success, AdapterError>;
}

/// Maps a vendor client error onto the six-way taxonomy, per the §4.4 table.
pub fn classify_provider_error(provider: &str, err: &ProviderError) -> AdapterError {
    match err {
        ProviderError::Timeout => {
            AdapterError::new(ErrorCode::Timeout, provider, "request timed out", true).with_status(504)
        }
        ProviderError::InvalidApiKey => {
            AdapterError::new(ErrorCode::Auth, provider, "invalid api key", false).with_status(401)
        }
        ProviderError::AuthenticationFailed { reason } => {
            AdapterError::new(ErrorCode::Auth, provider, reason.clone(), false).with_status(401)
        }
        ProviderError::RateLimit => {
            AdapterError::new(ErrorCode::RateLimit, provider, "rate limit exceeded", true).with_status(429)
        }
        ProviderError::QuotaExceeded => {
            AdapterError::new(ErrorCode::RateLimit, provider, "quota exceeded", true).with_status(429)
        }
        ProviderError::ModelNotFound { model } => AdapterError::new(
            ErrorCode::Capability,
            provider,
            format!("model not found: {model}"),
            false,
        )
        .with_status(404),
        ProviderError::FeatureNotSupported { feature } => AdapterError::new(
            ErrorCode::Capability,
            provider,
            format!("feature not supported: {feature}"),
            false,
        )
        .with_status(404),
        ProviderError::ProviderNotSupported { provider: p } => AdapterError::new(
            ErrorCode::Capability,
            provider,
            format!("provider not supported: {p}"),
            false,
        )
        .with_status(404),
        ProviderError::ValidationError { field, message } => AdapterError::new(
            ErrorCode::Content,
            provider,
            format!("{field}: {message}"),
            false,
        )
        .with_status(422),
        ProviderError::ServiceUnavailable => {
            AdapterError::new(ErrorCode::Unknown, provider, "service unavailable", true).with_status(500)
        }
        ProviderError::NetworkError { message } => {
            AdapterError::new(ErrorCode::Timeout, provider, message.clone(), true).with_status(504)
        }
        ProviderError::RetryableError { message } => {
            AdapterError::new(ErrorCode::Unknown, provider, message.clone(), true).with_status(500)
        }
        ProviderError::Http(e) => {
            classify_by_status_and_message(provider, e.status().map(|s| s.as_u16()), &e.to_string())
        }
        ProviderError::Api { code, message } => classify_by_status_and_message(provider, Some(*code), message),
        ProviderError::Serialization(e) => {
            AdapterError::new(ErrorCode::Unknown, provider, e.to_string(), false).with_status(500)
        }
        ProviderError::InvalidResponse => {
            AdapterError::new(ErrorCode::Unknown, provider, "invalid response format", false).with_status(500)
        }
        ProviderError::Configuration { message } => {
            AdapterError::new(ErrorCode::Capability, provider, message.clone(), false).with_status(500)
        }
    }
}

fn classify_by_status_and_message(provider: &str, status: Option<u16>, message: &str) -> AdapterError {
    match status {
        Some(401) => return AdapterError::new(ErrorCode::Auth, provider, message, false).with_status(401),
        Some(403) => return AdapterError::new(ErrorCode::Auth, provider, message, false).with_status(403),
        Some(429) => return AdapterError::new(ErrorCode::RateLimit, provider, message, true).with_status(429),
        Some(404) => return AdapterError::new(ErrorCode::Capability, provider, message, false).with_status(404),
        Some(422) => return AdapterError::new(ErrorCode::Content, provider, message, false).with_status(422),
        Some(s) if s >= 500 => return AdapterError::new(ErrorCode::Unknown, provider, message, true).with_status(s),
        Some(s) if (400..500).contains(&s) => {
            return AdapterError::new(ErrorCode::Capability, provider, message, false).with_status(s)
        }
        _ => {}
    }

    let lower = message.to_ascii_lowercase();
    if lower.contains("invalid api key") || lower.contains("authentication") {
        AdapterError::new(ErrorCode::Auth, provider, message, false).with_status(401)
    } else if lower.contains("permission denied") {
        AdapterError::new(ErrorCode::Auth, provider, message, false).with_status(403)
    } else if lower.contains("rate limit") || lower.contains("quota") {
        AdapterError::new(ErrorCode::RateLimit, provider, message, true).with_status(429)
    } else if lower.contains("not found") {
        AdapterError::new(ErrorCode::Capability, provider, message, false).with_status(404)
    } else if lower.contains("unprocessable") || lower.contains("conflict") {
        AdapterError::new(ErrorCode::Content, provider, message, false).with_status(422)
    } else if lower.contains("timeout") || lower.contains("connection aborted") || lower.contains("connect") {
        AdapterError::new(ErrorCode::Timeout, provider, message, true).with_status(504)
    } else {
        AdapterError::new(ErrorCode::Unknown, provider, message, false).with_status(500)
    }
}

fn translate_success(
    provider: &str,
    requested_model: &str,
    region: &str,
    latency_ms: u64,
    resp: crate::models::ChatResponse,
) -> Success {
    let text = resp
        .choices
        .first()
        .map(|c| c.message.content.clone())
        .unwrap_or_default();
    let tokens = match resp.usage {
        Some(u) => TokenUsage {
            prompt: u.prompt_tokens as u64,
            completion: u.completion_tokens as u64,
            total: u.total_tokens as u64,
        },
        None => TokenUsage::default(),
    };
    let model = if resp.model.is_empty() {
        requested_model.to_string()
    } else {
        resp.model
    };

    Success {
        text,
        tokens,
        meta: ResultMeta {
            provider: provider.to_string(),
            model,
            region: region.to_string(),
            latency_ms,
            timestamp: chrono::Utc::now(),
            features: Vec::new(),
        },
    }
}

/// Builds the message array the way vendors that accept `system`-role
/// messages inline expect it: the resolved system prompt (if any) and any
/// `system`-role history entries are both passed through, in order.
fn build_inline_messages(req: &Request, model: &ModelConfig) -> Vec<Message> {
    let mut messages = Vec::new();
    if let Some(sys) = req.system_prompt.clone().or_else(|| model.system_prompt.clone()) {
        messages.push(Message::system(sys));
    }
    for h in &req.context.history {
        messages.push(match h.role.as_str() {
            "system" => Message::system(h.content.clone()),
            "assistant" => Message::assistant(h.content.clone()),
            _ => Message::user(h.content.clone()),
        });
    }
    messages.push(Message::user(req.prompt.clone()));
    messages
}

/// Builds the message array the way vendors with a distinct top-level
/// `system` parameter expect it: `system`-role history entries are filtered
/// out of the array; the earliest one is the fallback system value when
/// neither the request nor the model config supply one (§8 scenario 7).
fn resolve_filtered_system_and_messages(req: &Request, model: &ModelConfig) -> (Option<String>, Vec<Message>) {
    let mut messages = Vec::new();
    let mut earliest_history_system = None;
    for h in &req.context.history {
        match h.role.as_str() {
            "system" => {
                if earliest_history_system.is_none() {
                    earliest_history_system = Some(h.content.clone());
                }
            }
            "assistant" => messages.push(Message::assistant(h.content.clone())),
            _ => messages.push(Message::user(h.content.clone())),
        }
    }
    messages.push(Message::user(req.prompt.clone()));

    let system = req
        .system_prompt
        .clone()
        .or_else(|| model.system_prompt.clone())
        .or(earliest_history_system);
    (system, messages)
}

fn estimated_output_tokens(req: &Request, model: &ModelConfig) -> Option<u32> {
    req.max_tokens.or(model.max_output_tokens)
}

/// OpenAI-style adapter: vendor accepts `system`-role messages inline, so
/// translation delegates straight to [`OpenAIProvider::chat_completion`].
pub struct OpenAiAdapter {
    name: &'static str,
    secret_store: Arc<dyn SecretStore>,
    secret_id: String,
    env: String,
    region: String,
    token_bucket: TokenBucket,
    client: OnceCell<Arc<dyn Provider>>,
}

impl OpenAiAdapter {
    pub fn new(
        secret_store: Arc<dyn SecretStore>,
        secret_id: String,
        env: String,
        region: String,
        tpm: u32,
    ) -> Self {
        Self {
            name: "openai",
            secret_store,
            secret_id,
            env,
            region,
            token_bucket: TokenBucket::new(tpm),
            client: OnceCell::new(),
        }
    }

    /// Bypasses the secret fetch; for tests and explicit injection.
    pub fn with_client(
        secret_store: Arc<dyn SecretStore>,
        secret_id: String,
        env: String,
        region: String,
        tpm: u32,
        client: Arc<dyn Provider>,
    ) -> Self {
        Self {
            name: "openai",
            secret_store,
            secret_id,
            env,
            region,
            token_bucket: TokenBucket::new(tpm),
            client: OnceCell::new_with(Some(client)),
        }
    }

    async fn ensure_client(&self) -> Result<&Arc<dyn Provider>, AdapterError> {
        self.client
            .get_or_try_init(|| async {
                let expanded = expand_secret_id(&self.secret_id, &self.env, &self.region);
                let secret = self.secret_store.get_secret(&expanded).await.map_err(|e| {
                    AdapterError::new(
                        ErrorCode::Auth,
                        self.name,
                        format!("credential load failed: {e}"),
                        false,
                    )
                    .with_status(401)
                })?;
                let config = VendorProviderConfig::new("openai", secret.current);
                let provider = OpenAIProvider::new(config).map_err(|e| classify_provider_error(self.name, &e))?;
                Ok::<Arc<dyn Provider>, AdapterError>(Arc::new(provider))
            })
            .await
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        self.name
    }

    #[tracing::instrument(skip(self, req, model))]
    async fn generate(
        &self,
        req: &Request,
        model_id: &str,
        model: &ModelConfig,
    ) -> Result<Success, AdapterError> {
        let client = self.ensure_client().await?.clone();

        let history_len: usize = req.context.history.iter().map(|h| h.content.len()).sum();
        let max_tokens = estimated_output_tokens(req, model);
        let estimated = estimate_tokens(req.prompt.len(), history_len, max_tokens);
        if !self.token_bucket.consume(estimated).await {
            return Err(
                AdapterError::new(ErrorCode::RateLimit, self.name, "token bucket admission refused", true)
                    .with_status(429),
            );
        }

        let messages = build_inline_messages(req, model);
        let chat_request = ChatRequest {
            model: model_id.to_string(),
            messages,
            max_tokens: max_tokens.or(Some(1024)),
            temperature: req.temperature,
            ..Default::default()
        };

        let start = Instant::now();
        let result = client.chat_completion(chat_request).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(resp) => Ok(translate_success(self.name, model_id, &req.context.region, latency_ms, resp)),
            Err(e) => Err(classify_provider_error(self.name, &e)),
        }
    }
}

/// Anthropic-style adapter: vendor expects a distinct top-level `system`
/// parameter, so translation calls [`AnthropicProvider::generate_raw`]
/// instead of the filtering-workaround `chat_completion` path that exists
/// for the teacher's original client-mode usage.
pub struct AnthropicAdapter {
    name: &'static str,
    secret_store: Arc<dyn SecretStore>,
    secret_id: String,
    env: String,
    region: String,
    token_bucket: TokenBucket,
    client: OnceCell<Arc<AnthropicProvider>>,
}

impl AnthropicAdapter {
    pub fn new(
        secret_store: Arc<dyn SecretStore>,
        secret_id: String,
        env: String,
        region: String,
        tpm: u32,
    ) -> Self {
        Self {
            name: "anthropic",
            secret_store,
            secret_id,
            env,
            region,
            token_bucket: TokenBucket::new(tpm),
            client: OnceCell::new(),
        }
    }

    pub fn with_client(
        secret_store: Arc<dyn SecretStore>,
        secret_id: String,
        env: String,
        region: String,
        tpm: u32,
        client: Arc<AnthropicProvider>,
    ) -> Self {
        Self {
            name: "anthropic",
            secret_store,
            secret_id,
            env,
            region,
            token_bucket: TokenBucket::new(tpm),
            client: OnceCell::new_with(Some(client)),
        }
    }

    async fn ensure_client(&self) -> Result<&Arc<AnthropicProvider>, AdapterError> {
        self.client
            .get_or_try_init(|| async {
                let expanded = expand_secret_id(&self.secret_id, &self.env, &self.region);
                let secret = self.secret_store.get_secret(&expanded).await.map_err(|e| {
                    AdapterError::new(
                        ErrorCode::Auth,
                        self.name,
                        format!("credential load failed: {e}"),
                        false,
                    )
                    .with_status(401)
                })?;
                let config = VendorProviderConfig::new("anthropic", secret.current);
                let provider = AnthropicProvider::new(config).map_err(|e| classify_provider_error(self.name, &e))?;
                Ok::<Arc<AnthropicProvider>, AdapterError>(Arc::new(provider))
            })
            .await
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        self.name
    }

    #[tracing::instrument(skip(self, req, model))]
    async fn generate(
        &self,
        req: &Request,
        model_id: &str,
        model: &ModelConfig,
    ) -> Result<Success, AdapterError> {
        let client = self.ensure_client().await?.clone();

        let history_len: usize = req.context.history.iter().map(|h| h.content.len()).sum();
        let max_tokens = estimated_output_tokens(req, model);
        let estimated = estimate_tokens(req.prompt.len(), history_len, max_tokens);
        if !self.token_bucket.consume(estimated).await {
            return Err(
                AdapterError::new(ErrorCode::RateLimit, self.name, "token bucket admission refused", true)
                    .with_status(429),
            );
        }

        let (system, messages) = resolve_filtered_system_and_messages(req, model);
        let mapped_model = client.map_model(model_id);

        let start = Instant::now();
        let result = client
            .generate_raw(mapped_model, messages, system, max_tokens.unwrap_or(1024), req.temperature)
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(resp) => Ok(translate_success(self.name, model_id, &req.context.region, latency_ms, resp)),
            Err(e) => Err(classify_provider_error(self.name, &e)),
        }
    }
}
