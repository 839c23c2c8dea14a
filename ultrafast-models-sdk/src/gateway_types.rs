//! Unified caller-facing request/result contracts (§3, §6). These are the
//! types the Router and ProviderAdapter speak; translation to/from a
//! specific vendor wire format happens inside each adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Auth,
    RateLimit,
    Content,
    Capability,
    Timeout,
    Unknown,
}

impl ErrorCode {
    /// Whether this code counts as a "qualifying" outcome that should be
    /// recorded against the circuit breaker (§7).
    pub fn is_qualifying(&self) -> bool {
        matches!(self, ErrorCode::RateLimit | ErrorCode::Timeout | ErrorCode::Unknown)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RequestContext {
    pub region: String,
    pub request_id: String,
    #[serde(default)]
    pub history: Vec<HistoryMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streaming: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_output_tokens: Option<u64>,
    pub context: RequestContext,
}

impl Request {
    pub fn new(prompt: impl Into<String>, region: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            preferred_provider: None,
            preferred_model: None,
            max_tokens: None,
            temperature: None,
            required_capabilities: Vec::new(),
            tools: Vec::new(),
            streaming: None,
            system_prompt: None,
            estimated_input_tokens: None,
            estimated_output_tokens: None,
            context: RequestContext {
                region: region.into(),
                request_id: request_id.into(),
                history: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMeta {
    pub provider: String,
    pub model: String,
    pub region: String,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Success {
    pub text: String,
    pub tokens: TokenUsage,
    pub meta: ResultMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code:?} error from provider '{provider}': {detail}")]
pub struct AdapterError {
    pub code: ErrorCode,
    pub provider: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    pub retryable: bool,
}

impl AdapterError {
    pub fn new(code: ErrorCode, provider: impl Into<String>, detail: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            provider: provider.into(),
            detail: detail.into(),
            status: None,
            retryable,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GatewayResult {
    Success(Success),
    Error(AdapterError),
}

impl GatewayResult {
    pub fn is_success(&self) -> bool {
        matches!(self, GatewayResult::Success(_))
    }
}
