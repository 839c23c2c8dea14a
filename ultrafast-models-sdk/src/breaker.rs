//! Three-state circuit breaker keyed by `"{provider}#{region}"`, persisted
//! through a [`KvStore`] so that multiple stateless worker instances share a
//! consistent (last-writer-wins) view.
//!
//! This is the routing-level breaker THE CORE routes through; it is
//! intentionally separate from [`crate::circuit_breaker::CircuitBreaker`],
//! the process-local generic `call()`-wrapping breaker the vendor provider
//! layer already uses (see DESIGN.md for why both remain in the tree).

use crate::kv_store::KvStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitState {
    pub status: BreakerStatus,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub total_successes: u64,
    pub current_half_open_successes: u32,
    pub last_state_change_timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_timestamp: Option<DateTime<Utc>>,
    pub total_latency_ms: u64,
    pub last_latency_ms: u64,
    pub avg_latency_ms: f64,
    pub ttl: i64,
}

impl CircuitState {
    fn closed_default(now: DateTime<Utc>, ttl_seconds: i64) -> Self {
        Self {
            status: BreakerStatus::Closed,
            consecutive_failures: 0,
            total_failures: 0,
            total_successes: 0,
            current_half_open_successes: 0,
            last_state_change_timestamp: now,
            opened_timestamp: None,
            last_failure_timestamp: None,
            total_latency_ms: 0,
            last_latency_ms: 0,
            avg_latency_ms: 0.0,
            ttl: now.timestamp() + ttl_seconds,
        }
    }

    fn record_latency(&mut self, latency_ms: u64) {
        self.last_latency_ms = latency_ms;
        self.total_latency_ms += latency_ms;
        let count = self.total_successes + self.total_failures;
        if count > 0 {
            self.avg_latency_ms = self.total_latency_ms as f64 / count as f64;
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_period: Duration,
    pub half_open_success_threshold: u32,
    pub record_ttl_seconds: i64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_period: Duration::from_secs(30),
            half_open_success_threshold: 2,
            record_ttl_seconds: 7 * 24 * 3600,
        }
    }
}

pub fn circuit_key(provider: &str, region: &str) -> String {
    format!("{provider}#{region}")
}

fn kv_key(key: &str) -> String {
    format!("provider_health:{key}")
}

/// Gates requests per `(provider, region)` and persists state through a
/// shared [`KvStore`]. Cheap to clone: the store handle is an `Arc`.
pub struct CircuitBreaker {
    kv: Arc<dyn KvStore>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self::with_config(kv, CircuitBreakerConfig::default())
    }

    pub fn with_config(kv: Arc<dyn KvStore>, config: CircuitBreakerConfig) -> Self {
        Self { kv, config }
    }

    async fn read_state(&self, key: &str) -> CircuitState {
        match self.kv.get(&kv_key(key)).await {
            Ok(Some(raw)) => match serde_json::from_value::<CircuitState>(raw) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(error = %e, %key, "failed to deserialize circuit state, treating as closed");
                    CircuitState::closed_default(Utc::now(), self.config.record_ttl_seconds)
                }
            },
            Ok(None) => CircuitState::closed_default(Utc::now(), self.config.record_ttl_seconds),
            Err(e) => {
                tracing::warn!(error = %e, %key, "kv read failed while loading circuit state, treating as closed");
                CircuitState::closed_default(Utc::now(), self.config.record_ttl_seconds)
            }
        }
    }

    async fn write_state(&self, key: &str, mut state: CircuitState) {
        let now = Utc::now();
        state.ttl = now.timestamp() + self.config.record_ttl_seconds;
        match serde_json::to_value(&state) {
            Ok(value) => {
                if let Err(e) = self
                    .kv
                    .set(&kv_key(key), value, self.config.record_ttl_seconds as u64)
                    .await
                {
                    tracing::warn!(error = %e, %key, "failed to persist circuit state");
                }
            }
            Err(e) => tracing::warn!(error = %e, %key, "failed to serialize circuit state"),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn allow(&self, key: &str) -> bool {
        let mut state = self.read_state(key).await;
        match state.status {
            BreakerStatus::Closed => true,
            BreakerStatus::HalfOpen => true,
            BreakerStatus::Open => {
                let opened_at = state.opened_timestamp.unwrap_or(state.last_state_change_timestamp);
                let elapsed = Utc::now().signed_duration_since(opened_at);
                if elapsed.to_std().unwrap_or_default() >= self.config.cooldown_period {
                    state.status = BreakerStatus::HalfOpen;
                    state.consecutive_failures = 0;
                    state.current_half_open_successes = 0;
                    state.last_state_change_timestamp = Utc::now();
                    self.write_state(key, state).await;
                    true
                } else {
                    false
                }
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn record_success(&self, key: &str, latency_ms: Option<u64>) {
        let mut state = self.read_state(key).await;
        state.total_successes += 1;
        if let Some(latency) = latency_ms {
            state.record_latency(latency);
        }

        match state.status {
            BreakerStatus::Closed => {
                state.consecutive_failures = 0;
            }
            BreakerStatus::HalfOpen => {
                state.current_half_open_successes += 1;
                if state.current_half_open_successes >= self.config.half_open_success_threshold {
                    state.status = BreakerStatus::Closed;
                    state.consecutive_failures = 0;
                    state.current_half_open_successes = 0;
                    state.last_state_change_timestamp = Utc::now();
                }
            }
            BreakerStatus::Open => {
                tracing::warn!(%key, "success recorded while circuit open, treating as half-open success");
                state.current_half_open_successes += 1;
                if state.current_half_open_successes >= self.config.half_open_success_threshold {
                    state.status = BreakerStatus::Closed;
                    state.consecutive_failures = 0;
                    state.current_half_open_successes = 0;
                    state.last_state_change_timestamp = Utc::now();
                }
            }
        }

        self.write_state(key, state).await;
    }

    #[tracing::instrument(skip(self))]
    pub async fn record_failure(&self, key: &str, latency_ms: Option<u64>) {
        let mut state = self.read_state(key).await;
        state.total_failures += 1;
        state.last_failure_timestamp = Some(Utc::now());
        if let Some(latency) = latency_ms {
            state.record_latency(latency);
        }

        match state.status {
            BreakerStatus::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.status = BreakerStatus::Open;
                    state.opened_timestamp = Some(Utc::now());
                    state.current_half_open_successes = 0;
                    state.last_state_change_timestamp = Utc::now();
                }
            }
            BreakerStatus::HalfOpen | BreakerStatus::Open => {
                state.status = BreakerStatus::Open;
                state.opened_timestamp = Some(Utc::now());
                state.current_half_open_successes = 0;
                state.last_state_change_timestamp = Utc::now();
            }
        }

        self.write_state(key, state).await;
    }

    pub async fn get_state(&self, key: &str) -> CircuitState {
        self.read_state(key).await
    }
}
