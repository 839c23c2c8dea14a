//! Router: per-request candidate selection, cost-weighted scoring, and
//! strictly sequential fallback across providers, gated by the
//! [`CircuitBreaker`] (§4.5).
//!
//! This is the entry point THE CORE's surrounding handler calls: construct a
//! [`Request`], call [`Router::route`], get back a [`GatewayResult`].

use crate::adapter::{AnthropicAdapter, OpenAiAdapter, ProviderAdapter};
use crate::breaker::{circuit_key, CircuitBreaker, CircuitState};
use crate::config_store::{ConfigStore, ModelConfig, RoutingWeights, ServiceConfig};
use crate::gateway_types::{AdapterError, ErrorCode, GatewayResult, Request};
use crate::secret_store::SecretStore;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Clone)]
struct Candidate {
    provider: String,
    model_id: String,
    model: ModelConfig,
}

fn cost_score(candidate: &Candidate, in_tokens: f64, out_tokens: f64) -> f64 {
    (in_tokens / 1_000_000.0) * candidate.model.cost_per_million_input_tokens
        + (out_tokens / 1_000_000.0) * candidate.model.cost_per_million_output_tokens
}

/// Keeps the normalized quality/latency/availability terms at roughly the
/// same order of magnitude as a typical per-request dollar cost, so that at
/// the default weights cost stays the dominant signal and the other terms
/// only act as tie-breakers between similarly priced candidates.
const AUX_SCALE: f64 = 1e-6;

/// Quality proxy: models advertising more capabilities score better (lower).
fn quality_term(candidate: &Candidate) -> f64 {
    1.0 / (1.0 + candidate.model.capabilities.len() as f64)
}

/// Latency/availability proxies derived from the breaker's aggregate stats;
/// a neutral midpoint is used until a circuit has recorded any outcome.
fn latency_and_availability_terms(state: &CircuitState) -> (f64, f64) {
    let observations = state.total_successes + state.total_failures;
    if observations == 0 {
        return (0.5, 0.5);
    }
    let latency = (state.avg_latency_ms / 10_000.0).min(1.0);
    let availability = 1.0 - (state.total_successes as f64 / observations as f64);
    (latency, availability)
}

/// The full weighted objective (§4.5 step 3 / §9): cost dominates by
/// construction, with quality/latency/availability breaking near-ties.
fn weighted_score(weights: &RoutingWeights, candidate: &Candidate, in_tokens: f64, out_tokens: f64, state: &CircuitState) -> f64 {
    let (latency, availability) = latency_and_availability_terms(state);
    weights.cost * cost_score(candidate, in_tokens, out_tokens)
        + weights.quality * quality_term(candidate) * AUX_SCALE
        + weights.latency * latency * AUX_SCALE
        + weights.availability * availability * AUX_SCALE
}

fn disposition_label(err: &AdapterError) -> &'static str {
    match err.code {
        ErrorCode::Auth => "auth",
        ErrorCode::RateLimit => "rate_limit",
        ErrorCode::Content => "content",
        ErrorCode::Capability => "capability",
        ErrorCode::Timeout => "timeout",
        ErrorCode::Unknown => "unknown",
    }
}

/// Selects a `(provider, model)` per request: preferred provider first (if
/// given and active), then `providerPreferenceOrder`, filtered to active
/// providers and active models and scored by the weighted cost/quality/
/// latency/availability objective when no provider is pinned. Walks the
/// ordered candidates, consulting the circuit breaker and each adapter's
/// `canFulfill` before invoking `generate`, and falls back to the next
/// candidate on a qualifying failure.
pub struct Router {
    config: Arc<ConfigStore>,
    circuit: Arc<CircuitBreaker>,
    secret_store: Arc<dyn SecretStore>,
    env: String,
    adapters: RwLock<HashMap<String, Arc<dyn ProviderAdapter>>>,
}

impl Router {
    pub fn new(
        config: Arc<ConfigStore>,
        circuit: Arc<CircuitBreaker>,
        secret_store: Arc<dyn SecretStore>,
        env: impl Into<String>,
    ) -> Self {
        Self {
            config,
            circuit,
            secret_store,
            env: env.into(),
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Pre-registers an adapter for a `(provider, region)` pair, bypassing
    /// lazy construction and credential loading. Used by tests and by
    /// callers that want to inject a specific vendor client.
    pub async fn inject_adapter(&self, provider: &str, region: &str, adapter: Arc<dyn ProviderAdapter>) {
        let mut adapters = self.adapters.write().await;
        adapters.insert(circuit_key(provider, region), adapter);
    }

    #[tracing::instrument(skip(self, req))]
    pub async fn route(&self, req: &Request) -> GatewayResult {
        let cfg = self.config.get().await;
        let candidates = self.build_candidates(&cfg, req);

        if candidates.is_empty() {
            return GatewayResult::Error(
                AdapterError::new(
                    ErrorCode::Timeout,
                    "router",
                    "No suitable active provider available",
                    true,
                )
                .with_status(503),
            );
        }

        let ordered = self.order_candidates(&cfg, req, candidates).await;
        let mut dispositions: Vec<String> = Vec::with_capacity(ordered.len());

        for candidate in &ordered {
            let key = circuit_key(&candidate.provider, &req.context.region);

            if !self.circuit.allow(&key).await {
                dispositions.push(format!("{}(circuit_open)", candidate.provider));
                continue;
            }

            let adapter = match self.adapter_for(&cfg, &candidate.provider, &req.context.region).await {
                Some(a) => a,
                None => {
                    dispositions.push(format!("{}(no_adapter)", candidate.provider));
                    continue;
                }
            };

            if !adapter.can_fulfill(req, &candidate.model) {
                dispositions.push(format!("{}(cannot_fulfill)", candidate.provider));
                continue;
            }

            let start = Instant::now();
            let outcome = adapter.generate(req, &candidate.model_id, &candidate.model).await;
            let latency_ms = start.elapsed().as_millis() as u64;

            match outcome {
                Ok(success) => {
                    self.circuit.record_success(&key, Some(latency_ms)).await;
                    return GatewayResult::Success(success);
                }
                Err(err) => {
                    if err.retryable || err.code.is_qualifying() {
                        self.circuit.record_failure(&key, Some(latency_ms)).await;
                    }
                    dispositions.push(format!("{}({})", candidate.provider, disposition_label(&err)));
                }
            }
        }

        GatewayResult::Error(
            AdapterError::new(
                ErrorCode::Timeout,
                "router",
                format!("All candidate providers failed: {}", dispositions.join(", ")),
                true,
            )
            .with_status(503),
        )
    }

    fn build_candidates(&self, cfg: &ServiceConfig, req: &Request) -> Vec<Candidate> {
        let mut provider_order: Vec<String> = Vec::new();
        if let Some(preferred) = &req.preferred_provider {
            if cfg.providers.get(preferred).is_some_and(|p| p.active) {
                provider_order.push(preferred.clone());
            }
        }
        for name in &cfg.routing.provider_preference_order {
            if !provider_order.contains(name) && cfg.providers.get(name).is_some_and(|p| p.active) {
                provider_order.push(name.clone());
            }
        }

        provider_order
            .into_iter()
            .filter_map(|provider_name| {
                let provider_cfg = cfg.providers.get(&provider_name)?;
                let model_id = match &req.preferred_model {
                    Some(m) if provider_cfg.models.get(m).is_some_and(|mc| mc.active) => m.clone(),
                    _ => provider_cfg.default_model.clone(),
                };
                let model = provider_cfg.models.get(&model_id)?;
                if !model.active {
                    return None;
                }
                Some(Candidate {
                    provider: provider_name,
                    model_id,
                    model: model.clone(),
                })
            })
            .collect()
    }

    /// Scores candidates by the weighted objective when the request did not
    /// pin a provider; a pinned provider keeps first position and only the
    /// remainder is scored (§4.5 step 3).
    async fn order_candidates(&self, cfg: &ServiceConfig, req: &Request, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        let in_tokens = req
            .estimated_input_tokens
            .unwrap_or_else(|| req.prompt.len().div_ceil(4) as u64) as f64;
        let out_tokens = req
            .estimated_output_tokens
            .or(req.max_tokens.map(|m| m as u64))
            .unwrap_or(256) as f64;
        let preference_rank: HashMap<&str, usize> = cfg
            .routing
            .provider_preference_order
            .iter()
            .enumerate()
            .map(|(i, name)| (name.as_str(), i))
            .collect();

        let mut states: HashMap<String, CircuitState> = HashMap::with_capacity(candidates.len());
        for candidate in &candidates {
            let key = circuit_key(&candidate.provider, &req.context.region);
            states.insert(candidate.provider.clone(), self.circuit.get_state(&key).await);
        }

        let weights = &cfg.routing.weights;
        let sort_by_score = |items: &mut [Candidate]| {
            items.sort_by(|a, b| {
                let state_a = &states[&a.provider];
                let state_b = &states[&b.provider];
                weighted_score(weights, a, in_tokens, out_tokens, state_a)
                    .partial_cmp(&weighted_score(weights, b, in_tokens, out_tokens, state_b))
                    .unwrap_or(Ordering::Equal)
                    .then_with(|| {
                        let rank_a = preference_rank.get(a.provider.as_str()).copied().unwrap_or(usize::MAX);
                        let rank_b = preference_rank.get(b.provider.as_str()).copied().unwrap_or(usize::MAX);
                        rank_a.cmp(&rank_b)
                    })
            });
        };

        if let Some(preferred) = &req.preferred_provider {
            if !candidates.is_empty() && &candidates[0].provider == preferred {
                let head = candidates.remove(0);
                sort_by_score(&mut candidates);
                let mut ordered = Vec::with_capacity(candidates.len() + 1);
                ordered.push(head);
                ordered.extend(candidates);
                return ordered;
            }
        }

        sort_by_score(&mut candidates);
        candidates
    }

    async fn adapter_for(&self, cfg: &ServiceConfig, provider: &str, region: &str) -> Option<Arc<dyn ProviderAdapter>> {
        let key = circuit_key(provider, region);
        {
            let adapters = self.adapters.read().await;
            if let Some(adapter) = adapters.get(&key) {
                return Some(adapter.clone());
            }
        }

        let provider_cfg = cfg.providers.get(provider)?;
        let adapter: Arc<dyn ProviderAdapter> = match provider {
            "openai" => Arc::new(OpenAiAdapter::new(
                self.secret_store.clone(),
                provider_cfg.secret_id.clone(),
                self.env.clone(),
                region.to_string(),
                provider_cfg.rate_limits.tpm,
            )),
            "anthropic" => Arc::new(AnthropicAdapter::new(
                self.secret_store.clone(),
                provider_cfg.secret_id.clone(),
                self.env.clone(),
                region.to_string(),
                provider_cfg.rate_limits.tpm,
            )),
            _ => return None,
        };

        let mut adapters = self.adapters.write().await;
        let adapter = adapters.entry(key).or_insert(adapter).clone();
        Some(adapter)
    }
}
