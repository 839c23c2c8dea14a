//! Per-adapter-instance leaky/refilling token bucket used for local RPM/TPM
//! admission control ahead of the vendor call.

use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    refill_rate_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `capacity = tpm`, `refillRate = tpm / 60` tokens per second.
    pub fn new(tpm: u32) -> Self {
        let capacity = tpm as f64;
        Self {
            capacity,
            refill_rate_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Refills based on elapsed time, then deducts `n` tokens if available.
    pub async fn consume(&self, n: u64) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        let refill = (elapsed * self.refill_rate_per_sec).floor();
        if refill > 0.0 {
            state.tokens = (state.tokens + refill).min(self.capacity);
            state.last_refill = now;
        }

        let n = n as f64;
        if state.tokens >= n {
            state.tokens -= n;
            true
        } else {
            false
        }
    }

    #[cfg(test)]
    pub async fn available(&self) -> f64 {
        self.state.lock().await.tokens
    }
}

/// `ceil(promptLen/4) + ceil(historyLen/4) + (maxTokens ?? 1024)`.
pub fn estimate_tokens(prompt_len: usize, history_len: usize, max_tokens: Option<u32>) -> u64 {
    let prompt_tokens = prompt_len.div_ceil(4) as u64;
    let history_tokens = history_len.div_ceil(4) as u64;
    prompt_tokens + history_tokens + max_tokens.unwrap_or(1024) as u64
}
