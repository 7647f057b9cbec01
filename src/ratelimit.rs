//! Rate & Capacity Control: independent token buckets for
//! system-wide shaping and per-machine hard limits.

use std::sync::Mutex;
use std::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// A classic token bucket: refills continuously at `refill_rate` tokens per
/// second up to `capacity`, and each `try_acquire` spends one token.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `rate_per_sec` is the steady-state throughput; `burst` is the maximum
    /// number of tokens the bucket can bank (sustained rate may exceed the
    /// target briefly via bucket burst capacity, default 2x).
    pub fn new(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            capacity: burst.max(rate_per_sec),
            refill_rate: rate_per_sec,
            state: Mutex::new(BucketState {
                tokens: burst.max(rate_per_sec),
                last_refill: Instant::now(),
            }),
        }
    }

    /// Attempt to spend one token. Returns `true` if a token was available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("token bucket poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
