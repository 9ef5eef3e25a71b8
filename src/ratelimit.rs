//! A small token-bucket rate limiter.
//!
//! The web route lets anyone point bridgestrap at an arbitrary address:port,
//! which would make a fine port scanner. A process-wide token bucket keeps
//! that in check: requests average out to `rate` per second with bursts of
//! up to `burst`.

use std::time::Instant;

use parking_lot::Mutex;

/// Token bucket allowing `rate` requests per second with bursts of `burst`.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Takes a token if one is available.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_empty() {
        let bucket = TokenBucket::new(1.0, 5.0);
        for _ in 0..5 {
            assert!(bucket.allow());
        }
        assert!(!bucket.allow());
    }

    #[test]
    fn test_refill() {
        let bucket = TokenBucket::new(1000.0, 1.0);
        assert!(bucket.allow());
        assert!(!bucket.allow());
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(bucket.allow());
    }
}
