//! Request pacing: token bucket bounding how fast timed-out requests are
//! reissued.
//!
//! Each reissue costs 1 token. Empty bucket = the reissue waits for the
//! next poll. A rate of 0 means unlimited.

use tokio::time::Instant;

#[derive(Debug)]
pub struct RequestPacer {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl RequestPacer {
    pub fn new(per_second: u32) -> Self {
        let (capacity, refill_rate) = if per_second == 0 {
            (f64::INFINITY, f64::INFINITY)
        } else {
            // half a second of burst
            ((per_second as f64 / 2.0).max(1.0), per_second as f64)
        };
        Self {
            tokens: capacity,
            capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.refill_rate.is_infinite()
    }

    /// Returns true if a request may go out now.
    pub fn allow(&mut self) -> bool {
        if self.is_unlimited() {
            return true;
        }

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens.min(self.capacity)
    }
}
