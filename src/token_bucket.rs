use std::time::{Duration, Instant};

/// A single lazily refilled token bucket.
///
/// Tokens are never topped up by a timer: every access first credits
/// `elapsed * refill_rate` tokens, capped at `capacity`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::new_at(capacity, refill_rate, Instant::now())
    }

    pub fn new_at(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate: refill_rate.max(0.0),
            last_refill: now,
        }
    }

    /// Take one token if available.
    pub fn allow(&mut self) -> bool {
        self.allow_at(Instant::now())
    }

    pub fn allow_at(&mut self, now: Instant) -> bool {
        self.refill(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available_tokens(&mut self) -> u32 {
        self.available_tokens_at(Instant::now())
    }

    pub fn available_tokens_at(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens.floor() as u32
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Adopt a new rate and burst without losing accumulated state.
    ///
    /// Tokens earned so far are credited at the old rate before the new
    /// parameters take effect, then clamped to the new capacity.
    pub fn reconfigure_at(&mut self, refill_rate: f64, capacity: u32, now: Instant) {
        let refill_rate = refill_rate.max(0.0);
        if refill_rate == self.refill_rate && capacity == self.capacity {
            return;
        }

        self.refill(now);
        self.refill_rate = refill_rate;
        self.capacity = capacity;
        if self.tokens > capacity as f64 {
            self.tokens = capacity as f64;
        }
    }

    /// How long until `required_tokens` can be taken, or `None` if they
    /// can be taken now. Returns `Duration::MAX` when the bucket can never
    /// hold that many tokens.
    pub fn time_until_available(&mut self, required_tokens: u32) -> Option<Duration> {
        self.time_until_available_at(required_tokens, Instant::now())
    }

    pub fn time_until_available_at(&mut self, required_tokens: u32, now: Instant) -> Option<Duration> {
        self.refill(now);

        if self.tokens >= required_tokens as f64 {
            return None;
        }

        if required_tokens > self.capacity || self.refill_rate <= 0.0 {
            return Some(Duration::MAX);
        }

        let tokens_needed = required_tokens as f64 - self.tokens;
        let seconds_to_wait = tokens_needed / self.refill_rate;

        Some(Duration::try_from_secs_f64(seconds_to_wait).unwrap_or(Duration::MAX))
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }

        let tokens_to_add = self.refill_rate * elapsed.as_secs_f64();
        self.tokens = (self.tokens + tokens_to_add).min(self.capacity as f64);
        self.last_refill = now;
    }
}
