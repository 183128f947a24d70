use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{AdmissionError, Result};
use crate::token_bucket::TokenBucket;

pub const DEFAULT_IDLE_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// Result of a single admission attempt against a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    /// Whole tokens left after this attempt.
    pub remaining: u32,
    /// Time until the next token is available; zero when one is available now.
    pub retry_after: Duration,
}

/// A bucket and the last time its key was touched. Keeping both in one
/// entry means a key can never have one without the other.
#[derive(Debug)]
struct Entry {
    bucket: TokenBucket,
    last_access: Instant,
}

/// Owns the per-key token buckets of one category.
///
/// Every mutation happens under one exclusive lock. Token arithmetic is
/// O(1), so the critical section stays short.
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one token for `key`, creating its bucket on first use.
    pub fn allow(&self, key: &str, rate: f64, burst: u32) -> bool {
        self.check(key, rate, burst).allowed
    }

    /// Like [`allow`](Self::allow), also returning the header hints.
    pub fn check(&self, key: &str, rate: f64, burst: u32) -> Decision {
        self.check_at(key, rate, burst, Instant::now())
    }

    pub fn check_at(&self, key: &str, rate: f64, burst: u32, now: Instant) -> Decision {
        let mut entries = self.entries.lock();
        let entry = Self::touch(&mut entries, key, rate, burst, now);

        let allowed = entry.bucket.allow_at(now);
        let remaining = entry.bucket.available_tokens_at(now);
        let retry_after = entry
            .bucket
            .time_until_available_at(1, now)
            .unwrap_or(Duration::ZERO);

        Decision {
            allowed,
            remaining,
            retry_after,
        }
    }

    /// Wait until a token for `key` is available or `cancel` fires.
    ///
    /// The lock is never held across the sleep; each wake-up re-checks the
    /// bucket with freshly supplied parameters.
    pub async fn wait(
        &self,
        key: &str,
        rate: f64,
        burst: u32,
        cancel: &CancellationToken,
    ) -> Result<Decision> {
        loop {
            if cancel.is_cancelled() {
                return Err(AdmissionError::Cancelled);
            }

            let delay = {
                let now = Instant::now();
                let mut entries = self.entries.lock();
                let entry = Self::touch(&mut entries, key, rate, burst, now);
                if entry.bucket.allow_at(now) {
                    return Ok(Decision {
                        allowed: true,
                        remaining: entry.bucket.available_tokens_at(now),
                        retry_after: entry
                            .bucket
                            .time_until_available_at(1, now)
                            .unwrap_or(Duration::ZERO),
                    });
                }
                entry
                    .bucket
                    .time_until_available_at(1, now)
                    .unwrap_or(Duration::ZERO)
            };

            if delay == Duration::MAX {
                // The bucket can never refill; only cancellation ends the wait.
                cancel.cancelled().await;
                return Err(AdmissionError::Cancelled);
            }

            debug!(key = %key, delay_ms = delay.as_millis() as u64, "waiting for token");
            tokio::select! {
                _ = cancel.cancelled() => return Err(AdmissionError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Drop buckets whose key has not been seen for longer than `idle_threshold`.
    pub fn evict(&self, idle_threshold: Duration) -> usize {
        self.evict_at(idle_threshold, Instant::now())
    }

    pub fn evict_at(&self, idle_threshold: Duration, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let initial_count = entries.len();

        entries.retain(|_, entry| now.saturating_duration_since(entry.last_access) <= idle_threshold);

        let evicted = initial_count - entries.len();
        if evicted > 0 {
            info!(evicted, remaining = entries.len(), "evicted idle rate limiters");
        }
        evicted
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn touch<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        rate: f64,
        burst: u32,
        now: Instant,
    ) -> &'a mut Entry {
        let entry = entries.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, rate, burst, "creating rate limiter");
            Entry {
                bucket: TokenBucket::new_at(burst, rate, now),
                last_access: now,
            }
        });

        entry.bucket.reconfigure_at(rate, burst, now);
        entry.last_access = now;
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_token_conservation() {
        let registry = LimiterRegistry::new();
        let start = Instant::now();

        for _ in 0..10 {
            assert!(registry.check_at("ip:1.1.1.1", 5.0, 10, start).allowed);
        }
        assert!(!registry.check_at("ip:1.1.1.1", 5.0, 10, start).allowed);

        // One refill interval later exactly one more call is admitted
        let later = start + Duration::from_millis(200);
        assert!(registry.check_at("ip:1.1.1.1", 5.0, 10, later).allowed);
        assert!(!registry.check_at("ip:1.1.1.1", 5.0, 10, later).allowed);
    }

    #[test]
    fn test_key_isolation() {
        let registry = LimiterRegistry::new();
        let now = Instant::now();

        assert!(registry.check_at("ip:a", 1.0, 1, now).allowed);
        assert!(!registry.check_at("ip:a", 1.0, 1, now).allowed);
        assert!(registry.check_at("ip:b", 1.0, 1, now).allowed);
    }

    #[test]
    fn test_decision_hints() {
        let registry = LimiterRegistry::new();
        let now = Instant::now();

        let decision = registry.check_at("ip:a", 2.0, 3, now);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.retry_after, Duration::ZERO);

        registry.check_at("ip:a", 2.0, 3, now);
        registry.check_at("ip:a", 2.0, 3, now);
        let denied = registry.check_at("ip:a", 2.0, 3, now);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after, Duration::from_millis(500));
    }

    #[test]
    fn test_parameters_apply_to_existing_bucket() {
        let registry = LimiterRegistry::new();
        let now = Instant::now();

        assert!(registry.check_at("user:1", 1.0, 1, now).allowed);
        assert!(!registry.check_at("user:1", 1.0, 1, now).allowed);

        // Upgraded tier: larger burst, same bucket
        let later = now + Duration::from_secs(1);
        assert!(registry.check_at("user:1", 10.0, 5, later).allowed);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_idle_eviction() {
        let registry = LimiterRegistry::new();
        let start = Instant::now();
        let threshold = Duration::from_secs(60);

        registry.check_at("ip:stale", 1.0, 1, start);
        registry.check_at("ip:fresh", 1.0, 1, start + Duration::from_secs(50));

        let evicted = registry.evict_at(threshold, start + Duration::from_secs(61));
        assert_eq!(evicted, 1);
        assert!(!registry.contains("ip:stale"));
        assert!(registry.contains("ip:fresh"));
    }

    #[tokio::test]
    async fn test_wait_succeeds_after_refill() {
        let registry = LimiterRegistry::new();
        let cancel = CancellationToken::new();

        assert!(registry.allow("ip:w", 10.0, 1));
        tokio_test::assert_ok!(registry.wait("ip:w", 10.0, 1, &cancel).await);
        assert!(!registry.allow("ip:w", 10.0, 1));
    }

    #[tokio::test]
    async fn test_wait_is_cancelled() {
        let registry = Arc::new(LimiterRegistry::new());
        let cancel = CancellationToken::new();

        assert!(registry.allow("ip:c", 0.001, 1));

        let waiter = {
            let registry = registry.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { registry.wait("ip:c", 0.001, 1, &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should observe cancellation promptly")
            .unwrap();
        assert!(matches!(result, Err(AdmissionError::Cancelled)));
    }

    #[test]
    fn test_concurrent_access() {
        let registry = Arc::new(LimiterRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..50).filter(|_| registry.allow("ip:shared", 0.001, 100)).count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 100);
    }
}
