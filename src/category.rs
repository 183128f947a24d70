//! Process-wide set of named admission categories.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::config::AdmissionConfig;
use crate::error::{AdmissionError, Result};
use crate::middleware::AdmissionMiddleware;
use crate::telemetry::{TelemetryStats, TelemetrySummary};

/// A key ranked by how often it was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitedKey {
    pub category: String,
    pub key: String,
    pub limited_requests: u64,
}

/// Aggregate health of admission control across all categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

impl HealthLevel {
    /// More than 10% limited is degraded, more than 30% critical.
    pub fn from_limit_rate(limit_rate: f64) -> Self {
        if limit_rate > 0.3 {
            HealthLevel::Critical
        } else if limit_rate > 0.1 {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        }
    }
}

/// Built once at startup; owns one [`AdmissionMiddleware`] per category.
#[derive(Debug, Default)]
pub struct CategoryRegistry {
    categories: BTreeMap<String, Arc<AdmissionMiddleware>>,
    admin_role: String,
    idle_threshold: Duration,
    trust_gateway_headers: bool,
}

impl CategoryRegistry {
    pub fn from_config(config: &AdmissionConfig) -> Result<Self> {
        config.validate()?;

        let mut categories = BTreeMap::new();
        for (name, policy) in &config.categories {
            let middleware = AdmissionMiddleware::from_config(
                name,
                policy,
                config.telemetry.window,
                config.enabled,
            )?;
            info!(
                category = %name,
                enabled = middleware.is_enabled(),
                default_rate = ?policy.default_rate,
                default_burst = ?policy.default_burst,
                "admission category ready"
            );
            categories.insert(name.clone(), Arc::new(middleware));
        }

        Ok(Self {
            categories,
            admin_role: config.admin_role.clone(),
            idle_threshold: config.cleanup.idle_threshold,
            trust_gateway_headers: config.trust_gateway_headers,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<AdmissionMiddleware>> {
        self.categories.get(name).cloned()
    }

    /// Like [`get`](Self::get) but an unknown name is an error, for wiring
    /// routes at startup.
    pub fn require(&self, name: &str) -> Result<Arc<AdmissionMiddleware>> {
        self.get(name)
            .ok_or_else(|| AdmissionError::CategoryNotFound(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<AdmissionMiddleware>)> {
        self.categories.iter().map(|(name, mw)| (name.as_str(), mw))
    }

    pub fn admin_role(&self) -> &str {
        &self.admin_role
    }

    /// Whether identities may be taken from gateway headers.
    pub fn trusts_gateway_headers(&self) -> bool {
        self.trust_gateway_headers
    }

    pub fn idle_threshold(&self) -> Duration {
        self.idle_threshold
    }

    /// Evict idle limiters and reset stale telemetry in every category.
    /// Returns `(evicted, reset)` totals.
    pub fn run_cleanup(&self) -> (usize, usize) {
        let mut evicted = 0;
        let mut reset = 0;
        for middleware in self.categories.values() {
            evicted += middleware.limiter().evict(self.idle_threshold);
            reset += middleware.telemetry().sweep();
        }
        (evicted, reset)
    }

    pub fn all_stats(&self) -> BTreeMap<String, BTreeMap<String, TelemetryStats>> {
        self.categories
            .iter()
            .filter(|(_, mw)| mw.is_enabled())
            .map(|(name, mw)| (name.clone(), mw.telemetry().all_stats()))
            .collect()
    }

    /// Statistics for `key` in every category that has seen it.
    pub fn key_stats(&self, key: &str) -> Result<BTreeMap<String, TelemetryStats>> {
        let found: BTreeMap<_, _> = self
            .categories
            .iter()
            .filter_map(|(name, mw)| mw.telemetry().stats(key).map(|s| (name.clone(), s)))
            .collect();

        if found.is_empty() {
            return Err(AdmissionError::KeyNotFound(key.to_string()));
        }
        Ok(found)
    }

    /// Most-limited keys across categories (or within one), descending by
    /// denial count with ties broken by category then key.
    pub fn top_limited(&self, n: usize, category: Option<&str>) -> Result<Vec<LimitedKey>> {
        let selected: Vec<(&String, &Arc<AdmissionMiddleware>)> = match category {
            Some(name) => {
                let entry = self
                    .categories
                    .get_key_value(name)
                    .ok_or_else(|| AdmissionError::CategoryNotFound(name.to_string()))?;
                vec![entry]
            }
            None => self.categories.iter().collect(),
        };

        let mut ranked: Vec<LimitedKey> = selected
            .into_iter()
            .flat_map(|(name, mw)| {
                mw.telemetry()
                    .top_limited_with_counts(n)
                    .into_iter()
                    .map(move |(key, limited_requests)| LimitedKey {
                        category: name.clone(),
                        key,
                        limited_requests,
                    })
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.limited_requests
                .cmp(&a.limited_requests)
                .then_with(|| a.category.cmp(&b.category))
                .then_with(|| a.key.cmp(&b.key))
        });
        ranked.truncate(n);
        Ok(ranked)
    }

    /// Totals across every category. The latency average is the mean of
    /// the non-zero per-key averages, wherever those keys live.
    pub fn summary(&self) -> TelemetrySummary {
        let mut total = TelemetrySummary::default();
        for middleware in self.categories.values() {
            total.merge(&middleware.telemetry().summary());
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_generator::{CallerContext, KeyStrategy};
    use crate::policy::PolicyConfig;

    fn registry() -> CategoryRegistry {
        CategoryRegistry::from_config(&AdmissionConfig::default()).unwrap()
    }

    #[test]
    fn test_default_registry() {
        let registry = registry();
        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, vec!["auth", "general", "speech", "upload"]);
        assert!(registry.get("auth").unwrap().is_enabled());
        assert!(registry.get("video").is_none());
        assert!(matches!(registry.require("video"), Err(AdmissionError::CategoryNotFound(_))));
    }

    #[test]
    fn test_misconfigured_category_fails_startup() {
        let mut config = AdmissionConfig::default();
        config.categories.insert(
            "upload".to_string(),
            PolicyConfig {
                default_burst: None,
                ..PolicyConfig::new(5.0, 10, KeyStrategy::Origin)
            },
        );
        let err = CategoryRegistry::from_config(&config).unwrap_err();
        assert!(matches!(err, AdmissionError::PolicyMisconfigured { .. }));
    }

    #[test]
    fn test_global_switch_disables_all() {
        let config = AdmissionConfig {
            enabled: false,
            ..AdmissionConfig::default()
        };
        let registry = CategoryRegistry::from_config(&config).unwrap();
        assert!(registry.iter().all(|(_, mw)| !mw.is_enabled()));
    }

    #[test]
    fn test_categories_are_independent() {
        let registry = registry();
        let caller = CallerContext::anonymous("10.1.1.1");
        let auth = registry.get("auth").unwrap();
        for _ in 0..21 {
            auth.admit(&caller);
        }

        assert!(registry.get("general").unwrap().admit(&caller).is_allowed());
        assert_eq!(registry.get("general").unwrap().limiter().len(), 1);
    }

    #[test]
    fn test_aggregates() {
        let registry = registry();
        let caller = CallerContext::anonymous("10.2.2.2");
        let auth = registry.get("auth").unwrap();
        for _ in 0..25 {
            auth.admit(&caller);
        }
        registry.get("general").unwrap().admit(&caller);

        let top = registry.top_limited(10, None).unwrap();
        assert_eq!(top[0].category, "auth");
        assert_eq!(top[0].key, "ip:10.2.2.2");
        assert_eq!(top[0].limited_requests, 5);

        let only_general = registry.top_limited(10, Some("general")).unwrap();
        assert_eq!(only_general.len(), 1);
        assert_eq!(only_general[0].limited_requests, 0);

        let stats = registry.key_stats("ip:10.2.2.2").unwrap();
        assert_eq!(stats.len(), 2);
        assert!(matches!(registry.key_stats("ip:0.0.0.0"), Err(AdmissionError::KeyNotFound(_))));

        let summary = registry.summary();
        assert_eq!(summary.total_requests, 26);
        assert_eq!(summary.total_limited, 5);
        assert_eq!(HealthLevel::from_limit_rate(summary.overall_limit_rate), HealthLevel::Degraded);
    }

    #[test]
    fn test_summary_latency_is_per_key_mean() {
        let registry = registry();
        registry
            .get("auth")
            .unwrap()
            .telemetry()
            .record("ip:a", false, Duration::from_millis(10));
        let general = registry.get("general").unwrap();
        for key in ["ip:b", "ip:c", "ip:d"] {
            general.telemetry().record(key, false, Duration::from_millis(100));
        }

        let summary = registry.summary();
        assert_eq!(summary.active_keys, 4);
        assert_eq!(summary.latency_keys, 4);
        assert_eq!(summary.avg_response_time_ms, 77.5);
    }

    #[test]
    fn test_health_thresholds() {
        assert_eq!(HealthLevel::from_limit_rate(0.0), HealthLevel::Healthy);
        assert_eq!(HealthLevel::from_limit_rate(0.1), HealthLevel::Healthy);
        assert_eq!(HealthLevel::from_limit_rate(0.11), HealthLevel::Degraded);
        assert_eq!(HealthLevel::from_limit_rate(0.3), HealthLevel::Degraded);
        assert_eq!(HealthLevel::from_limit_rate(0.31), HealthLevel::Critical);
    }

    #[test]
    fn test_run_cleanup() {
        let registry = registry();
        registry.get("auth").unwrap().admit(&CallerContext::anonymous("10.3.3.3"));
        // Nothing is idle yet
        assert_eq!(registry.run_cleanup(), (0, 0));
    }
}
