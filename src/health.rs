use serde::Serialize;
use std::sync::{Arc, LazyLock};
use std::time::SystemTime;

use crate::category::{CategoryRegistry, HealthLevel};
use crate::telemetry::TelemetrySummary;

/// Liveness report of the service process.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub categories: Vec<CategoryStatus>,
}

#[derive(Debug, Serialize)]
pub struct CategoryStatus {
    pub name: String,
    pub enabled: bool,
    pub active_limiters: usize,
}

/// Health of admission control itself, derived from how many requests
/// are being limited.
#[derive(Debug, Serialize)]
pub struct AdmissionHealth {
    pub status: HealthLevel,
    pub metrics: TelemetrySummary,
}

static START_TIME: LazyLock<SystemTime> = LazyLock::new(SystemTime::now);

#[derive(Clone)]
pub struct HealthChecker {
    registry: Arc<CategoryRegistry>,
}

impl HealthChecker {
    pub fn new(registry: Arc<CategoryRegistry>) -> Self {
        LazyLock::force(&START_TIME);
        Self { registry }
    }

    pub fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME)
            .unwrap_or_default()
            .as_secs();

        let categories = self
            .registry
            .iter()
            .map(|(name, middleware)| CategoryStatus {
                name: name.to_string(),
                enabled: middleware.is_enabled(),
                active_limiters: middleware.limiter().len(),
            })
            .collect();

        HealthStatus {
            status: "healthy".to_string(),
            timestamp: now.duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            categories,
        }
    }

    pub fn admission_health(&self) -> AdmissionHealth {
        let metrics = self.registry.summary();
        AdmissionHealth {
            status: HealthLevel::from_limit_rate(metrics.overall_limit_rate),
            metrics,
        }
    }
}
