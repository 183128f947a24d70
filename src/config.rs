use clap::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config_validator::ConfigValidator;
use crate::error::Result;
use crate::key_generator::KeyStrategy;
use crate::policy::PolicyConfig;
use crate::rate_limiter::DEFAULT_IDLE_THRESHOLD;
use crate::telemetry::DEFAULT_TIME_WINDOW;

/// Process settings, read from flags or the environment.
#[derive(Debug, Clone, Parser)]
#[command(name = "admission", version, about = "Token-bucket admission control service")]
pub struct Config {
    /// Server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Log level for the admission crate
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// YAML policy file; built-in defaults are used when absent
    #[arg(long = "config", env = "ADMISSION_CONFIG")]
    pub policy_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from flags and environment variables
    pub fn from_env() -> Self {
        Config::parse()
    }

    pub fn load_policy(&self) -> Result<AdmissionConfig> {
        match &self.policy_file {
            Some(path) => AdmissionConfig::from_file(path),
            None => Ok(AdmissionConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// How often idle limiters are evicted and stale telemetry reset
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Limiters unused for longer than this are evicted
    #[serde(with = "humantime_serde")]
    pub idle_threshold: Duration,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            idle_threshold: DEFAULT_IDLE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    #[serde(with = "humantime_serde")]
    pub window: Duration,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_TIME_WINDOW,
        }
    }
}

/// Admission policy for every category, usually loaded from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Master switch; when false every category passes through
    pub enabled: bool,
    /// Role allowed to read the administrative statistics
    pub admin_role: String,
    /// Build caller identities from `X-User-Id` / `X-User-Role`. Only
    /// enable behind a gateway that strips these headers from clients.
    pub trust_gateway_headers: bool,
    pub cleanup: CleanupConfig,
    pub telemetry: TelemetryConfig,
    pub categories: BTreeMap<String, PolicyConfig>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        let mut categories = BTreeMap::new();
        categories.insert(
            "general".to_string(),
            PolicyConfig::new(100.0, 200, KeyStrategy::Origin)
                .with_role("member", 300.0, 600)
                .with_skip_role("super_admin"),
        );
        categories.insert(
            "upload".to_string(),
            PolicyConfig::new(5.0, 10, KeyStrategy::IdentityOrOrigin)
                .with_role("member", 20.0, 40)
                .with_skip_role("super_admin"),
        );
        categories.insert(
            "speech".to_string(),
            PolicyConfig::new(50.0, 100, KeyStrategy::IdentityOrOrigin)
                .with_role("member", 200.0, 400)
                .with_role("admin", 1000.0, 2000)
                .with_skip_role("super_admin"),
        );
        categories.insert(
            "auth".to_string(),
            PolicyConfig::new(10.0, 20, KeyStrategy::Origin),
        );

        Self {
            enabled: true,
            admin_role: "super_admin".to_string(),
            trust_gateway_headers: false,
            cleanup: CleanupConfig::default(),
            telemetry: TelemetryConfig::default(),
            categories,
        }
    }
}

impl AdmissionConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: AdmissionConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    /// Checks the process-level settings. Category policies are validated
    /// when the category registry is built.
    pub fn validate(&self) -> Result<()> {
        ConfigValidator::validate_duration("cleanup.interval", self.cleanup.interval)?;
        ConfigValidator::validate_duration("cleanup.idle_threshold", self.cleanup.idle_threshold)?;
        ConfigValidator::validate_duration("telemetry.window", self.telemetry.window)?;
        Ok(())
    }
}
