//! Per-category admission policy and its resolution against a caller.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::config_validator::ConfigValidator;
use crate::error::Result;
use crate::key_generator::{CallerContext, KeyStrategy};

pub const DEFAULT_DENY_MESSAGE: &str = "Too many requests, please retry later";

/// Rate (tokens per second) and burst (bucket capacity) pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoleLimit {
    pub rate: f64,
    pub burst: u32,
}

impl RoleLimit {
    pub fn new(rate: f64, burst: u32) -> Self {
        Self { rate, burst }
    }
}

/// Policy for one category, as written in the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub enabled: bool,
    pub default_rate: Option<f64>,
    pub default_burst: Option<u32>,
    pub role_limits: HashMap<String, RoleLimit>,
    pub skip_roles: Vec<String>,
    pub key_strategy: KeyStrategy,
    pub deny_message: String,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_rate: None,
            default_burst: None,
            role_limits: HashMap::new(),
            skip_roles: Vec::new(),
            key_strategy: KeyStrategy::Origin,
            deny_message: DEFAULT_DENY_MESSAGE.to_string(),
        }
    }
}

impl PolicyConfig {
    pub fn new(default_rate: f64, default_burst: u32, key_strategy: KeyStrategy) -> Self {
        Self {
            default_rate: Some(default_rate),
            default_burst: Some(default_burst),
            key_strategy,
            ..Self::default()
        }
    }

    pub fn with_role(mut self, role: impl Into<String>, rate: f64, burst: u32) -> Self {
        self.role_limits.insert(role.into(), RoleLimit::new(rate, burst));
        self
    }

    pub fn with_skip_role(mut self, role: impl Into<String>) -> Self {
        self.skip_roles.push(role.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Outcome of resolving a caller against a category policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub key: String,
    pub rate: f64,
    pub burst: u32,
    pub skip: bool,
}

/// A validated category policy. Resolution is a pure lookup evaluated on
/// every request, so tier changes take effect without touching limiter
/// state.
#[derive(Debug, Clone)]
pub struct CategoryPolicy {
    name: String,
    default_limit: RoleLimit,
    role_limits: HashMap<String, RoleLimit>,
    skip_roles: HashSet<String>,
    key_strategy: KeyStrategy,
    deny_message: String,
}

impl CategoryPolicy {
    pub fn from_config(name: &str, config: &PolicyConfig) -> Result<Self> {
        let default_limit = ConfigValidator::validate_policy(name, config)?;

        Ok(Self {
            name: name.to_string(),
            default_limit,
            role_limits: config.role_limits.clone(),
            skip_roles: config.skip_roles.iter().cloned().collect(),
            key_strategy: config.key_strategy,
            deny_message: config.deny_message.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn deny_message(&self) -> &str {
        &self.deny_message
    }

    pub fn key_strategy(&self) -> KeyStrategy {
        self.key_strategy
    }

    pub fn limits_for_role(&self, role: &str) -> RoleLimit {
        self.role_limits
            .get(role)
            .copied()
            .unwrap_or(self.default_limit)
    }

    pub fn is_exempt(&self, role: &str) -> bool {
        !role.is_empty() && self.skip_roles.contains(role)
    }

    pub fn resolve(&self, caller: &CallerContext) -> Resolution {
        let role = caller.role();
        let limit = self.limits_for_role(role);

        Resolution {
            key: caller.key(self.key_strategy),
            rate: limit.rate,
            burst: limit.burst,
            skip: self.is_exempt(role),
        }
    }
}
