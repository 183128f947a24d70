use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::{AdmissionError, Result};
use crate::policy::{PolicyConfig, RoleLimit};

static CATEGORY_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9_-]{0,63}$").expect("category name pattern"));

/// Validates configuration objects for consistency and correctness
pub struct ConfigValidator;

impl ConfigValidator {
    /// Category names appear in URLs and log fields.
    pub fn validate_category_name(name: &str) -> Result<()> {
        if !CATEGORY_NAME.is_match(name) {
            return Err(AdmissionError::Config(format!(
                "Invalid category name '{}': expected lowercase letters, digits, '-' or '_'",
                name
            )));
        }

        Ok(())
    }

    /// Validates one rate/burst pair
    pub fn validate_limit(limit: &RoleLimit) -> std::result::Result<(), String> {
        if !limit.rate.is_finite() || limit.rate <= 0.0 {
            return Err(format!("rate must be a positive number, got {}", limit.rate));
        }

        if limit.burst == 0 {
            return Err("burst must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Validates a category policy and returns its default limit.
    ///
    /// Disabled categories are never resolved, so their defaults may be
    /// missing; a placeholder limit is returned for them.
    pub fn validate_policy(category: &str, config: &PolicyConfig) -> Result<RoleLimit> {
        let misconfigured = |reason: String| AdmissionError::PolicyMisconfigured {
            category: category.to_string(),
            reason,
        };

        Self::validate_category_name(category)?;

        let default_limit = match (config.default_rate, config.default_burst) {
            (Some(rate), Some(burst)) => RoleLimit::new(rate, burst),
            _ if !config.enabled => return Ok(RoleLimit::new(0.0, 0)),
            (None, _) => return Err(misconfigured("default_rate is not set".to_string())),
            (_, None) => return Err(misconfigured("default_burst is not set".to_string())),
        };

        if !config.enabled {
            return Ok(default_limit);
        }

        Self::validate_limit(&default_limit).map_err(|e| misconfigured(format!("default {}", e)))?;

        for (role, limit) in &config.role_limits {
            Self::validate_limit(limit)
                .map_err(|e| misconfigured(format!("role '{}': {}", role, e)))?;
        }

        Ok(default_limit)
    }

    /// Validates a scheduling interval or threshold
    pub fn validate_duration(name: &str, value: Duration) -> Result<()> {
        if value.is_zero() {
            return Err(AdmissionError::Config(format!("{} must be greater than 0", name)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_generator::KeyStrategy;

    #[test]
    fn test_valid_category_name() {
        assert!(ConfigValidator::validate_category_name("general").is_ok());
        assert!(ConfigValidator::validate_category_name("speech_v2").is_ok());
    }

    #[test]
    fn test_invalid_category_name() {
        assert!(ConfigValidator::validate_category_name("").is_err());
        assert!(ConfigValidator::validate_category_name("Upload").is_err());
        assert!(ConfigValidator::validate_category_name("a/b").is_err());
    }

    #[test]
    fn test_invalid_limit() {
        assert!(ConfigValidator::validate_limit(&RoleLimit::new(0.0, 10)).is_err());
        assert!(ConfigValidator::validate_limit(&RoleLimit::new(f64::NAN, 10)).is_err());
        assert!(ConfigValidator::validate_limit(&RoleLimit::new(5.0, 0)).is_err());
        assert!(ConfigValidator::validate_limit(&RoleLimit::new(0.5, 1)).is_ok());
    }

    #[test]
    fn test_bad_role_override_is_misconfigured() {
        let config = PolicyConfig::new(10.0, 20, KeyStrategy::Origin).with_role("member", 10.0, 0);
        let err = ConfigValidator::validate_policy("auth", &config).unwrap_err();
        assert!(err.to_string().contains("role 'member'"));
    }

    #[test]
    fn test_disabled_policy_without_defaults() {
        let config = PolicyConfig::default().disabled();
        assert!(ConfigValidator::validate_policy("upload", &config).is_ok());
    }

    #[test]
    fn test_zero_duration() {
        assert!(ConfigValidator::validate_duration("cleanup.interval", Duration::ZERO).is_err());
        assert!(ConfigValidator::validate_duration("cleanup.interval", Duration::from_secs(1)).is_ok());
    }
}
