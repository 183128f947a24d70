use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use validator::Validate;

use crate::error::{AdmissionError, Result};
use crate::key_generator::{CallerContext, Identity};

/// Caller context submitted to the sidecar check endpoint.
#[derive(Debug, Deserialize, Validate)]
pub struct CheckRequest {
    #[validate(length(min = 1, max = 256))]
    pub origin: String,
    #[validate(length(min = 1, max = 128))]
    pub user_id: Option<String>,
    #[validate(length(max = 64))]
    pub role: Option<String>,
}

impl CheckRequest {
    pub fn into_caller(self) -> Result<CallerContext> {
        self.validate()?;

        let origin = self.origin.trim().to_string();
        if origin.is_empty() {
            return Err(AdmissionError::Validation("origin cannot be blank".to_string()));
        }

        let caller = match (self.user_id, self.role) {
            (Some(user_id), role) => {
                CallerContext::authenticated(origin, Identity::new(user_id, role.unwrap_or_default()))
            }
            (None, Some(_)) => {
                return Err(AdmissionError::Validation(
                    "role requires user_id".to_string(),
                ))
            }
            (None, None) => CallerContext::anonymous(origin),
        };

        Ok(caller.with_cancel(CancellationToken::new()))
    }
}

/// Clamp a requested top-N size to `1..=100`, defaulting to 10.
pub fn clamp_top_limit(limit: Option<usize>) -> usize {
    match limit {
        Some(0) | None => 10,
        Some(n) => n.min(100),
    }
}
