//! Key generation utilities for admission control.

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tokio_util::sync::CancellationToken;

/// Strategy for deriving the key a caller is limited under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Always key by network origin, even for authenticated callers.
    /// Rotating identities from one address does not earn more slots.
    #[default]
    Origin,
    /// Key by authenticated identity when present, else by origin.
    IdentityOrOrigin,
}

/// Authenticated caller, as established by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.into(),
        }
    }
}

/// Everything the admission check needs to know about one request.
#[derive(Debug, Clone)]
pub struct CallerContext {
    pub origin: String,
    pub identity: Option<Identity>,
    pub cancel: CancellationToken,
}

impl CallerContext {
    pub fn anonymous(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            identity: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn authenticated(origin: impl Into<String>, identity: Identity) -> Self {
        Self {
            origin: origin.into(),
            identity: Some(identity),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Role of the caller; untagged callers have the empty role.
    pub fn role(&self) -> &str {
        self.identity.as_ref().map(|i| i.role.as_str()).unwrap_or("")
    }

    pub fn key(&self, strategy: KeyStrategy) -> String {
        match (strategy, &self.identity) {
            (KeyStrategy::IdentityOrOrigin, Some(identity)) if !identity.user_id.is_empty() => {
                format!("user:{}", identity.user_id)
            }
            _ => format!("ip:{}", self.origin),
        }
    }
}

/// Extract the client origin from proxy headers, falling back to the
/// socket peer address.
pub fn extract_client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(first_ip) = header("x-forwarded-for").and_then(|xff| xff.split(',').next()) {
        let first_ip = first_ip.trim();
        if !first_ip.is_empty() {
            return first_ip.to_string();
        }
    }

    if let Some(real_ip) = header("x-real-ip") {
        return real_ip.to_string();
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Build an identity from trusted gateway headers.
pub fn identity_from_headers(headers: &HeaderMap) -> Option<Identity> {
    let user_id = headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())?;
    let role = headers
        .get("x-user-role")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .unwrap_or("");

    Some(Identity::new(user_id, role))
}
