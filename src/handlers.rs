use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::category::CategoryRegistry;
use crate::error::{AdmissionError, Result};
use crate::health::HealthChecker;
use crate::key_generator::Identity;
use crate::middleware::Admission;
use crate::response::{ApiResponse, CheckResponse};
use crate::validation::{clamp_top_limit, CheckRequest};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<CategoryRegistry>,
    pub health: HealthChecker,
}

impl AppState {
    pub fn new(registry: Arc<CategoryRegistry>) -> Self {
        Self {
            health: HealthChecker::new(registry.clone()),
            registry,
        }
    }

    fn require_admin(&self, identity: Option<&Identity>) -> Result<()> {
        match identity {
            Some(identity) if identity.role == self.registry.admin_role() => Ok(()),
            _ => Err(AdmissionError::Forbidden),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TopLimitedQuery {
    pub limit: Option<usize>,
    pub category: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TopLimitedData<T> {
    pub top_limited_keys: T,
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct KeyStatsData<T> {
    pub key: String,
    pub stats: T,
}

/// Check admission for a caller on behalf of another service
pub async fn check_admission(
    State(state): State<AppState>,
    Path(category): Path<String>,
    Json(payload): Json<CheckRequest>,
) -> Result<Response> {
    let middleware = state
        .registry
        .get(&category)
        .ok_or(AdmissionError::CategoryNotFound(category))?;
    let caller = payload.into_caller()?;

    let response = match middleware.admit(&caller) {
        Admission::PassThrough | Admission::Bypassed => Json(CheckResponse::bypassed()).into_response(),
        Admission::Allowed(headers) => {
            let mut response = Json(CheckResponse::allowed(&headers)).into_response();
            headers.apply(response.headers_mut());
            response
        }
        Admission::Denied(rejection) => rejection.into_response(),
    };

    Ok(response)
}

/// All per-key statistics, grouped by category
pub async fn get_stats(
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
) -> Result<impl IntoResponse> {
    state.require_admin(identity.as_deref())?;

    Ok(ApiResponse::new(
        state.registry.all_stats(),
        "Rate limit statistics",
    ))
}

/// Most-limited keys
pub async fn get_top_limited(
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
    Query(query): Query<TopLimitedQuery>,
) -> Result<impl IntoResponse> {
    state.require_admin(identity.as_deref())?;

    let limit = clamp_top_limit(query.limit);
    let top = state
        .registry
        .top_limited(limit, query.category.as_deref())?;

    Ok(ApiResponse::new(
        TopLimitedData {
            top_limited_keys: top,
            limit,
        },
        "Most limited keys",
    ))
}

/// Statistics for one key
pub async fn get_key_stats(
    State(state): State<AppState>,
    identity: Option<Extension<Identity>>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse> {
    state.require_admin(identity.as_deref())?;

    let stats = state.registry.key_stats(&key)?;
    Ok(ApiResponse::new(
        KeyStatsData { key, stats },
        "Key statistics",
    ))
}

/// Aggregate admission health
pub async fn get_admission_health(State(state): State<AppState>) -> impl IntoResponse {
    ApiResponse::new(
        state.health.admission_health(),
        "Rate limit health",
    )
}

/// Health check endpoint
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.health.check_health())
}

/// Readiness check endpoint
pub async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let categories: Vec<&str> = state.registry.names().collect();
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "ready",
            "categories": categories,
        })),
    )
}
