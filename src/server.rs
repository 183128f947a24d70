use crate::category::CategoryRegistry;
use crate::config::{AdmissionConfig, Config};
use crate::error::Result;
use crate::handlers::{
    check_admission, get_admission_health, get_key_stats, get_stats, get_top_limited, health_check,
    readiness_check, AppState,
};
use crate::middleware::{enforce, gateway_identity, logging_middleware};
use crate::response::{X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};
use crate::scheduler::CleanupScheduler;
use axum::http::HeaderName;
use axum::routing::{get, post};
use axum::{middleware, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the HTTP application around an already constructed registry.
///
/// The administrative routes sit behind the `general` category when it is
/// configured. Gateway identity headers are honoured only when the
/// registry was built with `trust_gateway_headers`.
pub fn create_app(registry: Arc<CategoryRegistry>) -> Router {
    let state = AppState::new(registry.clone());

    let mut admin = Router::new()
        .route("/stats", get(get_stats))
        .route("/top-limited", get(get_top_limited))
        .route("/key/:key", get(get_key_stats))
        .route("/health", get(get_admission_health));
    if let Some(general) = registry.get("general") {
        admin = admin.layer(middleware::from_fn_with_state(general, enforce));
    }

    let cors = CorsLayer::permissive().expose_headers([
        HeaderName::from_static(X_RATELIMIT_LIMIT),
        HeaderName::from_static(X_RATELIMIT_REMAINING),
        HeaderName::from_static(X_RATELIMIT_RESET),
    ]);

    let mut app = Router::new()
        .route("/v1/admission/:category/check", post(check_admission))
        .nest("/v1/ratelimit", admin)
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(state);

    // Without a trusted gateway in front, these headers are client-controlled.
    if registry.trusts_gateway_headers() {
        app = app.layer(middleware::from_fn(gateway_identity));
    }

    app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(middleware::from_fn(logging_middleware)),
    )
}

pub struct Server {
    app: Router,
    bind_addr: SocketAddr,
    registry: Arc<CategoryRegistry>,
    cleanup_interval: Duration,
}

impl Server {
    pub fn new(config: &Config, policy: &AdmissionConfig) -> Result<Self> {
        let registry = Arc::new(CategoryRegistry::from_config(policy)?);

        Ok(Self {
            app: create_app(registry.clone()),
            bind_addr: config.bind_addr,
            registry,
            cleanup_interval: policy.cleanup.interval,
        })
    }

    pub async fn run(self) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(self.bind_addr).await?;
        let scheduler = CleanupScheduler::start(self.registry.clone(), self.cleanup_interval);

        tracing::info!("Admission server listening on {}", self.bind_addr);
        tracing::info!("Health check available at /health");
        tracing::info!("Readiness check available at /ready");

        // Run server with graceful shutdown
        let served = axum::serve(
            listener,
            self.app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await;

        scheduler.shutdown().await;
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        },
    }
}
