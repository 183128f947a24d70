pub mod category;
pub mod config;
pub mod config_validator;
pub mod error;
pub mod handlers;
pub mod health;
pub mod key_generator;
pub mod middleware;
pub mod policy;
pub mod rate_limiter;
pub mod response;
pub mod scheduler;
pub mod server;
pub mod telemetry;
pub mod token_bucket;
pub mod validation;

pub use category::CategoryRegistry;
pub use config::{AdmissionConfig, Config};
pub use error::{AdmissionError, Result};
pub use key_generator::{CallerContext, Identity, KeyStrategy};
pub use middleware::{enforce, Admission, AdmissionMiddleware};
pub use policy::PolicyConfig;
pub use rate_limiter::LimiterRegistry;
pub use response::ApiResponse;
pub use scheduler::CleanupScheduler;
pub use server::create_app;
pub use telemetry::{TelemetryCollector, TelemetryStats};
pub use token_bucket::TokenBucket;
