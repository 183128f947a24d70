//! Recurring cleanup of limiter and telemetry state.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::category::CategoryRegistry;

/// Handle to a running cleanup job. Dropping the handle does not stop the
/// job; call [`shutdown`](Self::shutdown) or cancel its token.
#[derive(Debug)]
pub struct CleanupScheduler {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CleanupScheduler {
    /// Start the recurring job on the current tokio runtime. The first
    /// run happens one `interval` after start.
    pub fn start(registry: Arc<CategoryRegistry>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let (evicted, reset) = registry.run_cleanup();
                        debug!(evicted, reset, "cleanup pass finished");
                    }
                }
            }
            debug!("cleanup scheduler stopped");
        });

        info!(interval_secs = interval.as_secs(), "cleanup scheduler started");
        Self { cancel, task }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the job and wait for an in-flight pass to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        info!("cleanup scheduler shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdmissionConfig;
    use crate::key_generator::CallerContext;

    // Buckets measure std time; a 1ns threshold makes every key idle by
    // the first tick, leaving the tokio clock to decide when ticks happen.
    fn registry(idle: Duration) -> Arc<CategoryRegistry> {
        let mut config = AdmissionConfig::default();
        config.cleanup.idle_threshold = idle;
        config.telemetry.window = idle;
        Arc::new(CategoryRegistry::from_config(&config).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_evicts_on_interval() {
        let registry = registry(Duration::from_nanos(1));
        let auth = registry.get("auth").unwrap();
        auth.admit(&CallerContext::anonymous("10.0.0.1"));

        let scheduler = CleanupScheduler::start(registry.clone(), Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(auth.limiter().len(), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(auth.limiter().is_empty());
        // Telemetry is reset, not removed
        let stats = auth.telemetry().stats("ip:10.0.0.1").unwrap();
        assert_eq!(stats.total_requests, 0);

        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_job() {
        let registry = registry(Duration::from_nanos(1));
        let auth = registry.get("auth").unwrap();
        let scheduler = CleanupScheduler::start(registry.clone(), Duration::from_secs(60));
        assert!(scheduler.is_running());

        let token = scheduler.token();
        scheduler.shutdown().await;
        assert!(token.is_cancelled());

        // No pass runs after shutdown
        auth.admit(&CallerContext::anonymous("10.0.0.3"));
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(auth.limiter().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_is_harmless() {
        let registry = registry(Duration::from_nanos(1));
        let auth = registry.get("auth").unwrap();
        auth.admit(&CallerContext::anonymous("10.0.0.2"));

        let first = CleanupScheduler::start(registry.clone(), Duration::from_secs(30));
        let second = CleanupScheduler::start(registry.clone(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(auth.limiter().is_empty());
        first.shutdown().await;
        second.shutdown().await;
    }
}
