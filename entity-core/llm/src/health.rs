use crate::registry::ProviderRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Periodically probes every registered provider.
///
/// Built in two phases: construct with an interval, `connect` a registry,
/// then `start`. Dropping the monitor stops the background task.
pub struct HealthMonitor {
    interval: Duration,
    registry: Option<Arc<ProviderRegistry>>,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(interval: Duration) -> Self {
        HealthMonitor {
            interval,
            registry: None,
            task: None,
        }
    }

    pub fn connect(&mut self, registry: Arc<ProviderRegistry>) {
        self.registry = Some(registry);
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Spawn the probe loop; the first round runs immediately.
    pub fn start(&mut self) -> anyhow::Result<()> {
        let registry = self
            .registry
            .clone()
            .ok_or_else(|| anyhow::anyhow!("HealthMonitor started before connect()"))?;
        if self.interval.is_zero() {
            return Err(anyhow::anyhow!("HealthMonitor interval must be non-zero"));
        }
        if self.is_running() {
            return Ok(());
        }

        let interval = self.interval;
        info!("Starting provider health checks every {:?}", interval);
        self.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let results = registry.check_all_providers_health().await;
                let healthy = results.values().filter(|h| h.is_healthy).count();
                debug!("Health round: {}/{} providers healthy", healthy, results.len());
            }
        }));
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
