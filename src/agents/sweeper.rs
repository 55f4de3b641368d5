//! Periodic liveness sweep.
//!
//! Agents never announce that they are going away; they just stop sending
//! heartbeats. The sweeper runs [`AgentRegistry::mark_stale_offline`] on a
//! fixed interval so the registry reflects that.

use std::sync::Arc;
use std::time::Duration;

use crate::agents::registry::AgentRegistry;

/// Configuration for the liveness sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Interval between sweeps.
    pub interval: Duration,
    /// Whether the sweeper runs at all.
    pub enabled: bool,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            enabled: true,
        }
    }
}

impl SweeperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

pub struct LivenessSweeper {
    config: SweeperConfig,
    registry: Arc<AgentRegistry>,
}

impl LivenessSweeper {
    pub fn new(config: SweeperConfig, registry: Arc<AgentRegistry>) -> Self {
        Self { config, registry }
    }

    /// Run the sweep loop. Never returns while enabled.
    pub async fn run(&self) {
        if !self.config.enabled {
            tracing::info!("Liveness sweeper is disabled, not starting loop");
            return;
        }

        tracing::info!(
            "Starting liveness sweeper with interval {:?}",
            self.config.interval
        );

        let mut interval = tokio::time::interval(self.config.interval);
        // Don't sweep immediately on startup; agents may still be reconnecting.
        interval.tick().await;

        loop {
            interval.tick().await;
            self.sweep_once().await;
        }
    }

    /// One sweep. Errors are logged and the next tick tries again.
    pub async fn sweep_once(&self) -> usize {
        match self.registry.mark_stale_offline().await {
            Ok(0) => {
                tracing::debug!("Liveness sweep: nothing stale");
                0
            }
            Ok(n) => {
                tracing::info!(marked = n, "Liveness sweep marked agents offline");
                n
            }
            Err(e) => {
                tracing::error!("Liveness sweep failed: {}", e);
                0
            }
        }
    }
}

/// Spawn the sweeper as a background task.
pub fn spawn_sweeper(
    config: SweeperConfig,
    registry: Arc<AgentRegistry>,
) -> tokio::task::JoinHandle<()> {
    let sweeper = LivenessSweeper::new(config, registry);
    tokio::spawn(async move {
        sweeper.run().await;
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::agents::model::{AgentStatus, RegisterRequest};
    use crate::clock::ManualClock;
    use crate::db::InMemoryStore;

    #[test]
    fn test_sweeper_config_builders() {
        let config = SweeperConfig::default();
        assert!(config.enabled);
        assert_eq!(config.interval, Duration::from_secs(60));

        let config = config.with_interval(Duration::from_secs(5)).disabled();
        assert_eq!(config.interval, Duration::from_secs(5));
        assert!(!config.enabled);
    }

    #[tokio::test]
    async fn test_sweep_once_marks_stale_agents() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(AgentRegistry::new(store, clock.clone()));

        let agent = registry
            .register(
                &RegisterRequest {
                    name: "worker-1".into(),
                    ..Default::default()
                },
                "10.0.0.1",
            )
            .await
            .unwrap();
        registry.approve(agent.id).await.unwrap();

        let sweeper = LivenessSweeper::new(SweeperConfig::default(), Arc::clone(&registry));
        assert_eq!(sweeper.sweep_once().await, 0);

        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(sweeper.sweep_once().await, 1);
        assert_eq!(
            registry.get(agent.id).await.unwrap().status,
            AgentStatus::Offline
        );
    }

    #[tokio::test]
    async fn test_disabled_sweeper_returns_immediately() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(AgentRegistry::new(store, clock));

        let handle = spawn_sweeper(SweeperConfig::default().disabled(), registry);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
