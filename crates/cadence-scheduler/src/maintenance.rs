//! Periodic maintenance loops.

use crate::config::ControllerConfig;
use crate::redeployer::FailureRedeployer;
use crate::trigger::DeploymentTrigger;
use crate::upgrader::Upgrader;
use async_trait::async_trait;
use cadence_core::Result;
use cadence_core::ports::VersionFeed;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, error, info};

/// A task run on a fixed interval.
#[async_trait]
pub trait Maintainer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn maintain(&self) -> Result<()>;
}

#[async_trait]
impl Maintainer for Upgrader {
    fn name(&self) -> &'static str {
        "upgrader"
    }

    async fn maintain(&self) -> Result<()> {
        Upgrader::maintain(self).await
    }
}

#[async_trait]
impl Maintainer for FailureRedeployer {
    fn name(&self) -> &'static str {
        "failure-redeployer"
    }

    async fn maintain(&self) -> Result<()> {
        FailureRedeployer::maintain(self).await
    }
}

/// Triggers pipeline steps that were waiting for a delay.
pub struct DelayedTrigger {
    trigger: Arc<DeploymentTrigger>,
}

impl DelayedTrigger {
    pub fn new(trigger: Arc<DeploymentTrigger>) -> Self {
        Self { trigger }
    }
}

#[async_trait]
impl Maintainer for DelayedTrigger {
    fn name(&self) -> &'static str {
        "delayed-trigger"
    }

    async fn maintain(&self) -> Result<()> {
        self.trigger.trigger_delayed().await
    }
}

/// Runs maintainers on their intervals until shutdown.
#[derive(Default)]
pub struct MaintenanceService {
    tasks: Vec<(Arc<dyn Maintainer>, Duration)>,
}

impl MaintenanceService {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard maintainers of a controller, scheduled per `config`.
    pub fn from_config(
        trigger: Arc<DeploymentTrigger>,
        feed: Arc<dyn VersionFeed>,
        config: &ControllerConfig,
    ) -> Self {
        Self::new()
            .with_task(
                Arc::new(Upgrader::new(trigger.clone(), feed)),
                config.upgrader_interval(),
            )
            .with_task(
                Arc::new(FailureRedeployer::new(trigger.clone(), config.retry_policy())),
                config.failure_redeployer_interval(),
            )
            .with_task(
                Arc::new(DelayedTrigger::new(trigger)),
                config.delayed_trigger_interval(),
            )
    }

    pub fn with_task(mut self, maintainer: Arc<dyn Maintainer>, every: Duration) -> Self {
        self.tasks.push((maintainer, every));
        self
    }

    /// Spawn one loop per maintainer.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.tasks
            .into_iter()
            .map(|(maintainer, every)| tokio::spawn(run(maintainer, every, shutdown.clone())))
            .collect()
    }
}

async fn run(maintainer: Arc<dyn Maintainer>, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        maintainer = maintainer.name(),
        interval_secs = every.as_secs(),
        "Starting maintainer"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match maintainer.maintain().await {
                    Ok(()) => debug!(maintainer = maintainer.name(), "Maintenance run complete"),
                    Err(e) => error!(maintainer = maintainer.name(), error = %e, "Maintenance run failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!(maintainer = maintainer.name(), "Maintainer shutting down");
                    break;
                }
            }
        }
    }
}
