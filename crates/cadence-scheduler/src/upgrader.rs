//! Platform upgrades.

use crate::trigger::DeploymentTrigger;
use cadence_core::Result;
use cadence_core::change::{Change, Version};
use cadence_core::deployment::UpgradePolicy;
use cadence_core::ports::VersionFeed;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Starts a platform change for applications behind the latest eligible release.
pub struct Upgrader {
    trigger: Arc<DeploymentTrigger>,
    feed: Arc<dyn VersionFeed>,
}

impl Upgrader {
    pub fn new(trigger: Arc<DeploymentTrigger>, feed: Arc<dyn VersionFeed>) -> Self {
        Self { trigger, feed }
    }

    /// Upgrade every application which has no change in flight, or is still
    /// rolling out an older platform version, and is not already on the
    /// latest release for its upgrade policy.
    pub async fn maintain(&self) -> Result<()> {
        let mut releases: HashMap<UpgradePolicy, Option<Version>> = HashMap::new();
        let mut upgraded = 0usize;

        for id in self.trigger.application_ids().await {
            let app = self.trigger.application(&id).await?;
            let policy = app.lock().await.spec.upgrade_policy;

            let target = match releases.get(&policy) {
                Some(version) => *version,
                None => {
                    let version = self.feed.latest_eligible_version(policy).await?;
                    releases.insert(policy, version);
                    version
                }
            };
            let Some(target) = target else {
                continue;
            };

            let mut app = app.lock().await;
            if !app.wants_upgrade_to(&target) {
                continue;
            }
            info!(application = %id, version = %target, "Upgrading application");
            self.trigger
                .begin_rollout(&mut app, Change::Platform(target))
                .await;
            upgraded += 1;
        }

        debug!(upgraded, "Upgrader run complete");
        Ok(())
    }
}
