//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the deployment core and its
//! collaborators: the clock and the platform release feed.

use crate::Result;
use crate::change::Version;
use crate::deployment::UpgradePolicy;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: DateTime<Utc>,
    elapsed_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(base: DateTime<Utc>) -> Self {
        Self {
            base,
            elapsed_ms: AtomicI64::new(0),
        }
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, duration: Duration) {
        let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
        self.elapsed_ms.fetch_add(millis, Ordering::SeqCst);
    }

    /// Moves the clock to the given instant.
    pub fn set(&self, at: DateTime<Utc>) {
        self.elapsed_ms
            .store((at - self.base).num_milliseconds(), Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.base + TimeDelta::milliseconds(self.elapsed_ms.load(Ordering::SeqCst))
    }
}

/// Feed of platform releases.
#[async_trait]
pub trait VersionFeed: Send + Sync {
    /// The newest release applications with the given policy may upgrade to.
    async fn latest_eligible_version(&self, policy: UpgradePolicy) -> Result<Option<Version>>;
}

/// An in-memory release feed.
///
/// Holds one release per upgrade policy; policies without their own entry
/// fall back to the release set for [`UpgradePolicy::Default`].
#[derive(Debug, Default)]
pub struct StaticVersionFeed {
    versions: RwLock<HashMap<UpgradePolicy, Version>>,
}

impl StaticVersionFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Release `version` to every policy.
    pub fn set_version(&self, version: Version) {
        let mut versions = self.versions.write().unwrap_or_else(|e| e.into_inner());
        versions.clear();
        versions.insert(UpgradePolicy::Default, version);
    }

    /// Release `version` to one policy only.
    pub fn set_version_for(&self, policy: UpgradePolicy, version: Version) {
        self.versions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(policy, version);
    }
}

#[async_trait]
impl VersionFeed for StaticVersionFeed {
    async fn latest_eligible_version(&self, policy: UpgradePolicy) -> Result<Option<Version>> {
        let versions = self.versions.read().unwrap_or_else(|e| e.into_inner());
        Ok(versions
            .get(&policy)
            .or_else(|| versions.get(&UpgradePolicy::Default))
            .copied())
    }
}
