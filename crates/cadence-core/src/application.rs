//! Deployment state of a managed application.

use crate::change::{ApplicationRevision, Change, Version};
use crate::deployment::{DeploymentSpec, Step};
use crate::ids::ApplicationId;
use crate::job::DeploymentJobs;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A change in flight, with the start of its current pipeline attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Rollout {
    pub change: Change,
    pub started_at: DateTime<Utc>,
    /// Number of times the pipeline was restarted from the beginning.
    #[serde(default)]
    pub restarts: u32,
}

impl Rollout {
    pub fn new(change: Change, started_at: DateTime<Utc>) -> Self {
        Self {
            change,
            started_at,
            restarts: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Application {
    pub id: ApplicationId,
    pub spec: DeploymentSpec,
    #[serde(default)]
    pub rollout: Option<Rollout>,
    #[serde(default)]
    pub jobs: DeploymentJobs,
    /// Platform version of the last completed platform rollout.
    #[serde(default)]
    pub platform: Option<Version>,
    /// Revision of the last completed application rollout.
    #[serde(default)]
    pub revision: Option<ApplicationRevision>,
}

impl Application {
    pub fn new(id: ApplicationId, spec: DeploymentSpec) -> Self {
        Self {
            id,
            spec,
            rollout: None,
            jobs: DeploymentJobs::new(),
            platform: None,
            revision: None,
        }
    }

    pub fn change(&self) -> Option<&Change> {
        self.rollout.as_ref().map(|rollout| &rollout.change)
    }

    /// The first unsatisfied step of the change in flight, if any.
    pub fn next_step(&self, now: DateTime<Utc>) -> Option<Step> {
        let rollout = self.rollout.as_ref()?;
        self.spec
            .first_unsatisfied_step(&self.jobs, &rollout.change, rollout.started_at, now)
    }

    /// Finish the change in flight, recording what is now deployed.
    pub fn complete_rollout(&mut self) -> Option<Change> {
        let rollout = self.rollout.take()?;
        match &rollout.change {
            Change::Platform(version) => self.platform = Some(*version),
            Change::Application(revision) => self.revision = Some(revision.clone()),
        }
        Some(rollout.change)
    }

    /// Whether the application should be upgraded to platform `version`.
    pub fn wants_upgrade_to(&self, version: &Version) -> bool {
        match self.change() {
            Some(change) => change.is_older_platform_than(version),
            None => self.platform.is_none_or(|current| current < *version),
        }
    }
}
