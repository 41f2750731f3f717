//! Job types and per-application job history.

use crate::change::Change;
use crate::ids::RegionName;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A kind of job in the deployment pipeline.
///
/// The derived order is the pipeline position of the fixed jobs; production
/// jobs sort after them, by region name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum JobType {
    Component,
    SystemTest,
    StagingTest,
    Production(RegionName),
}

impl JobType {
    pub fn production(region: impl Into<String>) -> Self {
        JobType::Production(RegionName::new(region))
    }

    /// The stable job name handed to the build system.
    pub fn id(&self) -> String {
        match self {
            JobType::Component => "component".to_string(),
            JobType::SystemTest => "system-test".to_string(),
            JobType::StagingTest => "staging-test".to_string(),
            JobType::Production(region) => format!("production-{}", region),
        }
    }

    pub fn region(&self) -> Option<&RegionName> {
        match self {
            JobType::Production(region) => Some(region),
            _ => None,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, JobType::Production(_))
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

impl std::str::FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "component" => Ok(JobType::Component),
            "system-test" => Ok(JobType::SystemTest),
            "staging-test" => Ok(JobType::StagingTest),
            other => match other.strip_prefix("production-") {
                Some(region) if !region.is_empty() => Ok(JobType::production(region)),
                _ => Err(Error::UnknownJobType(s.to_string())),
            },
        }
    }
}

impl TryFrom<String> for JobType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<JobType> for String {
    fn from(job_type: JobType) -> Self {
        job_type.id()
    }
}

impl JsonSchema for JobType {
    fn schema_name() -> String {
        "JobType".to_string()
    }

    fn json_schema(generator: &mut schemars::r#gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(generator)
    }
}

/// Why a job was put on the build system queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// First job of a newly started change.
    NewChange,
    /// The previous step completed successfully.
    Advance,
    /// A delay step elapsed.
    DelayElapsed,
    /// The job failed or stalled and is retried as-is.
    RetryInPlace,
    /// The pipeline is restarted from its first job.
    RestartPipeline,
    /// The job was expected to run but had never been triggered.
    Recovered,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            TriggerReason::NewChange => "new change",
            TriggerReason::Advance => "previous step completed",
            TriggerReason::DelayElapsed => "delay elapsed",
            TriggerReason::RetryInPlace => "retrying failing job",
            TriggerReason::RestartPipeline => "retrying from the beginning",
            TriggerReason::Recovered => "recovering untriggered job",
        };
        f.write_str(reason)
    }
}

/// A job run for a given change at a given time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobRun {
    pub change: Change,
    pub at: DateTime<Utc>,
}

impl JobRun {
    pub fn new(change: Change, at: DateTime<Utc>) -> Self {
        Self { change, at }
    }

    /// Whether this run belongs to `change` and happened no earlier than `since`.
    pub fn is_for(&self, change: &Change, since: DateTime<Utc>) -> bool {
        &self.change == change && self.at >= since
    }
}

/// The most recent trigger of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobTrigger {
    #[serde(flatten)]
    pub run: JobRun,
    pub reason: TriggerReason,
}

/// A reported job completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobCompletion {
    #[serde(flatten)]
    pub run: JobRun,
    pub success: bool,
}

/// Trigger and completion history of one job type for one application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobStatus {
    pub job_type: JobType,
    #[serde(default)]
    pub last_triggered: Option<JobTrigger>,
    #[serde(default)]
    pub last_completed: Option<JobCompletion>,
    #[serde(default)]
    pub last_success: Option<JobRun>,
    /// First failure since the last success.
    #[serde(default)]
    pub first_failing: Option<JobRun>,
    /// First in-place retry since the last success.
    #[serde(default)]
    pub retry_started: Option<JobRun>,
}

impl JobStatus {
    pub fn new(job_type: JobType) -> Self {
        Self {
            job_type,
            last_triggered: None,
            last_completed: None,
            last_success: None,
            first_failing: None,
            retry_started: None,
        }
    }

    /// Whether the job was triggered for `change` at or after `since`.
    pub fn triggered_since(&self, change: &Change, since: DateTime<Utc>) -> bool {
        self.last_triggered
            .as_ref()
            .is_some_and(|t| t.run.is_for(change, since))
    }

    /// Time of the successful completion for `change` at or after `since`, if any.
    pub fn succeeded_since(&self, change: &Change, since: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.last_success
            .as_ref()
            .filter(|run| run.is_for(change, since))
            .map(|run| run.at)
    }

    /// Time of the first in-place retry for `change` at or after `since`, if any.
    pub fn retry_started_since(
        &self,
        change: &Change,
        since: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.retry_started
            .as_ref()
            .filter(|run| run.is_for(change, since))
            .map(|run| run.at)
    }

    pub fn is_failing(&self) -> bool {
        self.last_completed.as_ref().is_some_and(|c| !c.success)
    }
}

/// Job history of one application, keyed by job type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeploymentJobs {
    jobs: BTreeMap<JobType, JobStatus>,
}

impl DeploymentJobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self, job_type: &JobType) -> Option<&JobStatus> {
        self.jobs.get(job_type)
    }

    /// Status of a job type, empty if it never ran.
    pub fn history(&self, job_type: &JobType) -> JobStatus {
        self.jobs
            .get(job_type)
            .cloned()
            .unwrap_or_else(|| JobStatus::new(job_type.clone()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobStatus> {
        self.jobs.values()
    }

    fn entry(&mut self, job_type: &JobType) -> &mut JobStatus {
        self.jobs
            .entry(job_type.clone())
            .or_insert_with(|| JobStatus::new(job_type.clone()))
    }

    pub fn record_triggered(
        &mut self,
        job_type: &JobType,
        change: &Change,
        reason: TriggerReason,
        at: DateTime<Utc>,
    ) {
        self.entry(job_type).last_triggered = Some(JobTrigger {
            run: JobRun::new(change.clone(), at),
            reason,
        });
    }

    /// Record a completion. Returns false, leaving the history untouched, when the
    /// completion is older than the one already recorded or repeats it exactly.
    pub fn record_completion(&mut self, job_type: &JobType, completion: JobCompletion) -> bool {
        let status = self.entry(job_type);
        if let Some(last) = &status.last_completed {
            if completion.run.at < last.run.at || *last == completion {
                return false;
            }
        }

        if completion.success {
            status.last_success = Some(completion.run.clone());
            status.first_failing = None;
            status.retry_started = None;
        } else {
            let streak_continues = status
                .first_failing
                .as_ref()
                .is_some_and(|first| first.change == completion.run.change);
            if !streak_continues {
                status.first_failing = Some(completion.run.clone());
            }
        }
        status.last_completed = Some(completion);
        true
    }

    /// Mark the start of in-place retries for the current failing streak.
    pub fn record_retry_started(&mut self, job_type: &JobType, change: &Change, at: DateTime<Utc>) {
        self.entry(job_type).retry_started = Some(JobRun::new(change.clone(), at));
    }
}
