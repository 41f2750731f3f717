//! Deployment specification types and pipeline evaluation.
//!
//! A [`DeploymentSpec`] is the parsed, declarative pipeline of an application.
//! Every pipeline implicitly starts with the `component`, `system-test` and
//! `staging-test` jobs, followed by the declared production steps in order.

use crate::change::Change;
use crate::error::{Error, Result};
use crate::ids::RegionName;
use crate::job::{DeploymentJobs, JobType};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

/// Which platform releases an application accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum UpgradePolicy {
    /// Upgrade as soon as a release is deemed safe for normal applications.
    #[default]
    Default,
    /// Upgrade to every new release first.
    Canary,
    /// Upgrade only to releases with high confidence.
    Conservative,
}

/// One unit of a deployment pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Run a single job: a test environment or one production region.
    Job(JobType),
    /// Deploy to all listed production regions at once.
    Parallel(BTreeSet<RegionName>),
    /// Wait before the next step.
    Delay(
        #[serde(with = "duration_secs")]
        #[schemars(with = "u64")]
        Duration,
    ),
}

impl Step {
    pub fn region(region: impl Into<String>) -> Self {
        Step::Job(JobType::production(region))
    }

    pub fn parallel<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Step::Parallel(regions.into_iter().map(RegionName::new).collect())
    }

    /// The jobs this step runs, in queue order.
    pub fn jobs(&self) -> Vec<JobType> {
        match self {
            Step::Job(job_type) => vec![job_type.clone()],
            Step::Parallel(regions) => regions
                .iter()
                .map(|region| JobType::Production(region.clone()))
                .collect(),
            Step::Delay(_) => vec![],
        }
    }

    pub fn is_delay(&self) -> bool {
        matches!(self, Step::Delay(_))
    }

    /// When every job of this step succeeded for `change` since `since`, the
    /// time the last of them did.
    fn completed_at(
        &self,
        jobs: &DeploymentJobs,
        change: &Change,
        since: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let mut completed_at = None;
        for job_type in self.jobs() {
            let at = jobs.status(&job_type)?.succeeded_since(change, since)?;
            completed_at = completed_at.max(Some(at));
        }
        completed_at
    }
}

/// The declared deployment pipeline of an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct DeploymentSpec {
    #[serde(default)]
    pub upgrade_policy: UpgradePolicy,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl DeploymentSpec {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            upgrade_policy: UpgradePolicy::default(),
            steps,
        }
    }

    /// Start an empty spec; production steps are added to the builder.
    pub fn builder() -> DeploymentSpecBuilder {
        DeploymentSpecBuilder::new()
    }

    /// Check that every job runs at most once and no parallel group is empty.
    /// The implicit build and test jobs may not be declared.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for step in &self.steps {
            if let Step::Parallel(regions) = step {
                if regions.is_empty() {
                    return Err(Error::InvalidDeploymentSpec(
                        "parallel step without regions".to_string(),
                    ));
                }
            }
            for job_type in step.jobs() {
                if !job_type.is_production() {
                    return Err(Error::InvalidDeploymentSpec(format!(
                        "{} runs implicitly and cannot be declared",
                        job_type
                    )));
                }
                if !seen.insert(job_type.clone()) {
                    return Err(Error::InvalidDeploymentSpec(format!(
                        "{} is declared more than once",
                        job_type
                    )));
                }
            }
        }
        Ok(())
    }

    /// The whole pipeline: build, system test and staging test, followed by
    /// the declared steps.
    pub fn pipeline(&self) -> impl Iterator<Item = Step> + '_ {
        [JobType::Component, JobType::SystemTest, JobType::StagingTest]
            .into_iter()
            .map(Step::Job)
            .chain(self.steps.iter().cloned())
    }

    /// All jobs of the pipeline in order.
    pub fn jobs(&self) -> Vec<JobType> {
        self.pipeline().flat_map(|step| step.jobs()).collect()
    }

    /// Index of the pipeline step running `job_type`; `component` is 0.
    pub fn position_of(&self, job_type: &JobType) -> Option<usize> {
        self.pipeline()
            .position(|step| step.jobs().contains(job_type))
    }

    /// The first step of the pipeline which is not yet satisfied for `change`.
    ///
    /// Only successes recorded at or after `since`, the start of the current
    /// pipeline attempt, count. A delay is satisfied once it has elapsed since
    /// the previous job step completed, and consecutive delays add up. Delays
    /// with no job after them have no effect. Returns `None` when the pipeline
    /// is complete.
    pub fn first_unsatisfied_step(
        &self,
        jobs: &DeploymentJobs,
        change: &Change,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<Step> {
        let pipeline: Vec<Step> = self.pipeline().collect();
        let mut previous_completed_at: Option<DateTime<Utc>> = None;
        let mut delay = Duration::ZERO;

        for (index, step) in pipeline.iter().enumerate() {
            match step {
                Step::Delay(duration) => {
                    if !has_job_after(&pipeline, index) {
                        break;
                    }
                    delay = delay.saturating_add(*duration);
                    let Some(completed_at) = previous_completed_at else {
                        return Some(step.clone());
                    };
                    let elapsed = (now - completed_at).to_std().unwrap_or_default();
                    if elapsed < delay {
                        return Some(step.clone());
                    }
                }
                Step::Job(_) | Step::Parallel(_) => {
                    match step.completed_at(jobs, change, since) {
                        Some(at) => previous_completed_at = Some(at),
                        None => return Some(step.clone()),
                    }
                    delay = Duration::ZERO;
                }
            }
        }
        None
    }
}

fn has_job_after(pipeline: &[Step], index: usize) -> bool {
    pipeline[index + 1..].iter().any(|step| !step.is_delay())
}

/// Builder for [`DeploymentSpec`].
#[derive(Debug, Clone)]
pub struct DeploymentSpecBuilder {
    upgrade_policy: UpgradePolicy,
    steps: Vec<Step>,
}

impl DeploymentSpecBuilder {
    fn new() -> Self {
        Self {
            upgrade_policy: UpgradePolicy::default(),
            steps: Vec::new(),
        }
    }

    pub fn upgrade_policy(mut self, policy: UpgradePolicy) -> Self {
        self.upgrade_policy = policy;
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.steps.push(Step::region(region));
        self
    }

    pub fn parallel<I, S>(mut self, regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.steps.push(Step::parallel(regions));
        self
    }

    pub fn delay(mut self, duration: Duration) -> Self {
        self.steps.push(Step::Delay(duration));
        self
    }

    pub fn build(self) -> DeploymentSpec {
        DeploymentSpec {
            upgrade_policy: self.upgrade_policy,
            steps: self.steps,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::Version;
    use crate::job::{JobCompletion, JobRun};
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    fn change() -> Change {
        Change::Platform(Version::new(6, 1))
    }

    fn succeed(jobs: &mut DeploymentJobs, job_type: JobType, at: DateTime<Utc>) {
        jobs.record_completion(
            &job_type,
            JobCompletion {
                run: JobRun::new(change(), at),
                success: true,
            },
        );
    }

    #[test]
    fn test_pipeline_always_tests_before_production() {
        let spec = DeploymentSpec::builder().region("us-west-1").build();
        assert_eq!(
            spec.jobs(),
            vec![
                JobType::Component,
                JobType::SystemTest,
                JobType::StagingTest,
                JobType::production("us-west-1"),
            ]
        );
        assert_eq!(spec.position_of(&JobType::production("us-west-1")), Some(3));
        assert_eq!(spec.position_of(&JobType::production("eu-west-1")), None);

        let explicit = DeploymentSpec::new(vec![Step::region("us-west-1")]);
        assert_eq!(explicit.jobs(), spec.jobs());
        assert_eq!(
            DeploymentSpec::default().jobs(),
            vec![JobType::Component, JobType::SystemTest, JobType::StagingTest]
        );
    }

    #[test]
    fn test_spec_without_test_jobs_still_runs_them() {
        let start = Utc::now();
        let spec = DeploymentSpec::new(vec![Step::region("us-west-1")]);
        let mut jobs = DeploymentJobs::new();
        succeed(&mut jobs, JobType::Component, start);
        assert_eq!(
            spec.first_unsatisfied_step(&jobs, &change(), start, start),
            Some(Step::Job(JobType::SystemTest))
        );

        let empty = DeploymentSpec::default();
        assert_eq!(
            empty.first_unsatisfied_step(&jobs, &change(), start, start),
            Some(Step::Job(JobType::SystemTest))
        );
    }

    #[test]
    fn test_validate() {
        assert!(DeploymentSpec::builder().region("us-west-1").build().validate().is_ok());

        let duplicate = DeploymentSpec::builder()
            .region("us-west-1")
            .parallel(["us-east-3", "us-west-1"])
            .build();
        assert!(matches!(
            duplicate.validate(),
            Err(Error::InvalidDeploymentSpec(_))
        ));

        let empty = DeploymentSpec::new(vec![Step::Parallel(BTreeSet::new())]);
        assert!(empty.validate().is_err());

        for job_type in [JobType::Component, JobType::SystemTest, JobType::StagingTest] {
            let declared = DeploymentSpec::new(vec![Step::Job(job_type)]);
            assert!(declared.validate().is_err());
        }
    }

    #[test]
    fn test_sequential_steps() {
        let start = Utc::now();
        let spec = DeploymentSpec::builder()
            .region("us-central-1")
            .region("us-west-1")
            .build();
        let mut jobs = DeploymentJobs::new();

        assert_eq!(
            spec.first_unsatisfied_step(&jobs, &change(), start, start),
            Some(Step::Job(JobType::Component))
        );

        succeed(&mut jobs, JobType::Component, start);
        succeed(&mut jobs, JobType::SystemTest, start);
        succeed(&mut jobs, JobType::StagingTest, start);
        assert_eq!(
            spec.first_unsatisfied_step(&jobs, &change(), start, start),
            Some(Step::region("us-central-1"))
        );

        succeed(&mut jobs, JobType::production("us-central-1"), start);
        succeed(&mut jobs, JobType::production("us-west-1"), start);
        assert_eq!(spec.first_unsatisfied_step(&jobs, &change(), start, start), None);
    }

    #[test]
    fn test_successes_before_attempt_start_do_not_count() {
        let start = Utc::now();
        let spec = DeploymentSpec::builder().build();
        let mut jobs = DeploymentJobs::new();
        succeed(&mut jobs, JobType::Component, start);

        let restarted = start + TimeDelta::hours(1);
        assert_eq!(
            spec.first_unsatisfied_step(&jobs, &change(), restarted, restarted),
            Some(Step::Job(JobType::Component))
        );
    }

    #[test]
    fn test_parallel_step_needs_every_region() {
        let start = Utc::now();
        let spec = DeploymentSpec::builder()
            .parallel(["us-west-1", "us-east-3"])
            .build();
        let mut jobs = DeploymentJobs::new();
        for job_type in [JobType::Component, JobType::SystemTest, JobType::StagingTest] {
            succeed(&mut jobs, job_type, start);
        }

        let parallel = Step::parallel(["us-east-3", "us-west-1"]);
        assert_eq!(
            parallel.jobs(),
            vec![JobType::production("us-east-3"), JobType::production("us-west-1")]
        );

        succeed(&mut jobs, JobType::production("us-west-1"), start);
        assert_eq!(
            spec.first_unsatisfied_step(&jobs, &change(), start, start),
            Some(parallel)
        );

        succeed(&mut jobs, JobType::production("us-east-3"), start);
        assert_eq!(spec.first_unsatisfied_step(&jobs, &change(), start, start), None);
    }

    #[test]
    fn test_consecutive_delays_add_up() {
        let start = Utc::now();
        let spec = DeploymentSpec::builder()
            .delay(Duration::from_secs(60))
            .delay(Duration::from_secs(120))
            .region("us-west-1")
            .build();
        let mut jobs = DeploymentJobs::new();
        for job_type in [JobType::Component, JobType::SystemTest, JobType::StagingTest] {
            succeed(&mut jobs, job_type, start);
        }

        let almost = start + TimeDelta::seconds(179);
        assert_eq!(
            spec.first_unsatisfied_step(&jobs, &change(), start, almost),
            Some(Step::Delay(Duration::from_secs(120)))
        );

        let elapsed = start + TimeDelta::seconds(180);
        assert_eq!(
            spec.first_unsatisfied_step(&jobs, &change(), start, elapsed),
            Some(Step::region("us-west-1"))
        );
    }

    #[test]
    fn test_huge_delays_saturate() {
        let start = Utc::now();
        let spec = DeploymentSpec::builder()
            .delay(Duration::MAX)
            .delay(Duration::MAX)
            .region("us-west-1")
            .build();
        let mut jobs = DeploymentJobs::new();
        for job_type in [JobType::Component, JobType::SystemTest, JobType::StagingTest] {
            succeed(&mut jobs, job_type, start);
        }
        assert_eq!(
            spec.first_unsatisfied_step(&jobs, &change(), start, start + TimeDelta::days(365)),
            Some(Step::Delay(Duration::MAX))
        );
    }

    #[test]
    fn test_trailing_delay_has_no_effect() {
        let start = Utc::now();
        let spec = DeploymentSpec::builder()
            .region("us-west-1")
            .delay(Duration::from_secs(600))
            .build();
        let mut jobs = DeploymentJobs::new();
        for job_type in spec.jobs() {
            succeed(&mut jobs, job_type, start);
        }
        assert_eq!(spec.first_unsatisfied_step(&jobs, &change(), start, start), None);
    }

    #[test]
    fn test_no_production_steps_complete_after_staging() {
        let start = Utc::now();
        let spec = DeploymentSpec::builder().build();
        let mut jobs = DeploymentJobs::new();
        succeed(&mut jobs, JobType::Component, start);
        succeed(&mut jobs, JobType::SystemTest, start);
        assert_eq!(
            spec.first_unsatisfied_step(&jobs, &change(), start, start),
            Some(Step::Job(JobType::StagingTest))
        );
        succeed(&mut jobs, JobType::StagingTest, start);
        assert_eq!(spec.first_unsatisfied_step(&jobs, &change(), start, start), None);
    }

    #[test]
    fn test_spec_from_json() {
        let json = r#"{
            "upgrade_policy": "canary",
            "steps": [
                {"delay": 30},
                {"parallel": ["us-west-1", "us-east-3"]}
            ]
        }"#;
        let spec: DeploymentSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.upgrade_policy, UpgradePolicy::Canary);
        assert_eq!(spec.steps[0], Step::Delay(Duration::from_secs(30)));
        assert_eq!(spec.steps[1], Step::parallel(["us-east-3", "us-west-1"]));
        assert!(spec.validate().is_ok());
    }
}
