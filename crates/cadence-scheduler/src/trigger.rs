//! Deployment triggering: decides which jobs run next for every application.
//!
//! Each application's state sits behind its own mutex, and every mutation of
//! that state happens while holding it. The build system queue has its own
//! lock, always taken after the application lock.

use crate::queue::{BuildJob, BuildSystem, JobQueue};
use cadence_core::application::{Application, Rollout};
use cadence_core::change::Change;
use cadence_core::deployment::{DeploymentSpec, Step};
use cadence_core::job::{JobCompletion, JobRun, JobStatus, JobType, TriggerReason};
use cadence_core::ports::Clock;
use cadence_core::{ApplicationId, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// A job completion reported by the build system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    pub application: ApplicationId,
    pub job_type: JobType,
    pub change: Change,
    pub success: bool,
    pub at: DateTime<Utc>,
}

/// Durable image of the orchestrator state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    pub applications: Vec<Application>,
    pub queue: JobQueue,
}

impl ControllerSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// The deployment orchestrator.
pub struct DeploymentTrigger {
    applications: RwLock<BTreeMap<ApplicationId, Arc<Mutex<Application>>>>,
    build_system: BuildSystem,
    clock: Arc<dyn Clock>,
}

impl DeploymentTrigger {
    pub fn new(build_system: BuildSystem, clock: Arc<dyn Clock>) -> Self {
        Self {
            applications: RwLock::new(BTreeMap::new()),
            build_system,
            clock,
        }
    }

    /// Rebuild the orchestrator from a snapshot.
    pub fn restore(snapshot: ControllerSnapshot, clock: Arc<dyn Clock>) -> Self {
        let applications = snapshot
            .applications
            .into_iter()
            .map(|app| (app.id.clone(), Arc::new(Mutex::new(app))))
            .collect();
        Self {
            applications: RwLock::new(applications),
            build_system: BuildSystem::from_queue(snapshot.queue),
            clock,
        }
    }

    /// Capture the state of every application and the queue.
    pub async fn snapshot(&self) -> ControllerSnapshot {
        let registry = self.applications.read().await;
        let mut applications = Vec::with_capacity(registry.len());
        for app in registry.values() {
            applications.push(app.lock().await.clone());
        }
        // Taken after the applications so any job they record as triggered is
        // either still queued here or already claimed by the runner.
        let queue = self.build_system.lock().await.clone();
        ControllerSnapshot {
            applications,
            queue,
        }
    }

    pub fn build_system(&self) -> &BuildSystem {
        &self.build_system
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Register an application with its deployment spec.
    pub async fn add_application(&self, id: ApplicationId, spec: DeploymentSpec) -> Result<()> {
        spec.validate()?;
        let mut registry = self.applications.write().await;
        if registry.contains_key(&id) {
            return Err(Error::ApplicationExists(id));
        }
        info!(application = %id, steps = spec.steps.len(), "Registered application");
        registry.insert(id.clone(), Arc::new(Mutex::new(Application::new(id, spec))));
        Ok(())
    }

    /// Replace the deployment spec of an application.
    pub async fn set_deployment_spec(&self, id: &ApplicationId, spec: DeploymentSpec) -> Result<()> {
        spec.validate()?;
        let app = self.application(id).await?;
        app.lock().await.spec = spec;
        debug!(application = %id, "Updated deployment spec");
        Ok(())
    }

    pub async fn application_ids(&self) -> Vec<ApplicationId> {
        self.applications.read().await.keys().cloned().collect()
    }

    pub(crate) async fn application(&self, id: &ApplicationId) -> Result<Arc<Mutex<Application>>> {
        self.applications
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::ApplicationNotFound(id.clone()))
    }

    /// Start rolling out `change`, superseding any change in flight.
    pub async fn start_change(&self, id: &ApplicationId, change: Change) -> Result<()> {
        let app = self.application(id).await?;
        let mut app = app.lock().await;
        self.begin_rollout(&mut app, change).await;
        Ok(())
    }

    /// Handle a job completion reported by the build system.
    pub async fn on_job_complete(&self, report: JobReport) -> Result<()> {
        let app = self.application(&report.application).await?;
        let mut app = app.lock().await;

        let Some(rollout) = app.rollout.clone() else {
            debug!(application = %app.id, job = %report.job_type, "Ignoring completion: no change in flight");
            return Ok(());
        };
        if rollout.change != report.change {
            debug!(
                application = %app.id,
                job = %report.job_type,
                reported = %report.change,
                current = %rollout.change,
                "Ignoring completion for stale change"
            );
            return Ok(());
        }
        if report.at < rollout.started_at {
            debug!(application = %app.id, job = %report.job_type, "Ignoring completion from abandoned attempt");
            return Ok(());
        }

        if report.success
            && app
                .jobs
                .history(&report.job_type)
                .succeeded_since(&rollout.change, rollout.started_at)
                .is_some()
        {
            debug!(application = %app.id, job = %report.job_type, "Ignoring repeated success");
            return Ok(());
        }

        let completion = JobCompletion {
            run: JobRun::new(report.change.clone(), report.at),
            success: report.success,
        };
        if !app.jobs.record_completion(&report.job_type, completion) {
            debug!(application = %app.id, job = %report.job_type, "Ignoring duplicate or out-of-order completion");
            return Ok(());
        }

        if !report.success {
            warn!(application = %app.id, job = %report.job_type, change = %report.change, "Job failed");
            return Ok(());
        }

        info!(application = %app.id, job = %report.job_type, change = %report.change, "Job succeeded");
        self.advance(&mut app, TriggerReason::Advance).await;
        Ok(())
    }

    /// Re-evaluate every change in flight, triggering steps whose delays have elapsed.
    pub async fn trigger_delayed(&self) -> Result<()> {
        for id in self.application_ids().await {
            let app = self.application(&id).await?;
            let mut app = app.lock().await;
            if app.rollout.is_some() {
                self.advance(&mut app, TriggerReason::DelayElapsed).await;
            }
        }
        Ok(())
    }

    /// Jobs of an application waiting in the build system, in pipeline order.
    pub async fn pending_jobs(&self, id: &ApplicationId) -> Result<Vec<JobType>> {
        self.application(id).await?;
        Ok(self
            .build_system
            .lock()
            .await
            .jobs_for(id)
            .into_iter()
            .map(|job| job.job_type)
            .collect())
    }

    pub async fn current_change(&self, id: &ApplicationId) -> Result<Option<Change>> {
        let app = self.application(id).await?;
        let app = app.lock().await;
        Ok(app.change().cloned())
    }

    pub async fn job_history(&self, id: &ApplicationId, job_type: &JobType) -> Result<JobStatus> {
        let app = self.application(id).await?;
        let app = app.lock().await;
        Ok(app.jobs.history(job_type))
    }

    /// A copy of the full state of one application.
    pub async fn application_state(&self, id: &ApplicationId) -> Result<Application> {
        let app = self.application(id).await?;
        let app = app.lock().await;
        Ok(app.clone())
    }

    /// Start `change` on a locked application. Pending jobs of a superseded
    /// change are dropped and the pipeline starts over at `component`.
    pub(crate) async fn begin_rollout(&self, app: &mut Application, change: Change) {
        if app.change() == Some(&change) {
            debug!(application = %app.id, change = %change, "Change already in flight");
            return;
        }

        let now = self.clock.now();
        let mut queue = self.build_system.lock().await;
        let dropped = queue.remove_application(&app.id);
        match app.rollout.replace(Rollout::new(change.clone(), now)) {
            Some(previous) => info!(
                application = %app.id,
                change = %change,
                superseded = %previous.change,
                dropped_jobs = dropped,
                "Superseding change in flight"
            ),
            None => info!(application = %app.id, change = %change, "Starting change"),
        }
        enqueue_job(app, &mut queue, JobType::Component, TriggerReason::NewChange, now);
    }

    /// Move a locked application forward: trigger the jobs of its first
    /// unsatisfied step, or finish the change when none is left.
    pub(crate) async fn advance(&self, app: &mut Application, reason: TriggerReason) {
        let now = self.clock.now();
        match app.next_step(now) {
            None => {
                let Some(change) = app.complete_rollout() else {
                    return;
                };
                let dropped = self.build_system.lock().await.remove_application(&app.id);
                info!(application = %app.id, change = %change, dropped_jobs = dropped, "Change deployed");
            }
            Some(Step::Delay(delay)) => {
                debug!(application = %app.id, delay_secs = delay.as_secs(), "Waiting for delay");
            }
            Some(step) => {
                let mut queue = self.build_system.lock().await;
                for job_type in step.jobs() {
                    if is_triggerable(app, &queue, &job_type) {
                        enqueue_job(app, &mut queue, job_type, reason, now);
                    }
                }
            }
        }
    }
}

/// Whether a job may be triggered by normal pipeline progress: it is not
/// pending, and has neither been triggered nor succeeded in the current attempt.
fn is_triggerable(app: &Application, queue: &JobQueue, job_type: &JobType) -> bool {
    let Some(rollout) = &app.rollout else {
        return false;
    };
    if queue.contains(&app.id, job_type) {
        return false;
    }
    let status = app.jobs.history(job_type);
    !status.triggered_since(&rollout.change, rollout.started_at)
        && status
            .succeeded_since(&rollout.change, rollout.started_at)
            .is_none()
}

/// Queue a job for the change in flight and record the trigger.
pub(crate) fn enqueue_job(
    app: &mut Application,
    queue: &mut JobQueue,
    job_type: JobType,
    reason: TriggerReason,
    now: DateTime<Utc>,
) {
    let Some(change) = app.change().cloned() else {
        return;
    };
    let position = app
        .spec
        .position_of(&job_type)
        .unwrap_or_else(|| app.spec.pipeline().count());

    info!(application = %app.id, job = %job_type, change = %change, %reason, "Triggering job");
    app.jobs.record_triggered(&job_type, &change, reason, now);
    queue.enqueue(BuildJob {
        application: app.id.clone(),
        job_type,
        change,
        position,
        reason,
        queued_at: now,
    });
}

/// Abandon the progress of the change in flight and trigger `component` again.
pub(crate) fn restart_pipeline(app: &mut Application, queue: &mut JobQueue, now: DateTime<Utc>) {
    let Some(rollout) = app.rollout.as_mut() else {
        return;
    };
    rollout.started_at = now;
    rollout.restarts += 1;
    let restarts = rollout.restarts;
    let dropped = queue.remove_application(&app.id);
    warn!(application = %app.id, restarts, dropped_jobs = dropped, "Restarting pipeline from the beginning");
    enqueue_job(app, queue, JobType::Component, TriggerReason::RestartPipeline, now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::change::{ApplicationRevision, Version};
    use cadence_core::ports::ManualClock;

    fn trigger() -> (DeploymentTrigger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (DeploymentTrigger::new(BuildSystem::new(), clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_unknown_application() {
        let (trigger, _) = trigger();
        let id = ApplicationId::new("tenant1", "missing");
        assert!(matches!(
            trigger.current_change(&id).await,
            Err(Error::ApplicationNotFound(_))
        ));
        assert!(matches!(
            trigger.start_change(&id, Change::Platform(Version::new(5, 1))).await,
            Err(Error::ApplicationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let (trigger, _) = trigger();
        let id = ApplicationId::new("tenant1", "app1");
        trigger
            .add_application(id.clone(), DeploymentSpec::builder().build())
            .await
            .unwrap();
        assert!(matches!(
            trigger
                .add_application(id, DeploymentSpec::builder().build())
                .await,
            Err(Error::ApplicationExists(_))
        ));
    }

    #[tokio::test]
    async fn test_rejects_invalid_spec() {
        let (trigger, _) = trigger();
        let id = ApplicationId::new("tenant1", "app1");
        let spec = DeploymentSpec::builder().region("us-west-1").region("us-west-1").build();
        assert!(matches!(
            trigger.add_application(id.clone(), spec).await,
            Err(Error::InvalidDeploymentSpec(_))
        ));
        assert!(trigger.application_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_start_same_change_twice() {
        let (trigger, clock) = trigger();
        let id = ApplicationId::new("tenant1", "app1");
        trigger
            .add_application(id.clone(), DeploymentSpec::builder().build())
            .await
            .unwrap();

        let change = Change::Application(ApplicationRevision::new(1));
        trigger.start_change(&id, change.clone()).await.unwrap();
        let started = trigger.application_state(&id).await.unwrap().rollout;

        clock.advance(std::time::Duration::from_secs(60));
        trigger.start_change(&id, change).await.unwrap();

        assert_eq!(trigger.application_state(&id).await.unwrap().rollout, started);
        assert_eq!(trigger.pending_jobs(&id).await.unwrap(), vec![JobType::Component]);
    }

    #[tokio::test]
    async fn test_completion_without_change_is_ignored() {
        let (trigger, clock) = trigger();
        let id = ApplicationId::new("tenant1", "app1");
        trigger
            .add_application(id.clone(), DeploymentSpec::builder().build())
            .await
            .unwrap();

        trigger
            .on_job_complete(JobReport {
                application: id.clone(),
                job_type: JobType::Component,
                change: Change::Platform(Version::new(5, 1)),
                success: true,
                at: clock.now(),
            })
            .await
            .unwrap();

        assert_eq!(
            trigger.job_history(&id, &JobType::Component).await.unwrap(),
            JobStatus::new(JobType::Component)
        );
        assert!(trigger.build_system().is_empty().await);
    }
}
