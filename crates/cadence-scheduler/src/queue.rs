//! Queue of jobs waiting for the external build system.

use cadence_core::ApplicationId;
use cadence_core::change::Change;
use cadence_core::job::{JobType, TriggerReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// A job waiting to be claimed by the build system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildJob {
    pub application: ApplicationId,
    pub job_type: JobType,
    pub change: Change,
    /// Pipeline step index of the job within its application.
    pub position: usize,
    pub reason: TriggerReason,
    pub queued_at: DateTime<Utc>,
}

impl BuildJob {
    /// The job name reported to the build system.
    pub fn job_name(&self) -> String {
        self.job_type.id()
    }

    fn same_slot(&self, application: &ApplicationId, job_type: &JobType) -> bool {
        &self.application == application && &self.job_type == job_type
    }
}

/// Pending jobs, at most one per application and job type.
///
/// Jobs are listed grouped by application, applications in the order they
/// first queued a job, and within an application by pipeline position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobQueue {
    jobs: Vec<BuildJob>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self { jobs: Vec::new() }
    }

    /// Add a job, replacing any pending job of the same application and type.
    pub fn enqueue(&mut self, job: BuildJob) {
        match self
            .jobs
            .iter_mut()
            .find(|queued| queued.same_slot(&job.application, &job.job_type))
        {
            Some(queued) => *queued = job,
            None => self.jobs.push(job),
        }
    }

    pub fn contains(&self, application: &ApplicationId, job_type: &JobType) -> bool {
        self.jobs
            .iter()
            .any(|job| job.same_slot(application, job_type))
    }

    /// Snapshot of all pending jobs in listing order.
    pub fn list(&self) -> Vec<BuildJob> {
        let mut applications: Vec<&ApplicationId> = Vec::new();
        for job in &self.jobs {
            if !applications.contains(&&job.application) {
                applications.push(&job.application);
            }
        }

        let mut listed = Vec::with_capacity(self.jobs.len());
        for application in applications {
            listed.extend(self.jobs_for(application));
        }
        listed
    }

    /// Pending jobs of one application, by pipeline position.
    pub fn jobs_for(&self, application: &ApplicationId) -> Vec<BuildJob> {
        let mut jobs: Vec<BuildJob> = self
            .jobs
            .iter()
            .filter(|job| &job.application == application)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| {
            a.position
                .cmp(&b.position)
                .then_with(|| a.job_type.cmp(&b.job_type))
        });
        jobs
    }

    /// Remove and return all pending jobs.
    pub fn drain(&mut self) -> Vec<BuildJob> {
        let listed = self.list();
        self.jobs.clear();
        listed
    }

    /// Remove all pending jobs of an application, returning how many were removed.
    pub fn remove_application(&mut self, application: &ApplicationId) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|job| &job.application != application);
        before - self.jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Shared handle to the job queue.
///
/// Every operation takes the queue lock for its whole duration, so the
/// external runner and the orchestrator never observe a half-applied update.
#[derive(Debug, Clone, Default)]
pub struct BuildSystem {
    queue: Arc<Mutex<JobQueue>>,
}

impl BuildSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_queue(queue: JobQueue) -> Self {
        Self {
            queue: Arc::new(Mutex::new(queue)),
        }
    }

    /// Snapshot of the pending jobs.
    pub async fn jobs(&self) -> Vec<BuildJob> {
        self.queue.lock().await.list()
    }

    /// Claim every pending job for execution.
    pub async fn take_jobs_to_run(&self) -> Vec<BuildJob> {
        self.queue.lock().await.drain()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, JobQueue> {
        self.queue.lock().await
    }
}
