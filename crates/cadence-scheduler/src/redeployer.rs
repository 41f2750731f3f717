//! Recovery of failing and stuck jobs.

use crate::trigger::{DeploymentTrigger, enqueue_job, restart_pipeline};
use cadence_core::Result;
use cadence_core::application::Application;
use cadence_core::job::{JobType, TriggerReason};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Thresholds for retrying jobs that do not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Time since a job was last triggered before it is retried as-is.
    pub retry_after: Duration,
    /// Time since the first such retry before the whole pipeline is restarted.
    pub restart_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_after: Duration::from_secs(2 * 60 * 60),
            restart_after: Duration::from_secs(12 * 60 * 60),
        }
    }
}

/// What to do about the expected jobs of one application.
#[derive(Debug, Default)]
struct Decision {
    restart: bool,
    retry: Vec<JobType>,
    recover: Vec<JobType>,
}

/// Retries jobs of changes in flight which failed or never reported back.
///
/// Holds no timers of its own: every run decides purely from the job history
/// and the queue, so it may run at any interval.
pub struct FailureRedeployer {
    trigger: Arc<DeploymentTrigger>,
    policy: RetryPolicy,
}

impl FailureRedeployer {
    pub fn new(trigger: Arc<DeploymentTrigger>, policy: RetryPolicy) -> Self {
        Self { trigger, policy }
    }

    pub async fn maintain(&self) -> Result<()> {
        for id in self.trigger.application_ids().await {
            let app = self.trigger.application(&id).await?;
            let mut app = app.lock().await;
            self.redeploy(&mut app).await;
        }
        Ok(())
    }

    async fn redeploy(&self, app: &mut Application) {
        let now = self.trigger.clock().now();
        let Some(rollout) = app.rollout.clone() else {
            return;
        };
        let Some(step) = app.next_step(now) else {
            return;
        };
        if step.is_delay() {
            return;
        }

        let mut queue = self.trigger.build_system().lock().await;
        let waiting: Vec<JobType> = step
            .jobs()
            .into_iter()
            .filter(|job_type| !queue.contains(&app.id, job_type))
            .collect();
        let decision = self.decide(app, &waiting, now);

        if decision.restart {
            restart_pipeline(app, &mut queue, now);
            return;
        }
        for job_type in decision.recover {
            enqueue_job(app, &mut queue, job_type, TriggerReason::Recovered, now);
        }
        for job_type in decision.retry {
            warn!(application = %app.id, job = %job_type, change = %rollout.change, "Retrying job");
            if app
                .jobs
                .history(&job_type)
                .retry_started_since(&rollout.change, rollout.started_at)
                .is_none()
            {
                app.jobs
                    .record_retry_started(&job_type, &rollout.change, now);
            }
            enqueue_job(app, &mut queue, job_type, TriggerReason::RetryInPlace, now);
        }
    }

    /// Decide on the jobs of the expected step which are not pending.
    fn decide(&self, app: &Application, jobs: &[JobType], now: DateTime<Utc>) -> Decision {
        let mut decision = Decision::default();
        let Some(rollout) = &app.rollout else {
            return decision;
        };

        for job_type in jobs {
            let status = app.jobs.history(job_type);
            if status
                .succeeded_since(&rollout.change, rollout.started_at)
                .is_some()
            {
                continue;
            }
            let triggered_at = match &status.last_triggered {
                Some(trigger) if trigger.run.is_for(&rollout.change, rollout.started_at) => {
                    trigger.run.at
                }
                _ => {
                    decision.recover.push(job_type.clone());
                    continue;
                }
            };

            if let Some(retry_started) =
                status.retry_started_since(&rollout.change, rollout.started_at)
            {
                if elapsed(retry_started, now) >= self.policy.restart_after {
                    decision.restart = true;
                    return decision;
                }
            }
            if elapsed(triggered_at, now) >= self.policy.retry_after {
                decision.retry.push(job_type.clone());
            } else {
                debug!(application = %app.id, job = %job_type, "Job still within retry threshold");
            }
        }
        decision
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert!(policy.retry_after < policy.restart_after);
        assert_eq!(policy.retry_after, Duration::from_secs(7200));
    }

    #[test]
    fn test_elapsed_never_negative() {
        let now = Utc::now();
        assert_eq!(elapsed(now + chrono::TimeDelta::seconds(5), now), Duration::ZERO);
        assert_eq!(
            elapsed(now - chrono::TimeDelta::seconds(5), now),
            Duration::from_secs(5)
        );
    }
}
