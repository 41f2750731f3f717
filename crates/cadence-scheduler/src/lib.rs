//! Deployment orchestration for Cadence.
//!
//! [`DeploymentTrigger`] drives every application's pipeline from job
//! completions; [`Upgrader`] and [`FailureRedeployer`] run periodically next
//! to it, scheduled by the [`MaintenanceService`].

pub mod config;
pub mod maintenance;
pub mod queue;
pub mod redeployer;
pub mod trigger;
pub mod upgrader;

pub use config::ControllerConfig;
pub use maintenance::{DelayedTrigger, MaintenanceService, Maintainer};
pub use queue::{BuildJob, BuildSystem, JobQueue};
pub use redeployer::{FailureRedeployer, RetryPolicy};
pub use trigger::{ControllerSnapshot, DeploymentTrigger, JobReport};
pub use upgrader::Upgrader;
