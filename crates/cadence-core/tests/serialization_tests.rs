//! Persisted JSON formats of cadence-core types.

use cadence_core::application::{Application, Rollout};
use cadence_core::change::{ApplicationRevision, Change, Version};
use cadence_core::deployment::{DeploymentSpec, Step, UpgradePolicy};
use cadence_core::ids::*;
use cadence_core::job::{JobCompletion, JobRun, JobType, TriggerReason};
use chrono::{TimeZone, Utc};
use serde_json::json;
use std::time::Duration;

#[test]
fn test_application_state_format() {
    let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
    let change = Change::Platform(Version::new(6, 2));
    let mut app = Application::new(
        ApplicationId::new("tenant1", "app1"),
        DeploymentSpec::builder().region("us-west-1").build(),
    );
    app.rollout = Some(Rollout::new(change.clone(), at));
    app.jobs
        .record_triggered(&JobType::Component, &change, TriggerReason::NewChange, at);
    app.jobs.record_completion(
        &JobType::Component,
        JobCompletion {
            run: JobRun::new(change.clone(), at),
            success: true,
        },
    );

    let value = serde_json::to_value(&app).expect("serialize");
    assert_eq!(
        value["id"],
        json!({"tenant": "tenant1", "application": "app1"})
    );
    assert_eq!(
        value["rollout"]["change"],
        json!({"platform": {"major": 6, "minor": 2, "micro": 0}})
    );
    assert_eq!(value["spec"]["steps"][0], json!({"job": "production-us-west-1"}));

    let component = &value["jobs"]["jobs"]["component"];
    assert_eq!(component["last_triggered"]["reason"], "new_change");
    assert_eq!(component["last_completed"]["success"], true);

    let parsed: Application = serde_json::from_value(value).expect("deserialize");
    assert_eq!(parsed, app);
}

#[test]
fn test_application_change_format() {
    let change = Change::Application(ApplicationRevision {
        build_number: 42,
        source: Some("abc123".to_string()),
    });
    assert_eq!(
        serde_json::to_value(&change).unwrap(),
        json!({"application": {"build_number": 42, "source": "abc123"}})
    );

    let parsed: Change =
        serde_json::from_value(json!({"application": {"build_number": 7}})).unwrap();
    assert_eq!(parsed, Change::Application(ApplicationRevision::new(7)));
}

#[test]
fn test_unknown_job_type_is_rejected() {
    let result: Result<JobType, _> = serde_json::from_str("\"production-\"");
    assert!(result.is_err());

    let result: Result<Step, _> = serde_json::from_value(json!({"job": "deploy-everywhere"}));
    assert!(result.is_err());
}

#[test]
fn test_delay_is_whole_seconds() {
    let spec = DeploymentSpec::new(vec![
        Step::Delay(Duration::from_secs(600)),
        Step::region("eu-west-1"),
    ]);
    let value = serde_json::to_value(&spec).unwrap();
    assert_eq!(value["steps"][0], json!({"delay": 600}));
    assert_eq!(value["upgrade_policy"], "default");
}

#[test]
fn test_spec_defaults() {
    let spec: DeploymentSpec = serde_json::from_str("{}").unwrap();
    assert_eq!(spec.upgrade_policy, UpgradePolicy::Default);
    assert!(spec.steps.is_empty());
    assert_eq!(
        spec.jobs(),
        vec![JobType::Component, JobType::SystemTest, JobType::StagingTest]
    );
}

#[test]
fn test_deployment_spec_schema() {
    let schema = schemars::schema_for!(DeploymentSpec);
    let value = serde_json::to_value(&schema).unwrap();
    assert!(value["properties"]["steps"].is_object());
    assert!(value["properties"]["upgrade_policy"].is_object());
    assert!(value["definitions"]["Step"].is_object());
}
