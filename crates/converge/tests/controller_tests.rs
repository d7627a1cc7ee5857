//! Controller-level behavior: triggers, events, policy and persistence.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use converge::reconcile::{Controller, SyncOptions, TriggerAck};
use converge::{
    load_config, Database, HealthStatus, InMemoryProvider, PolicySource, StatusReporter, SyncPolicy,
    SyncStatus,
};

async fn wait_for_status(
    events: &mut tokio::sync::broadcast::Receiver<converge::StatusEvent>,
    wanted: SyncStatus,
) -> converge::StatusEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if event.plan.is_none() && event.status.sync_status == wanted => return event,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("event stream closed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for status event")
}

#[tokio::test]
async fn manual_triggers_coalesce_into_one_cycle() {
    let h = TestHarness::new(SyncPolicy::default());
    h.write_manifest("settings.yaml", &config_map("settings", &[("mode", "live")]));
    let controller = h.controller(Duration::from_secs(3600));
    let mut events = controller.subscribe();

    assert_eq!(
        controller.trigger_sync(APP, SyncOptions::default()).unwrap(),
        TriggerAck::Queued
    );
    assert_eq!(
        controller.trigger_sync(APP, SyncOptions::default()).unwrap(),
        TriggerAck::Coalesced
    );
    assert_eq!(
        controller.notify_revision(APP, None).unwrap(),
        TriggerAck::Coalesced
    );

    controller.start();
    let event = wait_for_status(&mut events, SyncStatus::Synced).await;
    assert_eq!(event.status.application, APP);
    assert!(h.cluster.snapshot(&config_map_ref("settings")).is_some());

    controller.shutdown().await;
}

#[tokio::test]
async fn startup_cycle_runs_without_triggers() {
    let h = TestHarness::auto_sync();
    h.write_manifest("settings.yaml", &config_map("settings", &[("mode", "live")]));
    let controller = h.controller(Duration::from_secs(3600));
    let mut events = controller.subscribe();

    controller.start();
    wait_for_status(&mut events, SyncStatus::Synced).await;
    assert_eq!(controller.status(APP).unwrap().summary(), "Synced/Healthy");
    controller.shutdown().await;
}

#[tokio::test]
async fn revision_notifier_only_enqueues() {
    let h = TestHarness::auto_sync();
    h.write_manifest("settings.yaml", &config_map("settings", &[("mode", "live")]));
    let controller = h.controller(Duration::from_secs(3600));

    let notifier = controller.revision_notifier(APP).unwrap();
    assert_eq!(notifier.application(), APP);
    assert_eq!(notifier.notify(None), TriggerAck::Queued);
    assert!(h.cluster.objects().is_empty(), "notifying must not touch the cluster");
    assert!(controller.revision_notifier("unknown").is_err());
}

#[tokio::test]
async fn dry_run_through_controller() {
    let h = TestHarness::auto_sync();
    h.write_manifest("settings.yaml", &config_map("settings", &[("mode", "live")]));
    let controller = h.controller(Duration::from_secs(3600));

    let outcome = controller
        .sync_now(APP, SyncOptions { dry_run: true })
        .await
        .unwrap();
    assert_eq!(outcome.plan.len(), 1);
    assert!(h.cluster.objects().is_empty());
    assert_eq!(controller.status(APP).unwrap().sync_status, SyncStatus::Unknown);
}

#[tokio::test]
async fn status_and_operator_policy_survive_restart() {
    let mut h = TestHarness::new(SyncPolicy::default());
    h.write_manifest("settings.yaml", &config_map("settings", &[("mode", "live")]));

    {
        let controller = h.controller(Duration::from_secs(3600));
        controller.set_auto_sync(APP, true, false).unwrap();
        let outcome = controller.sync_now(APP, SyncOptions::default()).await.unwrap();
        assert_eq!(outcome.status.summary(), "Synced/Healthy");
    }

    h.restart();
    let reporter = StatusReporter::new(Database::open(&h.db_path).unwrap());
    let status = reporter.current_status(APP).unwrap();
    assert_eq!(status.summary(), "Synced/Healthy");
    assert!(status.policy.auto_sync);
    assert_eq!(status.policy_source, PolicySource::Operator);

    // The converged revision is not applied again after a restart.
    let history = h.cluster.objects();
    let outcome = h.cycle().await.unwrap();
    assert!(outcome.drift.is_empty());
    assert!(outcome.result.is_none());
    assert_eq!(h.cluster.objects(), history);
}

#[tokio::test]
async fn rejection_survives_restart_without_reapplying() {
    let mut h = TestHarness::auto_sync();
    h.cluster.reject_image("registry.local/web:bad");
    h.write_manifest(
        "web.yaml",
        &WorkloadBuilder::new("web", "registry.local/web:bad").replicas(2).build(),
    );
    let first = h.cycle().await.unwrap();
    assert_eq!(first.result.unwrap().rejected().count(), 1);
    assert_eq!(first.status.health_status, HealthStatus::Degraded);

    h.restart();
    assert_eq!(h.status().health_status, HealthStatus::Degraded);

    let after = h.cycle().await.unwrap();
    let result = after.result.unwrap();
    assert!(result.failures.is_empty(), "the rejected spec was applied again");
    assert_eq!(result.skipped.len(), 1);
    assert_eq!(after.status.health_status, HealthStatus::Degraded);
    assert!(h.cluster.snapshot(&workload_ref("web")).is_none());
}

#[tokio::test]
async fn controller_from_config_file() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("manifests/shop")).unwrap();
    std::fs::write(
        dir.path().join("manifests/shop/web.yaml"),
        WorkloadBuilder::new("web", "registry.local/web:1").replicas(2).build(),
    )
    .unwrap();
    let config_path = dir.path().join("converge.yaml");
    std::fs::write(
        &config_path,
        ConfigBuilder::new()
            .database("state.db")
            .directory_app(APP, "manifests/shop", true, false)
            .build(),
    )
    .unwrap();

    let config = load_config(&config_path).unwrap();
    let db = Database::open(&config.database_path().unwrap()).unwrap();
    let cluster = Arc::new(InMemoryProvider::new());
    let controller = Controller::from_config(&config, db, cluster.clone()).unwrap();
    assert_eq!(controller.applications(), vec![APP.to_string()]);

    let outcome = controller.sync_now(APP, SyncOptions::default()).await.unwrap();
    assert_eq!(outcome.status.summary(), "Synced/Healthy");
    assert_eq!(cluster.snapshot(&workload_ref("web")).unwrap().ready_replicas(), 2);
    assert!(dir.path().join("state.db").exists());
}
