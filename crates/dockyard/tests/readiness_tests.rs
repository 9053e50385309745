//! Readiness monitor behaviour end to end, driven through the controller.

use std::time::Duration;

use dockyard::readiness::ReadinessSettings;
use dockyard::resource::{ResourceKind, ResourceStatus};

mod common;
use common::{
    FakeRuntime, WORKSPACE_READY_LOGS, fast_readiness, request, test_config, test_controller,
    test_controller_with, wait_for_monitor_exit, wait_for_status, workspace_request,
};

#[tokio::test]
async fn test_ready_once_both_markers_seen() {
    let runtime = FakeRuntime::new();
    let controller = test_controller(runtime.clone()).await;
    runtime.set_logs("dockyard-ws", WORKSPACE_READY_LOGS);
    controller.register(workspace_request("ws")).await.unwrap();

    controller.start("ws").await.unwrap();
    let resource = wait_for_status(&controller, "ws", ResourceStatus::Running).await;

    assert!(!resource.degraded_readiness);
    assert!(resource.error_message.is_none());
    wait_for_monitor_exit(&controller, "ws").await;
}

#[tokio::test]
async fn test_primary_marker_alone_is_not_enough() {
    let runtime = FakeRuntime::new();
    let controller = test_controller(runtime.clone()).await;
    runtime.set_logs("dockyard-half", "server listening on :8080\n");
    controller.register(workspace_request("half")).await.unwrap();

    controller.start("half").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let resource = controller.get("half").await.unwrap();
    assert_eq!(resource.status, ResourceStatus::Starting);

    runtime.set_logs(
        "dockyard-half",
        "server listening on :8080\ncontrol channel ready\n",
    );
    let resource = wait_for_status(&controller, "half", ResourceStatus::Running).await;
    assert!(!resource.degraded_readiness);
}

#[tokio::test]
async fn test_kind_without_control_channel_needs_primary_only() {
    let runtime = FakeRuntime::new();
    let controller = test_controller(runtime.clone()).await;
    runtime.set_logs(
        "dockyard-pg",
        "LOG:  database system is ready to accept connections\n",
    );
    controller
        .register(request("pg", ResourceKind::Database))
        .await
        .unwrap();

    controller.start("pg").await.unwrap();
    let resource = wait_for_status(&controller, "pg", ResourceStatus::Running).await;
    assert!(!resource.degraded_readiness);
}

#[tokio::test]
async fn test_failsafe_marks_degraded() {
    let runtime = FakeRuntime::new();
    let settings = ReadinessSettings {
        degraded_readiness_after_checks: 15,
        base_budget: 40,
        ..fast_readiness()
    };
    let (controller, _db) = test_controller_with(runtime.clone(), test_config(settings)).await;
    runtime.set_logs("dockyard-slow", "server listening on :8080\n");
    controller.register(workspace_request("slow")).await.unwrap();

    controller.start("slow").await.unwrap();
    let resource = wait_for_status(&controller, "slow", ResourceStatus::Running).await;

    assert!(resource.degraded_readiness);
}

#[tokio::test]
async fn test_timeout_marks_error_and_keeps_container() {
    let runtime = FakeRuntime::new();
    let settings = ReadinessSettings {
        base_budget: 5,
        extended_budget: 50,
        ..fast_readiness()
    };
    let (controller, _db) = test_controller_with(runtime.clone(), test_config(settings)).await;
    controller.register(workspace_request("mute")).await.unwrap();

    controller.start("mute").await.unwrap();
    let resource = wait_for_status(&controller, "mute", ResourceStatus::Error).await;

    let message = resource.error_message.clone().unwrap();
    assert!(message.contains("did not become ready after 5 checks"), "{message}");
    let container_ref = resource.container_ref.clone().unwrap();
    assert!(runtime.container(&container_ref).is_some());
    wait_for_monitor_exit(&controller, "mute").await;

    // The terminal write happens once; late markers change nothing.
    runtime.set_logs("dockyard-mute", WORKSPACE_READY_LOGS);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let later = controller.get("mute").await.unwrap();
    assert_eq!(later.status, ResourceStatus::Error);
    assert_eq!(later.error_message.as_deref(), Some(message.as_str()));
}

#[tokio::test]
async fn test_install_marker_extends_budget() {
    let runtime = FakeRuntime::new();
    let settings = ReadinessSettings {
        status_interval_ms: 20,
        base_budget: 5,
        extended_budget: 500,
        ..fast_readiness()
    };
    let (controller, _db) = test_controller_with(runtime.clone(), test_config(settings)).await;
    runtime.set_logs(
        "dockyard-deps",
        "installing dependencies\nnpm install\nadded packages in 3s\n",
    );
    controller.register(workspace_request("deps")).await.unwrap();

    controller.start("deps").await.unwrap();
    // Well past the base budget of 5 checks.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let resource = controller.get("deps").await.unwrap();
    assert_eq!(resource.status, ResourceStatus::Starting);

    runtime.set_logs("dockyard-deps", WORKSPACE_READY_LOGS);
    wait_for_status(&controller, "deps", ResourceStatus::Running).await;
}

#[tokio::test]
async fn test_missing_container_fails_immediately() {
    let runtime = FakeRuntime::new();
    let controller = test_controller(runtime.clone()).await;
    controller.register(workspace_request("lost")).await.unwrap();

    let resource = controller.start("lost").await.unwrap();
    assert!(controller.ports().held("lost").is_some());
    runtime.remove_externally(&resource.container_ref.unwrap());

    let resource = wait_for_status(&controller, "lost", ResourceStatus::Error).await;

    assert_eq!(
        resource.error_message.as_deref(),
        Some("container for resource lost disappeared")
    );
    assert!(resource.container_ref.is_none());
    assert!(resource.primary_port.is_none());
    assert_eq!(controller.ports().held("lost"), None);
    wait_for_monitor_exit(&controller, "lost").await;
}

#[tokio::test]
async fn test_inspect_errors_count_toward_budget() {
    let runtime = FakeRuntime::new();
    let settings = ReadinessSettings {
        base_budget: 5,
        ..fast_readiness()
    };
    let (controller, _db) = test_controller_with(runtime.clone(), test_config(settings)).await;
    controller.register(workspace_request("flaky")).await.unwrap();

    controller.start("flaky").await.unwrap();
    runtime.set_fail_inspect(true);

    let resource = wait_for_status(&controller, "flaky", ResourceStatus::Error).await;
    assert!(resource.error_message.unwrap().contains("did not become ready"));
}
