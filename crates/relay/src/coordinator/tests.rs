use super::*;
use crate::infrastructure::clock::FixedClock;
use crate::infrastructure::LocalBroadcast;
use crate::tasks::SinkError;
use crate::test_fixtures::{url, FakeConnector, FakeServers};
use comfyrelay_domain::{ProgressEvent, UnhealthyReason};
use comfyrelay_shared::PushFrame;
use serde_json::json;
use std::time::Duration;

const A: &str = "http://gpu-a:8188";
const B: &str = "http://gpu-b:8188";
const C: &str = "http://gpu-c:8188";

struct TestRelay {
    servers: Arc<FakeServers>,
    connector: Arc<FakeConnector>,
    relay: RelayCoordinator,
}

fn config(urls: &[&str]) -> RelayConfig {
    RelayConfig {
        primary_url: urls[0].to_string(),
        backup_urls: urls[1..].iter().map(|u| u.to_string()).collect(),
        progress_interval_ms: 1,
        reconnect_attempts: 3,
        reconnect_base_delay_ms: 100,
        ..RelayConfig::default()
    }
}

fn relay_with(config: RelayConfig, broadcast: Arc<dyn BroadcastPort>) -> TestRelay {
    let servers = FakeServers::new();
    let connector = FakeConnector::new();
    let relay = RelayCoordinator::new(
        config,
        RelayDeps {
            server_api: servers.clone(),
            connector: connector.clone(),
            broadcast,
            clock: Arc::new(FixedClock(Utc::now())),
        },
    )
    .unwrap();
    TestRelay {
        servers,
        connector,
        relay,
    }
}

fn relay(urls: &[&str]) -> TestRelay {
    relay_with(config(urls), Arc::new(NoopBroadcast))
}

fn workflow() -> Value {
    json!({
        "3": { "class_type": "KSampler", "inputs": {} },
        "9": { "class_type": "SaveImage", "inputs": {} }
    })
}

type Seen = Arc<StdMutex<Vec<ProgressEvent>>>;

fn recording_sink() -> (Seen, Box<dyn ProgressSink>) {
    let seen: Seen = Arc::new(StdMutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);
    let sink = move |e: &ProgressEvent| -> Result<(), SinkError> {
        sink_seen.lock().unwrap().push(e.clone());
        Ok(())
    };
    (seen, Box::new(sink) as Box<dyn ProgressSink>)
}

fn statuses(seen: &Seen) -> Vec<TaskStatus> {
    seen.lock().unwrap().iter().map(|e| e.status).collect()
}

fn executed(task: &TaskInfo, filename: &str) -> PushFrame {
    PushFrame::Executed {
        prompt_id: task.id.to_string(),
        node: "9".into(),
        artifacts: vec![ArtifactRef::new(filename)],
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_submit_on_idle_pool_locks_primary_and_completes() {
    let t = relay(&[A, B]);
    let (seen, sink) = recording_sink();

    let task = t
        .relay
        .submit_task_with_sink("undress", workflow(), sink)
        .await
        .unwrap();
    assert_eq!(task.bound_server_url, url(A));
    assert_eq!(task.workflow_type, "undress");

    let submissions = t.servers.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].0, url(A));
    assert_eq!(submissions[0].1.prompt_id.as_deref(), Some(task.id.as_str()));

    tokio::time::advance(Duration::from_millis(5)).await;
    t.connector.push(
        A,
        PushFrame::ExecutionStart {
            prompt_id: task.id.to_string(),
        },
    );
    t.relay.process_pending_events().await;

    tokio::time::advance(Duration::from_millis(5)).await;
    t.connector.push(A, executed(&task, "out.png"));
    t.relay.process_pending_events().await;

    assert_eq!(
        statuses(&seen),
        vec![TaskStatus::Waiting, TaskStatus::Executing, TaskStatus::Completed]
    );
    let last = seen.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.percent, 100);
    assert!(last.artifacts[0].url.starts_with(A));
    assert_eq!(t.relay.get_server_status().await.pending_task_count, 0);
}

#[tokio::test]
async fn test_timed_out_primary_falls_back_to_backup() {
    let t = relay(&[A, B]);
    t.servers
        .set_health(A, ProbeOutcome::Unhealthy(UnhealthyReason::Timeout));

    let handle = t.relay.submit_task("faceswap", workflow()).await.unwrap();
    assert_eq!(handle.bound_server(), &url(B));

    let statuses = t.relay.list_all_server_statuses().await;
    assert_eq!(statuses.len(), 2);
    assert_eq!(statuses[0].url, url(A));
    assert!(!statuses[0].healthy);
    assert!(statuses[0].is_primary);
    assert!(!statuses[0].is_active);
    assert_eq!(statuses[1].url, url(B));
    assert!(statuses[1].healthy);
    assert!(statuses[1].is_active);
}

#[tokio::test]
async fn test_execution_error_only_retires_its_own_task() {
    let t = relay(&[A]);
    let (seen_1, sink_1) = recording_sink();
    let (seen_2, sink_2) = recording_sink();
    let t1 = t
        .relay
        .submit_task_with_sink("undress", workflow(), sink_1)
        .await
        .unwrap();
    let t2 = t
        .relay
        .submit_task_with_sink("undress", workflow(), sink_2)
        .await
        .unwrap();

    t.connector.push(
        A,
        PushFrame::ExecutionError {
            prompt_id: t1.id.to_string(),
            message: "CUDA out of memory".into(),
            node_id: Some("3".into()),
            node_type: Some("KSampler".into()),
        },
    );
    t.relay.process_pending_events().await;

    let last_1 = seen_1.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last_1.status, TaskStatus::Error);
    assert_eq!(last_1.error.as_deref(), Some("CUDA out of memory"));
    assert_eq!(statuses(&seen_2), vec![TaskStatus::Waiting]);

    let status = t.relay.get_server_status().await;
    assert_eq!(status.pending_task_count, 1);
    assert_eq!(status.locked_server, Some(url(A)));
    assert!(status.is_connected);

    let core = t.relay.inner.core.lock().await;
    assert!(core.tasks.contains(&t2.id));
    assert!(!core.tasks.contains(&t1.id));
}

// =============================================================================
// Properties
// =============================================================================

#[tokio::test]
async fn test_artifacts_stay_on_bound_server_after_failover() {
    let t = relay(&[A, B]);
    let (seen, sink) = recording_sink();
    let task = t
        .relay
        .submit_task_with_sink("undress", workflow(), sink)
        .await
        .unwrap();

    {
        let mut lock = t.relay.inner.lock.lock().await;
        lock.drop_lock();
        t.servers
            .set_health(A, ProbeOutcome::Unhealthy(UnhealthyReason::ConnectionError));
        let server = lock.ensure_locked(0, None).await.unwrap();
        assert_eq!(server, url(B));

        let core = t.relay.inner.core.lock().await;
        let err = core.tasks.check_binding(&task.id, &server.endpoint("view")).unwrap_err();
        assert!(matches!(err, RelayError::StaleLockMismatch { .. }));
    }

    let artifact = ArtifactRef::new("late.png");
    let fetch_url = t.relay.artifact_url(&task.id, &artifact).await.unwrap();
    assert!(fetch_url.starts_with(A));

    t.connector.push(B, executed(&task, "late.png"));
    t.relay.process_pending_events().await;

    let last = seen.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.status, TaskStatus::Completed);
    assert!(last.artifacts[0].url.starts_with(A));

    t.relay.fetch_artifact(&last.artifacts[0]).await.unwrap();
    assert!(t.servers.fetched()[0].starts_with(A));
}

#[tokio::test]
async fn test_lock_is_kept_while_tasks_are_pending() {
    let mut cfg = config(&[A]);
    cfg.idle_release_secs = 0;
    let t = relay_with(cfg, Arc::new(NoopBroadcast));
    let task = t.relay.submit_task("undress", workflow()).await.unwrap();

    t.relay.tick().await;
    assert!(!t.relay.reset_lock(false).await);
    assert_eq!(t.relay.get_server_status().await.locked_server, Some(url(A)));

    t.relay.force_complete(task.id()).await.unwrap();
    assert!(t.relay.reset_lock(false).await);
    assert_eq!(t.relay.get_server_status().await.locked_server, None);
    assert!(!t.connector.is_open(A));
}

#[tokio::test]
async fn test_repeated_submits_reuse_one_connection() {
    let t = relay(&[A, B]);
    let first = t.relay.submit_task("undress", workflow()).await.unwrap();
    let second = t.relay.submit_task("undress", workflow()).await.unwrap();

    assert_eq!(first.bound_server(), second.bound_server());
    assert_eq!(t.connector.connect_count(), 1);
    assert_ne!(first.id(), second.id());
}

#[tokio::test]
async fn test_first_healthy_server_wins_in_registry_order() {
    let t = relay(&[A, B, C]);
    t.servers
        .set_health(A, ProbeOutcome::Unhealthy(UnhealthyReason::Http(503)));

    let handle = t.relay.submit_task("undress", workflow()).await.unwrap();

    assert_eq!(handle.bound_server(), &url(B));
    assert_eq!(t.servers.probe_log(), vec![url(A), url(B)]);
    assert_eq!(t.connector.connects_to(C), 0);
}

#[tokio::test]
async fn test_late_progress_does_not_regress_completion() {
    let t = relay(&[A]);
    let (seen, sink) = recording_sink();
    let task = t
        .relay
        .submit_task_with_sink("undress", workflow(), sink)
        .await
        .unwrap();

    t.connector.push(A, executed(&task, "out.png"));
    t.connector.push(
        A,
        PushFrame::Progress {
            prompt_id: task.id.to_string(),
            node: Some("3".into()),
            value: 2,
            max: 20,
        },
    );
    t.relay.process_pending_events().await;

    let seen = seen.lock().unwrap();
    let last = seen.last().unwrap();
    assert_eq!(last.status, TaskStatus::Completed);
    assert_eq!(last.percent, 100);
    assert!(seen.iter().all(|e| e.status != TaskStatus::Processing));
}

#[tokio::test]
async fn test_panicking_sink_does_not_block_other_tasks() {
    let t = relay(&[A]);
    let broken = |e: &ProgressEvent| -> Result<(), SinkError> {
        if e.status == TaskStatus::Completed {
            panic!("listener crashed");
        }
        Ok(())
    };
    let t1 = t
        .relay
        .submit_task_with_sink("undress", workflow(), Box::new(broken))
        .await
        .unwrap();
    let (seen_2, sink_2) = recording_sink();
    let t2 = t
        .relay
        .submit_task_with_sink("undress", workflow(), sink_2)
        .await
        .unwrap();

    t.connector.push(A, executed(&t1, "a.png"));
    t.connector.push(A, executed(&t2, "b.png"));
    t.relay.process_pending_events().await;

    let last = seen_2.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.status, TaskStatus::Completed);
    assert_eq!(t.relay.get_server_status().await.pending_task_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_submission_does_not_delay_other_tasks() {
    let t = relay(&[A]);
    let (seen_1, sink_1) = recording_sink();
    let t1 = t
        .relay
        .submit_task_with_sink("undress", workflow(), sink_1)
        .await
        .unwrap();

    t.servers.delay_submissions(Duration::from_secs(20));
    let relay = t.relay.clone();
    let slow = tokio::spawn(async move { relay.submit_task("undress", workflow()).await });
    while t.relay.get_server_status().await.pending_task_count < 2 {
        tokio::task::yield_now().await;
    }

    let started = Instant::now();
    t.connector.push(A, executed(&t1, "out.png"));
    t.relay.process_pending_events().await;

    assert_eq!(statuses(&seen_1).last(), Some(&TaskStatus::Completed));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!slow.is_finished());

    let handle = slow.await.unwrap().unwrap();
    assert_eq!(handle.bound_server(), &url(A));
    assert_eq!(t.relay.get_server_status().await.pending_task_count, 1);
}

#[tokio::test]
async fn test_completion_resets_failure_count() {
    let t = relay(&[A, B]);
    let task = t.relay.submit_task("undress", workflow()).await.unwrap();
    t.relay.registry().mark_failure(&url(A));
    assert_eq!(t.relay.registry().get(&url(A)).unwrap().consecutive_failures, 1);

    t.connector.push(
        A,
        PushFrame::ExecutionSuccess {
            prompt_id: task.id().to_string(),
        },
    );
    t.relay.process_pending_events().await;

    assert_eq!(t.relay.registry().get(&url(A)).unwrap().consecutive_failures, 0);
}

#[tokio::test]
async fn test_server_assigned_prompt_id_is_followed() {
    let t = relay(&[A]);
    t.servers.assign_prompt_id("srv-42");
    let (seen, sink) = recording_sink();

    let task = t
        .relay
        .submit_task_with_sink("undress", workflow(), sink)
        .await
        .unwrap();
    assert_eq!(task.id, TaskId::new("srv-42"));

    t.connector.push(A, executed(&task, "out.png"));
    t.relay.process_pending_events().await;

    let last = seen.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.task_id, TaskId::new("srv-42"));
    assert_eq!(last.status, TaskStatus::Completed);
    assert_eq!(t.relay.get_server_status().await.pending_task_count, 0);
}

// =============================================================================
// Submission failures
// =============================================================================

#[tokio::test]
async fn test_no_server_available_lists_every_candidate() {
    let t = relay(&[A, B]);
    t.servers
        .set_health(A, ProbeOutcome::Unhealthy(UnhealthyReason::Timeout));
    t.servers
        .set_health(B, ProbeOutcome::Unhealthy(UnhealthyReason::Http(500)));

    let err = t.relay.submit_task("undress", workflow()).await.unwrap_err();
    match err {
        RelayError::NoServerAvailable { attempts } => {
            assert_eq!(attempts.len(), 2);
            assert_eq!(attempts[0].1, "timeout");
            assert_eq!(attempts[1].1, "http_500");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(t.servers.submissions().is_empty());
}

#[tokio::test]
async fn test_rejected_submission_does_not_count_against_server() {
    let t = relay(&[A]);
    t.servers
        .fail_submissions(A, SubmitError::Rejected("invalid prompt".into()));

    let (seen, sink) = recording_sink();

    let err = t
        .relay
        .submit_task_with_sink("undress", workflow(), sink)
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Submit { .. }));
    assert_eq!(t.relay.registry().get(&url(A)).unwrap().consecutive_failures, 0);
    assert_eq!(t.relay.get_server_status().await.pending_task_count, 0);
    assert_eq!(statuses(&seen), vec![TaskStatus::Waiting, TaskStatus::Error]);
}

#[tokio::test]
async fn test_server_fault_on_submit_counts_as_failure() {
    let t = relay(&[A]);
    t.servers.fail_submissions(
        A,
        SubmitError::Http {
            status: 500,
            body: "boom".into(),
        },
    );

    t.relay.submit_task("undress", workflow()).await.unwrap_err();
    assert_eq!(t.relay.registry().get(&url(A)).unwrap().consecutive_failures, 1);
}

// =============================================================================
// Connection loss
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_dropped_connection_reconnects_to_same_server() {
    let t = relay(&[A, B]);
    let (seen, sink) = recording_sink();
    let task = t
        .relay
        .submit_task_with_sink("undress", workflow(), sink)
        .await
        .unwrap();

    t.connector.drop_connections(A);
    t.relay.process_pending_events().await;
    assert!(!t.relay.get_server_status().await.is_connected);

    t.relay.settle(Duration::from_secs(1)).await;

    let status = t.relay.get_server_status().await;
    assert_eq!(status.locked_server, Some(url(A)));
    assert!(status.is_connected);
    assert_eq!(t.connector.connects_to(A), 2);
    assert_eq!(t.connector.connects_to(B), 0);

    t.connector.push(A, executed(&task, "out.png"));
    t.relay.process_pending_events().await;
    assert_eq!(statuses(&seen).last(), Some(&TaskStatus::Completed));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_reconnects_fail_pending_tasks() {
    let t = relay(&[A, B]);
    let (seen, sink) = recording_sink();
    t.relay
        .submit_task_with_sink("undress", workflow(), sink)
        .await
        .unwrap();

    t.connector.refuse(A);
    t.connector.drop_connections(A);
    t.relay.process_pending_events().await;
    t.relay.settle(Duration::from_secs(10)).await;

    let last = seen.lock().unwrap().last().cloned().unwrap();
    assert_eq!(last.status, TaskStatus::Error);
    assert!(last.error.unwrap().contains("lost"));

    let status = t.relay.get_server_status().await;
    assert_eq!(status.locked_server, None);
    assert_eq!(status.pending_task_count, 0);
    assert_eq!(t.connector.connects_to(B), 0);
}

#[tokio::test]
async fn test_idle_connection_loss_releases_lock() {
    let t = relay(&[A, B]);
    let task = t.relay.submit_task("undress", workflow()).await.unwrap();
    t.relay.force_complete(task.id()).await.unwrap();

    t.connector.drop_connections(A);
    t.relay.process_pending_events().await;

    assert_eq!(t.relay.get_server_status().await.locked_server, None);
    assert_eq!(t.relay.registry().get(&url(A)).unwrap().consecutive_failures, 1);
}

// =============================================================================
// Health sweep and reload
// =============================================================================

#[tokio::test]
async fn test_sweep_fails_over_idle_lock_and_returns_to_primary() {
    let t = relay(&[A, B]);
    let task = t.relay.submit_task("undress", workflow()).await.unwrap();
    t.relay.force_complete(task.id()).await.unwrap();

    t.servers
        .set_health(A, ProbeOutcome::Unhealthy(UnhealthyReason::Timeout));
    t.relay.health_sweep().await;
    t.relay.health_sweep().await;
    assert_eq!(t.relay.get_server_status().await.locked_server, Some(url(B)));

    t.servers.set_health(A, ProbeOutcome::Healthy);
    t.relay.health_sweep().await;
    assert_eq!(t.relay.get_server_status().await.locked_server, Some(url(A)));
}

#[tokio::test]
async fn test_sweep_keeps_busy_lock() {
    let t = relay(&[A, B]);
    t.relay.submit_task("undress", workflow()).await.unwrap();

    t.servers
        .set_health(A, ProbeOutcome::Unhealthy(UnhealthyReason::Timeout));
    t.relay.health_sweep().await;
    t.relay.health_sweep().await;

    assert_eq!(t.relay.get_server_status().await.locked_server, Some(url(A)));
}

#[tokio::test]
async fn test_reload_drops_idle_lock_on_removed_server() {
    let t = relay(&[A, B]);
    let task = t.relay.submit_task("undress", workflow()).await.unwrap();
    t.relay.force_complete(task.id()).await.unwrap();

    t.relay.reload_servers(config(&[B, C])).await.unwrap();

    assert_eq!(t.relay.get_server_status().await.locked_server, None);
    let urls: Vec<ServerUrl> = t.relay.registry().list_servers().into_iter().map(|e| e.url).collect();
    assert_eq!(urls, vec![url(B), url(C)]);
}

#[tokio::test]
async fn test_reload_rejects_invalid_config() {
    let t = relay(&[A]);
    let mut bad = config(&[B]);
    bad.switch_threshold = 0;

    assert!(t.relay.reload_servers(bad).await.is_err());
    assert_eq!(t.relay.registry().primary().unwrap().url, url(A));
}

// =============================================================================
// Windows
// =============================================================================

#[tokio::test]
async fn test_second_window_prefers_peer_server() {
    let medium = LocalBroadcast::new(32);
    let first = relay_with(config(&[A, B]), Arc::new(medium.clone()));
    let second = relay_with(config(&[A, B]), Arc::new(medium.clone()));
    let mut second_inbox = medium.subscribe();

    first
        .servers
        .set_health(A, ProbeOutcome::Unhealthy(UnhealthyReason::Timeout));
    first.relay.submit_task("undress", workflow()).await.unwrap();

    while let Ok(message) = second_inbox.try_recv() {
        second.relay.handle_peer_message(message).await;
    }

    let handle = second.relay.submit_task("undress", workflow()).await.unwrap();
    assert_eq!(handle.bound_server(), &url(B));
    assert_eq!(second.servers.probe_log(), vec![url(B)]);
    assert!(handle.id().belongs_to(second.relay.window_id()));
}

#[tokio::test]
async fn test_peer_reset_releases_only_idle_locks() {
    let medium = LocalBroadcast::new(32);
    let idle = relay_with(config(&[A]), Arc::new(medium.clone()));
    let busy = relay_with(config(&[A]), Arc::new(medium.clone()));
    let requester = relay_with(config(&[A]), Arc::new(medium.clone()));

    let done = idle.relay.submit_task("undress", workflow()).await.unwrap();
    idle.relay.force_complete(done.id()).await.unwrap();
    busy.relay.submit_task("undress", workflow()).await.unwrap();

    let mut inbox = medium.subscribe();
    requester.relay.reset_lock(true).await;

    while let Ok(message) = inbox.try_recv() {
        idle.relay.handle_peer_message(message.clone()).await;
        busy.relay.handle_peer_message(message).await;
    }

    assert_eq!(idle.relay.get_server_status().await.locked_server, None);
    assert_eq!(busy.relay.get_server_status().await.locked_server, Some(url(A)));
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_status_snapshot_serializes_camel_case() {
    let t = relay(&[A]);
    t.relay.submit_task("undress", workflow()).await.unwrap();
    t.connector.push(
        A,
        PushFrame::Status {
            queue_remaining: Some(2),
        },
    );
    t.relay.process_pending_events().await;

    let status = t.relay.get_server_status().await;
    assert_eq!(status.queue_remaining, Some(2));
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["lockedServer"], A);
    assert_eq!(json["pendingTaskCount"], 1);
    assert_eq!(json["isConnected"], true);
}

#[tokio::test]
async fn test_force_complete_unknown_task() {
    let t = relay(&[A]);
    let err = t.relay.force_complete(&TaskId::new("missing")).await.unwrap_err();
    assert!(matches!(err, RelayError::UnknownTask(_)));
}

#[tokio::test]
async fn test_event_loop_runs_until_shutdown() {
    let t = relay(&[A]);
    let loop_handle = t.relay.start().unwrap();
    assert!(matches!(t.relay.start(), Err(RelayError::AlreadyStarted)));

    let handle = t.relay.submit_task("undress", workflow()).await.unwrap();
    let id = handle.id().clone();
    t.connector.push(
        A,
        PushFrame::ExecutionSuccess {
            prompt_id: id.to_string(),
        },
    );
    let done = handle.wait().await.unwrap();
    assert_eq!(done.task_id, id);

    t.relay.shutdown().await;
    loop_handle.await.unwrap();
    assert!(matches!(
        t.relay.submit_task("undress", workflow()).await,
        Err(RelayError::ShutDown)
    ));
}

#[tokio::test]
async fn test_shutdown_fails_pending_tasks() {
    let t = relay(&[A]);
    let handle = t.relay.submit_task("undress", workflow()).await.unwrap();

    t.relay.shutdown().await;

    let err = handle.wait().await.unwrap_err();
    assert!(matches!(err, RelayError::TaskExecution { ref reason, .. } if reason.contains("shut down")));
    assert!(!t.connector.is_open(A));
}
