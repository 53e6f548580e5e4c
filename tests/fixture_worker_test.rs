//! End-to-end tests against the `fixture_worker` binary, exercising
//! `ManagedProcess` and `WorkerGroup` against a real child process rather
//! than the in-process fake transport.
//!
//! The `fixture_worker` binary must be built before running these tests;
//! its path is located via the `CARGO_BIN_EXE_fixture_worker` environment
//! variable that Cargo injects automatically for integration tests.

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_stream::StreamExt;

use procwork::config::{ChannelConfig, WorkerGroupConfig};
use procwork::error::ProcworkError;
use procwork::managed_process::ManagedProcess;
use procwork::transport::SpawnSpec;
use procwork::worker_group::WorkerGroup;

fn fixture_exe() -> PathBuf {
    PathBuf::from(
        std::env::var("CARGO_BIN_EXE_fixture_worker")
            .expect("CARGO_BIN_EXE_fixture_worker not set -- run via `cargo test`"),
    )
}

async fn start_process(channel: ChannelConfig, env: HashMap<String, String>) -> Arc<ManagedProcess> {
    let spec = SpawnSpec {
        argv: vec![fixture_exe().to_string_lossy().into_owned()],
        env,
        working_dir: None,
    };
    let process = Arc::new(ManagedProcess::new(
        spec,
        channel,
        Duration::from_secs(5),
        Duration::from_millis(50),
    ));
    process
        .start()
        .await
        .expect("failed to start fixture_worker");
    process
}

#[tokio::test]
async fn test_scenario_request_response() {
    let process = start_process(ChannelConfig::Stdio, HashMap::new()).await;
    let rpc = process.rpc_channel().await.expect("stdio mode enables RPC");

    let response = rpc
        .request(json!({"action": "add", "a": 2, "b": 3}), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(response["result"], 5);

    let status = process.stop(Duration::from_secs(5)).await.unwrap();
    assert!(status.success());
}

#[tokio::test]
async fn test_scenario_progress_notifications() {
    let process = start_process(ChannelConfig::Stdio, HashMap::new()).await;
    let rpc = process.rpc_channel().await.unwrap();
    let notifications = rpc.notifications();
    let mut stream = Box::pin(notifications.each().await);

    let observed = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let observed_clone = Arc::clone(&observed);
    rpc.on_notification(move |msg| {
        let observed = Arc::clone(&observed_clone);
        let percent = msg.as_map().get("percent").cloned();
        tokio::spawn(async move {
            observed.lock().await.push(percent);
        });
    })
    .await;

    let rpc_for_request = Arc::clone(&rpc);
    let request_task = tokio::spawn(async move {
        rpc_for_request
            .request(
                json!({"action": "notify_progress", "count": 3}),
                Some(Duration::from_secs(5)),
            )
            .await
    });

    let mut percents_from_iterator = Vec::new();
    for _ in 0..3 {
        let msg = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("timed out waiting for notification")
            .expect("notification stream ended early");
        percents_from_iterator.push(msg.as_map().get("percent").and_then(|v| v.as_u64()).unwrap());
    }
    assert_eq!(percents_from_iterator, vec![33, 67, 100]);

    let response = request_task.await.unwrap().unwrap();
    assert_eq!(response["status"], "done");

    tokio::time::sleep(Duration::from_millis(50)).await;
    let via_callback: Vec<u64> = observed
        .lock()
        .await
        .iter()
        .map(|v| v.as_ref().unwrap().as_u64().unwrap())
        .collect();
    assert_eq!(via_callback, vec![33, 67, 100]);

    let _ = process.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_scenario_graceful_shutdown_escalates_to_sigkill() {
    let mut env = HashMap::new();
    env.insert("FIXTURE_IGNORE_SIGNALS".to_string(), "1".to_string());
    let process = start_process(ChannelConfig::Stdio, env).await;

    let start = tokio::time::Instant::now();
    let status = tokio::time::timeout(Duration::from_secs(5), process.stop(Duration::from_secs(2)))
        .await
        .expect("stop did not return in time")
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(4));
    assert!(!status.success());
    assert_eq!(status.signal(), Some(libc::SIGKILL));
}

#[tokio::test]
async fn test_scenario_hung_request_times_out_then_recovers() {
    let process = start_process(ChannelConfig::Stdio, HashMap::new()).await;
    let rpc = process.rpc_channel().await.unwrap();

    let hung = rpc
        .request(json!({"action": "hang"}), Some(Duration::from_millis(500)))
        .await;
    assert!(matches!(hung, Err(ProcworkError::Timeout)));

    let response = rpc
        .request(json!({"action": "add", "a": 1, "b": 1}), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(response["result"], 2);

    let _ = process.stop(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_scenario_fail_fast_kills_siblings() {
    let mut env = HashMap::new();
    env.insert("FIXTURE_FAIL_INDEX".to_string(), "1".to_string());
    env.insert("FIXTURE_EXIT_AFTER_MS".to_string(), "100".to_string());
    env.insert("FIXTURE_EXIT_CODE".to_string(), "42".to_string());

    let mut config = WorkerGroupConfig::new(
        3,
        vec![fixture_exe().to_string_lossy().into_owned()],
        ChannelConfig::Stdio,
    )
    .unwrap();
    config.env = env;
    config.health_poll_interval = Duration::from_millis(20);

    let group = Arc::new(WorkerGroup::new(config).unwrap());
    group.start().await.unwrap();

    let failure = tokio::time::timeout(Duration::from_secs(5), group.wait_for_failure())
        .await
        .expect("timed out waiting for group failure");
    assert_eq!(failure.index, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!group.worker(0).unwrap().alive().await);
    assert!(!group.worker(2).unwrap().alive().await);
    assert!(group.failed());
}

#[tokio::test]
async fn test_scenario_socket_rpc_logs_alongside_rpc() {
    let process = start_process(ChannelConfig::Socket, HashMap::new()).await;
    let rpc = process.rpc_channel().await.expect("socket mode enables RPC");

    let mut stdout_stream = Box::pin(process.stdout().each().await);
    let mut stderr_stream = Box::pin(process.stderr().each().await);

    let response = rpc
        .request(json!({"action": "emit_logs"}), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(response["status"], "ok");

    let stdout_line = tokio::time::timeout(Duration::from_secs(5), stdout_stream.next())
        .await
        .expect("timed out")
        .expect("stdout stream ended early");
    assert_eq!(stdout_line, "stdout line 1");

    let stderr_line = tokio::time::timeout(Duration::from_secs(5), stderr_stream.next())
        .await
        .expect("timed out")
        .expect("stderr stream ended early");
    assert_eq!(stderr_line, "stderr line 1");

    let _ = process.stop(Duration::from_secs(5)).await;
}
