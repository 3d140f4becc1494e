mod common;

use common::*;
use flowcore::{MessageKind, NodeSettings, NodeState};
use flowruntime::{BatchExecutor, BatchStatus, RuntimeConfig, WorkflowManager, WORKFLOW_FILE};
use std::path::Path;
use std::time::Duration;

fn executor(h: &Harness) -> BatchExecutor {
    BatchExecutor::new(h.registry.clone(), RuntimeConfig::default())
}

fn save(m: &WorkflowManager) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    m.save(dir.path()).unwrap();
    dir
}

fn break_node_type(dir: &Path, node_type: &str) {
    let path = dir.join(WORKFLOW_FILE);
    let text = std::fs::read_to_string(&path).unwrap().replace(node_type, "vendor.missing");
    std::fs::write(path, text).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_executes_and_saves() {
    let h = Harness::new();
    let m = h.manager();
    let source = constant(&m, 3.0);
    let pass = node(&m, "transform.pass");
    connect(&m, &source, &pass);
    let input = save(&m);
    let output = tempfile::tempdir().unwrap();

    let mut batch = executor(&h);
    let status = batch.run(input.path(), Some(WAIT), Some(output.path())).await;
    assert_eq!(status, BatchStatus::Success);
    assert!(batch.failures().is_empty());
    assert_eq!(
        batch.manager().unwrap().node_state(&pass),
        Some(NodeState::Executed)
    );

    let saved = WorkflowManager::read_document(output.path()).unwrap();
    assert_eq!(saved.id, m.id());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_workflow_is_fatal() {
    let h = Harness::new();
    let dir = tempfile::tempdir().unwrap();

    let mut batch = executor(&h);
    let status = batch.run(dir.path(), Some(WAIT), None).await;
    assert_eq!(status, BatchStatus::LoadFatal);
    assert_eq!(status.code(), 4);
    assert!(batch.manager().is_none());
    assert!(!batch.load_entries().is_empty());
    assert!(batch.execute_all().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_node_failure_reports_execution_failed() {
    let h = Harness::new();
    let m = h.manager();
    let source = constant(&m, 1.0);
    let fail = m
        .add_node(
            &m.root_id(),
            "test.fail",
            NodeSettings::new().with("message", "disk on fire"),
        )
        .unwrap();
    connect(&m, &source, &fail);
    let input = save(&m);

    let mut batch = executor(&h);
    let status = batch.run(input.path(), Some(WAIT), None).await;
    assert_eq!(status, BatchStatus::ExecutionFailed);

    let failures = batch.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, fail);
    assert_eq!(failures[0].1.kind, MessageKind::Error);
    assert!(failures[0].1.text.contains("disk on fire"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_load_warnings_are_reported_after_a_clean_run() {
    let h = Harness::new();
    let m = h.manager();
    let source = constant(&m, 1.0);
    let pass = node(&m, "transform.pass");
    let dropped = node(&m, "debug.log");
    connect(&m, &source, &pass);
    connect(&m, &pass, &dropped);
    let input = save(&m);
    break_node_type(input.path(), "debug.log");

    let mut batch = executor(&h);
    let status = batch.run(input.path(), Some(WAIT), None).await;
    assert_eq!(status, BatchStatus::LoadErrors);
    let manager = batch.manager().unwrap();
    assert!(!manager.contains_node(&dropped));
    assert_eq!(manager.node_state(&pass), Some(NodeState::Executed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_timeout_cancels_remaining_work() {
    let h = Harness::new();
    let m = h.manager();
    let source = constant(&m, 1.0);
    let blocker = node(&m, "test.blocking");
    connect(&m, &source, &blocker);
    let input = save(&m);

    let guard = h.gate.clone().lock_owned().await;
    let mut batch = executor(&h);
    let status = batch
        .run(input.path(), Some(Duration::from_millis(100)), None)
        .await;
    drop(guard);

    assert_eq!(status, BatchStatus::Timeout);
    let manager = batch.manager().unwrap();
    assert!(manager.is_halted());
    assert_eq!(manager.node_state(&blocker), Some(NodeState::Configured));
    assert_eq!(
        manager.node_message(&blocker).map(|msg| msg.kind),
        Some(MessageKind::Warning)
    );
}
