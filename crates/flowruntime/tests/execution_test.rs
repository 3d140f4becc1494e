mod common;

use common::*;
use flowcore::{MessageKind, NodeMessage, NodeSettings, NodeState, PortSpec, Value, WorkflowError};
use flowruntime::RuntimeConfig;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_blocked_chain_reports_every_state() {
    let h = Harness::new();
    let m = h.manager();
    let recorder = Arc::new(Recorder::default());
    m.add_listener(recorder.clone());

    let a = constant(&m, 1.0);
    let b = node(&m, "test.blocking");
    let c = node(&m, "transform.pass");
    let d = node(&m, "transform.pass");
    connect(&m, &a, &b);
    connect(&m, &b, &c);
    connect(&m, &c, &d);
    assert!(m.can_execute_node(&a));
    assert!(!m.can_execute_node(&c));
    assert_eq!(m.output_spec(&a, 0), Some(PortSpec::of("number")));
    assert_eq!(m.output_spec(&d, 0), Some(PortSpec::of("number")));

    let guard = h.gate.clone().lock_owned().await;
    m.execute_all();
    wait_for_state(&m, &b, NodeState::Executing).await;
    assert!(!m.can_reset_node(&b));
    assert!(!m.can_execute_node(&c));

    assert_eq!(m.node_state(&a), Some(NodeState::Executed));
    assert_eq!(m.node_state(&c), Some(NodeState::ConfiguredMarkedForExec));
    assert_eq!(m.node_state(&d), Some(NodeState::ConfiguredMarkedForExec));
    assert!(!m.is_halted());

    drop(guard);
    assert!(m.wait_until_done(Some(WAIT)).await);
    for id in [&a, &b, &c, &d] {
        assert_eq!(m.node_state(id), Some(NodeState::Executed));
    }
    assert_eq!(m.state(), NodeState::Executed);
    assert_eq!(m.output(&d, 0).as_deref(), Some(&Value::Number(1.0)));
    assert!(m.can_reset_node(&b));

    assert_eq!(
        recorder.states_of(&b),
        vec![
            NodeState::Configured,
            NodeState::ConfiguredMarkedForExec,
            NodeState::ConfiguredQueued,
            NodeState::PreExecute,
            NodeState::Executing,
            NodeState::PostExecute,
            NodeState::Executed,
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reset_leaves_successors_configured() {
    let h = Harness::new();
    let m = h.manager();
    let a = constant(&m, 2.0);
    let b = node(&m, "test.counter");
    let c = node(&m, "transform.pass");
    connect(&m, &a, &b);
    connect(&m, &b, &c);

    assert!(m.execute_all_and_wait_until_done(Some(WAIT)).await);
    assert_eq!(h.executions.load(Ordering::SeqCst), 1);

    m.reset_and_configure_node(&b).unwrap();
    assert_eq!(m.node_state(&a), Some(NodeState::Executed));
    assert_eq!(m.node_state(&b), Some(NodeState::Configured));
    assert_eq!(m.node_state(&c), Some(NodeState::Configured));
    assert!(m.output(&c, 0).is_none());

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(m.is_halted());
    assert_eq!(m.node_state(&c), Some(NodeState::Configured));
    assert_eq!(h.executions.load(Ordering::SeqCst), 1);

    // a second reset changes nothing
    m.reset_and_configure_node(&b).unwrap();
    assert_eq!(m.node_state(&b), Some(NodeState::Configured));
    assert_eq!(m.node_state(&c), Some(NodeState::Configured));
    assert_eq!(m.node_state(&a), Some(NodeState::Executed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failure_becomes_message() {
    let h = Harness::new();
    let m = h.manager();
    let a = constant(&m, 1.0);
    let fail = m
        .add_node(
            &m.root_id(),
            "test.fail",
            NodeSettings::new().with("message", "boom"),
        )
        .unwrap();
    let after = node(&m, "transform.pass");
    connect(&m, &a, &fail);
    connect(&m, &fail, &after);

    assert!(!m.execute_all_and_wait_until_done(Some(WAIT)).await);
    assert!(m.is_halted());
    assert_eq!(m.node_state(&a), Some(NodeState::Executed));
    assert_eq!(m.node_state(&fail), Some(NodeState::Configured));
    assert_eq!(m.node_state(&after), Some(NodeState::Configured));

    let message = m.node_message(&fail).unwrap();
    assert_eq!(message.kind, MessageKind::Error);
    assert!(message.text.contains("boom"));
    assert!(m.messages().iter().any(|(id, _)| id == &fail));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_queued_node_never_runs() {
    let h = Harness::new();
    let m = h.manager_with(RuntimeConfig::default().with_max_parallel_nodes(1));
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.txt");

    let a = constant(&m, 7.0);
    let writer = m
        .add_node(
            &m.root_id(),
            "io.write_file",
            NodeSettings::new().with("path", path.to_string_lossy().to_string()),
        )
        .unwrap();
    connect(&m, &a, &writer);
    let blocker = node(&m, "test.blocking");

    m.execute_up_to_here(&[a.clone()]).unwrap();
    wait_for_state(&m, &a, NodeState::Executed).await;

    let guard = h.gate.clone().lock_owned().await;
    m.execute_up_to_here(&[blocker.clone()]).unwrap();
    wait_for_state(&m, &blocker, NodeState::Executing).await;

    // the only worker is busy
    m.execute_up_to_here(&[writer.clone()]).unwrap();
    assert_eq!(m.node_state(&writer), Some(NodeState::ConfiguredQueued));

    m.cancel_execution(&writer).unwrap();
    assert_eq!(m.node_state(&writer), Some(NodeState::Configured));
    assert_eq!(m.node_message(&writer), Some(NodeMessage::canceled()));

    drop(guard);
    assert!(m.wait_until_done(Some(WAIT)).await);
    assert_eq!(m.node_state(&blocker), Some(NodeState::Executed));
    assert_eq!(m.node_state(&writer), Some(NodeState::Configured));
    assert!(!path.exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_running_node_unmarks_successors() {
    let h = Harness::new();
    let m = h.manager();
    let a = constant(&m, 1.0);
    let b = node(&m, "test.blocking");
    let c = node(&m, "transform.pass");
    connect(&m, &a, &b);
    connect(&m, &b, &c);

    let _guard = h.gate.clone().lock_owned().await;
    m.execute_all();
    wait_for_state(&m, &b, NodeState::Executing).await;

    m.cancel_execution(&b).unwrap();
    assert!(m.wait_until_done(Some(WAIT)).await);
    assert_eq!(m.node_state(&b), Some(NodeState::Configured));
    assert_eq!(m.node_state(&c), Some(NodeState::Configured));
    assert_eq!(m.node_message(&b), Some(NodeMessage::canceled()));
    assert_eq!(m.node_state(&a), Some(NodeState::Executed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancel_all_halts_everything() {
    let h = Harness::new();
    let m = h.manager();
    let a = node(&m, "test.blocking");
    let b = node(&m, "transform.pass");
    connect(&m, &a, &b);

    let _guard = h.gate.clone().lock_owned().await;
    m.execute_all();
    wait_for_state(&m, &a, NodeState::Executing).await;

    m.cancel_all();
    assert!(m.wait_until_done(Some(WAIT)).await);
    assert_eq!(m.node_state(&a), Some(NodeState::Configured));
    assert_eq!(m.node_state(&b), Some(NodeState::Configured));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unconnected_required_input_is_not_marked() {
    let h = Harness::new();
    let m = h.manager();
    let lonely = node(&m, "transform.pass");
    assert_eq!(m.node_state(&lonely), Some(NodeState::Idle));

    assert!(!m.mark_and_queue(&lonely));
    assert_eq!(m.node_state(&lonely), Some(NodeState::Idle));
    assert!(m.is_halted());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_wait_times_out_while_blocked() {
    let h = Harness::new();
    let m = h.manager();
    let blocker = node(&m, "test.blocking");

    let guard = h.gate.clone().lock_owned().await;
    m.execute_all();
    assert!(!m.wait_until_done(Some(Duration::from_millis(100))).await);
    assert!(m.node_state(&blocker).unwrap().is_execution_in_progress());

    drop(guard);
    assert!(m.wait_until_done(Some(WAIT)).await);
    assert_eq!(m.node_state(&blocker), Some(NodeState::Executed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_claimed_nodes_are_not_executed() {
    let h = Harness::new();
    let m = h.manager();
    let a = constant(&m, 1.0);
    let b = node(&m, "transform.pass");
    connect(&m, &a, &b);

    let claim = m.claim_for_mutation(&[b.clone()]).unwrap();
    assert_eq!(claim.nodes(), &[b.clone()]);
    m.execute_all();
    assert!(m.is_halted());
    // a feeds the claimed node, so it stays put as well
    assert_eq!(m.node_state(&a), Some(NodeState::Configured));
    assert!(!m.mark_and_queue(&b));
    assert_eq!(
        m.execute_up_to_here(&[b.clone()]),
        Err(WorkflowError::ClaimedForMutation(b.clone()))
    );
    assert_eq!(
        m.execute_up_to_here(&[a.clone()]),
        Err(WorkflowError::ClaimedForMutation(b.clone()))
    );
    assert!(m.is_halted());

    drop(claim);
    assert!(m.execute_all_and_wait_until_done(Some(WAIT)).await);
    assert_eq!(m.node_state(&b), Some(NodeState::Executed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_refuses_new_work() {
    let h = Harness::new();
    let m = h.manager();
    let a = constant(&m, 1.0);

    assert!(m.shutdown(WAIT).await);
    m.execute_all();
    assert!(m.is_halted());
    assert_eq!(m.node_state(&a), Some(NodeState::Configured));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_node_is_rejected() {
    let h = Harness::new();
    let m = h.manager();
    let result = m.add_node(&m.root_id(), "no.such.node", NodeSettings::new());
    assert!(matches!(result, Err(WorkflowError::UnknownNodeType(_))));
    assert!(m.node_ids(&m.root_id()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unconnected_input_marks_nothing() {
    let h = Harness::new();
    let m = h.manager();
    let a = constant(&m, 1.0);
    let join = node(&m, "test.join");
    connect(&m, &a, &join);

    assert!(!m.mark_and_queue(&join));
    assert!(m.is_halted());
    assert_eq!(m.node_state(&a), Some(NodeState::Configured));
    assert_eq!(m.node_state(&join), Some(NodeState::Idle));

    // the gap may also sit further up the chain
    let outer = node(&m, "test.join");
    connect(&m, &a, &outer);
    m.add_connection(&join, 0, &outer, 1).unwrap();
    assert!(!m.mark_and_queue(&outer));
    assert!(m.is_halted());
    assert_eq!(m.node_state(&a), Some(NodeState::Configured));

    let b = constant(&m, 2.0);
    m.add_connection(&b, 0, &join, 1).unwrap();
    assert!(m.mark_and_queue(&outer));
    assert!(m.wait_until_done(Some(WAIT)).await);
    assert_eq!(m.node_state(&outer), Some(NodeState::Executed));
    assert_eq!(
        m.output(&outer, 0).as_deref(),
        Some(&Value::Array(vec![
            Value::from(1.0),
            Value::Array(vec![Value::from(1.0), Value::from(2.0)]),
        ]))
    );
}
