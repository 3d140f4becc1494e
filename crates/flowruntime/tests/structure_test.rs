mod common;

use common::*;
use flowcore::{NodeId, NodeSettings, NodeState, PortDefinition, Value, WorkflowError};
use flowruntime::{ConnectionKind, PortReconfiguration, WorkflowManager};

/// a -> [meta: in -> pass -> out] -> d
struct Nested {
    a: NodeId,
    meta: NodeId,
    inner: NodeId,
    d: NodeId,
}

fn nested(m: &WorkflowManager) -> Nested {
    let root = m.root_id();
    let a = constant(m, 5.0);
    let meta = m
        .add_workflow(
            &root,
            "meta",
            vec![PortDefinition::required("in")],
            vec![PortDefinition::required("out")],
        )
        .unwrap();
    let inner = m
        .add_node(&meta, "transform.pass", NodeSettings::new())
        .unwrap();
    let d = node(m, "transform.pass");

    m.add_connection(&meta, 0, &inner, 0).unwrap();
    m.add_connection(&inner, 0, &meta, 0).unwrap();
    m.add_connection(&a, 0, &meta, 0).unwrap();
    m.add_connection(&meta, 0, &d, 0).unwrap();
    Nested { a, meta, inner, d }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nested_workflow_bridges_ports() {
    let h = Harness::new();
    let m = h.manager();
    let n = nested(&m);

    assert!(m.is_workflow(&n.meta));
    assert_eq!(n.inner.parent(), Some(n.meta.clone()));
    assert_eq!(m.node_state(&n.inner), Some(NodeState::Configured));
    assert_eq!(m.node_state(&n.d), Some(NodeState::Configured));

    let kinds: Vec<ConnectionKind> = m.connections(&n.meta).iter().map(|c| c.kind).collect();
    assert!(kinds.contains(&ConnectionKind::WorkflowIn));
    assert!(kinds.contains(&ConnectionKind::WorkflowOut));

    assert!(m.execute_all_and_wait_until_done(Some(WAIT)).await);
    assert_eq!(m.node_state(&n.meta), Some(NodeState::Executed));
    assert_eq!(m.output(&n.meta, 0).as_deref(), Some(&Value::Number(5.0)));
    assert_eq!(m.output(&n.d, 0).as_deref(), Some(&Value::Number(5.0)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removing_inbound_connection_idles_inner_nodes() {
    let h = Harness::new();
    let m = h.manager();
    let n = nested(&m);
    assert!(m.execute_all_and_wait_until_done(Some(WAIT)).await);

    let inbound = m.incoming_connection(&n.meta, 0).unwrap();
    assert_eq!(inbound.source, n.a);
    assert!(m.can_remove_connection(&inbound));
    m.remove_connection(&inbound).unwrap();

    assert_eq!(m.node_state(&n.a), Some(NodeState::Executed));
    assert_eq!(m.node_state(&n.inner), Some(NodeState::Idle));
    assert_eq!(m.node_state(&n.meta), Some(NodeState::Idle));
    assert_eq!(m.node_state(&n.d), Some(NodeState::Idle));
    assert!(m.output(&n.d, 0).is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removing_inbound_connection_keeps_independent_inner_results() {
    let h = Harness::new();
    let m = h.manager();
    let root = m.root_id();
    let a = constant(&m, 5.0);
    let meta = m
        .add_workflow(
            &root,
            "meta",
            vec![PortDefinition::required("in")],
            vec![PortDefinition::required("out")],
        )
        .unwrap();
    // x -> y.left, in -> y.right, y -> out
    let x = m
        .add_node(&meta, "source.constant", NodeSettings::new().with("value", 1.0))
        .unwrap();
    let y = m.add_node(&meta, "test.join", NodeSettings::new()).unwrap();
    m.add_connection(&x, 0, &y, 0).unwrap();
    m.add_connection(&meta, 0, &y, 1).unwrap();
    m.add_connection(&y, 0, &meta, 0).unwrap();
    m.add_connection(&a, 0, &meta, 0).unwrap();

    assert!(m.execute_all_and_wait_until_done(Some(WAIT)).await);
    assert_eq!(m.node_state(&meta), Some(NodeState::Executed));
    assert_eq!(
        m.output(&meta, 0).as_deref(),
        Some(&Value::Array(vec![Value::Number(1.0), Value::Number(5.0)]))
    );

    let inbound = m.incoming_connection(&meta, 0).unwrap();
    m.remove_connection(&inbound).unwrap();

    assert_eq!(m.node_state(&x), Some(NodeState::Executed));
    assert_eq!(m.output(&x, 0).as_deref(), Some(&Value::Number(1.0)));
    assert_eq!(m.node_state(&y), Some(NodeState::Idle));
    assert_eq!(m.node_state(&meta), Some(NodeState::Idle));
    assert_eq!(m.node_state(&a), Some(NodeState::Executed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removing_inner_outbound_connection_resets_consumers() {
    let h = Harness::new();
    let m = h.manager();
    let n = nested(&m);
    assert!(m.execute_all_and_wait_until_done(Some(WAIT)).await);

    let outbound = m
        .connections(&n.meta)
        .into_iter()
        .find(|c| c.kind == ConnectionKind::WorkflowOut)
        .unwrap();
    m.remove_connection(&outbound).unwrap();

    // the producer keeps its result, the consumer outside loses its input
    assert_eq!(m.node_state(&n.inner), Some(NodeState::Executed));
    assert_eq!(m.node_state(&n.d), Some(NodeState::Idle));
    assert_eq!(m.node_state(&n.meta), Some(NodeState::Idle));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rejected_connections_leave_graph_untouched() {
    let h = Harness::new();
    let m = h.manager();
    let a = constant(&m, 1.0);
    let sum = node(&m, "math.sum");
    let p = node(&m, "transform.pass");
    connect(&m, &a, &sum);
    connect(&m, &sum, &p);
    let before = m.connections(&m.root_id());

    assert!(!m.can_add_connection(&p, 0, &sum, 1));
    assert!(matches!(
        m.add_connection(&p, 0, &sum, 1),
        Err(WorkflowError::CyclicConnection { .. })
    ));
    assert!(matches!(
        m.add_connection(&a, 0, &sum, 0),
        Err(WorkflowError::PortOccupied { port: 0, .. })
    ));
    assert!(matches!(
        m.add_connection(&a, 3, &sum, 1),
        Err(WorkflowError::InvalidPort { port: 3, .. })
    ));
    // a leaf can not feed itself
    assert!(m.add_connection(&sum, 0, &sum, 1).is_err());

    assert_eq!(m.connections(&m.root_id()), before);
    assert_eq!(m.node_state(&sum), Some(NodeState::Configured));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invalid_port_mapping_is_atomic() {
    let h = Harness::new();
    let m = h.manager();
    let n = nested(&m);
    assert!(m.execute_all_and_wait_until_done(Some(WAIT)).await);
    let inner_before = m.connections(&n.meta);
    let outer_before = m.connections(&m.root_id());

    // one entry too few for the single existing input
    let bad = PortReconfiguration::new(
        vec![PortDefinition::required("in")],
        vec![PortDefinition::required("out")],
    )
    .with_out_mapping(vec![Some(0)]);
    assert!(matches!(
        m.reconfigure_ports(&n.meta, bad),
        Err(WorkflowError::InvalidPortMapping(_))
    ));
    // a target beyond the new ports
    let bad = PortReconfiguration::new(vec![PortDefinition::required("in")], vec![])
        .with_in_mapping(vec![Some(0)])
        .with_out_mapping(vec![Some(1)]);
    assert!(m.reconfigure_ports(&n.meta, bad).is_err());

    assert_eq!(m.connections(&n.meta), inner_before);
    assert_eq!(m.connections(&m.root_id()), outer_before);
    assert_eq!(m.in_ports(&n.meta).map(|p| p.len()), Some(1));
    assert_eq!(m.node_state(&n.d), Some(NodeState::Executed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_port_reconfiguration_moves_connections() {
    let h = Harness::new();
    let m = h.manager();
    let n = nested(&m);

    // add a leading optional input and drop the output
    let rc = PortReconfiguration::new(
        vec![PortDefinition::optional("extra"), PortDefinition::required("in")],
        vec![],
    )
    .with_in_mapping(vec![Some(1)])
    .with_out_mapping(vec![None]);
    m.reconfigure_ports(&n.meta, rc).unwrap();

    let inbound = m.incoming_connection(&n.meta, 1).unwrap();
    assert_eq!(inbound.source, n.a);
    assert!(m.incoming_connection(&n.meta, 0).is_none());
    assert!(m.incoming_connection(&n.d, 0).is_none());
    assert_eq!(m.node_state(&n.inner), Some(NodeState::Configured));
    assert_eq!(m.node_state(&n.d), Some(NodeState::Idle));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remove_node_resets_successors() {
    let h = Harness::new();
    let m = h.manager();
    let a = constant(&m, 1.0);
    let b = node(&m, "transform.pass");
    let c = node(&m, "transform.pass");
    connect(&m, &a, &b);
    connect(&m, &b, &c);
    assert!(m.execute_all_and_wait_until_done(Some(WAIT)).await);

    assert!(m.can_remove_node(&b));
    m.remove_node(&b).unwrap();
    assert!(!m.contains_node(&b));
    assert!(m.outgoing_connections(&a).is_empty());
    assert_eq!(m.node_state(&a), Some(NodeState::Executed));
    assert_eq!(m.node_state(&c), Some(NodeState::Idle));

    // ids are never reused
    let d = node(&m, "transform.pass");
    assert_ne!(d, b);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_new_settings_reset_and_reconfigure() {
    let h = Harness::new();
    let m = h.manager();
    let a = constant(&m, 1.0);
    let map = m
        .add_node(&m.root_id(), "math.map", NodeSettings::new().with("factor", 2.0))
        .unwrap();
    connect(&m, &a, &map);
    assert!(m.execute_all_and_wait_until_done(Some(WAIT)).await);
    assert_eq!(m.output(&map, 0).as_deref(), Some(&Value::Number(2.0)));

    m.load_node_settings(&a, NodeSettings::new().with("value", "text"))
        .unwrap();
    assert_eq!(m.node_state(&a), Some(NodeState::Configured));
    // a string can not be scaled
    assert_eq!(m.node_state(&map), Some(NodeState::Idle));
    assert!(!m.node_message(&map).unwrap().is_none());

    m.load_node_settings(&a, NodeSettings::new().with("value", 4.0))
        .unwrap();
    assert_eq!(m.node_state(&map), Some(NodeState::Configured));
    assert!(m.node_message(&map).unwrap().is_none());
    assert!(m.execute_all_and_wait_until_done(Some(WAIT)).await);
    assert_eq!(m.output(&map, 0).as_deref(), Some(&Value::Number(8.0)));

    assert!(m
        .load_node_settings(&a, NodeSettings::new())
        .is_err());
    assert_eq!(
        m.node_settings(&a).and_then(|s| s.get("value").cloned()),
        Some(Value::Number(4.0))
    );
}
