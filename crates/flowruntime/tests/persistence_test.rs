mod common;

use common::*;
use flowcore::{NodeId, NodeSettings, NodeState, PortDefinition, Value};
use flowruntime::{LoadResult, LoadSeverity, RuntimeConfig, WorkflowManager, WORKFLOW_FILE};
use std::path::Path;

fn load(h: &Harness, dir: &Path) -> LoadResult {
    WorkflowManager::load(dir, h.registry.clone(), RuntimeConfig::default())
}

fn read_json(dir: &Path) -> serde_json::Value {
    let text = std::fs::read_to_string(dir.join(WORKFLOW_FILE)).unwrap();
    serde_json::from_str(&text).unwrap()
}

fn write_json(dir: &Path, doc: &serde_json::Value) {
    std::fs::write(dir.join(WORKFLOW_FILE), serde_json::to_vec_pretty(doc).unwrap()).unwrap();
}

/// Find the saved entry of `id`, descending into nested workflows.
fn saved_node<'a>(graph: &'a mut serde_json::Value, id: &NodeId) -> Option<&'a mut serde_json::Value> {
    let wanted = serde_json::to_value(id).unwrap();
    for node in graph["nodes"].as_array_mut()? {
        if node["id"] == wanted {
            return Some(node);
        }
        if node.get("graph").is_some() {
            if let Some(found) = saved_node(&mut node["graph"], id) {
                return Some(found);
            }
        }
    }
    None
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_save_and_load_restores_executed_results() {
    let h = Harness::new();
    let m = h.manager();
    let source = constant(&m, 2.0);
    let triple = m
        .add_node(&m.root_id(), "math.map", NodeSettings::new().with("factor", 3.0))
        .unwrap();
    let idle = node(&m, "transform.json_parse");
    connect(&m, &source, &triple);
    // the unconnected parser stays idle, everything else runs
    assert!(!m.execute_all_and_wait_until_done(Some(WAIT)).await);
    assert_eq!(m.node_state(&triple), Some(NodeState::Executed));

    let dir = tempfile::tempdir().unwrap();
    m.save(dir.path()).unwrap();
    assert!(dir.path().join(WORKFLOW_FILE).exists());

    let loaded = load(&h, dir.path());
    assert!(loaded.entries.is_empty(), "{:?}", loaded.entries);
    let restored = loaded.manager.unwrap();
    assert_eq!(restored.id(), m.id());
    assert_eq!(restored.node_state(&source), Some(NodeState::Executed));
    assert_eq!(restored.node_state(&triple), Some(NodeState::Executed));
    assert_eq!(restored.node_state(&idle), Some(NodeState::Idle));
    assert_eq!(restored.output(&triple, 0).as_deref(), Some(&Value::Number(6.0)));
    assert_eq!(restored.node_settings(&triple), m.node_settings(&triple));

    // restored results reset and re-run like freshly computed ones
    restored.reset_and_configure_node(&triple).unwrap();
    assert_eq!(restored.node_state(&triple), Some(NodeState::Configured));
    assert!(restored.output(&triple, 0).is_none());
    restored.execute_up_to_here(&[triple.clone()]).unwrap();
    assert!(restored.wait_until_done(Some(WAIT)).await);
    assert_eq!(restored.node_state(&triple), Some(NodeState::Executed));
    assert_eq!(restored.output(&triple, 0).as_deref(), Some(&Value::Number(6.0)));

    // new nodes never reuse a saved index
    let added = node(&restored, "transform.pass");
    assert!(added.index() > idle.index());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nested_workflow_round_trip() {
    let h = Harness::new();
    let m = h.manager();
    let root = m.root_id();
    let source = constant(&m, 7.0);
    let meta = m
        .add_workflow(
            &root,
            "meta",
            vec![PortDefinition::required("in")],
            vec![PortDefinition::required("out")],
        )
        .unwrap();
    let inner = m.add_node(&meta, "transform.pass", NodeSettings::new()).unwrap();
    m.add_connection(&meta, 0, &inner, 0).unwrap();
    m.add_connection(&inner, 0, &meta, 0).unwrap();
    m.add_connection(&source, 0, &meta, 0).unwrap();
    assert!(m.execute_all_and_wait_until_done(Some(WAIT)).await);

    let dir = tempfile::tempdir().unwrap();
    m.save(dir.path()).unwrap();
    let restored = load(&h, dir.path()).manager.unwrap();

    assert!(restored.is_workflow(&meta));
    assert_eq!(restored.node_name(&meta).as_deref(), Some("meta"));
    assert_eq!(restored.node_state(&inner), Some(NodeState::Executed));
    assert_eq!(restored.output(&meta, 0).as_deref(), Some(&Value::Number(7.0)));
    assert_eq!(restored.connections(&meta).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_node_type_is_skipped_with_warning() {
    let h = Harness::new();
    let m = h.manager();
    let source = constant(&m, 1.0);
    let pass = node(&m, "transform.pass");
    connect(&m, &source, &pass);

    let dir = tempfile::tempdir().unwrap();
    m.save(dir.path()).unwrap();
    let mut doc = read_json(dir.path());
    saved_node(&mut doc["graph"], &pass).unwrap()["node_type"] = "vendor.missing".into();
    write_json(dir.path(), &doc);

    let loaded = load(&h, dir.path());
    assert!(loaded.has_warnings());
    assert!(!loaded.has_errors());
    assert!(loaded
        .entries
        .iter()
        .any(|e| e.severity == LoadSeverity::Warning && e.node.as_ref() == Some(&pass)));

    let restored = loaded.manager.unwrap();
    assert!(!restored.contains_node(&pass));
    assert!(restored.contains_node(&source));
    assert!(restored.connections(&restored.root_id()).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_executed_node_with_unexecuted_input_runs_again() {
    let h = Harness::new();
    let m = h.manager();
    let source = constant(&m, 1.0);
    let pass = node(&m, "transform.pass");
    connect(&m, &source, &pass);
    assert!(m.execute_all_and_wait_until_done(Some(WAIT)).await);

    let dir = tempfile::tempdir().unwrap();
    m.save(dir.path()).unwrap();
    let mut doc = read_json(dir.path());
    let saved = saved_node(&mut doc["graph"], &source).unwrap();
    saved["state"] = serde_json::to_value(NodeState::Configured).unwrap();
    saved.as_object_mut().unwrap().remove("outputs");
    write_json(dir.path(), &doc);

    let loaded = load(&h, dir.path());
    assert!(loaded
        .entries
        .iter()
        .any(|e| e.node.as_ref() == Some(&pass) && e.message.contains("will run again")));
    let restored = loaded.manager.unwrap();
    assert_eq!(restored.node_state(&source), Some(NodeState::Configured));
    assert_eq!(restored.node_state(&pass), Some(NodeState::Configured));
    assert!(restored.output(&pass, 0).is_none());

    assert!(restored.execute_all_and_wait_until_done(Some(WAIT)).await);
    assert_eq!(restored.output(&pass, 0).as_deref(), Some(&Value::Number(1.0)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreadable_documents_yield_no_manager() {
    let h = Harness::new();

    let empty = tempfile::tempdir().unwrap();
    let missing = load(&h, empty.path());
    assert!(missing.manager.is_none());
    assert!(missing.has_errors());

    let m = h.manager();
    constant(&m, 1.0);
    let dir = tempfile::tempdir().unwrap();
    m.save(dir.path()).unwrap();
    let mut doc = read_json(dir.path());
    doc["format_version"] = 99.into();
    write_json(dir.path(), &doc);

    let loaded = load(&h, dir.path());
    assert!(loaded.manager.is_none());
    assert!(loaded.entries[0].message.contains("Unsupported format version 99"));
}
