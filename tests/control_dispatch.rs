//! Seed scenario 3: a JSON-RPC request sent
//! over a control-plane connection must be routed to the named component's
//! command and answered with the matching `id`.

mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tempfile::tempdir;

use vde3::component::ComponentKind;

fn parse_reply(bytes: &[u8]) -> Value {
    let trimmed = bytes.strip_suffix(&[0u8]).unwrap_or(bytes);
    serde_json::from_slice(trimmed).expect("reply is valid JSON")
}

#[tokio::test]
async fn status_and_printport_are_dispatched_to_the_named_component() {
    let hub_dir = tempdir().unwrap();
    let ctrl_dir = tempdir().unwrap();
    let mut port_dirs = Vec::new();
    for _ in 0..4 {
        port_dirs.push(tempdir().unwrap());
    }
    let rpc_dir = tempdir().unwrap();

    let ctx = common::bare_context().await;
    ctx.new_component(ComponentKind::Engine, "hub", "e1", Value::Null).await.unwrap();
    ctx.new_component(ComponentKind::ControlEngine, "ctrl", "e2", Value::Null).await.unwrap();
    ctx.new_component(ComponentKind::Transport, "vde2", "tr1", json!({ "dir": hub_dir.path() })).await.unwrap();
    ctx.new_component(ComponentKind::Transport, "vde2", "tr2", json!({ "dir": ctrl_dir.path() })).await.unwrap();
    let cm1 = ctx
        .new_component(ComponentKind::ConnectionManager, "default", "cm1", json!({ "transport": "tr1", "engine": "e1" }))
        .await
        .unwrap();
    let cm2 = ctx
        .new_component(ComponentKind::ConnectionManager, "default", "cm2", json!({ "transport": "tr2", "engine": "e2" }))
        .await
        .unwrap();
    cm1.conn_manager_ops().unwrap().listen(&cm1).await.unwrap();
    cm2.conn_manager_ops().unwrap().listen(&cm2).await.unwrap();

    let mut ports = Vec::new();
    for dir in &port_dirs {
        ports.push(common::dial_client(dir.path(), hub_dir.path()).await);
    }

    let (_rpc_ctx, rpc_client) = common::dial_client(rpc_dir.path(), ctrl_dir.path()).await;
    let rpc_port = common::ports_of(&rpc_client).remove(0);

    let status_req = serde_json::to_vec(&json!({"id": 1, "method": "e1.status", "params": []})).unwrap();
    let mut status_req = status_req;
    status_req.push(0);
    rpc_port.write(vde3::Packet::from_payload(0, 0, &status_req)).await;

    assert!(common::wait_until(|| !common::received_of(&rpc_client).is_empty(), Duration::from_secs(2)).await);
    let reply = parse_reply(&common::received_of(&rpc_client)[0].1);
    assert_eq!(reply["id"], json!(1));
    assert_eq!(reply["result"], json!(4));
    assert!(reply["error"].is_null());

    let mut printport_req = serde_json::to_vec(&json!({"id": 2, "method": "e1.printport", "params": [3]})).unwrap();
    printport_req.push(0);
    rpc_port.write(vde3::Packet::from_payload(0, 0, &printport_req)).await;

    assert!(common::wait_until(|| common::received_of(&rpc_client).len() >= 2, Duration::from_secs(2)).await);
    let reply2 = parse_reply(&common::received_of(&rpc_client)[1].1);
    assert_eq!(reply2["id"], json!(2));
    assert!(reply2["error"].is_null());
    assert!(reply2["result"].as_str().unwrap().contains('3'));
}
