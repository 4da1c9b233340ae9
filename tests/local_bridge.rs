//! Seed scenario 2: two hub engines peered by
//! `localconnection::connect_engines` (no transport in between) must forward
//! frames from either hub's external ports to the other hub's external
//! ports, and detaching one external port must not disturb the bridge.

mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tempfile::tempdir;

use vde3::component::ComponentKind;
use vde3::localconnection::connect_engines;

#[tokio::test]
async fn frames_cross_the_bridge_both_ways_and_survive_a_port_closing() {
    let e1_dir = tempdir().unwrap();
    let e2_dir = tempdir().unwrap();
    let a1_dir = tempdir().unwrap();
    let a2_dir = tempdir().unwrap();
    let b1_dir = tempdir().unwrap();

    let ctx = common::bare_context().await;
    let e1 = ctx.new_component(ComponentKind::Engine, "hub", "e1", Value::Null).await.unwrap();
    let e2 = ctx.new_component(ComponentKind::Engine, "hub", "e2", Value::Null).await.unwrap();
    ctx.new_component(ComponentKind::Transport, "vde2", "tr1", json!({ "dir": e1_dir.path() })).await.unwrap();
    ctx.new_component(ComponentKind::Transport, "vde2", "tr2", json!({ "dir": e2_dir.path() })).await.unwrap();
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

    connect_engines(&e1, Value::Null, &e2, Value::Null).await.unwrap();

    let (_a1_ctx, a1) = common::dial_client(a1_dir.path(), e1_dir.path()).await;
    let (_b1_ctx, b1) = common::dial_client(b1_dir.path(), e2_dir.path()).await;

    let frame = common::sample_eth_frame();
    common::ports_of(&a1).remove(0).write(vde3::Packet::from_payload(0, 0, &frame)).await;
    assert!(common::wait_until(|| !common::received_of(&b1).is_empty(), Duration::from_secs(2)).await);
    assert_eq!(common::received_of(&b1)[0].1, frame);

    let frame_back: Vec<u8> = frame.iter().rev().cloned().collect();
    common::ports_of(&b1).remove(0).write(vde3::Packet::from_payload(0, 0, &frame_back)).await;
    assert!(common::wait_until(|| !common::received_of(&a1).is_empty(), Duration::from_secs(2)).await);
    assert_eq!(common::received_of(&a1)[0].1, frame_back);

    // Close a1, then attach a2 on e1's side; the bridge must still be intact.
    common::ports_of(&a1).remove(0).close().await;

    let (_a2_ctx, a2) = common::dial_client(a2_dir.path(), e1_dir.path()).await;
    common::ports_of(&b1).remove(0).write(vde3::Packet::from_payload(0, 0, &frame)).await;
    assert!(common::wait_until(|| !common::received_of(&a2).is_empty(), Duration::from_secs(2)).await);
    assert_eq!(common::received_of(&a2)[0].1, frame);
}
