//! Seed scenario 5: a connection manager
//! acquires both the transport and engine it wires together, so deleting
//! either while the connection manager still exists must fail with `Busy`;
//! deleting the connection manager first must release both and let the
//! later deletes succeed.

mod common;

use serde_json::{json, Value};
use tempfile::tempdir;

use vde3::component::ComponentKind;
use vde3::error::Vde3Error;

#[tokio::test]
async fn transport_and_engine_stay_busy_until_the_connection_manager_is_gone() {
    let dir = tempdir().unwrap();
    let ctx = common::bare_context().await;
    ctx.new_component(ComponentKind::Engine, "hub", "e1", Value::Null).await.unwrap();
    ctx.new_component(ComponentKind::Transport, "vde2", "tr1", json!({ "dir": dir.path() })).await.unwrap();
    ctx.new_component(ComponentKind::ConnectionManager, "default", "cm1", json!({ "transport": "tr1", "engine": "e1" }))
        .await
        .unwrap();

    let err = ctx.delete_component("tr1").await.unwrap_err();
    assert!(matches!(err, Vde3Error::Busy(_)));
    let err = ctx.delete_component("e1").await.unwrap_err();
    assert!(matches!(err, Vde3Error::Busy(_)));

    ctx.delete_component("cm1").await.unwrap();

    ctx.delete_component("tr1").await.unwrap();
    ctx.delete_component("e1").await.unwrap();
}
