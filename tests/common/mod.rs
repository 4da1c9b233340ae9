//! Shared test scaffolding for the end-to-end scenarios in this crate's
//! integration tests: a minimal engine that records every port it gets and
//! every frame each port reads, usable as a stand-in "client" NIC on either
//! side of a transport.

use std::path::Path;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};

use vde3::component::{Component, ComponentKind, EngineOps, KindOps};
use vde3::connection::{CallbackOutcome, Connection, ConnectionConsumer};
use vde3::context::Context;
use vde3::error::{Result, Vde3Error};
use vde3::module::{Module, ModuleFactory, ModuleRegistry};
use vde3::packet::Packet;

pub struct RecordingEngine {
    self_weak: Weak<RecordingEngine>,
    ports: Mutex<Vec<Connection>>,
    received: Mutex<Vec<(u64, Vec<u8>)>>,
}

impl RecordingEngine {
    pub fn ports(&self) -> Vec<Connection> {
        self.ports.lock().unwrap().clone()
    }

    pub fn received(&self) -> Vec<(u64, Vec<u8>)> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineOps for RecordingEngine {
    async fn new_connection(&self, _component: &Arc<Component>, conn: Connection) -> Result<()> {
        let me = self.self_weak.upgrade().expect("engine outlives its own connections");
        conn.set_consumer(me).await;
        self.ports.lock().unwrap().push(conn);
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[async_trait]
impl ConnectionConsumer for RecordingEngine {
    async fn read(&self, conn: &Connection, pkt: Packet) -> CallbackOutcome {
        self.received.lock().unwrap().push((conn.id(), pkt.payload().to_vec()));
        CallbackOutcome::Continue
    }

    async fn error(&self, conn: &Connection, _pkt: Option<Packet>, _err: Vde3Error) -> CallbackOutcome {
        self.ports.lock().unwrap().retain(|p| p != conn);
        CallbackOutcome::Close
    }
}

struct RecordingFactory;

#[async_trait]
impl ModuleFactory for RecordingFactory {
    async fn build(&self, _ctx: &Context, _args: Value) -> Result<KindOps> {
        Ok(KindOps::Engine(Arc::new_cyclic(|weak| RecordingEngine {
            self_weak: weak.clone(),
            ports: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
        })))
    }
}

/// Every engine returned by `engine_ops()` is a trait object; pull the
/// concrete `RecordingEngine` back out the way the hub/ctrl engines'
/// own command closures do (`as_any().downcast_ref`).
pub fn ports_of(component: &Component) -> Vec<Connection> {
    component.engine_ops().unwrap().as_any().downcast_ref::<RecordingEngine>().unwrap().ports()
}

pub fn received_of(component: &Component) -> Vec<(u64, Vec<u8>)> {
    component.engine_ops().unwrap().as_any().downcast_ref::<RecordingEngine>().unwrap().received()
}

/// A bare context with the built-in modules plus `recording`.
pub async fn bare_context() -> Context {
    let ctx = Context::new();
    ctx.init(&[]).await.unwrap();
    ctx.register_module(Module::new(ComponentKind::Engine, "recording", vec![], vec![], Arc::new(RecordingFactory)))
        .await
        .unwrap();
    ctx
}

/// Build a context with one `vde2` transport, one `recording` engine, and a
/// connection manager dialing out to `remote_dir`. Returns the context and
/// the `recording` component so the caller can inspect `ports_of`/`received_of`.
pub async fn dial_client(own_dir: &Path, remote_dir: &Path) -> (Context, Arc<Component>) {
    let ctx = bare_context().await;
    ctx.new_component(ComponentKind::Engine, "recording", "client", Value::Null).await.unwrap();
    ctx.new_component(ComponentKind::Transport, "vde2", "tr", json!({ "dir": own_dir })).await.unwrap();
    let cm = ctx
        .new_component(ComponentKind::ConnectionManager, "default", "cm", json!({ "transport": "tr", "engine": "client" }))
        .await
        .unwrap();
    cm.conn_manager_ops()
        .unwrap()
        .connect(&cm, json!({ "dir": remote_dir }), Value::Null)
        .await
        .unwrap();
    let client = ctx.get_component("client").await.unwrap();
    (ctx, client)
}

/// A 64-byte Ethernet frame used across the integration tests:
/// `00:00:00:00:00:01 | 00:00:00:00:00:02 | 0x0800 | 50x0x41`.
pub fn sample_eth_frame() -> Vec<u8> {
    let mut frame = Vec::with_capacity(64);
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x01]);
    frame.extend_from_slice(&[0x00, 0x00, 0x00, 0x00, 0x00, 0x02]);
    frame.extend_from_slice(&[0x08, 0x00]);
    frame.extend(std::iter::repeat(0x41u8).take(50));
    frame
}

pub async fn wait_until(mut cond: impl FnMut() -> bool, timeout: std::time::Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
