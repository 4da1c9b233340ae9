//! # Hub forwarding engine
//!
//! Broadcasts every inbound frame to every other attached port. Grounded on
//! `examples/original_source/src/engine_hub.c` (`hub_engine_readcb`,
//! `hub_engine_errorcb`, `hub_engine_newconn`, `engine_hub_fini`).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::command::{Command, CommandFn};
use crate::component::{Component, ComponentKind, EngineOps, KindOps};
use crate::connection::{CallbackOutcome, Connection, ConnectionConsumer};
use crate::error::{Result, Vde3Error};
use crate::module::{Module, ModuleFactory, ModuleRegistry};
use crate::packet::Packet;
use crate::signal::Signal;

use std::time::Duration;

/// Full 802.3 frame size; a connection whose `max_payload` is non-zero and
/// smaller than this cannot carry a hub port.
const FULL_ETH_FRAME: usize = 1514;

/// `TIMES`/`TIMEOUT` from the C source's `packetq.c` borrow: ten retries at
/// five seconds apiece before a port's queue gives up on a frame.
const HUB_SEND_MAX_TRIES: u32 = 10;
const HUB_SEND_TIMEOUT: Duration = Duration::from_secs(5);

struct HubEngine {
    self_weak: std::sync::Weak<HubEngine>,
    component: Mutex<Option<Arc<Component>>>,
    ports: Mutex<Vec<Connection>>,
}

impl HubEngine {
    fn port_count(&self) -> usize {
        self.ports.lock().unwrap().len()
    }

    async fn raise(&self, signal: &str, info: Value) {
        let component = self.component.lock().unwrap().clone();
        if let Some(component) = component {
            if let Err(e) = component.signal(signal, &component, &info).await {
                warn!("hub engine could not raise {signal}: {e}");
            }
        }
    }
}

#[async_trait]
impl EngineOps for HubEngine {
    async fn new_connection(&self, _component: &Arc<Component>, conn: Connection) -> Result<()> {
        if conn.max_payload() != 0 && conn.max_payload() < FULL_ETH_FRAME {
            return Err(Vde3Error::InvalidArgument(format!(
                "connection max_payload {} too small for a hub port (need >= {FULL_ETH_FRAME} or 0)",
                conn.max_payload()
            )));
        }

        let me = self.self_weak.upgrade().expect("hub engine outlives its own connections");
        conn.set_consumer(me).await;
        conn.set_pkt_properties(0, 0);
        conn.set_send_properties(HUB_SEND_MAX_TRIES, HUB_SEND_TIMEOUT).await;

        let count = {
            let mut ports = self.ports.lock().unwrap();
            ports.insert(0, conn);
            ports.len()
        };
        self.raise("port_new", json!([count])).await;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn bind_component(&self, component: &Arc<Component>) {
        *self.component.lock().unwrap() = Some(component.clone());
    }

    /// Tear down every remaining port and drop the ports list.
    async fn fini(&self) {
        let ports: Vec<Connection> = self.ports.lock().unwrap().drain(..).collect();
        for port in ports {
            port.close().await;
        }
    }
}

#[async_trait]
impl ConnectionConsumer for HubEngine {
    /// Broadcast to every port but the source; the individual write outcomes
    /// are ignored — drops are acceptable, the transport already logs them.
    async fn read(&self, conn: &Connection, pkt: Packet) -> CallbackOutcome {
        let ports: Vec<Connection> = self.ports.lock().unwrap().clone();
        for port in &ports {
            if port != conn {
                let _ = port.write(pkt.faithful_copy()).await;
            }
        }
        CallbackOutcome::Continue
    }

    async fn error(&self, conn: &Connection, _pkt: Option<Packet>, err: Vde3Error) -> CallbackOutcome {
        if err.is_transient() {
            debug!("hub port {} degraded: {}", conn.id(), err);
            return CallbackOutcome::Continue;
        }
        let count = {
            let mut ports = self.ports.lock().unwrap();
            ports.retain(|p| p != conn);
            ports.len()
        };
        self.raise("port_del", json!([count])).await;
        CallbackOutcome::Close
    }
}

struct HubFactory;

#[async_trait]
impl ModuleFactory for HubFactory {
    async fn build(&self, _ctx: &crate::context::Context, _args: Value) -> Result<KindOps> {
        let hub = Arc::new_cyclic(|weak| HubEngine {
            self_weak: weak.clone(),
            component: Mutex::new(None),
            ports: Mutex::new(Vec::new()),
        });
        Ok(KindOps::Engine(hub))
    }
}

fn status_command() -> Command {
    let func: CommandFn = Arc::new(|component: &Component, _params: &Value| -> Result<Value> {
        let ops = component
            .engine_ops()
            .ok_or_else(|| Vde3Error::InvalidArgument("status: not a hub engine".into()))?;
        let hub = ops
            .as_any()
            .downcast_ref::<HubEngine>()
            .ok_or_else(|| Vde3Error::InvalidArgument("status: not a hub engine".into()))?;
        Ok(json!(hub.port_count()))
    });
    Command::new("status", "number of attached ports", json!([]), func)
}

fn printport_command() -> Command {
    let func: CommandFn = Arc::new(|component: &Component, params: &Value| -> Result<Value> {
        let hub = component
            .engine_ops()
            .ok_or_else(|| Vde3Error::InvalidArgument("printport: not a hub engine".into()))?;
        let hub = hub
            .as_any()
            .downcast_ref::<HubEngine>()
            .ok_or_else(|| Vde3Error::InvalidArgument("printport: not a hub engine".into()))?;
        let index = params
            .get(0)
            .and_then(Value::as_u64)
            .ok_or_else(|| Vde3Error::InvalidArgument("printport: expected an integer port index".into()))?;
        let count = hub.port_count();
        if index as usize >= count {
            return Err(Vde3Error::InvalidArgument(format!("port {index} out of range (have {count})")));
        }
        Ok(json!(format!("port {index} of {count}")))
    });
    Command::new("printport", "describe one attached port", json!([{"index": "integer"}]), func)
}

/// Register the `hub` family under `ComponentKind::Engine`.
pub fn register(registry: &mut ModuleRegistry) -> Result<()> {
    let commands = vec![status_command(), printport_command()];
    let signals = vec![
        Signal::new("port_new", "fires with [port_count] when a port attaches"),
        Signal::new("port_del", "fires with [port_count] when a port detaches"),
    ];
    registry.register(Module::new(ComponentKind::Engine, "hub", commands, signals, Arc::new(HubFactory)))
}
