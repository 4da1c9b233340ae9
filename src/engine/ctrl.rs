//! # Control engine (ctrl family)
//!
//! A JSON-RPC 1.0 front-end onto the rest of the context: every attached
//! connection gets its own client record that frames inbound NUL-delimited
//! messages, dispatches them against named components, and streams
//! subscribed signals back as notifications. Grounded on
//! `examples/original_source/src/engine_ctrl.c`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::warn;

use crate::command::{Command, CommandFn};
use crate::component::{Component, ComponentKind, EngineOps, KindOps};
use crate::connection::{CallbackOutcome, Connection, ConnectionConsumer, WriteStatus};
use crate::context::Context;
use crate::error::{Result, Vde3Error};
use crate::module::{Module, ModuleFactory, ModuleRegistry};
use crate::packet::Packet;
use crate::rpc::{RpcNotification, RpcReply, RpcRequest};
use crate::signal::{Destroyer, Observer};

/// Per-connection inbound accumulation cap.
const INBOUND_BUFFER_CAP: usize = 8192;

struct Subscription {
    full_path: String,
    observer: Arc<dyn Observer>,
    destroyer: Arc<dyn Destroyer>,
}

/// State for one control connection: `notify_add`/`notify_del` subscribe
/// this per-connection record, not the component, as the receiver.
struct CtrlClient {
    self_weak: Weak<CtrlClient>,
    conn: Connection,
    engine: Arc<CtrlEngine>,
    inbound: Mutex<Vec<u8>>,
    outbound_queue: Mutex<VecDeque<Vec<u8>>>,
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl CtrlClient {
    /// Frame `payload` with its trailing NUL, split it to `max_payload`-sized
    /// chunks if needed, and kick off draining if the queue was idle (spec
    /// §4.5, "Outbound").
    fn push_outbound(&self, payload: Vec<u8>) {
        let mut framed = payload;
        framed.push(0u8);

        let max_payload = self.conn.max_payload();
        let mut queue = self.outbound_queue.lock().unwrap();
        let was_idle = queue.is_empty();
        if max_payload == 0 {
            queue.push_back(framed);
        } else {
            for chunk in framed.chunks(max_payload.max(1)) {
                queue.push_back(chunk.to_vec());
            }
        }
        drop(queue);

        if was_idle {
            let client = self.self_weak.upgrade().expect("client outlives its own outbound queue");
            tokio::spawn(async move { client.drain_outbound().await });
        }
    }

    /// Sends the head of the queue and stops; `write_complete` resumes
    /// draining, preserving submission order per connection.
    async fn drain_outbound(&self) {
        let chunk = { self.outbound_queue.lock().unwrap().front().cloned() };
        let Some(chunk) = chunk else { return };
        let pkt = Packet::from_payload(0, 0, &chunk);
        match self.conn.write(pkt).await {
            WriteStatus::Accepted | WriteStatus::Again => {}
            WriteStatus::Fatal(_) => {
                self.outbound_queue.lock().unwrap().clear();
            }
        }
    }

    async fn dispatch(&self, message: &[u8]) {
        let request = match RpcRequest::parse(message) {
            Ok(request) => request,
            Err(e) => {
                warn!("ctrl connection {}: malformed request: {}", self.conn.id(), e);
                return;
            }
        };

        let self_name = self.engine.component_name();
        let reply = if request.component == self_name && matches!(request.callable.as_str(), "notify_add" | "notify_del") {
            self.handle_notify(&request).await
        } else {
            self.dispatch_generic(&request).await
        };
        self.push_outbound(reply.to_bytes());
    }

    async fn dispatch_generic(&self, request: &RpcRequest) -> RpcReply {
        let component = match self.engine.ctx.get_component(&request.component).await {
            Some(component) => component,
            None => return RpcReply::failure(request.id, &Vde3Error::NotFound(format!("component {}", request.component))),
        };
        let command = match component.command(&request.callable) {
            Some(command) => command,
            None => return RpcReply::failure(request.id, &Vde3Error::NotFound(format!("command {}", request.callable))),
        };
        match command.invoke(&component, &Value::Array(request.params.clone())) {
            Ok(result) => RpcReply::success(request.id, result),
            Err(e) => RpcReply::failure(request.id, &e),
        }
    }

    async fn handle_notify(&self, request: &RpcRequest) -> RpcReply {
        let Some(full_path) = request.params.first().and_then(Value::as_str).map(str::to_string) else {
            return RpcReply::failure(request.id, &Vde3Error::InvalidArgument(format!("{} expects a string path", request.callable)));
        };
        match request.callable.as_str() {
            "notify_add" => match self.subscribe(&full_path).await {
                Ok(()) => RpcReply::success(request.id, json!(true)),
                Err(e) => RpcReply::failure(request.id, &e),
            },
            "notify_del" => {
                self.unsubscribe(&full_path).await;
                RpcReply::success(request.id, json!(true))
            }
            other => RpcReply::failure(request.id, &Vde3Error::NotFound(format!("command {other}"))),
        }
    }

    /// `notify_add(full_path)`: split into `(component, signal)`, look up
    /// both, attach an observer that re-streams the raise as a notification
    /// on this connection, and record the subscription.
    async fn subscribe(&self, full_path: &str) -> Result<()> {
        let (component_name, signal_name) = full_path
            .split_once('.')
            .ok_or_else(|| Vde3Error::InvalidArgument(format!("malformed notification path {full_path:?}")))?;
        let component = self
            .engine
            .ctx
            .get_component(component_name)
            .await
            .ok_or_else(|| Vde3Error::NotFound(format!("component {component_name}")))?;

        let client = self.self_weak.upgrade().expect("client outlives its own subscriptions");
        let notify_path = full_path.to_string();
        let observer: Arc<dyn Observer> = Arc::new(move |_c: &str, _s: &str, info: &Value| {
            let note = RpcNotification::new(notify_path.clone(), info.clone());
            client.push_outbound(note.to_bytes());
        });

        let subs_on_destroy = self.subscriptions.clone();
        let path_on_destroy = full_path.to_string();
        let destroyer: Arc<dyn Destroyer> = Arc::new(move |_c: &str, _s: &str| {
            subs_on_destroy.lock().unwrap().retain(|s| s.full_path != path_on_destroy);
        });

        component.attach_signal(signal_name, observer.clone(), destroyer.clone()).await?;
        self.subscriptions
            .lock()
            .unwrap()
            .push(Subscription { full_path: full_path.to_string(), observer, destroyer });
        Ok(())
    }

    /// `notify_del(full_path)`: reverse the attach; a no-op if `full_path`
    /// was never subscribed on this connection.
    async fn unsubscribe(&self, full_path: &str) {
        let removed = {
            let mut subs = self.subscriptions.lock().unwrap();
            subs.iter().position(|s| s.full_path == full_path).map(|i| subs.remove(i))
        };
        let Some(sub) = removed else { return };
        if let Some((component_name, signal_name)) = full_path.split_once('.') {
            if let Some(component) = self.engine.ctx.get_component(component_name).await {
                component.detach_signal(signal_name, &sub.observer, &sub.destroyer).await;
            }
        }
    }

    /// Detach from every subscribed signal.
    async fn teardown(&self) {
        let subs: Vec<Subscription> = std::mem::take(&mut *self.subscriptions.lock().unwrap());
        for sub in subs {
            if let Some((component_name, signal_name)) = sub.full_path.split_once('.') {
                if let Some(component) = self.engine.ctx.get_component(component_name).await {
                    component.detach_signal(signal_name, &sub.observer, &sub.destroyer).await;
                }
            }
        }
        self.outbound_queue.lock().unwrap().clear();
    }
}

#[async_trait]
impl ConnectionConsumer for CtrlClient {
    /// Accumulates `pkt` into the inbound buffer, splits on NUL, and
    /// dispatches every complete message.
    async fn read(&self, _conn: &Connection, pkt: Packet) -> CallbackOutcome {
        let mut messages = Vec::new();
        let mut message_too_large = false;
        {
            let mut buf = self.inbound.lock().unwrap();
            buf.extend_from_slice(pkt.payload());

            loop {
                match buf.iter().position(|&b| b == 0) {
                    Some(pos) => {
                        let message = buf[..pos].to_vec();
                        buf.drain(..=pos);
                        if message.len() > INBOUND_BUFFER_CAP {
                            message_too_large = true;
                        } else {
                            messages.push(message);
                        }
                    }
                    None => break,
                }
            }

            if buf.len() > INBOUND_BUFFER_CAP {
                warn!("ctrl connection {}: inbound fragment exceeded {} bytes, dropping", self.conn.id(), INBOUND_BUFFER_CAP);
                buf.clear();
            }
        }

        for message in &messages {
            self.dispatch(message).await;
        }

        if message_too_large {
            self.teardown().await;
            return CallbackOutcome::Close;
        }
        CallbackOutcome::Continue
    }

    async fn write_complete(&self, _conn: &Connection, _pkt: Packet) -> CallbackOutcome {
        self.outbound_queue.lock().unwrap().pop_front();
        self.drain_outbound().await;
        CallbackOutcome::Continue
    }

    async fn error(&self, _conn: &Connection, _pkt: Option<Packet>, _err: Vde3Error) -> CallbackOutcome {
        self.teardown().await;
        CallbackOutcome::Close
    }
}

struct CtrlEngine {
    self_weak: Weak<CtrlEngine>,
    component: Mutex<Option<Arc<Component>>>,
    ctx: Context,
}

impl CtrlEngine {
    fn component_name(&self) -> String {
        self.component.lock().unwrap().as_ref().map(|c| c.name().to_string()).unwrap_or_default()
    }
}

#[async_trait]
impl EngineOps for CtrlEngine {
    async fn new_connection(&self, _component: &Arc<Component>, conn: Connection) -> Result<()> {
        let engine = self.self_weak.upgrade().expect("ctrl engine outlives its own connections");
        let client = Arc::new_cyclic(|weak| CtrlClient {
            self_weak: weak.clone(),
            conn: conn.clone(),
            engine,
            inbound: Mutex::new(Vec::new()),
            outbound_queue: Mutex::new(VecDeque::new()),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        });
        conn.set_consumer(client).await;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn bind_component(&self, component: &Arc<Component>) {
        *self.component.lock().unwrap() = Some(component.clone());
    }
}

struct CtrlFactory;

#[async_trait]
impl ModuleFactory for CtrlFactory {
    async fn build(&self, ctx: &Context, _args: Value) -> Result<KindOps> {
        let engine = Arc::new_cyclic(|weak| CtrlEngine {
            self_weak: weak.clone(),
            component: Mutex::new(None),
            ctx: ctx.clone(),
        });
        Ok(KindOps::ControlEngine(engine))
    }
}

/// Documented as a command for introspection, but actual invocation is
/// intercepted by `CtrlClient::dispatch` before it ever reaches here — the
/// subscription is per-connection, not per-component.
fn notify_add_command() -> Command {
    let func: CommandFn = Arc::new(|_component: &Component, _params: &Value| -> Result<Value> {
        Err(Vde3Error::InvalidArgument("notify_add is dispatched against the connection, not invoked directly".into()))
    });
    Command::new("notify_add", "subscribe this control connection to a signal", json!(["component.signal"]), func)
}

fn notify_del_command() -> Command {
    let func: CommandFn = Arc::new(|_component: &Component, _params: &Value| -> Result<Value> {
        Err(Vde3Error::InvalidArgument("notify_del is dispatched against the connection, not invoked directly".into()))
    });
    Command::new("notify_del", "unsubscribe this control connection from a signal", json!(["component.signal"]), func)
}

/// Register the `ctrl` family under `ComponentKind::ControlEngine`.
pub fn register(registry: &mut ModuleRegistry) -> Result<()> {
    let commands = vec![notify_add_command(), notify_del_command()];
    registry.register(Module::new(ComponentKind::ControlEngine, "ctrl", commands, vec![], Arc::new(CtrlFactory)))
}
