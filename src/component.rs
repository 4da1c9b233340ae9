//! # Component
//!
//! The unit of behavior owned by a [`crate::context::Context`]. Grounded on
//! `examples/original_source/src/include/vde3/component.h` and
//! `priv/component.h`.
//!
//! The C source gives every component a `void *priv` pointer plus a table
//! of kind-specific function pointers that close over it. Rust trait
//! objects already own their state, so `KindOps` collapses both into one:
//! the `Arc<dyn EngineOps>` (etc.) stored in a `Component` *is* the hub's
//! port list, the control engine's dispatch table, and so on — there is no
//! separate opaque pointer to keep in sync with it. Constructing a
//! `Component` with a `KindOps` variant that doesn't match its declared
//! `ComponentKind` is a construction-time error.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::command::Command;
use crate::connection::Connection;
use crate::error::{Result, Vde3Error};
use crate::signal::Signal;

/// The four strictly-typed component kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Transport,
    Engine,
    ConnectionManager,
    ControlEngine,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Transport => "transport",
            ComponentKind::Engine => "engine",
            ComponentKind::ConnectionManager => "connection_manager",
            ComponentKind::ControlEngine => "control_engine",
        }
    }
}

/// Operations a transport component provides.
#[async_trait]
pub trait TransportOps: Send + Sync {
    /// Begin listening for inbound connections. Must invoke the component's
    /// `on_accept` callback once per accepted connection.
    async fn listen(&self, component: &Arc<Component>) -> Result<()>;

    /// Begin an outbound connection. Must invoke the component's
    /// `on_connect` callback on success, `on_error` on failure.
    async fn connect(&self, component: &Arc<Component>, request: Value) -> Result<()>;
}

/// Operations an engine (including the control engine) component provides.
#[async_trait]
pub trait EngineOps: Send + Sync {
    /// Accept a freshly authorized connection from a connection manager.
    /// Rejection (e.g. payload size too small) must leave the connection
    /// untouched so the caller can destroy it.
    async fn new_connection(&self, component: &Arc<Component>, conn: Connection) -> Result<()>;

    /// Lets a command closure recover the concrete engine (hub, ctrl, ...)
    /// behind this trait object, the way the C source's `vde_component_get_priv`
    /// hands a command function its private block.
    fn as_any(&self) -> &dyn std::any::Any;

    /// Called once, immediately after the owning `Component` is constructed,
    /// so an engine that needs to raise its own signals (`port_new`,
    /// `port_del`, ...) can remember a weak handle back to it. Default is a
    /// no-op for engines that never raise signals of their own.
    fn bind_component(&self, _component: &Arc<Component>) {}

    /// Called once by `Component::fini` before the component is dropped, so
    /// an engine holding live connections (the hub's ports) can tear them
    /// down. Default is a no-op for engines with nothing to close.
    async fn fini(&self) {}
}

/// Operations a connection-manager component provides.
#[async_trait]
pub trait ConnectionManagerOps: Send + Sync {
    async fn listen(&self, component: &Arc<Component>) -> Result<()>;
    async fn connect(&self, component: &Arc<Component>, local_request: Value, remote_request: Value) -> Result<()>;
}

/// A boxed, owned future — what a [`TransportCallbacks`] hook returns so its
/// caller can `.await` it to completion before relying on its side effects.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The connection-manager-facing callbacks a transport invokes. Each hook
/// returns a future the transport must `.await` before doing anything that
/// assumes the hook's side effects (chiefly: installing a consumer on the
/// connection) have already happened — a transport that spawns its read
/// loop without awaiting `on_accept`/`on_connect` first can race frames in
/// ahead of the consumer being set.
#[derive(Clone)]
pub struct TransportCallbacks {
    pub on_connect: Arc<dyn Fn(Connection) -> BoxFuture<'static, ()> + Send + Sync>,
    pub on_accept: Arc<dyn Fn(Connection) -> BoxFuture<'static, ()> + Send + Sync>,
    pub on_error: Arc<dyn Fn(Vde3Error) -> BoxFuture<'static, ()> + Send + Sync>,
}

/// The kind-specific operation table. Exactly one variant is populated,
/// matching the component's `ComponentKind`.
#[derive(Clone)]
pub enum KindOps {
    Transport(Arc<dyn TransportOps>),
    Engine(Arc<dyn EngineOps>),
    ConnectionManager(Arc<dyn ConnectionManagerOps>),
    ControlEngine(Arc<dyn EngineOps>),
}

impl KindOps {
    fn matches(&self, kind: ComponentKind) -> bool {
        matches!(
            (self, kind),
            (KindOps::Transport(_), ComponentKind::Transport)
                | (KindOps::Engine(_), ComponentKind::Engine)
                | (KindOps::ConnectionManager(_), ComponentKind::ConnectionManager)
                | (KindOps::ControlEngine(_), ComponentKind::ControlEngine)
        )
    }
}

/// A named, kind-tagged, reference-counted unit of behavior.
pub struct Component {
    name: String,
    kind: ComponentKind,
    family: String,
    ops: KindOps,
    refcount: AtomicUsize,
    initialized: AtomicBool,
    commands: IndexMap<String, Command>,
    signals: AsyncMutex<IndexMap<String, Signal>>,
    transport_callbacks: AsyncMutex<Option<TransportCallbacks>>,
}

impl Component {
    /// Construct a new component. `commands`/`signals` are typically
    /// produced by duplicating a module's shared templates.
    pub fn new(
        name: impl Into<String>,
        kind: ComponentKind,
        family: impl Into<String>,
        ops: KindOps,
        commands: Vec<Command>,
        signals: Vec<Signal>,
    ) -> Result<Arc<Component>> {
        if !ops.matches(kind) {
            return Err(Vde3Error::InvalidArgument(format!(
                "operations table does not match declared kind {:?}",
                kind
            )));
        }
        let mut command_map = IndexMap::new();
        for cmd in commands {
            command_map.insert(cmd.name().to_string(), cmd);
        }
        let mut signal_map = IndexMap::new();
        for sig in signals {
            signal_map.insert(sig.name().to_string(), sig);
        }
        Ok(Arc::new(Component {
            name: name.into(),
            kind,
            family: family.into(),
            ops,
            refcount: AtomicUsize::new(1),
            initialized: AtomicBool::new(true),
            commands: command_map,
            signals: AsyncMutex::new(signal_map),
            transport_callbacks: AsyncMutex::new(None),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    pub fn family(&self) -> &str {
        &self.family
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Increment the reference count. Called by every other component that
    /// keeps a handle to this one.
    pub fn acquire(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the reference count, returning the count *after* the
    /// decrement.
    pub fn release(&self) -> usize {
        self.refcount.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn command(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn commands(&self) -> impl Iterator<Item = &Command> {
        self.commands.values()
    }

    pub async fn signal(&self, name: &str, component: &Arc<Component>, info: &Value) -> Result<()> {
        let signals = self.signals.lock().await;
        match signals.get(name) {
            Some(sig) => {
                sig.raise(component.name(), info);
                Ok(())
            }
            None => Err(Vde3Error::NotFound(format!("signal {name}"))),
        }
    }

    pub async fn attach_signal(
        &self,
        name: &str,
        observer: Arc<dyn crate::signal::Observer>,
        destroyer: Arc<dyn crate::signal::Destroyer>,
    ) -> Result<()> {
        let mut signals = self.signals.lock().await;
        let sig = signals
            .get_mut(name)
            .ok_or_else(|| Vde3Error::NotFound(format!("signal {name}")))?;
        sig.attach(observer, destroyer)
    }

    pub async fn detach_signal(
        &self,
        name: &str,
        observer: &Arc<dyn crate::signal::Observer>,
        destroyer: &Arc<dyn crate::signal::Destroyer>,
    ) {
        let mut signals = self.signals.lock().await;
        if let Some(sig) = signals.get_mut(name) {
            sig.detach(observer, destroyer);
        }
    }

    pub fn transport_ops(&self) -> Option<Arc<dyn TransportOps>> {
        match &self.ops {
            KindOps::Transport(ops) => Some(ops.clone()),
            _ => None,
        }
    }

    pub fn engine_ops(&self) -> Option<Arc<dyn EngineOps>> {
        match &self.ops {
            KindOps::Engine(ops) | KindOps::ControlEngine(ops) => Some(ops.clone()),
            _ => None,
        }
    }

    pub fn conn_manager_ops(&self) -> Option<Arc<dyn ConnectionManagerOps>> {
        match &self.ops {
            KindOps::ConnectionManager(ops) => Some(ops.clone()),
            _ => None,
        }
    }

    pub async fn set_transport_callbacks(&self, callbacks: TransportCallbacks) {
        *self.transport_callbacks.lock().await = Some(callbacks);
    }

    pub async fn transport_callbacks(&self) -> Option<TransportCallbacks> {
        self.transport_callbacks.lock().await.clone()
    }

    /// Finalize the component: tear down the kind-specific ops (e.g. a hub
    /// engine closing every port), then finalize every signal, running
    /// destroy callbacks exactly once per attached observer.
    pub async fn fini(&self) {
        if let Some(engine_ops) = self.engine_ops() {
            engine_ops.fini().await;
        }
        let mut signals = self.signals.lock().await;
        for sig in signals.values_mut() {
            sig.fini(&self.name);
        }
        self.initialized.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("family", &self.family)
            .field("refcount", &self.refcount())
            .finish_non_exhaustive()
    }
}
