//! # Connection manager
//!
//! Pairs one Transport with one Engine and drives every connection through
//! the handshake state machine before handing it off. The handshake state
//! table is treated as the authoritative description of behavior, rather
//! than a literal translation of `examples/original_source/src/conn_manager.c`,
//! which is itself an unfinished sketch (undefined locals, bare `// TODO`
//! markers).
//!
//! `do_remote_auth=true` is accepted at construction but any connection that
//! would actually need to negotiate it is rejected with
//! [`Vde3Error::InvalidArgument`]: the wire format for that handshake is an
//! open question the source only gestures at.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, warn};

use crate::component::{Component, ComponentKind, ConnectionManagerOps, KindOps, TransportCallbacks};
use crate::connection::Connection;
use crate::context::Context;
use crate::error::{Result, Vde3Error};
use crate::module::{Module, ModuleFactory, ModuleRegistry};

/// The nine handshake states a pending connection moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    ConnectWait,
    AuthReqSent,
    AuthReqWait,
    AuthReplySent,
    AuthReplyWait,
    NotAuthorized,
    Authorized,
}

/// Bookkeeping record held during handshake.
#[derive(Clone)]
pub struct PendingConnection {
    pub connection: Connection,
    pub local_request: Value,
    pub remote_request: Value,
    pub state: PendingState,
}

struct ConnectionManager {
    self_weak: Weak<ConnectionManager>,
    transport: Arc<Component>,
    engine: Arc<Component>,
    do_remote_auth: bool,
    /// Keyed by `Connection::id()` — "lookups of pending records are by
    /// connection identity ... not by address".
    pending: Mutex<HashMap<u64, PendingConnection>>,
    /// Outbound connect requests that have not yet produced a `Connection`
    /// object (the `ConnectWait` state, before the transport's `on_connect`
    /// fires). FIFO because this transport contract delivers `on_connect`
    /// callbacks in the order `connect()` was called.
    connect_wait: Mutex<VecDeque<(Value, Value)>>,
    callbacks_installed: std::sync::atomic::AtomicBool,
}

impl ConnectionManager {
    async fn finish_accept(&self, conn: Connection, local_request: Value, remote_request: Value) {
        let id = conn.id();
        if self.do_remote_auth {
            warn!(
                "connection {id}: remote authorization is not implemented, refusing"
            );
            self.pending.lock().unwrap().remove(&id);
            conn.close().await;
            return;
        }

        self.pending.lock().unwrap().insert(
            id,
            PendingConnection {
                connection: conn.clone(),
                local_request,
                remote_request,
                state: PendingState::Authorized,
            },
        );
        self.finalize(id).await;
    }

    /// `Authorized -> (removed from pending list): call engine.new_connection;
    /// invoke success callback`.
    async fn finalize(&self, id: u64) {
        let pending = self.pending.lock().unwrap().remove(&id);
        let Some(pending) = pending else { return };

        let Some(engine_ops) = self.engine.engine_ops() else {
            error!("connection manager: bound engine {} has no engine ops", self.engine.name());
            pending.connection.close().await;
            return;
        };

        match engine_ops.new_connection(&self.engine, pending.connection.clone()).await {
            Ok(()) => {}
            Err(e) => {
                warn!("engine {} refused connection {id}: {e}", self.engine.name());
                pending.connection.close().await;
            }
        }
    }

    async fn handle_transport_error(&self, err: Vde3Error) {
        error!("connection manager: transport {} reported a fatal error: {err}", self.transport.name());
    }

    /// Wire this connection manager's callbacks onto its bound transport,
    /// exactly once, regardless of whether `listen()`, `connect()`, or both
    /// are used on the same instance.
    async fn ensure_callbacks_installed(&self) {
        if self.callbacks_installed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let me = self.self_weak.upgrade().expect("connection manager outlives its own callbacks");

        let me_connect = me.clone();
        let me_accept = me.clone();
        let me_error = me.clone();
        self.transport
            .set_transport_callbacks(TransportCallbacks {
                // Awaited by the transport before it starts reading frames off
                // the new connection, so `finish_accept` (which installs the
                // consumer via `engine.new_connection`) always runs to
                // completion first.
                on_connect: Arc::new(move |conn| {
                    let me = me_connect.clone();
                    Box::pin(async move {
                        let (local, remote) = me
                            .connect_wait
                            .lock()
                            .unwrap()
                            .pop_front()
                            .unwrap_or((Value::Null, Value::Null));
                        me.finish_accept(conn, local, remote).await;
                    })
                }),
                on_accept: Arc::new(move |conn| {
                    let me = me_accept.clone();
                    Box::pin(async move {
                        me.finish_accept(conn, Value::Null, Value::Null).await;
                    })
                }),
                on_error: Arc::new(move |err| {
                    let me = me_error.clone();
                    Box::pin(async move {
                        me.handle_transport_error(err).await;
                    })
                }),
            })
            .await;
    }
}

impl Drop for ConnectionManager {
    /// Pairs the `acquire()` calls the factory made on `transport`/`engine`:
    /// once the last `Arc<Component>` wrapping this connection manager goes
    /// away (`Context::delete_component` removed it), the components it
    /// bound are no longer held busy on its account.
    fn drop(&mut self) {
        self.transport.release();
        self.engine.release();
    }
}

#[async_trait]
impl ConnectionManagerOps for ConnectionManager {
    async fn listen(&self, _component: &Arc<Component>) -> Result<()> {
        self.ensure_callbacks_installed().await;
        let transport_ops = self
            .transport
            .transport_ops()
            .ok_or_else(|| Vde3Error::InvalidArgument("bound component is not a transport".into()))?;
        transport_ops.listen(&self.transport).await
    }

    async fn connect(&self, _component: &Arc<Component>, local_request: Value, remote_request: Value) -> Result<()> {
        self.ensure_callbacks_installed().await;
        self.connect_wait.lock().unwrap().push_back((local_request.clone(), remote_request));

        let transport_ops = self
            .transport
            .transport_ops()
            .ok_or_else(|| Vde3Error::InvalidArgument("bound component is not a transport".into()))?;
        transport_ops.connect(&self.transport, local_request).await
    }
}

struct ConnectionManagerFactory;

#[async_trait]
impl ModuleFactory for ConnectionManagerFactory {
    async fn build(&self, ctx: &Context, args: Value) -> Result<KindOps> {
        let transport_name = args
            .get("transport")
            .and_then(Value::as_str)
            .ok_or_else(|| Vde3Error::InvalidArgument("connection_manager requires a \"transport\" name".into()))?;
        let engine_name = args
            .get("engine")
            .and_then(Value::as_str)
            .ok_or_else(|| Vde3Error::InvalidArgument("connection_manager requires an \"engine\" name".into()))?;
        let do_remote_auth = args.get("do_remote_auth").and_then(Value::as_bool).unwrap_or(false);

        let transport = ctx
            .get_component(transport_name)
            .await
            .ok_or_else(|| Vde3Error::NotFound(format!("component {transport_name}")))?;
        if transport.kind() != ComponentKind::Transport {
            return Err(Vde3Error::InvalidArgument(format!("{transport_name} is not a transport")));
        }
        let engine = ctx
            .get_component(engine_name)
            .await
            .ok_or_else(|| Vde3Error::NotFound(format!("component {engine_name}")))?;
        if !matches!(engine.kind(), ComponentKind::Engine | ComponentKind::ControlEngine) {
            return Err(Vde3Error::InvalidArgument(format!("{engine_name} is not an engine")));
        }

        transport.acquire();
        engine.acquire();

        let cm = Arc::new_cyclic(|weak| ConnectionManager {
            self_weak: weak.clone(),
            transport,
            engine,
            do_remote_auth,
            pending: Mutex::new(HashMap::new()),
            connect_wait: Mutex::new(VecDeque::new()),
            callbacks_installed: std::sync::atomic::AtomicBool::new(false),
        });
        Ok(KindOps::ConnectionManager(cm))
    }
}

/// Register the default connection-manager family under `ComponentKind::ConnectionManager`.
pub fn register(registry: &mut ModuleRegistry) -> Result<()> {
    registry.register(Module::new(
        ComponentKind::ConnectionManager,
        "default",
        vec![],
        vec![],
        Arc::new(ConnectionManagerFactory),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::EngineOps;
    use crate::connection::{Connection as Conn, TransportBackend, WriteStatus};
    use crate::packet::Packet;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct NullBackend;
    #[async_trait]
    impl TransportBackend for NullBackend {
        async fn write(&self, _pkt: Packet) -> WriteStatus {
            WriteStatus::Accepted
        }
        async fn close(&self) {}
    }

    struct CountingEngine {
        accepted: AtomicUsize,
    }
    #[async_trait]
    impl EngineOps for CountingEngine {
        async fn new_connection(&self, _c: &Arc<Component>, _conn: Connection) -> Result<()> {
            self.accepted.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    struct NoopTransport;
    #[async_trait]
    impl crate::component::TransportOps for NoopTransport {
        async fn listen(&self, _c: &Arc<Component>) -> Result<()> {
            Ok(())
        }
        async fn connect(&self, _c: &Arc<Component>, _req: Value) -> Result<()> {
            Ok(())
        }
    }

    async fn build_cm(do_remote_auth: bool) -> (Arc<ConnectionManager>, Arc<Component>, Arc<Component>) {
        let transport = Component::new(
            "tr1",
            ComponentKind::Transport,
            "noop",
            KindOps::Transport(Arc::new(NoopTransport)),
            vec![],
            vec![],
        )
        .unwrap();
        let engine = Component::new(
            "e1",
            ComponentKind::Engine,
            "counting",
            KindOps::Engine(Arc::new(CountingEngine { accepted: AtomicUsize::new(0) })),
            vec![],
            vec![],
        )
        .unwrap();
        transport.acquire();
        engine.acquire();
        let cm = Arc::new_cyclic(|weak| ConnectionManager {
            self_weak: weak.clone(),
            transport: transport.clone(),
            engine: engine.clone(),
            do_remote_auth,
            pending: Mutex::new(HashMap::new()),
            connect_wait: Mutex::new(VecDeque::new()),
            callbacks_installed: std::sync::atomic::AtomicBool::new(false),
        });
        (cm, transport, engine)
    }

    #[tokio::test]
    async fn accept_without_remote_auth_hands_connection_to_engine() {
        let (cm, _transport, engine) = build_cm(false).await;
        let conn = Conn::new(0, Arc::new(NullBackend));
        cm.finish_accept(conn, Value::Null, Value::Null).await;

        let ops = engine.engine_ops().unwrap();
        let counting = ops.as_any().downcast_ref::<CountingEngine>().unwrap();
        assert_eq!(counting.accepted.load(AtomicOrdering::SeqCst), 1);
        assert!(cm.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn accept_with_remote_auth_is_refused_and_closes() {
        let (cm, _transport, engine) = build_cm(true).await;
        let conn = Conn::new(0, Arc::new(NullBackend));
        cm.finish_accept(conn.clone(), Value::Null, Value::Null).await;

        let ops = engine.engine_ops().unwrap();
        let counting = ops.as_any().downcast_ref::<CountingEngine>().unwrap();
        assert_eq!(counting.accepted.load(AtomicOrdering::SeqCst), 0);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn engine_refusal_closes_connection_without_panicking() {
        struct RefusingEngine;
        #[async_trait]
        impl EngineOps for RefusingEngine {
            async fn new_connection(&self, _c: &Arc<Component>, _conn: Connection) -> Result<()> {
                Err(Vde3Error::InvalidArgument("payload too small".into()))
            }
            fn as_any(&self) -> &dyn std::any::Any {
                self
            }
        }
        let transport = Component::new(
            "tr1",
            ComponentKind::Transport,
            "noop",
            KindOps::Transport(Arc::new(NoopTransport)),
            vec![],
            vec![],
        )
        .unwrap();
        let engine =
            Component::new("e1", ComponentKind::Engine, "refusing", KindOps::Engine(Arc::new(RefusingEngine)), vec![], vec![])
                .unwrap();
        transport.acquire();
        engine.acquire();
        let cm = Arc::new_cyclic(|weak| ConnectionManager {
            self_weak: weak.clone(),
            transport,
            engine,
            do_remote_auth: false,
            pending: Mutex::new(HashMap::new()),
            connect_wait: Mutex::new(VecDeque::new()),
            callbacks_installed: std::sync::atomic::AtomicBool::new(false),
        });
        let conn = Conn::new(0, Arc::new(NullBackend));
        cm.finish_accept(conn.clone(), Value::Null, Value::Null).await;
        assert!(conn.is_closed());
    }
}
