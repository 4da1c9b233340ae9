//! # Local connection factory
//!
//! Peers two engines directly, bypassing any transport: a write on one side
//! calls straight into the other's `read` callback, no copy, no queue.
//! Grounded on `examples/original_source/src/localconnection.c`
//! (`vde_connect_engines_unqueued`, `vde_lc_write`, `vde_lc_close`) — the
//! `peer->peer = NULL` "detach before recursing" trick there is what keeps
//! closing one side from calling back into itself through the other.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::component::Component;
use crate::connection::{CallbackOutcome, Connection, TransportBackend, WriteStatus};
use crate::error::{Result, Vde3Error};
use crate::packet::Packet;

struct LocalBackend {
    peer: Mutex<Option<Connection>>,
}

#[async_trait]
impl TransportBackend for LocalBackend {
    async fn write(&self, pkt: Packet) -> WriteStatus {
        let peer = self.peer.lock().unwrap().clone();
        let Some(peer) = peer else {
            return WriteStatus::Fatal(Vde3Error::WriteClosed("peer already closed".into()));
        };
        match peer.call_read(pkt).await {
            CallbackOutcome::Continue | CallbackOutcome::Requeue => WriteStatus::Accepted,
            CallbackOutcome::Close => {
                peer.close().await;
                WriteStatus::Fatal(Vde3Error::WriteClosed("peer closed on read".into()))
            }
        }
    }

    async fn close(&self) {
        // Detach before recursing: once this is `None`, this side's own
        // `close()` cannot be re-entered by the peer's teardown below.
        let Some(peer) = self.peer.lock().unwrap().take() else {
            return;
        };
        if peer.call_error(None, Vde3Error::ReadClosed("peer closed".into())).await == CallbackOutcome::Close {
            peer.close().await;
        }
    }
}

/// Create a pair of peered connections and hand one to each engine. Fails if
/// either engine refuses its side; on partial failure the accepted side is
/// torn down so no dangling half-bridge survives.
pub async fn connect_engines(engine1: &Arc<Component>, req1: Value, engine2: &Arc<Component>, req2: Value) -> Result<()> {
    let ops1 = engine1
        .engine_ops()
        .ok_or_else(|| Vde3Error::InvalidArgument(format!("{} is not an engine", engine1.name())))?;
    let ops2 = engine2
        .engine_ops()
        .ok_or_else(|| Vde3Error::InvalidArgument(format!("{} is not an engine", engine2.name())))?;

    let backend1 = Arc::new(LocalBackend { peer: Mutex::new(None) });
    let backend2 = Arc::new(LocalBackend { peer: Mutex::new(None) });
    let conn1 = Connection::new(0, backend1.clone());
    let conn2 = Connection::new(0, backend2.clone());
    *backend1.peer.lock().unwrap() = Some(conn2.clone());
    *backend2.peer.lock().unwrap() = Some(conn1.clone());
    conn1.set_attributes(req1).await;
    conn2.set_attributes(req2).await;

    ops1.new_connection(engine1, conn1.clone()).await?;
    if let Err(e) = ops2.new_connection(engine2, conn2).await {
        conn1.close().await;
        return Err(e);
    }
    Ok(())
}
