//! # Connection
//!
//! The universal conduit between a transport backend and the component
//! consuming its frames (an engine or the control engine). Grounded on
//! `examples/original_source/src/include/vde3/connection.h`.
//!
//! The C source expresses the backend and the consumer as four raw
//! function-pointer slots (`be_write`, `be_close`, `read_cb`, `error_cb`)
//! plus an optional `write_cb`, each paired with an opaque `void *`. Here
//! the backend is a `TransportBackend` trait object and the consumer a
//! `ConnectionConsumer` trait object — the "Callbacks vs. coroutines"
//! redesign note turns the old integer-status-plus-errno return
//! value into the `CallbackOutcome` sum type (`Continue | Requeue | Close`),
//! and `conn_be_write`'s int-or-EAGAIN-or-EPIPE contract into `WriteStatus`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::Vde3Error;
use crate::packet::Packet;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Outcome of `Connection::write`. The connection never blocks the caller:
/// `Again` means the transport's send queue is under backpressure and the
/// caller should retry later; `Fatal` means the connection is unusable.
#[derive(Debug, Clone)]
pub enum WriteStatus {
    Accepted,
    Again,
    Fatal(Vde3Error),
}

/// Outcome of a consumer callback (`read`/`write_complete`/`error`). Any
/// value other than `Continue`/`Requeue`/`Close` does not exist by
/// construction — unlike the C source, which treated every non-zero,
/// non-EAGAIN, non-EPIPE return as "log it and treat as closed" (spec
/// §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    Continue,
    Requeue,
    Close,
}

/// Implemented by a transport backend: owns the real socket, the send
/// queue, and all I/O for one connection.
#[async_trait]
pub trait TransportBackend: Send + Sync {
    async fn write(&self, pkt: Packet) -> WriteStatus;
    /// Idempotent: the backend must tolerate being called more than once.
    async fn close(&self);
}

/// Implemented by whoever consumes a connection's frames (an engine or the
/// control engine).
#[async_trait]
pub trait ConnectionConsumer: Send + Sync {
    async fn read(&self, conn: &Connection, pkt: Packet) -> CallbackOutcome;

    async fn write_complete(&self, _conn: &Connection, _pkt: Packet) -> CallbackOutcome {
        CallbackOutcome::Continue
    }

    async fn error(&self, conn: &Connection, pkt: Option<Packet>, err: Vde3Error) -> CallbackOutcome;
}

/// `(max_tries, max_timeout)` send-retry policy.
#[derive(Debug, Clone, Copy)]
pub struct SendProperties {
    pub max_tries: u32,
    pub max_timeout: Duration,
}

impl Default for SendProperties {
    fn default() -> Self {
        SendProperties {
            max_tries: 1,
            max_timeout: Duration::from_secs(1),
        }
    }
}

struct ConnectionInner {
    id: u64,
    max_payload: usize,
    head_pad: AtomicUsize,
    tail_pad: AtomicUsize,
    send_props: AsyncMutex<SendProperties>,
    backend: Arc<dyn TransportBackend>,
    consumer: AsyncMutex<Option<Arc<dyn ConnectionConsumer>>>,
    attributes: AsyncMutex<Option<Value>>,
    closed: AtomicBool,
}

/// A cheap-to-clone handle onto a connection. Cloning a `Connection` clones
/// the `Arc`, not the underlying resources — every clone refers to the same
/// conduit, which is how an engine keeps one in its port list while the
/// connection manager that created it lets its own reference drop.
#[derive(Clone)]
pub struct Connection(Arc<ConnectionInner>);

impl Connection {
    /// Construct a connection over a transport backend. `max_payload` of 0
    /// means unlimited.
    pub fn new(max_payload: usize, backend: Arc<dyn TransportBackend>) -> Connection {
        Connection(Arc::new(ConnectionInner {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::SeqCst),
            max_payload,
            head_pad: AtomicUsize::new(0),
            tail_pad: AtomicUsize::new(0),
            send_props: AsyncMutex::new(SendProperties::default()),
            backend,
            consumer: AsyncMutex::new(None),
            attributes: AsyncMutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    /// Stable identity used by the connection manager's pending-connection
    /// lookups, keyed by connection identity rather than address, and by
    /// engines that need to recognize "is this the connection the frame
    /// arrived on" without relying on pointer equality of trait objects.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn max_payload(&self) -> usize {
        self.0.max_payload
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::SeqCst)
    }

    /// Set the consumer's read/write-complete/error callbacks. Per spec
    /// invariant, `read` and `error` must be set before any frame
    /// traverses the connection — callers are expected to call this
    /// before handing the connection off to `Transport::listen`/`connect`.
    pub async fn set_consumer(&self, consumer: Arc<dyn ConnectionConsumer>) {
        *self.0.consumer.lock().await = Some(consumer);
    }

    pub async fn clear_consumer(&self) {
        *self.0.consumer.lock().await = None;
    }

    pub fn set_pkt_properties(&self, head_pad: usize, tail_pad: usize) {
        self.0.head_pad.store(head_pad, Ordering::SeqCst);
        self.0.tail_pad.store(tail_pad, Ordering::SeqCst);
    }

    pub fn head_pad(&self) -> usize {
        self.0.head_pad.load(Ordering::SeqCst)
    }

    pub fn tail_pad(&self) -> usize {
        self.0.tail_pad.load(Ordering::SeqCst)
    }

    pub async fn set_send_properties(&self, max_tries: u32, max_timeout: Duration) {
        *self.0.send_props.lock().await = SendProperties { max_tries, max_timeout };
    }

    pub async fn send_properties(&self) -> SendProperties {
        *self.0.send_props.lock().await
    }

    pub async fn set_attributes(&self, attributes: Value) {
        *self.0.attributes.lock().await = Some(attributes);
    }

    pub async fn attributes(&self) -> Option<Value> {
        self.0.attributes.lock().await.clone()
    }

    /// Called by the consumer to send a packet. The connection never
    /// blocks: the backend copies the packet into its own send queue and
    /// returns immediately.
    pub async fn write(&self, pkt: Packet) -> WriteStatus {
        if self.is_closed() {
            return WriteStatus::Fatal(Vde3Error::WriteClosed("connection already closed".into()));
        }
        self.0.backend.write(pkt).await
    }

    /// Idempotent close: the first call tears down the backend, subsequent
    /// calls are no-ops.
    pub async fn close(&self) {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.0.backend.close().await;
    }

    /// Invoked by the transport backend when a new frame is available.
    pub async fn call_read(&self, pkt: Packet) -> CallbackOutcome {
        let consumer = self.0.consumer.lock().await.clone();
        match consumer {
            Some(consumer) => consumer.read(self, pkt).await,
            None => CallbackOutcome::Close,
        }
    }

    /// Invoked by the transport backend when a previously written packet
    /// has actually been sent. Optional: a consumer that never set one
    /// simply never hears about completions.
    pub async fn call_write_complete(&self, pkt: Packet) -> CallbackOutcome {
        let consumer = self.0.consumer.lock().await.clone();
        match consumer {
            Some(consumer) => consumer.write_complete(self, pkt).await,
            None => CallbackOutcome::Continue,
        }
    }

    /// Invoked by the transport backend when an I/O error occurs.
    pub async fn call_error(&self, pkt: Option<Packet>, err: Vde3Error) -> CallbackOutcome {
        let consumer = self.0.consumer.lock().await.clone();
        match consumer {
            Some(consumer) => consumer.error(self, pkt, err).await,
            None => CallbackOutcome::Close,
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}
impl Eq for Connection {}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.0.id)
            .field("max_payload", &self.0.max_payload)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct CountingBackend {
        writes: StdAtomicUsize,
        closes: StdAtomicUsize,
    }

    #[async_trait]
    impl TransportBackend for CountingBackend {
        async fn write(&self, _pkt: Packet) -> WriteStatus {
            self.writes.fetch_add(1, Ordering::SeqCst);
            WriteStatus::Accepted
        }
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct EchoConsumer;
    #[async_trait]
    impl ConnectionConsumer for EchoConsumer {
        async fn read(&self, _conn: &Connection, _pkt: Packet) -> CallbackOutcome {
            CallbackOutcome::Continue
        }
        async fn error(&self, _conn: &Connection, _pkt: Option<Packet>, _err: Vde3Error) -> CallbackOutcome {
            CallbackOutcome::Close
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let backend = Arc::new(CountingBackend {
            writes: StdAtomicUsize::new(0),
            closes: StdAtomicUsize::new(0),
        });
        let conn = Connection::new(0, backend.clone());
        conn.close().await;
        conn.close().await;
        assert_eq!(backend.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn write_after_close_is_fatal() {
        let backend = Arc::new(CountingBackend {
            writes: StdAtomicUsize::new(0),
            closes: StdAtomicUsize::new(0),
        });
        let conn = Connection::new(0, backend);
        conn.close().await;
        let pkt = Packet::from_payload(3, 0, b"hi");
        assert!(matches!(conn.write(pkt).await, WriteStatus::Fatal(_)));
    }

    #[tokio::test]
    async fn read_without_consumer_closes() {
        let backend = Arc::new(CountingBackend {
            writes: StdAtomicUsize::new(0),
            closes: StdAtomicUsize::new(0),
        });
        let conn = Connection::new(0, backend);
        let pkt = Packet::from_payload(3, 0, b"hi");
        assert_eq!(conn.call_read(pkt).await, CallbackOutcome::Close);
    }

    #[tokio::test]
    async fn read_with_consumer_continues() {
        let backend = Arc::new(CountingBackend {
            writes: StdAtomicUsize::new(0),
            closes: StdAtomicUsize::new(0),
        });
        let conn = Connection::new(0, backend);
        conn.set_consumer(Arc::new(EchoConsumer)).await;
        let pkt = Packet::from_payload(3, 0, b"hi");
        assert_eq!(conn.call_read(pkt).await, CallbackOutcome::Continue);
    }

    #[test]
    fn distinct_connections_have_distinct_ids() {
        let backend = Arc::new(CountingBackend {
            writes: StdAtomicUsize::new(0),
            closes: StdAtomicUsize::new(0),
        });
        let a = Connection::new(0, backend.clone());
        let b = Connection::new(0, backend);
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
    }
}
