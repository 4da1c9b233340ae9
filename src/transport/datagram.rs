//! # Datagram transport ("vde2-compatible")
//!
//! A reference transport: a stream rendezvous socket at `<dir>/ctl`
//! negotiates a per-connection datagram socket at `<dir>/NNNN`, after which
//! data-plane frames flow as raw datagrams with no further framing.
//! Grounded on `examples/original_source/src/transport_vde2.c`, built on
//! `tokio::net::{UnixListener, UnixDatagram}` in the same accept-loop-plus-
//! per-connection-task shape used elsewhere in this crate's transports.
//!
//! The original source's handshake packet is a packed C struct carrying a
//! raw `sockaddr_un`; there is no idiomatic Rust equivalent of a packed
//! struct with an embedded fixed-size C union, so this implementation
//! encodes the same fields (magic, version, request type, peer path,
//! optional description) length-prefixed instead — noted as a deviation in
//! DESIGN.md.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixDatagram, UnixListener, UnixStream};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, warn};

use crate::component::{Component, ComponentKind, KindOps, TransportOps};
use crate::connection::{CallbackOutcome, Connection, TransportBackend, WriteStatus};
use crate::context::Context;
use crate::error::{Result, Vde3Error};
use crate::module::{Module, ModuleFactory, ModuleRegistry};
use crate::packet::{Packet, MIN_ETH_FRAME_LEN, STANDARD_CAPACITY};

const MAGIC: u32 = 0xFEED_FACE;
const PROTOCOL_VERSION: u32 = 3;
const HANDSHAKE_BUF_LEN: usize = 4096;

/// Hard cap on a connection's outbound send queue.
const MAX_QUEUE_LEN: usize = 4192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    NewControl = 0,
    NewPort0 = 1,
}

impl RequestKind {
    fn from_u32(v: u32) -> Result<RequestKind> {
        match v {
            0 => Ok(RequestKind::NewControl),
            1 => Ok(RequestKind::NewPort0),
            other => Err(Vde3Error::Protocol(format!("unknown handshake request type {other}"))),
        }
    }
}

/// The client's opening message on the rendezvous socket.
struct HandshakeRequest {
    kind: RequestKind,
    peer_path: String,
    description: String,
}

impl HandshakeRequest {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        out.extend_from_slice(&(self.kind as u32).to_be_bytes());
        let peer = self.peer_path.as_bytes();
        out.extend_from_slice(&(peer.len() as u16).to_be_bytes());
        out.extend_from_slice(peer);
        let desc = self.description.as_bytes();
        out.extend_from_slice(&(desc.len() as u16).to_be_bytes());
        out.extend_from_slice(desc);
        out
    }

    /// Validates magic/version.
    fn decode(bytes: &[u8]) -> Result<HandshakeRequest> {
        if bytes.len() < 14 {
            return Err(Vde3Error::Protocol("handshake request shorter than fixed header".into()));
        }
        let magic = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let version = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        if magic != MAGIC || version != PROTOCOL_VERSION {
            return Err(Vde3Error::Protocol(format!(
                "bad handshake magic/version: {magic:#x}/{version}"
            )));
        }
        let kind = RequestKind::from_u32(u32::from_be_bytes(bytes[8..12].try_into().unwrap()))?;

        let mut off = 12;
        let peer_len = u16::from_be_bytes(bytes[off..off + 2].try_into().unwrap()) as usize;
        off += 2;
        if bytes.len() < off + peer_len + 2 {
            return Err(Vde3Error::Protocol("handshake request truncated in peer path".into()));
        }
        let peer_path = String::from_utf8_lossy(&bytes[off..off + peer_len]).into_owned();
        off += peer_len;

        let desc_len = u16::from_be_bytes(bytes[off..off + 2].try_into().unwrap()) as usize;
        off += 2;
        if bytes.len() < off + desc_len {
            return Err(Vde3Error::Protocol("handshake request truncated in description".into()));
        }
        let description = String::from_utf8_lossy(&bytes[off..off + desc_len]).into_owned();

        Ok(HandshakeRequest { kind, peer_path, description })
    }
}

/// Server's reply: the allocated per-connection datagram socket path (spec
/// §6, "Server reply over the same stream: ... the server's allocated
/// per-connection datagram address").
fn encode_reply(path: &str) -> Vec<u8> {
    let mut out = Vec::new();
    let bytes = path.as_bytes();
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

fn decode_reply(bytes: &[u8]) -> Result<String> {
    if bytes.len() < 2 {
        return Err(Vde3Error::Protocol("handshake reply shorter than length prefix".into()));
    }
    let len = u16::from_be_bytes(bytes[0..2].try_into().unwrap()) as usize;
    if bytes.len() < 2 + len {
        return Err(Vde3Error::Protocol("handshake reply truncated".into()));
    }
    Ok(String::from_utf8_lossy(&bytes[2..2 + len]).into_owned())
}

/// Binds `path` as a stream rendezvous socket. If the path is already in
/// use, unlinks it and retries once.
fn bind_rendezvous(path: &std::path::Path) -> Result<UnixListener> {
    match UnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            let _ = std::fs::remove_file(path);
            UnixListener::bind(path).map_err(|e| Vde3Error::Protocol(format!("bind {path:?}: {e}")))
        }
        Err(e) => Err(Vde3Error::Protocol(format!("bind {path:?}: {e}"))),
    }
}

struct QueueEntry {
    tries_left: u32,
    pkt: Packet,
}

/// Per-connection backend: the datagram socket carrying frames plus the
/// control stream kept open only to detect the peer going away (spec
/// §4.3, "register ... the control socket for unexpected-data/close
/// detection").
struct DatagramBackend {
    socket: UnixDatagram,
    ctrl: AsyncMutex<UnixStream>,
    path: PathBuf,
    queue: Mutex<VecDeque<QueueEntry>>,
    write_ready: Notify,
    shutdown: Notify,
    closed: AtomicBool,
    conn: Mutex<Option<Connection>>,
}

impl DatagramBackend {
    fn spawn(socket: UnixDatagram, path: PathBuf, ctrl: UnixStream) -> Arc<DatagramBackend> {
        Arc::new(DatagramBackend {
            socket,
            ctrl: AsyncMutex::new(ctrl),
            path,
            queue: Mutex::new(VecDeque::new()),
            write_ready: Notify::new(),
            shutdown: Notify::new(),
            closed: AtomicBool::new(false),
            conn: Mutex::new(None),
        })
    }

    /// Must be called once, right after `Connection::new` wraps this
    /// backend, before any frame can arrive (mirrors the `bind_component`
    /// pattern used by the hub and connection-manager engines).
    fn bind_connection(self: &Arc<Self>, conn: Connection) {
        *self.conn.lock().unwrap() = Some(conn.clone());
        tokio::spawn(Self::read_loop(self.clone(), conn.clone()));
        tokio::spawn(Self::drain_loop(self.clone(), conn));
    }

    fn connection(&self) -> Option<Connection> {
        self.conn.lock().unwrap().clone()
    }

    async fn ctrl_probe(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut ctrl = self.ctrl.lock().await;
        ctrl.read(buf).await
    }

    /// Reads frames off the datagram socket and watches the control stream
    /// for unexpected data or EOF.
    async fn read_loop(self: Arc<Self>, conn: Connection) {
        // Fixed-size stack buffer standing in for the C source's
        // stack-fast-path packet; the exact-length `Packet` below is always
        // heap-allocated, since `Packet` must be `Send` across await points
        //.
        let mut buf = vec![0u8; STANDARD_CAPACITY];
        let mut ctrl_buf = [0u8; 1];
        loop {
            tokio::select! {
                _ = self.shutdown.notified() => return,
                result = self.socket.recv(&mut buf) => {
                    match result {
                        Ok(n) if n < MIN_ETH_FRAME_LEN => {
                            debug!("datagram transport: dropping undersized frame ({n} bytes)");
                        }
                        Ok(n) => {
                            let mut pkt = Packet::new(0, 0, n, conn.head_pad(), conn.tail_pad());
                            pkt.payload_mut().copy_from_slice(&buf[..n]);
                            if conn.call_read(pkt).await == CallbackOutcome::Close {
                                conn.close().await;
                                return;
                            }
                        }
                        Err(e) => {
                            let _ = conn.call_error(None, Vde3Error::ReadClosed(e.to_string())).await;
                            conn.close().await;
                            return;
                        }
                    }
                }
                result = self.ctrl_probe(&mut ctrl_buf) => {
                    match result {
                        Ok(0) => {
                            let _ = conn.call_error(None, Vde3Error::ReadClosed("control socket closed by peer".into())).await;
                            conn.close().await;
                            return;
                        }
                        Ok(_) => {
                            let _ = conn.call_error(None, Vde3Error::Protocol("unexpected data on control socket".into())).await;
                            conn.close().await;
                            return;
                        }
                        Err(e) => {
                            warn!("datagram transport: control socket probe failed: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Drains the send queue's write-readiness description:
    /// pop the oldest entry, try to send, requeue on `WouldBlock` until
    /// `tries_left` is exhausted, and disarm once the queue is empty.
    async fn drain_loop(self: Arc<Self>, conn: Connection) {
        loop {
            loop {
                if self.closed.load(Ordering::SeqCst) {
                    return;
                }
                if !self.queue.lock().unwrap().is_empty() {
                    break;
                }
                tokio::select! {
                    _ = self.write_ready.notified() => {}
                    _ = self.shutdown.notified() => return,
                }
            }

            tokio::select! {
                _ = self.shutdown.notified() => return,
                res = self.socket.writable() => {
                    if res.is_err() {
                        return;
                    }
                }
            }

            let Some(mut entry) = self.queue.lock().unwrap().pop_front() else {
                continue;
            };
            match self.socket.try_send(entry.pkt.payload()) {
                Ok(_) => {
                    let _ = conn.call_write_complete(entry.pkt).await;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    entry.tries_left = entry.tries_left.saturating_sub(1);
                    if entry.tries_left == 0 {
                        let _ = conn
                            .call_error(Some(entry.pkt), Vde3Error::WriteDelay("max send tries exceeded".into()))
                            .await;
                    } else {
                        self.queue.lock().unwrap().push_back(entry);
                    }
                }
                Err(e) => {
                    let outcome = conn.call_error(Some(entry.pkt), Vde3Error::WriteClosed(e.to_string())).await;
                    if outcome == CallbackOutcome::Close {
                        conn.close().await;
                    }
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl TransportBackend for DatagramBackend {
    async fn write(&self, pkt: Packet) -> WriteStatus {
        if self.closed.load(Ordering::SeqCst) {
            return WriteStatus::Fatal(Vde3Error::WriteClosed("connection already closed".into()));
        }
        let max_tries = match self.connection() {
            Some(conn) => conn.send_properties().await.max_tries.max(1),
            None => 1,
        };
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= MAX_QUEUE_LEN {
                return WriteStatus::Again;
            }
            queue.push_back(QueueEntry { tries_left: max_tries, pkt });
        }
        self.write_ready.notify_one();
        WriteStatus::Accepted
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        let _ = std::fs::remove_file(&self.path);
    }
}

/// The transport component: owns the rendezvous directory and the
/// monotonic per-connection datagram-socket counter.
pub struct DatagramTransport {
    self_weak: Weak<DatagramTransport>,
    dir: PathBuf,
    next_port: AtomicU64,
}

impl DatagramTransport {
    fn next_datagram_path(&self) -> PathBuf {
        let port = self.next_port.fetch_add(1, Ordering::SeqCst);
        self.dir.join(format!("{port:04}"))
    }

    async fn accept_one(&self, component: &Arc<Component>, mut stream: UnixStream) -> Result<()> {
        let mut buf = vec![0u8; HANDSHAKE_BUF_LEN];
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| Vde3Error::Protocol(format!("handshake read failed: {e}")))?;
        if n == 0 {
            return Err(Vde3Error::Protocol("peer closed before sending a handshake".into()));
        }
        let request = HandshakeRequest::decode(&buf[..n])?;
        debug!(
            "datagram transport: accepted handshake kind={:?} peer={} description={:?}",
            request.kind, request.peer_path, request.description
        );

        let path = self.next_datagram_path();
        let _ = std::fs::remove_file(&path);
        let socket = UnixDatagram::bind(&path).map_err(|e| Vde3Error::Protocol(format!("bind {path:?}: {e}")))?;
        socket
            .connect(&request.peer_path)
            .map_err(|e| Vde3Error::Protocol(format!("connect to peer {}: {e}", request.peer_path)))?;

        stream
            .write_all(&encode_reply(&path.to_string_lossy()))
            .await
            .map_err(|e| Vde3Error::Protocol(format!("handshake reply failed: {e}")))?;

        let backend = DatagramBackend::spawn(socket, path, stream);
        let conn = Connection::new(0, backend.clone());

        // Await the connection-manager callback to completion before
        // spawning the read loop: it installs the connection's consumer, and
        // a frame must never be able to arrive before that happens.
        match component.transport_callbacks().await {
            Some(callbacks) => (callbacks.on_accept)(conn.clone()).await,
            None => warn!("datagram transport accepted a connection before callbacks were installed"),
        }
        backend.bind_connection(conn);
        Ok(())
    }
}

#[async_trait]
impl TransportOps for DatagramTransport {
    /// Binds `<dir>/ctl` and spawns a background accept loop.
    async fn listen(&self, component: &Arc<Component>) -> Result<()> {
        let ctl_path = self.dir.join("ctl");
        let listener = bind_rendezvous(&ctl_path)?;
        let transport = self.self_weak.upgrade().expect("transport outlives its own listen task");
        let component = component.clone();

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let transport = transport.clone();
                        let component = component.clone();
                        tokio::spawn(async move {
                            if let Err(e) = transport.accept_one(&component, stream).await {
                                warn!("datagram transport: rejecting inbound connection: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        warn!("datagram transport: accept loop ending: {e}");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    /// Connects to a remote rendezvous directory named by
    /// `request["dir"]`, runs the client half of the handshake, and invokes `on_connect`.
    async fn connect(&self, component: &Arc<Component>, request: Value) -> Result<()> {
        let remote_dir = request
            .get("dir")
            .and_then(Value::as_str)
            .ok_or_else(|| Vde3Error::InvalidArgument("connect request requires a \"dir\" string".into()))?;
        let ctl_path = PathBuf::from(remote_dir).join("ctl");

        let mut stream = UnixStream::connect(&ctl_path)
            .await
            .map_err(|e| Vde3Error::Protocol(format!("connect to {ctl_path:?} failed: {e}")))?;

        let path = self.next_datagram_path();
        let _ = std::fs::remove_file(&path);
        let socket = UnixDatagram::bind(&path).map_err(|e| Vde3Error::Protocol(format!("bind {path:?}: {e}")))?;

        let handshake = HandshakeRequest {
            kind: RequestKind::NewControl,
            peer_path: path.to_string_lossy().into_owned(),
            description: String::new(),
        };
        stream
            .write_all(&handshake.encode())
            .await
            .map_err(|e| Vde3Error::Protocol(format!("handshake send failed: {e}")))?;

        let mut buf = vec![0u8; HANDSHAKE_BUF_LEN];
        let n = stream
            .read(&mut buf)
            .await
            .map_err(|e| Vde3Error::Protocol(format!("handshake reply read failed: {e}")))?;
        let peer_path = decode_reply(&buf[..n])?;
        socket
            .connect(&peer_path)
            .map_err(|e| Vde3Error::Protocol(format!("connect datagram socket to {peer_path}: {e}")))?;

        let backend = DatagramBackend::spawn(socket, path, stream);
        let conn = Connection::new(0, backend.clone());

        // Same ordering as `accept_one`: the consumer must be installed
        // before the read loop can start pulling frames off the socket.
        match component.transport_callbacks().await {
            Some(callbacks) => (callbacks.on_connect)(conn.clone()).await,
            None => warn!("datagram transport connected before callbacks were installed"),
        }
        backend.bind_connection(conn);
        Ok(())
    }
}

struct DatagramFactory;

#[async_trait]
impl ModuleFactory for DatagramFactory {
    /// `args` must be `{"dir": "<rendezvous directory>"}`. The directory is
    /// created (mode 0777) if absent.
    async fn build(&self, _ctx: &Context, args: Value) -> Result<KindOps> {
        let dir = args
            .get("dir")
            .and_then(Value::as_str)
            .ok_or_else(|| Vde3Error::InvalidArgument("datagram transport requires a \"dir\" string argument".into()))?;
        let dir = PathBuf::from(dir);
        std::fs::create_dir_all(&dir).map_err(|e| Vde3Error::InvalidArgument(format!("create_dir_all({dir:?}): {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o777));
        }

        let transport = Arc::new_cyclic(|weak| DatagramTransport {
            self_weak: weak.clone(),
            dir,
            next_port: AtomicU64::new(0),
        });
        Ok(KindOps::Transport(transport))
    }
}

/// Register the `vde2` family under `ComponentKind::Transport`.
pub fn register(registry: &mut ModuleRegistry) -> Result<()> {
    registry.register(Module::new(ComponentKind::Transport, "vde2", vec![], vec![], Arc::new(DatagramFactory)))
}
