//! # Error Taxonomy
//!
//! This module defines the single error type shared by every component in
//! the runtime: a handful of construction-time errors (`InvalidArgument`, `NotFound`,
//! `AlreadyExists`, `Busy`, `OutOfMemory`) and the connection-level I/O
//! errors a transport backend reports through the `error` callback
//! (`ReadClosed`, `ReadDelay`, `WriteClosed`, `WriteDelay`), plus a catch-all
//! `Protocol` variant for malformed control-wire input.
//!
//! Library functions that can fail in one of these specific ways return
//! `Result<T, Vde3Error>`; call sites that just need to propagate failure
//! upward (the binary, integration tests) convert it into `anyhow::Error`
//! with `?`, matching how the rest of this codebase uses `anyhow`.

use thiserror::Error;

/// The unified error taxonomy for the VDE3 component runtime.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Vde3Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("busy: {0}")]
    Busy(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("read closed: {0}")]
    ReadClosed(String),

    #[error("read delay: {0}")]
    ReadDelay(String),

    #[error("write closed: {0}")]
    WriteClosed(String),

    #[error("write delay: {0}")]
    WriteDelay(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl Vde3Error {
    /// JSON-RPC 1.0 does not define a standard error-code space the way 2.0
    /// does, but the control engine still needs *some* stable integer to put
    /// on the wire inside the `error` field. These are this crate's own convention.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            Vde3Error::InvalidArgument(_) => -32602,
            Vde3Error::NotFound(_) => -32601,
            Vde3Error::AlreadyExists(_) => -32001,
            Vde3Error::Busy(_) => -32002,
            Vde3Error::OutOfMemory => -32003,
            Vde3Error::ReadClosed(_) | Vde3Error::WriteClosed(_) => -32004,
            Vde3Error::ReadDelay(_) | Vde3Error::WriteDelay(_) => -32005,
            Vde3Error::Protocol(_) => -32600,
        }
    }

    /// `true` for the non-fatal, connection-stays-usable errors.
    pub fn is_transient(&self) -> bool {
        matches!(self, Vde3Error::ReadDelay(_) | Vde3Error::WriteDelay(_))
    }
}

pub type Result<T> = std::result::Result<T, Vde3Error>;
