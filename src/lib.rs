//! # vde3
//!
//! A user-space virtual Ethernet fabric built as a graph of typed, pluggable
//! components: packets flow through [`connection::Connection`]s that a
//! [`conn_manager`] hands off between a [`transport`] and an [`engine`],
//! under a [`context::Context`] that owns the component and module
//! registries. A [`rpc`]-speaking control engine exposes the graph over a
//! JSON-RPC wire.
//!
//! Grounded on `examples/original_source/include/vde3/*.h` throughout; see
//! `DESIGN.md` for the module-by-module grounding ledger.

pub mod cli;
pub mod command;
pub mod component;
pub mod conn_manager;
pub mod connection;
pub mod context;
pub mod engine;
pub mod error;
pub mod localconnection;
pub mod module;
pub mod packet;
pub mod rpc;
pub mod signal;
pub mod transport;

pub use command::Command;
pub use component::{Component, ComponentKind, KindOps};
pub use connection::Connection;
pub use context::Context;
pub use error::{Result, Vde3Error};
pub use packet::Packet;
pub use signal::Signal;

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
