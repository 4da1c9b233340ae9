//! # Engines
//!
//! Engine components forward frames between connections according to
//! policy. This crate ships two families: [`hub`], a broadcast forwarding
//! engine, and [`ctrl`], the JSON-RPC control engine (itself an engine whose
//! "frames" are control messages).

pub mod ctrl;
pub mod hub;
