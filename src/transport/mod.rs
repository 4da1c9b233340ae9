//! # Transports
//!
//! Transport components own real I/O: they turn connection requests into
//! live `Connection`s over some concrete medium. This crate ships
//! [`datagram`], the vde2-compatible reference transport described in spec
//! §4.3/§6.

pub mod datagram;
