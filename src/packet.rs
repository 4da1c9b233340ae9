//! # Packet
//!
//! An owned byte region carrying a fixed 4-byte header, optional head/tail
//! padding reserved for in-place encapsulation, and a payload. Grounded on
//! `examples/original_source/src/include/vde3/packet.h` (`vde_pkt`,
//! `vde_pkt_init`, `vde_pkt_cpy`, `vde_pkt_compact_cpy`), redesigned as an
//! owned buffer with integer offsets rather than a pointer-into-self: this
//! keeps `Packet` trivially movable and
//! `Send`, which the rest of the runtime relies on when a packet crosses a
//! channel between tasks.

use crate::error::{Result, Vde3Error};

/// Size of the on-wire packet header: `version: u8, kind: u8, payload_len: u16`.
pub const HEADER_SIZE: usize = 4;

/// A full 802.3 frame (1500 payload + 14 header) plus the vde header plus 4
/// bytes of reserved head-pad for in-place VLAN tagging, as specified for
/// the datagram transport's stack-fast-path packet.
pub const STANDARD_CAPACITY: usize = HEADER_SIZE + 4 + 1514;

/// The minimum length of a usable Ethernet frame payload. Anything shorter
/// is dropped by the datagram transport's read side.
pub const MIN_ETH_FRAME_LEN: usize = 14;

/// An owned, move-friendly packet buffer.
///
/// Layout of `data`: `[ header (4 bytes) | head_pad | payload | tail_pad ]`.
/// `head_pad + payload_len + tail_pad` never exceeds `data.len()` — enforced
/// by construction, not merely documented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    data: Vec<u8>,
    head_pad: usize,
    payload_len: usize,
    tail_pad: usize,
}

impl Packet {
    /// Allocate a new packet sized for `payload_len` bytes of payload with
    /// `head_pad`/`tail_pad` bytes of reserved space around it. Mirrors
    /// `vde_pkt_new`.
    pub fn new(version: u8, kind: u8, payload_len: usize, head_pad: usize, tail_pad: usize) -> Self {
        let data_size = HEADER_SIZE + head_pad + payload_len + tail_pad;
        let mut data = vec![0u8; data_size];
        data[0] = version;
        data[1] = kind;
        data[2..4].copy_from_slice(&(payload_len as u16).to_be_bytes());
        Packet {
            data,
            head_pad,
            payload_len,
            tail_pad,
        }
    }

    /// Build a packet directly from an already-framed payload (no head/tail
    /// padding), used on the fast path when a transport reads a raw
    /// Ethernet frame straight off the wire.
    pub fn from_payload(version: u8, kind: u8, payload: &[u8]) -> Self {
        let mut pkt = Packet::new(version, kind, payload.len(), 0, 0);
        pkt.payload_mut().copy_from_slice(payload);
        pkt
    }

    /// Parse a packet out of a header-prefixed byte slice read from a
    /// transport. Validates that the advertised `payload_len` fits the
    /// supplied bytes.
    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Vde3Error::Protocol("packet shorter than header".into()));
        }
        let version = bytes[0];
        let kind = bytes[1];
        let payload_len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if bytes.len() < HEADER_SIZE + payload_len {
            return Err(Vde3Error::Protocol(format!(
                "header advertises {} bytes of payload but only {} bytes available",
                payload_len,
                bytes.len() - HEADER_SIZE
            )));
        }
        let mut pkt = Packet::new(version, kind, payload_len, 0, 0);
        pkt.payload_mut()
            .copy_from_slice(&bytes[HEADER_SIZE..HEADER_SIZE + payload_len]);
        Ok(pkt)
    }

    pub fn version(&self) -> u8 {
        self.data[0]
    }

    pub fn kind(&self) -> u8 {
        self.data[1]
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn head_pad(&self) -> usize {
        self.head_pad
    }

    pub fn tail_pad(&self) -> usize {
        self.tail_pad
    }

    pub fn data_size(&self) -> usize {
        self.data.len()
    }

    fn payload_offset(&self) -> usize {
        HEADER_SIZE + self.head_pad
    }

    pub fn payload(&self) -> &[u8] {
        let off = self.payload_offset();
        &self.data[off..off + self.payload_len]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        let off = self.payload_offset();
        &mut self.data[off..off + self.payload_len]
    }

    pub fn head(&self) -> &[u8] {
        &self.data[HEADER_SIZE..self.payload_offset()]
    }

    pub fn tail(&self) -> &[u8] {
        let start = self.data.len() - self.tail_pad;
        &self.data[start..]
    }

    /// Serialize header + payload only, the wire representation used by
    /// the datagram transport (raw Ethernet frames have no vde header, but
    /// engine-to-engine traffic carries it).
    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload_len);
        out.extend_from_slice(&self.data[0..HEADER_SIZE]);
        out.extend_from_slice(self.payload());
        out
    }

    /// *Faithful copy*: preserves head/tail padding. Mirrors `vde_pkt_cpy`.
    pub fn faithful_copy(&self) -> Packet {
        self.clone()
    }

    /// *Compact copy*: header + payload only, head/tail padding dropped.
    /// Mirrors `vde_pkt_compact_cpy`.
    pub fn compact_copy(&self) -> Packet {
        Packet::from_payload(self.version(), self.kind(), self.payload())
    }
}
