//! Ethernet II framing.

use alloc::vec::Vec;

use super::types::{EtherType, MacAddr};

pub const ETHERTYPE_IPV4: u16 = EtherType::Ipv4 as u16;
pub const ETHERTYPE_ARP: u16 = EtherType::Arp as u16;
pub const ETH_HEADER_LEN: usize = 14;
pub const ETH_ADDR_LEN: usize = 6;
/// Minimum frame without FCS; shorter frames are zero padded.
pub const ETH_MIN_FRAME: usize = 60;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EthHeader {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
}

impl EthHeader {
    /// Split `frame` into header and payload.
    pub fn parse(frame: &[u8]) -> Option<(Self, &[u8])> {
        if frame.len() < ETH_HEADER_LEN {
            return None;
        }
        let hdr = Self {
            dst: MacAddr::from_slice(&frame[0..6]),
            src: MacAddr::from_slice(&frame[6..12]),
            ethertype: u16::from_be_bytes([frame[12], frame[13]]),
        };
        Some((hdr, &frame[ETH_HEADER_LEN..]))
    }

    pub fn write(&self, out: &mut [u8]) {
        out[0..6].copy_from_slice(&self.dst.0);
        out[6..12].copy_from_slice(&self.src.0);
        out[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
    }
}

/// Whether a frame with destination `dst` is for an interface with address
/// `ours`. Unicast to another station is dropped; broadcast and multicast
/// pass up to the protocol layers.
#[inline]
pub fn is_for_us(dst: MacAddr, ours: MacAddr) -> bool {
    dst == ours || dst.is_multicast()
}

pub fn build_frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let len = (ETH_HEADER_LEN + payload.len()).max(ETH_MIN_FRAME);
    let mut frame = Vec::with_capacity(len);
    frame.resize(ETH_HEADER_LEN, 0);
    EthHeader {
        dst,
        src,
        ethertype,
    }
    .write(&mut frame);
    frame.extend_from_slice(payload);
    frame.resize(len, 0);
    frame
}
