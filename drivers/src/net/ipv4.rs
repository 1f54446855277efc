//! IPv4 header validation and construction.
//!
//! Receive: version 4, IHL >= 5, total length within the buffer, header
//! checksum, TTL > 0. Fragments are dropped; received options are skipped
//! via IHL. Send: 20-byte header, TTL 64, DF set, no options.

use alloc::vec::Vec;

use kestrel_lib::klog_debug;

use super::internet_checksum;
use super::types::Ipv4Addr;

pub const IPV4_HEADER_LEN: usize = 20;
pub const IPV4_DEFAULT_TTL: u8 = 64;
pub const IPV4_FLAG_DF: u16 = 0x4000;
pub const IPV4_FLAG_MF: u16 = 0x2000;
pub const IPV4_FRAG_OFFSET_MASK: u16 = 0x1fff;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    pub header_len: usize,
    pub total_len: usize,
    pub id: u16,
    pub flags_frag: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
}

impl Ipv4Header {
    #[inline]
    pub fn is_fragment(&self) -> bool {
        self.flags_frag & (IPV4_FLAG_MF | IPV4_FRAG_OFFSET_MASK) != 0
    }

    /// Validate `packet` and split off the header. The returned payload is
    /// trimmed to `total_len`, dropping Ethernet padding.
    pub fn parse(packet: &[u8]) -> Option<(Self, &[u8])> {
        if packet.len() < IPV4_HEADER_LEN {
            klog_debug!("ipv4: packet too short ({})", packet.len());
            return None;
        }
        let version = packet[0] >> 4;
        if version != 4 {
            klog_debug!("ipv4: bad version {}", version);
            return None;
        }
        let header_len = ((packet[0] & 0x0f) as usize) * 4;
        if header_len < IPV4_HEADER_LEN || packet.len() < header_len {
            klog_debug!("ipv4: bad IHL {} (len {})", header_len, packet.len());
            return None;
        }
        let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
        if total_len < header_len || total_len > packet.len() {
            klog_debug!("ipv4: total_len {} vs buffer {}", total_len, packet.len());
            return None;
        }
        if internet_checksum(&packet[..header_len]) != 0 {
            klog_debug!("ipv4: bad header checksum");
            return None;
        }
        let hdr = Self {
            header_len,
            total_len,
            id: u16::from_be_bytes([packet[4], packet[5]]),
            flags_frag: u16::from_be_bytes([packet[6], packet[7]]),
            ttl: packet[8],
            protocol: packet[9],
            src: Ipv4Addr::from_slice(&packet[12..16]),
            dst: Ipv4Addr::from_slice(&packet[16..20]),
        };
        if hdr.ttl == 0 {
            klog_debug!("ipv4: TTL 0 from {}", hdr.src);
            return None;
        }
        if hdr.is_fragment() {
            klog_debug!("ipv4: dropping fragment id {} from {}", hdr.id, hdr.src);
            return None;
        }
        Some((hdr, &packet[header_len..total_len]))
    }
}

/// Write a 20-byte header into `out[..20]`, checksum included.
pub fn write_header(
    out: &mut [u8],
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    id: u16,
    payload_len: usize,
) {
    let total = (IPV4_HEADER_LEN + payload_len) as u16;
    out[0] = 0x45;
    out[1] = 0;
    out[2..4].copy_from_slice(&total.to_be_bytes());
    out[4..6].copy_from_slice(&id.to_be_bytes());
    out[6..8].copy_from_slice(&IPV4_FLAG_DF.to_be_bytes());
    out[8] = IPV4_DEFAULT_TTL;
    out[9] = protocol;
    out[10..12].copy_from_slice(&[0, 0]);
    out[12..16].copy_from_slice(&src.0);
    out[16..20].copy_from_slice(&dst.0);
    let sum = internet_checksum(&out[..IPV4_HEADER_LEN]);
    out[10..12].copy_from_slice(&sum.to_be_bytes());
}

/// Header followed by `payload`.
pub fn build_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    id: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(IPV4_HEADER_LEN + payload.len());
    pkt.resize(IPV4_HEADER_LEN, 0);
    write_header(&mut pkt, src, dst, protocol, id, payload.len());
    pkt.extend_from_slice(payload);
    pkt
}
