//! IPv4 network stack.
//!
//! Layers, leaves first: [`ethernet`] framing, [`arp`] resolution, [`ipv4`]
//! validation and routing, then [`icmp`], [`udp`] and [`tcp`]. The
//! [`socket`] table multiplexes TCP connections and UDP endpoints per owning
//! process. [`stack::NetStack`] owns all of it and drives a [`NetDevice`].
//!
//! Protocol modules are pure: they parse, build and update state tables.
//! Anything that touches the wire goes through the stack, which collects
//! outgoing packets under a lock and transmits them after releasing it.

pub mod arp;
pub mod config;
pub mod ethernet;
pub mod icmp;
pub mod ipv4;
pub mod netdev;
pub mod socket;
pub mod stack;
pub mod tcp;
pub mod types;
pub mod udp;

pub use config::NetConfig;
pub use netdev::{NetDevice, NetDeviceFeatures, NetDeviceStats};
pub use stack::NetStack;
pub use types::{Ipv4Addr, MacAddr, NetError, Port};

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

// =============================================================================
// Internet checksum (RFC 1071)
// =============================================================================

/// Add `data` as big-endian 16-bit words to `sum`. An odd trailing byte is
/// padded with zero.
pub fn checksum_add(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

/// Fold the carries and take the one's complement.
pub fn checksum_finish(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

pub fn internet_checksum(data: &[u8]) -> u16 {
    checksum_finish(checksum_add(0, data))
}

/// Sum of the IPv4 pseudo-header used by UDP and TCP.
pub fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: usize) -> u32 {
    let mut sum = checksum_add(0, &src.0);
    sum = checksum_add(sum, &dst.0);
    sum.wrapping_add(protocol as u32).wrapping_add(len as u32)
}

/// Checksum of a transport segment (header + payload, checksum field zero).
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    checksum_finish(checksum_add(
        pseudo_header_sum(src, dst, protocol, segment.len()),
        segment,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1071_example() {
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum_finish(checksum_add(0, &data)), !0xddf2);
    }

    #[test]
    fn checksum_over_header_including_itself_is_zero() {
        let mut hdr = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        let sum = internet_checksum(&hdr);
        assert_eq!(sum, 0xb861);
        hdr[10..12].copy_from_slice(&sum.to_be_bytes());
        assert_eq!(internet_checksum(&hdr), 0);
    }

    #[test]
    fn odd_length_pads_with_zero() {
        assert_eq!(internet_checksum(&[0x12]), internet_checksum(&[0x12, 0x00]));
    }
}
