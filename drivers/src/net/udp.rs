//! UDP (RFC 768): datagram codec and port bindings.
//!
//! A port is bound either to a kernel callback or to a socket-layer
//! endpoint. The binding table stores no back-pointers; delivery goes through
//! the stack, which owns both.

use alloc::vec::Vec;

use super::socket::UdpHandle;
use super::types::{Ipv4Addr, NetError};
use super::{IPPROTO_UDP, transport_checksum};

pub const UDP_HEADER_LEN: usize = 8;
/// Largest payload that fits a 1500-byte MTU without fragmentation.
pub const UDP_MAX_PAYLOAD: usize = 1472;
pub const MAX_UDP_BINDINGS: usize = 64;

/// Kernel receive hook: `(src_ip, src_port, dst_port, data)`.
pub type UdpCallback = fn(Ipv4Addr, u16, u16, &[u8]);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    /// Parse and, when the sender supplied one, verify the checksum.
    pub fn parse(src: Ipv4Addr, dst: Ipv4Addr, seg: &'a [u8]) -> Option<Self> {
        if seg.len() < UDP_HEADER_LEN {
            return None;
        }
        let len = u16::from_be_bytes([seg[4], seg[5]]) as usize;
        if len < UDP_HEADER_LEN || len > seg.len() {
            return None;
        }
        let seg = &seg[..len];
        let csum = u16::from_be_bytes([seg[6], seg[7]]);
        if csum != 0 && transport_checksum(src, dst, IPPROTO_UDP, seg) != 0 {
            return None;
        }
        Some(Self {
            src_port: u16::from_be_bytes([seg[0], seg[1]]),
            dst_port: u16::from_be_bytes([seg[2], seg[3]]),
            payload: &seg[UDP_HEADER_LEN..],
        })
    }
}

pub fn build_datagram(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Result<Vec<u8>, NetError> {
    if payload.len() > UDP_MAX_PAYLOAD {
        return Err(NetError::InvalidArgument);
    }
    let len = UDP_HEADER_LEN + payload.len();
    let mut seg = Vec::with_capacity(len);
    seg.extend_from_slice(&src_port.to_be_bytes());
    seg.extend_from_slice(&dst_port.to_be_bytes());
    seg.extend_from_slice(&(len as u16).to_be_bytes());
    seg.extend_from_slice(&[0, 0]);
    seg.extend_from_slice(payload);
    let sum = match transport_checksum(src, dst, IPPROTO_UDP, &seg) {
        0 => 0xffff,
        s => s,
    };
    seg[6..8].copy_from_slice(&sum.to_be_bytes());
    Ok(seg)
}

#[derive(Clone, Copy, Debug)]
pub enum UdpTarget {
    Callback(UdpCallback),
    Socket(UdpHandle),
}

#[derive(Default)]
pub struct UdpBindings {
    entries: Vec<(u16, UdpTarget)>,
}

impl UdpBindings {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn bind(&mut self, port: u16, target: UdpTarget) -> Result<(), NetError> {
        if port == 0 {
            return Err(NetError::InvalidArgument);
        }
        if self.lookup(port).is_some() {
            return Err(NetError::AddressInUse);
        }
        if self.entries.len() >= MAX_UDP_BINDINGS {
            return Err(NetError::NoBufferSpace);
        }
        self.entries.push((port, target));
        Ok(())
    }

    pub fn unbind(&mut self, port: u16) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(p, _)| *p != port);
        self.entries.len() != before
    }

    pub fn lookup(&self, port: u16) -> Option<UdpTarget> {
        self.entries
            .iter()
            .find(|(p, _)| *p == port)
            .map(|(_, t)| *t)
    }

    pub fn is_bound(&self, port: u16) -> bool {
        self.lookup(port).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);

    fn noop(_: Ipv4Addr, _: u16, _: u16, _: &[u8]) {}

    #[test]
    fn datagram_checksum_and_length() {
        let seg = build_datagram(A, B, 5000, 53, b"query").expect("fits");
        assert_eq!(seg.len(), 13);
        assert_eq!(&seg[4..6], &13u16.to_be_bytes());
        let dg = UdpDatagram::parse(A, B, &seg).expect("valid");
        assert_eq!((dg.src_port, dg.dst_port), (5000, 53));
        assert_eq!(dg.payload, b"query");

        // Checksum covers the pseudo-header.
        assert!(UdpDatagram::parse(A, Ipv4Addr::new(10, 0, 2, 3), &seg).is_none());

        let mut no_sum = seg.clone();
        no_sum[6..8].copy_from_slice(&[0, 0]);
        assert!(UdpDatagram::parse(A, Ipv4Addr::new(10, 0, 2, 3), &no_sum).is_some());

        assert_eq!(
            build_datagram(A, B, 1, 2, &[0; UDP_MAX_PAYLOAD + 1]),
            Err(NetError::InvalidArgument)
        );
    }

    #[test]
    fn bindings_are_exclusive() {
        let mut b = UdpBindings::new();
        b.bind(68, UdpTarget::Callback(noop)).expect("bind");
        assert_eq!(
            b.bind(68, UdpTarget::Callback(noop)),
            Err(NetError::AddressInUse)
        );
        assert_eq!(b.bind(0, UdpTarget::Callback(noop)), Err(NetError::InvalidArgument));
        assert!(b.is_bound(68));
        assert!(b.unbind(68));
        assert!(!b.unbind(68));
        assert!(b.lookup(68).is_none());
    }
}
