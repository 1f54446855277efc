//! Newtype network primitives.
//!
//! Wrapping addresses and ports keeps byte-order and argument-order mistakes
//! out of the protocol code. Everything here is `Copy` and zero-cost.

use core::fmt;

use kestrel_abi::net::{AF_INET, SockAddrIn};

// =============================================================================
// Addresses and ports
// =============================================================================

/// IPv4 address in network byte order.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    pub const UNSPECIFIED: Self = Self([0, 0, 0, 0]);
    pub const BROADCAST: Self = Self([255, 255, 255, 255]);

    #[inline]
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    #[inline]
    pub const fn from_u32_be(val: u32) -> Self {
        Self(val.to_be_bytes())
    }

    #[inline]
    pub const fn to_u32_be(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    #[inline]
    pub const fn is_broadcast(&self) -> bool {
        self.to_u32_be() == u32::MAX
    }

    #[inline]
    pub const fn is_multicast(&self) -> bool {
        self.0[0] >= 224 && self.0[0] <= 239
    }

    #[inline]
    pub const fn is_unspecified(&self) -> bool {
        self.to_u32_be() == 0
    }

    #[inline]
    pub const fn in_subnet(self, network: Ipv4Addr, mask: Ipv4Addr) -> bool {
        let m = mask.to_u32_be();
        (self.to_u32_be() & m) == (network.to_u32_be() & m)
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// Read from the first four bytes of `b`.
    #[inline]
    pub fn from_slice(b: &[u8]) -> Self {
        Self([b[0], b[1], b[2], b[3]])
    }
}

impl From<[u8; 4]> for Ipv4Addr {
    fn from(b: [u8; 4]) -> Self {
        Self(b)
    }
}

impl fmt::Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// Port in host byte order.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port(pub u16);

impl Port {
    #[inline]
    pub const fn new(val: u16) -> Self {
        Self(val)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Debug for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Port({})", self.0)
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// First port handed out by the ephemeral allocators.
pub const EPHEMERAL_PORT_START: u16 = 49152;

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: Self = Self([0xff; 6]);
    pub const ZERO: Self = Self([0; 6]);

    #[inline]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    #[inline]
    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    #[inline]
    pub fn from_slice(b: &[u8]) -> Self {
        Self([b[0], b[1], b[2], b[3], b[4], b[5]])
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

// =============================================================================
// NetError
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetError {
    WouldBlock,
    ConnectionRefused,
    ConnectionReset,
    TimedOut,
    AddressInUse,
    NotConnected,
    AlreadyConnected,
    HostUnreachable,
    PermissionDenied,
    InvalidArgument,
    NoBufferSpace,
    OperationNotSupported,
    /// NIC missing or not initialised.
    DeviceNotReady,
    /// Malformed or truncated packet.
    Malformed,
    Shutdown,
}

impl NetError {
    pub const fn to_errno(&self) -> i32 {
        match self {
            Self::WouldBlock => -11,            // EAGAIN
            Self::ConnectionRefused => -111,    // ECONNREFUSED
            Self::ConnectionReset => -104,      // ECONNRESET
            Self::TimedOut => -110,             // ETIMEDOUT
            Self::AddressInUse => -98,          // EADDRINUSE
            Self::NotConnected => -107,         // ENOTCONN
            Self::AlreadyConnected => -106,     // EISCONN
            Self::HostUnreachable => -113,      // EHOSTUNREACH
            Self::PermissionDenied => -1,       // EPERM
            Self::InvalidArgument => -22,       // EINVAL
            Self::NoBufferSpace => -105,        // ENOBUFS
            Self::OperationNotSupported => -95, // EOPNOTSUPP
            Self::DeviceNotReady => -19,        // ENODEV
            Self::Malformed => -74,             // EBADMSG
            Self::Shutdown => -32,              // EPIPE
        }
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::WouldBlock => "operation would block",
            Self::ConnectionRefused => "connection refused",
            Self::ConnectionReset => "connection reset by peer",
            Self::TimedOut => "operation timed out",
            Self::AddressInUse => "address already in use",
            Self::NotConnected => "socket not connected",
            Self::AlreadyConnected => "socket already connected",
            Self::HostUnreachable => "host unreachable",
            Self::PermissionDenied => "permission denied",
            Self::InvalidArgument => "invalid argument",
            Self::NoBufferSpace => "no buffer space available",
            Self::OperationNotSupported => "operation not supported",
            Self::DeviceNotReady => "network device not ready",
            Self::Malformed => "malformed packet",
            Self::Shutdown => "broken pipe (shutdown)",
        };
        f.write_str(msg)
    }
}

// =============================================================================
// SockAddr
// =============================================================================

#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SockAddr {
    pub ip: Ipv4Addr,
    pub port: Port,
}

impl SockAddr {
    #[inline]
    pub const fn new(ip: Ipv4Addr, port: Port) -> Self {
        Self { ip, port }
    }

    pub fn from_user(raw: &SockAddrIn) -> Result<Self, NetError> {
        if raw.family != AF_INET {
            return Err(NetError::InvalidArgument);
        }
        Ok(Self::new(Ipv4Addr(raw.addr), Port(raw.port_host())))
    }

    pub fn to_user(&self) -> SockAddrIn {
        SockAddrIn::new(self.ip.0, self.port.0)
    }
}

impl fmt::Debug for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

// =============================================================================
// EtherType and IpProtocol
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EtherType {
    Ipv4 = 0x0800,
    Arp = 0x0806,
}

impl EtherType {
    #[inline]
    pub const fn from_u16(val: u16) -> Option<Self> {
        match val {
            0x0800 => Some(Self::Ipv4),
            0x0806 => Some(Self::Arp),
            _ => None,
        }
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IpProtocol {
    Icmp = 1,
    Tcp = 6,
    Udp = 17,
}

impl IpProtocol {
    #[inline]
    pub const fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(Self::Icmp),
            6 => Some(Self::Tcp),
            17 => Some(Self::Udp),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn ipv4_subnet_and_display() {
        let ip = Ipv4Addr::new(10, 0, 2, 15);
        assert!(ip.in_subnet(Ipv4Addr::new(10, 0, 2, 0), Ipv4Addr::new(255, 255, 255, 0)));
        assert!(!ip.in_subnet(Ipv4Addr::new(10, 0, 3, 0), Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(format!("{}", ip), "10.0.2.15");
        assert_eq!(Ipv4Addr::from_u32_be(ip.to_u32_be()), ip);
    }

    #[test]
    fn sockaddr_user_roundtrip_keeps_port_order() {
        let sa = SockAddr::new(Ipv4Addr::new(1, 2, 3, 4), Port(8080));
        let raw = sa.to_user();
        assert_eq!(raw.port, 8080u16.to_be());
        assert_eq!(SockAddr::from_user(&raw), Ok(sa));
    }

    #[test]
    fn errno_mapping() {
        assert_eq!(NetError::WouldBlock.to_errno(), -11);
        assert_eq!(NetError::ConnectionRefused.to_errno(), -111);
        assert_eq!(format!("{}", NetError::TimedOut), "operation timed out");
    }
}
