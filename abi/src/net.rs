/// Snapshot of the interface configuration handed to userland (ifconfig).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UserNetInfo {
    pub ipv4: [u8; 4],
    pub subnet_mask: [u8; 4],
    pub gateway: [u8; 4],
    pub dns: [u8; 4],
    pub mac: [u8; 6],
    pub mtu: u16,
    pub link_up: u8,
    pub nic_ready: u8,
    pub _pad: [u8; 2],
}

// =============================================================================
// Socket ABI types
// =============================================================================

/// Address family: IPv4 Internet protocols.
pub const AF_INET: u16 = 2;

/// Socket type: byte-stream (TCP).
pub const SOCK_STREAM: u16 = 1;
/// Socket type: datagram (UDP).
pub const SOCK_DGRAM: u16 = 2;

/// IPv4 socket address, mirrors POSIX `sockaddr_in` layout.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SockAddrIn {
    pub family: u16,
    /// Port in **network** byte order (big-endian).
    pub port: u16,
    /// IPv4 address in network byte order.
    pub addr: [u8; 4],
    pub _pad: [u8; 8],
}

impl SockAddrIn {
    pub const fn new(addr: [u8; 4], port: u16) -> Self {
        Self {
            family: AF_INET,
            port: port.to_be(),
            addr,
            _pad: [0; 8],
        }
    }

    /// Port in host byte order.
    #[inline]
    pub const fn port_host(&self) -> u16 {
        u16::from_be(self.port)
    }
}

/// Maximum number of kernel sockets (shared across all processes).
pub const MAX_SOCKETS: usize = 64;

/// Maximum number of simultaneously bound UDP sockets.
pub const MAX_UDP_SOCKETS: usize = 16;

/// Return value of every failed socket call.
pub const SOCKET_ERROR: i32 = -1;
