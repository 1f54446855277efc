//! Socket layer: per-process descriptors over TCP connections and UDP
//! endpoints.
//!
//! Every call names the calling process. A descriptor is usable only while
//! it is active and owned by that process; any other use fails with -1, as
//! does every protocol error. Nothing here blocks: `connect` returns once
//! the SYN is out, `accept` and `recvfrom` fail while there is nothing to
//! hand back, and `recv` returns 0.
//!
//! UDP sockets queue datagrams in a fixed 4096-byte ring per endpoint. Each
//! record is an 8-byte header (source address, source port, length) followed
//! by the payload. A datagram that does not fit is dropped whole.

use alloc::boxed::Box;
use alloc::vec::Vec;

use kestrel_abi::net::{MAX_SOCKETS, MAX_UDP_SOCKETS, SOCK_DGRAM, SOCK_STREAM, SOCKET_ERROR};
use kestrel_lib::{RingBuffer, klog_debug};

use super::netdev::NetDevice;
use super::stack::NetStack;
use super::tcp::{ConnHandle, TcpError, TcpState};
use super::types::{EPHEMERAL_PORT_START, Ipv4Addr, NetError};
use super::udp::UdpTarget;

pub const UDP_RING_SIZE: usize = 4096;
const DGRAM_HEADER_LEN: usize = 8;

// =============================================================================
// Descriptor table
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SocketKind {
    Stream,
    Datagram,
}

impl SocketKind {
    pub const fn from_abi(sock_type: u16) -> Option<Self> {
        match sock_type {
            SOCK_STREAM => Some(Self::Stream),
            SOCK_DGRAM => Some(Self::Datagram),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SocketEntry {
    pub active: bool,
    pub kind: SocketKind,
    pub owner_pid: u32,
    pub local_port: u16,
    pub conn: Option<ConnHandle>,
    pub udp: Option<UdpHandle>,
}

impl SocketEntry {
    const EMPTY: Self = Self {
        active: false,
        kind: SocketKind::Stream,
        owner_pid: 0,
        local_port: 0,
        conn: None,
        udp: None,
    };
}

pub struct SocketTable {
    entries: [SocketEntry; MAX_SOCKETS],
}

impl Default for SocketTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketTable {
    pub const fn new() -> Self {
        Self {
            entries: [SocketEntry::EMPTY; MAX_SOCKETS],
        }
    }

    fn alloc(&mut self, kind: SocketKind, pid: u32) -> Option<usize> {
        let fd = self.entries.iter().position(|e| !e.active)?;
        self.entries[fd] = SocketEntry {
            active: true,
            kind,
            owner_pid: pid,
            ..SocketEntry::EMPTY
        };
        Some(fd)
    }

    /// The entry behind `fd`, if it is in range, active and owned by `pid`.
    pub fn get(&self, fd: i32, pid: u32) -> Option<&SocketEntry> {
        let e = self.entries.get(usize::try_from(fd).ok()?)?;
        (e.active && e.owner_pid == pid).then_some(e)
    }

    fn get_mut(&mut self, fd: i32, pid: u32) -> Option<&mut SocketEntry> {
        let e = self.entries.get_mut(usize::try_from(fd).ok()?)?;
        (e.active && e.owner_pid == pid).then_some(e)
    }

    fn free(&mut self, fd: usize) {
        self.entries[fd] = SocketEntry::EMPTY;
    }

    fn owned_by(&self, pid: u32) -> Vec<i32> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.active && e.owner_pid == pid)
            .map(|(fd, _)| fd as i32)
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.active).count()
    }
}

// =============================================================================
// UDP endpoints
// =============================================================================

/// Generational reference to a UDP endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UdpHandle {
    index: u8,
    generation: u32,
}

/// One received datagram as seen by `recvfrom`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecvFrom {
    pub len: usize,
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
}

struct UdpEndpoint {
    port: u16,
    ring: RingBuffer<u8, UDP_RING_SIZE>,
}

struct UdpSlot {
    generation: u32,
    endpoint: Option<Box<UdpEndpoint>>,
}

pub struct UdpEndpoints {
    slots: Vec<UdpSlot>,
}

impl Default for UdpEndpoints {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpEndpoints {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_UDP_SOCKETS);
        for _ in 0..MAX_UDP_SOCKETS {
            slots.push(UdpSlot {
                generation: 0,
                endpoint: None,
            });
        }
        Self { slots }
    }

    fn endpoint(&self, h: UdpHandle) -> Option<&UdpEndpoint> {
        let slot = self.slots.get(h.index as usize)?;
        if slot.generation != h.generation {
            return None;
        }
        slot.endpoint.as_deref()
    }

    fn endpoint_mut(&mut self, h: UdpHandle) -> Option<&mut UdpEndpoint> {
        let slot = self.slots.get_mut(h.index as usize)?;
        if slot.generation != h.generation {
            return None;
        }
        slot.endpoint.as_deref_mut()
    }

    pub fn open(&mut self) -> Option<UdpHandle> {
        let index = self.slots.iter().position(|s| s.endpoint.is_none())?;
        let slot = &mut self.slots[index];
        slot.endpoint = Some(Box::new(UdpEndpoint {
            port: 0,
            ring: RingBuffer::new_with(0),
        }));
        Some(UdpHandle {
            index: index as u8,
            generation: slot.generation,
        })
    }

    /// Free the endpoint; returns the port it was bound to (0 if none).
    pub fn close(&mut self, h: UdpHandle) -> Option<u16> {
        let slot = self.slots.get_mut(h.index as usize)?;
        if slot.generation != h.generation {
            return None;
        }
        let ep = slot.endpoint.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        Some(ep.port)
    }

    pub fn port(&self, h: UdpHandle) -> Option<u16> {
        self.endpoint(h).map(|e| e.port)
    }

    fn set_port(&mut self, h: UdpHandle, port: u16) -> bool {
        match self.endpoint_mut(h) {
            Some(e) => {
                e.port = port;
                true
            }
            None => false,
        }
    }

    /// Queue a datagram. `false` if the handle is stale or the ring is too
    /// full for the whole record.
    pub fn deliver(&mut self, h: UdpHandle, src_ip: Ipv4Addr, src_port: u16, data: &[u8]) -> bool {
        let Some(ep) = self.endpoint_mut(h) else {
            return false;
        };
        if DGRAM_HEADER_LEN + data.len() > ep.ring.free_space() as usize {
            return false;
        }
        let mut hdr = [0u8; DGRAM_HEADER_LEN];
        hdr[0..4].copy_from_slice(&src_ip.0);
        hdr[4..6].copy_from_slice(&src_port.to_le_bytes());
        hdr[6..8].copy_from_slice(&(data.len() as u16).to_le_bytes());
        ep.ring.push_slice(&hdr) && ep.ring.push_slice(data)
    }

    /// Dequeue the oldest datagram into `buf`. Bytes beyond `buf.len()` are
    /// discarded with the datagram.
    pub fn recv(&mut self, h: UdpHandle, buf: &mut [u8]) -> Option<RecvFrom> {
        let ep = self.endpoint_mut(h)?;
        if (ep.ring.len() as usize) < DGRAM_HEADER_LEN {
            return None;
        }
        let mut hdr = [0u8; DGRAM_HEADER_LEN];
        ep.ring.pop_into(&mut hdr);
        let len = u16::from_le_bytes([hdr[6], hdr[7]]) as usize;
        let n = len.min(buf.len());
        let copied = ep.ring.pop_into(&mut buf[..n]);
        ep.ring.skip(len - copied);
        Some(RecvFrom {
            len: copied,
            src_ip: Ipv4Addr::from_slice(&hdr[0..4]),
            src_port: u16::from_le_bytes([hdr[4], hdr[5]]),
        })
    }

    pub fn has_data(&self, h: UdpHandle) -> bool {
        self.endpoint(h).is_some_and(|e| !e.ring.is_empty())
    }
}

// =============================================================================
// Socket calls
// =============================================================================

#[inline]
fn ok_or_error(r: Result<i32, NetError>) -> i32 {
    r.unwrap_or(SOCKET_ERROR)
}

impl From<TcpError> for NetError {
    fn from(e: TcpError) -> Self {
        match e {
            TcpError::TableFull => NetError::NoBufferSpace,
            TcpError::NotFound => NetError::NotConnected,
            TcpError::InvalidState => NetError::InvalidArgument,
            TcpError::AddrInUse => NetError::AddressInUse,
            TcpError::ConnectionReset => NetError::ConnectionReset,
            TcpError::TimedOut => NetError::TimedOut,
            TcpError::ConnectionRefused => NetError::ConnectionRefused,
            TcpError::WouldBlock => NetError::WouldBlock,
        }
    }
}

impl<D: NetDevice> NetStack<D> {
    /// New descriptor of `sock_type` (`SOCK_STREAM` or `SOCK_DGRAM`).
    pub fn socket_create(&self, sock_type: u16, pid: u32) -> i32 {
        ok_or_error(self.try_create(sock_type, pid))
    }

    fn try_create(&self, sock_type: u16, pid: u32) -> Result<i32, NetError> {
        let kind = SocketKind::from_abi(sock_type).ok_or(NetError::InvalidArgument)?;
        let mut sockets = self.sockets.lock();
        let fd = sockets.alloc(kind, pid).ok_or(NetError::NoBufferSpace)?;
        if kind == SocketKind::Datagram {
            match self.udp_sockets.lock().open() {
                Some(h) => sockets.entries[fd].udp = Some(h),
                None => {
                    sockets.free(fd);
                    return Err(NetError::NoBufferSpace);
                }
            }
        }
        Ok(fd as i32)
    }

    /// Start an active open. Returns 0 once the SYN has been queued.
    pub fn socket_connect(&self, fd: i32, ip: Ipv4Addr, port: u16, pid: u32) -> i32 {
        ok_or_error(self.try_connect(fd, ip, port, pid))
    }

    fn try_connect(&self, fd: i32, ip: Ipv4Addr, port: u16, pid: u32) -> Result<i32, NetError> {
        let local_ip = self.config().ip;
        let mut out = Vec::new();
        {
            let mut sockets = self.sockets.lock();
            let entry = sockets.get_mut(fd, pid).ok_or(NetError::InvalidArgument)?;
            if entry.kind != SocketKind::Stream {
                return Err(NetError::OperationNotSupported);
            }
            if entry.conn.is_some() {
                return Err(NetError::AlreadyConnected);
            }
            let mut tcp = self.tcp.lock();
            let conn = tcp.connect(local_ip, entry.local_port, ip, port, self.now_ms(), &mut out)?;
            entry.local_port = tcp.tuple(conn).map_or(0, |t| t.local_port);
            entry.conn = Some(conn);
        }
        self.transmit_tcp(out);
        Ok(0)
    }

    pub fn socket_bind(&self, fd: i32, port: u16, pid: u32) -> i32 {
        ok_or_error(self.try_bind(fd, port, pid))
    }

    fn try_bind(&self, fd: i32, port: u16, pid: u32) -> Result<i32, NetError> {
        if port == 0 {
            return Err(NetError::InvalidArgument);
        }
        let mut sockets = self.sockets.lock();
        let entry = sockets.get_mut(fd, pid).ok_or(NetError::InvalidArgument)?;
        if entry.local_port != 0 || entry.conn.is_some() {
            return Err(NetError::InvalidArgument);
        }
        if let Some(h) = entry.udp {
            self.udp.lock().bind(port, UdpTarget::Socket(h))?;
            self.udp_sockets.lock().set_port(h, port);
        }
        entry.local_port = port;
        Ok(0)
    }

    pub fn socket_listen(&self, fd: i32, pid: u32) -> i32 {
        ok_or_error(self.try_listen(fd, pid))
    }

    fn try_listen(&self, fd: i32, pid: u32) -> Result<i32, NetError> {
        let local_ip = self.config().ip;
        let mut sockets = self.sockets.lock();
        let entry = sockets.get_mut(fd, pid).ok_or(NetError::InvalidArgument)?;
        if entry.kind != SocketKind::Stream {
            return Err(NetError::OperationNotSupported);
        }
        if entry.local_port == 0 || entry.conn.is_some() {
            return Err(NetError::InvalidArgument);
        }
        let listener = self.tcp.lock().listen(local_ip, entry.local_port)?;
        entry.conn = Some(listener);
        Ok(0)
    }

    /// New descriptor for the oldest established connection, or -1 if none
    /// is waiting.
    pub fn socket_accept(&self, fd: i32, pid: u32) -> i32 {
        ok_or_error(self.try_accept(fd, pid))
    }

    fn try_accept(&self, fd: i32, pid: u32) -> Result<i32, NetError> {
        let mut sockets = self.sockets.lock();
        let entry = *sockets.get(fd, pid).ok_or(NetError::InvalidArgument)?;
        let listener = match (entry.kind, entry.conn) {
            (SocketKind::Stream, Some(c)) => c,
            _ => return Err(NetError::InvalidArgument),
        };
        let mut tcp = self.tcp.lock();
        let Some(new_fd) = sockets.alloc(SocketKind::Stream, pid) else {
            return Err(NetError::NoBufferSpace);
        };
        let child = match tcp.accept(listener) {
            Ok(c) => c,
            Err(e) => {
                sockets.free(new_fd);
                return Err(e.into());
            }
        };
        let slot = &mut sockets.entries[new_fd];
        slot.conn = Some(child);
        slot.local_port = entry.local_port;
        Ok(new_fd as i32)
    }

    /// Queue bytes on a connection. Returns bytes accepted.
    pub fn socket_send(&self, fd: i32, data: &[u8], pid: u32) -> i32 {
        ok_or_error(self.try_send(fd, data, pid))
    }

    fn try_send(&self, fd: i32, data: &[u8], pid: u32) -> Result<i32, NetError> {
        let conn = self.stream_conn(fd, pid)?;
        let mut out = Vec::new();
        let n = self.tcp.lock().send(conn, data, self.now_ms(), &mut out);
        self.transmit_tcp(out);
        Ok(n? as i32)
    }

    /// Drain received bytes. 0 when nothing is buffered, at end of stream
    /// too; -1 once the connection has failed.
    pub fn socket_recv(&self, fd: i32, buf: &mut [u8], pid: u32) -> i32 {
        ok_or_error(self.try_recv(fd, buf, pid))
    }

    fn try_recv(&self, fd: i32, buf: &mut [u8], pid: u32) -> Result<i32, NetError> {
        let conn = self.stream_conn(fd, pid)?;
        let mut out = Vec::new();
        let n = self.tcp.lock().receive(conn, buf, &mut out);
        self.transmit_tcp(out);
        Ok(n? as i32)
    }

    /// Send one datagram, binding an ephemeral port first if needed.
    pub fn socket_sendto(&self, fd: i32, data: &[u8], ip: Ipv4Addr, port: u16, pid: u32) -> i32 {
        ok_or_error(self.try_sendto(fd, data, ip, port, pid))
    }

    fn try_sendto(
        &self,
        fd: i32,
        data: &[u8],
        ip: Ipv4Addr,
        port: u16,
        pid: u32,
    ) -> Result<i32, NetError> {
        let src_port = {
            let mut sockets = self.sockets.lock();
            let entry = sockets.get_mut(fd, pid).ok_or(NetError::InvalidArgument)?;
            let h = entry.udp.ok_or(NetError::OperationNotSupported)?;
            if entry.local_port == 0 {
                let mut udp = self.udp.lock();
                let ephemeral = self.alloc_udp_port(&udp).ok_or(NetError::AddressInUse)?;
                udp.bind(ephemeral, UdpTarget::Socket(h))?;
                self.udp_sockets.lock().set_port(h, ephemeral);
                entry.local_port = ephemeral;
                klog_debug!("socket: fd {} auto-bound to udp port {}", fd, ephemeral);
            }
            entry.local_port
        };
        self.udp_send(ip, src_port, port, data)?;
        Ok(data.len() as i32)
    }

    /// Dequeue one datagram into `buf`; -1 when none is queued.
    pub fn socket_recvfrom(&self, fd: i32, buf: &mut [u8], pid: u32) -> Result<RecvFrom, i32> {
        let sockets = self.sockets.lock();
        let h = sockets
            .get(fd, pid)
            .and_then(|e| e.udp)
            .ok_or(SOCKET_ERROR)?;
        self.udp_sockets.lock().recv(h, buf).ok_or(SOCKET_ERROR)
    }

    pub fn socket_close(&self, fd: i32, pid: u32) -> i32 {
        let entry = {
            let mut sockets = self.sockets.lock();
            let Some(entry) = sockets.get(fd, pid).copied() else {
                return SOCKET_ERROR;
            };
            sockets.free(fd as usize);
            entry
        };
        self.release_entry(&entry);
        0
    }

    /// Close every descriptor `pid` owns. Safe to call more than once.
    pub fn socket_cleanup_process(&self, pid: u32) {
        let fds = self.sockets.lock().owned_by(pid);
        if !fds.is_empty() {
            klog_debug!("socket: cleaning up {} sockets of pid {}", fds.len(), pid);
        }
        for fd in fds {
            self.socket_close(fd, pid);
        }
    }

    /// TCP state behind a stream descriptor.
    pub fn socket_tcp_state(&self, fd: i32, pid: u32) -> Option<TcpState> {
        let conn = self.sockets.lock().get(fd, pid)?.conn?;
        self.tcp.lock().state(conn)
    }

    pub fn socket_local_port(&self, fd: i32, pid: u32) -> Option<u16> {
        self.sockets.lock().get(fd, pid).map(|e| e.local_port)
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.lock().active_count()
    }

    fn stream_conn(&self, fd: i32, pid: u32) -> Result<ConnHandle, NetError> {
        let sockets = self.sockets.lock();
        let entry = sockets.get(fd, pid).ok_or(NetError::InvalidArgument)?;
        if entry.kind != SocketKind::Stream {
            return Err(NetError::OperationNotSupported);
        }
        entry.conn.ok_or(NetError::NotConnected)
    }

    fn release_entry(&self, entry: &SocketEntry) {
        if let Some(conn) = entry.conn {
            let now = self.now_ms();
            let mut out = Vec::new();
            {
                let mut tcp = self.tcp.lock();
                let unread = tcp.get(conn).map_or(0, |c| c.bytes_buffered());
                // Either call fails only when the peer already reset it.
                let _ = if unread > 0 {
                    klog_debug!("socket: closing with {} unread bytes, sending RST", unread);
                    tcp.abort(conn, &mut out)
                } else {
                    tcp.close(conn, now, &mut out)
                };
            }
            self.transmit_tcp(out);
        }
        if let Some(h) = entry.udp {
            let port = self.udp_sockets.lock().close(h);
            if let Some(port) = port.filter(|&p| p != 0) {
                self.udp.lock().unbind(port);
            }
        }
    }

    fn alloc_udp_port(&self, udp: &super::udp::UdpBindings) -> Option<u16> {
        let span = (u16::MAX - EPHEMERAL_PORT_START) as u32 + 1;
        for _ in 0..span {
            let port = self.next_udp_port();
            if !udp.is_bound(port) {
                return Some(port);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);

    #[test]
    fn descriptor_ownership_is_checked() {
        let mut t = SocketTable::new();
        let fd = t.alloc(SocketKind::Stream, 1).expect("fd") as i32;
        assert!(t.get(fd, 1).is_some());
        assert!(t.get(fd, 2).is_none());
        assert!(t.get(-1, 1).is_none());
        assert!(t.get(MAX_SOCKETS as i32, 1).is_none());
        assert_eq!(t.owned_by(1), alloc::vec![fd]);
        t.free(fd as usize);
        assert!(t.get(fd, 1).is_none());
    }

    #[test]
    fn udp_ring_truncates_and_drops_whole_records() {
        let mut eps = UdpEndpoints::new();
        let h = eps.open().expect("endpoint");
        assert!(eps.deliver(h, PEER, 53, b"first datagram"));
        assert!(eps.deliver(h, PEER, 54, b"second"));

        let mut buf = [0u8; 5];
        let got = eps.recv(h, &mut buf).expect("first");
        assert_eq!(got, RecvFrom { len: 5, src_ip: PEER, src_port: 53 });
        assert_eq!(&buf, b"first");
        let mut buf = [0u8; 64];
        let got = eps.recv(h, &mut buf).expect("second");
        assert_eq!((got.len, got.src_port), (6, 54));
        assert_eq!(&buf[..6], b"second");
        assert!(eps.recv(h, &mut buf).is_none());

        let big = [0u8; 2000];
        assert!(eps.deliver(h, PEER, 1, &big));
        assert!(eps.deliver(h, PEER, 1, &big));
        // 2 * 2008 bytes used, 80 left.
        assert!(!eps.deliver(h, PEER, 1, &big[..100]));
        assert!(eps.deliver(h, PEER, 1, &big[..72]));
    }

    #[test]
    fn closed_endpoint_handle_goes_stale() {
        let mut eps = UdpEndpoints::new();
        let h = eps.open().expect("endpoint");
        assert!(eps.set_port(h, 5000));
        assert_eq!(eps.close(h), Some(5000));
        assert_eq!(eps.close(h), None);
        assert!(!eps.deliver(h, PEER, 1, b"x"));
        let h2 = eps.open().expect("endpoint");
        assert_ne!(h, h2);
        for _ in 1..MAX_UDP_SOCKETS {
            assert!(eps.open().is_some());
        }
        assert!(eps.open().is_none());
    }
}
