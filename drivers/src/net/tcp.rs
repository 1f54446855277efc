//! TCP (RFC 793 subset): header codec, state machine and connection table.
//!
//! [`TcpTable`] is pure protocol logic. Every operation takes the current
//! time and an output vector; segments the state machine wants on the wire
//! are appended to it and the caller transmits them after dropping its lock.
//!
//! Connections are addressed by [`ConnHandle`], a slot index plus a
//! generation. Releasing a slot bumps its generation, so a handle kept past
//! the end of its connection is rejected instead of aliasing a new one.
//!
//! Retransmission is per connection: one timer covering the oldest
//! unacknowledged SYN, data or FIN, starting at [`INITIAL_RTO_MS`] and
//! doubling up to [`MAX_RTO_MS`]. After [`MAX_RETRANSMITS`] the connection is
//! reset and reports [`TcpError::TimedOut`].

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use kestrel_lib::klog_debug;

use super::types::{EPHEMERAL_PORT_START, Ipv4Addr};
use super::{IPPROTO_TCP, transport_checksum};

// =============================================================================
// Constants
// =============================================================================

/// Minimum TCP header length (no options).
pub const TCP_HEADER_LEN: usize = 20;

/// Maximum number of simultaneous TCP connections.
pub const MAX_CONNECTIONS: usize = 64;

/// Ethernet MTU 1500 - IP 20 - TCP 20.
pub const DEFAULT_MSS: u16 = 1460;

pub const RECV_BUFFER_SIZE: usize = 16384;
pub const SEND_BUFFER_SIZE: usize = 16384;

/// Completed-but-unaccepted plus half-open children per listener.
pub const LISTEN_BACKLOG: usize = 8;

pub const INITIAL_RTO_MS: u32 = 1000;
pub const MAX_RTO_MS: u32 = 60_000;

/// 2 x MSL, MSL = 30 s.
pub const TIME_WAIT_MS: u64 = 60_000;

pub const MAX_RETRANSMITS: u8 = 8;

const ISN_START: u32 = 0x4F50_534C;
const ISN_STEP: u32 = 64000;

// ---------------------------------------------------------------------------
// Flag bits
// ---------------------------------------------------------------------------

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;

// ---------------------------------------------------------------------------
// Option kinds
// ---------------------------------------------------------------------------

pub const TCP_OPT_END: u8 = 0;
pub const TCP_OPT_NOP: u8 = 1;
pub const TCP_OPT_MSS: u8 = 2;
pub const TCP_OPT_MSS_LEN: u8 = 4;

// =============================================================================
// Header
// =============================================================================

/// Parsed TCP header, fields in host byte order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_num: u32,
    pub ack_num: u32,
    /// Data offset in 32-bit words (5-15).
    pub data_offset: u8,
    pub flags: u8,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    #[inline]
    pub const fn header_len(&self) -> usize {
        (self.data_offset as usize) * 4
    }

    #[inline]
    pub const fn is_syn(&self) -> bool {
        (self.flags & TCP_FLAG_SYN) != 0
    }

    #[inline]
    pub const fn is_ack(&self) -> bool {
        (self.flags & TCP_FLAG_ACK) != 0
    }

    #[inline]
    pub const fn is_fin(&self) -> bool {
        (self.flags & TCP_FLAG_FIN) != 0
    }

    #[inline]
    pub const fn is_rst(&self) -> bool {
        (self.flags & TCP_FLAG_RST) != 0
    }
}

/// Parse a TCP header. `None` if the slice is too short or the data offset
/// is invalid.
pub fn parse_header(data: &[u8]) -> Option<TcpHeader> {
    if data.len() < TCP_HEADER_LEN {
        return None;
    }

    let data_offset = (data[12] >> 4) & 0x0F;
    if data_offset < 5 {
        return None;
    }
    if data.len() < (data_offset as usize) * 4 {
        return None;
    }

    Some(TcpHeader {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq_num: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack_num: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        data_offset,
        flags: data[13] & 0x3F,
        window_size: u16::from_be_bytes([data[14], data[15]]),
        checksum: u16::from_be_bytes([data[16], data[17]]),
        urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
    })
}

/// MSS from the options region, if present.
pub fn parse_mss_option(options: &[u8]) -> Option<u16> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            TCP_OPT_END => break,
            TCP_OPT_NOP => i += 1,
            TCP_OPT_MSS => {
                if i + 3 < options.len() && options[i + 1] == TCP_OPT_MSS_LEN {
                    return Some(u16::from_be_bytes([options[i + 2], options[i + 3]]));
                }
                break;
            }
            _ => {
                if i + 1 >= options.len() {
                    break;
                }
                let opt_len = options[i + 1] as usize;
                if opt_len < 2 || i + opt_len > options.len() {
                    break;
                }
                i += opt_len;
            }
        }
    }
    None
}

/// Write `hdr` into `out[..hdr.header_len()]` with a zero checksum and
/// zeroed options area.
pub fn write_header(hdr: &TcpHeader, out: &mut [u8]) -> Option<usize> {
    let header_len = hdr.header_len();
    if out.len() < header_len || header_len < TCP_HEADER_LEN {
        return None;
    }

    out[0..2].copy_from_slice(&hdr.src_port.to_be_bytes());
    out[2..4].copy_from_slice(&hdr.dst_port.to_be_bytes());
    out[4..8].copy_from_slice(&hdr.seq_num.to_be_bytes());
    out[8..12].copy_from_slice(&hdr.ack_num.to_be_bytes());
    out[12] = (hdr.data_offset << 4) & 0xF0;
    out[13] = hdr.flags & 0x3F;
    out[14..16].copy_from_slice(&hdr.window_size.to_be_bytes());
    out[16..18].copy_from_slice(&[0, 0]);
    out[18..20].copy_from_slice(&hdr.urgent_ptr.to_be_bytes());
    out[TCP_HEADER_LEN..header_len].fill(0);

    Some(header_len)
}

pub fn write_mss_option(mss: u16, out: &mut [u8]) -> Option<usize> {
    if out.len() < 4 {
        return None;
    }
    out[0] = TCP_OPT_MSS;
    out[1] = TCP_OPT_MSS_LEN;
    out[2..4].copy_from_slice(&mss.to_be_bytes());
    Some(4)
}

// =============================================================================
// Sequence number arithmetic (RFC 793 section 3.3)
// =============================================================================

#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

// =============================================================================
// States, tuples, errors
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl TcpState {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Listen => "LISTEN",
            Self::SynSent => "SYN_SENT",
            Self::SynReceived => "SYN_RECEIVED",
            Self::Established => "ESTABLISHED",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::CloseWait => "CLOSE_WAIT",
            Self::Closing => "CLOSING",
            Self::LastAck => "LAST_ACK",
            Self::TimeWait => "TIME_WAIT",
        }
    }

    /// States in which the peer may still send us data.
    pub const fn can_receive(self) -> bool {
        matches!(self, Self::Established | Self::FinWait1 | Self::FinWait2)
    }

    /// States in which we may still queue data.
    pub const fn can_send(self) -> bool {
        matches!(
            self,
            Self::SynSent | Self::SynReceived | Self::Established | Self::CloseWait
        )
    }
}

/// Connection four-tuple, from our side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TcpTuple {
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TcpError {
    /// Connection table is full.
    TableFull,
    /// Stale or unknown handle.
    NotFound,
    /// Wrong state for the requested operation.
    InvalidState,
    AddrInUse,
    ConnectionReset,
    TimedOut,
    /// RST in answer to our SYN.
    ConnectionRefused,
    /// Nothing to accept yet.
    WouldBlock,
}

/// Generational reference to a connection slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnHandle {
    index: u16,
    generation: u32,
}

impl ConnHandle {
    pub const fn index(&self) -> usize {
        self.index as usize
    }
}

/// Segment produced by the state machine, ready for [`Self::to_bytes`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpOutSegment {
    pub tuple: TcpTuple,
    pub seq_num: u32,
    pub ack_num: u32,
    pub flags: u8,
    pub window_size: u16,
    /// MSS option to include (0 = none).
    pub mss: u16,
    pub payload: Vec<u8>,
}

impl TcpOutSegment {
    /// Header, options and payload with the checksum filled in.
    pub fn to_bytes(&self) -> Vec<u8> {
        let options = if self.mss != 0 { 4 } else { 0 };
        let header_len = TCP_HEADER_LEN + options;
        let mut seg = Vec::with_capacity(header_len + self.payload.len());
        seg.resize(header_len, 0);
        let hdr = TcpHeader {
            src_port: self.tuple.local_port,
            dst_port: self.tuple.remote_port,
            seq_num: self.seq_num,
            ack_num: self.ack_num,
            data_offset: (header_len / 4) as u8,
            flags: self.flags,
            window_size: self.window_size,
            checksum: 0,
            urgent_ptr: 0,
        };
        let _ = write_header(&hdr, &mut seg);
        if self.mss != 0 {
            let _ = write_mss_option(self.mss, &mut seg[TCP_HEADER_LEN..]);
        }
        seg.extend_from_slice(&self.payload);
        let sum = transport_checksum(self.tuple.local_ip, self.tuple.remote_ip, IPPROTO_TCP, &seg);
        seg[16..18].copy_from_slice(&sum.to_be_bytes());
        seg
    }

    fn control(tuple: TcpTuple, seq_num: u32, ack_num: u32, flags: u8) -> Self {
        Self {
            tuple,
            seq_num,
            ack_num,
            flags,
            window_size: 0,
            mss: 0,
            payload: Vec::new(),
        }
    }
}

/// RST answering a segment that matched no connection (RFC 793 "reset
/// generation" for CLOSED).
pub fn build_rst_for(
    hdr: &TcpHeader,
    payload_len: usize,
    local_ip: Ipv4Addr,
    remote_ip: Ipv4Addr,
) -> TcpOutSegment {
    let tuple = TcpTuple {
        local_ip,
        local_port: hdr.dst_port,
        remote_ip,
        remote_port: hdr.src_port,
    };
    if hdr.is_ack() {
        TcpOutSegment::control(tuple, hdr.ack_num, 0, TCP_FLAG_RST)
    } else {
        let seg_len = payload_len as u32 + hdr.is_syn() as u32 + hdr.is_fin() as u32;
        TcpOutSegment::control(
            tuple,
            0,
            hdr.seq_num.wrapping_add(seg_len),
            TCP_FLAG_RST | TCP_FLAG_ACK,
        )
    }
}

// =============================================================================
// Connection
// =============================================================================

pub struct TcpConnection {
    pub tuple: TcpTuple,
    pub state: TcpState,

    pub iss: u32,
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u16,
    pub irs: u32,
    pub rcv_nxt: u32,
    pub peer_mss: u16,

    /// Unacknowledged and unsent data; byte 0 is at `snd_una` once the SYN
    /// has been acknowledged.
    send_buf: VecDeque<u8>,
    fin_queued: bool,
    fin_sent: bool,
    recv_buf: VecDeque<u8>,
    peer_fin: bool,

    /// Listener: children that reached ESTABLISHED, oldest first.
    backlog: VecDeque<usize>,
    /// Child: the listener it is queued on until accepted.
    parent: Option<usize>,
    user_closed: bool,
    error: Option<TcpError>,

    rto_ms: u32,
    retransmits: u8,
    rtx_deadline_ms: Option<u64>,
    time_wait_start_ms: u64,
}

impl TcpConnection {
    fn new(tuple: TcpTuple, state: TcpState, iss: u32) -> Self {
        Self {
            tuple,
            state,
            iss,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            irs: 0,
            rcv_nxt: 0,
            peer_mss: DEFAULT_MSS,
            send_buf: VecDeque::new(),
            fin_queued: false,
            fin_sent: false,
            recv_buf: VecDeque::new(),
            peer_fin: false,
            backlog: VecDeque::new(),
            parent: None,
            user_closed: false,
            error: None,
            rto_ms: INITIAL_RTO_MS,
            retransmits: 0,
            rtx_deadline_ms: None,
            time_wait_start_ms: 0,
        }
    }

    pub fn rcv_window(&self) -> u16 {
        RECV_BUFFER_SIZE.saturating_sub(self.recv_buf.len()) as u16
    }

    pub fn bytes_buffered(&self) -> usize {
        self.recv_buf.len()
    }

    pub fn bytes_unacked(&self) -> usize {
        self.send_buf.len()
    }

    pub fn error(&self) -> Option<TcpError> {
        self.error
    }

    fn segment(&self, seq_num: u32, flags: u8, payload: Vec<u8>) -> TcpOutSegment {
        TcpOutSegment {
            tuple: self.tuple,
            seq_num,
            ack_num: self.rcv_nxt,
            flags,
            window_size: self.rcv_window(),
            mss: if flags & TCP_FLAG_SYN != 0 { DEFAULT_MSS } else { 0 },
            payload,
        }
    }

    fn ack(&self) -> TcpOutSegment {
        self.segment(self.snd_nxt, TCP_FLAG_ACK, Vec::new())
    }

    fn rst(&self) -> TcpOutSegment {
        TcpOutSegment::control(self.tuple, self.snd_nxt, 0, TCP_FLAG_RST)
    }

    fn arm_timer(&mut self, now_ms: u64) {
        if self.rtx_deadline_ms.is_none() {
            self.rtx_deadline_ms = Some(now_ms + self.rto_ms as u64);
        }
    }

    fn reset_timer(&mut self, now_ms: u64) {
        self.retransmits = 0;
        self.rto_ms = INITIAL_RTO_MS;
        self.rtx_deadline_ms = if self.snd_nxt != self.snd_una {
            Some(now_ms + self.rto_ms as u64)
        } else {
            None
        };
    }

    fn enter_time_wait(&mut self, now_ms: u64) {
        self.state = TcpState::TimeWait;
        self.time_wait_start_ms = now_ms;
        self.rtx_deadline_ms = None;
    }

    /// Send queued data within the peer's window, then the FIN once the
    /// queue has drained.
    fn flush(&mut self, now_ms: u64, out: &mut Vec<TcpOutSegment>) {
        if !matches!(self.state, TcpState::Established | TcpState::CloseWait) {
            return;
        }
        // A pending persist deadline is stale once the window reopens.
        if self.snd_nxt == self.snd_una && self.snd_wnd > 0 {
            self.rtx_deadline_ms = None;
        }
        let mss = self.peer_mss.max(1) as usize;
        loop {
            let in_flight = self.snd_nxt.wrapping_sub(self.snd_una) as usize;
            if in_flight >= self.send_buf.len() {
                break;
            }
            let room = (self.snd_wnd as usize).saturating_sub(in_flight);
            if room == 0 {
                break;
            }
            let len = mss.min(room).min(self.send_buf.len() - in_flight);
            let payload: Vec<u8> = self
                .send_buf
                .range(in_flight..in_flight + len)
                .copied()
                .collect();
            out.push(self.segment(self.snd_nxt, TCP_FLAG_ACK | TCP_FLAG_PSH, payload));
            self.snd_nxt = self.snd_nxt.wrapping_add(len as u32);
            self.arm_timer(now_ms);
        }

        // Zero window with nothing in flight: persist timer.
        if self.snd_wnd == 0
            && self.snd_nxt == self.snd_una
            && !self.send_buf.is_empty()
        {
            self.arm_timer(now_ms);
        }

        let drained = self.snd_nxt.wrapping_sub(self.snd_una) as usize == self.send_buf.len();
        if self.fin_queued && !self.fin_sent && drained {
            out.push(self.segment(self.snd_nxt, TCP_FLAG_FIN | TCP_FLAG_ACK, Vec::new()));
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.fin_sent = true;
            let prev = self.state;
            self.state = if prev == TcpState::CloseWait {
                TcpState::LastAck
            } else {
                TcpState::FinWait1
            };
            klog_debug!(
                "tcp: {} -> {} port {}",
                prev.name(),
                self.state.name(),
                self.tuple.local_port
            );
            self.arm_timer(now_ms);
        }
    }

    /// Resend the oldest unacknowledged SYN, data or FIN.
    fn retransmit(&mut self, out: &mut Vec<TcpOutSegment>) {
        match self.state {
            TcpState::SynSent => out.push(self.segment(self.iss, TCP_FLAG_SYN, Vec::new())),
            TcpState::SynReceived => out.push(self.segment(
                self.iss,
                TCP_FLAG_SYN | TCP_FLAG_ACK,
                Vec::new(),
            )),
            _ => {
                let mss = self.peer_mss.max(1) as usize;
                let in_flight = self.snd_nxt.wrapping_sub(self.snd_una) as usize;
                let data = in_flight.min(self.send_buf.len()).min(mss);
                if data > 0 {
                    let payload: Vec<u8> = self.send_buf.range(..data).copied().collect();
                    out.push(self.segment(self.snd_una, TCP_FLAG_ACK | TCP_FLAG_PSH, payload));
                } else if self.snd_wnd == 0 && in_flight < self.send_buf.len() {
                    // One byte past the closed window; the peer's ACK
                    // carries its current window back.
                    klog_debug!(
                        "tcp: port {} zero window, sending one byte",
                        self.tuple.local_port
                    );
                    let payload: Vec<u8> =
                        self.send_buf.range(in_flight..in_flight + 1).copied().collect();
                    out.push(self.segment(self.snd_nxt, TCP_FLAG_ACK | TCP_FLAG_PSH, payload));
                    self.snd_nxt = self.snd_nxt.wrapping_add(1);
                } else if self.fin_sent {
                    out.push(self.segment(
                        self.snd_nxt.wrapping_sub(1),
                        TCP_FLAG_FIN | TCP_FLAG_ACK,
                        Vec::new(),
                    ));
                }
            }
        }
    }
}

struct Slot {
    generation: u32,
    conn: Option<TcpConnection>,
}

// =============================================================================
// Table
// =============================================================================

pub struct TcpTable {
    slots: Vec<Slot>,
    next_isn: u32,
    next_port: u16,
}

impl Default for TcpTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_CONNECTIONS);
        for _ in 0..MAX_CONNECTIONS {
            slots.push(Slot {
                generation: 0,
                conn: None,
            });
        }
        Self {
            slots,
            next_isn: ISN_START,
            next_port: EPHEMERAL_PORT_START,
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| s.conn.is_some()).count()
    }

    pub fn get(&self, handle: ConnHandle) -> Option<&TcpConnection> {
        let slot = self.slots.get(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.conn.as_ref()
    }

    fn get_mut(&mut self, handle: ConnHandle) -> Option<&mut TcpConnection> {
        let slot = self.slots.get_mut(handle.index())?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.conn.as_mut()
    }

    pub fn state(&self, handle: ConnHandle) -> Option<TcpState> {
        self.get(handle).map(|c| c.state)
    }

    pub fn tuple(&self, handle: ConnHandle) -> Option<TcpTuple> {
        self.get(handle).map(|c| c.tuple)
    }

    /// Peer closed its side and every byte it sent has been read.
    pub fn is_eof(&self, handle: ConnHandle) -> bool {
        self.get(handle)
            .is_some_and(|c| c.peer_fin && c.recv_buf.is_empty())
    }

    fn handle_of(&self, idx: usize) -> ConnHandle {
        ConnHandle {
            index: idx as u16,
            generation: self.slots[idx].generation,
        }
    }

    fn conn(&mut self, idx: usize) -> Option<&mut TcpConnection> {
        self.slots.get_mut(idx).and_then(|s| s.conn.as_mut())
    }

    fn alloc_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.conn.is_none())
    }

    fn generate_isn(&mut self) -> u32 {
        let isn = self.next_isn;
        self.next_isn = self.next_isn.wrapping_add(ISN_STEP);
        isn
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.slots
            .iter()
            .filter_map(|s| s.conn.as_ref())
            .any(|c| c.tuple.local_port == port)
    }

    /// Next free port in 49152..=65535.
    fn alloc_ephemeral_port(&mut self) -> Option<u16> {
        let span = (u16::MAX - EPHEMERAL_PORT_START) as usize + 1;
        for _ in 0..span {
            let port = self.next_port;
            self.next_port = if port == u16::MAX {
                EPHEMERAL_PORT_START
            } else {
                port + 1
            };
            if !self.port_in_use(port) {
                return Some(port);
            }
        }
        None
    }

    fn find(&self, tuple: &TcpTuple) -> Option<usize> {
        let exact = self.slots.iter().position(|s| {
            s.conn.as_ref().is_some_and(|c| {
                c.state != TcpState::Listen
                    && c.tuple.local_port == tuple.local_port
                    && c.tuple.remote_ip == tuple.remote_ip
                    && c.tuple.remote_port == tuple.remote_port
            })
        });
        if exact.is_some() {
            return exact;
        }
        self.slots.iter().position(|s| {
            s.conn.as_ref().is_some_and(|c| {
                c.state == TcpState::Listen
                    && c.tuple.local_port == tuple.local_port
                    && (c.tuple.local_ip.is_unspecified() || c.tuple.local_ip == tuple.local_ip)
            })
        })
    }

    fn release(&mut self, idx: usize) {
        let Some(slot) = self.slots.get_mut(idx) else {
            return;
        };
        let Some(conn) = slot.conn.take() else {
            return;
        };
        slot.generation = slot.generation.wrapping_add(1);
        if let Some(parent) = conn.parent {
            if let Some(listener) = self.conn(parent) {
                listener.backlog.retain(|&c| c != idx);
            }
        }
    }

    /// Connection reached CLOSED. The slot is freed unless a user still
    /// holds it and has not closed it yet.
    fn finish(&mut self, idx: usize, error: Option<TcpError>) {
        let Some(conn) = self.conn(idx) else {
            return;
        };
        klog_debug!(
            "tcp: {} -> CLOSED port {}{}",
            conn.state.name(),
            conn.tuple.local_port,
            if error.is_some() { " (error)" } else { "" }
        );
        conn.state = TcpState::Closed;
        conn.rtx_deadline_ms = None;
        if error.is_some() {
            conn.error = error;
        }
        if conn.user_closed || conn.parent.is_some() {
            self.release(idx);
        }
    }

    // -------------------------------------------------------------------------
    // User operations
    // -------------------------------------------------------------------------

    /// Active open. `local_port` 0 picks an ephemeral port.
    pub fn connect(
        &mut self,
        local_ip: Ipv4Addr,
        local_port: u16,
        remote_ip: Ipv4Addr,
        remote_port: u16,
        now_ms: u64,
        out: &mut Vec<TcpOutSegment>,
    ) -> Result<ConnHandle, TcpError> {
        let idx = self.alloc_slot().ok_or(TcpError::TableFull)?;
        let local_port = if local_port == 0 {
            self.alloc_ephemeral_port().ok_or(TcpError::AddrInUse)?
        } else {
            local_port
        };
        let iss = self.generate_isn();
        let tuple = TcpTuple {
            local_ip,
            local_port,
            remote_ip,
            remote_port,
        };

        let mut conn = TcpConnection::new(tuple, TcpState::SynSent, iss);
        conn.snd_nxt = iss.wrapping_add(1);
        out.push(conn.segment(iss, TCP_FLAG_SYN, Vec::new()));
        conn.arm_timer(now_ms);
        klog_debug!(
            "tcp: connect {}:{} -> {}:{} iss={}",
            local_ip,
            local_port,
            remote_ip,
            remote_port,
            iss
        );
        self.slots[idx].conn = Some(conn);
        Ok(self.handle_of(idx))
    }

    pub fn listen(&mut self, local_ip: Ipv4Addr, port: u16) -> Result<ConnHandle, TcpError> {
        if port == 0 {
            return Err(TcpError::InvalidState);
        }
        let taken = self.slots.iter().filter_map(|s| s.conn.as_ref()).any(|c| {
            c.state == TcpState::Listen && c.tuple.local_port == port
        });
        if taken {
            return Err(TcpError::AddrInUse);
        }
        let idx = self.alloc_slot().ok_or(TcpError::TableFull)?;
        let tuple = TcpTuple {
            local_ip,
            local_port: port,
            remote_ip: Ipv4Addr::UNSPECIFIED,
            remote_port: 0,
        };
        self.slots[idx].conn = Some(TcpConnection::new(tuple, TcpState::Listen, 0));
        klog_debug!("tcp: listen on port {}", port);
        Ok(self.handle_of(idx))
    }

    /// Pop the oldest established child off `listener`'s backlog.
    pub fn accept(&mut self, listener: ConnHandle) -> Result<ConnHandle, TcpError> {
        let conn = self.get_mut(listener).ok_or(TcpError::NotFound)?;
        if conn.state != TcpState::Listen {
            return Err(TcpError::InvalidState);
        }
        let child = conn.backlog.pop_front().ok_or(TcpError::WouldBlock)?;
        if let Some(c) = self.conn(child) {
            c.parent = None;
        }
        Ok(self.handle_of(child))
    }

    /// Queue `data` and push what the window allows. Returns bytes accepted,
    /// which may be fewer than offered when the send buffer is full.
    pub fn send(
        &mut self,
        handle: ConnHandle,
        data: &[u8],
        now_ms: u64,
        out: &mut Vec<TcpOutSegment>,
    ) -> Result<usize, TcpError> {
        let conn = self.get_mut(handle).ok_or(TcpError::NotFound)?;
        if let Some(err) = conn.error {
            return Err(err);
        }
        if !conn.state.can_send() || conn.fin_queued {
            return Err(TcpError::InvalidState);
        }
        let n = data
            .len()
            .min(SEND_BUFFER_SIZE.saturating_sub(conn.send_buf.len()));
        conn.send_buf.extend(&data[..n]);
        conn.flush(now_ms, out);
        Ok(n)
    }

    /// Drain buffered bytes without blocking. `Ok(0)` when nothing is
    /// buffered, including at end of stream (see [`Self::is_eof`]).
    pub fn receive(
        &mut self,
        handle: ConnHandle,
        buf: &mut [u8],
        out: &mut Vec<TcpOutSegment>,
    ) -> Result<usize, TcpError> {
        let conn = self.get_mut(handle).ok_or(TcpError::NotFound)?;
        if conn.recv_buf.is_empty() {
            return match conn.error {
                Some(err) => Err(err),
                None => Ok(0),
            };
        }
        let before = conn.rcv_window();
        let n = buf.len().min(conn.recv_buf.len());
        for (dst, src) in buf.iter_mut().zip(conn.recv_buf.drain(..n)) {
            *dst = src;
        }
        // Window update once a closed-down window reopens to a full segment.
        let mss = conn.peer_mss;
        if conn.state.can_receive() && before < mss && conn.rcv_window() >= mss {
            out.push(conn.ack());
        }
        Ok(n)
    }

    /// Graceful close. Data already queued is still delivered before the FIN.
    pub fn close(
        &mut self,
        handle: ConnHandle,
        now_ms: u64,
        out: &mut Vec<TcpOutSegment>,
    ) -> Result<(), TcpError> {
        let idx = handle.index();
        let conn = self.get_mut(handle).ok_or(TcpError::NotFound)?;
        conn.user_closed = true;
        let state = conn.state;
        match state {
            TcpState::Listen => {
                let children: Vec<usize> = self
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.conn.as_ref().is_some_and(|c| c.parent == Some(idx)))
                    .map(|(i, _)| i)
                    .collect();
                for child in children {
                    if let Some(c) = self.conn(child) {
                        out.push(c.rst());
                    }
                    self.release(child);
                }
                self.release(idx);
            }
            TcpState::Closed | TcpState::SynSent => self.release(idx),
            TcpState::SynReceived => {
                out.push(conn.rst());
                self.release(idx);
            }
            TcpState::Established | TcpState::CloseWait => {
                conn.fin_queued = true;
                conn.flush(now_ms, out);
            }
            TcpState::FinWait1
            | TcpState::FinWait2
            | TcpState::Closing
            | TcpState::LastAck
            | TcpState::TimeWait => {}
        }
        Ok(())
    }

    /// Send RST (unless nothing was ever sent) and free the slot.
    pub fn abort(
        &mut self,
        handle: ConnHandle,
        out: &mut Vec<TcpOutSegment>,
    ) -> Result<(), TcpError> {
        let conn = self.get_mut(handle).ok_or(TcpError::NotFound)?;
        if !matches!(conn.state, TcpState::Listen | TcpState::Closed) {
            out.push(conn.rst());
        }
        conn.user_closed = true;
        if conn.state == TcpState::Listen {
            return self.close(handle, 0, out);
        }
        self.release(handle.index());
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    /// Retransmit expired timers and reap TIME_WAIT. Returns connections
    /// freed.
    pub fn tick(&mut self, now_ms: u64, out: &mut Vec<TcpOutSegment>) -> usize {
        let mut freed = 0;
        for idx in 0..self.slots.len() {
            let Some(conn) = self.conn(idx) else {
                continue;
            };
            if conn.state == TcpState::TimeWait {
                if now_ms.saturating_sub(conn.time_wait_start_ms) >= TIME_WAIT_MS {
                    self.finish(idx, None);
                    freed += self.slots[idx].conn.is_none() as usize;
                }
                continue;
            }
            let Some(deadline) = conn.rtx_deadline_ms else {
                continue;
            };
            if now_ms < deadline {
                continue;
            }
            if conn.retransmits >= MAX_RETRANSMITS {
                klog_debug!(
                    "tcp: port {} giving up after {} retransmits",
                    conn.tuple.local_port,
                    conn.retransmits
                );
                out.push(conn.rst());
                self.finish(idx, Some(TcpError::TimedOut));
                freed += self.slots[idx].conn.is_none() as usize;
                continue;
            }
            conn.retransmits += 1;
            conn.rto_ms = conn.rto_ms.saturating_mul(2).min(MAX_RTO_MS);
            conn.rtx_deadline_ms = Some(now_ms + conn.rto_ms as u64);
            conn.retransmit(out);
        }
        freed
    }

    // -------------------------------------------------------------------------
    // Segment arrival
    // -------------------------------------------------------------------------

    /// Process one received segment (header + payload). The checksum is
    /// verified here; bad segments are dropped.
    pub fn input(
        &mut self,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        segment: &[u8],
        now_ms: u64,
        out: &mut Vec<TcpOutSegment>,
    ) {
        if transport_checksum(src_ip, dst_ip, IPPROTO_TCP, segment) != 0 {
            klog_debug!("tcp: bad checksum from {}", src_ip);
            return;
        }
        let Some(hdr) = parse_header(segment) else {
            klog_debug!("tcp: malformed header from {}", src_ip);
            return;
        };
        let options = &segment[TCP_HEADER_LEN..hdr.header_len()];
        let payload = &segment[hdr.header_len()..];

        let tuple = TcpTuple {
            local_ip: dst_ip,
            local_port: hdr.dst_port,
            remote_ip: src_ip,
            remote_port: hdr.src_port,
        };

        let Some(idx) = self.find(&tuple) else {
            if !hdr.is_rst() {
                out.push(build_rst_for(&hdr, payload.len(), dst_ip, src_ip));
            }
            return;
        };

        let state = match self.conn(idx) {
            Some(c) => c.state,
            None => return,
        };
        match state {
            TcpState::Closed => {
                if !hdr.is_rst() {
                    out.push(build_rst_for(&hdr, payload.len(), dst_ip, src_ip));
                }
            }
            TcpState::Listen => self.process_listen(idx, &hdr, options, &tuple, now_ms, out),
            TcpState::SynSent => self.process_syn_sent(idx, &hdr, options, now_ms, out),
            TcpState::SynReceived => self.process_syn_received(idx, &hdr, payload, now_ms, out),
            TcpState::TimeWait => self.process_time_wait(idx, &hdr, now_ms, out),
            _ => self.process_synchronized(idx, &hdr, payload, now_ms, out),
        }
    }

    fn process_listen(
        &mut self,
        listen_idx: usize,
        hdr: &TcpHeader,
        options: &[u8],
        tuple: &TcpTuple,
        now_ms: u64,
        out: &mut Vec<TcpOutSegment>,
    ) {
        if hdr.is_rst() {
            return;
        }
        if hdr.is_ack() {
            out.push(TcpOutSegment::control(*tuple, hdr.ack_num, 0, TCP_FLAG_RST));
            return;
        }
        if !hdr.is_syn() {
            return;
        }

        let pending = self
            .slots
            .iter()
            .filter(|s| s.conn.as_ref().is_some_and(|c| c.parent == Some(listen_idx)))
            .count();
        if pending >= LISTEN_BACKLOG {
            klog_debug!("tcp: backlog full on port {}, dropping SYN", tuple.local_port);
            return;
        }
        let Some(new_idx) = self.alloc_slot() else {
            klog_debug!("tcp: table full, dropping SYN from {}", tuple.remote_ip);
            return;
        };

        let iss = self.generate_isn();
        let mut child = TcpConnection::new(*tuple, TcpState::SynReceived, iss);
        child.snd_nxt = iss.wrapping_add(1);
        child.irs = hdr.seq_num;
        child.rcv_nxt = hdr.seq_num.wrapping_add(1);
        child.snd_wnd = hdr.window_size;
        child.peer_mss = parse_mss_option(options).unwrap_or(DEFAULT_MSS);
        child.parent = Some(listen_idx);
        out.push(child.segment(iss, TCP_FLAG_SYN | TCP_FLAG_ACK, Vec::new()));
        child.arm_timer(now_ms);

        klog_debug!(
            "tcp: LISTEN -> SYN_RECEIVED {}:{} iss={} irs={}",
            tuple.remote_ip,
            tuple.remote_port,
            iss,
            hdr.seq_num
        );
        self.slots[new_idx].conn = Some(child);
    }

    fn process_syn_sent(
        &mut self,
        idx: usize,
        hdr: &TcpHeader,
        options: &[u8],
        now_ms: u64,
        out: &mut Vec<TcpOutSegment>,
    ) {
        let Some(conn) = self.conn(idx) else {
            return;
        };

        if hdr.is_ack() && (seq_le(hdr.ack_num, conn.iss) || seq_gt(hdr.ack_num, conn.snd_nxt)) {
            if !hdr.is_rst() {
                out.push(TcpOutSegment::control(conn.tuple, hdr.ack_num, 0, TCP_FLAG_RST));
            }
            return;
        }

        if hdr.is_rst() {
            if hdr.is_ack() {
                klog_debug!("tcp: connection to {} refused", conn.tuple.remote_ip);
                self.finish(idx, Some(TcpError::ConnectionRefused));
            }
            return;
        }

        if !hdr.is_syn() {
            return;
        }

        conn.irs = hdr.seq_num;
        conn.rcv_nxt = hdr.seq_num.wrapping_add(1);
        conn.snd_wnd = hdr.window_size;
        conn.peer_mss = parse_mss_option(options).unwrap_or(DEFAULT_MSS);

        if hdr.is_ack() {
            conn.snd_una = hdr.ack_num;
            conn.state = TcpState::Established;
            conn.reset_timer(now_ms);
            klog_debug!(
                "tcp: SYN_SENT -> ESTABLISHED {}:{}",
                conn.tuple.remote_ip,
                conn.tuple.remote_port
            );
            out.push(conn.ack());
            conn.flush(now_ms, out);
        } else {
            // Simultaneous open.
            conn.state = TcpState::SynReceived;
            klog_debug!("tcp: SYN_SENT -> SYN_RECEIVED (simultaneous open)");
            out.push(conn.segment(conn.iss, TCP_FLAG_SYN | TCP_FLAG_ACK, Vec::new()));
        }
    }

    fn process_syn_received(
        &mut self,
        idx: usize,
        hdr: &TcpHeader,
        payload: &[u8],
        now_ms: u64,
        out: &mut Vec<TcpOutSegment>,
    ) {
        let Some(conn) = self.conn(idx) else {
            return;
        };

        if hdr.is_rst() {
            let err = if conn.parent.is_some() {
                None
            } else {
                Some(TcpError::ConnectionRefused)
            };
            self.finish(idx, err);
            return;
        }
        if !hdr.is_ack() {
            return;
        }
        if seq_le(hdr.ack_num, conn.iss) || seq_gt(hdr.ack_num, conn.snd_nxt) {
            out.push(TcpOutSegment::control(conn.tuple, hdr.ack_num, 0, TCP_FLAG_RST));
            return;
        }

        conn.snd_una = hdr.ack_num;
        conn.snd_wnd = hdr.window_size;
        conn.state = TcpState::Established;
        conn.reset_timer(now_ms);
        klog_debug!(
            "tcp: SYN_RECEIVED -> ESTABLISHED {}:{}",
            conn.tuple.remote_ip,
            conn.tuple.remote_port
        );
        if let Some(parent) = conn.parent {
            if let Some(listener) = self.conn(parent) {
                listener.backlog.push_back(idx);
            }
        }

        // The handshake ACK may already carry data or a FIN.
        if !payload.is_empty() || hdr.is_fin() {
            self.process_synchronized(idx, hdr, payload, now_ms, out);
        } else if let Some(conn) = self.conn(idx) {
            conn.flush(now_ms, out);
        }
    }

    fn process_synchronized(
        &mut self,
        idx: usize,
        hdr: &TcpHeader,
        payload: &[u8],
        now_ms: u64,
        out: &mut Vec<TcpOutSegment>,
    ) {
        let Some(conn) = self.conn(idx) else {
            return;
        };

        if hdr.is_rst() {
            klog_debug!("tcp: {} RST from peer", conn.state.name());
            self.finish(idx, Some(TcpError::ConnectionReset));
            return;
        }
        if hdr.is_syn() {
            klog_debug!("tcp: {} unexpected SYN, resetting", conn.state.name());
            out.push(conn.rst());
            self.finish(idx, Some(TcpError::ConnectionReset));
            return;
        }
        if !hdr.is_ack() {
            return;
        }

        // ACK for something we never sent.
        if seq_gt(hdr.ack_num, conn.snd_nxt) {
            out.push(conn.ack());
            return;
        }

        let mut fin_acked = false;
        if seq_ge(hdr.ack_num, conn.snd_una) {
            let acked = hdr.ack_num.wrapping_sub(conn.snd_una) as usize;
            if acked > 0 {
                let data = acked.min(conn.send_buf.len());
                conn.send_buf.drain(..data);
                conn.snd_una = hdr.ack_num;
                conn.reset_timer(now_ms);
            } else if hdr.window_size == 0 && conn.snd_nxt != conn.snd_una {
                // Still full, but the peer answered.
                conn.retransmits = 0;
            }
            conn.snd_wnd = hdr.window_size;
            fin_acked = conn.fin_sent && hdr.ack_num == conn.snd_nxt;
        }

        if fin_acked {
            let state = conn.state;
            match state {
                TcpState::FinWait1 => {
                    conn.state = TcpState::FinWait2;
                    klog_debug!("tcp: FIN_WAIT_1 -> FIN_WAIT_2 port {}", conn.tuple.local_port);
                }
                TcpState::Closing => {
                    conn.enter_time_wait(now_ms);
                    klog_debug!("tcp: CLOSING -> TIME_WAIT port {}", conn.tuple.local_port);
                    return;
                }
                TcpState::LastAck => {
                    self.finish(idx, None);
                    return;
                }
                _ => {}
            }
        }

        let mut need_ack = false;
        let seq = hdr.seq_num;
        let mut fin_in_order = hdr.is_fin();

        if !payload.is_empty() {
            need_ack = true;
            // Trim bytes we already have.
            let skip = if seq_lt(seq, conn.rcv_nxt) {
                conn.rcv_nxt.wrapping_sub(seq) as usize
            } else {
                0
            };
            let in_order = seq_le(seq, conn.rcv_nxt);
            if !in_order || !conn.state.can_receive() {
                fin_in_order = false;
            } else if skip < payload.len() {
                let fresh = &payload[skip..];
                let room = RECV_BUFFER_SIZE.saturating_sub(conn.recv_buf.len());
                let take = fresh.len().min(room);
                conn.recv_buf.extend(&fresh[..take]);
                conn.rcv_nxt = conn.rcv_nxt.wrapping_add(take as u32);
                if take < fresh.len() {
                    fin_in_order = false;
                }
            }
        } else if hdr.is_fin() && seq != conn.rcv_nxt {
            fin_in_order = false;
            need_ack = true;
        }

        if hdr.is_fin() {
            need_ack = true;
            if fin_in_order && !conn.peer_fin {
                conn.rcv_nxt = conn.rcv_nxt.wrapping_add(1);
                conn.peer_fin = true;
                let prev = conn.state;
                match prev {
                    TcpState::Established => conn.state = TcpState::CloseWait,
                    TcpState::FinWait1 => conn.state = TcpState::Closing,
                    TcpState::FinWait2 => conn.enter_time_wait(now_ms),
                    _ => {}
                }
                klog_debug!(
                    "tcp: FIN from {}:{}, {} -> {}",
                    conn.tuple.remote_ip,
                    conn.tuple.remote_port,
                    prev.name(),
                    conn.state.name()
                );
            }
        }

        if need_ack {
            out.push(conn.ack());
        }
        conn.flush(now_ms, out);
    }

    fn process_time_wait(
        &mut self,
        idx: usize,
        hdr: &TcpHeader,
        now_ms: u64,
        out: &mut Vec<TcpOutSegment>,
    ) {
        if hdr.is_rst() {
            self.finish(idx, None);
            return;
        }
        let Some(conn) = self.conn(idx) else {
            return;
        };
        // Retransmitted FIN: our last ACK was lost.
        if hdr.is_fin() {
            out.push(conn.ack());
            conn.time_wait_start_ms = now_ms;
        }
    }
}
