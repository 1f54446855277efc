//! ICMP echo (RFC 792).

use alloc::vec::Vec;

use super::internet_checksum;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_HEADER_LEN: usize = 8;
/// Payload carried by outgoing echo requests.
pub const PING_PAYLOAD_LEN: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IcmpEcho<'a> {
    pub icmp_type: u8,
    pub code: u8,
    pub id: u16,
    pub seq: u16,
    pub payload: &'a [u8],
}

impl<'a> IcmpEcho<'a> {
    /// Parse an echo request or reply. Other types and bad checksums are
    /// rejected.
    pub fn parse(msg: &'a [u8]) -> Option<Self> {
        if msg.len() < ICMP_HEADER_LEN || internet_checksum(msg) != 0 {
            return None;
        }
        let icmp_type = msg[0];
        if icmp_type != ICMP_ECHO_REQUEST && icmp_type != ICMP_ECHO_REPLY {
            return None;
        }
        Some(Self {
            icmp_type,
            code: msg[1],
            id: u16::from_be_bytes([msg[4], msg[5]]),
            seq: u16::from_be_bytes([msg[6], msg[7]]),
            payload: &msg[ICMP_HEADER_LEN..],
        })
    }

    pub fn is_request(&self) -> bool {
        self.icmp_type == ICMP_ECHO_REQUEST
    }
}

pub fn build_echo(icmp_type: u8, id: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());
    msg.push(icmp_type);
    msg.push(0);
    msg.extend_from_slice(&[0, 0]);
    msg.extend_from_slice(&id.to_be_bytes());
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(payload);
    let sum = internet_checksum(&msg);
    msg[2..4].copy_from_slice(&sum.to_be_bytes());
    msg
}

/// The reply to `request`: same identifier, sequence and data.
pub fn echo_reply_for(request: &IcmpEcho<'_>) -> Vec<u8> {
    build_echo(ICMP_ECHO_REPLY, request.id, request.seq, request.payload)
}

pub fn ping_payload() -> [u8; PING_PAYLOAD_LEN] {
    let mut data = [0u8; PING_PAYLOAD_LEN];
    for (i, b) in data.iter_mut().enumerate() {
        *b = b'a' + (i % 23) as u8;
    }
    data
}

/// Outstanding echo request state for [`crate::net::NetStack::ping`].
#[derive(Default)]
pub struct PingState {
    pub id: u16,
    next_seq: u16,
    outstanding: Option<(u16, u64)>,
    rtt_us: Option<u64>,
}

impl PingState {
    pub const fn new(id: u16) -> Self {
        Self {
            id,
            next_seq: 1,
            outstanding: None,
            rtt_us: None,
        }
    }

    /// Start a new echo request sent at `now_us`. Returns its sequence number.
    pub fn begin(&mut self, now_us: u64) -> u16 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.outstanding = Some((seq, now_us));
        self.rtt_us = None;
        seq
    }

    /// Match an echo reply against the outstanding request.
    pub fn on_reply(&mut self, id: u16, seq: u16, now_us: u64) -> bool {
        match self.outstanding {
            Some((want, sent)) if id == self.id && seq == want => {
                self.outstanding = None;
                self.rtt_us = Some(now_us.saturating_sub(sent));
                true
            }
            _ => false,
        }
    }

    pub fn take_rtt(&mut self) -> Option<u64> {
        self.rtt_us.take()
    }

    pub fn cancel(&mut self) {
        self.outstanding = None;
        self.rtt_us = None;
    }
}
