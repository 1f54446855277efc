//! ARP (RFC 826) for Ethernet/IPv4 and the neighbor cache.
//!
//! The cache holds at most [`ARP_CACHE_SIZE`] entries. Resolved entries age
//! out [`ARP_ENTRY_TTL_MS`] after they were last confirmed by the wire; when
//! the cache is full the least recently used entry is evicted. An address
//! being resolved keeps up to [`ARP_MAX_PENDING`] outgoing IPv4 packets,
//! retries the request every [`ARP_RETRY_MS`] and gives up after
//! [`ARP_MAX_RETRIES`].
//!
//! Cache methods never transmit. They return what the caller must send so
//! the stack can do it after dropping the cache lock.

use alloc::vec::Vec;
use core::fmt;

use kestrel_lib::klog_debug;

use super::ethernet::ETHERTYPE_IPV4;
use super::types::{Ipv4Addr, MacAddr};

pub const ARP_HTYPE_ETHERNET: u16 = 1;
pub const ARP_PTYPE_IPV4: u16 = ETHERTYPE_IPV4;
pub const ARP_OPER_REQUEST: u16 = 1;
pub const ARP_OPER_REPLY: u16 = 2;
pub const ARP_PACKET_LEN: usize = 28;

pub const ARP_CACHE_SIZE: usize = 256;
pub const ARP_ENTRY_TTL_MS: u64 = 300_000;
pub const ARP_MAX_PENDING: usize = 4;
pub const ARP_RETRY_MS: u64 = 1_000;
pub const ARP_MAX_RETRIES: u8 = 3;

// =============================================================================
// Packet
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpPacket {
    pub oper: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            oper: ARP_OPER_REQUEST,
            sender_mac,
            sender_ip,
            target_mac: MacAddr::ZERO,
            target_ip,
        }
    }

    pub fn reply_to(&self, our_mac: MacAddr) -> Self {
        Self {
            oper: ARP_OPER_REPLY,
            sender_mac: our_mac,
            sender_ip: self.target_ip,
            target_mac: self.sender_mac,
            target_ip: self.sender_ip,
        }
    }

    /// Parse an Ethernet/IPv4 ARP packet. Other hardware or protocol types
    /// are rejected.
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < ARP_PACKET_LEN {
            return None;
        }
        let htype = u16::from_be_bytes([b[0], b[1]]);
        let ptype = u16::from_be_bytes([b[2], b[3]]);
        if htype != ARP_HTYPE_ETHERNET || ptype != ARP_PTYPE_IPV4 || b[4] != 6 || b[5] != 4 {
            return None;
        }
        Some(Self {
            oper: u16::from_be_bytes([b[6], b[7]]),
            sender_mac: MacAddr::from_slice(&b[8..14]),
            sender_ip: Ipv4Addr::from_slice(&b[14..18]),
            target_mac: MacAddr::from_slice(&b[18..24]),
            target_ip: Ipv4Addr::from_slice(&b[24..28]),
        })
    }

    pub fn to_bytes(&self) -> [u8; ARP_PACKET_LEN] {
        let mut b = [0u8; ARP_PACKET_LEN];
        b[0..2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
        b[2..4].copy_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
        b[4] = 6;
        b[5] = 4;
        b[6..8].copy_from_slice(&self.oper.to_be_bytes());
        b[8..14].copy_from_slice(&self.sender_mac.0);
        b[14..18].copy_from_slice(&self.sender_ip.0);
        b[18..24].copy_from_slice(&self.target_mac.0);
        b[24..28].copy_from_slice(&self.target_ip.0);
        b
    }
}

// =============================================================================
// Cache
// =============================================================================

pub enum ArpState {
    /// Request outstanding; IPv4 packets wait for the reply.
    Incomplete {
        retries: u8,
        next_retry_ms: u64,
        pending: Vec<Vec<u8>>,
    },
    Resolved { mac: MacAddr, confirmed_ms: u64 },
}

pub struct ArpEntry {
    pub ip: Ipv4Addr,
    pub state: ArpState,
    pub last_used_ms: u64,
}

impl fmt::Debug for ArpEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            ArpState::Incomplete {
                retries, pending, ..
            } => write!(
                f,
                "{} incomplete (retries={}, pending={})",
                self.ip,
                retries,
                pending.len()
            ),
            ArpState::Resolved { mac, .. } => write!(f, "{} at {}", self.ip, mac),
        }
    }
}

/// Outcome of queueing a packet behind an unresolved address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueOutcome {
    /// First packet for this address: send a request.
    SendRequest,
    /// Request already outstanding.
    Queued,
    /// Pending queue full; the packet was dropped.
    Dropped,
}

/// Work produced by [`ArpCache::tick`].
#[derive(Debug, Default)]
pub struct ArpTimerWork {
    pub retransmit: Vec<Ipv4Addr>,
    pub expired: usize,
    pub failed: usize,
}

#[derive(Default)]
pub struct ArpCache {
    entries: Vec<ArpEntry>,
}

impl ArpCache {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> impl Iterator<Item = &ArpEntry> {
        self.entries.iter()
    }

    fn position(&self, ip: Ipv4Addr) -> Option<usize> {
        self.entries.iter().position(|e| e.ip == ip)
    }

    /// Resolved MAC for `ip`, refreshing its LRU position.
    pub fn lookup(&mut self, ip: Ipv4Addr, now_ms: u64) -> Option<MacAddr> {
        let idx = self.position(ip)?;
        let entry = &mut self.entries[idx];
        match entry.state {
            ArpState::Resolved { mac, .. } => {
                entry.last_used_ms = now_ms;
                Some(mac)
            }
            ArpState::Incomplete { .. } => None,
        }
    }

    /// Record `ip` at `mac`. Returns the IPv4 packets that were waiting on
    /// this address, ready to be framed and sent.
    pub fn insert(&mut self, ip: Ipv4Addr, mac: MacAddr, now_ms: u64) -> Vec<Vec<u8>> {
        let resolved = ArpState::Resolved {
            mac,
            confirmed_ms: now_ms,
        };
        if let Some(idx) = self.position(ip) {
            let entry = &mut self.entries[idx];
            entry.last_used_ms = now_ms;
            let old = core::mem::replace(&mut entry.state, resolved);
            return match old {
                ArpState::Incomplete { pending, .. } => {
                    klog_debug!("arp: resolved {} at {} ({} queued)", ip, mac, pending.len());
                    pending
                }
                ArpState::Resolved { .. } => Vec::new(),
            };
        }
        self.make_room();
        self.entries.push(ArpEntry {
            ip,
            state: resolved,
            last_used_ms: now_ms,
        });
        Vec::new()
    }

    /// Park `packet` until `ip` resolves.
    pub fn queue(&mut self, ip: Ipv4Addr, packet: Vec<u8>, now_ms: u64) -> QueueOutcome {
        if let Some(idx) = self.position(ip) {
            let entry = &mut self.entries[idx];
            entry.last_used_ms = now_ms;
            return match &mut entry.state {
                ArpState::Incomplete { pending, .. } => {
                    if pending.len() >= ARP_MAX_PENDING {
                        QueueOutcome::Dropped
                    } else {
                        pending.push(packet);
                        QueueOutcome::Queued
                    }
                }
                // Raced with a reply; the caller should look up again.
                ArpState::Resolved { .. } => QueueOutcome::Dropped,
            };
        }
        self.make_room();
        let mut pending = Vec::with_capacity(ARP_MAX_PENDING);
        pending.push(packet);
        self.entries.push(ArpEntry {
            ip,
            state: ArpState::Incomplete {
                retries: 0,
                next_retry_ms: now_ms + ARP_RETRY_MS,
                pending,
            },
            last_used_ms: now_ms,
        });
        QueueOutcome::SendRequest
    }

    /// Age resolved entries and drive request retries.
    pub fn tick(&mut self, now_ms: u64) -> ArpTimerWork {
        let mut work = ArpTimerWork::default();
        self.entries.retain_mut(|entry| match &mut entry.state {
            ArpState::Resolved { confirmed_ms, .. } => {
                if now_ms.saturating_sub(*confirmed_ms) >= ARP_ENTRY_TTL_MS {
                    work.expired += 1;
                    false
                } else {
                    true
                }
            }
            ArpState::Incomplete {
                retries,
                next_retry_ms,
                ..
            } => {
                if now_ms < *next_retry_ms {
                    return true;
                }
                if *retries >= ARP_MAX_RETRIES {
                    klog_debug!("arp: no reply from {}, dropping queued packets", entry.ip);
                    work.failed += 1;
                    return false;
                }
                *retries += 1;
                *next_retry_ms = now_ms + ARP_RETRY_MS;
                work.retransmit.push(entry.ip);
                true
            }
        });
        work
    }

    fn make_room(&mut self) {
        if self.entries.len() < ARP_CACHE_SIZE {
            return;
        }
        let victim = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.last_used_ms)
            .map(|(i, _)| i);
        if let Some(idx) = victim {
            let evicted = self.entries.swap_remove(idx);
            klog_debug!("arp: evicting {:?}", evicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);
    const MAC: MacAddr = MacAddr([0x52, 0x55, 10, 0, 2, 2]);

    #[test]
    fn packet_layout_and_reply() {
        let ours = MacAddr([2, 0, 0, 0, 0, 1]);
        let req = ArpPacket::request(ours, Ipv4Addr::new(10, 0, 2, 15), HOST);
        let bytes = req.to_bytes();
        assert_eq!(&bytes[0..8], &[0, 1, 8, 0, 6, 4, 0, 1]);
        assert_eq!(ArpPacket::parse(&bytes), Some(req));

        let reply = req.reply_to(MAC);
        assert_eq!(reply.oper, ARP_OPER_REPLY);
        assert_eq!(reply.sender_ip, HOST);
        assert_eq!(reply.target_mac, ours);

        let mut bad = bytes;
        bad[1] = 6;
        assert!(ArpPacket::parse(&bad).is_none());
        assert!(ArpPacket::parse(&bytes[..27]).is_none());
    }

    #[test]
    fn queued_packets_flush_on_resolution() {
        let mut cache = ArpCache::new();
        assert_eq!(cache.lookup(HOST, 0), None);
        assert_eq!(cache.queue(HOST, vec![1], 0), QueueOutcome::SendRequest);
        for i in 2..=ARP_MAX_PENDING as u8 {
            assert_eq!(cache.queue(HOST, vec![i], 0), QueueOutcome::Queued);
        }
        assert_eq!(cache.queue(HOST, vec![9], 0), QueueOutcome::Dropped);
        assert_eq!(cache.lookup(HOST, 0), None);

        let flushed = cache.insert(HOST, MAC, 5);
        assert_eq!(flushed, vec![vec![1], vec![2], vec![3], vec![4]]);
        assert_eq!(cache.lookup(HOST, 6), Some(MAC));
        assert!(cache.insert(HOST, MAC, 7).is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn retries_then_gives_up() {
        let mut cache = ArpCache::new();
        cache.queue(HOST, vec![1], 0);
        assert!(cache.tick(ARP_RETRY_MS - 1).retransmit.is_empty());
        let mut now = 0;
        for _ in 0..ARP_MAX_RETRIES {
            now += ARP_RETRY_MS;
            assert_eq!(cache.tick(now).retransmit, vec![HOST]);
        }
        now += ARP_RETRY_MS;
        let work = cache.tick(now);
        assert_eq!(work.failed, 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn resolved_entries_age_out() {
        let mut cache = ArpCache::new();
        cache.insert(HOST, MAC, 1000);
        // Lookups do not extend the confirmation time.
        cache.lookup(HOST, ARP_ENTRY_TTL_MS);
        assert_eq!(cache.tick(ARP_ENTRY_TTL_MS + 999).expired, 0);
        assert_eq!(cache.tick(ARP_ENTRY_TTL_MS + 1000).expired, 1);
        assert_eq!(cache.lookup(HOST, ARP_ENTRY_TTL_MS + 1000), None);
    }

    #[test]
    fn full_cache_evicts_least_recently_used() {
        let mut cache = ArpCache::new();
        for i in 0..ARP_CACHE_SIZE {
            let ip = Ipv4Addr::new(10, 1, (i >> 8) as u8, i as u8);
            cache.insert(ip, MAC, i as u64 + 10);
        }
        // Touch the oldest so the second oldest becomes the victim.
        assert!(cache.lookup(Ipv4Addr::new(10, 1, 0, 0), 10_000).is_some());
        cache.insert(HOST, MAC, 10_001);
        assert_eq!(cache.len(), ARP_CACHE_SIZE);
        assert!(cache.lookup(Ipv4Addr::new(10, 1, 0, 0), 10_002).is_some());
        assert!(cache.lookup(Ipv4Addr::new(10, 1, 0, 1), 10_002).is_none());
        assert!(cache.lookup(HOST, 10_002).is_some());
    }
}
