//! Network stack tests below the socket layer.
//!
//! Covers:
//! - gratuitous ARP at start, ARP replies, off-link routing via the gateway
//! - packets parked on ARP and flushed on resolution
//! - kernel UDP bindings with callbacks, unbind
//! - ICMP echo replies, ping RTT and timeout
//! - frame filtering by destination MAC and IPv4 validity
//! - runtime reconfiguration through `UserNetInfo`

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;

use kestrel_lib::{IrqMutex, SteppingClock};

use crate::net::arp::{ARP_OPER_REPLY, ARP_OPER_REQUEST, ArpPacket};
use crate::net::ethernet::{ETHERTYPE_ARP, ETHERTYPE_IPV4, EthHeader, build_frame};
use crate::net::icmp::{ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, IcmpEcho, build_echo, echo_reply_for};
use crate::net::ipv4::{Ipv4Header, build_packet};
use crate::net::netdev::{NetDevice, NetDeviceStats};
use crate::net::stack::NetStack;
use crate::net::types::{Ipv4Addr, MacAddr, NetError};
use crate::net::udp::build_datagram;
use crate::net::{IPPROTO_ICMP, IPPROTO_UDP, internet_checksum};
use crate::socket_tests::{host_config, two_hosts};

const IP_A: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);
const IP_B: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 20);
const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 2);

fn parse_arp(frame: &[u8]) -> ArpPacket {
    let (eth, payload) = EthHeader::parse(frame).expect("ethernet");
    assert_eq!(eth.ethertype, ETHERTYPE_ARP);
    ArpPacket::parse(payload).expect("arp")
}

// =============================================================================
// ARP
// =============================================================================

#[test]
fn start_announces_with_gratuitous_arp() {
    let h = two_hosts();
    h.a.start();
    let frames = h.b.device().drain_inbound();
    assert_eq!(frames.len(), 1);
    let (eth, _) = EthHeader::parse(&frames[0]).expect("ethernet");
    assert_eq!(eth.dst, MacAddr::BROADCAST);
    let arp = parse_arp(&frames[0]);
    assert_eq!(arp.oper, ARP_OPER_REQUEST);
    assert_eq!((arp.sender_ip, arp.target_ip), (IP_A, IP_A));
    assert_eq!(arp.sender_mac, h.a.device().mac());
}

#[test]
fn arp_request_for_us_is_answered() {
    let h = two_hosts();
    h.a.send_arp_request(IP_B).expect("send");
    assert_eq!(h.b.poll(), 1);
    let frames = h.a.device().drain_inbound();
    assert_eq!(frames.len(), 1);
    let reply = parse_arp(&frames[0]);
    assert_eq!(reply.oper, ARP_OPER_REPLY);
    assert_eq!((reply.sender_ip, reply.sender_mac), (IP_B, h.b.device().mac()));
    assert_eq!((reply.target_ip, reply.target_mac), (IP_A, h.a.device().mac()));

    // Requests for someone else are not answered.
    h.a.send_arp_request(Ipv4Addr::new(10, 0, 2, 99)).expect("send");
    h.b.poll();
    assert_eq!(h.a.device().inbound_len(), 0);
}

#[test]
fn off_link_destination_resolves_the_gateway() {
    let h = two_hosts();
    h.a.udp_send(Ipv4Addr::new(8, 8, 8, 8), 4000, 53, b"q")
        .expect("parked");
    let frames = h.b.device().drain_inbound();
    assert_eq!(frames.len(), 1, "only the ARP request goes out");
    assert_eq!(parse_arp(&frames[0]).target_ip, GATEWAY);
}

static PARKED_HITS: AtomicUsize = AtomicUsize::new(0);

fn count_parked(src: Ipv4Addr, _src_port: u16, dst_port: u16, data: &[u8]) {
    assert_eq!((src, dst_port), (IP_A, 7001));
    assert!(data.starts_with(b"parked"));
    PARKED_HITS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn packets_wait_for_resolution_then_flush_in_order() {
    let h = two_hosts();
    h.b.udp_bind(7001, count_parked).expect("bind");
    h.a.udp_send(IP_B, 1000, 7001, b"parked 1").expect("queued");
    h.a.udp_send(IP_B, 1000, 7001, b"parked 2").expect("queued");
    assert_eq!(h.b.device().inbound_len(), 1, "one ARP request for both");
    h.pump();
    assert_eq!(PARKED_HITS.load(Ordering::SeqCst), 2);

    // Resolved now: the next datagram goes straight out.
    h.a.udp_send(IP_B, 1000, 7001, b"parked 3").expect("sent");
    let frames = h.b.device().drain_inbound();
    assert_eq!(frames.len(), 1);
    assert_eq!(EthHeader::parse(&frames[0]).expect("eth").0.ethertype, ETHERTYPE_IPV4);
}

#[test]
fn unanswered_arp_is_retried_then_dropped() {
    let h = two_hosts();
    let ghost = Ipv4Addr::new(10, 0, 2, 77);
    h.a.udp_send(ghost, 1000, 9, b"x").expect("parked");
    let mut requests = h.b.device().drain_inbound().len();
    for _ in 0..5 {
        h.clock.advance(Duration::from_millis(1_100));
        h.a.tick();
        requests += h.b.device().drain_inbound().len();
    }
    assert_eq!(requests, 4, "initial request plus three retries");
}

// =============================================================================
// UDP
// =============================================================================

static UNBOUND_HITS: AtomicUsize = AtomicUsize::new(0);

fn count_unbound(_: Ipv4Addr, _: u16, _: u16, _: &[u8]) {
    UNBOUND_HITS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn udp_unbind_stops_delivery() {
    let h = two_hosts();
    h.b.udp_bind(7002, count_unbound).expect("bind");
    assert_eq!(h.b.udp_bind(7002, count_unbound), Err(NetError::AddressInUse));
    h.a.udp_send(IP_B, 1, 7002, b"one").expect("send");
    h.pump();
    assert!(h.b.udp_unbind(7002));
    h.a.udp_send(IP_B, 1, 7002, b"two").expect("send");
    h.pump();
    assert_eq!(UNBOUND_HITS.load(Ordering::SeqCst), 1);
    assert!(!h.b.udp_unbind(7002));
}

static FILTER_HITS: AtomicUsize = AtomicUsize::new(0);

fn count_filtered(_: Ipv4Addr, _: u16, _: u16, _: &[u8]) {
    FILTER_HITS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn frames_for_other_stations_and_bad_packets_are_dropped() {
    let h = two_hosts();
    h.b.udp_bind(7003, count_filtered).expect("bind");
    let dg = build_datagram(IP_A, IP_B, 1, 7003, b"data").expect("datagram");
    let good = build_packet(IP_A, IP_B, IPPROTO_UDP, 1, &dg);
    let mac_a = h.a.device().mac();
    let mac_b = h.b.device().mac();

    let stranger = MacAddr([0x02, 0, 0, 0, 0, 0x99]);
    h.b.handle_frame(&build_frame(stranger, mac_a, ETHERTYPE_IPV4, &good));

    let mut bad_sum = good.clone();
    bad_sum[10] ^= 0xff;
    h.b.handle_frame(&build_frame(mac_b, mac_a, ETHERTYPE_IPV4, &bad_sum));

    let mut fragment = good.clone();
    fragment[6] = 0x20; // MF
    fragment[10..12].copy_from_slice(&[0, 0]);
    let sum = internet_checksum(&fragment[..20]);
    fragment[10..12].copy_from_slice(&sum.to_be_bytes());
    h.b.handle_frame(&build_frame(mac_b, mac_a, ETHERTYPE_IPV4, &fragment));

    let other_host = build_packet(IP_A, Ipv4Addr::new(10, 0, 2, 21), IPPROTO_UDP, 1, &dg);
    h.b.handle_frame(&build_frame(mac_b, mac_a, ETHERTYPE_IPV4, &other_host));

    h.b.handle_frame(&[0u8; 10]);
    assert_eq!(FILTER_HITS.load(Ordering::SeqCst), 0);

    h.b.handle_frame(&build_frame(mac_b, mac_a, ETHERTYPE_IPV4, &good));
    assert_eq!(FILTER_HITS.load(Ordering::SeqCst), 1);
}

// =============================================================================
// ICMP
// =============================================================================

#[test]
fn echo_request_is_answered_with_same_id_and_data() {
    let h = two_hosts();
    let req = build_echo(ICMP_ECHO_REQUEST, 0x77, 3, b"payload");
    h.a.send_ipv4(IP_B, IPPROTO_ICMP, &req).expect("parked");
    h.b.poll(); // ARP request -> reply
    h.a.poll(); // ARP reply -> echo request flushed
    h.b.poll(); // echo request -> echo reply

    let frames = h.a.device().drain_inbound();
    assert_eq!(frames.len(), 1);
    let (eth, packet) = EthHeader::parse(&frames[0]).expect("eth");
    assert_eq!(eth.ethertype, ETHERTYPE_IPV4);
    let (ip, body) = Ipv4Header::parse(packet).expect("ipv4");
    assert_eq!((ip.src, ip.dst, ip.protocol), (IP_B, IP_A, IPPROTO_ICMP));
    let echo = IcmpEcho::parse(body).expect("icmp");
    assert_eq!(echo.icmp_type, ICMP_ECHO_REPLY);
    assert_eq!((echo.id, echo.seq), (0x77, 3));
    assert_eq!(echo.payload, b"payload");
}

/// Stands in for a remote host: answers ARP for `peer_ip` and echo requests
/// sent to it, queueing the replies for the next poll.
struct Responder {
    mac: MacAddr,
    peer_ip: Ipv4Addr,
    peer_mac: MacAddr,
    inbox: IrqMutex<VecDeque<Vec<u8>>>,
}

impl Responder {
    fn new(peer_ip: Ipv4Addr) -> Self {
        Self {
            mac: MacAddr([0x52, 0x54, 0, 0, 0, 1]),
            peer_ip,
            peer_mac: MacAddr([0x52, 0x54, 0, 0, 0, 2]),
            inbox: IrqMutex::new(VecDeque::new()),
        }
    }

    fn answer(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let (eth, payload) = EthHeader::parse(frame)?;
        match eth.ethertype {
            ETHERTYPE_ARP => {
                let req = ArpPacket::parse(payload)?;
                if req.oper != ARP_OPER_REQUEST || req.target_ip != self.peer_ip {
                    return None;
                }
                let reply = req.reply_to(self.peer_mac);
                Some(build_frame(eth.src, self.peer_mac, ETHERTYPE_ARP, &reply.to_bytes()))
            }
            ETHERTYPE_IPV4 => {
                let (ip, body) = Ipv4Header::parse(payload)?;
                if ip.protocol != IPPROTO_ICMP || ip.dst != self.peer_ip {
                    return None;
                }
                let echo = IcmpEcho::parse(body)?;
                if !echo.is_request() {
                    return None;
                }
                let packet = build_packet(self.peer_ip, ip.src, IPPROTO_ICMP, 1, &echo_reply_for(&echo));
                Some(build_frame(eth.src, self.peer_mac, ETHERTYPE_IPV4, &packet))
            }
            _ => None,
        }
    }
}

impl NetDevice for Responder {
    fn send_frame(&self, frame: &[u8]) -> Result<(), NetError> {
        if let Some(reply) = self.answer(frame) {
            self.inbox.lock().push_back(reply);
        }
        Ok(())
    }

    fn poll_frames(&self, sink: &mut dyn FnMut(&[u8])) -> usize {
        let mut n = 0;
        loop {
            let next = self.inbox.lock().pop_front();
            let Some(frame) = next else {
                return n;
            };
            sink(&frame);
            n += 1;
        }
    }

    fn mac(&self) -> MacAddr {
        self.mac
    }

    fn link_up(&self) -> bool {
        true
    }

    fn stats(&self) -> NetDeviceStats {
        NetDeviceStats::default()
    }
}

fn responder_stack(peer: Ipv4Addr) -> NetStack<Responder> {
    let clock: &'static SteppingClock = Box::leak(Box::new(SteppingClock::new(50)));
    NetStack::new(Responder::new(peer), clock, host_config(IP_A))
}

#[test]
fn ping_measures_round_trip() {
    let net = responder_stack(GATEWAY);
    let rtt = net
        .ping(GATEWAY, Duration::from_secs(1))
        .expect("reply");
    assert!(rtt > Duration::ZERO);
    assert!(rtt < Duration::from_secs(1));

    // A second ping uses a fresh sequence number and still matches.
    assert!(net.ping(GATEWAY, Duration::from_secs(1)).is_ok());
}

#[test]
fn ping_without_reply_times_out() {
    let net = responder_stack(GATEWAY);
    let silent = Ipv4Addr::new(10, 0, 2, 99);
    assert_eq!(
        net.ping(silent, Duration::from_millis(20)),
        Err(NetError::TimedOut)
    );
    // A late match cannot leak into the next ping.
    assert!(net.ping(GATEWAY, Duration::from_secs(1)).is_ok());
}

// =============================================================================
// Configuration
// =============================================================================

#[test]
fn user_net_info_snapshot_and_update() {
    let h = two_hosts();
    let info = h.a.user_net_info();
    assert_eq!(info.ipv4, IP_A.0);
    assert_eq!(info.subnet_mask, [255, 255, 255, 0]);
    assert_eq!(info.gateway, GATEWAY.0);
    assert_eq!(info.mac, h.a.device().mac().0);
    assert_eq!(info.mtu, 1500);
    assert_eq!((info.link_up, info.nic_ready), (1, 1));

    let mut update = info;
    update.ipv4 = [192, 168, 1, 10];
    update.gateway = [192, 168, 1, 1];
    update.mac = [0; 6];
    h.a.apply_user_net_info(&update);

    let cfg = h.a.config();
    assert_eq!(cfg.ip, Ipv4Addr::new(192, 168, 1, 10));
    assert_eq!(cfg.gateway, Ipv4Addr::new(192, 168, 1, 1));
    assert_eq!(cfg.mac, h.a.device().mac(), "MAC belongs to the NIC");
    assert_eq!(cfg.prefix_len(), 24);
}
