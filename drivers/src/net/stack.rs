//! The network stack: one interface, one device, every protocol table.
//!
//! Receive runs bottom-up from [`NetStack::handle_frame`], either from the
//! NIC's receive callback or from [`NetStack::poll`]. Transmit runs
//! top-down through [`NetStack::send_ipv4`], which resolves the next hop and
//! parks packets in the ARP cache until it answers.
//!
//! Lock order: `sockets` → `tcp` → `udp` → `udp_sockets`. `arp`, `config`
//! and `ping` are leaves. No lock is held across `NetDevice::send_frame`.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU16, Ordering};
use core::time::Duration;

use kestrel_abi::net::{SOCKET_ERROR, SockAddrIn, UserNetInfo};
use kestrel_lib::cmdline::net_config_from_cmdline;
use kestrel_lib::{Clock, Deadline, IrqMutex, klog_debug, klog_info, klog_trace, klog_warn};
use spin::Once;

use super::arp::{ARP_OPER_REQUEST, ArpCache, ArpPacket, QueueOutcome};
use super::config::NetConfig;
use super::ethernet::{ETHERTYPE_ARP, ETHERTYPE_IPV4, EthHeader, build_frame, is_for_us};
use super::icmp::{ICMP_ECHO_REQUEST, IcmpEcho, PingState, build_echo, echo_reply_for, ping_payload};
use super::ipv4::{Ipv4Header, build_packet};
use super::netdev::NetDevice;
use super::socket::{SocketTable, UdpEndpoints};
use super::tcp::{TcpOutSegment, TcpTable};
use super::types::{EPHEMERAL_PORT_START, IpProtocol, Ipv4Addr, MacAddr, NetError, Port, SockAddr};
use super::udp::{UdpBindings, UdpCallback, UdpDatagram, UdpTarget, build_datagram};
use super::{IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
use crate::e1000e::{e1000e_device, e1000e_set_rx_callback};

/// Identifier carried by every echo request this host sends.
const PING_ID: u16 = 0x4b53;

pub struct NetStack<D: NetDevice> {
    dev: D,
    clock: &'static (dyn Clock + Sync),
    config: IrqMutex<NetConfig>,
    arp: IrqMutex<ArpCache>,
    pub(super) udp: IrqMutex<UdpBindings>,
    pub(super) udp_sockets: IrqMutex<UdpEndpoints>,
    pub(super) tcp: IrqMutex<TcpTable>,
    pub(super) sockets: IrqMutex<SocketTable>,
    ping: IrqMutex<PingState>,
    ip_id: AtomicU16,
    udp_port_cursor: AtomicU16,
}

impl<D: NetDevice> NetStack<D> {
    /// The MAC in `config` is replaced by the device's.
    pub fn new(dev: D, clock: &'static (dyn Clock + Sync), mut config: NetConfig) -> Self {
        config.mac = dev.mac();
        Self {
            dev,
            clock,
            config: IrqMutex::new(config),
            arp: IrqMutex::new(ArpCache::new()),
            udp: IrqMutex::new(UdpBindings::new()),
            udp_sockets: IrqMutex::new(UdpEndpoints::new()),
            tcp: IrqMutex::new(TcpTable::new()),
            sockets: IrqMutex::new(SocketTable::new()),
            ping: IrqMutex::new(PingState::new(PING_ID)),
            ip_id: AtomicU16::new(1),
            udp_port_cursor: AtomicU16::new(EPHEMERAL_PORT_START),
        }
    }

    /// Announce our address with a gratuitous ARP.
    pub fn start(&self) {
        let cfg = self.config();
        klog_info!(
            "net: interface up {} ip {}/{} gw {} dns {}",
            cfg.mac,
            cfg.ip,
            cfg.prefix_len(),
            cfg.gateway,
            cfg.dns
        );
        if cfg.ip.is_unspecified() {
            return;
        }
        if let Err(e) = self.send_arp_request(cfg.ip) {
            klog_warn!("arp: gratuitous announce failed: {}", e);
        }
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    #[inline]
    pub(super) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    // -------------------------------------------------------------------------
    // Configuration
    // -------------------------------------------------------------------------

    pub fn config(&self) -> NetConfig {
        *self.config.lock()
    }

    pub fn set_config(&self, cfg: NetConfig) {
        let mac = self.dev.mac();
        *self.config.lock() = NetConfig { mac, ..cfg };
        self.arp.lock().clear();
        klog_info!("net: reconfigured ip {}/{} gw {}", cfg.ip, cfg.prefix_len(), cfg.gateway);
    }

    pub fn user_net_info(&self) -> UserNetInfo {
        self.config()
            .user_info(self.dev.mtu(), self.dev.link_up(), true)
    }

    pub fn apply_user_net_info(&self, info: &UserNetInfo) {
        let mut cfg = self.config();
        cfg.apply_user_info(info);
        self.set_config(cfg);
    }

    // -------------------------------------------------------------------------
    // Polling and timers
    // -------------------------------------------------------------------------

    /// Drain the device and run timers. Returns frames processed.
    pub fn poll(&self) -> usize {
        let n = self.dev.poll_frames(&mut |frame| self.handle_frame(frame));
        self.tick();
        n
    }

    /// ARP retries and ageing, TCP retransmission and TIME_WAIT reaping.
    pub fn tick(&self) {
        let now = self.now_ms();
        let work = self.arp.lock().tick(now);
        for ip in work.retransmit {
            let _ = self.send_arp_request(ip);
        }
        let mut out = Vec::new();
        let freed = self.tcp.lock().tick(now, &mut out);
        if freed > 0 {
            klog_trace!("tcp: reaped {} connections", freed);
        }
        self.transmit_tcp(out);
    }

    // -------------------------------------------------------------------------
    // Receive path
    // -------------------------------------------------------------------------

    pub fn handle_frame(&self, frame: &[u8]) {
        let Some((eth, payload)) = EthHeader::parse(frame) else {
            return;
        };
        let cfg = self.config();
        if !is_for_us(eth.dst, cfg.mac) {
            return;
        }
        match eth.ethertype {
            ETHERTYPE_ARP => self.handle_arp(&cfg, payload),
            ETHERTYPE_IPV4 => self.handle_ipv4(&cfg, payload),
            other => klog_trace!("net: dropping ethertype {:#06x}", other),
        }
    }

    fn handle_arp(&self, cfg: &NetConfig, payload: &[u8]) {
        let Some(pkt) = ArpPacket::parse(payload) else {
            klog_debug!("arp: malformed packet");
            return;
        };
        if pkt.sender_ip == cfg.ip && pkt.sender_mac != cfg.mac {
            klog_warn!("arp: {} also claimed by {}", cfg.ip, pkt.sender_mac);
            return;
        }
        if !pkt.sender_ip.is_unspecified() && pkt.sender_ip != cfg.ip {
            let flushed = self.arp.lock().insert(pkt.sender_ip, pkt.sender_mac, self.now_ms());
            for packet in flushed {
                let _ = self.send_frame_to(pkt.sender_mac, ETHERTYPE_IPV4, &packet);
            }
        }
        if pkt.oper == ARP_OPER_REQUEST && pkt.target_ip == cfg.ip && !cfg.ip.is_unspecified() {
            let reply = pkt.reply_to(cfg.mac);
            let _ = self.send_frame_to(pkt.sender_mac, ETHERTYPE_ARP, &reply.to_bytes());
        }
    }

    fn handle_ipv4(&self, cfg: &NetConfig, packet: &[u8]) {
        let Some((ip, payload)) = Ipv4Header::parse(packet) else {
            klog_debug!("ipv4: dropping invalid packet");
            return;
        };
        if !cfg.accepts(ip.dst) {
            return;
        }
        match IpProtocol::from_u8(ip.protocol) {
            Some(IpProtocol::Icmp) => self.handle_icmp(cfg, &ip, payload),
            Some(IpProtocol::Udp) => self.handle_udp(&ip, payload),
            Some(IpProtocol::Tcp) if ip.dst == cfg.ip => self.handle_tcp(&ip, payload),
            _ => klog_trace!("ipv4: no handler for protocol {}", ip.protocol),
        }
    }

    fn handle_icmp(&self, cfg: &NetConfig, ip: &Ipv4Header, msg: &[u8]) {
        let Some(echo) = IcmpEcho::parse(msg) else {
            return;
        };
        if echo.is_request() {
            if ip.dst == cfg.ip {
                let _ = self.send_ipv4(ip.src, IPPROTO_ICMP, &echo_reply_for(&echo));
            }
        } else {
            let now = self.clock.now_us();
            if !self.ping.lock().on_reply(echo.id, echo.seq, now) {
                klog_trace!("icmp: unmatched echo reply from {} seq {}", ip.src, echo.seq);
            }
        }
    }

    fn handle_udp(&self, ip: &Ipv4Header, seg: &[u8]) {
        let Some(dg) = UdpDatagram::parse(ip.src, ip.dst, seg) else {
            klog_debug!("udp: dropping bad datagram from {}", ip.src);
            return;
        };
        let target = self.udp.lock().lookup(dg.dst_port);
        match target {
            Some(UdpTarget::Callback(cb)) => cb(ip.src, dg.src_port, dg.dst_port, dg.payload),
            Some(UdpTarget::Socket(h)) => {
                let queued = self
                    .udp_sockets
                    .lock()
                    .deliver(h, ip.src, dg.src_port, dg.payload);
                if !queued {
                    klog_debug!("udp: port {} receive queue full, dropping", dg.dst_port);
                }
            }
            None => klog_trace!("udp: nothing bound to port {}", dg.dst_port),
        }
    }

    fn handle_tcp(&self, ip: &Ipv4Header, seg: &[u8]) {
        let mut out = Vec::new();
        self.tcp
            .lock()
            .input(ip.src, ip.dst, seg, self.now_ms(), &mut out);
        self.transmit_tcp(out);
    }

    // -------------------------------------------------------------------------
    // Transmit path
    // -------------------------------------------------------------------------

    fn send_frame_to(&self, dst: MacAddr, ethertype: u16, payload: &[u8]) -> Result<(), NetError> {
        let frame = build_frame(dst, self.dev.mac(), ethertype, payload);
        self.dev.send_frame(&frame)
    }

    /// Broadcast a who-has for `target`.
    pub fn send_arp_request(&self, target: Ipv4Addr) -> Result<(), NetError> {
        let cfg = self.config();
        let req = ArpPacket::request(cfg.mac, cfg.ip, target);
        self.send_frame_to(MacAddr::BROADCAST, ETHERTYPE_ARP, &req.to_bytes())
    }

    /// Route, resolve and transmit one IPv4 packet. A packet waiting on ARP
    /// counts as sent.
    pub fn send_ipv4(&self, dst: Ipv4Addr, protocol: u8, payload: &[u8]) -> Result<(), NetError> {
        let cfg = self.config();
        let id = self.ip_id.fetch_add(1, Ordering::Relaxed);
        let packet = build_packet(cfg.ip, dst, protocol, id, payload);
        if dst.is_broadcast() || dst == cfg.broadcast() {
            return self.send_frame_to(MacAddr::BROADCAST, ETHERTYPE_IPV4, &packet);
        }

        let hop = cfg.next_hop(dst);
        let now = self.now_ms();
        let mut arp = self.arp.lock();
        if let Some(mac) = arp.lookup(hop, now) {
            drop(arp);
            return self.send_frame_to(mac, ETHERTYPE_IPV4, &packet);
        }
        let outcome = arp.queue(hop, packet, now);
        drop(arp);
        match outcome {
            QueueOutcome::SendRequest => self.send_arp_request(hop),
            QueueOutcome::Queued => Ok(()),
            QueueOutcome::Dropped => {
                klog_debug!("arp: pending queue for {} full, dropping", hop);
                Err(NetError::NoBufferSpace)
            }
        }
    }

    /// Connections still holding a TCP slot, listeners and TIME_WAIT included.
    pub fn tcp_connection_count(&self) -> usize {
        self.tcp.lock().active_count()
    }

    pub(super) fn transmit_tcp(&self, out: Vec<TcpOutSegment>) {
        for seg in out {
            if let Err(e) = self.send_ipv4(seg.tuple.remote_ip, IPPROTO_TCP, &seg.to_bytes()) {
                klog_debug!("tcp: transmit to {} failed: {}", seg.tuple.remote_ip, e);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Kernel UDP and ICMP
    // -------------------------------------------------------------------------

    pub fn udp_bind(&self, port: u16, callback: UdpCallback) -> Result<(), NetError> {
        self.udp.lock().bind(port, UdpTarget::Callback(callback))
    }

    pub fn udp_unbind(&self, port: u16) -> bool {
        self.udp.lock().unbind(port)
    }

    pub fn udp_send(
        &self,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        data: &[u8],
    ) -> Result<(), NetError> {
        let src = self.config().ip;
        let seg = build_datagram(src, dst, src_port, dst_port, data)?;
        self.send_ipv4(dst, IPPROTO_UDP, &seg)
    }

    /// Echo `dst` and wait for the reply, polling the device meanwhile.
    pub fn ping(&self, dst: Ipv4Addr, timeout: Duration) -> Result<Duration, NetError> {
        let (id, seq) = {
            let mut ping = self.ping.lock();
            let seq = ping.begin(self.clock.now_us());
            (ping.id, seq)
        };
        let msg = build_echo(ICMP_ECHO_REQUEST, id, seq, &ping_payload());
        if let Err(e) = self.send_ipv4(dst, IPPROTO_ICMP, &msg) {
            self.ping.lock().cancel();
            return Err(e);
        }
        let deadline = Deadline::after(self.clock, timeout);
        let rtt = deadline.spin_until(self.clock, || {
            self.poll();
            self.ping.lock().take_rtt()
        });
        match rtt {
            Ok(us) => {
                klog_debug!("icmp: reply from {} seq {} in {}us", dst, seq, us);
                Ok(Duration::from_micros(us))
            }
            Err(_) => {
                self.ping.lock().cancel();
                Err(NetError::TimedOut)
            }
        }
    }

    pub(super) fn next_udp_port(&self) -> u16 {
        let step = |p: u16| Some(if p == u16::MAX { EPHEMERAL_PORT_START } else { p + 1 });
        match self
            .udp_port_cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, step)
        {
            Ok(p) | Err(p) => p,
        }
    }
}

// =============================================================================
// Kernel singleton
// =============================================================================

pub type KernelNetStack = NetStack<&'static dyn NetDevice>;

static NET: Once<KernelNetStack> = Once::new();

fn net_rx(frame: &[u8]) {
    if let Some(net) = NET.get() {
        net.handle_frame(frame);
    }
}

/// Bring the stack up on the initialised NIC. Networking stays off when
/// there is no NIC or the command line disables it.
pub fn net_init(
    cmdline: Option<&str>,
    clock: &'static (dyn Clock + Sync),
) -> Result<&'static KernelNetStack, NetError> {
    if let Some(net) = NET.get() {
        return Ok(net);
    }
    let boot = net_config_from_cmdline(cmdline);
    if !boot.enabled {
        klog_info!("net: disabled on command line");
        return Err(NetError::DeviceNotReady);
    }
    let Some(nic) = e1000e_device() else {
        klog_info!("net: no NIC initialized, skipping network stack");
        return Err(NetError::DeviceNotReady);
    };
    let dev: &'static dyn NetDevice = nic;
    let config = NetConfig::from_boot(&boot, dev.mac());
    let net = NET.call_once(|| NetStack::new(dev, clock, config));
    e1000e_set_rx_callback(net_rx);
    net.start();
    Ok(net)
}

pub fn net_stack() -> Option<&'static KernelNetStack> {
    NET.get()
}

pub fn net_poll() -> usize {
    NET.get().map_or(0, |n| n.poll())
}

pub fn net_ping(dst: Ipv4Addr, timeout: Duration) -> Result<Duration, NetError> {
    NET.get().ok_or(NetError::DeviceNotReady)?.ping(dst, timeout)
}

pub fn net_get_info() -> Option<UserNetInfo> {
    NET.get().map(|n| n.user_net_info())
}

pub fn net_set_info(info: &UserNetInfo) -> bool {
    NET.get().map(|n| n.apply_user_net_info(info)).is_some()
}

// Socket syscalls. -1 when the stack is down.

pub fn socket_create(sock_type: u16, pid: u32) -> i32 {
    NET.get().map_or(SOCKET_ERROR, |n| n.socket_create(sock_type, pid))
}

pub fn socket_connect(fd: i32, ip: Ipv4Addr, port: u16, pid: u32) -> i32 {
    NET.get()
        .map_or(SOCKET_ERROR, |n| n.socket_connect(fd, ip, port, pid))
}

pub fn socket_bind(fd: i32, port: u16, pid: u32) -> i32 {
    NET.get().map_or(SOCKET_ERROR, |n| n.socket_bind(fd, port, pid))
}

pub fn socket_listen(fd: i32, pid: u32) -> i32 {
    NET.get().map_or(SOCKET_ERROR, |n| n.socket_listen(fd, pid))
}

pub fn socket_accept(fd: i32, pid: u32) -> i32 {
    NET.get().map_or(SOCKET_ERROR, |n| n.socket_accept(fd, pid))
}

pub fn socket_send(fd: i32, data: &[u8], pid: u32) -> i32 {
    NET.get().map_or(SOCKET_ERROR, |n| n.socket_send(fd, data, pid))
}

pub fn socket_recv(fd: i32, buf: &mut [u8], pid: u32) -> i32 {
    NET.get().map_or(SOCKET_ERROR, |n| n.socket_recv(fd, buf, pid))
}

pub fn socket_sendto(fd: i32, data: &[u8], ip: Ipv4Addr, port: u16, pid: u32) -> i32 {
    NET.get()
        .map_or(SOCKET_ERROR, |n| n.socket_sendto(fd, data, ip, port, pid))
}

/// Bytes received plus the sender, or -1.
pub fn socket_recvfrom(fd: i32, buf: &mut [u8], pid: u32) -> (i32, Ipv4Addr, u16) {
    match NET.get().map(|n| n.socket_recvfrom(fd, buf, pid)) {
        Some(Ok(r)) => (r.len as i32, r.src_ip, r.src_port),
        _ => (SOCKET_ERROR, Ipv4Addr::UNSPECIFIED, 0),
    }
}

/// `connect` with a userland `sockaddr_in`.
pub fn socket_connect_user(fd: i32, addr: &SockAddrIn, pid: u32) -> i32 {
    match SockAddr::from_user(addr) {
        Ok(sa) => socket_connect(fd, sa.ip, sa.port.as_u16(), pid),
        Err(_) => SOCKET_ERROR,
    }
}

/// `sendto` with a userland `sockaddr_in`.
pub fn socket_sendto_user(fd: i32, data: &[u8], addr: &SockAddrIn, pid: u32) -> i32 {
    match SockAddr::from_user(addr) {
        Ok(sa) => socket_sendto(fd, data, sa.ip, sa.port.as_u16(), pid),
        Err(_) => SOCKET_ERROR,
    }
}

/// `recvfrom` filling a userland `sockaddr_in` with the sender.
pub fn socket_recvfrom_user(fd: i32, buf: &mut [u8], from: &mut SockAddrIn, pid: u32) -> i32 {
    let (n, ip, port) = socket_recvfrom(fd, buf, pid);
    if n >= 0 {
        *from = SockAddr::new(ip, Port::new(port)).to_user();
    }
    n
}

pub fn socket_close(fd: i32, pid: u32) -> i32 {
    NET.get().map_or(SOCKET_ERROR, |n| n.socket_close(fd, pid))
}

pub fn socket_cleanup_process(pid: u32) {
    if let Some(n) = NET.get() {
        n.socket_cleanup_process(pid);
    }
}
