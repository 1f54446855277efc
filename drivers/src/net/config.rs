//! Interface IPv4 configuration.
//!
//! One interface, statically configured. Defaults match QEMU user-mode
//! networking; the kernel command line can override every field
//! (see [`kestrel_lib::cmdline`]).

use core::fmt;

use kestrel_abi::net::UserNetInfo;
use kestrel_lib::cmdline::{NetBootConfig, net_config_from_cmdline};

use super::types::{Ipv4Addr, MacAddr};

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct NetConfig {
    pub ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns: Ipv4Addr,
    pub mac: MacAddr,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self::from_boot(&NetBootConfig::default(), MacAddr::ZERO)
    }
}

impl NetConfig {
    pub fn from_boot(boot: &NetBootConfig, mac: MacAddr) -> Self {
        Self {
            ip: Ipv4Addr(boot.ip),
            netmask: Ipv4Addr(boot.netmask),
            gateway: Ipv4Addr(boot.gateway),
            dns: Ipv4Addr(boot.dns),
            mac,
        }
    }

    pub fn from_cmdline(cmdline: Option<&str>, mac: MacAddr) -> Self {
        Self::from_boot(&net_config_from_cmdline(cmdline), mac)
    }

    /// `ip | !netmask`
    #[inline]
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from_u32_be(self.ip.to_u32_be() | !self.netmask.to_u32_be())
    }

    /// Whether `ip` is on the directly attached subnet.
    #[inline]
    pub fn is_local(&self, ip: Ipv4Addr) -> bool {
        ip.in_subnet(self.ip, self.netmask)
    }

    #[inline]
    pub fn prefix_len(&self) -> u8 {
        self.netmask.to_u32_be().leading_ones() as u8
    }

    /// Destinations we accept: our address, the limited broadcast and the
    /// subnet broadcast.
    pub fn accepts(&self, dst: Ipv4Addr) -> bool {
        dst == self.ip || dst.is_broadcast() || dst == self.broadcast()
    }

    /// Next hop for `dst`: itself when on-link, otherwise the gateway.
    pub fn next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        if self.is_local(dst) || self.gateway.is_unspecified() {
            dst
        } else {
            self.gateway
        }
    }

    pub fn user_info(&self, mtu: u16, link_up: bool, nic_ready: bool) -> UserNetInfo {
        UserNetInfo {
            ipv4: self.ip.0,
            subnet_mask: self.netmask.0,
            gateway: self.gateway.0,
            dns: self.dns.0,
            mac: self.mac.0,
            mtu,
            link_up: link_up as u8,
            nic_ready: nic_ready as u8,
            _pad: [0; 2],
        }
    }

    /// Apply the address fields of a userland snapshot (ifconfig). The MAC
    /// belongs to the NIC and is left alone.
    pub fn apply_user_info(&mut self, info: &UserNetInfo) {
        self.ip = Ipv4Addr(info.ipv4);
        self.netmask = Ipv4Addr(info.subnet_mask);
        self.gateway = Ipv4Addr(info.gateway);
        self.dns = Ipv4Addr(info.dns);
    }
}

impl fmt::Debug for NetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for NetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} gw {} dns {} mac {}",
            self.ip,
            self.prefix_len(),
            self.gateway,
            self.dns,
            self.mac
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn defaults_are_qemu_user_net() {
        let cfg = NetConfig::default();
        assert_eq!(cfg.ip, Ipv4Addr::new(10, 0, 2, 15));
        assert_eq!(cfg.gateway, Ipv4Addr::new(10, 0, 2, 2));
        assert_eq!(cfg.dns, Ipv4Addr::new(10, 0, 2, 3));
        assert_eq!(cfg.prefix_len(), 24);
        assert_eq!(cfg.broadcast(), Ipv4Addr::new(10, 0, 2, 255));
        assert_eq!(format!("{}", cfg), "10.0.2.15/24 gw 10.0.2.2 dns 10.0.2.3 mac 00:00:00:00:00:00");
    }

    #[test]
    fn routing_and_acceptance() {
        let cfg = NetConfig::from_cmdline(Some("net.ip=192.168.7.9 net.mask=255.255.0.0"), MacAddr::ZERO);
        assert!(cfg.is_local(Ipv4Addr::new(192, 168, 200, 1)));
        assert_eq!(cfg.next_hop(Ipv4Addr::new(192, 168, 1, 1)), Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(cfg.next_hop(Ipv4Addr::new(8, 8, 8, 8)), cfg.gateway);
        assert!(cfg.accepts(Ipv4Addr::new(192, 168, 255, 255)));
        assert!(cfg.accepts(Ipv4Addr::BROADCAST));
        assert!(!cfg.accepts(Ipv4Addr::new(192, 168, 7, 10)));
    }

    #[test]
    fn user_info_roundtrip_keeps_mac() {
        let mac = MacAddr([2, 0, 0, 0, 0, 1]);
        let mut cfg = NetConfig::from_cmdline(None, mac);
        let mut info = cfg.user_info(1500, true, true);
        assert_eq!(info.mac, mac.0);
        assert_eq!(info.link_up, 1);
        info.ipv4 = [10, 0, 2, 20];
        info.mac = [0; 6];
        cfg.apply_user_info(&info);
        assert_eq!(cfg.ip, Ipv4Addr::new(10, 0, 2, 20));
        assert_eq!(cfg.mac, mac);
    }
}
