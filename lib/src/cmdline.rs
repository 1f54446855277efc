//! Kernel command-line options for the network stack.
//!
//! Recognised tokens (anything else is ignored):
//!
//! | token              | effect                                   |
//! |--------------------|------------------------------------------|
//! | `net=off`          | skip NIC and stack bring-up              |
//! | `net.ip=A.B.C.D`   | interface address                        |
//! | `net.mask=A.B.C.D` | netmask                                  |
//! | `net.gw=A.B.C.D`   | default gateway                          |
//! | `net.dns=A.B.C.D`  | DNS server                               |
//! | `net.poll=on`      | force polling even when MSI/IRQ works    |
//! | `klog=LEVEL`       | initial log level                        |

use crate::klog::KlogLevel;

/// QEMU user-mode networking defaults.
const DEFAULT_IP: [u8; 4] = [10, 0, 2, 15];
const DEFAULT_MASK: [u8; 4] = [255, 255, 255, 0];
const DEFAULT_GATEWAY: [u8; 4] = [10, 0, 2, 2];
const DEFAULT_DNS: [u8; 4] = [10, 0, 2, 3];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NetBootConfig {
    pub enabled: bool,
    pub ip: [u8; 4],
    pub netmask: [u8; 4],
    pub gateway: [u8; 4],
    pub dns: [u8; 4],
    pub force_polling: bool,
    pub log_level: Option<KlogLevel>,
}

impl Default for NetBootConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ip: DEFAULT_IP,
            netmask: DEFAULT_MASK,
            gateway: DEFAULT_GATEWAY,
            dns: DEFAULT_DNS,
            force_polling: false,
            log_level: None,
        }
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("on")
        || value.eq_ignore_ascii_case("true")
        || value.eq_ignore_ascii_case("yes")
        || value == "1"
    {
        Some(true)
    } else if value.eq_ignore_ascii_case("off")
        || value.eq_ignore_ascii_case("false")
        || value.eq_ignore_ascii_case("no")
        || value == "0"
    {
        Some(false)
    } else {
        None
    }
}

/// Parse dotted-quad notation.  Rejects empty octets, values above 255, and
/// anything other than exactly four octets.
pub fn parse_ipv4(s: &str) -> Option<[u8; 4]> {
    let mut out = [0u8; 4];
    let mut parts = s.split('.');
    for slot in out.iter_mut() {
        let part = parts.next()?;
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        *slot = part.parse::<u8>().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

pub fn net_config_from_cmdline(cmdline: Option<&str>) -> NetBootConfig {
    let mut cfg = NetBootConfig::default();
    let Some(cmdline) = cmdline else {
        return cfg;
    };

    for token in cmdline.split_whitespace() {
        if let Some(value) = token.strip_prefix("net=") {
            if let Some(enabled) = parse_bool(value) {
                cfg.enabled = enabled;
            }
        } else if let Some(value) = token.strip_prefix("net.ip=") {
            if let Some(ip) = parse_ipv4(value) {
                cfg.ip = ip;
            }
        } else if let Some(value) = token.strip_prefix("net.mask=") {
            if let Some(mask) = parse_ipv4(value) {
                cfg.netmask = mask;
            }
        } else if let Some(value) = token.strip_prefix("net.gw=") {
            if let Some(gw) = parse_ipv4(value) {
                cfg.gateway = gw;
            }
        } else if let Some(value) = token.strip_prefix("net.dns=") {
            if let Some(dns) = parse_ipv4(value) {
                cfg.dns = dns;
            }
        } else if let Some(value) = token.strip_prefix("net.poll=") {
            if let Some(poll) = parse_bool(value) {
                cfg.force_polling = poll;
            }
        } else if let Some(value) = token.strip_prefix("klog=") {
            cfg.log_level = KlogLevel::from_name(value);
        }
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_cmdline() {
        let cfg = net_config_from_cmdline(None);
        assert!(cfg.enabled);
        assert_eq!(cfg.ip, [10, 0, 2, 15]);
        assert_eq!(cfg.gateway, [10, 0, 2, 2]);
    }

    #[test]
    fn overrides_and_ignores_garbage() {
        let cfg = net_config_from_cmdline(Some(
            "quiet net.ip=192.168.1.50 net.mask=255.255.0.0 net.gw=192.168.1.256 net.poll=yes klog=debug",
        ));
        assert_eq!(cfg.ip, [192, 168, 1, 50]);
        assert_eq!(cfg.netmask, [255, 255, 0, 0]);
        assert_eq!(cfg.gateway, [10, 0, 2, 2]);
        assert!(cfg.force_polling);
        assert_eq!(cfg.log_level, Some(KlogLevel::Debug));
    }

    #[test]
    fn net_off_disables_stack() {
        assert!(!net_config_from_cmdline(Some("net=off")).enabled);
    }

    #[test]
    fn ipv4_parser_edge_cases() {
        assert_eq!(parse_ipv4("1.2.3.4"), Some([1, 2, 3, 4]));
        assert_eq!(parse_ipv4("1.2.3"), None);
        assert_eq!(parse_ipv4("1.2.3.4.5"), None);
        assert_eq!(parse_ipv4("1..3.4"), None);
        assert_eq!(parse_ipv4("1.2.3.-4"), None);
    }
}
