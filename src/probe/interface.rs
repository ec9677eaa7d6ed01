//! Local interface and source address selection
//!
//! Raw probes carry a hand-built IPv4 header, so the source address has to be
//! chosen up front instead of being left to the kernel.

use anyhow::{Result, anyhow};
use pnet::datalink;
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4, UdpSocket};

/// Interface name prefixes of container and overlay networks
const CONTAINER_PREFIXES: &[&str] = &["docker", "br-", "veth", "tunl", "flannel", "cni"];

/// Validated interface information
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    /// Interface name (e.g., "eth0", "wlan0")
    pub name: String,
    /// First usable IPv4 address on the interface
    pub ipv4: Ipv4Addr,
}

/// Where probes originate from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub ip: Ipv4Addr,
    /// Interface owning `ip`, when it could be determined
    pub interface: Option<String>,
}

/// Snapshot of one host interface used by the selection heuristic
#[derive(Debug, Clone)]
pub struct Candidate {
    pub name: String,
    pub up: bool,
    pub loopback: bool,
    pub addrs: Vec<Ipv4Addr>,
}

impl From<&datalink::NetworkInterface> for Candidate {
    fn from(iface: &datalink::NetworkInterface) -> Self {
        Self {
            name: iface.name.clone(),
            up: iface.is_up(),
            loopback: iface.is_loopback(),
            addrs: iface
                .ips
                .iter()
                .filter_map(|net| match net.ip() {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .collect(),
        }
    }
}

/// True for docker, bridge, veth and overlay interface names
pub fn is_container_interface(name: &str) -> bool {
    CONTAINER_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// Unicast address that is neither loopback, link-local, nor a special range
pub fn is_global_unicast(ip: Ipv4Addr) -> bool {
    !(ip.is_unspecified()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast())
}

/// First interface that is up, not loopback, not a container bridge, and has
/// a global unicast IPv4 address
pub fn pick_candidate(candidates: &[Candidate]) -> Option<Source> {
    candidates
        .iter()
        .filter(|c| c.up && !c.loopback && !is_container_interface(&c.name))
        .find_map(|c| {
            c.addrs
                .iter()
                .copied()
                .find(|ip| is_global_unicast(*ip))
                .map(|ip| Source {
                    ip,
                    interface: Some(c.name.clone()),
                })
        })
}

/// Validate that an interface exists and carries an IPv4 address
pub fn validate_interface(name: &str) -> Result<InterfaceInfo> {
    let interfaces = datalink::interfaces();

    if let Some(iface) = interfaces.iter().find(|i| i.name == name) {
        let candidate = Candidate::from(iface);
        // Prefer a routable address, fall back to whatever the interface has
        // (loopback only carries 127/8)
        let ipv4 = candidate
            .addrs
            .iter()
            .copied()
            .find(|ip| is_global_unicast(*ip))
            .or_else(|| candidate.addrs.first().copied())
            .ok_or_else(|| anyhow!("Interface '{}' has no IPv4 address", name))?;

        return Ok(InterfaceInfo {
            name: name.to_string(),
            ipv4,
        });
    }

    let available: Vec<_> = interfaces
        .iter()
        .filter(|i| !i.ips.is_empty())
        .map(|i| i.name.clone())
        .collect();

    Err(anyhow!(
        "Interface '{}' not found. Available interfaces: {}",
        name,
        if available.is_empty() {
            "(none with IP addresses)".to_string()
        } else {
            available.join(", ")
        }
    ))
}

/// Local address the kernel would route `target` from
///
/// Connecting a UDP socket sends nothing but fixes its local address.
pub fn route_source(target: Ipv4Addr) -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect(SocketAddrV4::new(target, 9)).ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// Name of the interface carrying `ip`
pub fn interface_for_ip(ip: Ipv4Addr) -> Option<String> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.ips.iter().any(|net| net.ip() == IpAddr::V4(ip)))
        .map(|iface| iface.name)
}

/// Choose the source address and interface for probes towards `target`
///
/// An explicit source address wins, then an explicit interface, then the
/// kernel's route towards the target, then the first suitable interface.
pub fn select_source(
    target: Ipv4Addr,
    interface: Option<&str>,
    source_ip: Option<Ipv4Addr>,
) -> Result<Source> {
    if let Some(ip) = source_ip {
        let name = interface.map(str::to_string).or_else(|| interface_for_ip(ip));
        return Ok(Source {
            ip,
            interface: name,
        });
    }

    if let Some(name) = interface {
        let info = validate_interface(name)?;
        return Ok(Source {
            ip: info.ipv4,
            interface: Some(info.name),
        });
    }

    if let Some(ip) = route_source(target) {
        tracing::debug!(%ip, %target, "source chosen from routing table");
        return Ok(Source {
            ip,
            interface: interface_for_ip(ip),
        });
    }

    let candidates: Vec<Candidate> = datalink::interfaces().iter().map(Candidate::from).collect();
    pick_candidate(&candidates).ok_or_else(|| {
        anyhow!(
            "No usable local IPv4 address found. \
             Use --source-ip or --interface to choose one."
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str, up: bool, loopback: bool, addrs: &[[u8; 4]]) -> Candidate {
        Candidate {
            name: name.to_string(),
            up,
            loopback,
            addrs: addrs.iter().map(|a| Ipv4Addr::from(*a)).collect(),
        }
    }

    #[test]
    fn test_container_interface_names() {
        for (name, expected) in [
            ("docker0", true),
            ("br-123abc456def", true),
            ("veth0abc1", true),
            ("tunl0", true),
            ("flannel.1", true),
            ("cni0", true),
            ("eth0", false),
            ("wlp2s0", false),
        ] {
            assert_eq!(is_container_interface(name), expected, "{}", name);
        }
    }

    #[test]
    fn test_global_unicast() {
        assert!(is_global_unicast(Ipv4Addr::new(192, 168, 1, 10)));
        assert!(is_global_unicast(Ipv4Addr::new(93, 184, 216, 34)));
        assert!(!is_global_unicast(Ipv4Addr::LOCALHOST));
        assert!(!is_global_unicast(Ipv4Addr::UNSPECIFIED));
        assert!(!is_global_unicast(Ipv4Addr::new(169, 254, 1, 1)));
        assert!(!is_global_unicast(Ipv4Addr::new(224, 0, 0, 1)));
        assert!(!is_global_unicast(Ipv4Addr::BROADCAST));
    }

    #[test]
    fn test_pick_skips_unsuitable_interfaces() {
        let candidates = vec![
            candidate("lo", true, true, &[[127, 0, 0, 1]]),
            candidate("docker0", true, false, &[[172, 17, 0, 1]]),
            candidate("eth1", false, false, &[[10, 1, 1, 1]]),
            candidate("eth2", true, false, &[[169, 254, 3, 3]]),
            candidate("eth0", true, false, &[[169, 254, 0, 9], [192, 168, 1, 10]]),
        ];
        assert_eq!(
            pick_candidate(&candidates),
            Some(Source {
                ip: Ipv4Addr::new(192, 168, 1, 10),
                interface: Some("eth0".to_string()),
            })
        );
    }

    #[test]
    fn test_pick_none_when_nothing_usable() {
        let candidates = vec![
            candidate("lo", true, true, &[[127, 0, 0, 1]]),
            candidate("veth12", true, false, &[[10, 0, 0, 1]]),
        ];
        assert_eq!(pick_candidate(&candidates), None);
    }

    #[test]
    fn test_explicit_source_ip_wins() {
        let ip = Ipv4Addr::new(10, 9, 8, 7);
        let source = select_source(Ipv4Addr::new(1, 1, 1, 1), Some("eth0"), Some(ip)).unwrap();
        assert_eq!(source.ip, ip);
        assert_eq!(source.interface.as_deref(), Some("eth0"));
    }

    #[test]
    fn test_nonexistent_interface() {
        let result = validate_interface("nonexistent_interface_12345");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("not found"));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_loopback_interface() {
        let interfaces = datalink::interfaces();
        let loopback_name = match interfaces.iter().find(|iface| iface.is_loopback()) {
            Some(iface) => iface.name.clone(),
            None => {
                eprintln!("Skipping loopback interface test: no loopback interface visible.");
                return;
            }
        };

        match validate_interface(&loopback_name) {
            Ok(info) => {
                assert_eq!(info.name, loopback_name);
                assert!(info.ipv4.is_loopback());
            }
            // Some sandboxes expose lo without an IPv4 address
            Err(e) => assert!(e.to_string().contains("no IPv4 address")),
        }
    }

    #[test]
    fn test_route_source_to_loopback() {
        if let Some(ip) = route_source(Ipv4Addr::LOCALHOST) {
            assert!(ip.is_loopback());
        }
    }
}
