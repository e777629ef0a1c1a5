use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use if_addrs::get_if_addrs;
use log::warn;
use tokio::net::lookup_host;

pub struct IpAddress(pub(crate) Ipv4Addr);

impl From<Ipv4Addr> for IpAddress {
    fn from(ip: Ipv4Addr) -> Self {
        IpAddress(ip)
    }
}

impl From<&str> for IpAddress {
    fn from(s: &str) -> Self {
        IpAddress(Ipv4Addr::from_str(s).unwrap_or(Ipv4Addr::LOCALHOST))
    }
}

impl IpAddress {
    /// Finds the first usable IPv4 on this system: interfaces that are
    /// loopback, docker bridges or warden bridges are skipped.
    pub(crate) fn find_system_ip() -> Result<Ipv4Addr> {
        let interfaces = get_if_addrs()?;
        for iface in interfaces {
            if iface.is_loopback() {
                continue;
            }
            if iface.name.starts_with("docker") || iface.name.starts_with("w-") {
                continue;
            }
            if let IpAddr::V4(ip) = iface.addr.ip() {
                return Ok(ip);
            }
        }
        Err(anyhow!("no suitable IPv4 address found"))
    }
}

/// Parses a `host[:port]` peer argument into a socket address.
///
/// A missing port defaults to `default_port`. Host names are resolved via
/// DNS and the first IPv4 result wins. A loopback resolution is rewritten to
/// `local_ip` so the advertised identity is reachable from other hosts,
/// except when this endpoint itself lives on loopback.
pub(crate) async fn parse_node_address(
    host_and_maybe_port: &str,
    default_port: u16,
    local_ip: Ipv4Addr,
) -> Result<SocketAddrV4> {
    let (host, port) = match host_and_maybe_port.split_once(':') {
        Some((host, port_str)) => {
            if port_str.contains(':') {
                return Err(anyhow!(
                    "too many colons in argument {}",
                    host_and_maybe_port
                ));
            }
            let port: u16 = port_str
                .parse()
                .map_err(|e| anyhow!("bad port in {}: {}", host_and_maybe_port, e))?;
            (host, port)
        }
        None => (host_and_maybe_port, default_port),
    };

    let mut ip = None;
    for addr in lookup_host((host, port)).await? {
        if let IpAddr::V4(v4) = addr.ip() {
            ip = Some(v4);
        }
    }

    let mut ip = ip.ok_or_else(|| anyhow!("no IPv4 address for host {}", host))?;

    if ip.is_loopback() && !local_ip.is_loopback() {
        warn!("Rewriting loopback peer {} to local address {}", ip, local_ip);
        ip = local_ip;
    }

    Ok(SocketAddrV4::new(ip, port))
}
