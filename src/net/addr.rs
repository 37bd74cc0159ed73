//! Address helpers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Parse an IP literal, ignoring surrounding whitespace.
pub fn parse_ip(s: &str) -> Option<IpAddr> {
    s.trim().parse().ok()
}

/// Parse `host` as an IP literal and attach `port`.
pub fn socket_addr(host: &str, port: u16) -> Option<SocketAddr> {
    parse_ip(host).map(|ip| SocketAddr::new(ip, port))
}

/// True for IPv4 or IPv6 multicast group addresses.
pub fn is_multicast(addr: &IpAddr) -> bool {
    addr.is_multicast()
}

/// The IPv4 form of an address, if it has one.
pub fn as_ipv4(addr: &IpAddr) -> Option<Ipv4Addr> {
    match addr {
        IpAddr::V4(v4) => Some(*v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

/// Endpoint id of a UDP inbound port, `*:<port>:udp`.
pub fn udp_endpoint_id(port: u16) -> String {
    format!("*:{port}:udp")
}

/// Endpoint id of a TCP inbound port, `*:<port>:tcp`.
pub fn tcp_endpoint_id(port: u16) -> String {
    format!("*:{port}:tcp")
}

/// Endpoint id of a server stream, `ssl:<host>:<port>` or `tcp:<host>:<port>`.
pub fn stream_endpoint_id(host: &str, port: u16, tls: bool) -> String {
    format!("{}:{host}:{port}", if tls { "ssl" } else { "tcp" })
}
