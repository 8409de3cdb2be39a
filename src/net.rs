//! Outbound interface selection and multicast send-socket construction.

use std::env;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// Environment variable naming the outbound multicast interface, either as
/// an interface name ("eth0") or an IPv4 literal ("192.168.60.102").
pub const MCAST_IFACE_ENV: &str = "MCAST_IFACE";

/// The interface multicast traffic leaves through.
#[derive(Debug, Clone)]
pub struct OutboundIface {
    /// Interface name when known (an IPv4 literal in `MCAST_IFACE` has none).
    pub name: Option<String>,
    pub ip: Ipv4Addr,
}

/// Pick the outbound multicast interface.
///
/// Honors `MCAST_IFACE` when set; otherwise the first non-loopback IPv4
/// interface wins. `None` means no usable interface was found - sends then
/// go through the OS default route and the SAP origin is 0.0.0.0.
pub fn pick_multicast_iface() -> Option<OutboundIface> {
    let preferred = env::var(MCAST_IFACE_ENV).ok();
    pick_with(preferred.as_deref().map(str::trim).filter(|s| !s.is_empty()))
}

fn pick_with(preferred: Option<&str>) -> Option<OutboundIface> {
    if let Some(pref) = preferred {
        if let Ok(ip) = pref.parse::<Ipv4Addr>() {
            return Some(OutboundIface { name: None, ip });
        }
        return iface_ipv4(pref).map(|ip| OutboundIface {
            name: Some(pref.to_string()),
            ip,
        });
    }

    let ifaces = if_addrs::get_if_addrs().ok()?;
    ifaces.into_iter().find_map(|iface| {
        if iface.is_loopback() {
            return None;
        }
        match iface.ip() {
            std::net::IpAddr::V4(ip) => Some(OutboundIface {
                name: Some(iface.name),
                ip,
            }),
            std::net::IpAddr::V6(_) => None,
        }
    })
}

/// IPv4 address of a named interface, if it has one.
pub fn iface_ipv4(name: &str) -> Option<Ipv4Addr> {
    let ifaces = if_addrs::get_if_addrs().ok()?;
    ifaces.into_iter().find_map(|iface| {
        if iface.name != name {
            return None;
        }
        match iface.ip() {
            std::net::IpAddr::V4(ip) => Some(ip),
            std::net::IpAddr::V6(_) => None,
        }
    })
}

/// Create the UDP socket an RTP flow sends from.
///
/// Bound to an unspecified local address, multicast TTL 32, loopback off,
/// non-blocking. Pacing comes from frame arrival, so a full send buffer
/// drops the packet rather than stalling the pipeline.
pub fn create_rtp_socket(iface: Option<Ipv4Addr>) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))?;
    socket.set_multicast_ttl_v4(32)?;
    socket.set_multicast_loop_v4(false)?;
    if let Some(ip) = iface {
        socket.set_multicast_if_v4(&ip)?;
    }
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Create the UDP socket SAP announcements send from.
///
/// SAP is low-rate, so blocking sends are fine; loopback stays enabled so
/// receivers on this host see the announcements too.
pub fn create_sap_socket(iface: Option<Ipv4Addr>) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))?;
    socket.set_multicast_ttl_v4(255)?;
    if let Some(ip) = iface {
        socket.set_multicast_if_v4(&ip)?;
    }
    Ok(socket.into())
}
