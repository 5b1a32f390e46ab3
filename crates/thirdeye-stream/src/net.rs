//! # Socket Setup
//!
//! UDP socket creation for the receive path, including optional binding to
//! a specific network (interface name or local address) so the camera feed
//! keeps arriving over the intended link when several are up.

use anyhow::{bail, Context, Result};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::{debug, warn};

/// Kernel receive buffer requested for video sockets.
const RECV_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Which network the receive socket is pinned to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkBinding {
    /// Network interface name, e.g. `wlan0`.
    Interface(String),
    /// Local address to bind to.
    Address(IpAddr),
}

impl std::fmt::Display for NetworkBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkBinding::Interface(name) => write!(f, "iface:{name}"),
            NetworkBinding::Address(ip) => write!(f, "addr:{ip}"),
        }
    }
}

/// Create a UDP socket bound to `port` with address reuse and a read
/// timeout so a blocking receive wakes up periodically.
pub fn bind_udp(
    port: u16,
    binding: Option<&NetworkBinding>,
    read_timeout: Duration,
) -> Result<UdpSocket> {
    let ip = match binding {
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        Some(NetworkBinding::Address(ip)) => *ip,
        Some(NetworkBinding::Interface(_)) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let mut addr = SocketAddr::new(ip, port);

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("failed to create UDP socket")?;
    socket
        .set_reuse_address(true)
        .context("failed to set SO_REUSEADDR")?;
    if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_BYTES) {
        warn!(error = %e, "failed to enlarge receive buffer");
    }

    if let Some(NetworkBinding::Interface(iface)) = binding {
        if !bind_to_device(&socket, iface) {
            match resolve_iface_ipv4(iface) {
                Some(ip) => {
                    debug!(iface = %iface, %ip, "binding to interface address instead of device");
                    addr = SocketAddr::new(ip, port);
                }
                None => bail!("interface {iface} not found or has no IPv4 address"),
            }
        }
    }

    socket
        .bind(&SockAddr::from(addr))
        .with_context(|| format!("failed to bind UDP socket to {addr}"))?;
    socket
        .set_read_timeout(Some(read_timeout))
        .context("failed to set read timeout")?;

    Ok(socket.into())
}

#[cfg(target_os = "linux")]
fn bind_to_device(socket: &Socket, iface: &str) -> bool {
    match socket.bind_device(Some(iface.as_bytes())) {
        Ok(()) => true,
        Err(e) => {
            warn!(iface = %iface, error = %e, "SO_BINDTODEVICE failed");
            false
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn bind_to_device(_socket: &Socket, _iface: &str) -> bool {
    false
}

/// Resolve a network interface name (e.g., "eth0") to its first IPv4 address.
/// Returns `None` if the interface doesn't exist or has no IPv4 address.
#[cfg(unix)]
pub fn resolve_iface_ipv4(iface: &str) -> Option<IpAddr> {
    // SAFETY: the list returned by getifaddrs is only read while alive and
    // freed exactly once.
    unsafe {
        let mut ifaddrs: *mut libc::ifaddrs = std::ptr::null_mut();
        if libc::getifaddrs(&mut ifaddrs) != 0 {
            return None;
        }

        let mut current = ifaddrs;
        let mut result = None;

        while !current.is_null() {
            let ifa = &*current;
            if !ifa.ifa_addr.is_null() {
                let name = std::ffi::CStr::from_ptr(ifa.ifa_name).to_string_lossy();
                if name == iface && i32::from((*ifa.ifa_addr).sa_family) == libc::AF_INET {
                    let addr = &*(ifa.ifa_addr as *const libc::sockaddr_in);
                    result = Some(IpAddr::V4(Ipv4Addr::from(u32::from_be(
                        addr.sin_addr.s_addr,
                    ))));
                    break;
                }
            }
            current = ifa.ifa_next;
        }

        libc::freeifaddrs(ifaddrs);
        result
    }
}

#[cfg(not(unix))]
pub fn resolve_iface_ipv4(_iface: &str) -> Option<IpAddr> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(target_os = "linux")]
    #[test]
    fn resolve_loopback_returns_127() {
        assert_eq!(
            resolve_iface_ipv4("lo"),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
    }

    #[test]
    fn resolve_unknown_iface_is_none() {
        assert_eq!(resolve_iface_ipv4("definitely-not-an-iface0"), None);
    }

    #[test]
    fn bind_ephemeral_port() {
        let sock = bind_udp(0, None, Duration::from_millis(50)).unwrap();
        let addr = sock.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(sock.read_timeout().unwrap(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn bind_to_loopback_address() {
        let binding = NetworkBinding::Address(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let sock = bind_udp(0, Some(&binding), Duration::from_millis(50)).unwrap();
        assert_eq!(sock.local_addr().unwrap().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn unknown_interface_fails() {
        let binding = NetworkBinding::Interface("definitely-not-an-iface0".into());
        assert!(bind_udp(0, Some(&binding), Duration::from_millis(50)).is_err());
    }

    #[test]
    fn display_binding() {
        assert_eq!(NetworkBinding::Interface("wlan0".into()).to_string(), "iface:wlan0");
        assert_eq!(
            NetworkBinding::Address(IpAddr::V4(Ipv4Addr::LOCALHOST)).to_string(),
            "addr:127.0.0.1"
        );
    }
}
