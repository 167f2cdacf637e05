//! Addressing defaults and helpers.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;

pub const DEFAULT_ADDRESS: &str = "127.0.0.1";

/// Port clients publish to (the relay's "recv" side).
pub const DEFAULT_PUBLISH_PORT: u16 = 42522;

/// Port clients subscribe on (the relay's "send" side).
pub const DEFAULT_SUBSCRIBE_PORT: u16 = 42533;

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

/// True for `localhost` and any loopback IP literal.
pub fn is_loopback(address: &str) -> bool {
    address.eq_ignore_ascii_case("localhost")
        || address
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

/// True if nothing accepts connections on `127.0.0.1:port`.
pub fn is_port_available(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_err()
}

/// LAN address other instances should use to reach this machine.
///
/// Connecting a UDP socket sends no packets; it only selects the outbound interface.
pub fn local_ip() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 1)).ok()?;
    socket.local_addr().ok().map(|a| a.ip())
}

pub(crate) fn resolve(address: &str, port: u16) -> io::Result<SocketAddr> {
    (address, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{} did not resolve", address),
        )
    })
}
