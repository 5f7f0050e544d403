//! Socket construction
//!
//! Sockets are built with socket2 so reuse, broadcast and buffer options can be
//! applied before bind, then handed to tokio.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info};

fn domain_for(addr: &SocketAddr) -> Domain {
    if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    }
}

fn unspecified_for(remote: &SocketAddr) -> SocketAddr {
    if remote.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    }
}

/// Best-effort SO_RCVBUF; the kernel may clamp or refuse it.
fn set_recv_buffer(socket: &Socket, size: usize) {
    if let Err(e) = socket.set_recv_buffer_size(size) {
        debug!("Failed to set SO_RCVBUF to {}: {}", size, e);
    }
}

fn into_tokio_udp(socket: Socket) -> io::Result<UdpSocket> {
    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

/// Create a TCP listener on `addr` (port 0 picks a free port)
pub async fn create_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(domain_for(&addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(1024)?;

    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    let listener = TcpListener::from_std(std_listener)?;

    info!("Stream listener on {}", listener.local_addr()?);
    Ok(listener)
}

/// Create a UDP socket bound to `addr`
pub async fn create_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(domain_for(&addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;

    let udp = into_tokio_udp(socket)?;
    debug!("UDP socket bound to {}", udp.local_addr()?);
    Ok(udp)
}

/// Create an ephemeral IPv4 socket allowed to send to broadcast addresses
pub async fn create_broadcast_socket() -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    socket.bind(&addr.into())?;
    into_tokio_udp(socket)
}

/// Bind the discovery port so that several listeners on one host can share it.
pub async fn create_discovery_socket(port: u16) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_broadcast(true)?;

    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&addr.into())?;
    into_tokio_udp(socket)
}

/// Create an ephemeral UDP socket matching the address family of `remote`.
pub async fn create_udp_socket_for_remote(
    remote: SocketAddr,
    recv_buffer: Option<usize>,
) -> io::Result<UdpSocket> {
    let socket = Socket::new(domain_for(&remote), Type::DGRAM, Some(Protocol::UDP))?;
    if let Some(size) = recv_buffer {
        set_recv_buffer(&socket, size);
    }
    socket.bind(&SockAddr::from(unspecified_for(&remote)))?;
    into_tokio_udp(socket)
}

/// Connect with an upper bound on the handshake time
pub async fn connect_tcp(addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect to {} timed out after {:?}", addr, timeout),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_gets_os_port() {
        let listener = create_tcp_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_remote_socket_matches_family() {
        let socket = create_udp_socket_for_remote("127.0.0.1:9".parse().unwrap(), Some(1 << 20))
            .await
            .unwrap();
        assert!(socket.local_addr().unwrap().is_ipv4());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port and close it again so nothing is listening there
        let listener = create_tcp_listener("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(connect_tcp(addr, Duration::from_secs(2)).await.is_err());
    }
}
