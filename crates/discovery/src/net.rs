//! Small socket helpers shared by the scanner, compatibility tests and diagnostics

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

/// Local IPv4 address used for outbound traffic
///
/// Connecting a UDP socket sends nothing; it only asks the kernel for a route.
pub fn local_ipv4() -> io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
    socket.connect(SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 80)))?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        other => Err(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no routable IPv4 address (got {})", other),
        )),
    }
}

/// Every other host address in the /24 around `ip`
pub fn subnet_hosts(ip: Ipv4Addr) -> Vec<Ipv4Addr> {
    let [a, b, c, own] = ip.octets();
    (1..=254u8)
        .filter(|d| *d != own)
        .map(|d| Ipv4Addr::new(a, b, c, d))
        .collect()
}

/// Conventional gateway address for the /24 around `ip`
pub fn default_gateway_guess(ip: Ipv4Addr) -> Ipv4Addr {
    let [a, b, c, _] = ip.octets();
    Ipv4Addr::new(a, b, c, 1)
}

/// Open and immediately drop a TCP connection, returning the connect time
///
/// The stream is dropped on every path, including the timeout, so no socket
/// outlives the call.
pub async fn tcp_connect_time(addr: SocketAddr, limit: Duration) -> io::Result<Duration> {
    let start = Instant::now();
    match timeout(limit, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            drop(stream);
            Ok(start.elapsed())
        }
        Ok(Err(e)) => Err(e),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", addr))),
    }
}

/// Whether a host answered at all: a refused connection still proves it is up
pub async fn host_answers(addr: SocketAddr, limit: Duration) -> io::Result<Duration> {
    let start = Instant::now();
    match tcp_connect_time(addr, limit).await {
        Ok(elapsed) => Ok(elapsed),
        Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => Ok(start.elapsed()),
        Err(e) => Err(e),
    }
}

/// Resolve `host:port` (name or literal) to the first socket address
pub async fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    tokio::net::lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} did not resolve", host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_subnet_hosts_excludes_self() {
        let hosts = subnet_hosts(Ipv4Addr::new(192, 168, 1, 42));
        assert_eq!(hosts.len(), 253);
        assert!(!hosts.contains(&Ipv4Addr::new(192, 168, 1, 42)));
        assert_eq!(hosts[0], Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(default_gateway_guess(Ipv4Addr::new(10, 0, 3, 7)), Ipv4Addr::new(10, 0, 3, 1));
    }

    #[tokio::test]
    async fn test_tcp_connect_time_to_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let elapsed = tcp_connect_time(addr, Duration::from_secs(1)).await.unwrap();
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_refused_connection_still_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(tcp_connect_time(addr, Duration::from_secs(1)).await.is_err());
        assert!(host_answers(addr, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_resolve_literal() {
        let addr = resolve("127.0.0.1", 1400).await.unwrap();
        assert_eq!(addr, "127.0.0.1:1400".parse().unwrap());
    }
}
