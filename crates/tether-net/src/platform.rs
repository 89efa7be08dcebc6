//! Cross-platform TCP socket options.
//!
//! Every stream a [`crate::Connection`] owns goes through
//! [`configure_stream`], and every registry listener is created by
//! [`create_listener`], so Linux, Windows, and macOS behave the same way.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};

/// Socket options applied to every connection and listener.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm; messages are small and latency matters. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive so dead peers eventually raise a disconnect. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive probe. Default: 60s.
    pub keepalive_idle: Duration,
    /// Keepalive probe interval. Default: 10s.
    pub keepalive_interval: Duration,
    /// Probes before the connection is declared dead. Default: 3.
    pub keepalive_retries: u32,
    /// Enable `SO_REUSEADDR` on listeners. Default: true except on Windows.
    pub reuse_addr: bool,
    /// Pending-accept queue length of listeners. Default: 128.
    pub listen_backlog: i32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
            keepalive_retries: 3,
            reuse_addr: !cfg!(target_os = "windows"),
            listen_backlog: 128,
        }
    }
}

/// Apply socket options to a connected [`TcpStream`].
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if config.keepalive_enabled {
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);

        // Retry counts are not configurable on macOS.
        #[cfg(any(target_os = "linux", target_os = "windows"))]
        let keepalive = keepalive.with_retries(config.keepalive_retries);

        SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

/// Create a listening socket bound to `addr`.
///
/// IPv6 addresses are bound dual-stack so IPv4 clients are accepted too.
/// Binding errors (port in use, missing permission) are returned unchanged.
pub fn create_listener(addr: SocketAddr, config: &SocketConfig) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;

    if config.reuse_addr {
        socket.set_reuse_address(true)?;
    }
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(config.listen_backlog)?;

    TcpListener::from_std(socket.into())
}

/// Wildcard address for a listen port: `[::]` when dual-stack is wanted,
/// `0.0.0.0` otherwise.
pub fn any_address(port: u16, dual_stack: bool) -> SocketAddr {
    let ip = if dual_stack {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    SocketAddr::new(ip, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_tcp_nodelay_is_set() {
        let config = SocketConfig::default();
        let listener = create_listener(loopback(), &config).unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        configure_stream(&client, &config).unwrap();

        assert!(client.nodelay().unwrap(), "TCP_NODELAY should be enabled");
    }

    #[tokio::test]
    async fn test_nodelay_disabled_when_configured() {
        let config = SocketConfig {
            tcp_nodelay: false,
            ..Default::default()
        };
        let listener = create_listener(loopback(), &SocketConfig::default()).unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        configure_stream(&client, &config).unwrap();

        assert!(!client.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_keepalive_is_configured() {
        let config = SocketConfig {
            keepalive_idle: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(5),
            ..Default::default()
        };
        let listener = create_listener(loopback(), &config).unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        configure_stream(&client, &config).unwrap();

        assert!(SockRef::from(&client).keepalive().unwrap());
    }

    #[tokio::test]
    async fn test_listener_accepts_connections() {
        let config = SocketConfig::default();
        let listener = create_listener(loopback(), &config).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0, "Ephemeral port should be resolved");

        let _client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        configure_stream(&accepted, &config).unwrap();
    }

    #[tokio::test]
    async fn test_binding_a_taken_port_fails() {
        let config = SocketConfig {
            reuse_addr: false,
            ..Default::default()
        };
        let first = create_listener(loopback(), &config).unwrap();
        let taken = first.local_addr().unwrap();
        assert!(create_listener(taken, &config).is_err());
    }

    #[test]
    fn test_any_address_families() {
        assert!(any_address(800, true).is_ipv6());
        let v4 = any_address(800, false);
        assert!(v4.is_ipv4());
        assert_eq!(v4.port(), 800);
    }
}
