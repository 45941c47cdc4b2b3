//! Address handling and socket creation.
//!
//! Targets are `host:port` strings. Hosts given without a port get the
//! configured default port appended, and an empty host binds every IPv4
//! interface.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, info, warn};

/// Append `port` (written as `":8080"`) unless `host` already names one.
///
/// The host is scanned from the end: a `:` means a port is present, while a
/// `]` closes a bracketed IPv6 literal that has no port after it.
pub fn append_port_if_missing(host: &str, port: &str) -> String {
    for c in host.bytes().rev() {
        match c {
            b']' => break,
            b':' => return host.to_string(),
            _ => {}
        }
    }
    format!("{}{}", host, port)
}

/// Format a port number the way [`append_port_if_missing`] expects it.
pub fn port_suffix(port: u16) -> String {
    format!(":{}", port)
}

/// The host part of a `host:port` target, without IPv6 brackets.
pub fn host_of(target: &str) -> &str {
    if let Some(rest) = target.strip_prefix('[')
        && let Some((host, _)) = rest.split_once(']')
    {
        return host;
    }
    match target.rsplit_once(':') {
        Some((host, _)) => host,
        None => target,
    }
}

/// Resolve a `host:port` target; an empty host stands for all IPv4 interfaces.
pub async fn resolve(target: &str) -> io::Result<Vec<SocketAddr>> {
    let lookup = if target.starts_with(':') {
        format!("{}{}", Ipv4Addr::UNSPECIFIED, target)
    } else {
        target.to_string()
    };

    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(lookup.as_str()).await?.collect();
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", target),
        ));
    }
    Ok(addrs)
}

/// Resolve the optional local bind address once for a whole run.
///
/// Failures are logged and the run continues without binding.
pub async fn resolve_local(local: Option<&str>) -> Option<SocketAddr> {
    let local = local?;
    let target = append_port_if_missing(local, ":0");
    match resolve(&target).await {
        Ok(addrs) => {
            let addr = addrs[0];
            debug!("Binding outgoing connections to {}", addr);
            Some(addr)
        }
        Err(e) => {
            warn!("Ignoring local address {}: {}", local, e);
            None
        }
    }
}

/// Connect to a target, trying each resolved address in turn
pub async fn connect_tcp(
    target: &str,
    bind_addr: Option<SocketAddr>,
) -> io::Result<(TcpStream, SocketAddr)> {
    let addrs = resolve(target).await?;

    let mut last_err = None;

    for addr in addrs {
        debug!("Trying to connect to {}", addr);
        match connect_tcp_with_bind(addr, bind_addr).await {
            Ok(stream) => {
                info!("Connected to {}", addr);
                return Ok((stream, addr));
            }
            Err(e) => {
                debug!("Failed to connect to {}: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotConnected, "No addresses to connect to")
    }))
}

/// Connect TCP socket with optional local bind address
pub async fn connect_tcp_with_bind(
    remote: SocketAddr,
    bind_addr: Option<SocketAddr>,
) -> io::Result<TcpStream> {
    let Some(local) = bind_addr else {
        return TcpStream::connect(remote).await;
    };

    let socket = Socket::new(domain_for(remote), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(local))?;

    // Non-blocking connect reports "in progress" until the handshake completes
    match socket.connect(&SockAddr::from(remote)) {
        Ok(()) => {}
        #[cfg(unix)]
        Err(e)
            if e.raw_os_error() == Some(libc::EINPROGRESS)
                || e.raw_os_error() == Some(libc::EALREADY)
                || e.raw_os_error() == Some(libc::EWOULDBLOCK) => {}
        #[cfg(windows)]
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)?;

    stream.writable().await?;
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }

    debug!("Connected to {} from {}", remote, local);
    Ok(stream)
}

/// Open a UDP socket connected to the first resolved address of `target`.
pub async fn connect_udp(
    target: &str,
    bind_addr: Option<SocketAddr>,
) -> io::Result<(UdpSocket, SocketAddr)> {
    let addrs = resolve(target).await?;
    let remote = addrs[0];

    let local = bind_addr.unwrap_or_else(|| unspecified_for(remote));
    let socket = Socket::new(domain_for(remote), Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SockAddr::from(local))?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    let udp = UdpSocket::from_std(std_socket)?;
    udp.connect(remote).await?;

    info!("UDP socket {} sending to {}", udp.local_addr()?, remote);
    Ok((udp, remote))
}

/// Bind a TCP listener with address reuse
pub fn bind_tcp_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(domain_for(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;
    socket.listen(128)?;

    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener)
}

/// Bind a UDP socket with address reuse
pub fn bind_udp_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(domain_for(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SockAddr::from(addr))?;

    socket.set_nonblocking(true)?;
    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
}

fn domain_for(addr: SocketAddr) -> Domain {
    if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    }
}

fn unspecified_for(remote: SocketAddr) -> SocketAddr {
    if remote.is_ipv4() {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    } else {
        SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
    }
}

/// Convert IPv4-mapped IPv6 to IPv4 if applicable
pub fn normalize_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V6(v6) => {
            if let Some(v4) = v6.ip().to_ipv4_mapped() {
                SocketAddr::new(IpAddr::V4(v4), v6.port())
            } else {
                addr
            }
        }
        _ => addr,
    }
}
