//! TCP dialing and TCP/IP stack fingerprinting.
//!
//! Socket options that are visible before the TLS handshake (p0f-style
//! fingerprinting) are applied through socket2 before connecting.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// TCP/IP fingerprint configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpFingerprint {
    /// Initial receive window size (bytes), set through the socket buffers.
    /// Chrome: 65535
    pub window_size: u32,
    /// Initial TTL (Time To Live) for IPv4 packets.
    /// macOS: 64, Linux: 64, Windows: 128
    pub ttl: u8,
}

impl Default for TcpFingerprint {
    fn default() -> Self {
        // Chrome defaults on macOS
        Self {
            window_size: 65535,
            ttl: 64,
        }
    }
}

impl TcpFingerprint {
    /// Create Chrome TCP fingerprint.
    pub fn chrome() -> Self {
        Self::default()
    }

    /// Windows hosts start at TTL 128.
    pub fn windows() -> Self {
        Self {
            ttl: 128,
            ..Self::default()
        }
    }
}

/// Socket-level dial options shared by every connection of a client.
#[derive(Debug, Clone, Default)]
pub(crate) struct TcpOptions {
    pub fingerprint: Option<TcpFingerprint>,
    pub local_addr: Option<IpAddr>,
    pub keepalive: Option<Duration>,
}

impl TcpOptions {
    fn needs_socket2(&self) -> bool {
        self.fingerprint.is_some() || self.local_addr.is_some() || self.keepalive.is_some()
    }
}

/// Configure a TCP socket with fingerprint settings.
///
/// MSS, window scaling, SACK and timestamps are negotiated by the OS during
/// the TCP handshake and cannot be set through portable socket options.
pub fn configure_tcp_socket(socket: &Socket, fp: &TcpFingerprint) -> io::Result<()> {
    // Set receive buffer size (influences window size)
    socket.set_recv_buffer_size(fp.window_size as usize)?;
    socket.set_send_buffer_size(fp.window_size as usize)?;
    socket.set_ttl_v4(fp.ttl as u32)?;
    Ok(())
}

/// Resolve `host:port` and connect to the first address that accepts.
pub(crate) async fn connect(host: &str, port: u16, opts: &TcpOptions) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::connection(format!("DNS resolution failed for {}: {}", host, e)))?
        .collect();
    if addrs.is_empty() {
        return Err(Error::connection(format!("No addresses found for {}", host)));
    }

    let mut last_err = None;
    for addr in addrs {
        let res = if opts.needs_socket2() {
            connect_configured(addr, opts.clone()).await
        } else {
            TcpStream::connect(addr)
                .await
                .map_err(|e| Error::connection(format!("Failed to connect to {}: {}", addr, e)))
        };
        match res {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                tracing::trace!("dialer: tcp connected to {}", addr);
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!("dialer: connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| Error::connection(format!("Failed to connect to {}", host))))
}

async fn connect_configured(addr: SocketAddr, opts: TcpOptions) -> Result<TcpStream> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    // Perform blocking socket operations in a blocking task
    let std_stream = tokio::task::spawn_blocking(move || -> Result<std::net::TcpStream> {
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::connection(format!("Failed to create socket: {}", e)))?;

        if let Some(fp) = &opts.fingerprint {
            configure_tcp_socket(&socket, fp).map_err(|e| {
                Error::connection(format!("Failed to configure TCP socket: {}", e))
            })?;
        }
        if let Some(interval) = opts.keepalive {
            let keepalive = TcpKeepalive::new()
                .with_time(interval)
                .with_interval(interval);
            socket
                .set_tcp_keepalive(&keepalive)
                .map_err(|e| Error::connection(format!("Failed to set keepalive: {}", e)))?;
        }
        if let Some(ip) = opts.local_addr {
            socket
                .bind(&SocketAddr::new(ip, 0).into())
                .map_err(|e| Error::connection(format!("Failed to bind {}: {}", ip, e)))?;
        }

        socket
            .connect(&addr.into())
            .map_err(|e| Error::connection(format!("Failed to connect to {}: {}", addr, e)))?;

        // Set to non-blocking mode for tokio compatibility
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::connection(format!("Failed to set non-blocking: {}", e)))?;

        Ok(socket.into())
    })
    .await
    .map_err(|e| Error::connection(format!("Blocking task failed: {}", e)))??;

    TcpStream::from_std(std_stream)
        .map_err(|e| Error::connection(format!("Failed to convert to tokio stream: {}", e)))
}
