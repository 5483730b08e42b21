//! SOCKS5 client (RFC 1928) with username/password auth (RFC 1929).
//!
//! Supports CONNECT for TCP tunnels and UDP ASSOCIATE for QUIC through the
//! last proxy hop.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::proxy::{Proxy, ProxyScheme};
use crate::transport::connector::BoxIo;

const VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Destination as sent to the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl TargetAddr {
    /// Build the destination for `proxy`: hostnames are passed through for
    /// `socks5h`, resolved locally for `socks5`.
    pub(crate) async fn for_proxy(proxy: &Proxy, host: &str, port: u16) -> Result<Self> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Self::Ip(SocketAddr::new(ip, port)));
        }
        match proxy.scheme {
            ProxyScheme::Socks5 { remote_dns: true } => Ok(Self::Domain(host.to_string(), port)),
            _ => {
                let addr = tokio::net::lookup_host((host, port))
                    .await
                    .map_err(|e| Error::connection(format!("DNS resolution failed for {}: {}", host, e)))?
                    .next()
                    .ok_or_else(|| Error::connection(format!("No addresses found for {}", host)))?;
                Ok(Self::Ip(addr))
            }
        }
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Ip(SocketAddr::V4(addr)) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            Self::Ip(SocketAddr::V6(addr)) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&addr.ip().octets());
                out.extend_from_slice(&addr.port().to_be_bytes());
            }
            Self::Domain(host, port) => {
                let len = u8::try_from(host.len())
                    .map_err(|_| Error::proxy(format!("hostname too long for SOCKS5: {}", host)))?;
                out.push(ATYP_DOMAIN);
                out.push(len);
                out.extend_from_slice(host.as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
        Ok(())
    }
}

/// Open a TCP tunnel to `target` through a SOCKS5 proxy.
pub(crate) async fn connect(mut stream: BoxIo, proxy: &Proxy, target: &TargetAddr) -> Result<BoxIo> {
    negotiate(&mut stream, proxy).await?;
    request(&mut stream, CMD_CONNECT, target).await?;
    tracing::trace!("dialer: socks5 tunnel to {:?} via {} established", target, proxy);
    Ok(stream)
}

/// Ask the proxy for a UDP relay. The returned control stream must stay open
/// for as long as the relay is used.
pub(crate) async fn udp_associate(mut stream: BoxIo, proxy: &Proxy) -> Result<(BoxIo, SocketAddr)> {
    negotiate(&mut stream, proxy).await?;
    let unspecified = TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let bound = request(&mut stream, CMD_UDP_ASSOCIATE, &unspecified).await?;
    let relay = match bound {
        TargetAddr::Ip(addr) if addr.ip().is_unspecified() => {
            // Relay on the proxy's own address.
            let proxy_ip = tokio::net::lookup_host((proxy.host.as_str(), proxy.port))
                .await?
                .next()
                .ok_or_else(|| Error::proxy(format!("cannot resolve proxy {}", proxy)))?
                .ip();
            SocketAddr::new(proxy_ip, addr.port())
        }
        TargetAddr::Ip(addr) => addr,
        TargetAddr::Domain(host, port) => tokio::net::lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| Error::proxy(format!("cannot resolve UDP relay {}", host)))?,
    };
    tracing::trace!("dialer: socks5 udp relay at {} via {}", relay, proxy);
    Ok((stream, relay))
}

async fn negotiate(stream: &mut BoxIo, proxy: &Proxy) -> Result<()> {
    let greeting: &[u8] = if proxy.auth.is_some() {
        &[VERSION, 2, AUTH_NONE, AUTH_PASSWORD]
    } else {
        &[VERSION, 1, AUTH_NONE]
    };
    stream.write_all(greeting).await?;
    stream.flush().await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VERSION {
        return Err(Error::proxy(format!("unexpected SOCKS version {}", reply[0])));
    }
    match reply[1] {
        AUTH_NONE => Ok(()),
        AUTH_PASSWORD => {
            let auth = proxy
                .auth
                .as_ref()
                .ok_or_else(|| Error::proxy("SOCKS5 proxy requires authentication"))?;
            let user = auth.username.as_bytes();
            let pass = auth.password.as_bytes();
            if user.len() > 255 || pass.len() > 255 {
                return Err(Error::proxy("SOCKS5 credentials too long"));
            }
            let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
            msg.push(0x01);
            msg.push(user.len() as u8);
            msg.extend_from_slice(user);
            msg.push(pass.len() as u8);
            msg.extend_from_slice(pass);
            stream.write_all(&msg).await?;
            stream.flush().await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0x00 {
                return Err(Error::proxy("SOCKS5 authentication failed"));
            }
            Ok(())
        }
        AUTH_UNACCEPTABLE => Err(Error::proxy("SOCKS5 proxy accepted none of the offered auth methods")),
        other => Err(Error::proxy(format!("unsupported SOCKS5 auth method {}", other))),
    }
}

async fn request(stream: &mut BoxIo, cmd: u8, target: &TargetAddr) -> Result<TargetAddr> {
    let mut msg = vec![VERSION, cmd, 0x00];
    target.encode(&mut msg)?;
    stream.write_all(&msg).await?;
    stream.flush().await?;

    let mut head = [0u8; 3];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(Error::proxy(format!("unexpected SOCKS version {}", head[0])));
    }
    if head[1] != 0x00 {
        return Err(Error::proxy(format!("SOCKS5 request failed: {}", reply_message(head[1]))));
    }
    read_addr(stream).await
}

async fn read_addr<R: AsyncRead + Unpin>(r: &mut R) -> Result<TargetAddr> {
    let atyp = r.read_u8().await?;
    match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            r.read_exact(&mut ip).await?;
            let port = r.read_u16().await?;
            Ok(TargetAddr::Ip(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)))
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            r.read_exact(&mut ip).await?;
            let port = r.read_u16().await?;
            Ok(TargetAddr::Ip(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)))
        }
        ATYP_DOMAIN => {
            let len = r.read_u8().await? as usize;
            let mut host = vec![0u8; len];
            r.read_exact(&mut host).await?;
            let port = r.read_u16().await?;
            let host = String::from_utf8(host)
                .map_err(|_| Error::proxy("SOCKS5 reply carries a non UTF-8 hostname"))?;
            Ok(TargetAddr::Domain(host, port))
        }
        other => Err(Error::proxy(format!("unknown SOCKS5 address type {}", other))),
    }
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

/// Prefix for every datagram sent through a UDP relay.
pub(crate) fn udp_header(target: &TargetAddr) -> Result<Vec<u8>> {
    // RSV(2) FRAG(1)
    let mut out = vec![0x00, 0x00, 0x00];
    target.encode(&mut out)?;
    Ok(out)
}

/// Length of the relay header on a received datagram.
pub(crate) fn udp_header_len(packet: &[u8]) -> Result<usize> {
    if packet.len() < 4 {
        return Err(Error::proxy("short SOCKS5 UDP datagram"));
    }
    if packet[2] != 0x00 {
        return Err(Error::proxy("fragmented SOCKS5 UDP datagrams are not supported"));
    }
    let len = match packet[3] {
        ATYP_IPV4 => 4 + 4 + 2,
        ATYP_IPV6 => 4 + 16 + 2,
        ATYP_DOMAIN => {
            let n = *packet
                .get(4)
                .ok_or_else(|| Error::proxy("short SOCKS5 UDP datagram"))? as usize;
            4 + 1 + n + 2
        }
        other => return Err(Error::proxy(format!("unknown SOCKS5 address type {}", other))),
    };
    if packet.len() < len {
        return Err(Error::proxy("short SOCKS5 UDP datagram"));
    }
    Ok(len)
}
