//! UDP datagram paths for QUIC: a direct socket, or a SOCKS5 UDP relay.

use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::error::Result;
use crate::transport::connector::BoxIo;
use crate::transport::socks5::{udp_header, udp_header_len, TargetAddr};

/// Largest datagram the relay path will accept, header included.
const MAX_DATAGRAM: usize = 65535;

pub(crate) enum Datagram {
    Direct {
        socket: UdpSocket,
        peer: SocketAddr,
    },
    /// Every datagram carries the SOCKS5 UDP request header. The TCP control
    /// connection keeps the association alive and is held until drop.
    Relay {
        socket: UdpSocket,
        relay: SocketAddr,
        header: Vec<u8>,
        _control: BoxIo,
    },
}

impl Datagram {
    pub(crate) async fn direct(peer: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(unspecified_for(&peer)).await?;
        socket.connect(peer).await?;
        Ok(Self::Direct { socket, peer })
    }

    pub(crate) async fn relay(control: BoxIo, relay: SocketAddr, target: &TargetAddr) -> Result<Self> {
        let socket = UdpSocket::bind(unspecified_for(&relay)).await?;
        socket.connect(relay).await?;
        Ok(Self::Relay {
            socket,
            relay,
            header: udp_header(target)?,
            _control: control,
        })
    }

    /// Address QUIC sees as its peer.
    pub(crate) fn peer(&self) -> SocketAddr {
        match self {
            Self::Direct { peer, .. } => *peer,
            Self::Relay { relay, .. } => *relay,
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Direct { socket, .. } | Self::Relay { socket, .. } => socket.local_addr(),
        }
    }

    pub(crate) async fn send(&self, payload: &[u8]) -> io::Result<()> {
        match self {
            Self::Direct { socket, .. } => {
                socket.send(payload).await?;
            }
            Self::Relay { socket, header, .. } => {
                let mut packet = Vec::with_capacity(header.len() + payload.len());
                packet.extend_from_slice(header);
                packet.extend_from_slice(payload);
                socket.send(&packet).await?;
            }
        }
        Ok(())
    }

    /// Receive one payload into `buf`, returning its length.
    pub(crate) async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Direct { socket, .. } => socket.recv(buf).await,
            Self::Relay { socket, .. } => loop {
                let mut packet = vec![0u8; MAX_DATAGRAM];
                let n = socket.recv(&mut packet).await?;
                let start = match udp_header_len(&packet[..n]) {
                    Ok(len) if len <= n => len,
                    _ => {
                        tracing::trace!("h3: dropping malformed relay datagram");
                        continue;
                    }
                };
                let payload = &packet[start..n];
                let len = payload.len().min(buf.len());
                buf[..len].copy_from_slice(&payload[..len]);
                return Ok(len);
            },
        }
    }
}

fn unspecified_for(peer: &SocketAddr) -> SocketAddr {
    match peer {
        SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
        SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
    }
}
