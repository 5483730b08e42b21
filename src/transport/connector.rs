//! BoringSSL TLS connector.
//!
//! A fresh `SslConnector` is built for every dial so concurrent handshakes
//! never share mutable session-cache state.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use boring::ssl::{SslConnector, SslMethod, SslVerifyMode, SslVersion};
use boring::x509::X509;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_boring::SslStream;

use crate::error::{Error, Result};
use crate::fingerprint::tls::TlsFingerprint;

/// Byte stream produced by the dialer before TLS: a TCP stream, or a tunnel
/// through one or more proxies.
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin + 'static> Io for T {}

pub(crate) type BoxIo = Box<dyn Io>;

/// ALPN offer for a handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AlpnOffer {
    /// `h2` then `http/1.1`.
    H2Http1,
    /// `http/1.1` only (WebSocket, forced HTTP/1.1, proxies).
    Http1,
}

impl AlpnOffer {
    fn wire(&self) -> &'static [u8] {
        match self {
            Self::H2Http1 => b"\x02h2\x08http/1.1",
            Self::Http1 => b"\x08http/1.1",
        }
    }
}

/// Certificate trust settings shared by every dial of a client.
#[derive(Debug, Clone, Default)]
pub(crate) struct TrustConfig {
    /// Extra root certificates (DER or PEM).
    pub root_certs: Vec<Vec<u8>>,
    pub accept_invalid_certs: bool,
}

/// Build a connector for one handshake.
pub(crate) fn configure_ssl(
    fingerprint: Option<&TlsFingerprint>,
    trust: &TrustConfig,
    alpn: AlpnOffer,
) -> Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls_client())
        .map_err(|e| Error::Tls(format!("Failed to create SSL connector: {}", e)))?;

    for cert_bytes in &trust.root_certs {
        let cert = X509::from_der(cert_bytes)
            .or_else(|_| X509::from_pem(cert_bytes))
            .map_err(|e| Error::Tls(format!("Invalid root certificate: {}", e)))?;
        builder
            .cert_store_mut()
            .add_cert(cert)
            .map_err(|e| Error::Tls(format!("Failed to add root certificate: {}", e)))?;
    }
    if trust.accept_invalid_certs {
        builder.set_verify(SslVerifyMode::NONE);
    }

    if let Some(fp) = fingerprint {
        if !fp.cipher_list.is_empty() {
            builder
                .set_cipher_list(&fp.cipher_list.join(":"))
                .map_err(|e| Error::Tls(format!("Failed to set cipher list: {}", e)))?;
        }
        if !fp.curves.is_empty() {
            builder
                .set_curves_list(&fp.curves.join(":"))
                .map_err(|e| Error::Tls(format!("Failed to set curves: {}", e)))?;
        }
        if !fp.sigalgs.is_empty() {
            builder
                .set_sigalgs_list(&fp.sigalgs.join(":"))
                .map_err(|e| Error::Tls(format!("Failed to set signature algorithms: {}", e)))?;
        }
        // Chrome: GREASE plus extension permutation. Firefox permutes without GREASE.
        builder.set_grease_enabled(fp.grease);
        builder.set_permute_extensions(fp.permute_extensions);
    }

    builder
        .set_min_proto_version(Some(SslVersion::TLS1_2))
        .map_err(|e| Error::Tls(format!("Failed to set min TLS version: {}", e)))?;
    builder
        .set_max_proto_version(Some(SslVersion::TLS1_3))
        .map_err(|e| Error::Tls(format!("Failed to set max TLS version: {}", e)))?;

    builder
        .set_alpn_protos(alpn.wire())
        .map_err(|e| Error::Tls(format!("Failed to set ALPN: {}", e)))?;

    Ok(builder.build())
}

/// Run a client handshake over `stream`.
pub(crate) async fn handshake(
    connector: &SslConnector,
    trust: &TrustConfig,
    domain: &str,
    stream: BoxIo,
) -> Result<SslStream<BoxIo>> {
    let mut config = connector
        .configure()
        .map_err(|e| Error::Tls(format!("Failed to configure SSL: {}", e)))?;
    if trust.accept_invalid_certs {
        config.set_verify_hostname(false);
    }
    tokio_boring::connect(config, domain, stream)
        .await
        .map_err(|e| Error::Tls(format!("TLS handshake failed: {}", e)))
}

/// Negotiated ALPN protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnProtocol {
    /// HTTP/2 ("h2")
    H2,
    /// HTTP/1.1 ("http/1.1")
    Http1,
    /// No ALPN negotiated or unknown protocol
    Unknown,
}

impl AlpnProtocol {
    /// Check if HTTP/2 was negotiated.
    pub fn is_h2(&self) -> bool {
        matches!(self, Self::H2)
    }
}

/// Stream that can be either plain or TLS-wrapped.
pub(crate) enum MaybeTlsStream {
    Plain(BoxIo),
    Tls(SslStream<BoxIo>),
}

impl MaybeTlsStream {
    /// Get the negotiated ALPN protocol.
    ///
    /// Plain streams never negotiate ALPN and report `Unknown`.
    pub(crate) fn alpn_protocol(&self) -> AlpnProtocol {
        match self {
            Self::Plain(_) => AlpnProtocol::Unknown,
            Self::Tls(stream) => match stream.ssl().selected_alpn_protocol() {
                Some(b"h2") => AlpnProtocol::H2,
                Some(b"http/1.1") => AlpnProtocol::Http1,
                _ => AlpnProtocol::Unknown,
            },
        }
    }
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alpn_wire_format() {
        assert_eq!(AlpnOffer::H2Http1.wire(), b"\x02h2\x08http/1.1");
        assert_eq!(AlpnOffer::Http1.wire(), b"\x08http/1.1");
    }

    #[test]
    fn test_configure_with_fingerprint() {
        let fp = TlsFingerprint::chrome_131();
        assert!(configure_ssl(Some(&fp), &TrustConfig::default(), AlpnOffer::H2Http1).is_ok());
        assert!(configure_ssl(None, &TrustConfig::default(), AlpnOffer::Http1).is_ok());
    }

    #[test]
    fn test_invalid_root_cert_rejected() {
        let trust = TrustConfig {
            root_certs: vec![b"not a certificate".to_vec()],
            accept_invalid_certs: false,
        };
        assert!(matches!(
            configure_ssl(None, &trust, AlpnOffer::H2Http1),
            Err(Error::Tls(_))
        ));
    }
}
