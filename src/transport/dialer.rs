//! Connection establishment: TCP, proxy chains, TLS and protocol selection.
//!
//! A dial walks the proxy chain hop by hop. Each hop is reached through the
//! tunnel opened by the previous one; the last hop tunnels to the
//! destination. HTTP/3 needs UDP, so through a proxy it only works when the
//! last hop is SOCKS5 and can open a UDP relay.

use std::net::SocketAddr;

use crate::cancel::Scope;
use crate::error::{Error, Result};
use crate::fingerprint::{Http2Settings, TlsFingerprint};
use crate::proxy::{Proxy, ProxyScheme};
use crate::timeouts::{bounded, Timeouts};
use crate::transport::connector::{configure_ssl, handshake, AlpnOffer, AlpnProtocol, BoxIo, MaybeTlsStream, TrustConfig};
use crate::transport::h1::Http1Conn;
use crate::transport::h3::{self, Datagram};
use crate::transport::resolve::Target;
use crate::transport::socks5::{self, TargetAddr};
use crate::transport::tcp::{self, TcpOptions};
use crate::transport::{h2, tunnel, Pipeline};

/// Everything a single dial needs.
pub(crate) struct DialRequest<'a> {
    /// Proxy hops in dial order. Empty means direct.
    pub(crate) chain: &'a [Proxy],
    pub(crate) target: &'a Target,
    pub(crate) timeouts: &'a Timeouts,
    pub(crate) tls_fingerprint: Option<&'a TlsFingerprint>,
    pub(crate) http2_settings: &'a Http2Settings,
    pub(crate) alpn: AlpnOffer,
    pub(crate) http3: bool,
    /// Scope the new connection's force scope hangs off.
    pub(crate) parent: &'a Scope,
}

/// Client-wide dial settings.
#[derive(Debug, Clone, Default)]
pub(crate) struct Dialer {
    tcp: TcpOptions,
    trust: TrustConfig,
}

impl Dialer {
    pub(crate) fn new(tcp: TcpOptions, trust: TrustConfig) -> Self {
        Self { tcp, trust }
    }

    pub(crate) async fn dial(&self, req: DialRequest<'_>) -> Result<Pipeline> {
        if req.http3 {
            return self.dial_h3(&req).await;
        }

        let target = req.target;
        let stream = bounded(
            req.timeouts.dial,
            self.tunnel(req.chain, &target.host, target.port),
            Error::DialTimeout,
        )
        .await?;

        if !target.scheme.is_tls() {
            tracing::debug!("dialer: plain connection to {}", target.authority());
            return Ok(Pipeline::Http1(Http1Conn::new(
                MaybeTlsStream::Plain(stream),
                req.parent,
            )));
        }

        let stage = match req.tls_fingerprint {
            Some(_) => "fingerprint tls handshake",
            None => "tls handshake",
        };
        let tls = bounded(
            req.timeouts.tls_handshake,
            async {
                let connector = configure_ssl(req.tls_fingerprint, &self.trust, req.alpn)?;
                handshake(&connector, &self.trust, &target.host, stream).await
            },
            Error::TlsHandshakeTimeout,
        )
        .await
        .map_err(|e| e.staged(stage))?;

        let stream = MaybeTlsStream::Tls(tls);
        match stream.alpn_protocol() {
            AlpnProtocol::H2 => {
                tracing::debug!("dialer: negotiated h2 with {}", target.authority());
                let conn = h2::handshake(stream, req.http2_settings, req.parent)
                    .await
                    .map_err(|e| e.staged("http2 handshake"))?;
                Ok(Pipeline::Http2(conn))
            }
            _ => {
                tracing::debug!("dialer: using http/1.1 with {}", target.authority());
                Ok(Pipeline::Http1(Http1Conn::new(stream, req.parent)))
            }
        }
    }

    /// Open a byte stream to `host:port` through `chain`.
    async fn tunnel(&self, chain: &[Proxy], host: &str, port: u16) -> Result<BoxIo> {
        let (first_host, first_port) = match chain.first() {
            Some(hop) => (hop.host.as_str(), hop.port),
            None => (host, port),
        };
        let tcp = tcp::connect(first_host, first_port, &self.tcp)
            .await
            .map_err(|e| e.staged("dial"))?;
        let mut stream: BoxIo = Box::new(tcp);

        for (i, hop) in chain.iter().enumerate() {
            let (next_host, next_port) = match chain.get(i + 1) {
                Some(next) => (next.host.as_str(), next.port),
                None => (host, port),
            };
            stream = self.through(stream, hop, next_host, next_port).await?;
        }
        Ok(stream)
    }

    /// Ask `hop` (reached through `stream`) to connect onwards.
    async fn through(&self, stream: BoxIo, hop: &Proxy, host: &str, port: u16) -> Result<BoxIo> {
        match hop.scheme {
            ProxyScheme::Socks5 { .. } => {
                let target = TargetAddr::for_proxy(hop, host, port).await?;
                socks5::connect(stream, hop, &target)
                    .await
                    .map_err(|e| e.staged("socks5 connect"))
            }
            ProxyScheme::Https => {
                let connector = configure_ssl(None, &self.trust, AlpnOffer::Http1)?;
                let tls = handshake(&connector, &self.trust, &hop.host, stream)
                    .await
                    .map_err(|e| e.staged("proxy tls handshake"))?;
                tunnel::connect(Box::new(tls), hop, host, port)
                    .await
                    .map_err(|e| e.staged("http connect"))
            }
            ProxyScheme::Http => tunnel::connect(stream, hop, host, port)
                .await
                .map_err(|e| e.staged("http connect")),
        }
    }

    async fn dial_h3(&self, req: &DialRequest<'_>) -> Result<Pipeline> {
        check_h3(req.chain, req.target)?;
        let target = req.target;

        let dgram = match req.chain.split_last() {
            None => {
                let peer = resolve(&target.host, target.port).await?;
                Datagram::direct(peer).await?
            }
            Some((last, before)) => {
                let control = bounded(
                    req.timeouts.dial,
                    self.tunnel(before, &last.host, last.port),
                    Error::DialTimeout,
                )
                .await?;
                let (control, relay) = socks5::udp_associate(control, last)
                    .await
                    .map_err(|e| e.staged("socks5 udp associate"))?;
                let dest = TargetAddr::for_proxy(last, &target.host, target.port).await?;
                Datagram::relay(control, relay, &dest).await?
            }
        };

        let config = h3::quic_config(req.tls_fingerprint, &self.trust)?;
        let conn = h3::connect(
            dgram,
            &target.host,
            config,
            req.timeouts.tls_handshake,
            req.parent,
        )
        .await
        .map_err(|e| e.staged("quic handshake"))?;
        tracing::debug!("dialer: negotiated h3 with {}", target.authority());
        Ok(Pipeline::Http3(conn))
    }
}

/// HTTP/3 needs a TLS destination and, behind proxies, a SOCKS5 last hop.
pub(crate) fn check_h3(chain: &[Proxy], target: &Target) -> Result<()> {
    if !target.scheme.is_tls() || target.scheme.is_websocket() {
        return Err(Error::config(format!(
            "HTTP/3 requires an https URL, got {}",
            target.authority()
        )));
    }
    if let Some(last) = chain.last() {
        if !last.scheme.is_socks5() {
            return Err(Error::config(format!(
                "HTTP/3 cannot run through {} proxy {}; the last hop must be socks5",
                last.scheme.as_str(),
                last
            )));
        }
    }
    Ok(())
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::connection(format!("DNS resolution failed for {}: {}", host, e)))?
        .next()
        .ok_or_else(|| Error::connection(format!("No addresses found for {}", host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::resolve::Scheme;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn target(scheme: Scheme, host: &str, port: u16) -> Target {
        Target {
            scheme,
            host: host.to_string(),
            port,
        }
    }

    fn request<'a>(
        chain: &'a [Proxy],
        target: &'a Target,
        timeouts: &'a Timeouts,
        settings: &'a Http2Settings,
        parent: &'a Scope,
        http3: bool,
    ) -> DialRequest<'a> {
        DialRequest {
            chain,
            target,
            timeouts,
            tls_fingerprint: None,
            http2_settings: settings,
            alpn: AlpnOffer::H2Http1,
            http3,
            parent,
        }
    }

    #[test]
    fn test_h3_rejects_http_proxy_last_hop() {
        let https = target(Scheme::Https, "example.com", 443);
        let chain = vec![
            Proxy::parse("socks5://a.local:1080").unwrap(),
            Proxy::parse("http://b.local:8080").unwrap(),
        ];
        assert!(matches!(check_h3(&chain, &https), Err(Error::Config(_))));

        let chain = vec![
            Proxy::parse("http://a.local:8080").unwrap(),
            Proxy::parse("socks5h://b.local:1080").unwrap(),
        ];
        assert!(check_h3(&chain, &https).is_ok());
        assert!(check_h3(&[], &https).is_ok());
    }

    #[test]
    fn test_h3_rejects_plain_scheme() {
        let http = target(Scheme::Http, "example.com", 80);
        assert!(matches!(check_h3(&[], &http), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_h3_config_error_is_not_dialed() {
        let dialer = Dialer::default();
        let https = target(Scheme::Https, "example.com", 443);
        let chain = vec![Proxy::parse("http://127.0.0.1:9").unwrap()];
        let (timeouts, settings, parent) = (Timeouts::none(), Http2Settings::default(), Scope::new());
        let result = dialer
            .dial(request(&chain, &https, &timeouts, &settings, &parent, true))
            .await;
        assert!(matches!(result.err(), Some(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_plain_dial_yields_http1() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let dialer = Dialer::default();
        let http = target(Scheme::Http, "127.0.0.1", port);
        let (timeouts, settings, parent) = (Timeouts::none(), Http2Settings::default(), Scope::new());
        let pipeline = dialer
            .dial(request(&[], &http, &timeouts, &settings, &parent, false))
            .await
            .unwrap();
        assert_eq!(pipeline.version(), crate::version::HttpVersion::Http1_1);
        accept.await.unwrap();

        parent.cancel();
        assert!(pipeline.state().force.is_cancelled());
    }

    #[tokio::test]
    async fn test_dial_through_http_proxy_chain() {
        // Two CONNECT proxies in a row, the second one answering for the target.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let proxy = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            let mut buf = [0u8; 512];
            for expected in ["CONNECT hop2.local:3128", "CONNECT target.local:80"] {
                while !String::from_utf8_lossy(&seen).contains("\r\n\r\n") {
                    let n = sock.read(&mut buf).await.unwrap();
                    seen.extend_from_slice(&buf[..n]);
                }
                assert!(String::from_utf8_lossy(&seen).starts_with(expected));
                seen.clear();
                sock.write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                    .await
                    .unwrap();
            }
            sock
        });

        let chain = vec![
            Proxy::parse(&format!("http://127.0.0.1:{}", port)).unwrap(),
            Proxy::parse("http://hop2.local:3128").unwrap(),
        ];
        let dialer = Dialer::default();
        let http = target(Scheme::Http, "target.local", 80);
        let (timeouts, settings, parent) = (
            Timeouts::none().dial(Duration::from_secs(5)),
            Http2Settings::default(),
            Scope::new(),
        );
        let pipeline = dialer
            .dial(request(&chain, &http, &timeouts, &settings, &parent, false))
            .await
            .unwrap();
        assert_eq!(pipeline.version(), crate::version::HttpVersion::Http1_1);
        proxy.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_dial_is_staged() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = Dialer::default();
        let http = target(Scheme::Http, "127.0.0.1", port);
        let (timeouts, settings, parent) = (Timeouts::none(), Http2Settings::default(), Scope::new());
        let err = dialer
            .dial(request(&[], &http, &timeouts, &settings, &parent, false))
            .await
            .err()
            .unwrap();
        assert_eq!(err.stage(), Some("dial"));
        assert!(err.is_retryable());
    }
}
