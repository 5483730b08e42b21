//! QUIC configuration and connection establishment.

use std::sync::Arc;
use std::time::{Duration, Instant};

use boring::ssl::{SslContextBuilder, SslMethod, SslVerifyMode};
use boring::x509::X509;
use tokio::sync::mpsc;

use crate::cancel::Scope;
use crate::error::{Error, Result};
use crate::fingerprint::tls::TlsFingerprint;
use crate::transport::connector::TrustConfig;
use crate::transport::h3::datagram::Datagram;
use crate::transport::h3::driver::H3Driver;
use crate::transport::h3::Http3Conn;
use crate::transport::lifecycle::ConnState;

/// Chrome uses 15663105 (15MB) for initial_max_data
const CHROME_INITIAL_MAX_DATA: u64 = 15_663_105;

/// Idle timeout announced to the server, in milliseconds.
const MAX_IDLE_TIMEOUT_MS: u64 = 30_000;

const MAX_SEND_UDP_PAYLOAD: usize = 1350;

/// Build a QUIC client configuration. Like TCP dials, every QUIC dial gets
/// its own TLS context.
pub(crate) fn quic_config(fp: Option<&TlsFingerprint>, trust: &TrustConfig) -> Result<quiche::Config> {
    let mut ssl = SslContextBuilder::new(SslMethod::tls_client())
        .map_err(|e| Error::Tls(format!("Failed to create SSL context: {}", e)))?;
    ssl.set_default_verify_paths()
        .map_err(|e| Error::Tls(format!("Failed to load system roots: {}", e)))?;
    for cert_bytes in &trust.root_certs {
        let cert = X509::from_der(cert_bytes)
            .or_else(|_| X509::from_pem(cert_bytes))
            .map_err(|e| Error::Tls(format!("Invalid root certificate: {}", e)))?;
        ssl.cert_store_mut()
            .add_cert(cert)
            .map_err(|e| Error::Tls(format!("Failed to add root certificate: {}", e)))?;
    }
    if trust.accept_invalid_certs {
        ssl.set_verify(SslVerifyMode::NONE);
    }

    if let Some(fp) = fp {
        // QUIC is TLS 1.3 only; its suites are fixed by the QUIC stack, so
        // only TLS 1.2 names are applied.
        let tls12: Vec<&str> = fp
            .cipher_list
            .iter()
            .copied()
            .filter(|c| !c.starts_with("TLS_"))
            .collect();
        if !tls12.is_empty() {
            ssl.set_cipher_list(&tls12.join(":"))
                .map_err(|e| Error::Tls(format!("Failed to set cipher list: {}", e)))?;
        }
        if !fp.curves.is_empty() {
            ssl.set_curves_list(&fp.curves.join(":"))
                .map_err(|e| Error::Tls(format!("Failed to set curves: {}", e)))?;
        }
        if !fp.sigalgs.is_empty() {
            ssl.set_sigalgs_list(&fp.sigalgs.join(":"))
                .map_err(|e| Error::Tls(format!("Failed to set signature algorithms: {}", e)))?;
        }
        ssl.set_grease_enabled(fp.grease);
        ssl.set_permute_extensions(fp.permute_extensions);
    }

    let mut config = quiche::Config::with_boring_ssl_ctx_builder(quiche::PROTOCOL_VERSION, ssl)
        .map_err(|e| Error::Quic(format!("Failed to create quiche config: {}", e)))?;
    config.verify_peer(!trust.accept_invalid_certs);
    config
        .set_application_protos(quiche::h3::APPLICATION_PROTOCOL)
        .map_err(|e| Error::Quic(format!("Failed to set ALPN: {}", e)))?;

    // Configure QUIC parameters to match Chrome behavior
    config.set_max_idle_timeout(MAX_IDLE_TIMEOUT_MS);
    config.set_max_recv_udp_payload_size(65535);
    config.set_max_send_udp_payload_size(MAX_SEND_UDP_PAYLOAD);
    config.set_initial_max_data(CHROME_INITIAL_MAX_DATA);
    config.set_initial_max_stream_data_bidi_local(6_291_456);
    config.set_initial_max_stream_data_bidi_remote(6_291_456);
    config.set_initial_max_stream_data_uni(6_291_456);
    config.set_initial_max_streams_bidi(100);
    config.set_initial_max_streams_uni(103);
    config.set_disable_active_migration(true);

    Ok(config)
}

/// Run the QUIC handshake over `dgram` and start the connection driver.
pub(crate) async fn connect(
    dgram: Datagram,
    server_name: &str,
    mut config: quiche::Config,
    handshake_timeout: Option<Duration>,
    parent: &Scope,
) -> Result<Http3Conn> {
    let dgram = Arc::new(dgram);
    let local = dgram.local_addr()?;
    let peer = dgram.peer();

    let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
    getrandom::fill(&mut scid).map_err(|e| Error::Quic(format!("RNG error: {}", e)))?;
    let scid = quiche::ConnectionId::from_ref(&scid);

    let mut conn = quiche::connect(Some(server_name), &scid, local, peer, &mut config)
        .map_err(|e| Error::Quic(format!("Connect failed: {}", e)))?;

    // Drive the handshake here so failures surface before the driver exists.
    let mut buf = vec![0u8; 65535];
    let mut out = vec![0u8; MAX_SEND_UDP_PAYLOAD];
    let start = Instant::now();
    loop {
        loop {
            match conn.send(&mut out) {
                Ok((len, _)) => dgram.send(&out[..len]).await?,
                Err(quiche::Error::Done) => break,
                Err(e) => return Err(Error::Quic(format!("Send error: {}", e))),
            }
        }

        if conn.is_established() {
            break;
        }
        if conn.is_closed() {
            let reason = conn
                .peer_error()
                .or(conn.local_error())
                .map(|e| String::from_utf8_lossy(&e.reason).into_owned())
                .unwrap_or_default();
            return Err(Error::Quic(format!(
                "Connection closed during handshake {}",
                reason
            )));
        }
        if let Some(limit) = handshake_timeout {
            if start.elapsed() > limit {
                return Err(Error::TlsHandshakeTimeout(limit));
            }
        }

        let wait = conn.timeout().unwrap_or(Duration::from_millis(100));
        match tokio::time::timeout(wait, dgram.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                let info = quiche::RecvInfo { from: peer, to: local };
                if let Err(e) = conn.recv(&mut buf[..len], info) {
                    tracing::trace!("h3: handshake recv error: {}", e);
                }
            }
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => conn.on_timeout(),
        }
    }

    let h3_config =
        quiche::h3::Config::new().map_err(|e| Error::Quic(format!("H3 Config error: {}", e)))?;
    let h3_conn = quiche::h3::Connection::with_transport(&mut conn, &h3_config)
        .map_err(|e| Error::Quic(format!("H3 Init error: {}", e)))?;

    let state = ConnState::new(parent);
    let (tx, rx) = mpsc::channel(32);
    let driver = H3Driver::new(rx, conn, h3_conn, dgram, local, state.force.clone());
    let conn_id = state.id;
    tokio::spawn(async move {
        if let Err(e) = driver.drive().await {
            tracing::debug!("h3: conn {} driver stopped: {}", conn_id, e);
        }
    });

    tracing::debug!("h3: conn {} established with {} via {}", state.id, server_name, peer);
    Ok(Http3Conn::new(state, tx))
}
