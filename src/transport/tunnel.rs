//! HTTP CONNECT tunnelling through HTTP and HTTPS proxies.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::proxy::Proxy;
use crate::transport::connector::BoxIo;

/// Maximum size of a proxy's CONNECT response head.
const MAX_CONNECT_RESPONSE: usize = 16 * 1024;

/// Ask `proxy` (already connected through `stream`) to open a tunnel to
/// `host:port`.
pub(crate) async fn connect(mut stream: BoxIo, proxy: &Proxy, host: &str, port: u16) -> Result<BoxIo> {
    let authority = authority(host, port);
    let mut request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: Keep-Alive\r\n"
    );
    if let Some(auth) = &proxy.auth {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth.basic_header()));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    // Read byte-wise up to the end of the head so no tunnelled bytes are consumed.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_CONNECT_RESPONSE {
            return Err(Error::proxy("CONNECT response too large"));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::proxy(format!(
                "proxy {} closed the connection during CONNECT",
                proxy
            )));
        }
        head.push(byte[0]);
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(&head)
        .map_err(|e| Error::proxy(format!("invalid CONNECT response: {}", e)))?;
    match response.code {
        Some(code) if (200..300).contains(&code) => {
            tracing::trace!("dialer: tunnel to {} via {} established", authority, proxy);
            Ok(stream)
        }
        Some(407) => Err(Error::proxy(format!(
            "proxy {} requires authentication (407)",
            proxy
        ))),
        Some(code) => Err(Error::proxy(format!(
            "proxy {} refused CONNECT to {}: {} {}",
            proxy,
            authority,
            code,
            response.reason.unwrap_or("")
        ))),
        None => Err(Error::proxy("CONNECT response without status")),
    }
}

fn authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
