//! HTTP responses with streamed bodies and explicit decompression.

use std::fmt;
use std::io::Read;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use url::Url;

use crate::cancel::Scope;
use crate::error::{Error, Result};
use crate::timeouts::recv_with_idle_timeout;
use crate::transport::h1::Upgraded;
use crate::version::HttpVersion;

/// An HTTP response.
///
/// The body is pulled lazily with [`Response::chunk`] or collected with
/// [`Response::bytes`] / [`Response::text`] / [`Response::json`]. Dropping a
/// response with unread body lets the connection drain it in the background
/// before going back to its pool.
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    version: HttpVersion,
    url: Url,
    body: ResponseBody,
    upgrade: Option<Upgraded>,
    guard: Option<ScopeGuard>,
}

/// Cancels the request's scope once the response is gone.
struct ScopeGuard(Scope);

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

pub(crate) enum ResponseBody {
    Empty,
    Full(Bytes),
    Channel(ChannelBody),
}

/// Receiving side of a body pump.
pub(crate) struct ChannelBody {
    rx: mpsc::Receiver<Result<Bytes>>,
    read_idle: Option<Duration>,
    /// Cancelled when the caller gives up mid-body so the pump stops.
    abort: Scope,
    done: bool,
}

impl ChannelBody {
    pub(crate) fn new(
        rx: mpsc::Receiver<Result<Bytes>>,
        read_idle: Option<Duration>,
        abort: Scope,
    ) -> Self {
        Self {
            rx,
            read_idle,
            abort,
            done: false,
        }
    }

    async fn next(&mut self, caller: Option<&Scope>) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        let read_idle = self.read_idle;
        let rx = &mut self.rx;
        let outcome = tokio::select! {
            biased;
            _ = cancelled(caller) => Err(caller.map(Scope::err).unwrap_or(Error::Closed)),
            received = recv(rx, read_idle) => received,
        };
        match outcome {
            Ok(Some(Ok(chunk))) => Ok(Some(chunk)),
            Ok(Some(Err(e))) => {
                self.done = true;
                Err(e)
            }
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            Err(e) => {
                tracing::debug!("response: abandoning body: {}", e);
                self.done = true;
                self.abort.cancel();
                self.rx.close();
                Err(e)
            }
        }
    }
}

async fn cancelled(scope: Option<&Scope>) {
    match scope {
        Some(scope) => scope.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn recv(
    rx: &mut mpsc::Receiver<Result<Bytes>>,
    read_idle: Option<Duration>,
) -> Result<Option<Result<Bytes>>> {
    match read_idle {
        Some(idle) => recv_with_idle_timeout(rx, idle).await,
        None => Ok(rx.recv().await),
    }
}

impl ResponseBody {
    async fn next(&mut self, caller: Option<&Scope>) -> Result<Option<Bytes>> {
        match self {
            Self::Empty => Ok(None),
            Self::Full(bytes) => {
                let bytes = std::mem::take(bytes);
                Ok((!bytes.is_empty()).then_some(bytes))
            }
            Self::Channel(channel) => channel.next(caller).await,
        }
    }
}

impl Response {
    /// Build a fully buffered response.
    pub fn new(status: u16, headers: Vec<(String, String)>, body: impl Into<Bytes>, url: Url) -> Self {
        Self::with_body(
            status,
            headers,
            HttpVersion::Http1_1,
            url,
            ResponseBody::Full(body.into()),
        )
    }

    pub(crate) fn with_body(
        status: u16,
        headers: Vec<(String, String)>,
        version: HttpVersion,
        url: Url,
        body: ResponseBody,
    ) -> Self {
        Self {
            status,
            headers,
            version,
            url,
            body,
            upgrade: None,
            guard: None,
        }
    }

    pub(crate) fn set_upgrade(&mut self, upgraded: Upgraded) {
        self.upgrade = Some(upgraded);
    }

    /// Tie `scope` to this response: body reads fail once it is cancelled,
    /// and it is cancelled when the response is dropped.
    pub(crate) fn guard_scope(&mut self, scope: Scope) {
        self.guard = Some(ScopeGuard(scope));
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    /// The URL that was requested.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.header("Content-Encoding")
    }

    /// Whether this is a server-sent event stream.
    pub fn is_event_stream(&self) -> bool {
        self.content_type()
            .map(|ct| ct.to_ascii_lowercase().contains("text/event-stream"))
            .unwrap_or(false)
    }

    /// Take the upgraded connection of a `101 Switching Protocols` response.
    pub fn upgrade(&mut self) -> Option<Upgraded> {
        self.upgrade.take()
    }

    /// Next raw body chunk, or `None` at the end of the body.
    ///
    /// Fails with [`Error::ReadIdleTimeout`] when no chunk arrives within the
    /// read idle timeout, and with the request's cancellation cause (such as
    /// [`Error::TotalTimeout`]) when the request is cancelled mid-body.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>> {
        let caller = self.guard.as_ref().map(|g| g.0.clone());
        self.body.next(caller.as_ref()).await
    }

    /// Collect the raw body.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Collect the body and decode it based on Content-Encoding (gzip,
    /// deflate, br, zstd).
    pub async fn decoded_bytes(self) -> Result<Bytes> {
        let encoding = self.content_encoding().map(|s| s.to_ascii_lowercase());
        let raw = self.bytes().await?;
        decode_body(encoding.as_deref(), raw)
    }

    pub async fn text(self) -> Result<String> {
        let decoded = self.decoded_bytes().await?;
        String::from_utf8(decoded.to_vec())
            .map_err(|e| Error::Decompression(format!("UTF-8 decode error: {}", e)))
    }

    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        let decoded = self.decoded_bytes().await?;
        serde_json::from_slice(&decoded).map_err(Error::from)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("upgrade", &self.upgrade.is_some())
            .finish()
    }
}

fn decode_body(encoding: Option<&str>, body: Bytes) -> Result<Bytes> {
    match encoding {
        Some("gzip") | Some("x-gzip") => decode_gzip(&body),
        Some("deflate") => decode_deflate(&body),
        Some("br") => decode_brotli(&body),
        Some("zstd") => decode_zstd(&body),
        _ => {
            // Check magic bytes when Content-Encoding is missing
            if body.starts_with(&[0x28, 0xB5, 0x2F, 0xFD]) {
                return decode_zstd(&body);
            }
            if body.starts_with(&[0x1f, 0x8b]) {
                return decode_gzip(&body);
            }
            Ok(body)
        }
    }
}

fn decode_gzip(data: &[u8]) -> Result<Bytes> {
    let mut decoder = flate2::read::GzDecoder::new(data);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(|e| Error::Decompression(format!("gzip: {}", e)))?;
    Ok(Bytes::from(decoded))
}

fn decode_deflate(data: &[u8]) -> Result<Bytes> {
    let mut decoded = Vec::new();
    if flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut decoded)
        .is_ok()
    {
        return Ok(Bytes::from(decoded));
    }
    decoded.clear();
    flate2::read::DeflateDecoder::new(data)
        .read_to_end(&mut decoded)
        .map_err(|e| Error::Decompression(format!("deflate: {}", e)))?;
    Ok(Bytes::from(decoded))
}

fn decode_brotli(data: &[u8]) -> Result<Bytes> {
    let mut decoder = brotli::Decompressor::new(data, 4096);
    let mut decoded = Vec::new();
    decoder
        .read_to_end(&mut decoded)
        .map_err(|e| Error::Decompression(format!("brotli: {}", e)))?;
    Ok(Bytes::from(decoded))
}

fn decode_zstd(data: &[u8]) -> Result<Bytes> {
    zstd::stream::decode_all(data)
        .map(Bytes::from)
        .map_err(|e| Error::Decompression(format!("zstd: {}", e)))
}
