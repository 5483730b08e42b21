//! HTTP/2 connection pipeline on top of hyper.
//!
//! hyper owns framing and flow control. This module maps the connection onto
//! the same write/read lifecycle as HTTP/1.1: the write phase ends when hyper
//! drops the request body, the read phase ends when the body pump reaches
//! end of stream. One request runs at a time per connection.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use http_body::{Frame, SizeHint};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http2;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::body::Body;
use crate::cancel::Scope;
use crate::error::{Error, Result};
use crate::fingerprint::Http2Settings;
use crate::request::RequestHead;
use crate::response::{ChannelBody, Response, ResponseBody};
use crate::timeouts::bounded;
use crate::transport::connector::MaybeTlsStream;
use crate::transport::lifecycle::{
    poolable, ConnState, Delivery, Exchange, ExecOptions, Failure, BODY_QUEUE_CAPACITY,
};
use crate::version::HttpVersion;

/// Headers that are connection-specific and forbidden in HTTP/2
/// (RFC 9113 Section 8.2.2).
const CONNECTION_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

/// How long a finished read waits for its write phase.
const WRITE_SETTLE: Duration = Duration::from_millis(20);

pub(crate) struct Http2Conn {
    state: Arc<ConnState>,
    sender: http2::SendRequest<OutgoingBody>,
}

/// Perform the HTTP/2 preface and SETTINGS exchange and spawn the connection
/// task. The task ends with the connection's force scope.
pub(crate) async fn handshake(
    stream: MaybeTlsStream,
    settings: &Http2Settings,
    parent: &Scope,
) -> Result<Http2Conn> {
    let mut builder = http2::Builder::new(TokioExecutor::new());
    builder
        .adaptive_window(false)
        .initial_stream_window_size(settings.initial_window_size)
        .initial_connection_window_size(settings.initial_connection_window_size)
        .max_frame_size(settings.max_frame_size)
        .max_header_list_size(settings.max_header_list_size);

    let (sender, conn) = builder
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| Error::HttpProtocol(format!("HTTP/2 handshake failed: {}", e)))?;

    let state = ConnState::new(parent);
    let force = state.force.clone();
    let id = state.id;
    tokio::spawn(async move {
        tokio::select! {
            _ = force.cancelled() => {}
            result = conn => match result {
                Ok(()) => {
                    tracing::debug!("h2: conn {} closed", id);
                    force.cancel();
                }
                Err(e) => {
                    tracing::debug!("h2: conn {} failed: {}", id, e);
                    force.cancel_with(Error::connection(format!("HTTP/2 connection error: {}", e)));
                }
            }
        }
    });

    Ok(Http2Conn { state, sender })
}

impl Http2Conn {
    pub(crate) fn state(&self) -> &Arc<ConnState> {
        &self.state
    }

    pub(crate) async fn execute(&self, exchange: Exchange) -> std::result::Result<Response, Failure> {
        let Exchange { head, body, opts } = exchange;

        let builder = match request_builder(&head, &body, &opts) {
            Ok(b) => b,
            Err(e) => return Err(Failure::new(e, Some(body))),
        };
        let turn = match self.state.begin() {
            Ok(turn) => turn,
            Err(e) => return Err(Failure::new(e, Some(body))),
        };

        let len = body.content_length();
        let shared = Arc::new(Mutex::new(Some(body)));
        let outgoing = OutgoingBody {
            body: shared.clone(),
            yielded: false,
            len,
            write: turn.write.clone(),
        };
        let request = match builder.body(outgoing) {
            Ok(r) => r,
            Err(e) => {
                self.state.close();
                let body = shared.lock().take();
                return Err(Failure::new(Error::http_protocol(e.to_string()), body));
            }
        };

        tracing::trace!(
            "h2: conn {} sending {} {} (reused: {})",
            self.state.id,
            head.method,
            head.url,
            turn.reused
        );

        let mut sender = self.sender.clone();
        let force = &self.state.force;
        let caller = &opts.scope;
        let reused = turn.reused;
        let result = bounded(
            opts.response_header,
            async {
                tokio::select! {
                    biased;
                    _ = force.cancelled() => Err(force.err()),
                    _ = caller.cancelled() => Err(caller.err()),
                    r = async {
                        sender.ready().await?;
                        sender.send_request(request).await
                    } => r.map_err(|e| classify(e, reused)),
                }
            },
            Error::ResponseHeaderTimeout,
        )
        .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("h2: conn {} request failed: {}", self.state.id, e);
                self.state.close();
                let body = shared.lock().take();
                return Err(Failure::new(e, body));
            }
        };

        let (parts, incoming) = response.into_parts();
        let headers: Vec<(String, String)> = parts
            .headers
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    String::from_utf8_lossy(v.as_bytes()).into_owned(),
                )
            })
            .collect();

        let (tx, rx) = mpsc::channel(BODY_QUEUE_CAPACITY);
        let abort = self.state.force.child();
        let pump = StreamPump {
            state: self.state.clone(),
            write: turn.write.clone(),
            read: turn.read.clone(),
            abort: abort.clone(),
            reuse: opts.keep_alive && poolable(parts.status.as_u16(), &headers),
        };
        // A dropped stream is reset on its own; nothing needs discarding.
        tokio::spawn(pump.run(incoming, Delivery::new(tx, 0)));

        Ok(Response::with_body(
            parts.status.as_u16(),
            headers,
            HttpVersion::Http2,
            head.url.clone(),
            ResponseBody::Channel(ChannelBody::new(rx, opts.read_idle, abort)),
        ))
    }

    /// Resolves once the connection task has ended.
    pub(crate) async fn idle_closed(&self) {
        self.state.force.cancelled().await;
    }
}

/// A closed or cancelled request on a connection that already served one
/// means the peer went away while it sat idle.
fn classify(e: hyper::Error, reused: bool) -> Error {
    if reused && (e.is_closed() || e.is_canceled()) {
        return Error::StaleConnection;
    }
    if e.is_closed() || e.is_canceled() || e.is_incomplete_message() {
        return Error::connection(format!("HTTP/2 request failed: {}", e));
    }
    Error::HttpProtocol(format!("HTTP/2 request failed: {}", e))
}

fn request_builder(
    head: &RequestHead,
    body: &Body,
    opts: &ExecOptions,
) -> Result<http::request::Builder> {
    let url = &head.url;
    let host = url
        .host_str()
        .ok_or_else(|| Error::config(format!("URL has no host: {}", url)))?;
    let authority = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let path = match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    };
    let scheme = match url.scheme() {
        "http" | "ws" => "http",
        _ => "https",
    };
    let uri = format!("{}://{}{}", scheme, authority, path);

    let mut headers = head.headers.clone();
    headers.remove("Content-Length");
    let needs_length = body.content_length().filter(|&len| {
        len > 0 || !body.is_empty() || matches!(head.method, Method::POST | Method::PUT | Method::PATCH)
    });
    if let Some(len) = needs_length {
        headers.insert("Content-Length", len.to_string());
    }
    if let Some(order) = &opts.h2_header_order {
        headers.reorder(order);
    }
    headers.validate()?;

    let mut builder = http::Request::builder()
        .method(head.method.clone())
        .uri(uri)
        .version(http::Version::HTTP_2);
    for (name, value) in headers.iter() {
        let lower = name.to_ascii_lowercase();
        if CONNECTION_HEADERS.contains(&lower.as_str()) {
            continue;
        }
        // TE is only allowed with "trailers" in HTTP/2.
        if lower == "te" && !value.eq_ignore_ascii_case("trailers") {
            continue;
        }
        builder = builder.header(lower, value);
    }
    Ok(builder)
}

/// Request body as hyper sees it. The body itself stays reachable through
/// the shared slot so a failed request can hand it back.
pub(crate) struct OutgoingBody {
    body: Arc<Mutex<Option<Body>>>,
    yielded: bool,
    len: Option<u64>,
    /// Cancelled when hyper is done with the body.
    write: Scope,
}

impl http_body::Body for OutgoingBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<std::result::Result<Frame<Bytes>, io::Error>>> {
        let this = self.get_mut();
        let mut guard = this.body.lock();
        let Some(body) = guard.as_mut() else {
            return Poll::Ready(None);
        };
        match ready!(body.poll_chunk(cx, &mut this.yielded)) {
            Ok(Some(chunk)) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
            Ok(None) => {
                drop(guard);
                this.write.cancel();
                Poll::Ready(None)
            }
            Err(e) => Poll::Ready(Some(Err(e))),
        }
    }

    fn is_end_stream(&self) -> bool {
        self.len == Some(0)
    }

    fn size_hint(&self) -> SizeHint {
        match self.len {
            Some(n) => SizeHint::with_exact(n),
            None => SizeHint::default(),
        }
    }
}

impl Drop for OutgoingBody {
    fn drop(&mut self) {
        self.write.cancel();
    }
}

/// Moves one response stream to the caller.
struct StreamPump {
    state: Arc<ConnState>,
    write: Scope,
    read: Scope,
    /// Cancelled by the caller's body when it gives up.
    abort: Scope,
    /// Park the connection once the stream ends cleanly.
    reuse: bool,
}

impl StreamPump {
    async fn run(self, mut incoming: Incoming, mut delivery: Delivery) {
        let force = self.state.force.clone();
        let outcome: Result<bool> = async {
            loop {
                let frame = tokio::select! {
                    biased;
                    _ = force.cancelled() => return Err(force.err()),
                    _ = self.abort.cancelled() => return Ok(false),
                    f = incoming.frame() => f,
                };
                match frame {
                    None => return Ok(true),
                    Some(Err(e)) => {
                        return Err(Error::http_protocol(format!("HTTP/2 body error: {}", e)))
                    }
                    Some(Ok(frame)) => {
                        // Trailers are not surfaced.
                        if let Ok(data) = frame.into_data() {
                            if !delivery.deliver(data, &force).await {
                                return Ok(false);
                            }
                        }
                    }
                }
            }
        }
        .await;
        drop(incoming);

        match outcome {
            Ok(complete) => {
                if !complete {
                    tracing::debug!("h2: conn {} stream abandoned by caller", self.state.id);
                }
                self.finish(delivery).await
            }
            Err(e) => {
                tracing::debug!("h2: conn {} body read failed: {}", self.state.id, e);
                delivery.fail(e.staged("failed to read response body")).await;
                self.state.close();
            }
        }
    }

    async fn finish(self, delivery: Delivery) {
        let write_done = self.write.is_cancelled()
            || tokio::time::timeout(WRITE_SETTLE, self.write.cancelled())
                .await
                .is_ok();
        if !write_done {
            tracing::debug!(
                "h2: conn {} read finished before write, closing",
                self.state.id
            );
            self.state
                .close_with(Error::LastTaskRunning.staged("last task not write done with read done"));
            drop(delivery);
            return;
        }

        if !self.reuse || self.state.force.is_cancelled() {
            self.state.close();
            drop(delivery);
            return;
        }

        self.state.set_reusable(true);
        let parked = self.state.park_signal();
        self.read.cancel();
        tokio::select! {
            _ = parked => {}
            _ = self.state.force.cancelled() => {}
        }
        drop(delivery);
    }
}
