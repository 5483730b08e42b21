//! HTTP/1.1 connection pipeline.
//!
//! Each request runs as two phases over one socket. A spawned write task
//! sends the head and body while the read phase parses the response head and
//! then hands the body to a pump task feeding a bounded queue. The next
//! request is admitted only after both phases are done; a read that finishes
//! while the write is still running closes the connection.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::Method;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
    ReadBuf, ReadHalf, WriteHalf,
};
use tokio::sync::mpsc;

use crate::body::Body;
use crate::cancel::Scope;
use crate::error::{Error, Result};
use crate::request::RequestHead;
use crate::response::{ChannelBody, Response, ResponseBody};
use crate::timeouts::bounded;
use crate::transport::connector::MaybeTlsStream;
use crate::transport::lifecycle::{
    poolable, slot, ConnState, Delivery, Exchange, ExecOptions, Failure, Slot,
    BODY_QUEUE_CAPACITY, DISCARD_LIMIT,
};
use crate::version::HttpVersion;

/// Maximum size for response headers (64KB)
const MAX_HEADERS_SIZE: usize = 64 * 1024;

/// Maximum number of headers to parse
const MAX_HEADERS_COUNT: usize = 100;

/// Read buffer size for the socket.
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// How long a finished read waits for its write phase before giving up on
/// the connection.
const WRITE_SETTLE: Duration = Duration::from_millis(20);

type Reader = BufReader<ReadHalf<MaybeTlsStream>>;
type Writer = BufWriter<WriteHalf<MaybeTlsStream>>;

/// An HTTP/1.1 connection.
pub(crate) struct Http1Conn {
    state: Arc<ConnState>,
    reader: Slot<Reader>,
    writer: Slot<Writer>,
}

/// How the request body goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestFraming {
    Length(u64),
    Chunked,
}

/// How the response body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseFraming {
    Empty,
    Length(u64),
    Chunked,
    /// Read until the server closes.
    Close,
    /// The connection switches protocols.
    Upgrade,
}

/// Parsed response head.
#[derive(Debug)]
struct Head {
    status: u16,
    /// Minor HTTP version (0 for HTTP/1.0).
    minor: u8,
    headers: Vec<(String, String)>,
}

impl Http1Conn {
    pub(crate) fn new(stream: MaybeTlsStream, parent: &Scope) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            state: ConnState::new(parent),
            reader: slot(BufReader::with_capacity(READ_BUFFER_SIZE, read_half)),
            writer: slot(BufWriter::new(write_half)),
        }
    }

    pub(crate) fn state(&self) -> &Arc<ConnState> {
        &self.state
    }

    /// Run one request. On failure the request body is handed back whenever
    /// the pipeline still has it.
    pub(crate) async fn execute(&self, exchange: Exchange) -> std::result::Result<Response, Failure> {
        let Exchange { head, body, opts } = exchange;

        let (wire_head, framing) = match encode_head(&head, &body, &opts) {
            Ok(encoded) => encoded,
            Err(e) => return Err(Failure::new(e, Some(body))),
        };

        let turn = match self.state.begin() {
            Ok(turn) => turn,
            Err(e) => return Err(Failure::new(e, Some(body))),
        };

        let writer = self.writer.lock().await.take();
        let reader = self.reader.lock().await.take();
        let (writer, mut reader) = match (writer, reader) {
            (Some(w), Some(r)) => (w, r),
            _ => {
                self.state.close();
                return Err(Failure::new(Error::StaleConnection, Some(body)));
            }
        };

        tracing::trace!(
            "h1: conn {} sending {} {} (reused: {})",
            self.state.id,
            head.method,
            head.url,
            turn.reused
        );

        let write_task = tokio::spawn(write_phase(
            writer,
            self.writer.clone(),
            wire_head,
            body,
            framing,
            self.state.force.clone(),
            turn.write.clone(),
        ));

        let mut received = 0usize;
        let head_result = {
            let force = &self.state.force;
            let caller = &opts.scope;
            let read = read_response_head(&mut reader, &mut received);
            bounded(
                opts.response_header,
                async {
                    tokio::select! {
                        biased;
                        _ = force.cancelled() => Err(force.err()),
                        _ = caller.cancelled() => Err(caller.err()),
                        head = read => head,
                    }
                },
                Error::ResponseHeaderTimeout,
            )
            .await
        };

        let response_head = match head_result {
            Ok(h) => h,
            Err(e) => {
                let error = if turn.reused && received == 0 && is_connection_loss(&e) {
                    tracing::debug!("h1: conn {} went stale: {}", self.state.id, e);
                    Error::StaleConnection
                } else {
                    e
                };
                self.state.close();
                let body = write_task.await.ok();
                return Err(Failure::new(error, body));
            }
        };

        let framing = match response_framing(&head.method, &response_head) {
            Ok(f) => f,
            Err(e) => {
                self.state.close();
                let body = write_task.await.ok();
                return Err(Failure::new(e, body));
            }
        };

        let reusable = opts.keep_alive && is_persistent(&response_head, framing);

        if framing == ResponseFraming::Upgrade {
            let body = write_task.await.ok();
            let writer = self.writer.lock().await.take();
            turn.read.cancel();
            return match writer {
                Some(writer) => {
                    let mut response = Response::with_body(
                        response_head.status,
                        response_head.headers,
                        HttpVersion::Http1_1,
                        head.url.clone(),
                        ResponseBody::Empty,
                    );
                    response.set_upgrade(Upgraded {
                        reader,
                        writer: writer.into_inner(),
                    });
                    Ok(response)
                }
                None => Err(Failure::new(self.state.force.err(), body)),
            };
        }

        let (tx, rx) = mpsc::channel(BODY_QUEUE_CAPACITY);
        let pump = Pump {
            state: self.state.clone(),
            reader_slot: self.reader.clone(),
            write: turn.write.clone(),
            read: turn.read.clone(),
            reusable,
        };
        tokio::spawn(pump.run(reader, BodyDecoder::new(framing), Delivery::new(tx, DISCARD_LIMIT)));

        Ok(Response::with_body(
            response_head.status,
            response_head.headers,
            HttpVersion::Http1_1,
            head.url.clone(),
            ResponseBody::Channel(ChannelBody::new(
                rx,
                opts.read_idle,
                self.state.force.clone(),
            )),
        ))
    }

    /// Resolves once an idle connection is closed by the peer or receives
    /// bytes nobody asked for. Either way it cannot carry another request.
    pub(crate) async fn idle_closed(&self) {
        let mut guard = self.reader.lock().await;
        let Some(reader) = guard.as_mut() else {
            return;
        };
        match reader.fill_buf().await {
            Ok(buf) if buf.is_empty() => {
                tracing::debug!("h1: conn {} closed by peer while idle", self.state.id)
            }
            Ok(_) => tracing::debug!("h1: conn {} received unsolicited data", self.state.id),
            Err(e) => tracing::debug!("h1: conn {} failed while idle: {}", self.state.id, e),
        }
    }
}

/// Errors that mean the peer dropped the connection.
fn is_connection_loss(e: &Error) -> bool {
    matches!(e.root(), Error::Io(_) | Error::Closed)
}

/// Send the head and body. The writer goes back into its slot only if the
/// whole request made it out; a failure tears the connection down.
async fn write_phase(
    mut writer: Writer,
    writer_slot: Slot<Writer>,
    head: Vec<u8>,
    mut body: Body,
    framing: Option<RequestFraming>,
    force: Scope,
    write: Scope,
) -> Body {
    let result = tokio::select! {
        biased;
        _ = force.cancelled() => Err(force.err()),
        r = write_request(&mut writer, &head, &mut body, framing) => r,
    };
    match result {
        Ok(()) => {
            *writer_slot.lock().await = Some(writer);
        }
        Err(e) => {
            tracing::debug!("h1: write failed: {}", e);
            force.cancel_with(e.staged("failed to send request body"));
        }
    }
    write.cancel();
    body
}

async fn write_request(
    writer: &mut Writer,
    head: &[u8],
    body: &mut Body,
    framing: Option<RequestFraming>,
) -> Result<()> {
    writer.write_all(head).await?;
    match framing {
        None => {}
        Some(RequestFraming::Chunked) => {
            let mut chunked = ChunkedWriter::new(writer);
            let mut chunks = body.chunks();
            while let Some(chunk) = chunks.next().await? {
                chunked.write_chunk(&chunk).await?;
            }
            chunked.finish().await?;
        }
        Some(RequestFraming::Length(expected)) => {
            let mut sent = 0u64;
            let mut chunks = body.chunks();
            while let Some(chunk) = chunks.next().await? {
                sent += chunk.len() as u64;
                if sent > expected {
                    return Err(Error::http_protocol(format!(
                        "request body longer than declared Content-Length {}",
                        expected
                    )));
                }
                writer.write_all(&chunk).await?;
            }
            if sent != expected {
                return Err(Error::http_protocol(format!(
                    "request body ended after {} of {} bytes",
                    sent, expected
                )));
            }
        }
    }
    writer.flush().await?;
    Ok(())
}

/// Chunked transfer-encoding writer. Each chunk is flushed as it is written
/// so streamed bodies reach the server incrementally.
struct ChunkedWriter<'a, W> {
    inner: &'a mut W,
}

impl<'a, W: AsyncWrite + Unpin> ChunkedWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self { inner }
    }

    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        // A zero-size chunk would terminate the body early.
        if data.is_empty() {
            return Ok(());
        }
        self.inner
            .write_all(format!("{:x}\r\n", data.len()).as_bytes())
            .await?;
        self.inner.write_all(data).await?;
        self.inner.write_all(b"\r\n").await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn finish(self) -> Result<()> {
        self.inner.write_all(b"0\r\n\r\n").await?;
        Ok(())
    }
}

/// Serialize the request head, filling in Host, framing and Connection.
fn encode_head(
    head: &RequestHead,
    body: &Body,
    opts: &ExecOptions,
) -> Result<(Vec<u8>, Option<RequestFraming>)> {
    let url = &head.url;
    let host = url
        .host_str()
        .ok_or_else(|| Error::config(format!("URL has no host: {}", url)))?;
    let host = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    let mut headers = head.headers.clone();
    headers.insert_front_if_absent("Host", host);

    let framing = match body.content_length() {
        Some(0)
            if body.is_empty()
                && !matches!(head.method, Method::POST | Method::PUT | Method::PATCH) =>
        {
            headers.remove("Content-Length");
            None
        }
        Some(len) => {
            headers.remove("Transfer-Encoding");
            headers.insert("Content-Length", len.to_string());
            Some(RequestFraming::Length(len))
        }
        None => {
            headers.remove("Content-Length");
            headers.insert("Transfer-Encoding", "chunked");
            Some(RequestFraming::Chunked)
        }
    };

    if opts.keep_alive {
        headers.insert_if_absent("Connection", "keep-alive");
    } else {
        headers.insert("Connection", "close");
    }

    if let Some(order) = &opts.header_order {
        headers.reorder(order);
    }
    headers.validate()?;

    let target = if head.method == Method::CONNECT {
        let port = url.port_or_known_default().unwrap_or(443);
        format!("{}:{}", url.host_str().unwrap_or_default(), port)
    } else {
        match url.query() {
            Some(q) => format!("{}?{}", url.path(), q),
            None => url.path().to_string(),
        }
    };

    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", head.method, target).as_bytes());
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    Ok((out, framing))
}

/// Read the final response head, skipping interim 1xx responses other
/// than 101. `received` counts every byte taken off the socket.
async fn read_response_head(reader: &mut Reader, received: &mut usize) -> Result<Head> {
    loop {
        let head = read_head(reader, received).await?;
        // Per RFC 9112 Section 6: a client MUST be able to parse one or more
        // 1xx responses received prior to a final response.
        if (100..200).contains(&head.status) && head.status != 101 {
            continue;
        }
        return Ok(head);
    }
}

async fn read_head(reader: &mut Reader, received: &mut usize) -> Result<Head> {
    let mut buffer: Vec<u8> = Vec::with_capacity(1024);
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before response headers complete",
            )));
        }
        let prior = buffer.len();
        let n = available.len();
        buffer.extend_from_slice(available);
        *received += n;

        // Only the tail can complete a terminator that started earlier.
        let from = prior.saturating_sub(3);
        if let Some(end) = find_header_end(&buffer[from..]).map(|e| e + from) {
            reader.consume(end - prior);
            buffer.truncate(end);
            return parse_head(&buffer);
        }
        reader.consume(n);
        if buffer.len() >= MAX_HEADERS_SIZE {
            return Err(Error::HttpProtocol("Response headers too large".into()));
        }
    }
}

fn parse_head(buffer: &[u8]) -> Result<Head> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS_COUNT];
    let mut response = httparse::Response::new(&mut headers);
    match response
        .parse(buffer)
        .map_err(|e| Error::HttpProtocol(format!("Failed to parse response: {}", e)))?
    {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => {
            return Err(Error::HttpProtocol("Incomplete response headers".into()))
        }
    }
    let status = response
        .code
        .ok_or_else(|| Error::HttpProtocol("Missing status code".into()))?;
    let minor = response.version.unwrap_or(1);
    let headers = response
        .headers
        .iter()
        .map(|h| {
            (
                h.name.to_string(),
                String::from_utf8_lossy(h.value).into_owned(),
            )
        })
        .collect();
    Ok(Head {
        status,
        minor,
        headers,
    })
}

/// Decide how the response body is delimited (RFC 9112 Section 6.3).
fn response_framing(method: &Method, head: &Head) -> Result<ResponseFraming> {
    if head.status == 101 || (*method == Method::CONNECT && (200..300).contains(&head.status)) {
        return Ok(ResponseFraming::Upgrade);
    }
    if *method == Method::HEAD || head.status == 204 || head.status == 304 {
        return Ok(ResponseFraming::Empty);
    }
    if let Some(te) = find_header_value(&head.headers, "Transfer-Encoding") {
        let last = te.rsplit(',').next().unwrap_or("").trim();
        if last.eq_ignore_ascii_case("chunked") {
            return Ok(ResponseFraming::Chunked);
        }
        return Ok(ResponseFraming::Close);
    }
    let lengths: Vec<&str> = head
        .headers
        .iter()
        .filter(|(k, _)| k.eq_ignore_ascii_case("Content-Length"))
        .map(|(_, v)| v.as_str())
        .collect();
    if !lengths.is_empty() {
        let len = parse_content_length(&lengths.join(","))? as u64;
        return Ok(if len == 0 {
            ResponseFraming::Empty
        } else {
            ResponseFraming::Length(len)
        });
    }
    Ok(ResponseFraming::Close)
}

/// Whether the connection may carry another request after this response.
fn is_persistent(head: &Head, framing: ResponseFraming) -> bool {
    if matches!(framing, ResponseFraming::Close | ResponseFraming::Upgrade) {
        return false;
    }
    let connection: Vec<String> = find_header_value(&head.headers, "Connection")
        .map(|v| v.split(',').map(|t| t.trim().to_ascii_lowercase()).collect())
        .unwrap_or_default();
    if connection.iter().any(|t| t == "close") {
        return false;
    }
    if head.minor == 0 && !connection.iter().any(|t| t == "keep-alive") {
        return false;
    }
    poolable(head.status, &head.headers)
}

/// Incremental response body decoder.
struct BodyDecoder {
    framing: ResponseFraming,
    remaining: u64,
    /// Bytes left in the current chunk, for chunked framing.
    chunk_left: u64,
    done: bool,
}

impl BodyDecoder {
    fn new(framing: ResponseFraming) -> Self {
        let remaining = match framing {
            ResponseFraming::Length(n) => n,
            _ => 0,
        };
        Self {
            framing,
            remaining,
            chunk_left: 0,
            done: matches!(framing, ResponseFraming::Empty | ResponseFraming::Upgrade),
        }
    }

    /// Whether the rest of the body is small and length-delimited enough to
    /// be read and thrown away instead of closing the connection.
    fn can_discard(&self) -> bool {
        match self.framing {
            ResponseFraming::Length(_) => self.remaining <= DISCARD_LIMIT,
            ResponseFraming::Empty => true,
            _ => self.done,
        }
    }

    /// Next piece of body, or `None` once the body is complete.
    async fn next<R: AsyncBufRead + Unpin>(&mut self, reader: &mut R) -> Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        match self.framing {
            ResponseFraming::Length(_) => {
                if self.remaining == 0 {
                    self.done = true;
                    return Ok(None);
                }
                let chunk = take_some(reader, self.remaining).await?;
                if chunk.is_empty() {
                    return Err(Error::HttpProtocol(format!(
                        "Connection closed with {} body bytes outstanding",
                        self.remaining
                    )));
                }
                self.remaining -= chunk.len() as u64;
                Ok(Some(chunk))
            }
            ResponseFraming::Close => {
                let chunk = take_some(reader, u64::MAX).await?;
                if chunk.is_empty() {
                    self.done = true;
                    return Ok(None);
                }
                Ok(Some(chunk))
            }
            ResponseFraming::Chunked => self.next_chunked(reader).await,
            ResponseFraming::Empty | ResponseFraming::Upgrade => Ok(None),
        }
    }

    async fn next_chunked<R: AsyncBufRead + Unpin>(&mut self, reader: &mut R) -> Result<Option<Bytes>> {
        loop {
            if self.chunk_left > 0 {
                let chunk = take_some(reader, self.chunk_left).await?;
                if chunk.is_empty() {
                    return Err(Error::HttpProtocol("Connection closed mid-chunk".into()));
                }
                self.chunk_left -= chunk.len() as u64;
                if self.chunk_left == 0 {
                    let crlf = read_line(reader).await?;
                    if !crlf.is_empty() {
                        return Err(Error::HttpProtocol("Missing CRLF after chunk data".into()));
                    }
                }
                return Ok(Some(chunk));
            }

            let line = read_line(reader).await?;
            let mut sized = line.clone();
            sized.extend_from_slice(b"\r\n");
            let (size, _) = find_chunk_size(&sized)
                .ok_or_else(|| Error::HttpProtocol("Invalid chunk size".into()))?;
            if size == 0 {
                self.consume_trailers(reader).await?;
                self.done = true;
                return Ok(None);
            }
            self.chunk_left = size as u64;
        }
    }

    /// Skip trailer fields up to the terminating empty line. A server that
    /// closes right after the last chunk is tolerated.
    async fn consume_trailers<R: AsyncBufRead + Unpin>(&mut self, reader: &mut R) -> Result<()> {
        loop {
            match read_line(reader).await {
                Ok(line) if line.is_empty() => return Ok(()),
                Ok(_) => continue,
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Take up to `max` buffered bytes, reading once if the buffer is empty.
/// An empty result means end of stream.
async fn take_some<R: AsyncBufRead + Unpin>(reader: &mut R, max: u64) -> Result<Bytes> {
    let available = reader.fill_buf().await?;
    let n = available.len().min(usize::try_from(max).unwrap_or(usize::MAX));
    let chunk = Bytes::copy_from_slice(&available[..n]);
    reader.consume(n);
    Ok(chunk)
}

/// Read one CRLF-terminated line without its terminator.
async fn read_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut line = Vec::with_capacity(16);
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-line",
            )));
        }
        let prior = line.len();
        line.extend_from_slice(available);
        let from = prior.saturating_sub(1);
        if let Some(pos) = find_crlf(&line[from..]).map(|p| p + from) {
            reader.consume(pos + 2 - prior);
            line.truncate(pos);
            return Ok(line);
        }
        let n = line.len() - prior;
        reader.consume(n);
        if line.len() > MAX_HEADERS_SIZE {
            return Err(Error::HttpProtocol("Line too long".into()));
        }
    }
}

/// Moves a response body from the socket to the caller.
struct Pump {
    state: Arc<ConnState>,
    reader_slot: Slot<Reader>,
    write: Scope,
    read: Scope,
    reusable: bool,
}

impl Pump {
    async fn run(self, mut reader: Reader, mut decoder: BodyDecoder, mut delivery: Delivery) {
        let force = self.state.force.clone();
        let outcome: Result<bool> = async {
            loop {
                if !delivery.is_open() && !decoder.can_discard() {
                    return Ok(false);
                }
                let next = tokio::select! {
                    biased;
                    _ = force.cancelled() => return Err(force.err()),
                    n = decoder.next(&mut reader) => n?,
                };
                match next {
                    Some(chunk) => {
                        if !delivery.deliver(chunk, &force).await {
                            return Ok(false);
                        }
                    }
                    None => return Ok(true),
                }
            }
        }
        .await;

        match outcome {
            Ok(true) => self.finish(reader, delivery).await,
            Ok(false) => {
                tracing::debug!(
                    "h1: conn {} abandoned mid-body, closing",
                    self.state.id
                );
                self.state.close();
            }
            Err(e) => {
                tracing::debug!("h1: conn {} body read failed: {}", self.state.id, e);
                delivery.fail(e.staged("failed to read response body")).await;
                self.state.close();
            }
        }
    }

    /// The body is fully read. Release the connection and only then let the
    /// caller observe end-of-body, so a follow-up request finds it pooled.
    async fn finish(self, reader: Reader, delivery: Delivery) {
        let write_done = self.write.is_cancelled()
            || tokio::time::timeout(WRITE_SETTLE, self.write.cancelled())
                .await
                .is_ok();
        if !write_done {
            tracing::debug!(
                "h1: conn {} read finished before write, closing",
                self.state.id
            );
            self.state
                .close_with(Error::LastTaskRunning.staged("last task not write done with read done"));
            drop(delivery);
            return;
        }

        if !self.reusable || self.state.force.is_cancelled() {
            self.state.close();
            drop(delivery);
            return;
        }

        *self.reader_slot.lock().await = Some(reader);
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

/// A connection taken over after `101 Switching Protocols` (or a successful
/// CONNECT). Bytes the server sent after the response head are read first.
pub struct Upgraded {
    reader: Reader,
    writer: WriteHalf<MaybeTlsStream>,
}

impl std::fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgraded")
            .field("buffered", &self.reader.buffer().len())
            .finish()
    }
}

impl AsyncRead for Upgraded {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for Upgraded {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

/// Find the end of HTTP headers (\r\n\r\n).
fn find_header_end(buffer: &[u8]) -> Option<usize> {
    for i in 0..buffer.len().saturating_sub(3) {
        if &buffer[i..i + 4] == b"\r\n\r\n" {
            return Some(i + 4);
        }
    }
    None
}

/// Find a header value by name (case-insensitive).
fn find_header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Parse a chunk size from the buffer, returning (size, end_of_line_position).
fn find_chunk_size(buffer: &[u8]) -> Option<(usize, usize)> {
    let i = find_crlf(buffer)?;
    // Parse hex size (may have chunk extensions after ;)
    let line = &buffer[..i];
    let size_str = String::from_utf8_lossy(line);
    let size_part = size_str.split(';').next()?;
    let size = usize::from_str_radix(size_part.trim(), 16).ok()?;
    Some((size, i + 2))
}

/// Find the first CRLF in a buffer, returning its position.
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    (0..buffer.len().saturating_sub(1)).find(|&i| &buffer[i..i + 2] == b"\r\n")
}

/// Parse and validate Content-Length header value per RFC 9112 Section 6.2.
///
/// Content-Length must be a non-negative integer. If multiple values are
/// present (comma-separated), they must all be identical.
fn parse_content_length(value: &str) -> Result<usize> {
    let parts: Vec<&str> = value.split(',').map(|s| s.trim()).collect();

    // Parse first value
    let first = parts[0]
        .parse::<usize>()
        .map_err(|_| Error::HttpProtocol(format!("Invalid Content-Length: {}", value)))?;

    // Per RFC 9112: If multiple values, they must all be identical
    for part in &parts[1..] {
        let val = part
            .parse::<usize>()
            .map_err(|_| Error::HttpProtocol(format!("Invalid Content-Length: {}", value)))?;
        if val != first {
            return Err(Error::HttpProtocol(format!(
                "Conflicting Content-Length values: {}",
                value
            )));
        }
    }

    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Headers;
    use tokio::io::{duplex, AsyncReadExt};
    use url::Url;

    fn opts(keep_alive: bool) -> Arc<ExecOptions> {
        Arc::new(ExecOptions {
            response_header: Some(Duration::from_secs(5)),
            read_idle: None,
            header_order: None,
            h2_header_order: None,
            keep_alive,
            scope: Scope::new(),
        })
    }

    fn exchange(method: Method, url: &str, body: Body, keep_alive: bool) -> Exchange {
        Exchange {
            head: Arc::new(RequestHead {
                method,
                url: Url::parse(url).unwrap(),
                headers: Headers::new(),
            }),
            body,
            opts: opts(keep_alive),
        }
    }

    fn head_text(method: Method, url: &str, body: &Body, keep_alive: bool) -> String {
        let ex = exchange(method, url, Body::empty(), keep_alive);
        let (bytes, _) = encode_head(&ex.head, body, &ex.opts).unwrap();
        String::from_utf8(bytes).unwrap()
    }

    async fn read_request(server: &mut tokio::io::DuplexStream) -> String {
        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        while find_header_end(&seen).is_none() {
            let n = server.read(&mut buf).await.unwrap();
            assert!(n > 0, "client closed early");
            seen.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(seen).unwrap()
    }

    #[test]
    fn test_find_header_end() {
        let data = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
        assert_eq!(find_header_end(data), Some(38));

        let partial = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n";
        assert_eq!(find_header_end(partial), None);
    }

    #[test]
    fn test_find_chunk_size() {
        assert_eq!(find_chunk_size(b"5\r\nhello"), Some((5, 3)));
        assert_eq!(find_chunk_size(b"a\r\n0123456789"), Some((10, 3)));
        assert_eq!(find_chunk_size(b"0\r\n"), Some((0, 3)));
        // "5;ext=val\r\n" is 11 bytes (indices 0-10), so position after \r\n is 11
        assert_eq!(find_chunk_size(b"5;ext=val\r\ndata"), Some((5, 11)));
        assert_eq!(find_chunk_size(b"xyz\r\n"), None);
    }

    #[test]
    fn test_find_header_value() {
        let headers = vec![
            ("Content-Type".to_string(), "text/html".to_string()),
            ("Content-Length".to_string(), "100".to_string()),
        ];
        assert_eq!(find_header_value(&headers, "content-type"), Some("text/html"));
        assert_eq!(find_header_value(&headers, "Content-Length"), Some("100"));
        assert_eq!(find_header_value(&headers, "missing"), None);
    }

    #[test]
    fn test_find_crlf() {
        assert_eq!(find_crlf(b"\r\n"), Some(0));
        assert_eq!(find_crlf(b"hello\r\nworld"), Some(5));
        assert_eq!(find_crlf(b"no crlf here"), None);
        assert_eq!(find_crlf(b"\r"), None);
        assert_eq!(find_crlf(b""), None);
    }

    #[test]
    fn test_parse_content_length() {
        assert_eq!(parse_content_length("100").unwrap(), 100);
        // Per RFC 9112: Multiple identical values are allowed
        assert_eq!(parse_content_length("100, 100").unwrap(), 100);
        assert!(parse_content_length("100, 200").is_err());
        assert!(parse_content_length("-1").is_err());
        assert!(parse_content_length("100.5").is_err());
    }

    #[test]
    fn test_head_adds_host_and_keep_alive() {
        let text = head_text(Method::GET, "http://example.com:8080/a?b=c", &Body::empty(), true);
        assert!(text.starts_with("GET /a?b=c HTTP/1.1\r\nHost: example.com:8080\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn test_head_empty_post_gets_zero_length() {
        let text = head_text(Method::POST, "http://example.com/", &Body::empty(), false);
        assert!(text.contains("Content-Length: 0\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_head_unknown_length_is_chunked() {
        let body = Body::from_reader(&b"abc"[..], None);
        let ex = exchange(Method::PUT, "http://example.com/up", Body::empty(), true);
        let (bytes, framing) = encode_head(&ex.head, &body, &ex.opts).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(framing, Some(RequestFraming::Chunked));
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn test_head_rejects_header_injection() {
        let mut ex = exchange(Method::GET, "http://example.com/", Body::empty(), true);
        Arc::get_mut(&mut ex.head)
            .unwrap()
            .headers
            .append("X-Evil", "a\r\nInjected: 1");
        assert!(encode_head(&ex.head, &Body::empty(), &ex.opts).is_err());
    }

    #[test]
    fn test_framing_rules() {
        let head = |status, headers: &[(&str, &str)]| Head {
            status,
            minor: 1,
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
        assert_eq!(
            response_framing(&Method::GET, &head(101, &[])).unwrap(),
            ResponseFraming::Upgrade
        );
        assert_eq!(
            response_framing(&Method::HEAD, &head(200, &[("Content-Length", "10")])).unwrap(),
            ResponseFraming::Empty
        );
        assert_eq!(
            response_framing(&Method::GET, &head(200, &[("Transfer-Encoding", "gzip, chunked")]))
                .unwrap(),
            ResponseFraming::Chunked
        );
        assert_eq!(
            response_framing(&Method::GET, &head(200, &[])).unwrap(),
            ResponseFraming::Close
        );

        let sse = head(200, &[("Content-Type", "text/event-stream"), ("Content-Length", "5")]);
        assert!(!is_persistent(&sse, ResponseFraming::Length(5)));
        let listed = head(200, &[("Content-Type", "application/x; text/event-stream"), ("Content-Length", "5")]);
        assert!(!is_persistent(&listed, ResponseFraming::Length(5)));
        let closing = head(200, &[("Connection", "close"), ("Content-Length", "5")]);
        assert!(!is_persistent(&closing, ResponseFraming::Length(5)));
        let http10 = Head { minor: 0, ..head(200, &[("Content-Length", "5")]) };
        assert!(!is_persistent(&http10, ResponseFraming::Length(5)));
        assert!(is_persistent(&head(200, &[]), ResponseFraming::Length(5)));
    }

    #[tokio::test]
    async fn test_chunked_decoder_with_trailers() {
        let wire = b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: yes\r\n\r\nNEXT";
        let mut reader = BufReader::new(&wire[..]);
        let mut decoder = BodyDecoder::new(ResponseFraming::Chunked);
        let mut body = Vec::new();
        while let Some(chunk) = decoder.next(&mut reader).await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(body, b"Wikipedia");
        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "NEXT");
    }

    #[tokio::test]
    async fn test_chunked_decoder_tolerates_eof_in_trailers() {
        let wire = b"3\r\nabc\r\n0\r\n";
        let mut reader = BufReader::new(&wire[..]);
        let mut decoder = BodyDecoder::new(ResponseFraming::Chunked);
        assert_eq!(decoder.next(&mut reader).await.unwrap().unwrap(), Bytes::from_static(b"abc"));
        assert!(decoder.next(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_length_decoder_stops_at_boundary() {
        let wire = b"helloHTTP/1.1";
        let mut reader = BufReader::new(&wire[..]);
        let mut decoder = BodyDecoder::new(ResponseFraming::Length(5));
        assert_eq!(decoder.next(&mut reader).await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert!(decoder.next(&mut reader).await.unwrap().is_none());
    }

    #[test]
    fn test_discard_only_small_delimited_bodies() {
        assert!(BodyDecoder::new(ResponseFraming::Length(1024)).can_discard());
        assert!(!BodyDecoder::new(ResponseFraming::Length(DISCARD_LIMIT + 1)).can_discard());
        assert!(!BodyDecoder::new(ResponseFraming::Chunked).can_discard());
        assert!(!BodyDecoder::new(ResponseFraming::Close).can_discard());
    }

    #[tokio::test]
    async fn test_round_trip_and_reuse() {
        let (client, mut server) = duplex(64 * 1024);
        let root = Scope::new();
        let conn = Http1Conn::new(MaybeTlsStream::Plain(Box::new(client)), &root);

        let server_task = tokio::spawn(async move {
            for body in ["first", "second"] {
                let req = read_request(&mut server).await;
                assert!(req.starts_with("GET /"));
                let reply = format!(
                    "HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                server.write_all(reply.as_bytes()).await.unwrap();
            }
            server
        });

        let resp = conn
            .execute(exchange(Method::GET, "http://example.com/", Body::empty(), true))
            .await
            .unwrap();
        assert_eq!(resp.status, 200);
        // Pump waits for the pool to take the connection back.
        let state = conn.state().clone();
        let parker = tokio::spawn(async move {
            state.wait_idle().await;
            state.mark_parked();
        });
        assert_eq!(resp.text().await.unwrap(), "first");
        parker.await.unwrap();
        assert!(conn.state().is_reusable());

        let resp = conn
            .execute(exchange(Method::GET, "http://example.com/", Body::empty(), true))
            .await
            .unwrap();
        let state = conn.state().clone();
        tokio::spawn(async move {
            state.wait_idle().await;
            state.mark_parked();
        });
        assert_eq!(resp.text().await.unwrap(), "second");
        assert_eq!(conn.state().requests(), 2);
        drop(server_task);
    }

    #[tokio::test]
    async fn test_chunked_request_on_wire() {
        let (client, mut server) = duplex(64 * 1024);
        let conn = Http1Conn::new(MaybeTlsStream::Plain(Box::new(client)), &Scope::new());
        let server_task = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut buf = [0u8; 1024];
            while !seen.ends_with(b"0\r\n\r\n") {
                let n = server.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
            }
            server
                .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
                .await
                .unwrap();
            String::from_utf8(seen).unwrap()
        });

        let body = Body::from_reader(&b"streamed"[..], None);
        let resp = conn
            .execute(exchange(Method::POST, "http://example.com/up", body, false))
            .await
            .unwrap();
        assert_eq!(resp.status, 204);
        let seen = server_task.await.unwrap();
        assert!(seen.contains("Transfer-Encoding: chunked\r\n"));
        assert!(seen.ends_with("\r\n\r\n8\r\nstreamed\r\n0\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_event_stream_not_reused() {
        let (client, mut server) = duplex(64 * 1024);
        let conn = Http1Conn::new(MaybeTlsStream::Plain(Box::new(client)), &Scope::new());
        tokio::spawn(async move {
            read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nContent-Length: 12\r\n\r\ndata: hi\r\n\r\n")
                .await
                .unwrap();
            server
        });
        let resp = conn
            .execute(exchange(Method::GET, "http://example.com/events", Body::empty(), true))
            .await
            .unwrap();
        assert!(resp.is_event_stream());
        assert_eq!(resp.bytes().await.unwrap().len(), 12);
        assert!(!conn.state().is_reusable());
        assert!(conn.state().force.is_cancelled());
    }

    #[tokio::test]
    async fn test_switching_protocols_yields_upgrade() {
        let (client, mut server) = duplex(64 * 1024);
        let conn = Http1Conn::new(MaybeTlsStream::Plain(Box::new(client)), &Scope::new());
        tokio::spawn(async move {
            read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\nframe")
                .await
                .unwrap();
            let mut buf = [0u8; 4];
            server.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"pong");
            server
        });
        let mut resp = conn
            .execute(exchange(Method::GET, "http://example.com/ws", Body::empty(), true))
            .await
            .unwrap();
        assert_eq!(resp.status, 101);
        let mut upgraded = resp.upgrade().unwrap();
        let mut buf = [0u8; 5];
        upgraded.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"frame");
        upgraded.write_all(b"pong").await.unwrap();
        upgraded.flush().await.unwrap();
        assert!(!conn.state().is_reusable());
    }

    #[tokio::test]
    async fn test_reused_conn_closed_by_peer_is_stale() {
        let (client, mut server) = duplex(64 * 1024);
        let conn = Http1Conn::new(MaybeTlsStream::Plain(Box::new(client)), &Scope::new());
        let server_task = tokio::spawn(async move {
            read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                .await
                .unwrap();
            read_request(&mut server).await;
            // Closes without answering the second request.
        });

        let resp = conn
            .execute(exchange(Method::GET, "http://example.com/", Body::empty(), true))
            .await
            .unwrap();
        let state = conn.state().clone();
        tokio::spawn(async move {
            state.wait_idle().await;
            state.mark_parked();
        });
        resp.bytes().await.unwrap();

        let failure = conn
            .execute(exchange(Method::GET, "http://example.com/", Body::from("retry me"), true))
            .await
            .unwrap_err();
        server_task.await.unwrap();
        assert!(matches!(failure.error, Error::StaleConnection));
        assert!(failure.body.is_some_and(|b| b.is_replayable()));
    }

    #[tokio::test]
    async fn test_busy_connection_rejects_second_request() {
        let (client, mut server) = duplex(64 * 1024);
        let conn = Http1Conn::new(MaybeTlsStream::Plain(Box::new(client)), &Scope::new());
        let server_task = tokio::spawn(async move {
            read_request(&mut server).await;
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nab")
                .await
                .unwrap();
            server
        });
        let _resp = conn
            .execute(exchange(Method::GET, "http://example.com/", Body::empty(), true))
            .await
            .unwrap();
        // Keep the server side open so the body stays incomplete.
        let _server = server_task.await.unwrap();
        let failure = conn
            .execute(exchange(Method::GET, "http://example.com/", Body::empty(), true))
            .await
            .unwrap_err();
        assert!(matches!(failure.error, Error::LastTaskRunning));
    }
}
