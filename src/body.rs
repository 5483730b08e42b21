//! Request bodies.
//!
//! [`Body`] is what a connection consumes: nothing, a byte buffer, or a
//! stream of known or unknown length. [`Payload`] is the closed set of
//! structured inputs, each with one conversion into a `Body` plus a
//! content-type hint.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

use crate::error::{Error, Result};

const STREAM_CHUNK_SIZE: usize = 16 * 1024;

pub(crate) type BoxReader = Pin<Box<dyn AsyncRead + Send + 'static>>;

/// Outbound request body.
pub struct Body {
    kind: Kind,
}

enum Kind {
    Empty,
    Bytes(Bytes),
    Stream {
        reader: BoxReader,
        len: Option<u64>,
        /// Set once the first byte has been pulled from `reader`.
        touched: bool,
    },
}

impl Body {
    pub fn empty() -> Self {
        Self { kind: Kind::Empty }
    }

    /// A streaming body. `len` selects `Content-Length` framing when known
    /// and chunked framing otherwise.
    pub fn from_reader<R>(reader: R, len: Option<u64>) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self {
            kind: Kind::Stream {
                reader: Box::pin(reader),
                len,
                touched: false,
            },
        }
    }

    /// Exact length if known. An empty body has length zero.
    pub fn content_length(&self) -> Option<u64> {
        match &self.kind {
            Kind::Empty => Some(0),
            Kind::Bytes(b) => Some(b.len() as u64),
            Kind::Stream { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        match &self.kind {
            Kind::Empty => true,
            Kind::Bytes(b) => b.is_empty(),
            Kind::Stream { .. } => false,
        }
    }

    /// Whether the body can still be sent from its beginning.
    pub fn is_replayable(&self) -> bool {
        match &self.kind {
            Kind::Empty | Kind::Bytes(_) => true,
            Kind::Stream { touched, .. } => !touched,
        }
    }

    /// A second handle on a buffered body. Streams cannot be cloned.
    pub fn try_clone(&self) -> Option<Body> {
        match &self.kind {
            Kind::Empty => Some(Body::empty()),
            Kind::Bytes(b) => Some(Body::from(b.clone())),
            Kind::Stream { .. } => None,
        }
    }

    /// Iterate the body in chunks. Buffered bodies are not consumed.
    pub(crate) fn chunks(&mut self) -> Chunks<'_> {
        Chunks {
            body: self,
            yielded: false,
        }
    }

    /// Read the whole body into memory.
    pub(crate) async fn collect(&mut self) -> Result<Bytes> {
        if let Kind::Bytes(b) = &self.kind {
            return Ok(b.clone());
        }
        let mut out = BytesMut::new();
        let mut chunks = self.chunks();
        while let Some(chunk) = chunks.next().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Poll-based counterpart of [`Chunks::next`] for `http_body` adapters.
    /// `yielded` tracks whether a buffered body has already been emitted.
    pub(crate) fn poll_chunk(
        &mut self,
        cx: &mut Context<'_>,
        yielded: &mut bool,
    ) -> Poll<io::Result<Option<Bytes>>> {
        match &mut self.kind {
            Kind::Empty => Poll::Ready(Ok(None)),
            Kind::Bytes(b) => {
                if *yielded {
                    return Poll::Ready(Ok(None));
                }
                *yielded = true;
                Poll::Ready(Ok(Some(b.clone())))
            }
            Kind::Stream {
                reader, touched, ..
            } => {
                let mut buf = BytesMut::with_capacity(STREAM_CHUNK_SIZE);
                *touched = true;
                let n = ready!(tokio_util::io::poll_read_buf(reader.as_mut(), cx, &mut buf))?;
                if n == 0 {
                    return Poll::Ready(Ok(None));
                }
                Poll::Ready(Ok(Some(buf.freeze())))
            }
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Empty => f.write_str("Body::Empty"),
            Kind::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Kind::Stream { len, touched, .. } => f
                .debug_struct("Body::Stream")
                .field("len", len)
                .field("touched", touched)
                .finish(),
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        if b.is_empty() {
            return Self::empty();
        }
        Self {
            kind: Kind::Bytes(b),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Self::from(Bytes::from(v))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::from(Bytes::from(s))
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Self::from(Bytes::from_static(s.as_bytes()))
    }
}

impl From<&'static [u8]> for Body {
    fn from(s: &'static [u8]) -> Self {
        Self::from(Bytes::from_static(s))
    }
}

/// Chunk cursor over a [`Body`].
pub(crate) struct Chunks<'a> {
    body: &'a mut Body,
    yielded: bool,
}

impl Chunks<'_> {
    pub(crate) async fn next(&mut self) -> Result<Option<Bytes>> {
        match &mut self.body.kind {
            Kind::Empty => Ok(None),
            Kind::Bytes(b) => {
                if self.yielded {
                    return Ok(None);
                }
                self.yielded = true;
                Ok(Some(b.clone()))
            }
            Kind::Stream {
                reader, touched, ..
            } => {
                let mut buf = BytesMut::with_capacity(STREAM_CHUNK_SIZE);
                *touched = true;
                let n = reader.read_buf(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                Ok(Some(buf.freeze()))
            }
        }
    }
}

/// A body together with the content type it implies.
#[derive(Debug)]
pub struct Encoded {
    pub body: Body,
    pub content_type: Option<String>,
}

/// Structured request payloads.
pub enum Payload {
    /// Raw bytes, no content type implied.
    Raw(Bytes),
    /// UTF-8 text, sent as `text/plain`.
    Text(String),
    /// A readable stream of known or unknown length.
    Stream {
        reader: BoxReader,
        len: Option<u64>,
    },
    /// Ordered key/value pairs, sent as `application/x-www-form-urlencoded`.
    Form(Vec<(String, String)>),
    /// A JSON document.
    Json(serde_json::Value),
    /// `multipart/form-data`. Streams incrementally when any part is a reader.
    Multipart(Multipart),
}

impl Payload {
    /// Convert into a body plus content-type hint.
    pub fn encode(self) -> Result<Encoded> {
        match self {
            Payload::Raw(b) => Ok(Encoded {
                body: Body::from(b),
                content_type: None,
            }),
            Payload::Text(s) => Ok(Encoded {
                body: Body::from(s),
                content_type: Some("text/plain; charset=utf-8".into()),
            }),
            Payload::Stream { reader, len } => Ok(Encoded {
                body: Body {
                    kind: Kind::Stream {
                        reader,
                        len,
                        touched: false,
                    },
                },
                content_type: None,
            }),
            Payload::Form(pairs) => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs.iter())
                    .finish();
                Ok(Encoded {
                    body: Body::from(encoded),
                    content_type: Some("application/x-www-form-urlencoded".into()),
                })
            }
            Payload::Json(value) => Ok(Encoded {
                body: Body::from(serde_json::to_vec(&value)?),
                content_type: Some("application/json".into()),
            }),
            Payload::Multipart(form) => form.encode(),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Raw(b) => write!(f, "Payload::Raw({} bytes)", b.len()),
            Payload::Text(s) => write!(f, "Payload::Text({} bytes)", s.len()),
            Payload::Stream { len, .. } => write!(f, "Payload::Stream({:?})", len),
            Payload::Form(pairs) => write!(f, "Payload::Form({} pairs)", pairs.len()),
            Payload::Json(_) => f.write_str("Payload::Json"),
            Payload::Multipart(m) => write!(f, "Payload::Multipart({} parts)", m.parts.len()),
        }
    }
}

/// A `multipart/form-data` form.
#[derive(Default)]
pub struct Multipart {
    parts: Vec<Part>,
    boundary: Option<String>,
}

struct Part {
    name: String,
    filename: Option<String>,
    content_type: Option<String>,
    content: PartContent,
}

enum PartContent {
    Bytes(Bytes),
    Reader(BoxReader),
}

impl Multipart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed boundary instead of a random one.
    pub fn boundary(mut self, boundary: impl Into<String>) -> Self {
        self.boundary = Some(boundary.into());
        self
    }

    /// Add a plain text field.
    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(Part {
            name: name.into(),
            filename: None,
            content_type: None,
            content: PartContent::Bytes(Bytes::from(value.into())),
        });
        self
    }

    /// Add an in-memory file.
    pub fn file(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: Option<&str>,
        content: impl Into<Bytes>,
    ) -> Self {
        self.parts.push(Part {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: content_type.map(str::to_string),
            content: PartContent::Bytes(content.into()),
        });
        self
    }

    /// Add a file read from a stream while the request is being written.
    pub fn file_stream<R>(
        mut self,
        name: impl Into<String>,
        filename: impl Into<String>,
        content_type: Option<&str>,
        reader: R,
    ) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        self.parts.push(Part {
            name: name.into(),
            filename: Some(filename.into()),
            content_type: content_type.map(str::to_string),
            content: PartContent::Reader(Box::pin(reader)),
        });
        self
    }

    fn encode(self) -> Result<Encoded> {
        let boundary = match self.boundary {
            Some(b) => b,
            None => random_boundary()?,
        };
        let content_type = format!("multipart/form-data; boundary={}", boundary);

        let mut segments = VecDeque::new();
        let mut pending = BytesMut::new();
        let mut streaming = false;
        for part in self.parts {
            pending.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
            let mut disposition = format!(
                "Content-Disposition: form-data; name=\"{}\"",
                escape_quotes(&part.name)
            );
            if let Some(filename) = &part.filename {
                disposition.push_str(&format!("; filename=\"{}\"", escape_quotes(filename)));
            }
            pending.extend_from_slice(disposition.as_bytes());
            pending.extend_from_slice(b"\r\n");
            let content_type = match (&part.content_type, &part.filename) {
                (Some(ct), _) => Some(ct.as_str()),
                (None, Some(_)) => Some("application/octet-stream"),
                (None, None) => None,
            };
            if let Some(ct) = content_type {
                pending.extend_from_slice(format!("Content-Type: {}\r\n", ct).as_bytes());
            }
            pending.extend_from_slice(b"\r\n");
            match part.content {
                PartContent::Bytes(b) => pending.extend_from_slice(&b),
                PartContent::Reader(r) => {
                    streaming = true;
                    segments.push_back(Segment::Bytes(pending.split().freeze()));
                    segments.push_back(Segment::Reader(r));
                }
            }
            pending.extend_from_slice(b"\r\n");
        }
        pending.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

        let body = if streaming {
            segments.push_back(Segment::Bytes(pending.freeze()));
            Body::from_reader(SegmentReader { segments }, None)
        } else {
            Body::from(pending.freeze())
        };
        Ok(Encoded {
            body,
            content_type: Some(content_type),
        })
    }
}

fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

fn random_boundary() -> Result<String> {
    let mut raw = [0u8; 16];
    getrandom::fill(&mut raw).map_err(|e| Error::io(format!("RNG error: {}", e)))?;
    let hex: String = raw.iter().map(|b| format!("{:02x}", b)).collect();
    Ok(format!("----FormBoundary{}", hex))
}

enum Segment {
    Bytes(Bytes),
    Reader(BoxReader),
}

/// Concatenates buffered segments and readers without spawning a task.
struct SegmentReader {
    segments: VecDeque<Segment>,
}

impl AsyncRead for SegmentReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            let Some(front) = this.segments.front_mut() else {
                return Poll::Ready(Ok(()));
            };
            match front {
                Segment::Bytes(b) => {
                    if b.is_empty() {
                        this.segments.pop_front();
                        continue;
                    }
                    let n = b.len().min(buf.remaining());
                    buf.put_slice(&b[..n]);
                    b.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Segment::Reader(r) => {
                    let before = buf.filled().len();
                    ready!(r.as_mut().poll_read(cx, buf))?;
                    if buf.filled().len() == before {
                        this.segments.pop_front();
                        continue;
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}
