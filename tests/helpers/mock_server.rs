use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use boring::ssl::SslAcceptor;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use super::connection_tracker::ConnectionTracker;

/// A request as the server saw it.
#[derive(Debug, Clone)]
pub struct Received {
    pub peer: SocketAddr,
    /// Request line and headers, without the final blank line.
    pub head: String,
    /// Body bytes exactly as they crossed the wire (chunk framing included).
    pub body: Vec<u8>,
}

impl Received {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or("")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.head.lines().skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
        })
    }

    pub fn header_names(&self) -> Vec<&str> {
        self.head
            .lines()
            .skip(1)
            .filter_map(|line| line.split_once(':').map(|(k, _)| k.trim()))
            .collect()
    }
}

/// What the server does with a request.
pub struct Reply {
    bytes: Vec<u8>,
    delay: Duration,
    rest: Option<(Duration, Vec<u8>)>,
    close: bool,
}

impl Reply {
    /// `200 OK` with a `Content-Length` body.
    pub fn ok(body: &str) -> Self {
        Self::raw(format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ))
    }

    /// Send `bytes` verbatim.
    pub fn raw(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
            delay: Duration::ZERO,
            rest: None,
            close: false,
        }
    }

    /// Close the connection without answering.
    pub fn hang_up() -> Self {
        Self::raw(Vec::new()).then_close()
    }

    /// Close the connection after writing the reply.
    pub fn then_close(mut self) -> Self {
        self.close = true;
        self
    }

    /// Write `rest` after a pause, once the first part is out.
    pub fn then_after(mut self, pause: Duration, rest: impl Into<Vec<u8>>) -> Self {
        self.rest = Some((pause, rest.into()));
        self
    }

    /// Wait before writing the reply.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type Handler = Arc<dyn Fn(&Received) -> Reply + Send + Sync>;

/// Scripted HTTP/1.1 server on 127.0.0.1 with keep-alive support.
pub struct MockHttpServer {
    port: u16,
    tls: bool,
    tracker: ConnectionTracker,
    log: Arc<Mutex<Vec<Received>>>,
    task: JoinHandle<()>,
}

impl MockHttpServer {
    /// Serve plain HTTP, answering every request through `handler`.
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Received) -> Reply + Send + Sync + 'static,
    {
        Self::spawn(None, Arc::new(handler)).await
    }

    /// Serve HTTPS with `acceptor`.
    pub async fn start_tls<F>(acceptor: SslAcceptor, handler: F) -> Self
    where
        F: Fn(&Received) -> Reply + Send + Sync + 'static,
    {
        Self::spawn(Some(Arc::new(acceptor)), Arc::new(handler)).await
    }

    async fn spawn(acceptor: Option<Arc<SslAcceptor>>, handler: Handler) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let tracker = ConnectionTracker::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let tls = acceptor.is_some();

        let task = {
            let tracker = tracker.clone();
            let log = log.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((tcp, peer)) = listener.accept().await else {
                        return;
                    };
                    tracker.record_connection(peer);
                    let conn = Connection {
                        peer,
                        handler: handler.clone(),
                        tracker: tracker.clone(),
                        log: log.clone(),
                    };
                    match &acceptor {
                        None => {
                            tokio::spawn(conn.serve(tcp));
                        }
                        Some(acceptor) => {
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                match tokio_boring::accept(&acceptor, tcp).await {
                                    Ok(stream) => conn.serve(stream).await,
                                    Err(e) => tracing::warn!("mock: tls accept failed: {}", e),
                                }
                            });
                        }
                    }
                }
            })
        };

        Self {
            port,
            tls,
            tracker,
            log,
            task,
        }
    }

    pub fn url(&self, path: &str) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://127.0.0.1:{}{}", scheme, self.port, path)
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.tracker.connection_count()
    }

    /// Every request received so far, in arrival order.
    pub fn received(&self) -> Vec<Received> {
        self.log.lock().unwrap().clone()
    }
}

impl Drop for MockHttpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Connection {
    peer: SocketAddr,
    handler: Handler,
    tracker: ConnectionTracker,
    log: Arc<Mutex<Vec<Received>>>,
}

impl Connection {
    async fn serve<S>(self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        loop {
            let Some(head) = read_head(&mut stream).await else {
                return;
            };
            let mut received = Received {
                peer: self.peer,
                head,
                body: Vec::new(),
            };
            let chunked = received
                .header("Transfer-Encoding")
                .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
            let length: usize = received
                .header("Content-Length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let body = if chunked {
                read_chunked(&mut stream).await
            } else {
                let mut body = vec![0u8; length];
                stream.read_exact(&mut body).await.ok().map(|_| body)
            };
            let Some(body) = body else {
                return;
            };
            received.body = body;

            self.tracker.record_request(self.peer);
            let reply = (self.handler)(&received);
            self.log.lock().unwrap().push(received);

            if !reply.delay.is_zero() {
                tokio::time::sleep(reply.delay).await;
            }
            if !reply.bytes.is_empty() {
                let out = stream.get_mut();
                if out.write_all(&reply.bytes).await.is_err() || out.flush().await.is_err() {
                    return;
                }
            }
            if let Some((pause, rest)) = reply.rest {
                tokio::time::sleep(pause).await;
                let out = stream.get_mut();
                if out.write_all(&rest).await.is_err() || out.flush().await.is_err() {
                    return;
                }
            }
            if reply.close {
                let _ = stream.get_mut().shutdown().await;
                return;
            }
        }
    }
}

async fn read_head<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Option<String> {
    let mut head = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await.ok()?;
        if n == 0 {
            return None;
        }
        if line == "\r\n" {
            if head.is_empty() {
                continue;
            }
            return Some(head.trim_end().to_string());
        }
        head.push_str(&line);
    }
}

/// Read a chunked body, returning its raw framing.
async fn read_chunked<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> Option<Vec<u8>> {
    let mut wire = Vec::new();
    loop {
        let mut size_line = String::new();
        if reader.read_line(&mut size_line).await.ok()? == 0 {
            return None;
        }
        wire.extend_from_slice(size_line.as_bytes());
        let size = usize::from_str_radix(size_line.trim().split(';').next()?, 16).ok()?;
        let mut data = vec![0u8; size + 2];
        reader.read_exact(&mut data).await.ok()?;
        wire.extend_from_slice(&data);
        if size == 0 {
            return Some(wire);
        }
    }
}
