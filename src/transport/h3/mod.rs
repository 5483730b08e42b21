//! HTTP/3 over QUIC.
//!
//! A background driver owns the QUIC connection; the pipeline talks to it
//! through a command channel. Response bodies are collected by the driver
//! and handed over whole.

mod connection;
mod datagram;
mod driver;

pub(crate) use connection::{connect, quic_config};
pub(crate) use datagram::Datagram;

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::request::RequestHead;
use crate::response::{Response, ResponseBody};
use crate::timeouts::bounded;
use crate::transport::h3::driver::{DriverCommand, StreamResponse};
use crate::transport::lifecycle::{poolable, ConnState, Exchange, ExecOptions, Failure};
use crate::version::HttpVersion;

/// Connection-specific headers that have no meaning in HTTP/3.
const PROHIBITED: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
];

pub(crate) struct Http3Conn {
    state: Arc<ConnState>,
    commands: mpsc::Sender<DriverCommand>,
}

impl Http3Conn {
    pub(crate) fn new(state: Arc<ConnState>, commands: mpsc::Sender<DriverCommand>) -> Self {
        Self { state, commands }
    }

    pub(crate) fn state(&self) -> &Arc<ConnState> {
        &self.state
    }

    pub(crate) async fn execute(&self, exchange: Exchange) -> std::result::Result<Response, Failure> {
        let Exchange {
            head,
            mut body,
            opts,
        } = exchange;

        let headers = match request_headers(&head, &opts) {
            Ok(h) => h,
            Err(e) => return Err(Failure::new(e, Some(body))),
        };
        let turn = match self.state.begin() {
            Ok(turn) => turn,
            Err(e) => return Err(Failure::new(e, Some(body))),
        };

        let force = &self.state.force;
        let payload = tokio::select! {
            biased;
            _ = force.cancelled() => Err(force.err()),
            collected = body.collect() => collected,
        };
        let payload = match payload {
            Ok(p) => p,
            Err(e) => {
                self.state.close();
                return Err(Failure::new(e.staged("failed to send request body"), Some(body)));
            }
        };

        let (response_tx, response_rx) = oneshot::channel();
        let command = DriverCommand::SendRequest {
            headers,
            body: Some(payload),
            response_tx,
        };
        if self.commands.send(command).await.is_err() {
            self.state.close();
            let error = if turn.reused {
                Error::StaleConnection
            } else {
                self.state.force.err()
            };
            return Err(Failure::new(error, Some(body)));
        }
        turn.write.cancel();

        let caller = &opts.scope;
        let result = bounded(
            opts.response_header,
            async {
                tokio::select! {
                    biased;
                    _ = force.cancelled() => Err(force.err()),
                    _ = caller.cancelled() => Err(caller.err()),
                    r = response_rx => r.map_err(|_| force.err()).and_then(|r| r),
                }
            },
            Error::ResponseHeaderTimeout,
        )
        .await;

        match result {
            Ok(StreamResponse {
                status,
                headers,
                body: bytes,
            }) => {
                self.state.set_reusable(
                    opts.keep_alive
                        && poolable(status, &headers)
                        && !self.state.force.is_cancelled(),
                );
                turn.read.cancel();
                Ok(Response::with_body(
                    status,
                    headers,
                    HttpVersion::Http3,
                    head.url.clone(),
                    ResponseBody::Full(bytes),
                ))
            }
            Err(e) => {
                tracing::debug!("h3: conn {} request failed: {}", self.state.id, e);
                self.state.close();
                Err(Failure::new(e, Some(body)))
            }
        }
    }

    /// Resolves once the driver has stopped.
    pub(crate) async fn idle_closed(&self) {
        self.state.force.cancelled().await;
    }
}

fn request_headers(head: &RequestHead, opts: &ExecOptions) -> Result<Vec<quiche::h3::Header>> {
    let url = &head.url;
    let authority = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}:{}", host, port),
        (Some(host), None) => host.to_string(),
        (None, _) => return Err(Error::config(format!("URL has no host: {}", url))),
    };
    let path = match url.query() {
        Some(q) => format!("{}?{}", url.path(), q),
        None => url.path().to_string(),
    };

    let mut headers = head.headers.clone();
    if let Some(order) = &opts.h2_header_order {
        headers.reorder(order);
    }
    headers.validate()?;

    let mut out = vec![
        quiche::h3::Header::new(b":method", head.method.as_str().as_bytes()),
        quiche::h3::Header::new(b":authority", authority.as_bytes()),
        quiche::h3::Header::new(b":scheme", b"https"),
        quiche::h3::Header::new(b":path", path.as_bytes()),
    ];
    for (name, value) in headers.iter() {
        let lower = name.to_ascii_lowercase();
        if name.starts_with(':') || PROHIBITED.contains(&lower.as_str()) {
            continue;
        }
        out.push(quiche::h3::Header::new(lower.as_bytes(), value.as_bytes()));
    }
    Ok(out)
}
