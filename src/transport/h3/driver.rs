//! HTTP/3 connection driver - background task that reads packets and routes them to streams.
//!
//! The driver owns the QUIC connection and its datagram path. It exits when
//! the connection's force scope is cancelled, when every command sender is
//! gone, or when the connection closes, and cancels the force scope on its
//! way out.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::sleep;

use crate::cancel::Scope;
use crate::error::{Error, Result};
use crate::transport::h3::datagram::Datagram;
use quiche::h3::NameValue;

/// Command sent from the connection to the driver
pub(crate) enum DriverCommand {
    /// Send a request and get response via oneshot
    SendRequest {
        headers: Vec<quiche::h3::Header>,
        body: Option<Bytes>,
        response_tx: oneshot::Sender<Result<StreamResponse>>,
    },
}

#[derive(Debug)]
pub(crate) struct StreamResponse {
    pub(crate) status: u16,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: Bytes,
}

/// Per-stream state tracked by driver
struct DriverStreamState {
    response_tx: Option<oneshot::Sender<Result<StreamResponse>>>,
    status: Option<u16>,
    headers: Vec<(String, String)>,
    body: BytesMut,
    /// Request body bytes not yet accepted by flow control.
    outgoing: Option<Bytes>,
}

impl DriverStreamState {
    fn new(response_tx: oneshot::Sender<Result<StreamResponse>>) -> Self {
        Self {
            response_tx: Some(response_tx),
            status: None,
            headers: Vec::new(),
            body: BytesMut::new(),
            outgoing: None,
        }
    }

    fn fail(&mut self, error: Error) {
        if let Some(tx) = self.response_tx.take() {
            let _ = tx.send(Err(error));
        }
    }
}

/// HTTP/3 connection driver
pub(crate) struct H3Driver {
    command_rx: mpsc::Receiver<DriverCommand>,
    conn: quiche::Connection,
    h3_conn: quiche::h3::Connection,
    dgram: Arc<Datagram>,
    local: SocketAddr,
    force: Scope,
    streams: HashMap<u64, DriverStreamState>,
}

impl H3Driver {
    pub(crate) fn new(
        command_rx: mpsc::Receiver<DriverCommand>,
        conn: quiche::Connection,
        h3_conn: quiche::h3::Connection,
        dgram: Arc<Datagram>,
        local: SocketAddr,
        force: Scope,
    ) -> Self {
        Self {
            command_rx,
            conn,
            h3_conn,
            dgram,
            local,
            force,
            streams: HashMap::new(),
        }
    }

    pub(crate) async fn drive(mut self) -> Result<()> {
        let result = self.run().await;
        let cause = match &result {
            Ok(()) => Error::Closed,
            Err(e) => Error::quic(e.to_string()),
        };
        for (_, mut stream) in self.streams.drain() {
            stream.fail(Error::quic("connection closed"));
        }
        self.force.cancel_with(cause);
        result
    }

    async fn run(&mut self) -> Result<()> {
        let mut buf = vec![0u8; 65535];
        let mut out = vec![0u8; 1350];
        let force = self.force.clone();

        loop {
            // quiche is a state machine; flush whatever it generated.
            self.flush(&mut out).await?;

            if self.conn.is_closed() {
                return Err(Error::quic("connection closed by peer"));
            }

            let timeout_duration = self.conn.timeout().unwrap_or(Duration::from_secs(60));

            tokio::select! {
                _ = force.cancelled() => {
                    self.close(&mut out, b"client shutdown").await;
                    return Ok(());
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(c) => self.handle_command(c),
                        None => {
                            self.close(&mut out, b"client shutdown").await;
                            return Ok(());
                        }
                    }
                }

                res = self.dgram.recv(&mut buf) => {
                    let len = res.map_err(Error::Io)?;
                    let info = quiche::RecvInfo {
                        from: self.dgram.peer(),
                        to: self.local,
                    };
                    match self.conn.recv(&mut buf[..len], info) {
                        Ok(_) => {
                            self.process_h3_events()?;
                            self.send_pending_bodies();
                        }
                        Err(quiche::Error::Done) => {}
                        Err(e) => tracing::warn!("h3: QUIC recv error: {}", e),
                    }
                }

                _ = sleep(timeout_duration) => {
                    self.conn.on_timeout();
                }
            }
        }
    }

    async fn flush(&mut self, out: &mut [u8]) -> Result<()> {
        loop {
            match self.conn.send(out) {
                Ok((len, _)) => self.dgram.send(&out[..len]).await.map_err(Error::Io)?,
                Err(quiche::Error::Done) => return Ok(()),
                Err(e) => return Err(Error::Quic(format!("QUIC send error: {}", e))),
            }
        }
    }

    async fn close(&mut self, out: &mut [u8], reason: &[u8]) {
        let _ = self.conn.close(true, 0x00, reason);
        while let Ok((len, _)) = self.conn.send(out) {
            let _ = self.dgram.send(&out[..len]).await;
        }
    }

    fn handle_command(&mut self, cmd: DriverCommand) {
        match cmd {
            DriverCommand::SendRequest {
                headers,
                body,
                response_tx,
            } => {
                let body = body.filter(|b| !b.is_empty());
                let fin = body.is_none();
                match self.h3_conn.send_request(&mut self.conn, &headers, fin) {
                    Ok(stream_id) => {
                        let mut state = DriverStreamState::new(response_tx);
                        state.outgoing = body;
                        self.streams.insert(stream_id, state);
                        self.send_body(stream_id);
                    }
                    Err(e) => {
                        let _ = response_tx
                            .send(Err(Error::Quic(format!("Send request failed: {}", e))));
                    }
                }
            }
        }
    }

    /// Push as much of a stream's pending request body as flow control allows.
    fn send_body(&mut self, stream_id: u64) {
        let Some(state) = self.streams.get_mut(&stream_id) else {
            return;
        };
        let Some(data) = state.outgoing.take() else {
            return;
        };
        match self.h3_conn.send_body(&mut self.conn, stream_id, &data, true) {
            Ok(written) if written < data.len() => {
                state.outgoing = Some(data.slice(written..));
            }
            Ok(_) => {}
            Err(quiche::h3::Error::Done) => state.outgoing = Some(data),
            Err(e) => {
                state.fail(Error::Quic(format!("Send body failed: {}", e)));
                self.streams.remove(&stream_id);
            }
        }
    }

    fn send_pending_bodies(&mut self) {
        let pending: Vec<u64> = self
            .streams
            .iter()
            .filter(|(_, s)| s.outgoing.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in pending {
            self.send_body(id);
        }
    }

    fn process_h3_events(&mut self) -> Result<()> {
        loop {
            match self.h3_conn.poll(&mut self.conn) {
                Ok((stream_id, quiche::h3::Event::Headers { list, .. })) => {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        for header in list {
                            let name = String::from_utf8_lossy(header.name());
                            let value = String::from_utf8_lossy(header.value());

                            if name == ":status" {
                                stream.status = value.parse().ok();
                            } else {
                                stream.headers.push((name.into_owned(), value.into_owned()));
                            }
                        }
                    }
                }
                Ok((stream_id, quiche::h3::Event::Data)) => {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        let mut buf = vec![0u8; 65535];
                        while let Ok(len) =
                            self.h3_conn.recv_body(&mut self.conn, stream_id, &mut buf)
                        {
                            stream.body.extend_from_slice(&buf[..len]);
                        }
                    }
                }
                Ok((stream_id, quiche::h3::Event::Finished)) => {
                    if let Some(mut stream) = self.streams.remove(&stream_id) {
                        if let Some(tx) = stream.response_tx.take() {
                            let resp = match stream.status {
                                Some(status) => Ok(StreamResponse {
                                    status,
                                    headers: stream.headers,
                                    body: stream.body.freeze(),
                                }),
                                None => Err(Error::http_protocol("HTTP/3 response without :status")),
                            };
                            let _ = tx.send(resp);
                        }
                    }
                }
                Ok((stream_id, quiche::h3::Event::Reset(error_code))) => {
                    if let Some(mut stream) = self.streams.remove(&stream_id) {
                        stream.fail(Error::Quic(format!("Stream reset: {}", error_code)));
                    }
                }
                Ok((_, quiche::h3::Event::GoAway)) => {
                    tracing::debug!("h3: server sent GOAWAY");
                }
                Err(quiche::h3::Error::Done) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("h3: poll error: {}", e);
                    return Err(Error::Quic(format!("H3 poll error: {}", e)));
                }
            }
        }
        Ok(())
    }
}
