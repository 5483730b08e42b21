//! Per-connection state shared by a pipeline and its pool worker.
//!
//! Every physical connection owns a `force` scope (cancelling it tears the
//! socket down) and a `safe` scope (cancelling it stops new requests). Each
//! request gets a fresh `write` and `read` scope under `force`; the next
//! request is accepted only once both have been cancelled.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::body::Body;
use crate::cancel::Scope;
use crate::error::{Error, Result};
use crate::request::RequestHead;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Capacity of the queue between a body pump and the caller.
pub(crate) const BODY_QUEUE_CAPACITY: usize = 16;

/// Bytes a pump will read and throw away after the caller dropped the body
/// before giving up on the connection.
pub(crate) const DISCARD_LIMIT: u64 = 64 * 1024;

/// Lifecycle and disposition state of one physical connection.
#[derive(Debug)]
pub(crate) struct ConnState {
    pub(crate) id: u64,
    pub(crate) force: Scope,
    pub(crate) safe: Scope,
    lifecycle: Mutex<Lifecycle>,
    requests: AtomicU64,
    reusable: AtomicBool,
}

#[derive(Debug)]
struct Lifecycle {
    write: Scope,
    read: Scope,
    parked: Option<oneshot::Sender<()>>,
}

/// Scopes handed to one request execution.
pub(crate) struct Turn {
    pub(crate) write: Scope,
    pub(crate) read: Scope,
    /// Whether the connection served a request before this one.
    pub(crate) reused: bool,
}

impl ConnState {
    pub(crate) fn new(parent: &Scope) -> Arc<Self> {
        let force = parent.child();
        let safe = force.child();
        let done = force.child();
        done.cancel();
        Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            force,
            safe,
            lifecycle: Mutex::new(Lifecycle {
                write: done.clone(),
                read: done,
                parked: None,
            }),
            requests: AtomicU64::new(0),
            reusable: AtomicBool::new(false),
        })
    }

    /// Start a request. Fails if the connection is closed or the previous
    /// request has not finished both its write and read phases.
    pub(crate) fn begin(&self) -> Result<Turn> {
        if self.force.is_cancelled() {
            return Err(Error::StaleConnection);
        }
        let mut lifecycle = self.lifecycle.lock();
        if !lifecycle.write.is_cancelled() || !lifecycle.read.is_cancelled() {
            return Err(Error::LastTaskRunning);
        }
        lifecycle.write = self.force.child();
        lifecycle.read = self.force.child();
        lifecycle.parked = None;
        self.reusable.store(false, Ordering::Release);
        let reused = self.requests.fetch_add(1, Ordering::AcqRel) > 0;
        Ok(Turn {
            write: lifecycle.write.clone(),
            read: lifecycle.read.clone(),
            reused,
        })
    }

    /// Both phases of the current request are finished.
    pub(crate) fn is_idle(&self) -> bool {
        let lifecycle = self.lifecycle.lock();
        lifecycle.write.is_cancelled() && lifecycle.read.is_cancelled()
    }

    /// Resolves once both phases of the current request are finished.
    pub(crate) async fn wait_idle(&self) {
        let (write, read) = {
            let lifecycle = self.lifecycle.lock();
            (lifecycle.write.clone(), lifecycle.read.clone())
        };
        write.cancelled().await;
        read.cancelled().await;
    }

    /// Register interest in the worker parking this connection again. The
    /// receiver resolves (or errors) once the connection is idle in its pool.
    pub(crate) fn park_signal(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.lifecycle.lock().parked = Some(tx);
        rx
    }

    /// Called by the pool worker once it is waiting for the next task.
    pub(crate) fn mark_parked(&self) {
        if let Some(tx) = self.lifecycle.lock().parked.take() {
            let _ = tx.send(());
        }
    }

    pub(crate) fn set_reusable(&self, reusable: bool) {
        self.reusable.store(reusable, Ordering::Release);
    }

    /// Whether the last response left the connection fit for another request.
    pub(crate) fn is_reusable(&self) -> bool {
        self.reusable.load(Ordering::Acquire) && !self.safe.is_cancelled()
    }

    pub(crate) fn requests(&self) -> u64 {
        self.requests.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.force.cancel();
    }

    pub(crate) fn close_with(&self, cause: Error) {
        self.force.cancel_with(cause);
    }
}

/// One request as handed to a pipeline.
pub(crate) struct Exchange {
    pub(crate) head: Arc<RequestHead>,
    pub(crate) body: Body,
    pub(crate) opts: Arc<ExecOptions>,
}

/// Per-request settings the pipelines need.
#[derive(Debug, Clone)]
pub(crate) struct ExecOptions {
    pub(crate) response_header: Option<Duration>,
    pub(crate) read_idle: Option<Duration>,
    pub(crate) header_order: Option<Vec<String>>,
    pub(crate) h2_header_order: Option<Vec<String>>,
    pub(crate) keep_alive: bool,
    /// The caller's scope. Watched until response headers arrive.
    pub(crate) scope: Scope,
}

/// A failed exchange. The body is handed back whenever the pipeline still
/// owned it so the orchestrator can decide about a retry.
#[derive(Debug)]
pub(crate) struct Failure {
    pub(crate) error: Error,
    pub(crate) body: Option<Body>,
}

impl Failure {
    pub(crate) fn new(error: Error, body: Option<Body>) -> Self {
        Self { error, body }
    }
}

/// Sending side of a response body queue.
pub(crate) struct Delivery {
    tx: mpsc::Sender<Result<Bytes>>,
    open: bool,
    discarded: u64,
    limit: u64,
}

impl Delivery {
    pub(crate) fn new(tx: mpsc::Sender<Result<Bytes>>, limit: u64) -> Self {
        Self {
            tx,
            open: true,
            discarded: 0,
            limit,
        }
    }

    /// Hand a chunk to the caller. Once the caller is gone chunks are
    /// counted and dropped; returns `false` when the discard budget is spent
    /// or the connection is being torn down.
    pub(crate) async fn deliver(&mut self, chunk: Bytes, force: &Scope) -> bool {
        let len = chunk.len() as u64;
        if self.open {
            tokio::select! {
                biased;
                _ = force.cancelled() => return false,
                sent = self.tx.send(Ok(chunk)) => {
                    if sent.is_ok() {
                        return true;
                    }
                    self.open = false;
                }
            }
        }
        self.discarded += len;
        self.discarded <= self.limit
    }

    /// Report a terminal error to the caller.
    pub(crate) async fn fail(&mut self, error: Error) {
        if self.open {
            let _ = self.tx.send(Err(error)).await;
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open && !self.tx.is_closed()
    }
}

/// An optional value lent out to a phase and returned when it finishes.
/// Whether a response leaves its connection fit for the pool, whatever the
/// protocol. Upgrades and event streams keep the connection for themselves.
pub(crate) fn poolable(status: u16, headers: &[(String, String)]) -> bool {
    if status == 101 {
        return false;
    }
    !headers.iter().any(|(k, v)| {
        k.eq_ignore_ascii_case("content-type")
            && v.to_ascii_lowercase().contains("text/event-stream")
    })
}

pub(crate) type Slot<T> =Arc<tokio::sync::Mutex<Option<T>>>;

pub(crate) fn slot<T>(value: T) -> Slot<T> {
    Arc::new(tokio::sync::Mutex::new(Some(value)))
}
