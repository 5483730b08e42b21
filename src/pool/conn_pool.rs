//! One pool of interchangeable connections.
//!
//! Every pooled connection has a worker task. A worker waits until its
//! connection has finished both phases of the last request, checks that it
//! may be reused, then parks a one-shot slot in the pool's idle queue and
//! waits for a task. Hand-off never blocks: a caller that finds no parked
//! worker dials instead.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::body::Body;
use crate::cancel::Scope;
use crate::pool::key::PoolKey;
use crate::pool::registry::PoolRegistry;
use crate::response::Response;
use crate::transport::lifecycle::{Exchange, Failure};
use crate::transport::Pipeline;

/// A request handed to a pool worker.
pub(crate) struct Task {
    pub(crate) exchange: Exchange,
    pub(crate) reply: oneshot::Sender<Outcome>,
}

/// What a worker reports back for a task.
pub(crate) enum Outcome {
    /// The connection ran the request.
    Done(Result<Response, Failure>),
    /// The connection went away before the request could run. The body
    /// comes back untouched so the caller can dial fresh.
    Drained(Body),
}

pub(crate) struct ConnPool {
    key: PoolKey,
    idle: Mutex<VecDeque<oneshot::Sender<Task>>>,
    parked: Notify,
    /// Live workers. The pool is dead once this reaches zero.
    total: AtomicUsize,
    force: Scope,
    safe: Scope,
    registry: Weak<PoolRegistry>,
}

impl ConnPool {
    pub(crate) fn new(key: PoolKey, root: &Scope, registry: Weak<PoolRegistry>) -> Arc<Self> {
        let force = root.child();
        let safe = force.child();
        Arc::new(Self {
            key,
            idle: Mutex::new(VecDeque::new()),
            parked: Notify::new(),
            total: AtomicUsize::new(0),
            force,
            safe,
            registry,
        })
    }

    pub(crate) fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Number of live connections.
    pub(crate) fn total(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.total() > 0 && !self.safe.is_cancelled()
    }

    /// Reserve a worker slot. Fails once the pool has died so a dead pool
    /// is never revived.
    pub(crate) fn try_acquire(&self) -> bool {
        if self.safe.is_cancelled() {
            return false;
        }
        self.total
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .is_ok()
    }

    /// Start a worker for `pipeline`. The caller must hold a slot, either
    /// from [`try_acquire`](Self::try_acquire) or [`acquire_first`](Self::acquire_first).
    pub(crate) fn spawn_worker(self: &Arc<Self>, pipeline: Pipeline) {
        let pool = self.clone();
        tokio::spawn(async move { pool.worker(pipeline).await });
    }

    /// Take the first slot of a fresh pool.
    pub(crate) fn acquire_first(&self) {
        self.total.fetch_add(1, Ordering::AcqRel);
    }

    /// Hand `task` to a parked worker. With `wait`, a caller that finds no
    /// parked worker waits up to that long for one before giving up.
    pub(crate) async fn dispatch(&self, task: Task, wait: Option<Duration>) -> Result<(), Task> {
        let deadline = wait.map(|w| Instant::now() + w);
        let mut task = task;
        loop {
            let parked = self.parked.notified();
            task = match self.try_hand_off(task) {
                Ok(()) => return Ok(()),
                Err(task) => task,
            };
            let Some(deadline) = deadline else {
                return Err(task);
            };
            tokio::select! {
                biased;
                _ = self.safe.cancelled() => return Err(task),
                _ = tokio::time::sleep_until(deadline) => return Err(task),
                _ = parked => {}
            }
        }
    }

    fn try_hand_off(&self, mut task: Task) -> Result<(), Task> {
        if self.safe.is_cancelled() {
            return Err(task);
        }
        loop {
            let Some(slot) = self.idle.lock().pop_front() else {
                return Err(task);
            };
            match slot.send(task) {
                Ok(()) => return Ok(()),
                // That worker has already left.
                Err(t) => task = t,
            }
        }
    }

    async fn worker(self: Arc<Self>, pipeline: Pipeline) {
        let state = pipeline.state().clone();
        tracing::debug!(
            "pool: conn {} ({:?}) joined {}",
            state.id,
            pipeline.version(),
            self.key
        );
        loop {
            tokio::select! {
                biased;
                _ = self.force.cancelled() => break,
                _ = state.force.cancelled() => break,
                _ = state.wait_idle() => {}
            }
            if !state.is_reusable() || self.safe.is_cancelled() {
                break;
            }

            let (tx, mut rx) = oneshot::channel();
            {
                let mut idle = self.idle.lock();
                idle.retain(|slot| !slot.is_closed());
                idle.push_back(tx);
            }
            state.mark_parked();
            self.parked.notify_one();

            let task = tokio::select! {
                biased;
                _ = self.safe.cancelled() => None,
                _ = state.safe.cancelled() => None,
                _ = pipeline.idle_closed() => None,
                task = &mut rx => task.ok(),
            };
            let task = match task {
                Some(task) => task,
                None => {
                    // A task may have been handed over while we were leaving.
                    rx.close();
                    if let Ok(task) = rx.try_recv() {
                        drain(task);
                    }
                    break;
                }
            };
            self.run(&pipeline, task).await;
        }
        tracing::debug!(
            "pool: conn {} leaving {} after {} requests",
            state.id,
            self.key,
            state.requests()
        );
        pipeline.close();
        self.release();
    }

    async fn run(&self, pipeline: &Pipeline, task: Task) {
        let Task { exchange, reply } = task;
        let execute = pipeline.execute(exchange);
        tokio::pin!(execute);
        let result = tokio::select! {
            r = &mut execute => r,
            _ = self.force.cancelled() => {
                pipeline.close();
                execute.await
            }
        };
        let outcome = match result {
            Err(Failure {
                error,
                body: Some(body),
            }) if error.is_pool_race() && body.is_replayable() => {
                tracing::debug!("pool: {} drained ({}), caller will redial", self.key, error);
                Outcome::Drained(body)
            }
            other => Outcome::Done(other),
        };
        // The caller may have given up already.
        let _ = reply.send(outcome);
    }

    fn release(&self) {
        if self.total.fetch_sub(1, Ordering::AcqRel) == 1 {
            tracing::debug!("pool: {} evicted, no connections left", self.key);
            if let Some(registry) = self.registry.upgrade() {
                registry.remove_pool(self);
            }
            self.force.cancel();
        }
    }

    /// Stop handing out connections. Requests already running finish.
    pub(crate) fn close(&self) {
        self.safe.cancel();
    }

    /// Tear every connection down now.
    pub(crate) fn force_close(&self) {
        self.force.cancel();
    }
}

fn drain(task: Task) {
    let Task { exchange, reply } = task;
    let _ = reply.send(Outcome::Drained(exchange.body));
}
