//! Hierarchical cancellation scopes with a retrievable cause.
//!
//! A [`Scope`] wraps a [`CancellationToken`]. Children are cancelled with
//! their parent, and each scope may record the error that cancelled it so
//! the specific timeout or fault is available after the fact.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// A node in the cancellation tree.
#[derive(Clone, Debug)]
pub struct Scope {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    token: CancellationToken,
    cause: OnceLock<Arc<Error>>,
    parent: Option<Scope>,
}

impl Scope {
    /// Create a root scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                cause: OnceLock::new(),
                parent: None,
            }),
        }
    }

    /// Create a child scope, cancelled whenever this scope is.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(Inner {
                token: self.inner.token.child_token(),
                cause: OnceLock::new(),
                parent: Some(self.clone()),
            }),
        }
    }

    /// Cancel without a cause.
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    /// Cancel and record `cause`. The first cause wins; a scope that is
    /// already cancelled keeps whatever cause it had.
    pub fn cancel_with(&self, cause: Error) {
        if self.inner.token.is_cancelled() {
            return;
        }
        let _ = self.inner.cause.set(Arc::new(cause));
        self.inner.token.cancel();
    }

    /// Whether this scope (or an ancestor) has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once this scope is cancelled.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + '_ {
        self.inner.token.cancelled()
    }

    /// The recorded cause, falling back to the nearest ancestor's.
    ///
    /// Returns `None` while the scope is live.
    pub fn cause(&self) -> Option<Arc<Error>> {
        if !self.is_cancelled() {
            return None;
        }
        self.cause_inner()
    }

    fn cause_inner(&self) -> Option<Arc<Error>> {
        self.inner
            .cause
            .get()
            .cloned()
            .or_else(|| self.inner.parent.as_ref().and_then(|p| p.cause_inner()))
    }

    /// The error to report when work is aborted by this scope.
    pub fn err(&self) -> Error {
        match self.cause() {
            Some(cause) => Error::Canceled(cause),
            None => Error::Closed,
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}
