//! Error types for the wraith crate.

use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while executing a request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// HTTP protocol error.
    #[error("HTTP protocol error: {0}")]
    HttpProtocol(String),

    /// Decompression error.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// URL parsing error.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// QUIC/HTTP3 error.
    #[error("QUIC error: {0}")]
    Quic(String),

    /// Proxy negotiation failed (CONNECT refused, SOCKS5 reply error).
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Invalid combination of options. Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// TCP connect did not finish in time.
    #[error("Dial timeout after {0:?}")]
    DialTimeout(Duration),

    /// TLS handshake did not finish in time.
    #[error("TLS handshake timeout after {0:?}")]
    TlsHandshakeTimeout(Duration),

    /// Response headers were not received in time.
    #[error("Response header timeout after {0:?} - server did not respond with headers")]
    ResponseHeaderTimeout(Duration),

    /// Read idle timeout (no data received within duration).
    #[error("Read idle timeout after {0:?} - stream may be hung")]
    ReadIdleTimeout(Duration),

    /// Total request deadline exceeded.
    #[error("Total request deadline exceeded after {0:?}")]
    TotalTimeout(Duration),

    /// An error annotated with the stage in which it happened.
    #[error("{stage}: {source}")]
    Staged {
        stage: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// A scope was cancelled with a recorded cause.
    #[error("canceled: {0}")]
    Canceled(Arc<Error>),

    /// A scope was cancelled without a cause.
    #[error("closed")]
    Closed,

    /// The previous request on this connection has not finished.
    #[error("last task still running")]
    LastTaskRunning,

    /// The pool was torn down before the task was serviced.
    #[error("connection pool drained")]
    PoolDrained,

    /// A pooled connection was closed by the peer before responding.
    #[error("pooled connection closed before response")]
    StaleConnection,

    /// The request body was partially consumed and cannot be sent again.
    #[error("request body already read, cannot retry")]
    BodyNotReplayable,

    /// Too many attempts for one request.
    #[error("retry limit exceeded after {attempts} attempts")]
    RetryLimit { attempts: usize },

    /// Interceptor sentinel asking to return the request's prior response.
    #[error("use last response")]
    UseLastResponse,

    /// `UseLastResponse` was returned but no prior response is attached.
    #[error("use last response requested but response is nil")]
    NoPriorResponse,
}

impl Error {
    /// Create an IO error with custom message.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(io::Error::other(message.into()))
    }

    /// Create an HTTP protocol error.
    pub fn http_protocol(message: impl Into<String>) -> Self {
        Self::HttpProtocol(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls(message.into())
    }

    /// Create a QUIC error.
    pub fn quic(message: impl Into<String>) -> Self {
        Self::Quic(message.into())
    }

    /// Create a proxy error.
    pub fn proxy(message: impl Into<String>) -> Self {
        Self::Proxy(message.into())
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Wrap this error with a stage tag.
    pub fn staged(self, stage: &'static str) -> Self {
        Self::Staged {
            stage,
            source: Box::new(self),
        }
    }

    /// The stage tag of the outermost `Staged` wrapper, if any.
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            Self::Staged { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// The error with every stage tag and cancellation wrapper peeled off.
    pub fn root(&self) -> &Error {
        match self {
            Self::Staged { source, .. } => source.root(),
            Self::Canceled(cause) => cause.root(),
            other => other,
        }
    }

    /// Transient pool races that the orchestrator retries silently.
    pub fn is_pool_race(&self) -> bool {
        matches!(
            self.root(),
            Self::PoolDrained | Self::LastTaskRunning | Self::StaleConnection
        )
    }

    /// Transport faults that may be retried when the retry budget allows it.
    pub fn is_retryable(&self) -> bool {
        if self.is_pool_race() {
            return true;
        }
        matches!(
            self.root(),
            Self::Io(_)
                | Self::Connection(_)
                | Self::Tls(_)
                | Self::Quic(_)
                | Self::Proxy(_)
                | Self::DialTimeout(_)
                | Self::TlsHandshakeTimeout(_)
        )
    }

    /// Whether this error is a timeout of any kind.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.root(),
            Self::DialTimeout(_)
                | Self::TlsHandshakeTimeout(_)
                | Self::ResponseHeaderTimeout(_)
                | Self::ReadIdleTimeout(_)
                | Self::TotalTimeout(_)
        )
    }
}
