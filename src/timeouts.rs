//! Timeout configuration for requests.
//!
//! # Timeout Types
//!
//! - **dial**: TCP connect (and QUIC handshake) to the first hop
//! - **tls_handshake**: TLS handshake with the destination
//! - **response_header**: Request handed to a connection until response headers arrive
//! - **read_idle**: Maximum time between received body chunks (resets on each chunk)
//! - **total**: Absolute deadline for the entire request, body included
//!
//! # Usage
//!
//! ```rust,ignore
//! use wraith::{Client, Timeouts};
//! use std::time::Duration;
//!
//! // For normal API calls
//! let client = Client::builder()
//!     .timeouts(Timeouts::api_defaults())
//!     .build()?;
//!
//! // For streaming (SSE, etc.)
//! let client = Client::builder()
//!     .timeouts(Timeouts::streaming_defaults())
//!     .build()?;
//! ```

use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Response header timeout used when nothing else is configured.
pub const DEFAULT_RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(300);

/// Timeout configuration for requests.
///
/// When a field is `None`, no timeout is applied for that phase.
///
/// # Timeout Semantics
///
/// - **dial**: Does NOT reset.
/// - **tls_handshake**: Does NOT reset.
/// - **response_header**: Does NOT reset. Starts once the request is handed to a connection.
/// - **read_idle**: RESETS on each chunk received. Detects hung streams.
/// - **total**: Does NOT reset. Covers dialing, the exchange and body consumption.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// Timeout for establishing the transport connection.
    pub dial: Option<Duration>,

    /// Timeout for the TLS handshake with the destination (and HTTPS proxies).
    pub tls_handshake: Option<Duration>,

    /// Time from handing the request to a connection until response headers are parsed.
    ///
    /// Default: 300s
    pub response_header: Option<Duration>,

    /// Read idle timeout: maximum time waiting for the next chunk of response body.
    ///
    /// For SSE/streaming, this is typically your primary timeout mechanism.
    pub read_idle: Option<Duration>,

    /// Total request deadline.
    ///
    /// For streaming responses, you typically want this disabled (None) and
    /// rely on read_idle instead.
    pub total: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            dial: Some(Duration::from_secs(15)),
            tls_handshake: Some(Duration::from_secs(15)),
            response_header: Some(DEFAULT_RESPONSE_HEADER_TIMEOUT),
            read_idle: None,
            total: None,
        }
    }
}

impl Timeouts {
    /// Create a new Timeouts with all timeouts set to None.
    pub fn none() -> Self {
        Self {
            dial: None,
            tls_handshake: None,
            response_header: None,
            read_idle: None,
            total: None,
        }
    }

    /// Sensible defaults for normal API calls.
    ///
    /// - dial: 10s
    /// - tls_handshake: 10s
    /// - response_header: 30s
    /// - read_idle: 30s
    /// - total: 120s
    pub fn api_defaults() -> Self {
        Self {
            dial: Some(Duration::from_secs(10)),
            tls_handshake: Some(Duration::from_secs(10)),
            response_header: Some(Duration::from_secs(30)),
            read_idle: Some(Duration::from_secs(30)),
            total: Some(Duration::from_secs(120)),
        }
    }

    /// Sensible defaults for streaming responses (SSE, chunked downloads, etc.).
    ///
    /// Key differences from api_defaults():
    /// - total: None (streams can run indefinitely)
    /// - read_idle: 120s
    pub fn streaming_defaults() -> Self {
        Self {
            dial: Some(Duration::from_secs(10)),
            tls_handshake: Some(Duration::from_secs(10)),
            response_header: Some(Duration::from_secs(30)),
            read_idle: Some(Duration::from_secs(120)),
            total: None,
        }
    }

    /// Set dial timeout.
    pub fn dial(mut self, timeout: Duration) -> Self {
        self.dial = Some(timeout);
        self
    }

    /// Set TLS handshake timeout.
    pub fn tls_handshake(mut self, timeout: Duration) -> Self {
        self.tls_handshake = Some(timeout);
        self
    }

    /// Set response header timeout.
    pub fn response_header(mut self, timeout: Duration) -> Self {
        self.response_header = Some(timeout);
        self
    }

    /// Set read idle timeout.
    pub fn read_idle(mut self, timeout: Duration) -> Self {
        self.read_idle = Some(timeout);
        self
    }

    /// Set total request deadline.
    pub fn total(mut self, timeout: Duration) -> Self {
        self.total = Some(timeout);
        self
    }

    /// Disable read idle timeout.
    pub fn no_read_idle_timeout(mut self) -> Self {
        self.read_idle = None;
        self
    }

    /// Disable total timeout.
    pub fn no_total_timeout(mut self) -> Self {
        self.total = None;
        self
    }
}

/// Run `fut` under an optional deadline, mapping expiry through `on_elapsed`.
pub(crate) async fn bounded<T, F>(
    limit: Option<Duration>,
    fut: F,
    on_elapsed: fn(Duration) -> Error,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| on_elapsed(limit))?,
        None => fut.await,
    }
}

/// Receive from a channel with idle timeout.
///
/// The timeout resets on each successful receive, making it suitable for
/// detecting hung streams without killing healthy long-running transfers.
pub async fn recv_with_idle_timeout<T>(
    rx: &mut tokio::sync::mpsc::Receiver<T>,
    idle: Duration,
) -> Result<Option<T>> {
    tokio::select! {
        biased;
        v = rx.recv() => Ok(v),
        _ = tokio::time::sleep(idle) => Err(Error::ReadIdleTimeout(idle)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_response_header_timeout() {
        let t = Timeouts::default();
        assert_eq!(t.response_header, Some(Duration::from_secs(300)));
        assert_eq!(t.total, None);
    }

    #[test]
    fn test_api_defaults() {
        let t = Timeouts::api_defaults();
        assert_eq!(t.dial, Some(Duration::from_secs(10)));
        assert_eq!(t.response_header, Some(Duration::from_secs(30)));
        assert_eq!(t.read_idle, Some(Duration::from_secs(30)));
        assert_eq!(t.total, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_streaming_defaults() {
        let t = Timeouts::streaming_defaults();
        assert_eq!(t.read_idle, Some(Duration::from_secs(120)));
        assert_eq!(t.total, None); // Key difference
    }

    #[test]
    fn test_builder_pattern() {
        let t = Timeouts::none()
            .dial(Duration::from_secs(5))
            .response_header(Duration::from_secs(15))
            .read_idle(Duration::from_secs(60));

        assert_eq!(t.dial, Some(Duration::from_secs(5)));
        assert_eq!(t.response_header, Some(Duration::from_secs(15)));
        assert_eq!(t.read_idle, Some(Duration::from_secs(60)));
        assert_eq!(t.total, None);
    }

    #[tokio::test]
    async fn test_bounded_maps_elapsed() {
        let res: Result<()> = bounded(
            Some(Duration::from_millis(10)),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Error::DialTimeout,
        )
        .await;
        assert!(matches!(res, Err(Error::DialTimeout(_))));
    }

    #[tokio::test]
    async fn test_recv_with_idle_timeout() {
        let (tx, mut rx) = tokio::sync::mpsc::channel::<u8>(1);
        tx.send(7).await.unwrap();
        let idle = Duration::from_millis(20);
        assert_eq!(recv_with_idle_timeout(&mut rx, idle).await.unwrap(), Some(7));
        assert!(matches!(
            recv_with_idle_timeout(&mut rx, idle).await,
            Err(Error::ReadIdleTimeout(_))
        ));
    }
}
