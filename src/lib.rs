//! # Wraith
//!
//! Pooled HTTP transport with TLS and HTTP/2 fingerprint control.
//!
//! Wraith runs HTTP/1.1, HTTP/2 and HTTP/3 requests over direct connections
//! or proxy chains (HTTP CONNECT, HTTPS CONNECT, SOCKS5), keeps idle
//! connections in per-destination pools, and hands response bodies to the
//! caller through a bounded queue so the socket is drained and reused only
//! once the caller is done.
//!
//! ```rust,ignore
//! use wraith::{Client, Timeouts};
//!
//! let client = Client::builder()
//!     .timeouts(Timeouts::api_defaults())
//!     .build()?;
//! let body = client.get("https://example.com/").send().await?.text().await?;
//! ```

pub mod body;
pub mod cancel;
pub mod client;
pub mod error;
pub mod fingerprint;
pub mod headers;
pub mod options;
pub mod proxy;
pub mod request;
pub mod response;
pub mod timeouts;
pub mod version;

pub(crate) mod pool;
pub mod transport;

pub use body::{Body, Encoded, Multipart, Payload};
pub use cancel::Scope;
pub use client::{Client, ClientBuilder, MAX_ATTEMPTS};
pub use error::{Error, Result};
pub use fingerprint::{FingerprintProfile, Http2Settings, TlsFingerprint};
pub use headers::Headers;
pub use options::{Interceptor, RequestOptions};
pub use proxy::{Proxy, ProxyScheme, ProxySetting};
pub use request::{Request, RequestBuilder, RequestHead};
pub use response::Response;
pub use timeouts::Timeouts;
pub use transport::connector::AlpnProtocol;
pub use transport::h1::Upgraded;
pub use transport::tcp::TcpFingerprint;
pub use version::HttpVersion;
