//! TLS and HTTP/2 fingerprinting configuration.
//!
//! These values are opaque to the pool and the pipelines: the dialer hands
//! them to BoringSSL and hyper when a connection is built.

pub mod http2;
pub mod profiles;
pub mod tls;

pub use http2::Http2Settings;
pub use profiles::FingerprintProfile;
pub use tls::TlsFingerprint;
