//! Negotiated HTTP version.

/// Wire protocol a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HttpVersion {
    /// HTTP/1.1 over TCP (plain or TLS).
    #[default]
    Http1_1,
    /// HTTP/2 over TLS, selected by ALPN.
    Http2,
    /// HTTP/3 over QUIC.
    Http3,
}

impl HttpVersion {
    /// Get human-readable version string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http1_1 => "HTTP/1.1",
            Self::Http2 => "HTTP/2",
            Self::Http3 => "HTTP/3",
        }
    }

    /// Check if this version supports multiplexing.
    pub fn supports_multiplexing(&self) -> bool {
        matches!(self, Self::Http2 | Self::Http3)
    }
}

impl std::fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
