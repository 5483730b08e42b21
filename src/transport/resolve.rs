//! Connection targets derived from request URLs.

use url::Url;

use crate::error::{Error, Result};

/// URL scheme families the transport dials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Scheme {
    Http,
    Https,
    Ws,
    Wss,
}

impl Scheme {
    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, Self::Https | Self::Wss)
    }

    pub(crate) fn is_websocket(&self) -> bool {
        matches!(self, Self::Ws | Self::Wss)
    }
}

/// Destination of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Target {
    pub(crate) scheme: Scheme,
    /// Hostname or IP literal, without IPv6 brackets.
    pub(crate) host: String,
    pub(crate) port: u16,
}

impl Target {
    pub(crate) fn from_url(url: &Url) -> Result<Self> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            other => return Err(Error::config(format!("unsupported URL scheme: {}", other))),
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::config(format!("URL has no host: {}", url)))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .unwrap_or(if scheme.is_tls() { 443 } else { 80 });
        Ok(Self { scheme, host, port })
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub(crate) fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
