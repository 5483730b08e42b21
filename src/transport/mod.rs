//! HTTP transport implementations.
//!
//! - HTTP/1.1 duplex pipeline over tokio + tokio-boring
//! - HTTP/2 via hyper + tokio-boring
//! - HTTP/3 via quiche
//!
//! Every protocol is reached through a [`Pipeline`], which the pool and the
//! orchestrator drive without caring about the wire format.

pub mod connector;
pub(crate) mod dialer;
pub(crate) mod h1;
pub(crate) mod h2;
pub(crate) mod h3;
pub(crate) mod lifecycle;
pub(crate) mod resolve;
pub(crate) mod socks5;
pub mod tcp;
pub(crate) mod tunnel;

use std::sync::Arc;

use crate::response::Response;
use crate::transport::lifecycle::{ConnState, Exchange, Failure};
use crate::version::HttpVersion;

/// One physical connection, ready to run requests.
pub(crate) enum Pipeline {
    Http1(h1::Http1Conn),
    Http2(h2::Http2Conn),
    Http3(h3::Http3Conn),
}

impl Pipeline {
    pub(crate) async fn execute(&self, exchange: Exchange) -> Result<Response, Failure> {
        match self {
            Self::Http1(c) => c.execute(exchange).await,
            Self::Http2(c) => c.execute(exchange).await,
            Self::Http3(c) => c.execute(exchange).await,
        }
    }

    pub(crate) fn state(&self) -> &Arc<ConnState> {
        match self {
            Self::Http1(c) => c.state(),
            Self::Http2(c) => c.state(),
            Self::Http3(c) => c.state(),
        }
    }

    /// Resolves when an idle connection can no longer be used.
    pub(crate) async fn idle_closed(&self) {
        match self {
            Self::Http1(c) => c.idle_closed().await,
            Self::Http2(c) => c.idle_closed().await,
            Self::Http3(c) => c.idle_closed().await,
        }
    }

    pub(crate) fn version(&self) -> HttpVersion {
        match self {
            Self::Http1(_) => HttpVersion::Http1_1,
            Self::Http2(_) => HttpVersion::Http2,
            Self::Http3(_) => HttpVersion::Http3,
        }
    }

    pub(crate) fn close(&self) {
        self.state().close();
    }
}
