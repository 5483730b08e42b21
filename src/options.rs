//! Per-request option overrides.
//!
//! Every field is optional; unset fields fall back to the client's defaults.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::fingerprint::{Http2Settings, TlsFingerprint};
use crate::proxy::{Proxy, ProxySetting};
use crate::request::RequestHead;
use crate::response::Response;
use crate::timeouts::Timeouts;

/// Callback run before dialing (with no response) and after completion
/// (with the response). Returning [`Error::UseLastResponse`] before dialing
/// short-circuits to the request's prior response; any other error aborts
/// the request or replaces its result.
///
/// [`Error::UseLastResponse`]: crate::Error::UseLastResponse
pub type Interceptor = Arc<dyn Fn(&RequestHead, Option<&Response>) -> Result<()> + Send + Sync>;

/// Overrides for a single request.
#[derive(Clone, Default)]
pub struct RequestOptions {
    pub timeouts: Option<Timeouts>,
    pub proxy: Option<ProxySetting>,
    pub disable_keep_alive: Option<bool>,
    pub disable_proxy: Option<bool>,
    pub force_http1: Option<bool>,
    pub http3: Option<bool>,
    pub tls_fingerprint: Option<TlsFingerprint>,
    pub http2_settings: Option<Http2Settings>,
    pub header_order: Option<Vec<String>>,
    /// Extra attempts allowed for retryable transport faults.
    pub retries: Option<usize>,
    pub interceptor: Option<Interceptor>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    pub fn proxy(mut self, proxy: impl Into<ProxySetting>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Route through `hops` in order.
    pub fn proxy_chain(mut self, hops: Vec<Proxy>) -> Self {
        self.proxy = Some(ProxySetting::Chain(hops));
        self
    }

    pub fn disable_keep_alive(mut self, disable: bool) -> Self {
        self.disable_keep_alive = Some(disable);
        self
    }

    pub fn disable_proxy(mut self, disable: bool) -> Self {
        self.disable_proxy = Some(disable);
        self
    }

    pub fn force_http1(mut self, force: bool) -> Self {
        self.force_http1 = Some(force);
        self
    }

    pub fn http3(mut self, enable: bool) -> Self {
        self.http3 = Some(enable);
        self
    }

    pub fn tls_fingerprint(mut self, fp: TlsFingerprint) -> Self {
        self.tls_fingerprint = Some(fp);
        self
    }

    pub fn http2_settings(mut self, settings: Http2Settings) -> Self {
        self.http2_settings = Some(settings);
        self
    }

    pub fn header_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.header_order = Some(order.into_iter().map(Into::into).collect());
        self
    }

    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn interceptor<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestHead, Option<&Response>) -> Result<()> + Send + Sync + 'static,
    {
        self.interceptor = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("timeouts", &self.timeouts)
            .field("proxy", &self.proxy)
            .field("disable_keep_alive", &self.disable_keep_alive)
            .field("disable_proxy", &self.disable_proxy)
            .field("force_http1", &self.force_http1)
            .field("http3", &self.http3)
            .field("tls_fingerprint", &self.tls_fingerprint.is_some())
            .field("http2_settings", &self.http2_settings)
            .field("header_order", &self.header_order)
            .field("retries", &self.retries)
            .field("interceptor", &self.interceptor.is_some())
            .finish()
    }
}

/// Client defaults merged with a request's overrides.
#[derive(Clone)]
pub(crate) struct Effective {
    pub(crate) timeouts: Timeouts,
    pub(crate) proxy: Option<ProxySetting>,
    pub(crate) keep_alive: bool,
    pub(crate) disable_proxy: bool,
    pub(crate) force_http1: bool,
    pub(crate) http3: bool,
    pub(crate) tls_fingerprint: Option<TlsFingerprint>,
    pub(crate) http2_settings: Http2Settings,
    pub(crate) header_order: Option<Vec<String>>,
    pub(crate) retries: usize,
    pub(crate) interceptor: Option<Interceptor>,
}

impl Effective {
    /// Apply `overrides` on top of these defaults.
    pub(crate) fn merge(&self, overrides: &RequestOptions) -> Self {
        let mut out = self.clone();
        if let Some(t) = &overrides.timeouts {
            out.timeouts = t.clone();
        }
        if let Some(p) = &overrides.proxy {
            out.proxy = Some(p.clone());
        }
        if let Some(disable) = overrides.disable_keep_alive {
            out.keep_alive = !disable;
        }
        if let Some(disable) = overrides.disable_proxy {
            out.disable_proxy = disable;
        }
        if let Some(force) = overrides.force_http1 {
            out.force_http1 = force;
        }
        if let Some(h3) = overrides.http3 {
            out.http3 = h3;
        }
        if let Some(fp) = &overrides.tls_fingerprint {
            out.tls_fingerprint = Some(fp.clone());
        }
        if let Some(s) = &overrides.http2_settings {
            out.http2_settings = s.clone();
        }
        if let Some(order) = &overrides.header_order {
            out.header_order = Some(order.clone());
        }
        if let Some(r) = overrides.retries {
            out.retries = r;
        }
        if let Some(i) = &overrides.interceptor {
            out.interceptor = Some(i.clone());
        }
        out
    }

    /// Header order for HTTP/2: the HTTP/2 fingerprint's own order first,
    /// then the general header order.
    pub(crate) fn h2_header_order(&self) -> Option<Vec<String>> {
        self.http2_settings
            .header_order
            .clone()
            .or_else(|| self.header_order.clone())
    }
}
