//! The client and its round-trip orchestration.
//!
//! [`Client::execute`] runs one request: interceptors, proxy resolution,
//! then a bounded loop that either hands the request to an idle pooled
//! connection or dials a fresh one. Pool races (a pooled connection that
//! went away under us) are retried silently; other transport faults only
//! while the request's retry budget lasts.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use tokio::sync::oneshot;

use crate::body::Body;
use crate::cancel::Scope;
use crate::error::{Error, Result};
use crate::fingerprint::{FingerprintProfile, Http2Settings, TlsFingerprint};
use crate::options::{Effective, Interceptor};
use crate::pool::{Outcome, PoolKey, PoolRegistry, Task};
use crate::proxy::{Proxy, ProxySetting};
use crate::request::{Request, RequestBuilder, RequestHead};
use crate::response::Response;
use crate::timeouts::Timeouts;
use crate::transport::connector::{AlpnOffer, TrustConfig};
use crate::transport::dialer::{check_h3, DialRequest, Dialer};
use crate::transport::lifecycle::{ExecOptions, Exchange, Failure};
use crate::transport::resolve::Target;
use crate::transport::tcp::{TcpFingerprint, TcpOptions};
use crate::transport::Pipeline;

/// Upper bound on attempts for one request, silent pool retries included.
pub const MAX_ATTEMPTS: usize = 10;

/// HTTP client with connection pooling and fingerprint control.
///
/// Cloning is cheap; clones share one pool registry. Dropping the last
/// clone closes idle connections and lets running requests finish.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    registry: Arc<PoolRegistry>,
    dialer: Dialer,
    defaults: Effective,
    default_headers: Vec<(&'static str, &'static str)>,
    max_idle_wait: Option<Duration>,
    root: Scope,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.registry.close();
    }
}

/// Where one request goes and how it gets there.
struct Route {
    key: PoolKey,
    target: Target,
    chain: Vec<Proxy>,
    alpn: AlpnOffer,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    pub fn put(&self, url: &str) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    pub fn patch(&self, url: &str) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    pub fn delete(&self, url: &str) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    pub fn head(&self, url: &str) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, url)
    }

    /// Timeouts applied when a request does not override them.
    pub fn default_timeouts(&self) -> Timeouts {
        self.inner.defaults.timeouts.clone()
    }

    /// Number of destinations with pooled connections.
    pub fn pool_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Stop reusing connections. Requests already running finish normally.
    pub fn close(&self) {
        tracing::debug!("pool: closing all pools");
        self.inner.registry.close();
    }

    /// Tear down every pooled connection now, aborting requests on them.
    pub fn force_close(&self) {
        tracing::debug!("pool: force closing all pools");
        self.inner.registry.force_close();
    }

    /// Execute `request`.
    pub async fn execute(&self, request: Request) -> Result<Response> {
        let Request {
            mut head,
            body,
            options,
            scope,
            prior_response,
        } = request;
        let eff = self.inner.defaults.merge(&options);

        for (name, value) in &self.inner.default_headers {
            head.headers.insert_if_absent(*name, *value);
        }

        if let Some(interceptor) = &eff.interceptor {
            match interceptor(&head, None) {
                Ok(()) => {}
                Err(Error::UseLastResponse) => {
                    tracing::debug!("pool: interceptor reused prior response for {}", head.url);
                    return prior_response.ok_or(Error::NoPriorResponse);
                }
                Err(e) => return Err(e),
            }
        }

        let route = self.route(&head, &eff).await?;

        let caller = match &scope {
            Some(parent) => parent.child(),
            None => Scope::new(),
        };
        if let Some(total) = eff.timeouts.total {
            let deadline = caller.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(total) => deadline.cancel_with(Error::TotalTimeout(total)),
                    _ = deadline.cancelled() => {}
                }
            });
        }

        let head = Arc::new(head);
        let opts = Arc::new(ExecOptions {
            response_header: eff.timeouts.response_header,
            read_idle: eff.timeouts.read_idle,
            header_order: eff.header_order.clone(),
            h2_header_order: eff.h2_header_order(),
            keep_alive: eff.keep_alive,
            scope: caller.clone(),
        });

        let result = self.round_trip(&route, &eff, &head, body, &opts, &caller).await;
        let mut response = match result {
            Ok(response) => response,
            Err(e) => {
                caller.cancel();
                return Err(e);
            }
        };
        response.guard_scope(caller);

        if let Some(interceptor) = &eff.interceptor {
            interceptor(&head, Some(&response))?;
        }
        Ok(response)
    }

    async fn route(&self, head: &RequestHead, eff: &Effective) -> Result<Route> {
        let target = Target::from_url(&head.url)?;
        let chain = match (&eff.proxy, eff.disable_proxy) {
            (Some(setting), false) => setting.resolve(&head.url).await?,
            _ => Vec::new(),
        };
        if eff.http3 {
            check_h3(&chain, &target)?;
        }
        let http1_only = eff.force_http1 || target.scheme.is_websocket();
        let alpn = if http1_only {
            AlpnOffer::Http1
        } else {
            AlpnOffer::H2Http1
        };
        Ok(Route {
            key: PoolKey::new(&chain, &target, http1_only, eff.http3),
            target,
            chain,
            alpn,
        })
    }

    async fn round_trip(
        &self,
        route: &Route,
        eff: &Effective,
        head: &Arc<RequestHead>,
        body: Body,
        opts: &Arc<ExecOptions>,
        caller: &Scope,
    ) -> Result<Response> {
        let mut body = Some(body);
        let mut budget = eff.retries;

        for attempt in 1..=MAX_ATTEMPTS {
            if caller.is_cancelled() {
                return Err(caller.err());
            }
            let body_now = match body.take() {
                Some(b) if b.is_replayable() => b,
                _ => return Err(Error::BodyNotReplayable),
            };
            let exchange = Exchange {
                head: head.clone(),
                body: body_now,
                opts: opts.clone(),
            };

            let Failure { error, body: back } = match self.attempt(route, eff, exchange, caller).await {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };
            body = back;

            if caller.is_cancelled() {
                return Err(caller.err());
            }
            if error.is_pool_race() {
                tracing::debug!("pool: attempt {} on {} raced: {}", attempt, route.key, error);
                continue;
            }
            if error.is_retryable() && budget > 0 {
                budget -= 1;
                tracing::warn!(
                    "pool: attempt {} on {} failed, retrying ({} left): {}",
                    attempt,
                    route.key,
                    budget,
                    error
                );
                continue;
            }
            return Err(error);
        }
        Err(Error::RetryLimit {
            attempts: MAX_ATTEMPTS,
        })
    }

    /// One try: an idle pooled connection if there is one, else a new dial.
    async fn attempt(
        &self,
        route: &Route,
        eff: &Effective,
        exchange: Exchange,
        caller: &Scope,
    ) -> std::result::Result<Response, Failure> {
        let mut exchange = exchange;
        if eff.keep_alive {
            if let Some(pool) = self.inner.registry.get(&route.key) {
                let (reply, outcome) = oneshot::channel();
                match pool.dispatch(Task { exchange, reply }, self.inner.max_idle_wait).await {
                    Ok(()) => {
                        tracing::trace!("pool: handed request to idle connection on {}", route.key);
                        let outcome = tokio::select! {
                            biased;
                            _ = caller.cancelled() => return Err(Failure::new(caller.err(), None)),
                            outcome = outcome => outcome,
                        };
                        return match outcome {
                            Ok(Outcome::Done(result)) => result,
                            Ok(Outcome::Drained(body)) => {
                                Err(Failure::new(Error::PoolDrained, Some(body)))
                            }
                            Err(_) => Err(Failure::new(Error::PoolDrained, None)),
                        };
                    }
                    Err(task) => exchange = task.exchange,
                }
            }
        }
        self.dial_and_run(route, eff, exchange, caller).await
    }

    async fn dial_and_run(
        &self,
        route: &Route,
        eff: &Effective,
        exchange: Exchange,
        caller: &Scope,
    ) -> std::result::Result<Response, Failure> {
        let dial = self.inner.dialer.dial(DialRequest {
            chain: &route.chain,
            target: &route.target,
            timeouts: &eff.timeouts,
            tls_fingerprint: eff.tls_fingerprint.as_ref(),
            http2_settings: &eff.http2_settings,
            alpn: route.alpn,
            http3: eff.http3,
            parent: &self.inner.root,
        });
        let dialed = tokio::select! {
            biased;
            _ = caller.cancelled() => Err(caller.err()),
            dialed = dial => dialed,
        };
        let pipeline = match dialed {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("dialer: {} failed: {}", route.key, e);
                return Err(Failure::new(e, Some(exchange.body)));
            }
        };
        tracing::debug!(
            "pool: dialed conn {} ({:?}) for {}",
            pipeline.state().id,
            pipeline.version(),
            route.key
        );

        let result = pipeline.execute(exchange).await;
        if eff.keep_alive && result.is_ok() {
            self.inner.registry.attach(route.key.clone(), pipeline);
        } else {
            reap(pipeline);
        }
        result
    }
}

/// Close a connection that will not be pooled once its request is done.
fn reap(pipeline: Pipeline) {
    tokio::spawn(async move {
        let state = pipeline.state().clone();
        tokio::select! {
            _ = state.wait_idle() => {}
            _ = state.force.cancelled() => {}
        }
        pipeline.close();
    });
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("pools", &self.inner.registry.len())
            .field("timeouts", &self.inner.defaults.timeouts)
            .field("keep_alive", &self.inner.defaults.keep_alive)
            .finish()
    }
}

/// Builder for [`Client`].
#[must_use]
pub struct ClientBuilder {
    profile: FingerprintProfile,
    tls_fingerprint: Option<TlsFingerprint>,
    http2_settings: Option<Http2Settings>,
    header_order: Option<Vec<String>>,
    timeouts: Timeouts,
    proxy: Option<ProxySetting>,
    disable_keep_alive: bool,
    force_http1: bool,
    http3: bool,
    retries: usize,
    max_idle_wait: Option<Duration>,
    interceptor: Option<Interceptor>,
    tcp: TcpOptions,
    trust: TrustConfig,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            profile: FingerprintProfile::default(),
            tls_fingerprint: None,
            http2_settings: None,
            header_order: None,
            timeouts: Timeouts::default(),
            proxy: None,
            disable_keep_alive: false,
            force_http1: false,
            http3: false,
            retries: 0,
            max_idle_wait: None,
            interceptor: None,
            tcp: TcpOptions::default(),
            trust: TrustConfig::default(),
        }
    }

    /// Browser profile supplying default headers, header order and the TLS
    /// and HTTP/2 fingerprints.
    pub fn fingerprint(mut self, profile: FingerprintProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Override the profile's TLS fingerprint.
    pub fn tls_fingerprint(mut self, fp: TlsFingerprint) -> Self {
        self.tls_fingerprint = Some(fp);
        self
    }

    /// Override the profile's HTTP/2 settings.
    pub fn http2_settings(mut self, settings: Http2Settings) -> Self {
        self.http2_settings = Some(settings);
        self
    }

    /// Override the profile's HTTP/1.1 header order.
    pub fn header_order<I, S>(mut self, order: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.header_order = Some(order.into_iter().map(Into::into).collect());
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn proxy(mut self, proxy: impl Into<ProxySetting>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    /// Resolve the proxy per request. `Ok(None)` from the resolver means
    /// connect directly.
    pub fn proxy_resolver<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&url::Url) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Option<String>>> + Send + 'static,
    {
        self.proxy = Some(ProxySetting::dynamic(f));
        self
    }

    /// Dial a new connection for every request and close it afterwards.
    pub fn disable_keep_alive(mut self, disable: bool) -> Self {
        self.disable_keep_alive = disable;
        self
    }

    /// Offer only `http/1.1` in ALPN.
    pub fn force_http1(mut self, force: bool) -> Self {
        self.force_http1 = force;
        self
    }

    /// Use HTTP/3 over QUIC. Requires https URLs and, behind proxies, a
    /// SOCKS5 last hop.
    pub fn http3(mut self, enable: bool) -> Self {
        self.http3 = enable;
        self
    }

    /// Extra attempts for retryable transport faults.
    pub fn retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// How long a request waits for a busy pooled connection to become idle
    /// before dialing a new one. Unset means it never waits.
    pub fn max_idle_wait(mut self, wait: Duration) -> Self {
        self.max_idle_wait = Some(wait);
        self
    }

    pub fn interceptor<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestHead, Option<&Response>) -> Result<()> + Send + Sync + 'static,
    {
        self.interceptor = Some(Arc::new(f));
        self
    }

    /// Trust an extra root certificate (DER or PEM).
    pub fn add_root_certificate(mut self, cert: impl Into<Vec<u8>>) -> Self {
        self.trust.root_certs.push(cert.into());
        self
    }

    /// Skip certificate and hostname verification.
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.trust.accept_invalid_certs = accept;
        self
    }

    pub fn tcp_fingerprint(mut self, fp: TcpFingerprint) -> Self {
        self.tcp.fingerprint = Some(fp);
        self
    }

    /// Bind outgoing sockets to `addr`.
    pub fn local_address(mut self, addr: IpAddr) -> Self {
        self.tcp.local_addr = Some(addr);
        self
    }

    pub fn tcp_keepalive(mut self, interval: Duration) -> Self {
        self.tcp.keepalive = Some(interval);
        self
    }

    pub fn build(self) -> Result<Client> {
        let profile = self.profile;
        let defaults = Effective {
            timeouts: self.timeouts,
            proxy: self.proxy,
            keep_alive: !self.disable_keep_alive,
            disable_proxy: false,
            force_http1: self.force_http1,
            http3: self.http3,
            tls_fingerprint: self.tls_fingerprint.or_else(|| profile.tls_fingerprint()),
            http2_settings: self.http2_settings.unwrap_or_else(|| profile.http2_settings()),
            header_order: self.header_order.or_else(|| profile.header_order()),
            retries: self.retries,
            interceptor: self.interceptor,
        };
        let root = Scope::new();
        Ok(Client {
            inner: Arc::new(ClientInner {
                registry: PoolRegistry::new(root.clone()),
                dialer: Dialer::new(self.tcp, self.trust),
                defaults,
                default_headers: profile.default_headers(),
                max_idle_wait: self.max_idle_wait,
                root,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::RequestOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use url::Url;

    fn plain_client() -> ClientBuilder {
        Client::builder().fingerprint(FingerprintProfile::None)
    }

    #[tokio::test]
    async fn test_interceptor_returns_prior_response() {
        let client = plain_client()
            .interceptor(|_, resp| match resp {
                None => Err(Error::UseLastResponse),
                Some(_) => Ok(()),
            })
            .build()
            .unwrap();
        let url = Url::parse("http://127.0.0.1:9/never").unwrap();
        let mut req = Request::new(Method::GET, url.clone());
        req.set_prior_response(Response::new(204, Vec::new(), "", url));
        let resp = client.execute(req).await.unwrap();
        assert_eq!(resp.status(), 204);
    }

    #[tokio::test]
    async fn test_interceptor_without_prior_response() {
        let client = plain_client()
            .interceptor(|_, _| Err(Error::UseLastResponse))
            .build()
            .unwrap();
        let err = client.get("http://127.0.0.1:9/").send().await.unwrap_err();
        assert!(matches!(err, Error::NoPriorResponse));
    }

    #[tokio::test]
    async fn test_h3_through_http_proxy_is_config_error() {
        let client = plain_client().http3(true).build().unwrap();
        let err = client
            .get("https://example.com/")
            .options(RequestOptions::new().proxy(Proxy::parse("http://127.0.0.1:9").unwrap()))
            .send()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
    }

    #[tokio::test]
    async fn test_h3_over_plain_http_is_config_error() {
        let client = plain_client().http3(true).build().unwrap();
        let err = client.get("http://example.com/").send().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_refused_dial_is_not_retried_without_budget() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = plain_client().build().unwrap();
        let err = client
            .get(&format!("http://{}/", addr))
            .send()
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some("dial"));
    }

    #[tokio::test]
    async fn test_connection_reused_after_body_read() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { return };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) => {}
                        }
                        let reply = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";
                        if sock.write_all(reply).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        let client = plain_client().build().unwrap();
        let url = format!("http://{}/", addr);
        for _ in 0..3 {
            let resp = client.get(&url).send().await.unwrap();
            assert_eq!(resp.text().await.unwrap(), "ok");
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert_eq!(client.pool_count(), 1);
    }

    #[tokio::test]
    async fn test_total_timeout_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(sock);
        });
        let client = plain_client().build().unwrap();
        let err = client
            .get(&format!("http://{}/", addr))
            .timeout(Duration::from_millis(100))
            .send()
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::TotalTimeout(_)), "{err}");
    }
}
