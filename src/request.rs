//! Requests and the fluent request builder.

use std::fmt;
use std::time::Duration;

use http::Method;
use serde::Serialize;
use url::Url;

use crate::body::{Body, Payload};
use crate::cancel::Scope;
use crate::client::Client;
use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::options::RequestOptions;
use crate::proxy::ProxySetting;
use crate::response::Response;
use crate::timeouts::Timeouts;

/// Method, URL and headers of a request. Shared with interceptors and
/// connections while the body travels separately.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub url: Url,
    pub headers: Headers,
}

/// A request ready to be executed by a [`Client`].
pub struct Request {
    pub(crate) head: RequestHead,
    pub(crate) body: Body,
    pub(crate) options: RequestOptions,
    pub(crate) scope: Option<Scope>,
    pub(crate) prior_response: Option<Response>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            head: RequestHead {
                method,
                url,
                headers: Headers::new(),
            },
            body: Body::empty(),
            options: RequestOptions::default(),
            scope: None,
            prior_response: None,
        }
    }

    pub fn parse(method: Method, url: &str) -> Result<Self> {
        Ok(Self::new(method, Url::parse(url)?))
    }

    pub fn method(&self) -> &Method {
        &self.head.method
    }

    pub fn url(&self) -> &Url {
        &self.head.url
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    pub fn headers(&self) -> &Headers {
        &self.head.headers
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.head.headers
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    /// Encode `payload` as the body. Its content type is applied unless the
    /// request already carries one.
    pub fn set_payload(&mut self, payload: Payload) -> Result<()> {
        let encoded = payload.encode()?;
        if let Some(ct) = encoded.content_type {
            self.head.headers.insert_if_absent("Content-Type", ct);
        }
        self.body = encoded.body;
        Ok(())
    }

    pub fn options(&self) -> &RequestOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut RequestOptions {
        &mut self.options
    }

    /// Run the request under `scope`. Cancelling it aborts the request.
    pub fn set_scope(&mut self, scope: Scope) {
        self.scope = Some(scope);
    }

    /// Attach a previously received response, returned when an interceptor
    /// answers [`Error::UseLastResponse`].
    pub fn set_prior_response(&mut self, response: Response) {
        self.prior_response = Some(response);
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.head.method)
            .field("url", &self.head.url.as_str())
            .field("headers", &self.head.headers)
            .field("body", &self.body)
            .field("options", &self.options)
            .finish()
    }
}

/// Fluent builder returned by [`Client::get`] and friends.
#[must_use = "a RequestBuilder does nothing until sent"]
pub struct RequestBuilder {
    client: Client,
    request: Result<Request>,
}

impl RequestBuilder {
    pub(crate) fn new(client: Client, method: Method, url: &str) -> Self {
        Self {
            client,
            request: Request::parse(method, url),
        }
    }

    fn map(mut self, f: impl FnOnce(&mut Request) -> Result<()>) -> Self {
        if let Ok(request) = &mut self.request {
            if let Err(e) = f(request) {
                self.request = Err(e);
            }
        }
        self
    }

    /// Append a header. Repeated names are kept in insertion order.
    pub fn header(self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let (name, value) = (name.into(), value.into());
        self.map(|r| {
            r.head.headers.append(name, value);
            Ok(())
        })
    }

    pub fn headers<I, K, V>(self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.map(|r| {
            for (k, v) in headers {
                r.head.headers.append(k, v);
            }
            Ok(())
        })
    }

    pub fn body(self, body: impl Into<Body>) -> Self {
        let body = body.into();
        self.map(|r| {
            r.body = body;
            Ok(())
        })
    }

    pub fn payload(self, payload: Payload) -> Self {
        self.map(|r| r.set_payload(payload))
    }

    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Self {
        let value = serde_json::to_value(value).map_err(Error::from);
        self.map(|r| r.set_payload(Payload::Json(value?)))
    }

    pub fn form<K, V>(self, pairs: &[(K, V)]) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let pairs = pairs
            .iter()
            .map(|(k, v)| (k.as_ref().to_string(), v.as_ref().to_string()))
            .collect();
        self.map(|r| r.set_payload(Payload::Form(pairs)))
    }

    pub fn options(self, options: RequestOptions) -> Self {
        self.map(|r| {
            r.options = options;
            Ok(())
        })
    }

    pub fn timeouts(self, timeouts: Timeouts) -> Self {
        self.map(|r| {
            r.options.timeouts = Some(timeouts);
            Ok(())
        })
    }

    /// Shorthand for a total deadline on top of the client's timeouts.
    pub fn timeout(self, total: Duration) -> Self {
        let defaults = self.client.default_timeouts();
        self.map(|r| {
            let base = r.options.timeouts.clone().unwrap_or(defaults);
            r.options.timeouts = Some(base.total(total));
            Ok(())
        })
    }

    pub fn proxy(self, proxy: &str) -> Self {
        self.map(|r| {
            r.options.proxy = Some(ProxySetting::parse(proxy)?);
            Ok(())
        })
    }

    pub fn retries(self, retries: usize) -> Self {
        self.map(|r| {
            r.options.retries = Some(retries);
            Ok(())
        })
    }

    pub fn scope(self, scope: Scope) -> Self {
        self.map(|r| {
            r.scope = Some(scope);
            Ok(())
        })
    }

    pub fn build(self) -> Result<Request> {
        self.request
    }

    pub async fn send(self) -> Result<Response> {
        let request = self.request?;
        self.client.execute(request).await
    }
}
