//! Immutable HTTP request.

use url::Url;

use crate::body::Body;
use crate::cache_control::CacheControl;
use crate::error::HttpError;
use crate::headers::{Headers, HeadersBuilder};

/// An HTTP request. Immutable once built; derive follow-ups with
/// [`new_builder`](Request::new_builder).
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    url: Url,
    headers: Headers,
    body: Option<Body>,
    tag: Option<String>,
}

impl Request {
    pub fn builder(method: &str, url: &str) -> RequestBuilder {
        RequestBuilder::new(method, url)
    }

    /// Convenience constructor for a body-less GET.
    pub fn get(url: &str) -> Result<Request, HttpError> {
        RequestBuilder::new("GET", url).build()
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The last value of the named header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> Option<&Body> {
        self.body.as_ref()
    }

    /// Opaque tag used to group calls for cancellation.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// The request's cache directives, parsed lazily from its headers.
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers)
    }

    /// A builder seeded with this request's method, URL, headers, body,
    /// and tag.
    pub fn new_builder(&self) -> RequestBuilder {
        RequestBuilder {
            method: self.method.clone(),
            url: Ok(self.url.clone()),
            headers: self.headers.new_builder(),
            body: self.body.clone(),
            tag: self.tag.clone(),
        }
    }
}

/// Builds a [`Request`].
#[derive(Debug)]
pub struct RequestBuilder {
    method: String,
    url: Result<Url, String>,
    headers: HeadersBuilder,
    body: Option<Body>,
    tag: Option<String>,
}

impl RequestBuilder {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_string(),
            url: Url::parse(url).map_err(|e| format!("invalid url {url}: {e}")),
            headers: HeadersBuilder::new(),
            body: None,
            tag: None,
        }
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    pub fn url(mut self, url: Url) -> Self {
        self.url = Ok(url);
        self
    }

    /// Set `name` to a single value, replacing existing values.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        // Validation errors surface at build time through Headers itself;
        // a NUL in a header is rejected there.
        let _ = self.headers.set(name, value);
        self
    }

    /// Append a value without replacing existing ones.
    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        let _ = self.headers.add(name, value);
        self
    }

    pub fn remove_header(mut self, name: &str) -> Self {
        self.headers.remove_all(name);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers.new_builder();
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn no_body(mut self) -> Self {
        self.body = None;
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.tag = Some(tag.to_string());
        self
    }

    pub fn build(self) -> Result<Request, HttpError> {
        if self.method.is_empty() {
            return Err(HttpError::Request("method is empty".to_string()));
        }
        let url = self.url.map_err(HttpError::Request)?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(HttpError::Request(format!(
                    "unsupported scheme: {other}"
                )))
            }
        }
        if url.host_str().map(str::is_empty).unwrap_or(true) {
            return Err(HttpError::Request(format!("no host in url: {url}")));
        }
        Ok(Request {
            method: self.method,
            url,
            headers: self.headers.build(),
            body: self.body,
            tag: self.tag,
        })
    }
}

/// The default port for an `http` or `https` URL scheme.
pub fn default_port(scheme: &str) -> u16 {
    if scheme == "https" {
        443
    } else {
        80
    }
}

/// The explicit port of `url`, or the scheme default.
pub fn effective_port(url: &Url) -> u16 {
    url.port().unwrap_or_else(|| default_port(url.scheme()))
}

/// The `Host` header for `url`: `host:port` only when the port differs
/// from the scheme default.
pub fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    let port = effective_port(url);
    if port == default_port(url.scheme()) {
        host.to_string()
    } else {
        format!("{host}:{port}")
    }
}

/// Request target for the HTTP/1.x request line: absolute-form when
/// speaking through an HTTP proxy without a tunnel, origin-form otherwise.
pub(crate) fn request_path(url: &Url) -> String {
    let path = url.path();
    match url.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    }
}

/// True if the method may carry a request body.
pub fn permits_request_body(method: &str) -> bool {
    !matches!(method, "GET" | "HEAD")
}

/// True if a successful response to the method invalidates cached entries
/// for the URL.
pub fn invalidates_cache(method: &str) -> bool {
    matches!(method, "POST" | "PATCH" | "PUT" | "DELETE" | "MOVE")
}
