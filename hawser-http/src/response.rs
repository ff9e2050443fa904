//! Immutable HTTP response skeleton with a one-shot streaming body.

use crate::auth::Challenge;
use crate::body::ResponseBody;
use crate::cache_control::CacheControl;
use crate::connection::Protocol;
use crate::headers::{Headers, HeadersBuilder};
use crate::request::Request;

/// An HTTP response.
///
/// The skeleton (status line, headers, back-links) is immutable; the body
/// is a one-shot stream taken with [`take_body`](Response::take_body).
/// Back-links to the network and cache responses that produced this one,
/// and to the prior response in a redirect chain, carry no body.
#[derive(Debug)]
pub struct Response {
    protocol: Protocol,
    code: u16,
    message: String,
    headers: Headers,
    body: Option<ResponseBody>,
    request: Option<Request>,
    handshake: Option<Handshake>,
    network_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
    sent_request_at_millis: i64,
    received_response_at_millis: i64,
}

/// A record of the TLS handshake that produced a response. Cached HTTPS
/// responses without one are never served from the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Negotiated TLS protocol version, e.g. `TLSv1_3`.
    pub tls_version: String,
    /// Negotiated cipher suite name.
    pub cipher_suite: String,
}

impl Response {
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Numeric status code.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Status message from the status line, possibly empty.
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The last value of the named header.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> Option<&ResponseBody> {
        self.body.as_ref()
    }

    /// Take the one-shot body. Subsequent calls return `None`.
    pub fn take_body(&mut self) -> Option<ResponseBody> {
        self.body.take()
    }

    /// The request that initiated this response, as issued by the caller.
    pub fn request(&self) -> Option<&Request> {
        self.request.as_ref()
    }

    /// The TLS handshake of the connection that carried this response.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// The raw network response, if the network was consulted.
    pub fn network_response(&self) -> Option<&Response> {
        self.network_response.as_deref()
    }

    /// The cached response this one was served or validated from.
    pub fn cache_response(&self) -> Option<&Response> {
        self.cache_response.as_deref()
    }

    /// The response that triggered the redirect or auth follow-up that
    /// produced this one.
    pub fn prior_response(&self) -> Option<&Response> {
        self.prior_response.as_deref()
    }

    pub fn sent_request_at_millis(&self) -> i64 {
        self.sent_request_at_millis
    }

    pub fn received_response_at_millis(&self) -> i64 {
        self.received_response_at_millis
    }

    /// True for 2xx codes.
    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers)
    }

    /// Authentication challenges for a 401 (`WWW-Authenticate`) or 407
    /// (`Proxy-Authenticate`) response.
    pub fn challenges(&self) -> Vec<Challenge> {
        let header = match self.code {
            401 => "WWW-Authenticate",
            407 => "Proxy-Authenticate",
            _ => return Vec::new(),
        };
        self.headers
            .values(header)
            .into_iter()
            .filter_map(Challenge::parse)
            .collect()
    }

    /// Drop the body, keeping the skeleton. Used for back-links.
    pub fn strip_body(mut self) -> Response {
        self.body = None;
        self
    }

    /// A builder seeded with this response's metadata but no body.
    pub fn new_builder(&self) -> ResponseBuilder {
        ResponseBuilder {
            protocol: self.protocol,
            code: self.code,
            message: self.message.clone(),
            headers: self.headers.new_builder(),
            body: None,
            request: self.request.clone(),
            handshake: self.handshake.clone(),
            network_response: None,
            cache_response: None,
            prior_response: None,
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
        }
    }

    /// A builder that takes ownership of everything, body included.
    pub fn into_builder(self) -> ResponseBuilder {
        ResponseBuilder {
            protocol: self.protocol,
            code: self.code,
            message: self.message,
            headers: self.headers.new_builder(),
            body: self.body,
            request: self.request,
            handshake: self.handshake,
            network_response: self.network_response,
            cache_response: self.cache_response,
            prior_response: self.prior_response,
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
        }
    }
}

/// Builds a [`Response`].
#[derive(Debug)]
pub struct ResponseBuilder {
    protocol: Protocol,
    code: u16,
    message: String,
    headers: HeadersBuilder,
    body: Option<ResponseBody>,
    request: Option<Request>,
    handshake: Option<Handshake>,
    network_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
    sent_request_at_millis: i64,
    received_response_at_millis: i64,
}

impl Default for ResponseBuilder {
    fn default() -> Self {
        Self {
            protocol: Protocol::Http11,
            code: 0,
            message: String::new(),
            headers: HeadersBuilder::new(),
            body: None,
            request: None,
            handshake: None,
            network_response: None,
            cache_response: None,
            prior_response: None,
            sent_request_at_millis: 0,
            received_response_at_millis: 0,
        }
    }
}

impl ResponseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn code(mut self, code: u16) -> Self {
        self.code = code;
        self
    }

    pub fn message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers.new_builder();
        self
    }

    /// Set `name` to a single value, replacing existing values.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        let _ = self.headers.set(name, value);
        self
    }

    pub fn add_header(mut self, name: &str, value: &str) -> Self {
        let _ = self.headers.add(name, value);
        self
    }

    /// Append a raw header line from the wire.
    pub fn add_lenient_header_line(mut self, line: &str) -> Self {
        self.headers.add_lenient_line(line);
        self
    }

    pub fn body(mut self, body: Option<ResponseBody>) -> Self {
        self.body = body;
        self
    }

    pub fn request(mut self, request: Request) -> Self {
        self.request = Some(request);
        self
    }

    pub fn handshake(mut self, handshake: Option<Handshake>) -> Self {
        self.handshake = handshake;
        self
    }

    pub fn network_response(mut self, response: Option<Response>) -> Self {
        self.network_response = response.map(Box::new);
        self
    }

    pub fn cache_response(mut self, response: Option<Response>) -> Self {
        self.cache_response = response.map(Box::new);
        self
    }

    pub fn prior_response(mut self, response: Option<Response>) -> Self {
        self.prior_response = response.map(Box::new);
        self
    }

    pub fn sent_request_at_millis(mut self, millis: i64) -> Self {
        self.sent_request_at_millis = millis;
        self
    }

    pub fn received_response_at_millis(mut self, millis: i64) -> Self {
        self.received_response_at_millis = millis;
        self
    }

    pub fn build(self) -> Response {
        Response {
            protocol: self.protocol,
            code: self.code,
            message: self.message,
            headers: self.headers.build(),
            body: self.body,
            request: self.request,
            handshake: self.handshake,
            network_response: self.network_response,
            cache_response: self.cache_response,
            prior_response: self.prior_response,
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn body_is_one_shot() {
        let mut response = ResponseBuilder::new()
            .code(200)
            .body(Some(ResponseBody::from_bytes(None, Bytes::from("x"))))
            .build();
        assert!(response.body().is_some());
        assert!(response.take_body().is_some());
        assert!(response.take_body().is_none());
        assert!(response.body().is_none());
    }

    #[test]
    fn challenges_parse_for_401_and_407() {
        let response = ResponseBuilder::new()
            .code(401)
            .add_header("WWW-Authenticate", "Basic realm=\"site\"")
            .build();
        let challenges = response.challenges();
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges[0].scheme, "Basic");
        assert_eq!(challenges[0].realm, "site");

        let response = ResponseBuilder::new()
            .code(200)
            .add_header("WWW-Authenticate", "Basic realm=\"site\"")
            .build();
        assert!(response.challenges().is_empty());
    }

    #[test]
    fn new_builder_keeps_metadata_but_not_body() {
        let response = ResponseBuilder::new()
            .code(304)
            .message("Not Modified")
            .add_header("ETag", "\"v1\"")
            .body(Some(ResponseBody::from_bytes(None, Bytes::from("x"))))
            .build();
        let copy = response.new_builder().build();
        assert_eq!(copy.code(), 304);
        assert_eq!(copy.message(), "Not Modified");
        assert_eq!(copy.header("etag"), Some("\"v1\""));
        assert!(copy.body().is_none());
    }
}
