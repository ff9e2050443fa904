//! The request execution engine.
//!
//! An engine owns a single request/response pair through its lifecycle:
//! created, request sent, response read, optional follow-up computed,
//! connection released. The response may be served by the cache, by the
//! network, or by both in the event of a conditional GET.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use flate2::read::GzDecoder;
use tracing::debug;
use url::Url;

use crate::address::{Address, Proxy};
use crate::body::{ResponseBody, RetryableSink};
use crate::cache::{self, CacheRequest};
use crate::cache_strategy::{system_time_millis, CacheStrategy, Factory};
use crate::call::CallState;
use crate::client::ClientInner;
use crate::connection::{Connection, Protocol};
use crate::error::HttpError;
use crate::http1::Http1Transport;
use crate::interceptor::Chain;
use crate::metrics;
use crate::request::{
    effective_port, host_header, invalidates_cache, permits_request_body, Request,
};
use crate::response::{Response, ResponseBuilder};
use crate::route::{Route, RouteSelector};
use crate::tls::CertificatePinner;
use crate::transport::Transport;

/// How many redirects and auth challenges to attempt. Chrome follows 21;
/// Firefox, curl, and wget follow 20; Safari 16; HTTP/1.0 recommended 5.
pub const MAX_FOLLOW_UPS: u32 = 20;

/// Drives one request/response exchange.
pub(crate) struct Engine {
    client: Arc<ClientInner>,
    id: u64,

    /// The original application request. Never modified; follow-ups are
    /// derived from it.
    user_request: Request,
    buffer_request_body: bool,
    caller_writes_request_body: bool,
    prior_response: Option<Response>,

    connection: Option<Arc<Connection>>,
    address: Option<Arc<Address>>,
    route: Option<Route>,
    route_selector: Option<RouteSelector>,
    transport: Option<Box<dyn Transport>>,

    /// When the request headers were written, or `None` if not yet.
    sent_request_millis: Option<i64>,

    /// True if this engine injected `Accept-Encoding: gzip` and is
    /// therefore responsible for decompressing the transfer stream.
    transparent_gzip: bool,

    /// The request to send on the network, customized with defaults, or
    /// `None` when the cache answers outright.
    network_request: Option<Request>,
    /// The cached response to serve or validate against.
    cache_response: Option<Response>,
    /// The user-visible response.
    user_response: Option<Response>,

    request_body_out: Option<RetryableSink>,
    streaming_body: Option<Box<dyn Write + Send>>,
    store_request: Option<Box<dyn CacheRequest>>,
    strategy_chosen: bool,

    call_state: Option<Arc<CallState>>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<ClientInner>,
        user_request: Request,
        buffer_request_body: bool,
        caller_writes_request_body: bool,
        connection: Option<Arc<Connection>>,
        route_selector: Option<RouteSelector>,
        request_body_out: Option<RetryableSink>,
        prior_response: Option<Response>,
        call_state: Option<Arc<CallState>>,
    ) -> Engine {
        let id = client.next_engine_id();
        let route = connection.as_ref().map(|c| c.route().clone());
        if let Some(connection) = &connection {
            if !connection.is_multiplexed() {
                connection.set_owner(id);
            }
        }
        Engine {
            client,
            id,
            user_request,
            buffer_request_body,
            caller_writes_request_body,
            prior_response,
            connection,
            address: None,
            route,
            route_selector,
            transport: None,
            sent_request_millis: None,
            transparent_gzip: false,
            network_request: None,
            cache_response: None,
            user_response: None,
            request_body_out,
            streaming_body: None,
            store_request: None,
            strategy_chosen: false,
            call_state,
        }
    }

    pub fn take_response(&mut self) -> Option<Response> {
        self.user_response.take()
    }

    fn canceled(&self) -> bool {
        self.call_state
            .as_ref()
            .is_some_and(|state| state.is_canceled())
    }

    /// Figure out what the response source will be and open a socket to
    /// it if necessary. Prepares the request headers and, in the
    /// caller-driven mode, the request body sink.
    pub fn send_request(&mut self) -> Result<(), HttpError> {
        if self.strategy_chosen {
            return Ok(()); // Already sent.
        }
        if self.canceled() {
            return Err(HttpError::Canceled);
        }
        metrics::CALLS_STARTED.increment();

        let user_request = self.user_request.clone();
        let request = self.network_request_with_defaults(&user_request)?;

        let cache_candidate = self
            .client
            .cache
            .as_ref()
            .and_then(|cache| cache.get(&request));

        let now = system_time_millis(SystemTime::now());
        let strategy = Factory::new(now, &request, cache_candidate).get();
        self.strategy_chosen = true;

        if let Some(cache) = &self.client.cache {
            cache.track_response(&strategy);
        }

        // A rejected candidate was dropped inside the factory; its body
        // closed with it.
        self.network_request = strategy.network_request;
        self.cache_response = strategy.cache_response;

        if self.network_request.is_some() {
            // Open a connection unless we inherited one from a redirect.
            if self.connection.is_none() {
                self.connect()?;
            } else {
                metrics::CONNECTIONS_REUSED.increment();
            }
            self.transport = Some(self.new_transport()?);
            self.prepare_caller_request_body()?;
            return Ok(());
        }

        // No network. Recycle a connection inherited from a redirect.
        if let Some(connection) = self.connection.take() {
            connection.clear_owner(self.id);
            self.client.pool.recycle(connection);
        }

        let user_response = match self.cache_response.take() {
            Some(mut cached) => {
                // A valid cached response: promote it immediately.
                metrics::CACHE_HITS.increment();
                let body = cached.take_body();
                let cached_skeleton = cached.new_builder().build();
                cached
                    .into_builder()
                    .request(self.user_request.clone())
                    .prior_response(self.prior_response.take().map(Response::strip_body))
                    .cache_response(Some(cached_skeleton))
                    .body(body)
                    .build()
            }
            None => {
                // The network is forbidden and the cache is insufficient.
                ResponseBuilder::new()
                    .request(self.user_request.clone())
                    .prior_response(self.prior_response.take().map(Response::strip_body))
                    .protocol(Protocol::Http11)
                    .code(504)
                    .message("Unsatisfiable Request (only-if-cached)")
                    .body(Some(ResponseBody::empty()))
                    .build()
            }
        };

        self.user_response = Some(self.unzip(user_response)?);
        Ok(())
    }

    /// In the caller-driven body mode, write headers eagerly and expose
    /// either a streaming sink or a buffered retryable sink.
    fn prepare_caller_request_body(&mut self) -> Result<(), HttpError> {
        if !self.caller_writes_request_body
            || !permits_request_body(self.user_request.method())
            || self.request_body_out.is_some()
            || self.streaming_body.is_some()
        {
            return Ok(());
        }
        let network_request = match &self.network_request {
            Some(request) => request.clone(),
            None => return Ok(()),
        };
        let content_length = declared_content_length(&network_request);

        if self.buffer_request_body {
            if let Some(length) = content_length {
                // Buffer a body of known length; headers can go now.
                self.write_request_headers_now(&network_request)?;
                self.request_body_out = Some(RetryableSink::new(Some(length)));
            } else {
                // Unknown length: hold the headers until the body is
                // complete so Content-Length can be set correctly.
                self.request_body_out = Some(RetryableSink::new(None));
            }
        } else {
            self.write_request_headers_now(&network_request)?;
            let transport = self.transport_mut()?;
            self.streaming_body = Some(transport.create_request_body(&network_request, content_length)?);
        }
        Ok(())
    }

    fn write_request_headers_now(&mut self, request: &Request) -> Result<(), HttpError> {
        self.stamp_sent();
        let transport = match &mut self.transport {
            Some(transport) => transport,
            None => return Err(HttpError::Request("request not sent yet".to_string())),
        };
        transport.write_request_headers(request)
    }

    fn transport_mut(&mut self) -> Result<&mut Box<dyn Transport>, HttpError> {
        self.transport
            .as_mut()
            .ok_or_else(|| HttpError::Request("request not sent yet".to_string()))
    }

    /// Populate the request with defaults and cookies. No default
    /// `Accept` is set: the client cannot know what the application
    /// wants.
    fn network_request_with_defaults(&mut self, request: &Request) -> Result<Request, HttpError> {
        let mut builder = request.new_builder();

        if request.header("Host").is_none() {
            builder = builder.header("Host", &host_header(request.url()));
        }

        let inherited_http10 = self
            .connection
            .as_ref()
            .is_some_and(|c| c.protocol() == Protocol::Http10);
        if !inherited_http10 && request.header("Connection").is_none() {
            builder = builder.header("Connection", "Keep-Alive");
        }

        if request.header("Accept-Encoding").is_none() {
            self.transparent_gzip = true;
            builder = builder.header("Accept-Encoding", "gzip");
        }

        if let Some(jar) = &self.client.cookie_jar {
            if let Some(cookies) = jar.cookie_header(request.url()) {
                if !cookies.is_empty() {
                    builder = builder.header("Cookie", &cookies);
                }
            }
        }

        if request.header("User-Agent").is_none() {
            builder = builder.header("User-Agent", &self.client.user_agent);
        }

        builder.build()
    }

    /// Connect to the origin server, directly or via a proxy: pooled
    /// connections first, then fresh sockets along selected routes.
    fn connect(&mut self) -> Result<(), HttpError> {
        if self.route_selector.is_none() {
            let address = Arc::new(self.create_address()?);
            let url = self
                .network_request
                .as_ref()
                .map(|r| r.url().clone())
                .unwrap_or_else(|| self.user_request.url().clone());
            self.address = Some(address.clone());
            self.route_selector = Some(RouteSelector::new(
                address,
                url,
                self.client.dns.clone(),
                self.client.route_database.clone(),
            ));
        }
        let address = match &self.address {
            Some(address) => address.clone(),
            None => Arc::new(self.create_address()?),
        };
        self.address = Some(address.clone());

        let method_is_get = self
            .network_request
            .as_ref()
            .is_some_and(|r| r.method() == "GET");

        loop {
            if let Some(pooled) = self.client.pool.get(&address) {
                // GET may reuse even a stale socket; the request is
                // replayed on IO failure.
                if method_is_get || pooled.is_healthy() {
                    if !pooled.is_multiplexed() {
                        pooled.set_owner(self.id);
                    } else {
                        pooled.allocate_stream();
                    }
                    metrics::CONNECTIONS_REUSED.increment();
                    self.route = Some(pooled.route().clone());
                    self.register_shutdown(&pooled);
                    self.connection = Some(pooled);
                    return Ok(());
                }
                pooled.close();
                continue;
            }

            let route = match &mut self.route_selector {
                Some(selector) => selector.next()?,
                None => unreachable!("route selector initialized above"),
            };
            match Connection::connect(
                route.clone(),
                self.client.connect_timeout,
                self.client.read_timeout,
                self.client.write_timeout,
            ) {
                Ok(connection) => {
                    let connection = Arc::new(connection);
                    self.client.route_database.succeeded(&route);
                    if connection.is_multiplexed() {
                        connection.allocate_stream();
                        self.client.pool.share(connection.clone());
                    } else {
                        connection.set_owner(self.id);
                    }
                    self.route = Some(route);
                    self.register_shutdown(&connection);
                    self.connection = Some(connection);
                    return Ok(());
                }
                Err(error) => {
                    // Demote the failed route before surfacing.
                    metrics::ROUTES_FAILED.increment();
                    if let Some(selector) = &mut self.route_selector {
                        let io_error = match &error {
                            HttpError::Route { source, .. } => {
                                io::Error::new(source.kind(), source.to_string())
                            }
                            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
                        };
                        selector.connect_failed(&route, &io_error);
                    }
                    return Err(error);
                }
            }
        }
    }

    fn register_shutdown(&self, connection: &Arc<Connection>) {
        if let Some(state) = &self.call_state {
            state.set_shutdown(connection.shutdown_handle());
        }
    }

    fn new_transport(&mut self) -> Result<Box<dyn Transport>, HttpError> {
        let connection = match &self.connection {
            Some(connection) => connection.clone(),
            None => return Err(HttpError::Request("no connection".to_string())),
        };
        match connection.protocol() {
            Protocol::H2 => match &self.client.h2_transports {
                Some(factory) => factory.new_transport(connection),
                None => Err(HttpError::Protocol(
                    "connection negotiated h2 but no HTTP/2 driver is installed".to_string(),
                )),
            },
            _ => Ok(Box::new(Http1Transport::new(
                connection,
                self.client.pool.clone(),
                self.id,
                self.client.read_timeout,
            ))),
        }
    }

    fn create_address(&self) -> Result<Address, HttpError> {
        let request = self
            .network_request
            .as_ref()
            .unwrap_or(&self.user_request);
        let url = request.url();
        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host,
            _ => return Err(HttpError::Request(format!("no host in url: {url}"))),
        };

        let (tls_config, pinner) = if request.is_https() {
            let config = self.client.tls_config.clone().ok_or_else(|| {
                HttpError::Security("no TLS configuration installed for https".to_string())
            })?;
            (Some(config), self.client.certificate_pinner.clone())
        } else {
            (None, CertificatePinner::default())
        };

        Ok(Address::new(
            host,
            effective_port(url),
            tls_config,
            pinner,
            self.client.authenticator.clone(),
            self.client.protocols.clone(),
            self.client.proxy.clone(),
            self.client.proxy_selector.clone(),
        ))
    }

    fn stamp_sent(&mut self) {
        if self.sent_request_millis.is_none() {
            self.sent_request_millis = Some(system_time_millis(SystemTime::now()));
        }
    }

    /// Flush the request and read the response. Handles conditional cache
    /// hits, cache population, and transparent decompression.
    pub fn read_response(&mut self) -> Result<(), HttpError> {
        if self.user_response.is_some() {
            return Ok(()); // Already ready.
        }
        if self.network_request.is_none() && self.cache_response.is_none() {
            return Err(HttpError::Request(
                "read_response before send_request".to_string(),
            ));
        }
        let network_request = match &self.network_request {
            Some(request) => request.clone(),
            None => return Ok(()), // Served from cache in send_request.
        };
        if self.canceled() {
            return Err(HttpError::Canceled);
        }

        let network_response = if !self.caller_writes_request_body {
            self.proceed_through_interceptors(0, network_request)?
        } else {
            self.flush_caller_request_body()?
        };

        self.receive_headers(&network_response);

        // A cache response plus a network response means conditional GET.
        if let Some(mut cached) = self.cache_response.take() {
            if validate(&cached, &network_response) {
                metrics::CACHE_CONDITIONAL_HITS.increment();
                let combined = combine(cached.headers(), network_response.headers())?;
                let body = cached.take_body();
                let cached_skeleton = cached.new_builder().build();
                let network_skeleton = network_response.new_builder().build();
                // Closing the 304's body frees its stream.
                drop(network_response);

                let user_response = cached
                    .into_builder()
                    .headers(combined)
                    .request(self.user_request.clone())
                    .prior_response(self.prior_response.take().map(Response::strip_body))
                    .cache_response(Some(cached_skeleton))
                    .network_response(Some(network_skeleton))
                    .build();
                self.release_connection()?;

                // Update the cache after combining headers but before
                // stripping Content-Encoding.
                if let Some(cache) = &self.client.cache {
                    cache.track_conditional_hit();
                    let fresh = user_response.new_builder().build();
                    if let Some(stored) = user_response.cache_response() {
                        cache.update(stored, &fresh);
                    }
                }
                self.user_response = Some(self.unzip(user_response)?);
                return Ok(());
            }
            // The cached response is obsolete; close its body.
            drop(cached);
        }

        let network_skeleton = network_response.new_builder().build();
        let mut user_response = network_response
            .into_builder()
            .request(self.user_request.clone())
            .prior_response(self.prior_response.take().map(Response::strip_body))
            .network_response(Some(network_skeleton))
            .build();

        if has_body(&user_response) {
            self.maybe_cache(&user_response);
            user_response = self.cache_writing_response(user_response);
            user_response = self.unzip(user_response)?;
        }
        self.user_response = Some(user_response);
        Ok(())
    }

    /// The caller-driven path: emit any buffered body, then read.
    fn flush_caller_request_body(&mut self) -> Result<Response, HttpError> {
        // Emit headers if they are still pending; we may have just
        // learned the Content-Length.
        if self.sent_request_millis.is_none() {
            let mut network_request = match self.network_request.clone() {
                Some(request) => request,
                None => return Err(HttpError::Request("no network request".to_string())),
            };
            if declared_content_length(&network_request).is_none() {
                if let Some(sink) = &self.request_body_out {
                    network_request = network_request
                        .new_builder()
                        .header("Content-Length", &sink.content_length().to_string())
                        .build()?;
                    self.network_request = Some(network_request.clone());
                }
            }
            self.write_request_headers_now(&network_request)?;
        }

        if let Some(mut streaming) = self.streaming_body.take() {
            streaming.flush().map_err(HttpError::from_io)?;
            drop(streaming);
        }
        if let Some(sink) = &mut self.request_body_out {
            sink.close().map_err(HttpError::from_io)?;
        }
        if let Some(sink) = self.request_body_out.take() {
            let transport = self.transport_mut()?;
            transport.write_request_body(&sink)?;
            self.request_body_out = Some(sink);
        }

        self.read_network_response()
    }

    /// Run the network interceptor pipeline; the terminal link transmits
    /// the request.
    fn proceed_through_interceptors(
        &mut self,
        index: usize,
        request: Request,
    ) -> Result<Response, HttpError> {
        if index < self.client.network_interceptors.len() {
            let interceptor = self.client.network_interceptors[index].clone();
            let mut chain = NetworkChain {
                engine: self,
                index,
                calls: 0,
                request,
            };
            let response = interceptor.intercept(&mut chain)?;
            if chain.calls != 1 {
                return Err(HttpError::Protocol(format!(
                    "network interceptor {index} must call proceed() exactly once"
                )));
            }
            return Ok(response);
        }

        // Terminal link: put the request on the wire.
        self.stamp_sent();
        let transport = self.transport_mut()?;
        transport.write_request_headers(&request)?;
        self.network_request = Some(request.clone());

        if permits_request_body(request.method()) {
            if let Some(body) = request.body() {
                let content_length = body.content_length();
                let transport = self.transport_mut()?;
                let mut sink = transport.create_request_body(&request, content_length)?;
                body.write_to(&mut *sink)?;
                sink.flush().map_err(HttpError::from_io)?;
            }
        }

        let response = self.read_network_response()?;

        let code = response.code();
        if code == 204 || code == 205 {
            if let Some(length) = response.body().and_then(|b| b.content_length()) {
                if length > 0 {
                    return Err(HttpError::Protocol(format!(
                        "HTTP {code} had non-zero Content-Length: {length}"
                    )));
                }
            }
        }

        Ok(response)
    }

    fn read_network_response(&mut self) -> Result<Response, HttpError> {
        let sent = self.sent_request_millis.unwrap_or_else(|| {
            system_time_millis(SystemTime::now())
        });
        let received = system_time_millis(SystemTime::now());
        let handshake = self
            .connection
            .as_ref()
            .and_then(|c| c.handshake().cloned());
        let network_request = match &self.network_request {
            Some(request) => request.clone(),
            None => return Err(HttpError::Request("no network request".to_string())),
        };

        let transport = self.transport_mut()?;
        transport.finish_request()?;
        let response = transport
            .read_response_headers()?
            .request(network_request)
            .handshake(handshake)
            .header(cache::SENT_MILLIS, &sent.to_string())
            .header(cache::RECEIVED_MILLIS, &received.to_string())
            .sent_request_at_millis(sent)
            .received_response_at_millis(received)
            .build();

        let transport = self.transport_mut()?;
        let body = transport.open_response_body(&response)?;
        Ok(response.into_builder().body(Some(body)).build())
    }

    /// Hand `Set-Cookie` values to the cookie jar.
    fn receive_headers(&self, response: &Response) {
        if let Some(jar) = &self.client.cookie_jar {
            let values = response.headers().values("Set-Cookie");
            if !values.is_empty() {
                jar.save(self.user_request.url(), &values);
            }
        }
    }

    /// Offer the response to the cache, or invalidate a stale entry.
    fn maybe_cache(&mut self, user_response: &Response) {
        let cache = match &self.client.cache {
            Some(cache) => cache.clone(),
            None => return,
        };
        let network_request = match &self.network_request {
            Some(request) => request,
            None => return,
        };

        if !CacheStrategy::is_cacheable(user_response, network_request) {
            if invalidates_cache(network_request.method()) {
                cache.remove(network_request);
            }
            return;
        }

        let skeleton = user_response.new_builder().build();
        self.store_request = cache.put(&skeleton);
    }

    /// Wrap the body so bytes tee into the cache as the application
    /// reads them.
    fn cache_writing_response(&mut self, mut response: Response) -> Response {
        let cache_request = match self.store_request.take() {
            Some(request) => request,
            None => return response,
        };
        let body = match response.take_body() {
            Some(body) => body,
            None => return response,
        };
        let content_type = body.content_type().map(str::to_string);
        let content_length = body.content_length();
        let tee = CacheWritingSource {
            source: body.into_source(),
            cache_request: Some(cache_request),
        };
        response
            .into_builder()
            .body(Some(ResponseBody::new(
                content_type,
                content_length,
                Box::new(tee),
            )))
            .build()
    }

    /// Transparently decompress a gzip body this engine asked for,
    /// stripping `Content-Encoding` and the now-wrong `Content-Length`.
    fn unzip(&self, response: Response) -> Result<Response, HttpError> {
        if !self.transparent_gzip {
            return Ok(response);
        }
        let gzipped = response
            .header("Content-Encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip"));
        if !gzipped {
            return Ok(response);
        }
        let mut response = response;
        let body = match response.take_body() {
            Some(body) => body,
            None => return Ok(response),
        };
        metrics::RESPONSES_GUNZIPPED.increment();

        let content_type = body.content_type().map(str::to_string);
        let decoded = GzDecoder::new(body.into_source());
        let stripped = response
            .headers()
            .new_builder()
            .remove_all("Content-Encoding")
            .remove_all("Content-Length")
            .build();
        Ok(response
            .into_builder()
            .headers(stripped)
            .body(Some(ResponseBody::new(
                content_type,
                None,
                Box::new(decoded),
            )))
            .build())
    }

    /// The follow-up request demanded by the response: credentials for
    /// 401/407, a redirect target for 3xx, or nothing.
    pub fn follow_up_request(&mut self) -> Result<Option<Request>, HttpError> {
        let response = match &self.user_response {
            Some(response) => response,
            None => return Err(HttpError::Request("no response yet".to_string())),
        };
        let proxy = self
            .route
            .as_ref()
            .map(|route| route.proxy().clone())
            .or_else(|| self.client.proxy.clone())
            .unwrap_or(Proxy::Direct);

        match response.code() {
            407 => {
                if !matches!(proxy, Proxy::Http { .. }) {
                    return Err(HttpError::Protocol(
                        "received 407 proxy authentication challenge while not using a proxy"
                            .to_string(),
                    ));
                }
                Ok(self.client.authenticator.authenticate_proxy(&proxy, response))
            }
            401 => Ok(self.client.authenticator.authenticate(&proxy, response)),
            code @ (307 | 308) if self.user_request.method() != "GET"
                && self.user_request.method() != "HEAD" =>
            {
                // The user agent must not redirect a non-GET/HEAD
                // automatically on 307/308.
                debug!(code, "not following method-preserving redirect");
                Ok(None)
            }
            300 | 301 | 302 | 303 | 307 | 308 => self.redirect_request(response),
            _ => Ok(None),
        }
    }

    fn redirect_request(&self, response: &Response) -> Result<Option<Request>, HttpError> {
        if !self.client.follow_redirects {
            return Ok(None);
        }
        let location = match response.header("Location") {
            Some(location) => location,
            None => return Ok(None),
        };
        let url = match self.user_request.url().join(location) {
            Ok(url) => url,
            Err(_) => return Ok(None),
        };

        // Only http and https are followed.
        if url.scheme() != "http" && url.scheme() != "https" {
            return Ok(None);
        }
        let same_scheme = url.scheme() == self.user_request.url().scheme();
        if !same_scheme && !self.client.follow_ssl_redirects {
            return Ok(None);
        }

        let mut builder = self.user_request.new_builder();
        if permits_request_body(self.user_request.method()) {
            // Redirects do not carry a request body.
            builder = builder
                .method("GET")
                .no_body()
                .remove_header("Transfer-Encoding")
                .remove_header("Content-Length")
                .remove_header("Content-Type");
        }

        // Crossing hosts drops authentication state.
        if !self.same_connection(&url) {
            builder = builder.remove_header("Authorization");
        }

        debug!(location = %url, "following redirect");
        Ok(Some(builder.url(url).build()?))
    }

    /// True if a follow-up to `url` can reuse this engine's connection.
    pub fn same_connection(&self, url: &Url) -> bool {
        let current = self.user_request.url();
        current.host_str() == url.host_str()
            && effective_port(current) == effective_port(url)
            && current.scheme() == url.scheme()
    }

    /// Attempt to recover from a failed exchange. Returns a fresh engine
    /// sharing this one's route selector, or the original error when the
    /// failure must surface.
    pub fn recover(mut self, error: HttpError) -> Result<Engine, HttpError> {
        // A canceled call reports cancellation, not the IO failure its
        // closed socket produced.
        if self.canceled() {
            let _ = self.close();
            return Err(HttpError::Canceled);
        }

        // Report the failure so the route is demoted, unless the
        // connection was recycled: its failure says nothing about the
        // route.
        if let (Some(selector), Some(route), Some(connection), HttpError::Io(source)) = (
            self.route_selector.as_mut(),
            self.route.as_ref(),
            self.connection.as_ref(),
            &error,
        ) {
            if connection.recycle_count() == 0 {
                metrics::ROUTES_FAILED.increment();
                selector.connect_failed(route, source);
            }
        }

        let replayable = self.streaming_body.is_none()
            && self
                .user_request
                .body()
                .is_none_or(|body| body.is_replayable());

        let recoverable = match &error {
            HttpError::Route { source, .. } => io_recoverable(source),
            HttpError::Io(source) => io_recoverable(source) && replayable,
            _ => false,
        };

        if !self.client.retry_on_connection_failure || !recoverable {
            let _ = self.close();
            return Err(error);
        }
        let no_route_state = self.route_selector.is_none() && self.connection.is_none();
        let selector_exhausted = self
            .route_selector
            .as_ref()
            .is_some_and(|selector| !selector.has_next());
        if no_route_state || selector_exhausted {
            let _ = self.close();
            return Err(error);
        }

        let connection = self.close();
        debug!(error = %error, "recovering onto a new route");

        Ok(Engine::new(
            self.client.clone(),
            self.user_request.clone(),
            self.buffer_request_body,
            self.caller_writes_request_body,
            connection,
            self.route_selector.take(),
            self.request_body_out.take(),
            self.prior_response.take(),
            self.call_state.clone(),
        ))
    }

    /// Arrange for the connection to return to the pool when the response
    /// body is exhausted or closed.
    pub fn release_connection(&mut self) -> Result<(), HttpError> {
        if let (Some(transport), Some(_)) = (&mut self.transport, &self.connection) {
            transport.release_connection_on_idle()?;
        }
        self.connection = None;
        Ok(())
    }

    /// Immediately drop the socket held by this engine, interrupting any
    /// in-flight blocking IO from another thread.
    pub fn disconnect(&mut self) {
        if let Some(transport) = &mut self.transport {
            transport.disconnect();
        } else if let Some(connection) = &self.connection {
            connection.close();
        }
    }

    /// Release every resource held by this engine. A connection still
    /// eligible for reuse is returned for a follow-up exchange.
    pub fn close(&mut self) -> Option<Arc<Connection>> {
        self.streaming_body = None;

        // Without a response the connection cannot be reused.
        if self.user_response.is_none() {
            if let Some(connection) = self.connection.take() {
                connection.close();
            }
            return None;
        }

        // Closing the body recycles the connection when eligible.
        if let Some(response) = &mut self.user_response {
            drop(response.take_body());
        }

        let can_reuse = self
            .transport
            .as_ref()
            .is_some_and(|t| t.can_reuse_connection());
        let connection = self.connection.take()?;
        if !can_reuse {
            connection.close();
            return None;
        }
        if connection.is_multiplexed() {
            connection.finish_stream();
            return None;
        }
        if !connection.clear_owner(self.id) {
            // This engine no longer owns the socket.
            return None;
        }
        Some(connection)
    }
}

/// One link of the network interceptor pipeline.
struct NetworkChain<'a> {
    engine: &'a mut Engine,
    index: usize,
    calls: u32,
    request: Request,
}

impl Chain for NetworkChain<'_> {
    fn request(&self) -> &Request {
        &self.request
    }

    fn proceed(&mut self, request: Request) -> Result<Response, HttpError> {
        self.calls += 1;
        if self.calls > 1 {
            return Err(HttpError::Protocol(format!(
                "network interceptor {} must call proceed() exactly once",
                self.index
            )));
        }

        // The connection is already prepared: the interceptor must not
        // move the exchange elsewhere.
        if let Some(connection) = &self.engine.connection {
            let address = connection.route().address();
            let same_host = request.url().host_str() == Some(address.host());
            let same_port = effective_port(request.url()) == address.port();
            if !same_host || !same_port {
                return Err(HttpError::Protocol(format!(
                    "network interceptor {} must retain the same host and port",
                    self.index
                )));
            }
        }

        self.engine.proceed_through_interceptors(self.index + 1, request)
    }
}

/// True if the response must carry a (possibly empty) body, honoring
/// headers when they disagree with the status code.
pub(crate) fn has_body(response: &Response) -> bool {
    if response
        .request()
        .is_some_and(|request| request.method() == "HEAD")
    {
        return false;
    }

    let code = response.code();
    if (code < 100 || code >= 200) && code != 204 && code != 304 {
        return true;
    }

    // If Content-Length or Transfer-Encoding disagree with the code the
    // response is malformed; for best compatibility the headers win.
    let declared = response
        .header("Content-Length")
        .and_then(|v| v.trim().parse::<u64>().ok());
    if declared.is_some()
        || response
            .header("Transfer-Encoding")
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
    {
        return true;
    }
    false
}

/// True if `cached` should be used; false if the network response wins.
fn validate(cached: &Response, network: &Response) -> bool {
    if network.code() == 304 {
        return true;
    }

    // RFC 7234 permits serving the cached response when the network's is
    // older. Like Chrome, prefer the newer response.
    if let Some(cached_modified) = cached.headers().get_date("Last-Modified") {
        if let Some(network_modified) = network.headers().get_date("Last-Modified") {
            if network_modified < cached_modified {
                return true;
            }
        }
    }
    false
}

/// Combine cached and network headers after a 304 (RFC 7234 Section
/// 4.3.4): the network wins end-to-end fields, 100-level freshness
/// warnings drop, and the 304's Content-Length is ignored.
fn combine(
    cached: &crate::headers::Headers,
    network: &crate::headers::Headers,
) -> Result<crate::headers::Headers, HttpError> {
    let mut result = crate::headers::HeadersBuilder::new();

    for (name, value) in cached.iter() {
        if name.eq_ignore_ascii_case("Warning") && value.starts_with('1') {
            continue; // Drop 100-level freshness warnings.
        }
        if !is_end_to_end(name) || network.get(name).is_none() {
            result.add_lenient(name, value);
        }
    }

    for (name, value) in network.iter() {
        if name.eq_ignore_ascii_case("Content-Length") {
            continue; // The 304 has no body; its length is meaningless.
        }
        if is_end_to_end(name) {
            result.add_lenient(name, value);
        }
    }

    Ok(result.build())
}

/// True for headers that travel end-to-end rather than hop-by-hop
/// (RFC 7230 Section 6.1).
fn is_end_to_end(name: &str) -> bool {
    !(name.eq_ignore_ascii_case("Connection")
        || name.eq_ignore_ascii_case("Keep-Alive")
        || name.eq_ignore_ascii_case("Proxy-Authenticate")
        || name.eq_ignore_ascii_case("Proxy-Authorization")
        || name.eq_ignore_ascii_case("TE")
        || name.eq_ignore_ascii_case("Trailers")
        || name.eq_ignore_ascii_case("Transfer-Encoding")
        || name.eq_ignore_ascii_case("Upgrade"))
}

/// Retry is pointless for timeouts and interruptions; everything else
/// transient may succeed on another route.
fn io_recoverable(error: &io::Error) -> bool {
    !matches!(
        error.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn declared_content_length(request: &Request) -> Option<u64> {
    if let Some(value) = request.header("Content-Length") {
        return value.trim().parse().ok();
    }
    request.body().and_then(|body| body.content_length())
}

/// A source that copies everything it yields into a cache insertion,
/// aborting the insertion if the stream fails before its end.
struct CacheWritingSource {
    source: Box<dyn Read + Send>,
    cache_request: Option<Box<dyn CacheRequest>>,
}

impl Read for CacheWritingSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = match self.source.read(buf) {
            Ok(n) => n,
            Err(e) => {
                if let Some(mut cache_request) = self.cache_request.take() {
                    cache_request.abort();
                }
                return Err(e);
            }
        };

        if n == 0 {
            // The cache entry is complete.
            self.cache_request = None;
            return Ok(0);
        }

        if let Some(cache_request) = &mut self.cache_request {
            let write_failed = match cache_request.body() {
                Some(sink) => sink.write_all(&buf[..n]).is_err(),
                None => false,
            };
            if write_failed {
                // Keep serving the application; just stop caching.
                if let Some(mut cache_request) = self.cache_request.take() {
                    cache_request.abort();
                }
            }
        }
        Ok(n)
    }
}

impl Drop for CacheWritingSource {
    fn drop(&mut self) {
        // An unread remainder means the entry would be incomplete.
        if let Some(mut cache_request) = self.cache_request.take() {
            cache_request.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NoProxy;
    use crate::auth::NoAuthenticator;
    use crate::client::HttpClient;
    use crate::connection::test_support::ScriptedStream;
    use crate::headers::Headers;
    use bytes::Bytes;
    use parking_lot::Mutex as PlMutex;
    use std::io::Write as _;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    fn scripted_engine(
        client: &HttpClient,
        request: Request,
        input: &[u8],
    ) -> (Engine, Arc<PlMutex<Vec<u8>>>) {
        let (stream, written) = ScriptedStream::new(input);
        let address = Arc::new(Address::new(
            request.url().host_str().unwrap_or("h"),
            effective_port(request.url()),
            None,
            CertificatePinner::default(),
            Arc::new(NoAuthenticator),
            vec![Protocol::Http11],
            None,
            Arc::new(NoProxy),
        ));
        let route = Route::new(address, Proxy::Direct, "127.0.0.1:80".parse().unwrap());
        let connection = Arc::new(Connection::from_stream(
            route,
            Protocol::Http11,
            Box::new(stream),
        ));
        let engine = Engine::new(
            client.inner().clone(),
            request,
            false,
            false,
            Some(connection),
            None,
            None,
            None,
            None,
        );
        (engine, written)
    }

    fn run(engine: &mut Engine) -> Result<(), HttpError> {
        engine.send_request()?;
        engine.read_response()
    }

    #[test]
    fn basic_get_injects_defaults_and_reads_body() {
        let client = HttpClient::new();
        let request = Request::get("http://h/p").unwrap();
        let (mut engine, written) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nhi!",
        );

        run(&mut engine).unwrap();

        assert_eq!(
            String::from_utf8(written.lock().clone()).unwrap(),
            format!(
                "GET /p HTTP/1.1\r\nHost: h\r\nConnection: Keep-Alive\r\n\
                 Accept-Encoding: gzip\r\nUser-Agent: hawser/{}\r\n\r\n",
                env!("CARGO_PKG_VERSION")
            )
        );

        let mut response = engine.take_response().unwrap();
        assert_eq!(response.code(), 200);
        assert_eq!(response.message(), "OK");
        assert_eq!(response.protocol(), Protocol::Http11);
        assert!(response.network_response().is_some());
        let body = response.take_body().unwrap();
        assert_eq!(body.bytes().unwrap().as_ref(), b"hi!");
    }

    #[test]
    fn existing_headers_suppress_injected_defaults() {
        let client = HttpClient::new();
        let request = Request::builder("GET", "http://h/p")
            .header("Accept-Encoding", "identity")
            .header("User-Agent", "custom")
            .build()
            .unwrap();
        let (mut engine, written) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        );
        run(&mut engine).unwrap();

        let head = String::from_utf8(written.lock().clone()).unwrap();
        assert!(head.contains("Accept-Encoding: identity\r\n"));
        assert!(head.contains("User-Agent: custom\r\n"));
        assert!(!engine.transparent_gzip);
    }

    #[test]
    fn transparent_gzip_decodes_and_strips_headers() {
        let mut gzipped = Vec::new();
        let mut encoder =
            flate2::write::GzEncoder::new(&mut gzipped, flate2::Compression::default());
        encoder.write_all(b"hello").unwrap();
        encoder.finish().unwrap();

        let mut input = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            gzipped.len()
        )
        .into_bytes();
        input.extend_from_slice(&gzipped);

        let client = HttpClient::new();
        let request = Request::get("http://h/p").unwrap();
        let (mut engine, _) = scripted_engine(&client, request, &input);
        run(&mut engine).unwrap();

        let mut response = engine.take_response().unwrap();
        assert_eq!(response.header("Content-Encoding"), None);
        assert_eq!(response.header("Content-Length"), None);
        let body = response.take_body().unwrap();
        assert_eq!(body.content_length(), None);
        assert_eq!(body.string().unwrap(), "hello");
    }

    #[test]
    fn gzip_passes_through_when_caller_asked_for_it() {
        let client = HttpClient::new();
        let request = Request::builder("GET", "http://h/p")
            .header("Accept-Encoding", "gzip")
            .build()
            .unwrap();
        let (mut engine, _) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: 2\r\n\r\nxx",
        );
        run(&mut engine).unwrap();

        // The caller owns decompression; headers survive.
        let response = engine.take_response().unwrap();
        assert_eq!(response.header("Content-Encoding"), Some("gzip"));
    }

    struct RecordingCacheRequest {
        bytes: Arc<PlMutex<Vec<u8>>>,
        aborted: Arc<AtomicUsize>,
        sink: Vec<u8>,
    }

    impl CacheRequest for RecordingCacheRequest {
        fn body(&mut self) -> Option<&mut (dyn io::Write + Send)> {
            Some(&mut self.sink)
        }

        fn abort(&mut self) {
            self.aborted.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    impl Drop for RecordingCacheRequest {
        fn drop(&mut self) {
            self.bytes.lock().extend_from_slice(&self.sink);
        }
    }

    #[derive(Default)]
    struct FakeCache {
        cached_etag: Option<String>,
        cached_body: &'static str,
        stored_bytes: Arc<PlMutex<Vec<u8>>>,
        aborted: Arc<AtomicUsize>,
        puts: AtomicUsize,
        updates: AtomicUsize,
        conditional_hits: AtomicUsize,
        removes: AtomicUsize,
    }

    impl crate::cache::HttpCache for FakeCache {
        fn get(&self, request: &Request) -> Option<Response> {
            let etag = self.cached_etag.as_ref()?;
            let now = system_time_millis(SystemTime::now());
            let served = SystemTime::now() - std::time::Duration::from_secs(100);
            Some(
                ResponseBuilder::new()
                    .code(200)
                    .message("OK")
                    .request(request.clone())
                    .add_header("ETag", etag)
                    .add_header("Date", &httpdate::fmt_http_date(served))
                    .add_header("X-Cached", "true")
                    .sent_request_at_millis(now - 100_000)
                    .received_response_at_millis(now - 100_000)
                    .body(Some(ResponseBody::from_bytes(
                        None,
                        Bytes::from(self.cached_body),
                    )))
                    .build(),
            )
        }

        fn put(&self, _response: &Response) -> Option<Box<dyn CacheRequest>> {
            self.puts.fetch_add(1, AtomicOrdering::SeqCst);
            Some(Box::new(RecordingCacheRequest {
                bytes: self.stored_bytes.clone(),
                aborted: self.aborted.clone(),
                sink: Vec::new(),
            }))
        }

        fn remove(&self, _request: &Request) {
            self.removes.fetch_add(1, AtomicOrdering::SeqCst);
        }

        fn update(&self, _cached: &Response, _fresh: &Response) {
            self.updates.fetch_add(1, AtomicOrdering::SeqCst);
        }

        fn track_response(&self, _strategy: &CacheStrategy) {}

        fn track_conditional_hit(&self) {
            self.conditional_hits.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    #[test]
    fn conditional_revalidation_304_serves_cached_body() {
        let cache = Arc::new(FakeCache {
            cached_etag: Some("\"x\"".to_string()),
            cached_body: "cached-body",
            ..FakeCache::default()
        });
        let client = HttpClient::builder().cache(cache.clone()).build();
        let request = Request::get("http://h/p").unwrap();
        let (mut engine, written) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 304 Not Modified\r\nX-Fresh: yes\r\n\r\n",
        );
        run(&mut engine).unwrap();

        let head = String::from_utf8(written.lock().clone()).unwrap();
        assert!(head.contains("If-None-Match: \"x\"\r\n"));

        let mut response = engine.take_response().unwrap();
        assert_eq!(response.code(), 200);
        // Headers combined: cached entries survive, network additions win.
        assert_eq!(response.header("X-Cached"), Some("true"));
        assert_eq!(response.header("X-Fresh"), Some("yes"));
        assert!(response.cache_response().is_some());
        assert!(response.network_response().is_some());
        assert_eq!(cache.updates.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(cache.conditional_hits.load(AtomicOrdering::SeqCst), 1);

        let body = response.take_body().unwrap();
        assert_eq!(body.bytes().unwrap().as_ref(), b"cached-body");
    }

    #[test]
    fn fresh_network_response_replaces_rejected_cache_candidate() {
        let cache = Arc::new(FakeCache {
            cached_etag: Some("\"x\"".to_string()),
            cached_body: "cached-body",
            ..FakeCache::default()
        });
        let client = HttpClient::builder().cache(cache.clone()).build();
        let request = Request::get("http://h/p").unwrap();
        let (mut engine, _) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nfresh",
        );
        run(&mut engine).unwrap();

        let mut response = engine.take_response().unwrap();
        assert_eq!(response.code(), 200);
        assert_eq!(
            response.take_body().unwrap().bytes().unwrap().as_ref(),
            b"fresh"
        );
        assert_eq!(cache.conditional_hits.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn response_body_tees_into_the_cache() {
        let cache = Arc::new(FakeCache::default());
        let client = HttpClient::builder().cache(cache.clone()).build();
        let request = Request::get("http://h/p").unwrap();
        let (mut engine, _) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\ncachable",
        );
        run(&mut engine).unwrap();

        let mut response = engine.take_response().unwrap();
        let body = response.take_body().unwrap();
        assert_eq!(body.bytes().unwrap().as_ref(), b"cachable");
        assert_eq!(cache.puts.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(cache.stored_bytes.lock().as_slice(), b"cachable");
        assert_eq!(cache.aborted.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn abandoned_body_aborts_the_cache_write() {
        let cache = Arc::new(FakeCache::default());
        let client = HttpClient::builder().cache(cache.clone()).build();
        let request = Request::get("http://h/p").unwrap();
        let (mut engine, _) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\ncachable",
        );
        run(&mut engine).unwrap();

        let mut response = engine.take_response().unwrap();
        let mut body = response.take_body().unwrap();
        let mut partial = [0u8; 2];
        body.read_exact(&mut partial).unwrap();
        drop(body);
        assert!(cache.aborted.load(AtomicOrdering::SeqCst) >= 1);
    }

    #[test]
    fn unsatisfiable_only_if_cached_synthesizes_504() {
        let client = HttpClient::new();
        let request = Request::builder("GET", "http://h/p")
            .header("Cache-Control", "only-if-cached")
            .build()
            .unwrap();
        let mut engine = Engine::new(
            client.inner().clone(),
            request,
            false,
            false,
            None,
            None,
            None,
            None,
            None,
        );
        run(&mut engine).unwrap();

        let mut response = engine.take_response().unwrap();
        assert_eq!(response.code(), 504);
        assert_eq!(response.message(), "Unsatisfiable Request (only-if-cached)");
        let body = response.take_body().unwrap();
        assert_eq!(body.content_length(), Some(0));
    }

    #[test]
    fn post_redirect_becomes_get_without_body_headers() {
        let client = HttpClient::new();
        let request = Request::builder("POST", "http://h/p")
            .header("Content-Type", "text/plain")
            .header("Authorization", "Bearer tok")
            .body("data")
            .build()
            .unwrap();
        let (mut engine, _) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 302 Found\r\nLocation: /elsewhere\r\nContent-Length: 0\r\n\r\n",
        );
        run(&mut engine).unwrap();

        let follow_up = engine.follow_up_request().unwrap().unwrap();
        assert_eq!(follow_up.method(), "GET");
        assert_eq!(follow_up.url().as_str(), "http://h/elsewhere");
        assert!(follow_up.body().is_none());
        assert_eq!(follow_up.header("Content-Type"), None);
        // Same host: credentials survive.
        assert_eq!(follow_up.header("Authorization"), Some("Bearer tok"));
    }

    #[test]
    fn cross_host_redirect_drops_authorization() {
        let client = HttpClient::new();
        let request = Request::builder("GET", "http://h/p")
            .header("Authorization", "Bearer tok")
            .build()
            .unwrap();
        let (mut engine, _) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 301 Moved\r\nLocation: http://other/p\r\nContent-Length: 0\r\n\r\n",
        );
        run(&mut engine).unwrap();

        let follow_up = engine.follow_up_request().unwrap().unwrap();
        assert_eq!(follow_up.url().host_str(), Some("other"));
        assert_eq!(follow_up.header("Authorization"), None);
    }

    #[test]
    fn method_preserving_redirects_refuse_non_get_head() {
        let client = HttpClient::new();
        let request = Request::builder("POST", "http://h/p")
            .body("data")
            .build()
            .unwrap();
        let (mut engine, _) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 307 Temporary Redirect\r\nLocation: /next\r\nContent-Length: 0\r\n\r\n",
        );
        run(&mut engine).unwrap();
        assert!(engine.follow_up_request().unwrap().is_none());
    }

    #[test]
    fn redirects_disabled_returns_no_follow_up() {
        let client = HttpClient::builder().follow_redirects(false).build();
        let request = Request::get("http://h/p").unwrap();
        let (mut engine, _) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 302 Found\r\nLocation: /next\r\nContent-Length: 0\r\n\r\n",
        );
        run(&mut engine).unwrap();
        assert!(engine.follow_up_request().unwrap().is_none());
    }

    #[test]
    fn cross_scheme_redirect_honors_follow_ssl_redirects() {
        let client = HttpClient::builder().follow_ssl_redirects(false).build();
        let request = Request::get("http://h/p").unwrap();
        let (mut engine, _) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 301 Moved\r\nLocation: https://h/p\r\nContent-Length: 0\r\n\r\n",
        );
        run(&mut engine).unwrap();
        assert!(engine.follow_up_request().unwrap().is_none());
    }

    #[test]
    fn proxy_auth_without_proxy_is_a_protocol_error() {
        let client = HttpClient::new();
        let request = Request::get("http://h/p").unwrap();
        let (mut engine, _) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n",
        );
        run(&mut engine).unwrap();
        assert!(matches!(
            engine.follow_up_request(),
            Err(HttpError::Protocol(_))
        ));
    }

    #[test]
    fn unauthorized_consults_the_authenticator() {
        struct TokenAuth;
        impl crate::auth::Authenticator for TokenAuth {
            fn authenticate(&self, _proxy: &Proxy, response: &Response) -> Option<Request> {
                response
                    .request()?
                    .new_builder()
                    .header("Authorization", "Bearer fresh")
                    .build()
                    .ok()
            }

            fn authenticate_proxy(&self, _proxy: &Proxy, _response: &Response) -> Option<Request> {
                None
            }
        }

        let client = HttpClient::builder()
            .authenticator(Arc::new(TokenAuth))
            .build();
        let request = Request::get("http://h/p").unwrap();
        let (mut engine, _) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Bearer\r\nContent-Length: 0\r\n\r\n",
        );
        run(&mut engine).unwrap();

        let follow_up = engine.follow_up_request().unwrap().unwrap();
        assert_eq!(follow_up.header("Authorization"), Some("Bearer fresh"));
    }

    #[test]
    fn success_responses_need_no_follow_up() {
        let client = HttpClient::new();
        let request = Request::get("http://h/p").unwrap();
        let (mut engine, _) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
        );
        run(&mut engine).unwrap();
        assert!(engine.follow_up_request().unwrap().is_none());
    }

    #[test]
    fn interceptors_observe_and_rewrite_the_exchange() {
        struct TagInterceptor;
        impl crate::interceptor::Interceptor for TagInterceptor {
            fn intercept(&self, chain: &mut dyn Chain) -> Result<Response, HttpError> {
                let request = chain
                    .request()
                    .new_builder()
                    .header("X-Traced", "1")
                    .build()?;
                chain.proceed(request)
            }
        }

        let client = HttpClient::builder()
            .add_network_interceptor(Arc::new(TagInterceptor))
            .build();
        let request = Request::get("http://h/p").unwrap();
        let (mut engine, written) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        );
        run(&mut engine).unwrap();
        let head = String::from_utf8(written.lock().clone()).unwrap();
        assert!(head.contains("X-Traced: 1\r\n"));
    }

    #[test]
    fn interceptor_must_call_proceed_exactly_once() {
        struct Skips;
        impl crate::interceptor::Interceptor for Skips {
            fn intercept(&self, _chain: &mut dyn Chain) -> Result<Response, HttpError> {
                Ok(ResponseBuilder::new().code(200).build())
            }
        }

        let client = HttpClient::builder()
            .add_network_interceptor(Arc::new(Skips))
            .build();
        let request = Request::get("http://h/p").unwrap();
        let (mut engine, _) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(matches!(run(&mut engine), Err(HttpError::Protocol(_))));
    }

    #[test]
    fn interceptor_may_not_change_host_or_port() {
        struct Rehosts;
        impl crate::interceptor::Interceptor for Rehosts {
            fn intercept(&self, chain: &mut dyn Chain) -> Result<Response, HttpError> {
                let request = Request::get("http://elsewhere/p")?;
                chain.proceed(request)
            }
        }

        let client = HttpClient::builder()
            .add_network_interceptor(Arc::new(Rehosts))
            .build();
        let request = Request::get("http://h/p").unwrap();
        let (mut engine, _) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        );
        assert!(matches!(run(&mut engine), Err(HttpError::Protocol(_))));
    }

    #[test]
    fn no_content_with_nonzero_length_is_a_protocol_error() {
        let client = HttpClient::new();
        let request = Request::get("http://h/p").unwrap();
        let (mut engine, _) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 204 No Content\r\nContent-Length: 5\r\n\r\nhello",
        );
        assert!(matches!(run(&mut engine), Err(HttpError::Protocol(_))));
    }

    #[test]
    fn request_body_is_written_with_fixed_framing() {
        let client = HttpClient::new();
        let request = Request::builder("POST", "http://h/p")
            .body("payload")
            .build()
            .unwrap();
        let (mut engine, written) = scripted_engine(
            &client,
            request,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        );
        run(&mut engine).unwrap();
        let bytes = written.lock().clone();
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.ends_with("\r\n\r\npayload"));
    }

    #[test]
    fn caller_driven_buffered_body_learns_its_content_length() {
        let client = HttpClient::new();
        let request = Request::builder("POST", "http://h/p").build().unwrap();
        let (stream, written) = ScriptedStream::new(
            b"HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n",
        );
        let address = Arc::new(Address::new(
            "h",
            80,
            None,
            CertificatePinner::default(),
            Arc::new(NoAuthenticator),
            vec![Protocol::Http11],
            None,
            Arc::new(NoProxy),
        ));
        let route = Route::new(address, Proxy::Direct, "127.0.0.1:80".parse().unwrap());
        let connection = Arc::new(Connection::from_stream(
            route,
            Protocol::Http11,
            Box::new(stream),
        ));
        let mut engine = Engine::new(
            client.inner().clone(),
            request,
            true, // buffer the request body
            true, // the caller drives it
            Some(connection),
            None,
            None,
            None,
            None,
        );

        engine.send_request().unwrap();
        // Unknown length: headers wait until the body is complete.
        assert!(written.lock().is_empty());

        engine
            .request_body_out
            .as_mut()
            .unwrap()
            .write_all(b"hello")
            .unwrap();
        engine.read_response().unwrap();

        let head = String::from_utf8(written.lock().clone()).unwrap();
        assert!(head.contains("Content-Length: 5\r\n"), "{head}");
        assert!(head.ends_with("\r\n\r\nhello"), "{head}");
        assert_eq!(engine.take_response().unwrap().code(), 201);
    }

    #[test]
    fn caller_driven_streaming_body_writes_through() {
        let client = HttpClient::new();
        let request = Request::builder("PUT", "http://h/p")
            .header("Content-Length", "5")
            .build()
            .unwrap();
        let (stream, written) = ScriptedStream::new(
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        );
        let address = Arc::new(Address::new(
            "h",
            80,
            None,
            CertificatePinner::default(),
            Arc::new(NoAuthenticator),
            vec![Protocol::Http11],
            None,
            Arc::new(NoProxy),
        ));
        let route = Route::new(address, Proxy::Direct, "127.0.0.1:80".parse().unwrap());
        let connection = Arc::new(Connection::from_stream(
            route,
            Protocol::Http11,
            Box::new(stream),
        ));
        let mut engine = Engine::new(
            client.inner().clone(),
            request,
            false, // stream the request body
            true,  // the caller drives it
            Some(connection),
            None,
            None,
            None,
            None,
        );

        engine.send_request().unwrap();
        // Known length and streaming: the headers are already out.
        assert!(!written.lock().is_empty());

        engine
            .streaming_body
            .as_deref_mut()
            .unwrap()
            .write_all(b"hello")
            .unwrap();
        engine.read_response().unwrap();

        let head = String::from_utf8(written.lock().clone()).unwrap();
        assert!(head.ends_with("\r\n\r\nhello"), "{head}");
        assert_eq!(engine.take_response().unwrap().code(), 200);
    }

    #[test]
    fn has_body_honors_methods_codes_and_headers() {
        fn response(method: &str, code: u16, headers: &[(&str, &str)]) -> Response {
            let mut builder = ResponseBuilder::new()
                .code(code)
                .request(Request::builder(method, "http://h/").build().unwrap());
            for (name, value) in headers {
                builder = builder.add_header(name, value);
            }
            builder.build()
        }

        assert!(has_body(&response("GET", 200, &[])));
        assert!(!has_body(&response("HEAD", 200, &[("Content-Length", "9")])));
        assert!(!has_body(&response("GET", 204, &[])));
        assert!(!has_body(&response("GET", 304, &[])));
        // Headers that disagree with the code win.
        assert!(has_body(&response("GET", 204, &[("Content-Length", "5")])));
        assert!(has_body(&response(
            "GET",
            304,
            &[("Transfer-Encoding", "chunked")]
        )));
    }

    #[test]
    fn combine_prefers_network_end_to_end_headers() {
        let cached = Headers::of(&[
            ("Warning", "110 hawser \"Response is stale\""),
            ("Warning", "299 hawser \"kept\""),
            ("ETag", "\"v1\""),
            ("Content-Length", "100"),
        ])
        .unwrap();
        let network = Headers::of(&[("ETag", "\"v2\""), ("Content-Length", "0")]).unwrap();

        let combined = combine(&cached, &network).unwrap();
        // 1xx warnings drop, 2xx warnings survive.
        assert_eq!(combined.values("Warning"), vec!["299 hawser \"kept\""]);
        // The network's validator wins; its Content-Length is ignored.
        assert_eq!(combined.get("ETag"), Some("\"v2\""));
        assert_eq!(combined.get("Content-Length"), Some("100"));
    }

    #[test]
    fn validate_prefers_newer_last_modified() {
        let older = "Thu, 01 Jan 2015 00:00:00 GMT";
        let newer = "Fri, 01 Jan 2016 00:00:00 GMT";
        let cached = ResponseBuilder::new()
            .code(200)
            .add_header("Last-Modified", newer)
            .build();
        let network = ResponseBuilder::new()
            .code(200)
            .add_header("Last-Modified", older)
            .build();
        assert!(validate(&cached, &network));

        let cached = ResponseBuilder::new()
            .code(200)
            .add_header("Last-Modified", older)
            .build();
        let network = ResponseBuilder::new()
            .code(200)
            .add_header("Last-Modified", newer)
            .build();
        assert!(!validate(&cached, &network));
    }
}
