//! Client configuration and call creation.
//!
//! Every collaborator the engine consults -- DNS, proxy selection,
//! authentication, cookies, the cache, TLS configuration -- is injected
//! at construction. There is no module-level mutable state anywhere in
//! this crate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::address::{CookieJar, Dns, NoProxy, Proxy, ProxySelector, SystemDns};
use crate::auth::{Authenticator, NoAuthenticator};
use crate::cache::HttpCache;
use crate::call::Call;
use crate::connection::Protocol;
use crate::dispatcher::Dispatcher;
use crate::interceptor::Interceptor;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::request::Request;
use crate::route::RouteDatabase;
use crate::tls::CertificatePinner;
use crate::transport::TransportFactory;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct ClientInner {
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub follow_redirects: bool,
    pub follow_ssl_redirects: bool,
    pub retry_on_connection_failure: bool,
    pub proxy: Option<Proxy>,
    pub proxy_selector: Arc<dyn ProxySelector>,
    pub dns: Arc<dyn Dns>,
    pub authenticator: Arc<dyn Authenticator>,
    pub cookie_jar: Option<Arc<dyn CookieJar>>,
    pub cache: Option<Arc<dyn HttpCache>>,
    pub network_interceptors: Vec<Arc<dyn Interceptor>>,
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
    pub certificate_pinner: CertificatePinner,
    pub protocols: Vec<Protocol>,
    pub pool: Arc<ConnectionPool>,
    pub dispatcher: Dispatcher,
    pub route_database: Arc<RouteDatabase>,
    pub h2_transports: Option<Arc<dyn TransportFactory>>,
    pub user_agent: String,
    next_engine_id: AtomicU64,
}

impl ClientInner {
    pub fn next_engine_id(&self) -> u64 {
        self.next_engine_id.fetch_add(1, Ordering::AcqRel)
    }
}

/// An HTTP client. Cheap to clone; clones share the pool, dispatcher,
/// and route database.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    /// A client with default configuration.
    pub fn new() -> HttpClient {
        HttpClient::builder().build()
    }

    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Prepare `request` for execution.
    pub fn new_call(&self, request: Request) -> Call {
        Call::new(self.inner.clone(), request)
    }

    /// Cancel every queued or in-flight call tagged `tag`.
    pub fn cancel(&self, tag: &str) {
        self.inner.dispatcher.cancel(tag);
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ClientInner> {
        &self.inner
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        HttpClient::new()
    }
}

/// Configures and builds an [`HttpClient`].
pub struct HttpClientBuilder {
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    follow_redirects: bool,
    follow_ssl_redirects: bool,
    retry_on_connection_failure: bool,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    dns: Arc<dyn Dns>,
    authenticator: Arc<dyn Authenticator>,
    cookie_jar: Option<Arc<dyn CookieJar>>,
    cache: Option<Arc<dyn HttpCache>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    certificate_pinner: CertificatePinner,
    protocols: Vec<Protocol>,
    pool: Option<Arc<ConnectionPool>>,
    h2_transports: Option<Arc<dyn TransportFactory>>,
    user_agent: String,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        HttpClientBuilder {
            connect_timeout: Some(DEFAULT_TIMEOUT),
            read_timeout: Some(DEFAULT_TIMEOUT),
            write_timeout: Some(DEFAULT_TIMEOUT),
            follow_redirects: true,
            follow_ssl_redirects: true,
            retry_on_connection_failure: true,
            proxy: None,
            proxy_selector: Arc::new(NoProxy),
            dns: Arc::new(SystemDns),
            authenticator: Arc::new(NoAuthenticator),
            cookie_jar: None,
            cache: None,
            network_interceptors: Vec::new(),
            tls_config: None,
            certificate_pinner: CertificatePinner::default(),
            protocols: vec![Protocol::Http11],
            pool: None,
            h2_transports: None,
            user_agent: concat!("hawser/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpClientBuilder {
    /// Socket connect deadline. `None` blocks indefinitely.
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Socket read deadline. `None` blocks indefinitely.
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Socket write deadline. `None` blocks indefinitely.
    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    /// Whether redirects may cross between https and http.
    pub fn follow_ssl_redirects(mut self, follow: bool) -> Self {
        self.follow_ssl_redirects = follow;
        self
    }

    pub fn retry_on_connection_failure(mut self, retry: bool) -> Self {
        self.retry_on_connection_failure = retry;
        self
    }

    /// An explicit proxy, tried to the exclusion of the selector.
    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn proxy_selector(mut self, selector: Arc<dyn ProxySelector>) -> Self {
        self.proxy_selector = selector;
        self
    }

    pub fn dns(mut self, dns: Arc<dyn Dns>) -> Self {
        self.dns = dns;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    pub fn cookie_jar(mut self, jar: Arc<dyn CookieJar>) -> Self {
        self.cookie_jar = Some(jar);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn HttpCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Append a network interceptor; they run in registration order.
    pub fn add_network_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.network_interceptors.push(interceptor);
        self
    }

    /// The pre-built rustls configuration for https addresses. Root
    /// certificates, cipher policy, and ALPN preferences live here.
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.tls_config = Some(config);
        self
    }

    pub fn certificate_pinner(mut self, pinner: CertificatePinner) -> Self {
        self.certificate_pinner = pinner;
        self
    }

    /// Protocols to offer, in preference order. Must contain
    /// [`Protocol::Http11`].
    pub fn protocols(mut self, protocols: Vec<Protocol>) -> Self {
        self.protocols = protocols;
        self
    }

    pub fn connection_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// A factory for HTTP/2 transports; required to use connections whose
    /// ALPN negotiated h2.
    pub fn h2_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.h2_transports = Some(factory);
        self
    }

    pub fn user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn build(self) -> HttpClient {
        HttpClient {
            inner: Arc::new(ClientInner {
                connect_timeout: self.connect_timeout,
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
                follow_redirects: self.follow_redirects,
                follow_ssl_redirects: self.follow_ssl_redirects,
                retry_on_connection_failure: self.retry_on_connection_failure,
                proxy: self.proxy,
                proxy_selector: self.proxy_selector,
                dns: self.dns,
                authenticator: self.authenticator,
                cookie_jar: self.cookie_jar,
                cache: self.cache,
                network_interceptors: self.network_interceptors,
                tls_config: self.tls_config,
                certificate_pinner: self.certificate_pinner,
                protocols: self.protocols,
                pool: self
                    .pool
                    .unwrap_or_else(|| Arc::new(ConnectionPool::new(PoolConfig::default()))),
                dispatcher: Dispatcher::new(),
                route_database: Arc::new(RouteDatabase::new()),
                h2_transports: self.h2_transports,
                user_agent: self.user_agent,
                next_engine_id: AtomicU64::new(1),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let client = HttpClient::new();
        assert!(client.inner.follow_redirects);
        assert!(client.inner.follow_ssl_redirects);
        assert!(client.inner.retry_on_connection_failure);
        assert_eq!(client.inner.connect_timeout, Some(DEFAULT_TIMEOUT));
        assert!(client.inner.user_agent.starts_with("hawser/"));
        assert_eq!(client.dispatcher().max_requests(), 64);
        assert_eq!(client.dispatcher().max_requests_per_host(), 5);
    }

    #[test]
    fn clones_share_infrastructure() {
        let client = HttpClient::new();
        let clone = client.clone();
        assert!(Arc::ptr_eq(&client.inner, &clone.inner));
    }
}
