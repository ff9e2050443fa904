//! Route selection: proxy and socket address iteration with failure
//! bookkeeping.
//!
//! Each connection attempt needs a proxy choice and a resolved socket
//! address. The selector yields them in priority order, pushing routes
//! that recently failed to the back of the line.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;
use url::Url;

use crate::address::{Address, Dns, Proxy};
use crate::error::HttpError;
use crate::request::effective_port;

/// How long a failed route stays demoted.
const ROUTE_FAILURE_TTL: Duration = Duration::from_secs(5 * 60);

/// One concrete connection attempt: an address, a proxy, and a resolved
/// socket address.
#[derive(Debug, Clone)]
pub struct Route {
    address: Arc<Address>,
    proxy: Proxy,
    socket_addr: SocketAddr,
}

impl Route {
    pub fn new(address: Arc<Address>, proxy: Proxy, socket_addr: SocketAddr) -> Route {
        Route {
            address,
            proxy,
            socket_addr,
        }
    }

    pub fn address(&self) -> &Arc<Address> {
        &self.address
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// True if this route tunnels HTTPS through an HTTP proxy.
    pub fn requires_tunnel(&self) -> bool {
        self.address.tls_config().is_some() && matches!(self.proxy, Proxy::Http { .. })
    }

    fn key(&self) -> RouteKey {
        RouteKey {
            host: self.address.host().to_string(),
            port: self.address.port(),
            proxy: self.proxy.clone(),
            socket_addr: self.socket_addr,
        }
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
            && self.proxy == other.proxy
            && self.socket_addr == other.socket_addr
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} via {} at {}",
            self.address.host(),
            self.address.port(),
            self.proxy,
            self.socket_addr
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    host: String,
    port: u16,
    proxy: Proxy,
    socket_addr: SocketAddr,
}

/// A blacklist of routes that recently failed to connect. Entries expire
/// after [`ROUTE_FAILURE_TTL`] so a recovered path gets promoted again.
#[derive(Debug, Default)]
pub struct RouteDatabase {
    failed: Mutex<HashMap<RouteKey, Instant>>,
}

impl RouteDatabase {
    pub fn new() -> RouteDatabase {
        RouteDatabase::default()
    }

    /// Record a connect failure on `route`.
    pub fn failed(&self, route: &Route) {
        self.failed.lock().insert(route.key(), Instant::now());
    }

    /// Forget a failure, typically after a successful connect.
    pub fn succeeded(&self, route: &Route) {
        self.failed.lock().remove(&route.key());
    }

    /// True if `route` failed recently and should be tried last.
    pub fn should_postpone(&self, route: &Route) -> bool {
        let mut failed = self.failed.lock();
        match failed.get(&route.key()) {
            Some(at) if at.elapsed() < ROUTE_FAILURE_TTL => true,
            Some(_) => {
                failed.remove(&route.key());
                false
            }
            None => false,
        }
    }
}

/// Selects routes to connect to an origin server, iterating proxies and
/// their resolved socket addresses in priority order. Routes the
/// [`RouteDatabase`] remembers as failed are postponed to the end.
pub struct RouteSelector {
    address: Arc<Address>,
    url: Url,
    dns: Arc<dyn Dns>,
    route_database: Arc<RouteDatabase>,

    /* State for negotiating the next proxy to use. */
    proxies: Vec<Proxy>,
    next_proxy_index: usize,
    last_proxy: Option<Proxy>,

    /* State for negotiating the next socket address to use. */
    socket_addrs: Vec<SocketAddr>,
    next_socket_addr_index: usize,

    /* Routes deferred because they recently failed. */
    postponed_routes: Vec<Route>,
}

impl RouteSelector {
    pub fn new(
        address: Arc<Address>,
        url: Url,
        dns: Arc<dyn Dns>,
        route_database: Arc<RouteDatabase>,
    ) -> RouteSelector {
        let proxies = match address.proxy() {
            // An explicit proxy is tried alone.
            Some(proxy) => vec![proxy.clone()],
            None => {
                // The selector's choices, then a single direct attempt.
                let mut proxies: Vec<Proxy> = address
                    .proxy_selector()
                    .select(&url)
                    .into_iter()
                    .filter(|p| !p.is_direct())
                    .collect();
                proxies.push(Proxy::Direct);
                proxies
            }
        };

        RouteSelector {
            address,
            url,
            dns,
            route_database,
            proxies,
            next_proxy_index: 0,
            last_proxy: None,
            socket_addrs: Vec::new(),
            next_socket_addr_index: 0,
            postponed_routes: Vec::new(),
        }
    }

    /// True if another route is available. Every address has at least one.
    pub fn has_next(&self) -> bool {
        self.has_next_socket_addr() || self.has_next_proxy() || !self.postponed_routes.is_empty()
    }

    /// The next route to attempt.
    pub fn next(&mut self) -> Result<Route, HttpError> {
        loop {
            if !self.has_next_socket_addr() {
                if !self.has_next_proxy() {
                    if self.postponed_routes.is_empty() {
                        return Err(HttpError::Route {
                            route: format!("{}:{}", self.address.host(), self.address.port()),
                            source: io::Error::new(
                                io::ErrorKind::AddrNotAvailable,
                                "exhausted all routes",
                            ),
                        });
                    }
                    return Ok(self.postponed_routes.remove(0));
                }
                self.next_proxy()?;
            }

            let socket_addr = self.socket_addrs[self.next_socket_addr_index];
            self.next_socket_addr_index += 1;

            let proxy = self.last_proxy.clone().unwrap_or(Proxy::Direct);
            let route = Route::new(self.address.clone(), proxy, socket_addr);

            if self.route_database.should_postpone(&route) {
                // Recently failed routes are skipped now and tried last.
                self.postponed_routes.push(route);
                continue;
            }

            return Ok(route);
        }
    }

    /// Report a connectivity failure on a route produced by this selector.
    pub fn connect_failed(&mut self, route: &Route, error: &io::Error) {
        if !route.proxy().is_direct() {
            // Tell the proxy selector when a fresh connection to one of
            // its proxies fails.
            self.address
                .proxy_selector()
                .connect_failed(&self.url, route.proxy(), error);
        }
        debug!(route = %route, error = %error, "route connect failed");
        self.route_database.failed(route);
    }

    fn has_next_proxy(&self) -> bool {
        self.next_proxy_index < self.proxies.len()
    }

    fn has_next_socket_addr(&self) -> bool {
        self.next_socket_addr_index < self.socket_addrs.len()
    }

    /// Advance to the next proxy and resolve its socket addresses.
    fn next_proxy(&mut self) -> Result<(), HttpError> {
        let proxy = self.proxies[self.next_proxy_index].clone();
        self.next_proxy_index += 1;
        self.reset_next_socket_addr(&proxy)?;
        self.last_proxy = Some(proxy);
        Ok(())
    }

    /// Prepare the socket addresses for `proxy`: the origin host for
    /// direct and SOCKS routes, the proxy host for HTTP proxies.
    fn reset_next_socket_addr(&mut self, proxy: &Proxy) -> Result<(), HttpError> {
        self.socket_addrs.clear();
        self.next_socket_addr_index = 0;

        let (socket_host, socket_port) = match proxy {
            Proxy::Direct | Proxy::Socks { .. } => {
                (self.address.host().to_string(), effective_port(&self.url))
            }
            Proxy::Http { host, port } => (host.clone(), *port),
        };

        if socket_port < 1 {
            return Err(HttpError::Route {
                route: format!("{socket_host}:{socket_port}"),
                source: io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("port {socket_port} out of range"),
                ),
            });
        }

        // Try each resolved address for best behavior in mixed IPv4/IPv6
        // environments.
        let ips = self
            .dns
            .resolve(&socket_host)
            .map_err(|e| HttpError::Route {
                route: format!("{socket_host}:{socket_port}"),
                source: e,
            })?;
        self.socket_addrs
            .extend(ips.into_iter().map(|ip| SocketAddr::new(ip, socket_port)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{NoProxy, ProxySelector, SystemDns};
    use crate::auth::NoAuthenticator;
    use crate::connection::Protocol;
    use crate::tls::CertificatePinner;
    use std::net::IpAddr;

    struct FakeDns {
        answers: HashMap<String, Vec<IpAddr>>,
    }

    impl FakeDns {
        fn new(answers: &[(&str, &[&str])]) -> Arc<FakeDns> {
            Arc::new(FakeDns {
                answers: answers
                    .iter()
                    .map(|(host, ips)| {
                        (
                            host.to_string(),
                            ips.iter().map(|ip| ip.parse().unwrap()).collect(),
                        )
                    })
                    .collect(),
            })
        }
    }

    impl Dns for FakeDns {
        fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
            self.answers
                .get(host)
                .cloned()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown {host}")))
        }
    }

    struct FixedProxies {
        proxies: Vec<Proxy>,
        failures: Mutex<Vec<Proxy>>,
    }

    impl ProxySelector for FixedProxies {
        fn select(&self, _url: &Url) -> Vec<Proxy> {
            self.proxies.clone()
        }

        fn connect_failed(&self, _url: &Url, proxy: &Proxy, _error: &io::Error) {
            self.failures.lock().push(proxy.clone());
        }
    }

    fn address(proxy: Option<Proxy>, selector: Arc<dyn ProxySelector>) -> Arc<Address> {
        Arc::new(Address::new(
            "origin.test",
            80,
            None,
            CertificatePinner::default(),
            Arc::new(NoAuthenticator),
            vec![Protocol::Http11],
            proxy,
            selector,
        ))
    }

    fn url() -> Url {
        Url::parse("http://origin.test/p").unwrap()
    }

    fn selector_with(
        proxy: Option<Proxy>,
        proxy_selector: Arc<dyn ProxySelector>,
        dns: Arc<dyn Dns>,
        db: Arc<RouteDatabase>,
    ) -> RouteSelector {
        RouteSelector::new(address(proxy, proxy_selector), url(), dns, db)
    }

    #[test]
    fn direct_routes_resolve_origin_in_order() {
        let dns = FakeDns::new(&[("origin.test", &["10.0.0.1", "10.0.0.2"])]);
        let mut selector = selector_with(
            None,
            Arc::new(NoProxy),
            dns,
            Arc::new(RouteDatabase::new()),
        );

        let r1 = selector.next().unwrap();
        assert_eq!(r1.socket_addr().to_string(), "10.0.0.1:80");
        assert!(r1.proxy().is_direct());
        let r2 = selector.next().unwrap();
        assert_eq!(r2.socket_addr().to_string(), "10.0.0.2:80");
        assert!(!selector.has_next());
        assert!(selector.next().is_err());
    }

    #[test]
    fn routes_are_unique_within_one_iteration() {
        let dns = FakeDns::new(&[("origin.test", &["10.0.0.1", "10.0.0.2"])]);
        let mut selector = selector_with(
            None,
            Arc::new(NoProxy),
            dns,
            Arc::new(RouteDatabase::new()),
        );
        let mut seen = Vec::new();
        while selector.has_next() {
            let route = selector.next().unwrap();
            assert!(!seen.contains(&route.socket_addr()));
            seen.push(route.socket_addr());
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn http_proxy_resolves_proxy_host() {
        let dns = FakeDns::new(&[("proxy.test", &["10.1.0.1"])]);
        let proxy = Proxy::Http {
            host: "proxy.test".to_string(),
            port: 3128,
        };
        let mut selector = selector_with(
            Some(proxy.clone()),
            Arc::new(NoProxy),
            dns,
            Arc::new(RouteDatabase::new()),
        );
        let route = selector.next().unwrap();
        assert_eq!(route.proxy(), &proxy);
        assert_eq!(route.socket_addr().to_string(), "10.1.0.1:3128");
        // An explicit proxy is tried alone: no direct fallback.
        assert!(!selector.has_next());
    }

    #[test]
    fn selector_proxies_then_direct() {
        let dns = FakeDns::new(&[
            ("p1.test", &["10.1.0.1"]),
            ("p2.test", &["10.1.0.2"]),
            ("origin.test", &["10.0.0.1"]),
        ]);
        let proxies = Arc::new(FixedProxies {
            proxies: vec![
                Proxy::Http {
                    host: "p1.test".to_string(),
                    port: 8080,
                },
                Proxy::Http {
                    host: "p2.test".to_string(),
                    port: 8080,
                },
            ],
            failures: Mutex::new(Vec::new()),
        });
        let mut selector =
            selector_with(None, proxies, dns, Arc::new(RouteDatabase::new()));

        assert_eq!(
            selector.next().unwrap().socket_addr().to_string(),
            "10.1.0.1:8080"
        );
        assert_eq!(
            selector.next().unwrap().socket_addr().to_string(),
            "10.1.0.2:8080"
        );
        let last = selector.next().unwrap();
        assert!(last.proxy().is_direct());
        assert_eq!(last.socket_addr().to_string(), "10.0.0.1:80");
    }

    #[test]
    fn failed_routes_are_postponed_to_the_end() {
        let dns = FakeDns::new(&[("origin.test", &["10.0.0.1", "10.0.0.2"])]);
        let db = Arc::new(RouteDatabase::new());

        // First pass: fail the first route.
        let mut selector =
            selector_with(None, Arc::new(NoProxy), dns.clone(), db.clone());
        let first = selector.next().unwrap();
        selector.connect_failed(&first, &io::Error::new(io::ErrorKind::Other, "refused"));

        // Second pass: the failed route comes last.
        let mut selector = selector_with(None, Arc::new(NoProxy), dns, db);
        assert_eq!(
            selector.next().unwrap().socket_addr().to_string(),
            "10.0.0.2:80"
        );
        let postponed = selector.next().unwrap();
        assert_eq!(postponed.socket_addr().to_string(), "10.0.0.1:80");
        assert!(!selector.has_next());
    }

    #[test]
    fn connect_failed_notifies_proxy_selector_for_proxied_routes() {
        let dns = FakeDns::new(&[("p1.test", &["10.1.0.1"]), ("origin.test", &["10.0.0.1"])]);
        let proxies = Arc::new(FixedProxies {
            proxies: vec![Proxy::Http {
                host: "p1.test".to_string(),
                port: 8080,
            }],
            failures: Mutex::new(Vec::new()),
        });
        let mut selector = selector_with(
            None,
            proxies.clone(),
            dns,
            Arc::new(RouteDatabase::new()),
        );

        let via_proxy = selector.next().unwrap();
        let error = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        selector.connect_failed(&via_proxy, &error);
        assert_eq!(proxies.failures.lock().len(), 1);

        let direct = selector.next().unwrap();
        selector.connect_failed(&direct, &error);
        // Direct failures are not the proxy selector's business.
        assert_eq!(proxies.failures.lock().len(), 1);
    }

    #[test]
    fn dns_failure_surfaces_as_route_error() {
        let dns = FakeDns::new(&[]);
        let mut selector = selector_with(
            None,
            Arc::new(NoProxy),
            dns,
            Arc::new(RouteDatabase::new()),
        );
        assert!(matches!(
            selector.next(),
            Err(HttpError::Route { .. })
        ));
    }

    #[test]
    fn route_database_expires_and_clears_failures() {
        let dns = FakeDns::new(&[("origin.test", &["10.0.0.1"])]);
        let db = Arc::new(RouteDatabase::new());
        let mut selector =
            selector_with(None, Arc::new(NoProxy), dns, db.clone());
        let route = selector.next().unwrap();

        db.failed(&route);
        assert!(db.should_postpone(&route));
        db.succeeded(&route);
        assert!(!db.should_postpone(&route));
    }

    #[test]
    fn system_dns_is_the_default_resolver() {
        // Sanity only: resolves loopback without touching the network.
        assert!(SystemDns.resolve("localhost").is_ok());
    }
}
