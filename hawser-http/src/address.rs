//! Origin endpoint identity and the collaborator traits it carries.
//!
//! An [`Address`] is the pooling key: requests that share an address may
//! share a connection. TLS version and cipher-suite policy lives inside
//! the user-supplied `rustls::ClientConfig`.

use std::fmt;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::sync::Arc;

use url::Url;

use crate::auth::Authenticator;
use crate::connection::Protocol;
use crate::tls::CertificatePinner;

/// A proxy choice for one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Proxy {
    /// Connect directly to the origin.
    Direct,
    /// An HTTP proxy; requests to `http` URLs use absolute-form targets,
    /// `https` URLs tunnel with CONNECT.
    Http { host: String, port: u16 },
    /// A SOCKS proxy. The origin host is resolved locally.
    Socks { host: String, port: u16 },
}

impl Proxy {
    pub fn is_direct(&self) -> bool {
        matches!(self, Proxy::Direct)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proxy::Direct => write!(f, "direct"),
            Proxy::Http { host, port } => write!(f, "http://{host}:{port}"),
            Proxy::Socks { host, port } => write!(f, "socks://{host}:{port}"),
        }
    }
}

/// Resolves host names to IP addresses.
pub trait Dns: Send + Sync {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// The system resolver.
#[derive(Debug, Default)]
pub struct SystemDns;

impl Dns for SystemDns {
    fn resolve(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        let addrs: Vec<IpAddr> = (host, 0u16)
            .to_socket_addrs()?
            .map(|sa| sa.ip())
            .collect();
        if addrs.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {host}"),
            ));
        }
        Ok(addrs)
    }
}

/// Chooses proxies for a URL and hears about connect failures. The
/// implementation may consult `http_proxy`-style environment variables;
/// the library itself never reads the environment.
pub trait ProxySelector: Send + Sync {
    /// Proxies to attempt in order. A direct attempt is appended by the
    /// route selector, so an empty list means direct-only.
    fn select(&self, url: &Url) -> Vec<Proxy>;

    /// A connection through `proxy` failed.
    fn connect_failed(&self, url: &Url, proxy: &Proxy, error: &io::Error);
}

/// A selector that never proposes a proxy.
#[derive(Debug, Default)]
pub struct NoProxy;

impl ProxySelector for NoProxy {
    fn select(&self, _url: &Url) -> Vec<Proxy> {
        Vec::new()
    }

    fn connect_failed(&self, _url: &Url, _proxy: &Proxy, _error: &io::Error) {}
}

/// Supplies and receives cookies. Persistence is out of scope; the engine
/// only calls through this contract.
pub trait CookieJar: Send + Sync {
    /// The `Cookie` header value for a request to `url`, or `None`.
    fn cookie_header(&self, url: &Url) -> Option<String>;

    /// Observe `Set-Cookie` values from a response for `url`.
    fn save(&self, url: &Url, set_cookie_values: &[&str]);
}

/// A specification for a connection to an origin server: host and port,
/// plus everything that affects whether two requests may share a socket.
/// Structural equality over all fields; trait-object collaborators compare
/// by identity.
#[derive(Clone)]
pub struct Address {
    host: String,
    port: u16,
    tls_config: Option<Arc<rustls::ClientConfig>>,
    certificate_pinner: CertificatePinner,
    authenticator: Arc<dyn Authenticator>,
    protocols: Vec<Protocol>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
}

impl Address {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        host: &str,
        port: u16,
        tls_config: Option<Arc<rustls::ClientConfig>>,
        certificate_pinner: CertificatePinner,
        authenticator: Arc<dyn Authenticator>,
        protocols: Vec<Protocol>,
        proxy: Option<Proxy>,
        proxy_selector: Arc<dyn ProxySelector>,
    ) -> Address {
        Address {
            host: host.to_string(),
            port,
            tls_config,
            certificate_pinner,
            authenticator,
            protocols,
            proxy,
            proxy_selector,
        }
    }

    /// The origin server's hostname.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The origin server's port, typically 80 or 443.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The TLS configuration, or `None` for a cleartext address.
    pub fn tls_config(&self) -> Option<&Arc<rustls::ClientConfig>> {
        self.tls_config.as_ref()
    }

    pub fn certificate_pinner(&self) -> &CertificatePinner {
        &self.certificate_pinner
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    /// Protocols the client is willing to speak, in preference order.
    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    /// The explicitly requested proxy, or `None` to consult the selector.
    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    pub fn proxy_selector(&self) -> &Arc<dyn ProxySelector> {
        &self.proxy_selector
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port == other.port
            && arc_opt_ptr_eq(&self.tls_config, &other.tls_config)
            && self.certificate_pinner == other.certificate_pinner
            && Arc::ptr_eq(&self.authenticator, &other.authenticator)
            && self.protocols == other.protocols
            && self.proxy == other.proxy
            && Arc::ptr_eq(&self.proxy_selector, &other.proxy_selector)
    }
}

impl Eq for Address {}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Address")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls_config.is_some())
            .field("proxy", &self.proxy)
            .finish()
    }
}

fn arc_opt_ptr_eq<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NoAuthenticator;

    fn address(host: &str, port: u16) -> Address {
        Address::new(
            host,
            port,
            None,
            CertificatePinner::default(),
            Arc::new(NoAuthenticator),
            vec![Protocol::Http11],
            None,
            Arc::new(NoProxy),
        )
    }

    #[test]
    fn equality_is_structural_over_host_and_port() {
        assert_eq!(address("h", 80), address("h", 80));
        assert_ne!(address("h", 80), address("h", 81));
        assert_ne!(address("h", 80), address("other", 80));
    }

    #[test]
    fn equality_distinguishes_collaborator_identity() {
        let auth: Arc<dyn Authenticator> = Arc::new(NoAuthenticator);
        let selector: Arc<dyn ProxySelector> = Arc::new(NoProxy);
        let a = Address::new(
            "h",
            80,
            None,
            CertificatePinner::default(),
            auth.clone(),
            vec![Protocol::Http11],
            None,
            selector.clone(),
        );
        let same = Address::new(
            "h",
            80,
            None,
            CertificatePinner::default(),
            auth,
            vec![Protocol::Http11],
            None,
            selector,
        );
        assert_eq!(a, same);
        // A distinct authenticator instance makes a distinct address.
        assert_ne!(a, address("h", 80));
    }

    #[test]
    fn equality_considers_proxy() {
        let direct = address("h", 80);
        let mut proxied = address("h", 80);
        proxied.proxy = Some(Proxy::Http {
            host: "p".to_string(),
            port: 3128,
        });
        // Same collaborators required for equality; clone then vary proxy.
        let mut also_proxied = direct.clone();
        also_proxied.proxy = Some(Proxy::Http {
            host: "p".to_string(),
            port: 3128,
        });
        assert_ne!(direct, also_proxied);
        assert_eq!(also_proxied.clone(), also_proxied);
        let _ = proxied;
    }

    #[test]
    fn system_dns_resolves_localhost() {
        let addrs = SystemDns.resolve("localhost").unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|a| a.is_loopback()));
    }
}
