//! Reaching an origin server: addresses, proxies, routes, connections,
//! and the shared pool.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::client::auth::Authenticator;
use crate::client::dns::Dns;
use crate::protocol::Protocol;
use crate::tls::{CertificatePinner, HostnameVerifier, SecureSocketFactory, SocketFactory};
use crate::url::HttpUrl;

pub(crate) mod conn;
pub(crate) mod finder;
pub(crate) mod pool;
pub(crate) mod route;

pub use self::conn::Connection;
pub use self::pool::ConnectionPool;

/// A specification for connections to an origin server.
///
/// This is the connection pool's key: two requests may share a connection
/// only when their addresses are equal, i.e. when every field that shapes
/// the connection — target, DNS, socket and TLS factories, proxy
/// configuration — is the same.
#[derive(Clone)]
pub struct Address {
    url: HttpUrl,
    protocols: Vec<Protocol>,
    dns: Arc<dyn Dns>,
    socket_factory: Arc<dyn SocketFactory>,
    ssl_socket_factory: Option<Arc<dyn SecureSocketFactory>>,
    hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
    certificate_pinner: Option<Arc<dyn CertificatePinner>>,
    proxy_authenticator: Arc<dyn Authenticator>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
}

impl Address {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        scheme: &str,
        host: &str,
        port: u16,
        protocols: Vec<Protocol>,
        dns: Arc<dyn Dns>,
        socket_factory: Arc<dyn SocketFactory>,
        ssl_socket_factory: Option<Arc<dyn SecureSocketFactory>>,
        hostname_verifier: Option<Arc<dyn HostnameVerifier>>,
        certificate_pinner: Option<Arc<dyn CertificatePinner>>,
        proxy_authenticator: Arc<dyn Authenticator>,
        proxy: Option<Proxy>,
        proxy_selector: Arc<dyn ProxySelector>,
    ) -> Address {
        // Hosts arrive canonical; IPv6 needs its brackets back for the
        // builder.
        let host = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host.to_owned()
        };
        let url = crate::url::UrlBuilder::new()
            .scheme(scheme)
            .host(&host)
            .port(port as u32)
            .build()
            .expect("scheme and host are present");
        Address {
            url,
            protocols,
            dns,
            socket_factory,
            ssl_socket_factory,
            hostname_verifier,
            certificate_pinner,
            proxy_authenticator,
            proxy,
            proxy_selector,
        }
    }

    /// A URL with the address's scheme, host, and port, and `/` for a
    /// path.
    pub fn url(&self) -> &HttpUrl {
        &self.url
    }

    /// The target hostname.
    pub fn host(&self) -> &str {
        self.url.host()
    }

    /// The target port.
    pub fn port(&self) -> u16 {
        self.url.port()
    }

    /// Whether connections are upgraded to TLS.
    pub fn is_https(&self) -> bool {
        self.ssl_socket_factory.is_some()
    }

    /// The protocols the client will offer, in preference order.
    pub fn protocols(&self) -> &[Protocol] {
        &self.protocols
    }

    pub(crate) fn dns(&self) -> &Arc<dyn Dns> {
        &self.dns
    }

    pub(crate) fn socket_factory(&self) -> &Arc<dyn SocketFactory> {
        &self.socket_factory
    }

    pub(crate) fn ssl_socket_factory(&self) -> Option<&Arc<dyn SecureSocketFactory>> {
        self.ssl_socket_factory.as_ref()
    }

    pub(crate) fn hostname_verifier(&self) -> Option<&Arc<dyn HostnameVerifier>> {
        self.hostname_verifier.as_ref()
    }

    pub(crate) fn certificate_pinner(&self) -> Option<&Arc<dyn CertificatePinner>> {
        self.certificate_pinner.as_ref()
    }

    pub(crate) fn proxy_authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.proxy_authenticator
    }

    pub(crate) fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    pub(crate) fn proxy_selector(&self) -> &Arc<dyn ProxySelector> {
        &self.proxy_selector
    }

    /// Equality of everything but the target host, used when checking
    /// whether an HTTP/2 connection to another host may be coalesced onto.
    pub(crate) fn equals_non_host(&self, other: &Address) -> bool {
        Arc::ptr_eq(&self.dns, &other.dns)
            && Arc::ptr_eq(&self.socket_factory, &other.socket_factory)
            && opt_ptr_eq(&self.ssl_socket_factory, &other.ssl_socket_factory)
            && opt_ptr_eq(&self.hostname_verifier, &other.hostname_verifier)
            && opt_ptr_eq(&self.certificate_pinner, &other.certificate_pinner)
            && Arc::ptr_eq(&self.proxy_authenticator, &other.proxy_authenticator)
            && Arc::ptr_eq(&self.proxy_selector, &other.proxy_selector)
            && self.proxy == other.proxy
            && self.protocols == other.protocols
            && self.url.port() == other.url.port()
    }
}

fn opt_ptr_eq<T: ?Sized>(a: &Option<Arc<T>>, b: &Option<Arc<T>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Address) -> bool {
        self.url == other.url && self.equals_non_host(other)
    }
}

impl Eq for Address {}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Address");
        s.field("host", &self.url.host());
        s.field("port", &self.url.port());
        match self.proxy {
            Some(ref proxy) => s.field("proxy", proxy),
            None => s.field("proxySelector", &"..."),
        };
        s.finish()
    }
}

/// A proxy through which connections are made.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Proxy {
    /// No proxy: connect straight to the origin.
    Direct,
    /// An HTTP proxy. Plaintext requests are forwarded in absolute form;
    /// HTTPS is tunneled with CONNECT.
    Http {
        /// The proxy hostname.
        host: String,
        /// The proxy port.
        port: u16,
    },
    /// A SOCKS5 proxy. The target hostname is sent to the proxy
    /// unresolved.
    Socks {
        /// The proxy hostname.
        host: String,
        /// The proxy port.
        port: u16,
    },
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Proxy::Direct => f.write_str("DIRECT"),
            Proxy::Http { ref host, port } => write!(f, "HTTP @ {}:{}", host, port),
            Proxy::Socks { ref host, port } => write!(f, "SOCKS @ {}:{}", host, port),
        }
    }
}

/// Chooses the proxies to attempt for a URL.
pub trait ProxySelector: Send + Sync + fmt::Debug {
    /// The proxies to try for `url`, in order. An empty list means
    /// connect directly.
    fn select(&self, url: &HttpUrl) -> Vec<Proxy>;
}

/// A selector that always connects directly.
#[derive(Debug, Default)]
pub struct NoProxy;

impl ProxySelector for NoProxy {
    fn select(&self, _url: &HttpUrl) -> Vec<Proxy> {
        Vec::new()
    }
}

/// One concrete dial target: an address, the proxy to go through, and the
/// resolved socket address.
#[derive(Clone)]
pub struct Route {
    address: Arc<Address>,
    proxy: Proxy,
    socket_address: SocketAddr,
}

impl Route {
    pub(crate) fn new(address: Arc<Address>, proxy: Proxy, socket_address: SocketAddr) -> Route {
        Route {
            address,
            proxy,
            socket_address,
        }
    }

    /// The address this route reaches.
    pub fn address(&self) -> &Arc<Address> {
        &self.address
    }

    /// The proxy this route goes through.
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    /// The socket address this route dials: the proxy's when proxied,
    /// the origin's otherwise.
    pub fn socket_address(&self) -> SocketAddr {
        self.socket_address
    }

    /// Whether this route tunnels HTTPS through an HTTP proxy.
    pub(crate) fn requires_tunnel(&self) -> bool {
        matches!(self.proxy, Proxy::Http { .. }) && self.address.is_https()
    }
}

impl PartialEq for Route {
    fn eq(&self, other: &Route) -> bool {
        self.address == other.address
            && self.proxy == other.proxy
            && self.socket_address == other.socket_address
    }
}

impl Eq for Route {}

impl Hash for Route {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.url().as_str().hash(state);
        self.proxy.hash(state);
        self.socket_address.hash(state);
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} via {}", self.socket_address, self.proxy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::auth::NoAuthentication;
    use crate::client::dns::SystemDns;
    use crate::tls::DefaultSocketFactory;

    fn address(host: &str, port: u16) -> Address {
        Address::new(
            "http",
            host,
            port,
            vec![Protocol::Http11],
            Arc::new(SystemDns),
            Arc::new(DefaultSocketFactory),
            None,
            None,
            None,
            Arc::new(NoAuthentication),
            None,
            Arc::new(NoProxy),
        )
    }

    #[test]
    fn equality_requires_identical_capabilities() {
        let a = address("example.com", 80);
        let b = a.clone();
        assert_eq!(a, b);

        // Same host, different capability instances.
        let c = address("example.com", 80);
        assert_ne!(a, c);
    }

    #[test]
    fn equality_requires_same_target() {
        let a = address("example.com", 80);
        let mut b = a.clone();
        b.url = crate::url::HttpUrl::parse("http://example.com:8080/").unwrap();
        assert_ne!(a, b);
        assert!(a.equals_non_host(&a.clone()));
    }
}
