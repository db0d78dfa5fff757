//! The HTTP client: configuration, capability ports, and call creation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::client::auth::{Authenticator, NoAuthentication};
use crate::client::dns::{Dns, SystemDns};
use crate::client::events::{
    EventListener, EventListenerFactory, NoEvents, SingletonEventListenerFactory,
};
use crate::connect::route::RouteDatabase;
use crate::connect::{ConnectionPool, NoProxy, Proxy, ProxySelector};
use crate::cookie::{CookieJar, NoCookies};
use crate::error::{Error, Result};
use crate::interceptor::{CacheStore, Interceptor};
use crate::protocol::Protocol;
use crate::request::Request;
use crate::tls::{
    CertificatePinner, DefaultHostnameVerifier, DefaultSocketFactory, HostnameVerifier,
    SecureSocketFactory, SocketFactory,
};
use crate::url::HttpUrl;

pub mod auth;
pub mod dns;
pub mod events;

pub(crate) mod call;
mod dispatch;

pub use self::call::{Call, Callback};
pub use self::dispatch::Dispatcher;

use crate::connect::Address;

pub(crate) const USER_AGENT: &str = concat!("courier/", env!("CARGO_PKG_VERSION"));

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A configured HTTP client, the factory for [`Call`]s.
///
/// Clients are cheap handles over shared state: the connection pool, the
/// dispatcher, and the capability ports. Clone one client for the whole
/// application so every call shares its connections. Derive a variant with
/// different settings via [`new_builder`](Client::new_builder); the
/// derived client keeps sharing the pool and dispatcher.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    dispatcher: Dispatcher,
    pool: ConnectionPool,
    route_database: Arc<RouteDatabase>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    dns: Arc<dyn Dns>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    cookie_jar: Arc<dyn CookieJar>,
    cache: Option<Arc<dyn CacheStore>>,
    socket_factory: Arc<dyn SocketFactory>,
    ssl_socket_factory: Option<Arc<dyn SecureSocketFactory>>,
    hostname_verifier: Arc<dyn HostnameVerifier>,
    certificate_pinner: Option<Arc<dyn CertificatePinner>>,
    authenticator: Arc<dyn Authenticator>,
    proxy_authenticator: Arc<dyn Authenticator>,
    event_listener_factory: Arc<dyn EventListenerFactory>,
    protocols: Vec<Protocol>,
    follow_redirects: bool,
    follow_ssl_redirects: bool,
    retry_on_connection_failure: bool,
    call_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Client {
    /// A client with default settings.
    pub fn new() -> Client {
        Client::builder().build()
    }

    /// Returns a new builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Returns a builder seeded with this client's settings, sharing its
    /// pool and dispatcher.
    pub fn new_builder(&self) -> ClientBuilder {
        ClientBuilder {
            dispatcher: self.inner.dispatcher.clone(),
            pool: self.inner.pool.clone(),
            interceptors: self.inner.interceptors.clone(),
            network_interceptors: self.inner.network_interceptors.clone(),
            dns: self.inner.dns.clone(),
            proxy: self.inner.proxy.clone(),
            proxy_selector: self.inner.proxy_selector.clone(),
            cookie_jar: self.inner.cookie_jar.clone(),
            cache: self.inner.cache.clone(),
            socket_factory: self.inner.socket_factory.clone(),
            ssl_socket_factory: self.inner.ssl_socket_factory.clone(),
            hostname_verifier: self.inner.hostname_verifier.clone(),
            certificate_pinner: self.inner.certificate_pinner.clone(),
            authenticator: self.inner.authenticator.clone(),
            proxy_authenticator: self.inner.proxy_authenticator.clone(),
            event_listener_factory: self.inner.event_listener_factory.clone(),
            protocols: self.inner.protocols.clone(),
            follow_redirects: self.inner.follow_redirects,
            follow_ssl_redirects: self.inner.follow_ssl_redirects,
            retry_on_connection_failure: self.inner.retry_on_connection_failure,
            call_timeout: self.inner.call_timeout,
            connect_timeout: self.inner.connect_timeout,
            read_timeout: self.inner.read_timeout,
            write_timeout: self.inner.write_timeout,
        }
    }

    /// Prepares `request` for execution.
    pub fn call(&self, request: Request) -> Call {
        Call::new(self.clone(), request)
    }

    /// The dispatcher running this client's asynchronous calls.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    /// The pool this client's connections live in.
    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    pub(crate) fn route_database(&self) -> &Arc<RouteDatabase> {
        &self.inner.route_database
    }

    pub(crate) fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.interceptors
    }

    pub(crate) fn network_interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.inner.network_interceptors
    }

    pub(crate) fn cookie_jar(&self) -> &Arc<dyn CookieJar> {
        &self.inner.cookie_jar
    }

    pub(crate) fn cache(&self) -> Option<&Arc<dyn CacheStore>> {
        self.inner.cache.as_ref()
    }

    pub(crate) fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.inner.authenticator
    }

    pub(crate) fn proxy_authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.inner.proxy_authenticator
    }

    pub(crate) fn event_listener_factory(&self) -> &Arc<dyn EventListenerFactory> {
        &self.inner.event_listener_factory
    }

    /// Whether this client follows redirects.
    pub fn follow_redirects(&self) -> bool {
        self.inner.follow_redirects
    }

    /// Whether this client follows redirects that change between `http`
    /// and `https`.
    pub fn follow_ssl_redirects(&self) -> bool {
        self.inner.follow_ssl_redirects
    }

    /// Whether connect-level failures are retried on another route.
    pub fn retry_on_connection_failure(&self) -> bool {
        self.inner.retry_on_connection_failure
    }

    /// The whole-call deadline, or `None` for no limit.
    pub fn call_timeout(&self) -> Option<Duration> {
        self.inner.call_timeout
    }

    /// The socket dial timeout.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.inner.connect_timeout
    }

    /// The socket read timeout.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.inner.read_timeout
    }

    /// The socket write timeout.
    pub fn write_timeout(&self) -> Option<Duration> {
        self.inner.write_timeout
    }

    /// The protocols offered via ALPN, in preference order.
    pub fn protocols(&self) -> &[Protocol] {
        &self.inner.protocols
    }

    /// The pool key for connections to `url`'s origin.
    pub(crate) fn address_for(&self, url: &HttpUrl) -> Result<Address> {
        let inner = &self.inner;
        let (ssl_socket_factory, hostname_verifier, certificate_pinner, protocols) =
            if url.is_https() {
                let factory = inner.ssl_socket_factory.clone().ok_or_else(|| {
                    Error::new_protocol("no SecureSocketFactory configured for https")
                })?;
                (
                    Some(factory),
                    Some(inner.hostname_verifier.clone()),
                    inner.certificate_pinner.clone(),
                    inner.protocols.clone(),
                )
            } else {
                // Plaintext never negotiates; it speaks HTTP/1.1.
                (None, None, None, vec![Protocol::Http11])
            };
        Ok(Address::new(
            url.scheme(),
            url.host(),
            url.port(),
            protocols,
            inner.dns.clone(),
            inner.socket_factory.clone(),
            ssl_socket_factory,
            hostname_verifier,
            certificate_pinner,
            inner.proxy_authenticator.clone(),
            inner.proxy.clone(),
            inner.proxy_selector.clone(),
        ))
    }
}

impl Default for Client {
    fn default() -> Client {
        Client::new()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("protocols", &self.inner.protocols)
            .field("proxy", &self.inner.proxy)
            .finish()
    }
}

/// Configures and builds a [`Client`].
pub struct ClientBuilder {
    dispatcher: Dispatcher,
    pool: ConnectionPool,
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    dns: Arc<dyn Dns>,
    proxy: Option<Proxy>,
    proxy_selector: Arc<dyn ProxySelector>,
    cookie_jar: Arc<dyn CookieJar>,
    cache: Option<Arc<dyn CacheStore>>,
    socket_factory: Arc<dyn SocketFactory>,
    ssl_socket_factory: Option<Arc<dyn SecureSocketFactory>>,
    hostname_verifier: Arc<dyn HostnameVerifier>,
    certificate_pinner: Option<Arc<dyn CertificatePinner>>,
    authenticator: Arc<dyn Authenticator>,
    proxy_authenticator: Arc<dyn Authenticator>,
    event_listener_factory: Arc<dyn EventListenerFactory>,
    protocols: Vec<Protocol>,
    follow_redirects: bool,
    follow_ssl_redirects: bool,
    retry_on_connection_failure: bool,
    call_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl ClientBuilder {
    /// A builder with the default settings.
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            dispatcher: Dispatcher::default(),
            pool: ConnectionPool::default(),
            interceptors: Vec::new(),
            network_interceptors: Vec::new(),
            dns: Arc::new(SystemDns),
            proxy: None,
            proxy_selector: Arc::new(NoProxy),
            cookie_jar: Arc::new(NoCookies),
            cache: None,
            socket_factory: Arc::new(DefaultSocketFactory),
            ssl_socket_factory: None,
            hostname_verifier: Arc::new(DefaultHostnameVerifier),
            certificate_pinner: None,
            authenticator: Arc::new(NoAuthentication),
            proxy_authenticator: Arc::new(NoAuthentication),
            event_listener_factory: Arc::new(SingletonEventListenerFactory::new(Arc::new(
                NoEvents,
            ))),
            protocols: vec![Protocol::H2, Protocol::Http11],
            follow_redirects: true,
            follow_ssl_redirects: true,
            retry_on_connection_failure: true,
            call_timeout: None,
            connect_timeout: Some(DEFAULT_TIMEOUT),
            read_timeout: Some(DEFAULT_TIMEOUT),
            write_timeout: Some(DEFAULT_TIMEOUT),
        }
    }

    /// Adds an application interceptor: it observes the call once, before
    /// retries, redirects, and caching.
    pub fn add_interceptor(mut self, interceptor: impl Interceptor + 'static) -> ClientBuilder {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Adds a network interceptor: it observes every network request on a
    /// live connection, after caching and before the wire.
    pub fn add_network_interceptor(
        mut self,
        interceptor: impl Interceptor + 'static,
    ) -> ClientBuilder {
        self.network_interceptors.push(Arc::new(interceptor));
        self
    }

    /// Uses `dispatcher` for asynchronous calls, shareable across clients.
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> ClientBuilder {
        self.dispatcher = dispatcher;
        self
    }

    /// Uses `pool`, shareable across clients.
    pub fn connection_pool(mut self, pool: ConnectionPool) -> ClientBuilder {
        self.pool = pool;
        self
    }

    /// Resolves hostnames with `dns`.
    pub fn dns(mut self, dns: impl Dns + 'static) -> ClientBuilder {
        self.dns = Arc::new(dns);
        self
    }

    /// Routes every connection through `proxy`, bypassing the proxy
    /// selector.
    pub fn proxy(mut self, proxy: Proxy) -> ClientBuilder {
        self.proxy = Some(proxy);
        self
    }

    /// Chooses proxies with `selector` when no explicit proxy is set.
    pub fn proxy_selector(mut self, selector: impl ProxySelector + 'static) -> ClientBuilder {
        self.proxy_selector = Arc::new(selector);
        self
    }

    /// Stores and supplies cookies with `jar`.
    pub fn cookie_jar(mut self, jar: impl CookieJar + 'static) -> ClientBuilder {
        self.cookie_jar = Arc::new(jar);
        self
    }

    /// Caches responses in `cache`.
    pub fn cache(mut self, cache: impl CacheStore + 'static) -> ClientBuilder {
        self.cache = Some(Arc::new(cache));
        self
    }

    /// Dials plaintext sockets with `factory`.
    pub fn socket_factory(mut self, factory: impl SocketFactory + 'static) -> ClientBuilder {
        self.socket_factory = Arc::new(factory);
        self
    }

    /// Upgrades `https` connections with `factory`. Without one, `https`
    /// requests fail.
    pub fn ssl_socket_factory(
        mut self,
        factory: impl SecureSocketFactory + 'static,
    ) -> ClientBuilder {
        self.ssl_socket_factory = Some(Arc::new(factory));
        self
    }

    /// Confirms TLS handshakes against hostnames with `verifier`.
    pub fn hostname_verifier(mut self, verifier: impl HostnameVerifier + 'static) -> ClientBuilder {
        self.hostname_verifier = Arc::new(verifier);
        self
    }

    /// Constrains trusted certificates with `pinner`.
    pub fn certificate_pinner(mut self, pinner: impl CertificatePinner + 'static) -> ClientBuilder {
        self.certificate_pinner = Some(Arc::new(pinner));
        self
    }

    /// Answers `401 Unauthorized` challenges with `authenticator`.
    pub fn authenticator(mut self, authenticator: impl Authenticator + 'static) -> ClientBuilder {
        self.authenticator = Arc::new(authenticator);
        self
    }

    /// Answers `407 Proxy Authentication Required` challenges with
    /// `authenticator`.
    pub fn proxy_authenticator(
        mut self,
        authenticator: impl Authenticator + 'static,
    ) -> ClientBuilder {
        self.proxy_authenticator = Arc::new(authenticator);
        self
    }

    /// Observes every call with `listener`.
    pub fn event_listener(mut self, listener: impl EventListener + 'static) -> ClientBuilder {
        self.event_listener_factory =
            Arc::new(SingletonEventListenerFactory::new(Arc::new(listener)));
        self
    }

    /// Creates one listener per call with `factory`.
    pub fn event_listener_factory(
        mut self,
        factory: impl EventListenerFactory + 'static,
    ) -> ClientBuilder {
        self.event_listener_factory = Arc::new(factory);
        self
    }

    /// The protocols to offer via ALPN, in preference order. Must include
    /// [`Protocol::Http11`].
    ///
    /// # Panics
    ///
    /// Panics when `protocols` omits HTTP/1.1 or names HTTP/1.0.
    pub fn protocols(mut self, protocols: Vec<Protocol>) -> ClientBuilder {
        assert!(
            protocols.contains(&Protocol::Http11),
            "protocols must contain http/1.1: {:?}",
            protocols
        );
        assert!(
            !protocols.contains(&Protocol::Http10),
            "protocols must not contain http/1.0: {:?}",
            protocols
        );
        self.protocols = protocols;
        self
    }

    /// Whether to follow redirects.
    pub fn follow_redirects(mut self, follow: bool) -> ClientBuilder {
        self.follow_redirects = follow;
        self
    }

    /// Whether to follow redirects that change between `http` and `https`.
    pub fn follow_ssl_redirects(mut self, follow: bool) -> ClientBuilder {
        self.follow_ssl_redirects = follow;
        self
    }

    /// Whether connect-level failures are retried on another route.
    pub fn retry_on_connection_failure(mut self, retry: bool) -> ClientBuilder {
        self.retry_on_connection_failure = retry;
        self
    }

    /// Bounds the entire call, from execution to the last body byte. Zero
    /// means no limit.
    pub fn call_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.call_timeout = some_nonzero(timeout);
        self
    }

    /// Bounds each socket dial. Zero means no limit.
    pub fn connect_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.connect_timeout = some_nonzero(timeout);
        self
    }

    /// Bounds each socket read. Zero means no limit.
    pub fn read_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.read_timeout = some_nonzero(timeout);
        self
    }

    /// Bounds each socket write. Zero means no limit.
    pub fn write_timeout(mut self, timeout: Duration) -> ClientBuilder {
        self.write_timeout = some_nonzero(timeout);
        self
    }

    /// Builds the client.
    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                dispatcher: self.dispatcher,
                pool: self.pool,
                route_database: Arc::new(RouteDatabase::default()),
                interceptors: self.interceptors,
                network_interceptors: self.network_interceptors,
                dns: self.dns,
                proxy: self.proxy,
                proxy_selector: self.proxy_selector,
                cookie_jar: self.cookie_jar,
                cache: self.cache,
                socket_factory: self.socket_factory,
                ssl_socket_factory: self.ssl_socket_factory,
                hostname_verifier: self.hostname_verifier,
                certificate_pinner: self.certificate_pinner,
                authenticator: self.authenticator,
                proxy_authenticator: self.proxy_authenticator,
                event_listener_factory: self.event_listener_factory,
                protocols: self.protocols,
                follow_redirects: self.follow_redirects,
                follow_ssl_redirects: self.follow_ssl_redirects,
                retry_on_connection_failure: self.retry_on_connection_failure,
                call_timeout: self.call_timeout,
                connect_timeout: self.connect_timeout,
                read_timeout: self.read_timeout,
                write_timeout: self.write_timeout,
            }),
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> ClientBuilder {
        ClientBuilder::new()
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("protocols", &self.protocols)
            .field("proxy", &self.proxy)
            .finish()
    }
}

fn some_nonzero(timeout: Duration) -> Option<Duration> {
    if timeout.is_zero() {
        None
    } else {
        Some(timeout)
    }
}
