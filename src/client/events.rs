//! Call event hooks.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::client::Call;
use crate::connect::{Connection, Proxy};
use crate::error::Error;
use crate::protocol::Protocol;
use crate::request::Request;
use crate::response::Response;
use crate::tls::Handshake;
use crate::url::HttpUrl;

/// Observes the lifecycle of one call.
///
/// One listener instance is created per call; each hook fires at most
/// once, except the connect group which repeats per attempted route. All
/// hooks default to no-ops so implementations override only what they
/// measure. Hooks are invoked on the thread driving the call and must not
/// block.
#[allow(unused_variables)]
pub trait EventListener: Send + Sync {
    /// The call was submitted, before any interceptor ran.
    fn call_start(&self, call: &Call) {}

    /// Proxy selection is about to run for `url`.
    fn proxy_select_start(&self, call: &Call, url: &HttpUrl) {}

    /// Proxy selection produced `proxies`, in the order they will be tried.
    fn proxy_select_end(&self, call: &Call, url: &HttpUrl, proxies: &[Proxy]) {}

    /// A DNS lookup of `domain_name` is starting.
    fn dns_start(&self, call: &Call, domain_name: &str) {}

    /// A DNS lookup finished with `addresses`.
    fn dns_end(&self, call: &Call, domain_name: &str, addresses: &[IpAddr]) {}

    /// A socket dial to `socket_address` is starting.
    fn connect_start(&self, call: &Call, socket_address: SocketAddr, proxy: &Proxy) {}

    /// A TLS handshake is starting.
    fn secure_connect_start(&self, call: &Call) {}

    /// A TLS handshake finished.
    fn secure_connect_end(&self, call: &Call, handshake: Option<&Handshake>) {}

    /// A full connection (TCP + TLS + protocol selection) was established.
    fn connect_end(
        &self,
        call: &Call,
        socket_address: SocketAddr,
        proxy: &Proxy,
        protocol: Option<Protocol>,
    ) {}

    /// A connection attempt failed. The route planner may try another.
    fn connect_failed(
        &self,
        call: &Call,
        socket_address: SocketAddr,
        proxy: &Proxy,
        error: &Error,
    ) {}

    /// The call was assigned a connection, new or pooled.
    fn connection_acquired(&self, call: &Call, connection: &Connection) {}

    /// The call released its connection back to the pool.
    fn connection_released(&self, call: &Call, connection: &Connection) {}

    /// Request headers are about to be written.
    fn request_headers_start(&self, call: &Call) {}

    /// Request headers were written.
    fn request_headers_end(&self, call: &Call, request: &Request) {}

    /// A request body is about to be written.
    fn request_body_start(&self, call: &Call) {}

    /// The request body was fully written.
    fn request_body_end(&self, call: &Call, byte_count: u64) {}

    /// Writing the request failed.
    fn request_failed(&self, call: &Call, error: &Error) {}

    /// Response headers are about to be read.
    fn response_headers_start(&self, call: &Call) {}

    /// Response headers were received.
    fn response_headers_end(&self, call: &Call, response: &Response) {}

    /// The response body is about to be read.
    fn response_body_start(&self, call: &Call) {}

    /// The response body was fully read.
    fn response_body_end(&self, call: &Call, byte_count: u64) {}

    /// Reading the response failed.
    fn response_failed(&self, call: &Call, error: &Error) {}

    /// The call completed with a response.
    fn call_end(&self, call: &Call) {}

    /// The call completed with a failure.
    fn call_failed(&self, call: &Call, error: &Error) {}

    /// The call was canceled. May fire concurrently with other hooks.
    fn canceled(&self, call: &Call) {}
}

/// Creates one [`EventListener`] per call.
pub trait EventListenerFactory: Send + Sync {
    /// Returns the listener for `call`.
    fn create(&self, call: &Call) -> Arc<dyn EventListener>;
}

/// A listener observing nothing.
#[derive(Debug, Default)]
pub struct NoEvents;

impl EventListener for NoEvents {}

/// A factory handing the same listener to every call.
pub struct SingletonEventListenerFactory {
    listener: Arc<dyn EventListener>,
}

impl SingletonEventListenerFactory {
    /// Wraps `listener` for every call.
    pub fn new(listener: Arc<dyn EventListener>) -> SingletonEventListenerFactory {
        SingletonEventListenerFactory { listener }
    }
}

impl EventListenerFactory for SingletonEventListenerFactory {
    fn create(&self, _call: &Call) -> Arc<dyn EventListener> {
        self.listener.clone()
    }
}

impl std::fmt::Debug for SingletonEventListenerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("SingletonEventListenerFactory")
    }
}
