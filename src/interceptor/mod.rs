//! The interceptor pipeline: observe, transform, short-circuit, and
//! retry calls.
//!
//! Application interceptors run before the client's own machinery and may
//! call [`Chain::proceed`] any number of times (including zero, to serve
//! a response themselves). Network interceptors run once a connection is
//! bound and must call `proceed` exactly once, without changing the
//! request's host or port.

use std::sync::Arc;
use std::time::Duration;

use crate::client::Call;
use crate::connect::Connection;
use crate::error::{Error, Result};
use crate::exchange::Exchange;
use crate::request::Request;
use crate::response::Response;

pub(crate) mod bridge;
pub(crate) mod cache;
pub(crate) mod call_server;
pub(crate) mod connect;
pub(crate) mod retry;

pub use self::cache::{CacheStore, CacheStrategy, CacheWriter};

/// Observes and transforms one request/response round trip.
pub trait Interceptor: Send + Sync {
    /// Handles the chain's request, typically by forwarding a (possibly
    /// modified) request with [`Chain::proceed`] and returning a
    /// (possibly modified) response.
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response>;
}

/// A concrete carrier of one interceptor invocation.
pub struct Chain<'a> {
    call: &'a Call,
    interceptors: &'a [Arc<dyn Interceptor>],
    index: usize,
    request: Request,
    pub(crate) exchange: Option<Arc<Exchange>>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    /// How many times `proceed` ran on this chain instance.
    calls: u32,
}

impl<'a> Chain<'a> {
    pub(crate) fn new(
        call: &'a Call,
        interceptors: &'a [Arc<dyn Interceptor>],
        request: Request,
        connect_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Chain<'a> {
        Chain {
            call,
            interceptors,
            index: 0,
            request,
            exchange: None,
            connect_timeout,
            read_timeout,
            write_timeout,
            calls: 0,
        }
    }

    /// The request as this interceptor sees it.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The call this chain belongs to.
    pub fn call(&self) -> &Call {
        self.call
    }

    /// The connection the request will use. Available to network
    /// interceptors; `None` before one is bound.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.exchange.as_ref().map(|e| e.connection().clone())
    }

    /// The connect timeout in force.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// The read timeout in force.
    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    /// The write timeout in force.
    pub fn write_timeout(&self) -> Option<Duration> {
        self.write_timeout
    }

    /// Adjusts the connect timeout for the rest of this call. Only
    /// application interceptors may adjust timeouts.
    pub fn with_connect_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.check_timeout_mutable()?;
        self.connect_timeout = some_nonzero(timeout);
        Ok(())
    }

    /// Adjusts the read timeout for the rest of this call. Only
    /// application interceptors may adjust timeouts.
    pub fn with_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.check_timeout_mutable()?;
        self.read_timeout = some_nonzero(timeout);
        Ok(())
    }

    /// Adjusts the write timeout for the rest of this call. Only
    /// application interceptors may adjust timeouts.
    pub fn with_write_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.check_timeout_mutable()?;
        self.write_timeout = some_nonzero(timeout);
        Ok(())
    }

    fn check_timeout_mutable(&self) -> Result<()> {
        if self.exchange.is_some() {
            return Err(Error::new_protocol(
                "Timeouts can't be adjusted in a network interceptor",
            ));
        }
        Ok(())
    }

    pub(crate) fn exchange(&self) -> Option<&Arc<Exchange>> {
        self.exchange.as_ref()
    }

    /// Forwards `request` to the rest of the chain and returns its
    /// response.
    pub fn proceed(&mut self, request: Request) -> Result<Response> {
        self.call.inner.check_canceled()?;
        self.call.inner.check_deadline()?;

        self.calls += 1;
        if self.exchange.is_some() {
            if request.url().host() != self.request.url().host()
                || request.url().port() != self.request.url().port()
            {
                return Err(Error::new_protocol(
                    "network interceptor must retain the same host and port",
                ));
            }
            if self.calls > 1 {
                return Err(Error::new_protocol(
                    "network interceptor must call proceed() exactly once",
                ));
            }
        }

        let interceptor = match self.interceptors.get(self.index) {
            Some(interceptor) => interceptor,
            None => return Err(Error::new_protocol("chain exhausted")),
        };

        let mut next = Chain {
            call: self.call,
            interceptors: self.interceptors,
            index: self.index + 1,
            request,
            exchange: self.exchange.clone(),
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
            calls: 0,
        };
        let response = interceptor.intercept(&mut next)?;

        if next.exchange.is_some() && self.index + 1 < self.interceptors.len() && next.calls != 1 {
            return Err(Error::new_protocol(
                "network interceptor must call proceed() exactly once",
            ));
        }

        Ok(response)
    }
}

impl<'a> std::fmt::Debug for Chain<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chain")
            .field("index", &self.index)
            .field("request", &self.request)
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
