//! One request, ready to execute.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::debug;

use crate::client::events::{EventListener, NoEvents};
use crate::client::Client;
use crate::connect::finder::ExchangeFinder;
use crate::connect::Route;
use crate::error::{CanceledCause, Error, Result};
use crate::exchange::Exchange;
use crate::interceptor::bridge::BridgeHeaders;
use crate::interceptor::cache::CacheInterceptor;
use crate::interceptor::call_server::CallServer;
use crate::interceptor::connect::ConnectInterceptor;
use crate::interceptor::retry::RetryAndFollowUp;
use crate::interceptor::{Chain, Interceptor};
use crate::request::Request;
use crate::response::Response;

/// A request that is ready to be executed, at most once.
///
/// A call is a cheap handle: clones share the same underlying attempt, so
/// a call handed to another thread can be [canceled](Call::cancel) from
/// there. To issue the same request again, ask the client for a new call
/// with the original request.
#[derive(Clone)]
pub struct Call {
    pub(crate) inner: Arc<CallInner>,
}

impl Call {
    pub(crate) fn new(client: Client, request: Request) -> Call {
        let call = Call {
            inner: Arc::new(CallInner {
                client,
                request,
                canceled: AtomicBool::new(false),
                executed: AtomicBool::new(false),
                deadline: Mutex::new(None),
                events: Mutex::new(None),
                exchange: Mutex::new(ExchangePhase::default()),
            }),
        };
        let events = call.inner.client.event_listener_factory().create(&call);
        *call.inner.events.lock().unwrap() = Some(events);
        call
    }

    /// The request this call was created with.
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Runs the request on the calling thread, blocking until the response
    /// headers arrive (the body streams as it is read) or the call fails.
    ///
    /// A call may only run once; a second `execute` or `enqueue` fails
    /// immediately.
    pub fn execute(&self) -> Result<Response> {
        if self.inner.executed.swap(true, Ordering::SeqCst) {
            return Err(Error::new_protocol("already executed"));
        }
        self.inner.arm_deadline();
        self.inner.client.dispatcher().executed(self);
        let result = execute_call(self);
        self.inner.client.dispatcher().finished_sync(self);
        result
    }

    /// Submits the request to the dispatcher. `callback` fires exactly
    /// once, with the response or the failure, on a dispatcher thread.
    pub fn enqueue(&self, callback: impl Callback + 'static) {
        if self.inner.executed.swap(true, Ordering::SeqCst) {
            Box::new(callback).on_failure(self.clone(), Error::new_protocol("already executed"));
            return;
        }
        self.inner.arm_deadline();
        self.inner
            .client
            .dispatcher()
            .enqueue(self.clone(), Box::new(callback));
    }

    /// Cancels the call. A queued call fails before it runs; a running
    /// call has its in-flight I/O aborted. Idempotent and safe from any
    /// thread.
    pub fn cancel(&self) {
        if self.inner.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("canceling {:?}", self);
        self.inner.abort_exchange();
        self.inner.events().canceled(self);
    }

    /// Whether [`cancel`](Call::cancel) has been requested, regardless of
    /// whether the I/O has unwound yet.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("method", self.inner.request.method())
            .field("url", self.inner.request.url())
            .finish()
    }
}

/// Receives the outcome of an [enqueued](Call::enqueue) call.
pub trait Callback: Send {
    /// The call completed with `response`. Its body has not been read.
    fn on_response(self: Box<Self>, call: Call, response: Response);

    /// The call failed with `error` before a response was returned.
    fn on_failure(self: Box<Self>, call: Call, error: Error);
}

impl<F> Callback for F
where
    F: FnOnce(Call, Result<Response>) + Send,
{
    fn on_response(self: Box<Self>, call: Call, response: Response) {
        self(call, Ok(response))
    }

    fn on_failure(self: Box<Self>, call: Call, error: Error) {
        self(call, Err(error))
    }
}

/// The connection-planning state of one call, persisting across retries
/// so a follow-up continues from the next untried route.
#[derive(Default)]
struct ExchangePhase {
    finder: Option<ExchangeFinder>,
    /// Set when the next exchange targets an origin the current finder
    /// does not cover; the finder is rebuilt lazily on use.
    pending: Option<Request>,
    exchange: Option<Arc<Exchange>>,
    route: Option<Route>,
}

pub(crate) struct CallInner {
    pub(crate) client: Client,
    request: Request,
    canceled: AtomicBool,
    executed: AtomicBool,
    deadline: Mutex<Option<Instant>>,
    events: Mutex<Option<Arc<dyn EventListener>>>,
    exchange: Mutex<ExchangePhase>,
}

impl CallInner {
    pub(crate) fn events(&self) -> Arc<dyn EventListener> {
        self.events
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Arc::new(NoEvents))
    }

    fn arm_deadline(&self) {
        if let Some(timeout) = self.client.call_timeout() {
            *self.deadline.lock().unwrap() = Some(Instant::now() + timeout);
        }
    }

    fn deadline_expired(&self) -> bool {
        self.deadline
            .lock()
            .unwrap()
            .map_or(false, |deadline| Instant::now() >= deadline)
    }

    pub(crate) fn check_canceled(&self) -> Result<()> {
        if self.canceled.load(Ordering::SeqCst) {
            return Err(Error::new_canceled());
        }
        Ok(())
    }

    pub(crate) fn check_deadline(&self) -> Result<()> {
        if self.deadline_expired() {
            // The call timeout carries cancellation semantics: abort the
            // in-flight I/O and refuse further work.
            self.canceled.store(true, Ordering::SeqCst);
            self.abort_exchange();
            return Err(Error::new_timeout());
        }
        Ok(())
    }

    /// The cancellation and deadline check applied on every blocking body
    /// read and write.
    pub(crate) fn check_io(&self) -> io::Result<()> {
        if self.canceled.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, CanceledCause));
        }
        if self.deadline_expired() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "call timed out"));
        }
        Ok(())
    }

    fn abort_exchange(&self) {
        let exchange = self.exchange.lock().unwrap().exchange.clone();
        if let Some(exchange) = exchange {
            exchange.cancel();
        }
    }

    /// Prepares route planning for an attempt at `request`'s origin. The
    /// finder carries over between attempts on the same origin so retries
    /// continue with the next untried route.
    pub(crate) fn enter_exchange_phase(&self, request: &Request) {
        let mut phase = self.exchange.lock().unwrap();
        let same_origin = phase.finder.as_ref().map_or(false, |finder| {
            let address = finder.address();
            address.url().scheme() == request.url().scheme()
                && address.host() == request.url().host()
                && address.port() == request.url().port()
        });
        if !same_origin {
            phase.pending = Some(request.clone());
        }
    }

    /// Finds a connection and binds a fresh exchange to it.
    pub(crate) fn initialize_exchange(
        self: &Arc<CallInner>,
        connect_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Result<Arc<Exchange>> {
        self.check_canceled()?;
        self.check_deadline()?;
        let call = Call {
            inner: self.clone(),
        };
        let events = self.events();

        // Take the finder out so connecting does not hold the phase lock;
        // cancel() must stay responsive while we dial.
        let mut finder = {
            let mut phase = self.exchange.lock().unwrap();
            if let Some(pending) = phase.pending.take() {
                let address = Arc::new(self.client.address_for(pending.url())?);
                phase.finder = Some(ExchangeFinder::new(
                    self.client.pool().clone(),
                    address,
                    self.client.route_database().clone(),
                    call.clone(),
                    events.clone(),
                ));
            }
            match phase.finder.take() {
                Some(finder) => finder,
                None => {
                    return Err(Error::new_protocol(
                        "exchange requested outside the retry phase",
                    ))
                }
            }
        };

        let found = finder.find(connect_timeout, read_timeout, write_timeout);
        let mut phase = self.exchange.lock().unwrap();
        phase.finder = Some(finder);
        let connection = found?;

        let codec = connection.new_codec(read_timeout, write_timeout);
        let exchange = Arc::new(Exchange::new(call, events, connection.clone(), codec));
        phase.route = Some(connection.route().clone());
        phase.exchange = Some(exchange.clone());
        Ok(exchange)
    }

    /// Whether the route planner has another candidate for the current
    /// origin, consulted by the retry policy.
    pub(crate) fn retry_after_failure(&self) -> bool {
        let phase = self.exchange.lock().unwrap();
        if phase.pending.is_some() {
            return true;
        }
        phase
            .finder
            .as_ref()
            .map_or(true, |finder| finder.retry_after_failure())
    }

    /// The route of the most recent connection, for authenticators.
    pub(crate) fn current_route(&self) -> Option<Route> {
        self.exchange.lock().unwrap().route.clone()
    }

    /// Queues the current route for a fresh dial, after a failure scoped
    /// to the connection rather than the route, e.g. a refused stream.
    pub(crate) fn plan_retry_on_current_route(&self) {
        let mut phase = self.exchange.lock().unwrap();
        let route = phase.route.clone();
        if let (Some(route), Some(finder)) = (route, phase.finder.as_mut()) {
            finder.retry_on(route);
        }
    }

    /// Called by the exchange once its allocation is released.
    pub(crate) fn exchange_released(&self) {
        self.exchange.lock().unwrap().exchange = None;
        self.client.pool().connection_became_idle();
    }

    fn detach_exchange(&self) {
        let exchange = self.exchange.lock().unwrap().exchange.clone();
        if let Some(exchange) = exchange {
            exchange.detach();
        }
    }
}

/// Runs the call's interceptor chain and fires the terminal events.
/// Shared by the blocking and dispatcher paths.
pub(crate) fn execute_call(call: &Call) -> Result<Response> {
    let events = call.inner.events();
    events.call_start(call);
    let result = run_interceptors(call);
    match result {
        Ok(response) => {
            events.call_end(call);
            Ok(response)
        }
        Err(e) => {
            // Whatever failed, the connection must not be left holding an
            // allocation for this call.
            call.inner.detach_exchange();
            events.call_failed(call, &e);
            Err(e)
        }
    }
}

fn run_interceptors(call: &Call) -> Result<Response> {
    let client = call.inner.client.clone();
    let mut interceptors: Vec<Arc<dyn Interceptor>> = Vec::new();
    interceptors.extend_from_slice(client.interceptors());
    interceptors.push(Arc::new(RetryAndFollowUp::new(client.clone())));
    interceptors.push(Arc::new(BridgeHeaders::new(client.cookie_jar().clone())));
    interceptors.push(Arc::new(CacheInterceptor::new(client.cache().cloned())));
    interceptors.push(Arc::new(ConnectInterceptor));
    interceptors.extend_from_slice(client.network_interceptors());
    interceptors.push(Arc::new(CallServer));

    let mut chain = Chain::new(
        call,
        &interceptors,
        call.inner.request.clone(),
        client.connect_timeout(),
        client.read_timeout(),
        client.write_timeout(),
    );
    chain.proceed(call.inner.request.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calls_execute_at_most_once() {
        let client = Client::new();
        let request = Request::builder()
            .url("http://127.0.0.1:1/")
            .unwrap()
            .build()
            .unwrap();
        let call = client.call(request);
        call.cancel();
        // The first run observes the cancellation...
        assert!(call.execute().unwrap_err().is_canceled());
        // ...and the second refuses to run at all.
        assert!(call.execute().unwrap_err().is_protocol());
    }

    #[test]
    fn cancel_is_idempotent_and_observable() {
        let client = Client::new();
        let request = Request::builder()
            .url("http://127.0.0.1:1/")
            .unwrap()
            .build()
            .unwrap();
        let call = client.call(request);
        assert!(!call.is_canceled());
        call.cancel();
        call.cancel();
        assert!(call.is_canceled());
        assert!(call.clone().is_canceled());
    }
}
