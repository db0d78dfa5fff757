//! One request/response pair bound to one connection.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;

use crate::body::{ResponseBody, TrailerSource};
use crate::client::events::EventListener;
use crate::client::Call;
use crate::connect::Connection;
use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::media_type::MediaType;
use crate::request::Request;
use crate::response::{Response, ResponseBuilder};

/// Writes one request body to the wire, framed by the codec.
pub(crate) trait RequestSink: Write + Send {
    /// Completes the body, writing any terminator the framing requires.
    fn close_sink(&mut self) -> io::Result<()>;
}

/// Reads one response body from the wire, unframed by the codec.
pub(crate) trait ResponseSource: Read + Send {
    /// Abandons the body without reading it to the end.
    fn close_source(&mut self);
}

/// The per-protocol half of an [`Exchange`]: encodes one request and
/// decodes one response over an established connection.
pub(crate) trait ExchangeCodec: Send + Sync {
    fn write_request_headers(&self, request: &Request) -> io::Result<()>;

    fn create_request_body(&self, request: &Request) -> io::Result<Box<dyn RequestSink>>;

    /// Flushes the request headers to the wire without finishing the body,
    /// for `Expect: 100-continue` and duplex bodies.
    fn flush_request(&self) -> io::Result<()>;

    fn finish_request(&self) -> io::Result<()>;

    /// Reads the status line and headers. Returns `None` when
    /// `expect_continue` was set and the server answered `100 Continue`,
    /// meaning the caller should now transmit the body.
    fn read_response_headers(&self, expect_continue: bool) -> Result<Option<ResponseBuilder>>;

    /// Opens the body of `response`, returning its length (or -1) and a
    /// source.
    fn open_response_body(&self, response: &Response) -> Result<(i64, Box<dyn ResponseSource>)>;

    /// The trailers, valid once the body has been fully read.
    fn trailers(&self) -> Result<Headers>;

    /// Aborts the exchange at the transport: closes the socket (HTTP/1.1)
    /// or resets the stream (HTTP/2).
    fn cancel(&self);

    /// Whether the connection may serve another exchange after this one.
    fn can_reuse_connection(&self) -> bool;
}

/// Transmits one HTTP request and its response over a connection. Each
/// exchange holds one of the connection's allocations from creation until
/// the response body is exhausted, canceled, or failed.
pub(crate) struct Exchange {
    call: Call,
    events: Arc<dyn EventListener>,
    connection: Arc<Connection>,
    codec: Box<dyn ExchangeCodec>,
    state: Mutex<ExchangeState>,
    canceled: AtomicBool,
    /// Set when the request body is duplex: the request may still be
    /// writing when the response arrives.
    duplex: AtomicBool,
}

#[derive(Default)]
struct ExchangeState {
    request_done: bool,
    response_done: bool,
    released: bool,
    failed: bool,
}

impl Exchange {
    pub(crate) fn new(
        call: Call,
        events: Arc<dyn EventListener>,
        connection: Arc<Connection>,
        codec: Box<dyn ExchangeCodec>,
    ) -> Exchange {
        Exchange {
            call,
            events,
            connection,
            codec,
            state: Mutex::new(ExchangeState::default()),
            canceled: AtomicBool::new(false),
            duplex: AtomicBool::new(false),
        }
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub(crate) fn write_request_headers(&self, request: &Request) -> Result<()> {
        self.events.request_headers_start(&self.call);
        match self.codec.write_request_headers(request) {
            Ok(()) => {
                self.events.request_headers_end(&self.call, request);
                Ok(())
            }
            Err(e) => Err(self.fail(Error::new_io(e).with_request_sent())),
        }
    }

    pub(crate) fn create_request_body(
        self: &Arc<Self>,
        request: &Request,
        duplex: bool,
    ) -> Result<ExchangeSink> {
        self.duplex.store(duplex, Ordering::SeqCst);
        self.events.request_body_start(&self.call);
        let inner = self
            .codec
            .create_request_body(request)
            .map_err(|e| self.fail(Error::new_io(e).with_request_sent()))?;
        Ok(ExchangeSink {
            exchange: self.clone(),
            inner,
            byte_count: 0,
            closed: false,
        })
    }

    pub(crate) fn flush_request(&self) -> Result<()> {
        self.codec
            .flush_request()
            .map_err(|e| self.fail(Error::new_io(e).with_request_sent()))
    }

    pub(crate) fn finish_request(&self) -> Result<()> {
        match self.codec.finish_request() {
            Ok(()) => {
                self.request_done(None);
                Ok(())
            }
            Err(e) => Err(self.fail(Error::new_io(e).with_request_sent())),
        }
    }

    /// Marks the request phase complete for requests with no body.
    pub(crate) fn no_request_body(&self) {
        self.request_done(None);
    }

    pub(crate) fn read_response_headers(
        &self,
        expect_continue: bool,
    ) -> Result<Option<ResponseBuilder>> {
        self.events.response_headers_start(&self.call);
        self.codec
            .read_response_headers(expect_continue)
            .map_err(|e| self.fail(e.with_request_sent()))
    }

    /// Opens the response body as a [`ResponseBody`] that releases this
    /// exchange once fully consumed.
    pub(crate) fn open_response_body(self: &Arc<Self>, response: &Response) -> Result<ResponseBody> {
        self.events.response_body_start(&self.call);
        let (length, source) = self
            .codec
            .open_response_body(response)
            .map_err(|e| self.fail(e))?;
        let media_type = response
            .header("Content-Type")
            .and_then(|ct| MediaType::parse(ct).ok());
        let source = ExchangeSource {
            exchange: self.clone(),
            inner: source,
            byte_count: 0,
            completed: false,
        };
        Ok(ResponseBody::with_trailers(
            media_type,
            length,
            Box::new(source),
            Box::new(ExchangeTrailers {
                exchange: self.clone(),
            }),
        ))
    }

    pub(crate) fn trailers(&self) -> Result<Headers> {
        self.codec.trailers()
    }

    pub(crate) fn response_headers_end(&self, response: &Response) {
        self.events.response_headers_end(&self.call, response);
    }

    /// Cancels this exchange's I/O promptly. Idempotent and callable from
    /// any thread.
    pub(crate) fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!("exchange canceled");
        self.codec.cancel();
    }

    pub(crate) fn is_duplex(&self) -> bool {
        self.duplex.load(Ordering::SeqCst)
    }

    fn request_done(&self, error: Option<&Error>) {
        let mut state = self.state.lock().unwrap();
        state.request_done = true;
        if error.is_some() {
            state.failed = true;
        }
        let finished = state.request_done && state.response_done;
        let release = finished && !state.released;
        if release {
            state.released = true;
        }
        drop(state);
        if release {
            self.release();
        }
    }

    fn response_done(&self, error: Option<&Error>) {
        let mut state = self.state.lock().unwrap();
        state.response_done = true;
        if error.is_some() {
            state.failed = true;
        }
        let finished = state.request_done && state.response_done;
        let release = finished && !state.released;
        if release {
            state.released = true;
        }
        drop(state);
        if release {
            self.release();
        }
    }

    /// Releases this exchange's allocation on the connection, marking the
    /// connection unusable when the codec says it cannot be reused.
    fn release(&self) {
        let failed = self.state.lock().unwrap().failed;
        if failed || !self.codec.can_reuse_connection() {
            self.connection.no_new_exchanges();
        }
        self.connection.release_allocation(&self.call);
        self.events.connection_released(&self.call, &self.connection);
        self.call.inner.exchange_released();
    }

    /// Records a failure, poisons the connection appropriately, and
    /// releases the allocation. Returns the error for propagation.
    pub(crate) fn fail(&self, error: Error) -> Error {
        // A cancel tears the socket down; the resulting I/O error is the
        // cancellation, not a network failure.
        let error = if self.canceled.load(Ordering::SeqCst)
            && !error.is_canceled()
            && !error.is_timeout()
        {
            Error::new_canceled().with(error)
        } else {
            error
        };
        self.events.request_failed(&self.call, &error);
        {
            let mut state = self.state.lock().unwrap();
            state.failed = true;
            state.request_done = true;
            state.response_done = true;
            if state.released {
                return error;
            }
            state.released = true;
        }
        self.connection.track_failure(&error);
        self.connection.no_new_exchanges();
        self.connection.release_allocation(&self.call);
        self.events.connection_released(&self.call, &self.connection);
        self.call.inner.exchange_released();
        error
    }

    /// Fails the exchange when the call was detached before the body was
    /// consumed.
    pub(crate) fn detach(&self) {
        let released = {
            let state = self.state.lock().unwrap();
            state.released
        };
        if !released {
            self.cancel();
            self.fail(Error::new_canceled());
        }
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("connection", &self.connection.id())
            .finish()
    }
}

/// The request-body sink handed to `RequestBody::write_to`, counting
/// bytes and reporting completion to the exchange.
pub(crate) struct ExchangeSink {
    exchange: Arc<Exchange>,
    inner: Box<dyn RequestSink>,
    byte_count: u64,
    closed: bool,
}

impl ExchangeSink {
    pub(crate) fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match self.inner.close_sink() {
            Ok(()) => {
                self.exchange
                    .events
                    .request_body_end(&self.exchange.call, self.byte_count);
                Ok(())
            }
            Err(e) => Err(self
                .exchange
                .fail(Error::new_io(e).with_request_sent())),
        }
    }
}

impl Write for ExchangeSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.exchange.call.inner.check_io()?;
        let n = self.inner.write(buf)?;
        self.byte_count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl std::fmt::Debug for ExchangeSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("ExchangeSink")
    }
}

/// Routes trailer lookups on a finished body to the codec that framed it.
struct ExchangeTrailers {
    exchange: Arc<Exchange>,
}

impl TrailerSource for ExchangeTrailers {
    fn trailers(&self) -> Result<Headers> {
        self.exchange.trailers()
    }
}

/// The response-body source handed to the application, releasing the
/// exchange when the body ends.
struct ExchangeSource {
    exchange: Arc<Exchange>,
    inner: Box<dyn ResponseSource>,
    byte_count: u64,
    completed: bool,
}

impl Read for ExchangeSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.completed {
            return Ok(0);
        }
        self.exchange.call.inner.check_io()?;
        match self.inner.read(buf) {
            Ok(0) => {
                self.completed = true;
                self.exchange
                    .events
                    .response_body_end(&self.exchange.call, self.byte_count);
                self.exchange.response_done(None);
                Ok(0)
            }
            Ok(n) => {
                self.byte_count += n as u64;
                Ok(n)
            }
            Err(e) => {
                if !self.completed {
                    self.completed = true;
                    let error = Error::new_io(io::Error::new(e.kind(), e.to_string()));
                    self.exchange
                        .events
                        .response_failed(&self.exchange.call, &error);
                    self.exchange.response_done(Some(&error));
                    self.exchange.connection.no_new_exchanges();
                }
                Err(e)
            }
        }
    }
}

impl Drop for ExchangeSource {
    fn drop(&mut self) {
        if !self.completed {
            // Body abandoned: the framing state is unknown, so the
            // connection cannot be reused.
            self.inner.close_source();
            self.exchange.connection.no_new_exchanges();
            self.exchange.response_done(None);
        }
    }
}
