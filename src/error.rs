//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;
use std::io;

use crate::proto::h2::frame::ErrorCode;

/// Result type often returned from methods that can have courier `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur executing a call.
///
/// A call observes exactly one `Error`. When several routes were attempted,
/// the failures of the earlier attempts are carried in
/// [`suppressed`](Error::suppressed).
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
    suppressed: Vec<Error>,
    /// Whether any request bytes had been written to the wire when this
    /// error was raised. Consulted by the retry policy.
    request_sent: bool,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// A URL failed to parse or build.
    InvalidUrl,
    /// DNS returned no addresses for a hostname.
    UnknownHost,
    /// A socket dial or TLS handshake failed.
    ConnectFailed,
    /// A framing violation on the wire, or an interceptor contract violation.
    Protocol,
    /// An HTTP/2 stream was reset by the peer.
    StreamReset(ErrorCode),
    /// A call, connect, read, or write timeout fired.
    Timeout,
    /// The call was canceled.
    Canceled,
    /// `only-if-cached` was requested but the cache cannot satisfy it.
    UnsatisfiableRequest,
    /// More than the permitted number of follow-ups.
    TooManyRedirects,
    /// The response violated HTTP semantics (bad status line, negative
    /// content length, body on a bodiless status, ...).
    BadResponse,
    /// An `io::Error` reading or writing a network stream.
    Io,
}

impl Error {
    pub(crate) fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl {
                kind,
                cause: None,
                suppressed: Vec::new(),
                request_sent: false,
            }),
        }
    }

    pub(crate) fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    pub(crate) fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    // constructors

    pub(crate) fn new_invalid_url<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::InvalidUrl).with(cause)
    }

    pub(crate) fn new_unknown_host<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::UnknownHost).with(cause)
    }

    pub(crate) fn new_connect(cause: io::Error) -> Error {
        if cause.kind() == io::ErrorKind::TimedOut || cause.kind() == io::ErrorKind::WouldBlock {
            return Error::new(Kind::Timeout).with(cause);
        }
        Error::new(Kind::ConnectFailed).with(cause)
    }

    pub(crate) fn new_protocol<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::Protocol).with(cause)
    }

    pub(crate) fn new_stream_reset(code: ErrorCode) -> Error {
        Error::new(Kind::StreamReset(code))
    }

    pub(crate) fn new_timeout() -> Error {
        Error::new(Kind::Timeout)
    }

    pub(crate) fn new_canceled() -> Error {
        Error::new(Kind::Canceled)
    }

    pub(crate) fn new_unsatisfiable_request() -> Error {
        Error::new(Kind::UnsatisfiableRequest)
    }

    pub(crate) fn new_too_many_redirects(count: u32) -> Error {
        Error::new(Kind::TooManyRedirects).with(format!("{} follow-ups", count))
    }

    pub(crate) fn new_bad_response<C: Into<Cause>>(cause: C) -> Error {
        Error::new(Kind::BadResponse).with(cause)
    }

    /// Converts an `io::Error` raised on a live exchange, recovering the
    /// typed failures the codecs smuggle through the `io` layer.
    pub(crate) fn new_io(cause: io::Error) -> Error {
        match cause.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                return Error::new(Kind::Timeout).with(cause)
            }
            _ => {}
        }
        if let Some(inner) = cause.get_ref() {
            if let Some(reset) = inner.downcast_ref::<StreamResetCause>() {
                return Error::new(Kind::StreamReset(reset.code)).with(cause);
            }
            if inner.downcast_ref::<ConnectionShutdown>().is_some() {
                // GOAWAY raced our stream; always retriable on a new route.
                return Error::new(Kind::StreamReset(ErrorCode::RefusedStream)).with(cause);
            }
            if inner.downcast_ref::<CanceledCause>().is_some() {
                return Error::new(Kind::Canceled).with(cause);
            }
        }
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn with_request_sent(mut self) -> Error {
        self.inner.request_sent = true;
        self
    }

    pub(crate) fn request_sent(&self) -> bool {
        self.inner.request_sent
    }

    pub(crate) fn push_suppressed(&mut self, error: Error) {
        self.inner.suppressed.push(error);
    }

    // predicates

    /// Returns true if a URL failed to parse or build.
    pub fn is_invalid_url(&self) -> bool {
        matches!(self.inner.kind, Kind::InvalidUrl)
    }

    /// Returns true if DNS resolution yielded no addresses.
    pub fn is_unknown_host(&self) -> bool {
        matches!(self.inner.kind, Kind::UnknownHost)
    }

    /// Returns true if a socket dial or TLS handshake failed.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::ConnectFailed)
    }

    /// Returns true if the wire or an interceptor violated protocol rules.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if an HTTP/2 stream was reset.
    pub fn is_stream_reset(&self) -> bool {
        matches!(self.inner.kind, Kind::StreamReset(_))
    }

    pub(crate) fn stream_reset_code(&self) -> Option<ErrorCode> {
        match self.inner.kind {
            Kind::StreamReset(code) => Some(code),
            _ => None,
        }
    }

    /// Returns true if any timeout fired for this call.
    pub fn is_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout)
    }

    /// Returns true if the call was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if `only-if-cached` could not be satisfied.
    pub fn is_unsatisfiable_request(&self) -> bool {
        matches!(self.inner.kind, Kind::UnsatisfiableRequest)
    }

    /// Returns true if the follow-up limit was exceeded.
    pub fn is_too_many_redirects(&self) -> bool {
        matches!(self.inner.kind, Kind::TooManyRedirects)
    }

    /// Returns true if the response violated HTTP semantics.
    pub fn is_bad_response(&self) -> bool {
        matches!(self.inner.kind, Kind::BadResponse)
    }

    /// Returns true if an I/O error occurred on the network stream.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// The failures of earlier attempts, when several routes were tried.
    pub fn suppressed(&self) -> &[Error] {
        &self.inner.suppressed
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::InvalidUrl => "invalid URL",
            Kind::UnknownHost => "hostname did not resolve",
            Kind::ConnectFailed => "connect failed",
            Kind::Protocol => "protocol error",
            Kind::StreamReset(_) => "http2 stream reset",
            Kind::Timeout => "operation timed out",
            Kind::Canceled => "call canceled",
            Kind::UnsatisfiableRequest => "request cannot be satisfied by cache",
            Kind::TooManyRedirects => "too many follow-up requests",
            Kind::BadResponse => "bad response",
            Kind::Io => "io error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("courier::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Kind::StreamReset(code) = self.inner.kind {
            write!(f, "stream was reset: {:?}", code)?;
        } else {
            f.write_str(self.description())?;
        }
        if let Some(ref cause) = self.inner.cause {
            write!(f, ": {}", cause)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

/// Typed cause carried inside an `io::Error` when an HTTP/2 stream is reset,
/// so body readers can surface the reset through the `std::io` traits.
#[derive(Debug)]
pub(crate) struct StreamResetCause {
    pub(crate) code: ErrorCode,
}

impl fmt::Display for StreamResetCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream was reset: {:?}", self.code)
    }
}

impl StdError for StreamResetCause {}

/// Typed cause carried inside an `io::Error` when a blocked I/O operation
/// was woken by [`cancel`](crate::Call::cancel).
#[derive(Debug)]
pub(crate) struct CanceledCause;

impl fmt::Display for CanceledCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("canceled")
    }
}

impl StdError for CanceledCause {}

/// Typed cause for operations attempted on a connection after GOAWAY.
#[derive(Debug)]
pub(crate) struct ConnectionShutdown;

impl fmt::Display for ConnectionShutdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("connection is shut down")
    }
}

impl StdError for ConnectionShutdown {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_size_of() {
        assert_eq!(
            std::mem::size_of::<Error>(),
            std::mem::size_of::<usize>(),
        );
    }

    #[test]
    fn io_timeout_maps_to_timeout_kind() {
        let e = Error::new_io(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        assert!(e.is_timeout());
        assert!(!e.is_io());
    }

    #[test]
    fn stream_reset_recovered_from_io() {
        let cause = io::Error::new(
            io::ErrorKind::Other,
            StreamResetCause {
                code: ErrorCode::RefusedStream,
            },
        );
        let e = Error::new_io(cause);
        assert!(e.is_stream_reset());
    }

    #[test]
    fn suppressed_failures_are_carried() {
        let mut e = Error::new_connect(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        e.push_suppressed(Error::new_timeout());
        assert_eq!(e.suppressed().len(), 1);
        assert!(e.suppressed()[0].is_timeout());
    }
}
