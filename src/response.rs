//! An HTTP response.

use std::fmt;

use crate::body::ResponseBody;
use crate::cache_control::CacheControl;
use crate::headers::{self, Headers, HeadersBuilder};
use crate::method::Method;
use crate::protocol::Protocol;
use crate::request::Request;
use crate::tls::Handshake;

/// An HTTP response.
///
/// The status line and headers are immutable values; the body is a lazy
/// one-shot stream from the network. Responses produced by redirects carry
/// the earlier responses in [`prior_response`](Response::prior_response),
/// a bounded owned chain.
pub struct Response {
    request: Request,
    protocol: Protocol,
    code: u16,
    message: String,
    handshake: Option<Handshake>,
    headers: Headers,
    body: ResponseBody,
    network_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
    sent_request_at_millis: i64,
    received_response_at_millis: i64,
}

impl Response {
    /// Returns a new builder.
    pub fn builder() -> ResponseBuilder {
        ResponseBuilder {
            request: None,
            protocol: None,
            code: -1,
            message: String::new(),
            handshake: None,
            headers: Headers::builder(),
            body: None,
            network_response: None,
            cache_response: None,
            prior_response: None,
            sent_request_at_millis: 0,
            received_response_at_millis: 0,
        }
    }

    /// The request that initiated this response. This may differ from the
    /// application's original request when redirects or rewrites applied.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The protocol the response arrived over.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The HTTP status code.
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Whether the code is in 200..=299.
    pub fn is_successful(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// The HTTP reason phrase. Empty on HTTP/2, which has none.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The TLS handshake, or `None` for plaintext connections.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// The response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The last header value for `name`, or `None`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The response body.
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    /// The cache directives of this response.
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers)
    }

    /// Whether this is a redirect the client could follow.
    pub fn is_redirect(&self) -> bool {
        matches!(self.code, 300 | 301 | 302 | 303 | 307 | 308)
    }

    /// The raw response from the network, when one was consulted.
    pub fn network_response(&self) -> Option<&Response> {
        self.network_response.as_deref()
    }

    /// The response from the cache, when one was consulted.
    pub fn cache_response(&self) -> Option<&Response> {
        self.cache_response.as_deref()
    }

    /// The response that caused this one to be re-requested, if any.
    pub fn prior_response(&self) -> Option<&Response> {
        self.prior_response.as_deref()
    }

    /// When the initiating request's headers were sent, in epoch millis.
    pub fn sent_request_at_millis(&self) -> i64 {
        self.sent_request_at_millis
    }

    /// When this response's headers were received, in epoch millis.
    pub fn received_response_at_millis(&self) -> i64 {
        self.received_response_at_millis
    }

    /// Returns a builder carrying this response's data, consuming it.
    pub fn new_builder(self) -> ResponseBuilder {
        ResponseBuilder {
            request: Some(self.request),
            protocol: Some(self.protocol),
            code: self.code as i32,
            message: self.message,
            handshake: self.handshake,
            headers: self.headers.new_builder(),
            body: Some(self.body),
            network_response: self.network_response,
            cache_response: self.cache_response,
            prior_response: self.prior_response,
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
        }
    }

    /// Replaces the body with an empty one, for responses that are kept as
    /// references (network, cache, prior) rather than read.
    pub(crate) fn strip_body(self) -> Response {
        let mut response = self;
        response.body = ResponseBody::empty();
        response
    }

    /// A copy of everything but the single-use body, for the network,
    /// cache, and prior reference slots.
    pub(crate) fn copy_without_body(&self) -> Response {
        Response {
            request: self.request.clone(),
            protocol: self.protocol,
            code: self.code,
            message: self.message.clone(),
            handshake: self.handshake.clone(),
            headers: self.headers.clone(),
            body: ResponseBody::empty(),
            network_response: self
                .network_response
                .as_ref()
                .map(|r| Box::new(r.copy_without_body())),
            cache_response: self
                .cache_response
                .as_ref()
                .map(|r| Box::new(r.copy_without_body())),
            prior_response: self
                .prior_response
                .as_ref()
                .map(|r| Box::new(r.copy_without_body())),
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
        }
    }

    /// Whether, per RFC 7230 §3.3, this response may carry a body.
    pub(crate) fn promises_body(&self) -> bool {
        if self.request.method() == &Method::Head {
            return false;
        }
        let informational = (100..200).contains(&self.code);
        if !informational && self.code != 204 && self.code != 304 {
            return true;
        }
        headers::content_length(&self.headers).is_some() || headers::is_chunked(&self.headers)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("protocol", &self.protocol)
            .field("code", &self.code)
            .field("message", &self.message)
            .field("url", self.request.url())
            .finish()
    }
}

/// Builds a [`Response`].
#[derive(Debug)]
pub struct ResponseBuilder {
    request: Option<Request>,
    protocol: Option<Protocol>,
    code: i32,
    message: String,
    handshake: Option<Handshake>,
    headers: HeadersBuilder,
    body: Option<ResponseBody>,
    network_response: Option<Box<Response>>,
    cache_response: Option<Box<Response>>,
    prior_response: Option<Box<Response>>,
    sent_request_at_millis: i64,
    received_response_at_millis: i64,
}

impl ResponseBuilder {
    /// Sets the initiating request.
    pub fn request(mut self, request: Request) -> ResponseBuilder {
        self.request = Some(request);
        self
    }

    /// Sets the protocol.
    pub fn protocol(mut self, protocol: Protocol) -> ResponseBuilder {
        self.protocol = Some(protocol);
        self
    }

    /// Sets the status code.
    pub fn code(mut self, code: u16) -> ResponseBuilder {
        self.code = code as i32;
        self
    }

    /// Sets the reason phrase.
    pub fn message(mut self, message: &str) -> ResponseBuilder {
        self.message = message.to_owned();
        self
    }

    /// Sets the TLS handshake.
    pub fn handshake(mut self, handshake: Option<Handshake>) -> ResponseBuilder {
        self.handshake = handshake;
        self
    }

    /// Sets a header, replacing any prior values for its name.
    pub fn header(mut self, name: &str, value: &str) -> ResponseBuilder {
        self.headers = self.headers.set(name, value);
        self
    }

    /// Adds a header without removing prior values for its name.
    pub fn add_header(mut self, name: &str, value: &str) -> ResponseBuilder {
        self.headers = self.headers.add(name, value);
        self
    }

    /// Removes every header named `name`.
    pub fn remove_header(mut self, name: &str) -> ResponseBuilder {
        self.headers = self.headers.remove_all(name);
        self
    }

    /// Replaces all headers.
    pub fn headers(mut self, headers: Headers) -> ResponseBuilder {
        self.headers = headers.new_builder();
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: ResponseBody) -> ResponseBuilder {
        self.body = Some(body);
        self
    }

    /// Sets the raw network response this response was derived from.
    pub fn network_response(mut self, response: Option<Response>) -> ResponseBuilder {
        self.network_response = response.map(Box::new);
        self
    }

    /// Sets the cache response this response was derived from.
    pub fn cache_response(mut self, response: Option<Response>) -> ResponseBuilder {
        self.cache_response = response.map(Box::new);
        self
    }

    /// Sets the response that preceded this one in a redirect or retry
    /// chain.
    pub fn prior_response(mut self, response: Option<Response>) -> ResponseBuilder {
        self.prior_response = response.map(Box::new);
        self
    }

    /// Sets when the request's headers were sent, in epoch millis.
    pub fn sent_request_at_millis(mut self, millis: i64) -> ResponseBuilder {
        self.sent_request_at_millis = millis;
        self
    }

    /// Sets when the response's headers were received, in epoch millis.
    pub fn received_response_at_millis(mut self, millis: i64) -> ResponseBuilder {
        self.received_response_at_millis = millis;
        self
    }

    /// Removes and returns the body set so far, for wrapping.
    pub(crate) fn take_body(&mut self) -> Option<ResponseBody> {
        self.body.take()
    }

    /// The last header value for `name` set so far.
    pub(crate) fn peek_header(&self, name: &str) -> Option<String> {
        self.headers.get(name).map(str::to_owned)
    }

    /// The status code set so far, used when deciding whether an interim
    /// response needs another read.
    pub(crate) fn peek_code(&self) -> Option<u16> {
        if self.code >= 0 {
            Some(self.code as u16)
        } else {
            None
        }
    }

    /// Builds the response.
    ///
    /// # Panics
    ///
    /// Panics when the request, protocol, or code are missing.
    pub fn build(self) -> Response {
        assert!(self.code >= 0, "code < 0: {}", self.code);
        Response {
            request: self.request.expect("request == null"),
            protocol: self.protocol.expect("protocol == null"),
            code: self.code as u16,
            message: self.message,
            handshake: self.handshake,
            headers: self.headers.build(),
            body: self.body.unwrap_or_else(ResponseBody::empty),
            network_response: self.network_response,
            cache_response: self.cache_response,
            prior_response: self.prior_response,
            sent_request_at_millis: self.sent_request_at_millis,
            received_response_at_millis: self.received_response_at_millis,
        }
    }
}
