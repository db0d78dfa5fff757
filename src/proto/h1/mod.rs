//! A blocking HTTP/1.1 codec: one exchange at a time per connection.
//!
//! The codec is a strict state machine:
//! `IDLE → OPEN_REQUEST_BODY → READ_RESPONSE_HEADERS → OPEN_RESPONSE_BODY`
//! and back to `IDLE` when the connection can be reused, or `CLOSED` when
//! it cannot.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::exchange::{ExchangeCodec, RequestSink, ResponseSource};
use crate::headers::{self, Headers};
use crate::method::Method;
use crate::protocol::Protocol;
use crate::request::Request;
use crate::response::{Response, ResponseBuilder};
use crate::tls::{Transport, TransportReader, TransportWriter};

mod decode;
mod encode;

use self::decode::Decoder;
use self::encode::Encoder;

/// An HTTP/1.1 response head may not exceed this many bytes.
const MAX_HEAD_SIZE: usize = 256 * 1024;
const MAX_HEADERS: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq)]
enum State {
    Idle,
    OpenRequestBody,
    ReadResponseHeaders,
    OpenResponseBody,
    Closed,
}

/// The codec state for one HTTP/1.1 connection. It outlives exchanges:
/// the read buffer and keep-alive verdict carry across them.
pub(crate) struct Http1Codec {
    transport: Arc<dyn Transport>,
    /// Emit absolute-form request targets, for plaintext through an HTTP
    /// proxy.
    absolute_targets: bool,
    inner: Mutex<Inner>,
}

struct Inner {
    reader: BufReader<TransportReader>,
    state: State,
    encoder: Option<Encoder>,
    decoder: Option<Decoder>,
    /// Set when either peer asked for the connection to close, or the
    /// response was delimited by connection close.
    close_connection: bool,
}

impl Http1Codec {
    pub(crate) fn new(transport: Arc<dyn Transport>, absolute_targets: bool) -> Http1Codec {
        let reader = BufReader::new(TransportReader::new(transport.clone()));
        Http1Codec {
            transport,
            absolute_targets,
            inner: Mutex::new(Inner {
                reader,
                state: State::Idle,
                encoder: None,
                decoder: None,
                close_connection: false,
            }),
        }
    }

    fn request_target(&self, request: &Request) -> String {
        if *request.method() == Method::Connect {
            // Tunnel requests name the authority alone, port included.
            return request.url().authority();
        }
        if self.absolute_targets {
            // Through a plaintext HTTP proxy the target is the full URL,
            // minus any fragment.
            let url = request.url();
            let mut target = String::new();
            target.push_str(url.scheme());
            target.push_str("://");
            target.push_str(&url.host_header());
            target.push_str(&url.request_target());
            target
        } else {
            request.url().request_target()
        }
    }

    pub(crate) fn write_request(&self, request: &Request) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Idle {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("state: {:?}", inner.state),
            ));
        }

        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(request.method().as_str().as_bytes());
        head.push(b' ');
        head.extend_from_slice(self.request_target(request).as_bytes());
        head.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in request.headers().iter() {
            head.extend_from_slice(name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");

        if headers::has_connection_token(request.headers(), "close") {
            inner.close_connection = true;
        }

        inner.encoder = if headers::is_chunked(request.headers()) {
            Some(Encoder::chunked())
        } else {
            headers::content_length(request.headers()).map(Encoder::length)
        };
        inner.state = State::OpenRequestBody;
        drop(inner);

        trace!("writing request head ({} bytes)", head.len());
        let mut writer = TransportWriter::new(self.transport.clone());
        writer.write_all(&head)
    }

    fn write_body(&self, buf: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::OpenRequestBody {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("state: {:?}", inner.state),
            ));
        }
        let mut encoder = inner.encoder.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "request has no body framing")
        })?;
        drop(inner);

        let mut writer = TransportWriter::new(self.transport.clone());
        let result = encoder.encode(&mut writer, buf);
        self.inner.lock().unwrap().encoder = Some(encoder);
        result.map(|()| buf.len())
    }

    fn finish_body(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::OpenRequestBody {
            return Ok(());
        }
        let encoder = inner.encoder.take();
        inner.state = State::ReadResponseHeaders;
        drop(inner);

        if let Some(mut encoder) = encoder {
            let mut writer = TransportWriter::new(self.transport.clone());
            encoder.finish(&mut writer)?;
        }
        self.transport.flush()
    }

    pub(crate) fn flush(&self) -> io::Result<()> {
        self.transport.flush()
    }

    pub(crate) fn read_response_head(
        &self,
        expect_continue: bool,
    ) -> Result<Option<ResponseBuilder>> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::OpenRequestBody && inner.state != State::ReadResponseHeaders {
            return Err(Error::new_protocol(format!("state: {:?}", inner.state)));
        }

        let head = read_head(&mut inner.reader).map_err(Error::new_io)?;
        let mut parsed_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut parsed_headers);
        match parsed.parse(&head) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(Error::new_bad_response("truncated response headers"))
            }
            Err(e) => {
                return Err(Error::new_bad_response(format!(
                    "unexpected status line: {}",
                    e
                )))
            }
        }

        let code = parsed.code.ok_or_else(|| Error::new_bad_response("no status code"))?;
        let message = parsed.reason.unwrap_or("").to_owned();
        let protocol = match parsed.version {
            Some(0) => Protocol::Http10,
            _ => Protocol::Http11,
        };

        let mut header_builder = Headers::builder();
        for header in parsed.headers.iter() {
            let value = String::from_utf8_lossy(header.value);
            header_builder
                .try_add_lenient(header.name, value.trim())
                .map_err(|e| Error::new_bad_response(e.to_string()))?;
        }
        let response_headers = header_builder.build();

        if headers::has_connection_token(&response_headers, "close") {
            inner.close_connection = true;
        }

        debug!("received response head: {} {}", code, message);

        if code == 100 && expect_continue {
            // The server will accept the body; stay in the request phase.
            return Ok(None);
        }
        if code >= 200 {
            inner.state = State::OpenResponseBody;
        }

        Ok(Some(Response::builder()
            .protocol(protocol)
            .code(code)
            .message(&message)
            .headers(response_headers)))
    }

    pub(crate) fn open_response_body(&self, response: &Response) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::OpenResponseBody {
            return Err(Error::new_protocol(format!("state: {:?}", inner.state)));
        }

        let (decoder, length) = if !response.promises_body() {
            (Decoder::length(0), 0)
        } else if headers::is_chunked(response.headers()) {
            (Decoder::chunked(), -1)
        } else if let Some(n) = headers::content_length(response.headers()) {
            (Decoder::length(n), n as i64)
        } else {
            // Delimited by connection close; the connection dies with the
            // body.
            inner.close_connection = true;
            (Decoder::eof(), -1)
        };
        inner.decoder = Some(decoder);
        Ok(length)
    }

    fn read_body(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap();
        let mut decoder = match inner.decoder.take() {
            Some(decoder) => decoder,
            None => return Ok(0),
        };
        let result = decoder.decode(&mut inner.reader, buf);
        let at_eof = decoder.is_eof();
        inner.decoder = Some(decoder);

        match result {
            Ok(0) if at_eof => {
                self.body_complete(&mut inner);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                inner.state = State::Closed;
                inner.close_connection = true;
                Err(e)
            }
        }
    }

    fn body_complete(&self, inner: &mut Inner) {
        let definite = inner
            .decoder
            .as_ref()
            .map(|d| d.has_definite_length())
            .unwrap_or(false);
        if inner.close_connection || !definite {
            inner.state = State::Closed;
        } else {
            inner.state = State::Idle;
        }
    }

    /// Body reads for the proxy tunnel handshake, which runs before any
    /// exchange exists.
    pub(crate) fn read_tunnel_body(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_body(buf)
    }

    pub(crate) fn trailers(&self) -> Headers {
        let inner = self.inner.lock().unwrap();
        inner
            .decoder
            .as_ref()
            .map(|d| d.trailers())
            .unwrap_or_default()
    }

    pub(crate) fn can_reuse(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        !inner.close_connection && inner.state == State::Idle
    }

    pub(crate) fn cancel(&self) {
        self.transport.shutdown();
    }

    /// Checks for an unexpected EOF on an idle connection without
    /// consuming data: buffered bytes stay buffered.
    pub(crate) fn is_healthy(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != State::Idle {
            return true;
        }
        if self
            .transport
            .set_read_timeout(Some(Duration::from_millis(1)))
            .is_err()
        {
            return false;
        }
        let healthy = match inner.reader.fill_buf() {
            Ok(buf) => !buf.is_empty(),
            Err(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
        };
        let _ = self.transport.set_read_timeout(None);
        healthy
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) {
        let _ = self.transport.set_read_timeout(timeout);
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) {
        let _ = self.transport.set_write_timeout(timeout);
    }
}

impl std::fmt::Debug for Http1Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad("Http1Codec")
    }
}

/// Accumulates bytes until the blank line ending the head, leaving
/// everything after it in the buffer.
fn read_head(reader: &mut BufReader<TransportReader>) -> io::Result<Vec<u8>> {
    const TERMINATOR: [u8; 4] = *b"\r\n\r\n";
    let mut head = Vec::with_capacity(256);
    let mut matched = 0usize;
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of stream before response headers",
            ));
        }
        let mut end = None;
        for (i, &b) in available.iter().enumerate() {
            matched = if b == TERMINATOR[matched] {
                matched + 1
            } else if b == b'\r' {
                1
            } else {
                0
            };
            if matched == TERMINATOR.len() {
                end = Some(i + 1);
                break;
            }
        }
        match end {
            Some(end) => {
                head.extend_from_slice(&available[..end]);
                reader.consume(end);
                return Ok(head);
            }
            None => {
                let n = available.len();
                head.extend_from_slice(available);
                reader.consume(n);
                if head.len() > MAX_HEAD_SIZE {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "response headers too large",
                    ));
                }
            }
        }
    }
}

/// The per-exchange view of an [`Http1Codec`].
pub(crate) struct Http1ExchangeCodec {
    codec: Arc<Http1Codec>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl Http1ExchangeCodec {
    pub(crate) fn new(
        codec: Arc<Http1Codec>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Http1ExchangeCodec {
        Http1ExchangeCodec {
            codec,
            read_timeout,
            write_timeout,
        }
    }
}

impl ExchangeCodec for Http1ExchangeCodec {
    fn write_request_headers(&self, request: &Request) -> io::Result<()> {
        self.codec.set_write_timeout(self.write_timeout);
        self.codec.write_request(request)
    }

    fn create_request_body(&self, request: &Request) -> io::Result<Box<dyn RequestSink>> {
        if request.body().map(|b| b.is_duplex()).unwrap_or(false) {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "Duplex connections are not supported for HTTP/1",
            ));
        }
        Ok(Box::new(Http1Sink {
            codec: self.codec.clone(),
        }))
    }

    fn flush_request(&self) -> io::Result<()> {
        self.codec.flush()
    }

    fn finish_request(&self) -> io::Result<()> {
        self.codec.finish_body()
    }

    fn read_response_headers(&self, expect_continue: bool) -> Result<Option<ResponseBuilder>> {
        self.codec.set_read_timeout(self.read_timeout);
        self.codec.read_response_head(expect_continue)
    }

    fn open_response_body(
        &self,
        response: &Response,
    ) -> Result<(i64, Box<dyn ResponseSource>)> {
        self.codec.set_read_timeout(self.read_timeout);
        let length = self.codec.open_response_body(response)?;
        Ok((
            length,
            Box::new(Http1Source {
                codec: self.codec.clone(),
            }),
        ))
    }

    fn trailers(&self) -> Result<Headers> {
        Ok(self.codec.trailers())
    }

    fn cancel(&self) {
        self.codec.cancel();
    }

    fn can_reuse_connection(&self) -> bool {
        self.codec.can_reuse()
    }
}

struct Http1Sink {
    codec: Arc<Http1Codec>,
}

impl Write for Http1Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.codec.write_body(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.codec.flush()
    }
}

impl RequestSink for Http1Sink {
    fn close_sink(&mut self) -> io::Result<()> {
        self.codec.finish_body()
    }
}

struct Http1Source {
    codec: Arc<Http1Codec>,
}

impl Read for Http1Source {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.codec.read_body(buf)
    }
}

impl ResponseSource for Http1Source {
    fn close_source(&mut self) {
        // The framing state is unknown; the connection owner decides
        // whether to close the socket.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct ScriptedTransport {
        input: Mutex<std::io::Cursor<Vec<u8>>>,
        output: Mutex<Vec<u8>>,
    }

    impl ScriptedTransport {
        fn new(input: &[u8]) -> Arc<ScriptedTransport> {
            Arc::new(ScriptedTransport {
                input: Mutex::new(std::io::Cursor::new(input.to_vec())),
                output: Mutex::new(Vec::new()),
            })
        }

        fn written(&self) -> Vec<u8> {
            self.output.lock().unwrap().clone()
        }
    }

    impl Transport for ScriptedTransport {
        fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.lock().unwrap().read(buf)
        }

        fn write(&self, buf: &[u8]) -> io::Result<usize> {
            self.output.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&self) -> io::Result<()> {
            Ok(())
        }

        fn set_read_timeout(&self, _t: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn set_write_timeout(&self, _t: Option<Duration>) -> io::Result<()> {
            Ok(())
        }

        fn shutdown(&self) {}
    }

    fn get_request(url: &str) -> Request {
        Request::builder().url(url).unwrap().build().unwrap()
    }

    #[test]
    fn writes_origin_form_request_line() {
        let transport = ScriptedTransport::new(b"");
        let codec = Http1Codec::new(transport.clone(), false);
        let request = get_request("http://example.com/a/b?q=1");
        codec.write_request(&request).unwrap();
        let written = transport.written();
        assert!(written.starts_with(b"GET /a/b?q=1 HTTP/1.1\r\n"), "{:?}", written);
        assert!(written.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn writes_absolute_form_through_proxy() {
        let transport = ScriptedTransport::new(b"");
        let codec = Http1Codec::new(transport.clone(), true);
        codec.write_request(&get_request("http://example.com/a")).unwrap();
        assert!(transport
            .written()
            .starts_with(b"GET http://example.com/a HTTP/1.1\r\n"));
    }

    #[test]
    fn reads_response_head_and_fixed_body() {
        let transport =
            ScriptedTransport::new(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        let codec = Arc::new(Http1Codec::new(transport, false));
        codec.write_request(&get_request("http://example.com/")).unwrap();
        codec.finish_body().unwrap();

        let builder = codec.read_response_head(false).unwrap().unwrap();
        let response = builder
            .request(get_request("http://example.com/"))
            .build();
        assert_eq!(response.code(), 200);
        assert_eq!(response.message(), "OK");
        assert_eq!(response.header("content-length"), Some("5"));

        let length = codec.open_response_body(&response).unwrap();
        assert_eq!(length, 5);
        let mut body = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = codec.read_body(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buf[..n]);
        }
        assert_eq!(body, b"hello");
        assert!(codec.can_reuse());
    }

    #[test]
    fn connection_close_prevents_reuse() {
        let transport = ScriptedTransport::new(
            b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        );
        let codec = Arc::new(Http1Codec::new(transport, false));
        codec.write_request(&get_request("http://example.com/")).unwrap();
        codec.finish_body().unwrap();
        let response = codec
            .read_response_head(false)
            .unwrap()
            .unwrap()
            .request(get_request("http://example.com/"))
            .build();
        codec.open_response_body(&response).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(codec.read_body(&mut buf).unwrap(), 0);
        assert!(!codec.can_reuse());
    }

    #[test]
    fn unframed_response_is_close_delimited() {
        let transport = ScriptedTransport::new(b"HTTP/1.1 200 OK\r\n\r\nrest of stream");
        let codec = Arc::new(Http1Codec::new(transport, false));
        codec.write_request(&get_request("http://example.com/")).unwrap();
        codec.finish_body().unwrap();
        let response = codec
            .read_response_head(false)
            .unwrap()
            .unwrap()
            .request(get_request("http://example.com/"))
            .build();
        let length = codec.open_response_body(&response).unwrap();
        assert_eq!(length, -1);
        let mut body = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = codec.read_body(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            body.extend_from_slice(&buf[..n]);
        }
        assert_eq!(body, b"rest of stream");
        assert!(!codec.can_reuse());
    }

    #[test]
    fn expect_continue_returns_none_on_100() {
        let transport = ScriptedTransport::new(b"HTTP/1.1 100 Continue\r\n\r\n");
        let codec = Arc::new(Http1Codec::new(transport, false));
        let request = Request::builder()
            .url("http://example.com/")
            .unwrap()
            .post(crate::body::ByteBody::new(&b"hi"[..], None))
            .header("Content-Length", "2")
            .build()
            .unwrap();
        codec.write_request(&request).unwrap();
        assert!(codec.read_response_head(true).unwrap().is_none());
    }
}
