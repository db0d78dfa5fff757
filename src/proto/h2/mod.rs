//! The HTTP/2 protocol: frames, HPACK, streams, and the multiplexed
//! session.

pub(crate) mod conn;
pub(crate) mod frame;
pub(crate) mod hpack;
pub(crate) mod huffman;
pub(crate) mod stream;

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::exchange::{ExchangeCodec, RequestSink, ResponseSource};
use crate::headers::{self, Headers};
use crate::protocol::Protocol;
use crate::request::Request;
use crate::response::{Response, ResponseBuilder};

use self::conn::Http2Connection;
use self::stream::Http2Stream;

/// Request headers that do not cross into HTTP/2: connection management
/// belongs to the framing layer there.
const DROPPED_REQUEST_HEADERS: [&str; 7] = [
    "connection",
    "host",
    "keep-alive",
    "proxy-connection",
    "te",
    "transfer-encoding",
    "upgrade",
];

/// The per-exchange view of an [`Http2Connection`]: one stream.
pub(crate) struct Http2ExchangeCodec {
    connection: Arc<Http2Connection>,
    stream: Mutex<Option<Arc<Http2Stream>>>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    canceled: AtomicBool,
}

impl Http2ExchangeCodec {
    pub(crate) fn new(
        connection: Arc<Http2Connection>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Http2ExchangeCodec {
        Http2ExchangeCodec {
            connection,
            stream: Mutex::new(None),
            read_timeout,
            write_timeout,
            canceled: AtomicBool::new(false),
        }
    }

    fn stream(&self) -> io::Result<Arc<Http2Stream>> {
        self.stream
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "no stream"))
    }

    /// Translates a request into its HTTP/2 header list: pseudo-headers
    /// first, then the lower-cased ordinary headers.
    fn headers_list(request: &Request) -> Vec<(String, String)> {
        let url = request.url();
        let mut list = Vec::with_capacity(request.headers().len() + 4);
        list.push((":method".to_owned(), request.method().as_str().to_owned()));
        list.push((":path".to_owned(), url.request_target()));
        list.push((":authority".to_owned(), url.host_header()));
        list.push((":scheme".to_owned(), url.scheme().to_owned()));
        for (name, value) in request.headers().iter() {
            let lower = name.to_ascii_lowercase();
            if DROPPED_REQUEST_HEADERS.contains(&lower.as_str())
                && !(lower == "te" && value.eq_ignore_ascii_case("trailers"))
            {
                continue;
            }
            list.push((lower, value.to_owned()));
        }
        list
    }

    /// Translates a decoded header list into a response builder.
    fn read_http2_headers(header_list: Vec<(String, String)>) -> Result<ResponseBuilder> {
        let mut code: Option<u16> = None;
        let mut builder = Headers::builder();
        for (name, value) in header_list {
            if name == ":status" {
                code = value.parse::<u16>().ok();
            } else if name.starts_with(':') {
                // Other response pseudo-headers are not ours to expose.
                continue;
            } else {
                builder
                    .try_add_lenient(&name, &value)
                    .map_err(|e| Error::new_bad_response(e.to_string()))?;
            }
        }
        let code = code.ok_or_else(|| Error::new_bad_response("Expected ':status' header"))?;
        Ok(Response::builder()
            .protocol(Protocol::H2)
            .code(code)
            .message("")
            .headers(builder.build()))
    }
}

impl ExchangeCodec for Http2ExchangeCodec {
    fn write_request_headers(&self, request: &Request) -> io::Result<()> {
        if self.stream.lock().unwrap().is_some() {
            return Err(io::Error::new(io::ErrorKind::Other, "stream already created"));
        }
        let has_body = request.body().is_some();
        self.connection.set_write_timeout(self.write_timeout);
        let stream = self
            .connection
            .new_stream(&Self::headers_list(request), !has_body)?;
        *self.stream.lock().unwrap() = Some(stream);
        Ok(())
    }

    fn create_request_body(&self, _request: &Request) -> io::Result<Box<dyn RequestSink>> {
        Ok(Box::new(Http2Sink {
            stream: self.stream()?,
            write_timeout: self.write_timeout,
        }))
    }

    fn flush_request(&self) -> io::Result<()> {
        // Frames are flushed as they are written.
        Ok(())
    }

    fn finish_request(&self) -> io::Result<()> {
        self.stream()?.finish_out()
    }

    fn read_response_headers(&self, expect_continue: bool) -> Result<Option<ResponseBuilder>> {
        let stream = self.stream().map_err(Error::new_io)?;
        let header_list = stream
            .take_headers(self.read_timeout)
            .map_err(Error::new_io)?;
        let builder = Self::read_http2_headers(header_list)?;
        if expect_continue && builder.peek_code() == Some(100) {
            return Ok(None);
        }
        Ok(Some(builder))
    }

    fn open_response_body(&self, response: &Response) -> Result<(i64, Box<dyn ResponseSource>)> {
        let stream = self.stream().map_err(Error::new_io)?;
        let length = headers::content_length(response.headers())
            .map(|n| n as i64)
            .unwrap_or(-1);
        Ok((
            length,
            Box::new(Http2Source {
                stream,
                read_timeout: self.read_timeout,
            }),
        ))
    }

    fn trailers(&self) -> Result<Headers> {
        let stream = self.stream().map_err(Error::new_io)?;
        let mut builder = Headers::builder();
        for (name, value) in stream.trailers() {
            builder
                .try_add_lenient(&name, &value)
                .map_err(|e| Error::new_bad_response(e.to_string()))?;
        }
        Ok(builder.build())
    }

    fn cancel(&self) {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stream) = self.stream.lock().unwrap().clone() {
            stream.cancel();
        }
    }

    fn can_reuse_connection(&self) -> bool {
        // Streams are independent; the session-level GOAWAY state is
        // tracked on the connection itself.
        !self.connection.is_shutdown()
    }
}

struct Http2Sink {
    stream: Arc<Http2Stream>,
    write_timeout: Option<Duration>,
}

impl Write for Http2Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf, self.write_timeout)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl RequestSink for Http2Sink {
    fn close_sink(&mut self) -> io::Result<()> {
        self.stream.finish_out()
    }
}

struct Http2Source {
    stream: Arc<Http2Stream>,
    read_timeout: Option<Duration>,
}

impl Read for Http2Source {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf, self.read_timeout)
    }
}

impl ResponseSource for Http2Source {
    fn close_source(&mut self) {
        self.stream.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_headers_lead_and_hop_headers_drop() {
        let request = Request::builder()
            .url("https://example.com/a?b=c")
            .unwrap()
            .header("Connection", "keep-alive")
            .header("TE", "trailers")
            .header("X-Custom", "v")
            .build()
            .unwrap();
        let list = Http2ExchangeCodec::headers_list(&request);
        assert_eq!(
            &list[..4],
            &[
                (":method".to_owned(), "GET".to_owned()),
                (":path".to_owned(), "/a?b=c".to_owned()),
                (":authority".to_owned(), "example.com".to_owned()),
                (":scheme".to_owned(), "https".to_owned()),
            ]
        );
        assert!(list.iter().any(|(n, _)| n == "te"));
        assert!(!list.iter().any(|(n, _)| n == "connection"));
        assert!(list.iter().any(|(n, v)| n == "x-custom" && v == "v"));
    }

    #[test]
    fn status_pseudo_header_becomes_code() {
        let builder = Http2ExchangeCodec::read_http2_headers(vec![
            (":status".to_owned(), "200".to_owned()),
            ("content-type".to_owned(), "text/plain".to_owned()),
        ])
        .unwrap();
        let response = builder
            .request(Request::builder().url("https://h/").unwrap().build().unwrap())
            .build();
        assert_eq!(response.code(), 200);
        assert_eq!(response.message(), "");
        assert_eq!(response.protocol(), Protocol::H2);
        assert_eq!(response.header("content-type"), Some("text/plain"));
    }

    #[test]
    fn missing_status_is_malformed() {
        let result = Http2ExchangeCodec::read_http2_headers(vec![(
            "content-type".to_owned(),
            "text/plain".to_owned(),
        )]);
        assert!(result.unwrap_err().is_bad_response());
    }
}
