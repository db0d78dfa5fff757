//! Request and response bodies.

use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::mem;
use std::sync::Mutex;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::media_type::MediaType;

/// Produces the content of one outbound request.
///
/// Implementations stream their content to the codec's sink in
/// [`write_to`](RequestBody::write_to). A body that cannot be replayed
/// reports [`is_one_shot`](RequestBody::is_one_shot), which disqualifies
/// its request from retries and redirects that would resend it.
pub trait RequestBody: Send + Sync {
    /// The media type advertised in `Content-Type`, if any.
    fn content_type(&self) -> Option<MediaType>;

    /// The byte count, or `-1` when unknown. Unknown lengths are sent
    /// chunked on HTTP/1.1.
    fn content_length(&self) -> i64 {
        -1
    }

    /// Writes the content to `sink`.
    fn write_to(&self, sink: &mut dyn Write) -> io::Result<()>;

    /// Whether this body may be transmitted at most once.
    fn is_one_shot(&self) -> bool {
        false
    }

    /// Whether the response may begin before this body ends. Requires
    /// HTTP/2.
    fn is_duplex(&self) -> bool {
        false
    }
}

impl fmt::Debug for dyn RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBody")
            .field("content_length", &self.content_length())
            .finish()
    }
}

/// A request body backed by a byte buffer.
#[derive(Clone, Debug)]
pub struct ByteBody {
    content: Bytes,
    media_type: Option<MediaType>,
}

impl ByteBody {
    /// A body transmitting `content`.
    pub fn new(content: impl Into<Bytes>, media_type: Option<MediaType>) -> ByteBody {
        ByteBody {
            content: content.into(),
            media_type,
        }
    }

    /// A UTF-8 text body. When `media_type` carries no charset the bytes
    /// are encoded as UTF-8; the media type itself is left untouched.
    pub fn from_string(content: &str, media_type: Option<MediaType>) -> ByteBody {
        ByteBody {
            content: Bytes::copy_from_slice(content.as_bytes()),
            media_type,
        }
    }
}

impl RequestBody for ByteBody {
    fn content_type(&self) -> Option<MediaType> {
        self.media_type.clone()
    }

    fn content_length(&self) -> i64 {
        self.content.len() as i64
    }

    fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(&self.content)
    }
}

/// The lazy byte stream of one response.
///
/// The content arrives from the network as it is read; reading to the end
/// releases the underlying exchange. Bodies are single-use: after
/// [`bytes`](ResponseBody::bytes) or [`string`](ResponseBody::string) the
/// stream is exhausted.
pub struct ResponseBody {
    media_type: Option<MediaType>,
    content_length: i64,
    source: Mutex<Box<dyn Read + Send>>,
    trailers: Option<Box<dyn TrailerSource>>,
}

/// Supplies the trailer fields of a framed body, valid once the body has
/// been read to the end.
pub(crate) trait TrailerSource: Send + Sync {
    fn trailers(&self) -> Result<Headers>;
}

impl ResponseBody {
    pub(crate) fn new(
        media_type: Option<MediaType>,
        content_length: i64,
        source: Box<dyn Read + Send>,
    ) -> ResponseBody {
        ResponseBody {
            media_type,
            content_length,
            source: Mutex::new(source),
            trailers: None,
        }
    }

    pub(crate) fn with_trailers(
        media_type: Option<MediaType>,
        content_length: i64,
        source: Box<dyn Read + Send>,
        trailers: Box<dyn TrailerSource>,
    ) -> ResponseBody {
        ResponseBody {
            media_type,
            content_length,
            source: Mutex::new(source),
            trailers: Some(trailers),
        }
    }

    /// An empty body.
    pub fn empty() -> ResponseBody {
        ResponseBody::from_bytes(None, Bytes::new())
    }

    /// A body over an in-memory buffer.
    pub fn from_bytes(media_type: Option<MediaType>, content: Bytes) -> ResponseBody {
        let content_length = content.len() as i64;
        ResponseBody {
            media_type,
            content_length,
            source: Mutex::new(Box::new(Cursor::new(content))),
            trailers: None,
        }
    }

    /// The media type from `Content-Type`, if any.
    pub fn content_type(&self) -> Option<&MediaType> {
        self.media_type.as_ref()
    }

    /// The byte count from `Content-Length`, or `-1` when unknown.
    pub fn content_length(&self) -> i64 {
        self.content_length
    }

    /// Reads the remaining content into memory.
    pub fn bytes(&self) -> Result<Bytes> {
        let mut source = self.source.lock().unwrap();
        let mut buf = Vec::new();
        source.read_to_end(&mut buf).map_err(Error::new_io)?;
        Ok(Bytes::from(buf))
    }

    /// Reads the remaining content as text. The charset defaults to UTF-8;
    /// undecodable bytes are replaced.
    pub fn string(&self) -> Result<String> {
        let bytes = self.bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Returns up to `byte_count` bytes from the front of the stream
    /// without consuming them.
    pub fn peek(&self, byte_count: u64) -> Result<Bytes> {
        let mut source = self.source.lock().unwrap();
        let mut buf = vec![0u8; byte_count as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = source.read(&mut buf[filled..]).map_err(Error::new_io)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        let peeked = Bytes::from(buf);

        // Push the bytes back in front of whatever remains.
        let rest = mem::replace(&mut *source, Box::new(io::empty()));
        *source = Box::new(Cursor::new(peeked.clone()).chain(rest));
        Ok(peeked)
    }

    /// The trailer fields that followed the body on the wire. Only
    /// meaningful once the body has been read to the end; bodies without
    /// framing-level trailers return an empty list.
    pub fn trailers(&self) -> Result<Headers> {
        match self.trailers {
            Some(ref trailers) => trailers.trailers(),
            None => Ok(Headers::new()),
        }
    }

    /// A `Read` over the remaining content.
    pub fn byte_stream(&self) -> BodyReader<'_> {
        BodyReader { body: self }
    }

    /// Takes the underlying stream, for transparent decompression.
    pub(crate) fn into_source(self) -> Box<dyn Read + Send> {
        self.source.into_inner().unwrap()
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody")
            .field("content_length", &self.content_length)
            .finish()
    }
}

/// Reads a [`ResponseBody`] incrementally.
#[derive(Debug)]
pub struct BodyReader<'a> {
    body: &'a ResponseBody,
}

impl<'a> Read for BodyReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.body.source.lock().unwrap().read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_body_reports_length() {
        let body = ByteBody::new(&b"hello"[..], None);
        assert_eq!(body.content_length(), 5);
        let mut out = Vec::new();
        body.write_to(&mut out).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn response_body_reads_once() {
        let body = ResponseBody::from_bytes(None, Bytes::from_static(b"abc"));
        assert_eq!(body.string().unwrap(), "abc");
        assert_eq!(body.string().unwrap(), "");
    }

    #[test]
    fn peek_does_not_consume() {
        let body = ResponseBody::from_bytes(None, Bytes::from_static(b"abcdef"));
        assert_eq!(&body.peek(3).unwrap()[..], b"abc");
        assert_eq!(body.string().unwrap(), "abcdef");
    }

    #[test]
    fn peek_past_end_is_short() {
        let body = ResponseBody::from_bytes(None, Bytes::from_static(b"ab"));
        assert_eq!(&body.peek(10).unwrap()[..], b"ab");
    }
}
