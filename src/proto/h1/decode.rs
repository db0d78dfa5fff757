//! Decoders to handle different Transfer-Encodings.
//!
//! If a message body does not include a Transfer-Encoding, it *should*
//! include a Content-Length header; a response with neither is delimited
//! by the end of the connection.

use std::io::{self, BufRead};

use log::trace;

use crate::headers::Headers;

/// Maximum bytes of trailer fields after a chunked body.
const TRAILER_LIMIT: usize = 16 * 1024;

/// Unframes one response body from the wire.
#[derive(Debug)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    /// A reader for a body of exactly the length in Content-Length.
    Length(u64),
    /// A reader for a `Transfer-Encoding: chunked` body.
    Chunked {
        /// Bytes left in the chunk being read; 0 means a size line is next.
        remaining: u64,
        /// Whether at least one chunk has been read, so a leading CRLF
        /// must be consumed before the next size line.
        read_any: bool,
        finished: bool,
        trailers: Option<Headers>,
    },
    /// A reader for a response without a length: everything until FIN.
    ///
    /// The bool records whether EOF has been seen.
    Eof(bool),
}

impl Decoder {
    pub(crate) fn length(len: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn chunked() -> Decoder {
        Decoder {
            kind: Kind::Chunked {
                remaining: 0,
                read_any: false,
                finished: false,
                trailers: None,
            },
        }
    }

    pub(crate) fn eof() -> Decoder {
        Decoder {
            kind: Kind::Eof(false),
        }
    }

    pub(crate) fn is_eof(&self) -> bool {
        match self.kind {
            Kind::Length(remaining) => remaining == 0,
            Kind::Chunked { finished, .. } => finished,
            Kind::Eof(seen) => seen,
        }
    }

    /// Whether reuse of the connection is possible once this body ends.
    pub(crate) fn has_definite_length(&self) -> bool {
        !matches!(self.kind, Kind::Eof(_))
    }

    pub(crate) fn trailers(&self) -> Headers {
        match self.kind {
            Kind::Chunked { ref trailers, .. } => {
                trailers.clone().unwrap_or_default()
            }
            _ => Headers::new(),
        }
    }

    pub(crate) fn decode(
        &mut self,
        source: &mut (dyn BufRead + Send),
        buf: &mut [u8],
    ) -> io::Result<usize> {
        match self.kind {
            Kind::Length(ref mut remaining) => {
                if *remaining == 0 || buf.is_empty() {
                    return Ok(0);
                }
                let limit = (*remaining).min(buf.len() as u64) as usize;
                let n = source.read(&mut buf[..limit])?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "unexpected end of stream reading fixed-length body",
                    ));
                }
                *remaining -= n as u64;
                Ok(n)
            }
            Kind::Chunked {
                ref mut remaining,
                ref mut read_any,
                ref mut finished,
                ref mut trailers,
            } => {
                if *finished || buf.is_empty() {
                    return Ok(0);
                }
                if *remaining == 0 {
                    if *read_any {
                        expect_crlf(source)?;
                    }
                    let size_line = read_line(source, 1024)?;
                    let size = parse_chunk_size(&size_line)?;
                    trace!("chunk size {}", size);
                    if size == 0 {
                        *trailers = Some(read_trailers(source)?);
                        *finished = true;
                        return Ok(0);
                    }
                    *remaining = size;
                    *read_any = true;
                }
                let limit = (*remaining).min(buf.len() as u64) as usize;
                let n = source.read(&mut buf[..limit])?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "unexpected end of stream reading chunk",
                    ));
                }
                *remaining -= n as u64;
                Ok(n)
            }
            Kind::Eof(ref mut seen) => {
                let n = source.read(buf)?;
                if n == 0 {
                    *seen = true;
                }
                Ok(n)
            }
        }
    }
}

fn expect_crlf(source: &mut (dyn BufRead + Send)) -> io::Result<()> {
    let mut crlf = [0u8; 2];
    read_full(source, &mut crlf)?;
    if &crlf != b"\r\n" {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "expected CRLF after chunk",
        ));
    }
    Ok(())
}

fn read_full(source: &mut (dyn BufRead + Send), buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of stream",
            ));
        }
        filled += n;
    }
    Ok(())
}

/// Reads one line, stripping the terminator. Lenient about a missing CR.
fn read_line(source: &mut (dyn BufRead + Send), limit: usize) -> io::Result<String> {
    let mut line = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        let n = source.read(&mut byte)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of stream reading line",
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > limit {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "line too long"));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "malformed line"))
}

fn parse_chunk_size(line: &str) -> io::Result<u64> {
    // Chunk extensions after ';' are tolerated and ignored.
    let size_part = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size_part, 16).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("expected chunk size but was {:?}", line),
        )
    })
}

fn read_trailers(source: &mut (dyn BufRead + Send)) -> io::Result<Headers> {
    let mut builder = Headers::builder();
    let mut total = 0;
    loop {
        let line = read_line(source, TRAILER_LIMIT)?;
        if line.is_empty() {
            break;
        }
        total += line.len();
        if total > TRAILER_LIMIT {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "trailers too large",
            ));
        }
        let colon = line.find(':').ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "malformed trailer line")
        })?;
        builder
            .try_add_lenient(line[..colon].trim(), line[colon + 1..].trim())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    }
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read_all(decoder: &mut Decoder, input: &[u8]) -> io::Result<Vec<u8>> {
        let mut source = Cursor::new(input.to_vec());
        let mut out = Vec::new();
        let mut buf = [0u8; 7]; // deliberately small
        loop {
            let n = decoder.decode(&mut source, &mut buf)?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    #[test]
    fn fixed_length_stops_at_length() {
        let mut decoder = Decoder::length(5);
        let out = read_all(&mut decoder, b"helloworld").unwrap();
        assert_eq!(out, b"hello");
        assert!(decoder.is_eof());
    }

    #[test]
    fn fixed_length_eof_early_is_error() {
        let mut decoder = Decoder::length(5);
        assert!(read_all(&mut decoder, b"he").is_err());
    }

    #[test]
    fn chunked_reassembles() {
        let mut decoder = Decoder::chunked();
        let out = read_all(&mut decoder, b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"hello world");
        assert!(decoder.is_eof());
    }

    #[test]
    fn chunked_ignores_extensions() {
        let mut decoder = Decoder::chunked();
        let out = read_all(&mut decoder, b"5;ext=1\r\nhello\r\n0\r\n\r\n").unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn chunked_reads_trailers() {
        let mut decoder = Decoder::chunked();
        let out =
            read_all(&mut decoder, b"2\r\nok\r\n0\r\nX-Checksum: abc\r\n\r\n").unwrap();
        assert_eq!(out, b"ok");
        assert_eq!(decoder.trailers().get("x-checksum"), Some("abc"));
    }

    #[test]
    fn chunked_rejects_bad_size() {
        let mut decoder = Decoder::chunked();
        assert!(read_all(&mut decoder, b"zz\r\nhello\r\n").is_err());
    }

    #[test]
    fn eof_reads_until_close() {
        let mut decoder = Decoder::eof();
        let out = read_all(&mut decoder, b"anything goes").unwrap();
        assert_eq!(out, b"anything goes");
        assert!(decoder.is_eof());
        assert!(!decoder.has_definite_length());
    }
}
