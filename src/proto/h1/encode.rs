//! Encoders to handle different Transfer-Encodings.

use std::io::{self, Write};

/// Frames one request body onto the wire.
#[derive(Debug, PartialEq)]
pub(crate) struct Encoder {
    kind: Kind,
}

#[derive(Debug, PartialEq)]
enum Kind {
    /// An encoder for when Content-Length is set.
    ///
    /// Enforces that the body is exactly as long as the header promised.
    Length(u64),
    /// An encoder for when Transfer-Encoding includes `chunked`.
    Chunked,
}

impl Encoder {
    pub(crate) fn length(len: u64) -> Encoder {
        Encoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn chunked() -> Encoder {
        Encoder {
            kind: Kind::Chunked,
        }
    }

    pub(crate) fn encode(&mut self, sink: &mut dyn Write, buf: &[u8]) -> io::Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        match self.kind {
            Kind::Length(ref mut remaining) => {
                if (buf.len() as u64) > *remaining {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("expected {} bytes but received {}", remaining, buf.len()),
                    ));
                }
                *remaining -= buf.len() as u64;
                sink.write_all(buf)
            }
            Kind::Chunked => {
                write!(sink, "{:x}\r\n", buf.len())?;
                sink.write_all(buf)?;
                sink.write_all(b"\r\n")
            }
        }
    }

    /// Writes the terminator and verifies the promised length was met.
    pub(crate) fn finish(&mut self, sink: &mut dyn Write) -> io::Result<()> {
        match self.kind {
            Kind::Length(remaining) => {
                if remaining != 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unexpected end of stream: {} bytes short", remaining),
                    ));
                }
                Ok(())
            }
            Kind::Chunked => sink.write_all(b"0\r\n\r\n"),
        }
    }
}
