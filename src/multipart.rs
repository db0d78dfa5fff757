//! A multipart request body, RFC 2046.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::body::RequestBody;
use crate::headers::Headers;
use crate::media_type::MediaType;

/// A composite request body: a sequence of parts separated by a boundary.
pub struct MultipartBody {
    boundary: String,
    media_type: MediaType,
    parts: Vec<Part>,
}

/// One part of a [`MultipartBody`]: optional headers plus a body.
pub struct Part {
    headers: Option<Headers>,
    body: Box<dyn RequestBody>,
}

impl Part {
    /// A part with no headers of its own.
    pub fn new(body: impl RequestBody + 'static) -> Part {
        Part {
            headers: None,
            body: Box::new(body),
        }
    }

    /// A part with explicit headers.
    ///
    /// # Panics
    ///
    /// Panics if the headers contain `Content-Type` or `Content-Length`;
    /// those are owned by the part's body and the framing.
    pub fn with_headers(headers: Headers, body: impl RequestBody + 'static) -> Part {
        assert!(
            headers.get("Content-Type").is_none(),
            "unexpected header: Content-Type"
        );
        assert!(
            headers.get("Content-Length").is_none(),
            "unexpected header: Content-Length"
        );
        Part {
            headers: Some(headers),
            body: Box::new(body),
        }
    }

    /// A `multipart/form-data` part carrying a named value.
    pub fn form_data(name: &str, filename: Option<&str>, body: impl RequestBody + 'static) -> Part {
        let mut disposition = format!("form-data; name=\"{}\"", quote(name));
        if let Some(filename) = filename {
            disposition.push_str(&format!("; filename=\"{}\"", quote(filename)));
        }
        Part {
            headers: Some(Headers::of(&[("Content-Disposition", &disposition)])),
            body: Box::new(body),
        }
    }
}

fn quote(value: &str) -> String {
    value
        .replace('\n', "%0A")
        .replace('\r', "%0D")
        .replace('"', "%22")
}

impl MultipartBody {
    /// Returns a new builder with a generated boundary and type
    /// `multipart/mixed`.
    pub fn builder() -> MultipartBuilder {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        MultipartBuilder::with_boundary(&format!("{:016x}{:08x}", nanos.wrapping_mul(0x9e37_79b9), n))
    }

    /// The boundary separating the parts.
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// The parts, in order.
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    fn write_or_count(&self, sink: Option<&mut dyn Write>) -> io::Result<i64> {
        let mut counting = CountingSink {
            sink,
            count: 0,
            unknown: false,
        };

        for part in &self.parts {
            counting.emit(b"--")?;
            counting.emit(self.boundary.as_bytes())?;
            counting.emit(b"\r\n")?;
            if let Some(headers) = &part.headers {
                for (name, value) in headers.iter() {
                    counting.emit(name.as_bytes())?;
                    counting.emit(b": ")?;
                    counting.emit(value.as_bytes())?;
                    counting.emit(b"\r\n")?;
                }
            }
            if let Some(content_type) = part.body.content_type() {
                counting.emit(b"Content-Type: ")?;
                counting.emit(content_type.to_string().as_bytes())?;
                counting.emit(b"\r\n")?;
            }
            counting.emit(b"\r\n")?;

            // Part content is delimited by the boundary, not by length.
            if let Some(sink) = counting.sink.as_deref_mut() {
                part.body.write_to(sink)?;
            }
            let content_length = part.body.content_length();
            if content_length == -1 {
                counting.unknown = true;
            } else {
                counting.count += content_length;
            }

            counting.emit(b"\r\n")?;
        }

        counting.emit(b"--")?;
        counting.emit(self.boundary.as_bytes())?;
        counting.emit(b"--\r\n")?;

        if counting.unknown {
            Ok(-1)
        } else {
            Ok(counting.count)
        }
    }
}

struct CountingSink<'a> {
    sink: Option<&'a mut dyn Write>,
    count: i64,
    unknown: bool,
}

impl<'a> CountingSink<'a> {
    fn emit(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Some(sink) = self.sink.as_deref_mut() {
            sink.write_all(bytes)?;
        }
        self.count += bytes.len() as i64;
        Ok(())
    }
}

impl RequestBody for MultipartBody {
    fn content_type(&self) -> Option<MediaType> {
        Some(self.media_type.clone())
    }

    fn content_length(&self) -> i64 {
        self.write_or_count(None).unwrap_or(-1)
    }

    fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
        self.write_or_count(Some(sink)).map(|_| ())
    }
}

impl fmt::Debug for MultipartBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartBody")
            .field("boundary", &self.boundary)
            .field("parts", &self.parts.len())
            .finish()
    }
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part").finish()
    }
}

/// Builds a [`MultipartBody`].
#[derive(Debug)]
pub struct MultipartBuilder {
    boundary: String,
    subtype: String,
    parts: Vec<Part>,
}

impl MultipartBuilder {
    /// A builder using an explicit boundary.
    pub fn with_boundary(boundary: &str) -> MultipartBuilder {
        MultipartBuilder {
            boundary: boundary.to_owned(),
            subtype: "mixed".to_owned(),
            parts: Vec::new(),
        }
    }

    /// Sets the multipart subtype, e.g. `form-data`.
    ///
    /// # Panics
    ///
    /// Panics unless `media_type` is `multipart/*`.
    pub fn set_type(mut self, media_type: &MediaType) -> MultipartBuilder {
        assert_eq!(
            media_type.type_(),
            "multipart",
            "multipart != {}",
            media_type
        );
        self.subtype = media_type.subtype().to_owned();
        self
    }

    /// Appends a part.
    pub fn add_part(mut self, part: Part) -> MultipartBuilder {
        self.parts.push(part);
        self
    }

    /// Builds the body.
    ///
    /// # Panics
    ///
    /// Panics when no parts were added.
    pub fn build(self) -> MultipartBody {
        assert!(!self.parts.is_empty(), "Multipart body must have at least one part.");
        let media_type = MediaType::parse(&format!(
            "multipart/{}; boundary={}",
            self.subtype, self.boundary
        ))
        .expect("valid multipart media type");
        MultipartBody {
            boundary: self.boundary,
            media_type,
            parts: self.parts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::ByteBody;

    #[test]
    fn single_part_framing_is_exact() {
        let body = MultipartBuilder::with_boundary("123")
            .add_part(Part::new(ByteBody::new(&b"Hello, World!"[..], None)))
            .build();

        let mut out = Vec::new();
        body.write_to(&mut out).unwrap();
        assert_eq!(out, b"--123\r\n\r\nHello, World!\r\n--123--\r\n");
        assert_eq!(out.len(), 33);
        assert_eq!(body.content_length(), 33);
    }

    #[test]
    fn content_type_carries_boundary() {
        let body = MultipartBuilder::with_boundary("b0")
            .set_type(&MediaType::parse("multipart/form-data").unwrap())
            .add_part(Part::form_data("field", None, ByteBody::new(&b"v"[..], None)))
            .build();
        let content_type = body.content_type().unwrap();
        assert_eq!(content_type.type_(), "multipart");
        assert_eq!(content_type.subtype(), "form-data");
        assert_eq!(content_type.parameter("boundary"), Some("b0"));
    }

    #[test]
    fn part_headers_are_framed() {
        let body = MultipartBuilder::with_boundary("123")
            .add_part(Part::with_headers(
                Headers::of(&[("X-Tag", "v")]),
                ByteBody::new(&b"hi"[..], None),
            ))
            .build();
        let mut out = Vec::new();
        body.write_to(&mut out).unwrap();
        assert_eq!(out, b"--123\r\nX-Tag: v\r\n\r\nhi\r\n--123--\r\n");
    }

    #[test]
    fn unknown_part_length_makes_body_unsized() {
        struct Streamed;
        impl RequestBody for Streamed {
            fn content_type(&self) -> Option<MediaType> {
                None
            }
            fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
                sink.write_all(b"stream")
            }
        }
        let body = MultipartBuilder::with_boundary("123")
            .add_part(Part::new(Streamed))
            .build();
        assert_eq!(body.content_length(), -1);
    }

    #[test]
    #[should_panic]
    fn empty_multipart_rejected() {
        MultipartBuilder::with_boundary("123").build();
    }
}
