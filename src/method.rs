//! The HTTP request method.
use std::fmt;
use std::str::FromStr;

use self::Method::{Connect, Delete, Extension, Get, Head, Options, Patch, Post, Put, Query, Trace};

/// The request method (verb).
///
/// Includes the methods defined in
/// [RFC 7231](https://tools.ietf.org/html/rfc7231#section-4.1), plus PATCH,
/// the QUERY draft, and an `Extension` variant for everything else. QUERY is
/// emitted on the wire literally.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Method {
    /// OPTIONS
    Options,
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
    /// HEAD
    Head,
    /// TRACE
    Trace,
    /// CONNECT
    Connect,
    /// PATCH
    Patch,
    /// QUERY
    Query,
    /// Method extensions. An example would be `let m = Extension("PROPFIND".to_string())`.
    Extension(String),
}

impl Method {
    /// Whether a method is considered "safe", meaning the request is
    /// essentially read-only.
    ///
    /// See [the spec](https://tools.ietf.org/html/rfc7231#section-4.2.1)
    /// for more words.
    pub fn safe(&self) -> bool {
        matches!(*self, Get | Head | Options | Trace)
    }

    /// Whether a method is considered "idempotent", meaning the request has
    /// the same result if executed multiple times.
    ///
    /// See [the spec](https://tools.ietf.org/html/rfc7231#section-4.2.2) for
    /// more words.
    pub fn idempotent(&self) -> bool {
        if self.safe() {
            true
        } else {
            matches!(*self, Put | Delete)
        }
    }

    /// Whether a request body is permitted with this method.
    pub fn permits_request_body(&self) -> bool {
        !matches!(*self, Get | Head)
    }

    /// Whether a request body is required with this method.
    pub fn requires_request_body(&self) -> bool {
        matches!(*self, Post | Put | Patch | Query)
    }

    /// Whether a redirect of a request with this method rewrites it to GET.
    ///
    /// Applied on 301, 302, and 303 responses; 307 and 308 always preserve
    /// the method.
    pub(crate) fn redirects_to_get(&self) -> bool {
        !matches!(*self, Get | Head)
    }

    /// Whether a successful response to this method invalidates cached
    /// entries for the request URL.
    pub(crate) fn invalidates_cache(&self) -> bool {
        matches!(*self, Post | Put | Delete | Patch)
    }

    /// The method name as it appears on the wire.
    pub fn as_str(&self) -> &str {
        match *self {
            Options => "OPTIONS",
            Get => "GET",
            Post => "POST",
            Put => "PUT",
            Delete => "DELETE",
            Head => "HEAD",
            Trace => "TRACE",
            Connect => "CONNECT",
            Patch => "PATCH",
            Query => "QUERY",
            Extension(ref s) => s,
        }
    }
}

impl FromStr for Method {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Method, crate::Error> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_alphabetic() || b == b'-') {
            return Err(crate::Error::new_invalid_url(format!(
                "invalid method {:?}",
                s
            )));
        }
        Ok(match s {
            "OPTIONS" => Options,
            "GET" => Get,
            "POST" => Post,
            "PUT" => Put,
            "DELETE" => Delete,
            "HEAD" => Head,
            "TRACE" => Trace,
            "CONNECT" => Connect,
            "PATCH" => Patch,
            "QUERY" => Query,
            _ => Extension(s.to_owned()),
        })
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::Method;
    use std::str::FromStr;

    #[test]
    fn parse_round_trips() {
        for name in &["GET", "POST", "QUERY", "PROPFIND"] {
            let method = Method::from_str(name).unwrap();
            assert_eq!(method.as_str(), *name);
        }
    }

    #[test]
    fn body_rules() {
        assert!(!Method::Get.permits_request_body());
        assert!(!Method::Head.permits_request_body());
        assert!(Method::Delete.permits_request_body());
        assert!(!Method::Delete.requires_request_body());
        assert!(Method::Post.requires_request_body());
        assert!(Method::Query.requires_request_body());
    }

    #[test]
    fn rejects_garbage() {
        assert!(Method::from_str("").is_err());
        assert!(Method::from_str("GE T").is_err());
    }
}
