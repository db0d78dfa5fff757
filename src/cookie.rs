//! HTTP cookies and the cookie jar capability port.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::http_date;
use crate::url::HttpUrl;

/// An RFC 6265 cookie.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Cookie {
    name: String,
    value: String,
    /// Expiry in milliseconds since the epoch. `i64::MAX` for session
    /// cookies and far-future dates.
    expires_at: i64,
    domain: String,
    path: String,
    secure: bool,
    http_only: bool,
    /// Whether the domain was taken from the URL rather than an attribute.
    host_only: bool,
    persistent: bool,
}

impl Cookie {
    /// Parses one `Set-Cookie` value received for `url`, or `None` when it
    /// is malformed or not applicable to the URL's host.
    pub fn parse(url: &HttpUrl, set_cookie: &str) -> Option<Cookie> {
        let (pair, attributes) = match set_cookie.find(';') {
            Some(i) => (&set_cookie[..i], &set_cookie[i + 1..]),
            None => (set_cookie, ""),
        };
        let eq = pair.find('=')?;
        let name = pair[..eq].trim();
        let value = pair[eq + 1..].trim();
        if name.is_empty() || name.contains(|c: char| c.is_ascii_control() || c == ' ') {
            return None;
        }

        let mut expires_at: i64 = i64::MAX;
        let mut persistent = false;
        let mut domain: Option<String> = None;
        let mut path: Option<String> = None;
        let mut secure = false;
        let mut http_only = false;
        let mut has_max_age = false;

        for attribute in attributes.split(';') {
            let (attr_name, attr_value) = match attribute.find('=') {
                Some(i) => (attribute[..i].trim(), attribute[i + 1..].trim()),
                None => (attribute.trim(), ""),
            };
            if attr_name.eq_ignore_ascii_case("expires") {
                if !has_max_age {
                    // Max-Age wins over Expires.
                    expires_at = http_date::parse_http_date(attr_value)
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_millis().min(i64::MAX as u128) as i64)
                        .unwrap_or(i64::MIN);
                    persistent = true;
                }
            } else if attr_name.eq_ignore_ascii_case("max-age") {
                let now = now_millis();
                expires_at = match attr_value.parse::<i64>() {
                    Ok(seconds) if seconds <= 0 => i64::MIN,
                    Ok(seconds) => now.saturating_add(seconds.saturating_mul(1000)),
                    Err(_) => continue,
                };
                persistent = true;
                has_max_age = true;
            } else if attr_name.eq_ignore_ascii_case("domain") {
                let attr_value = attr_value.strip_prefix('.').unwrap_or(attr_value);
                if attr_value.is_empty() {
                    return None;
                }
                domain = Some(attr_value.to_ascii_lowercase());
            } else if attr_name.eq_ignore_ascii_case("path") {
                if attr_value.starts_with('/') {
                    path = Some(attr_value.to_owned());
                }
            } else if attr_name.eq_ignore_ascii_case("secure") {
                secure = true;
            } else if attr_name.eq_ignore_ascii_case("httponly") {
                http_only = true;
            }
        }

        let host_only = domain.is_none();
        let domain = match domain {
            Some(domain) => {
                if !domain_matches(url.host(), &domain) {
                    return None;
                }
                domain
            }
            None => url.host().to_owned(),
        };

        let path = path.unwrap_or_else(|| default_path(url));

        Some(Cookie {
            name: name.to_owned(),
            value: value.to_owned(),
            expires_at,
            domain,
            path,
            secure,
            http_only,
            host_only,
            persistent,
        })
    }

    /// Parses every `Set-Cookie` value in `headers` for `url`.
    pub fn parse_all(url: &HttpUrl, headers: &crate::headers::Headers) -> Vec<Cookie> {
        headers
            .values("Set-Cookie")
            .into_iter()
            .filter_map(|value| Cookie::parse(url, value))
            .collect()
    }

    /// The cookie name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cookie value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Expiry in milliseconds since the epoch.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// The domain this cookie applies to.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The path prefix this cookie applies to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether this cookie requires HTTPS.
    pub fn secure(&self) -> bool {
        self.secure
    }

    /// Whether this cookie is hidden from non-HTTP APIs.
    pub fn http_only(&self) -> bool {
        self.http_only
    }

    /// Whether this cookie is limited to the exact host that set it.
    pub fn host_only(&self) -> bool {
        self.host_only
    }

    /// Whether this cookie outlives the session.
    pub fn persistent(&self) -> bool {
        self.persistent
    }

    /// Whether this cookie should be attached to a request for `url`.
    pub fn matches(&self, url: &HttpUrl) -> bool {
        let domain_ok = if self.host_only {
            url.host() == self.domain
        } else {
            domain_matches(url.host(), &self.domain)
        };
        if !domain_ok {
            return false;
        }
        if !path_matches(url.encoded_path().as_str(), &self.path) {
            return false;
        }
        if self.secure && !url.is_https() {
            return false;
        }
        self.expires_at > now_millis()
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

fn domain_matches(host: &str, domain: &str) -> bool {
    if host == domain {
        return true;
    }
    host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
        && host.parse::<std::net::IpAddr>().is_err()
}

fn path_matches(url_path: &str, cookie_path: &str) -> bool {
    if url_path == cookie_path {
        return true;
    }
    url_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/') || url_path.as_bytes()[cookie_path.len()] == b'/')
}

fn default_path(url: &HttpUrl) -> String {
    let encoded = url.encoded_path();
    match encoded.rfind('/') {
        Some(0) | None => "/".to_owned(),
        Some(i) => encoded[..i].to_owned(),
    }
}

/// Provides cookies to attach to requests, and accepts cookies from
/// responses.
pub trait CookieJar: Send + Sync + fmt::Debug {
    /// Saves cookies from an HTTP response.
    fn save_from_response(&self, url: &HttpUrl, cookies: Vec<Cookie>);

    /// Loads cookies for an HTTP request. Only cookies matching `url`
    /// should be returned.
    fn load_for_request(&self, url: &HttpUrl) -> Vec<Cookie>;
}

/// A jar that never stores anything.
#[derive(Debug, Default)]
pub struct NoCookies;

impl CookieJar for NoCookies {
    fn save_from_response(&self, _url: &HttpUrl, _cookies: Vec<Cookie>) {}

    fn load_for_request(&self, _url: &HttpUrl) -> Vec<Cookie> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> HttpUrl {
        HttpUrl::parse(s).unwrap()
    }

    #[test]
    fn parse_simple_pair() {
        let cookie = Cookie::parse(&url("https://example.com/a/b"), "sid=abc123").unwrap();
        assert_eq!(cookie.name(), "sid");
        assert_eq!(cookie.value(), "abc123");
        assert!(cookie.host_only());
        assert!(!cookie.persistent());
        assert_eq!(cookie.path(), "/a");
        assert_eq!(cookie.to_string(), "sid=abc123");
    }

    #[test]
    fn parse_attributes() {
        let cookie = Cookie::parse(
            &url("https://sub.example.com/"),
            "a=b; Domain=example.com; Path=/x; Secure; HttpOnly; Max-Age=60",
        )
        .unwrap();
        assert_eq!(cookie.domain(), "example.com");
        assert_eq!(cookie.path(), "/x");
        assert!(cookie.secure());
        assert!(cookie.http_only());
        assert!(cookie.persistent());
        assert!(!cookie.host_only());
    }

    #[test]
    fn foreign_domain_rejected() {
        assert!(Cookie::parse(&url("https://example.com/"), "a=b; Domain=other.com").is_none());
    }

    #[test]
    fn secure_cookie_does_not_match_http() {
        let cookie = Cookie::parse(&url("https://example.com/"), "a=b; Secure").unwrap();
        assert!(cookie.matches(&url("https://example.com/")));
        assert!(!cookie.matches(&url("http://example.com/")));
    }

    #[test]
    fn domain_cookie_matches_subdomains() {
        let cookie =
            Cookie::parse(&url("https://example.com/"), "a=b; Domain=example.com").unwrap();
        assert!(cookie.matches(&url("https://www.example.com/")));

        let host_only = Cookie::parse(&url("https://example.com/"), "a=b").unwrap();
        assert!(!host_only.matches(&url("https://www.example.com/")));
    }

    #[test]
    fn max_age_zero_expires_immediately() {
        let cookie = Cookie::parse(&url("https://example.com/"), "a=b; Max-Age=0").unwrap();
        assert!(!cookie.matches(&url("https://example.com/")));
    }
}
