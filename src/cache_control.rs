//! The Cache-Control header, parsed.

use std::fmt;
use std::time::Duration;

use crate::headers::Headers;

/// The cache directives of a request or response.
///
/// Values are parsed from `Cache-Control` and `Pragma` headers with
/// [`CacheControl::parse`], or built with [`CacheControl::builder`].
#[derive(Clone, Debug, Default)]
pub struct CacheControl {
    no_cache: bool,
    no_store: bool,
    max_age_seconds: i64,
    s_max_age_seconds: i64,
    is_private: bool,
    is_public: bool,
    must_revalidate: bool,
    max_stale_seconds: i64,
    min_fresh_seconds: i64,
    only_if_cached: bool,
    no_transform: bool,
    immutable: bool,
    /// The single raw `Cache-Control` value, kept for rendering when it was
    /// not invalidated by a second `Cache-Control` or by `Pragma`. This is
    /// the one place unknown directives survive.
    header_value: Option<String>,
}

impl CacheControl {
    /// Returns a new builder. Absent time directives are `-1`.
    pub fn builder() -> CacheControlBuilder {
        CacheControlBuilder {
            inner: CacheControl {
                max_age_seconds: -1,
                s_max_age_seconds: -1,
                max_stale_seconds: -1,
                min_fresh_seconds: -1,
                ..CacheControl::default()
            },
        }
    }

    /// A directive requiring network validation of the response.
    pub fn force_network() -> CacheControl {
        CacheControl::builder().no_cache().build()
    }

    /// A directive using the cache only, however stale.
    pub fn force_cache() -> CacheControl {
        CacheControl::builder()
            .only_if_cached()
            .max_stale(Duration::from_secs(i32::MAX as u64))
            .build()
    }

    /// Parses the cache directives of `headers`, consuming every
    /// `Cache-Control` value and treating every `Pragma` value as though it
    /// were Cache-Control.
    pub fn parse(headers: &Headers) -> CacheControl {
        let mut result = CacheControl {
            max_age_seconds: -1,
            s_max_age_seconds: -1,
            max_stale_seconds: -1,
            min_fresh_seconds: -1,
            ..CacheControl::default()
        };

        let mut can_use_header_value = true;
        let mut header_value: Option<String> = None;

        for i in 0..headers.len() {
            let name = headers.name(i);
            let value = headers.value(i);

            if name.eq_ignore_ascii_case("Cache-Control") {
                if header_value.is_some() {
                    // Multiple headers means we can't use the raw value.
                    can_use_header_value = false;
                } else {
                    header_value = Some(value.to_owned());
                }
            } else if name.eq_ignore_ascii_case("Pragma") {
                // Pragma headers change this implementation. Commit to
                // rebuilding the header value from what we understand.
                can_use_header_value = false;
            } else {
                continue;
            }

            let bytes = value.as_bytes();
            let limit = value.len();
            let mut pos = 0;
            while pos < limit {
                let token_start = pos;
                pos = index_of_element(value, "=,;", pos);
                let directive = value[token_start..pos].trim();
                let parameter: Option<&str>;

                if pos == limit || bytes[pos] == b',' || bytes[pos] == b';' {
                    pos += 1;
                    parameter = None;
                } else {
                    pos += 1; // consume '='
                    while pos < limit && (bytes[pos] == b' ' || bytes[pos] == b'\t') {
                        pos += 1;
                    }
                    if pos < limit && bytes[pos] == b'"' {
                        pos += 1;
                        let start = pos;
                        pos = index_of_element(value, "\"", pos);
                        parameter = Some(&value[start..pos]);
                        pos += 1;
                    } else {
                        let start = pos;
                        pos = index_of_element(value, ",;", pos);
                        parameter = Some(value[start..pos].trim());
                        pos += 1;
                    }
                }

                if directive.eq_ignore_ascii_case("no-cache") {
                    result.no_cache = true;
                } else if directive.eq_ignore_ascii_case("no-store") {
                    result.no_store = true;
                } else if directive.eq_ignore_ascii_case("max-age") {
                    result.max_age_seconds = to_non_negative_seconds(parameter, -1);
                } else if directive.eq_ignore_ascii_case("s-maxage") {
                    result.s_max_age_seconds = to_non_negative_seconds(parameter, -1);
                } else if directive.eq_ignore_ascii_case("private") {
                    result.is_private = true;
                } else if directive.eq_ignore_ascii_case("public") {
                    result.is_public = true;
                } else if directive.eq_ignore_ascii_case("must-revalidate") {
                    result.must_revalidate = true;
                } else if directive.eq_ignore_ascii_case("max-stale") {
                    result.max_stale_seconds = to_non_negative_seconds(parameter, i32::MAX as i64);
                } else if directive.eq_ignore_ascii_case("min-fresh") {
                    result.min_fresh_seconds = to_non_negative_seconds(parameter, -1);
                } else if directive.eq_ignore_ascii_case("only-if-cached") {
                    result.only_if_cached = true;
                } else if directive.eq_ignore_ascii_case("no-transform") {
                    result.no_transform = true;
                } else if directive.eq_ignore_ascii_case("immutable") {
                    result.immutable = true;
                }
                // Unknown directives are dropped from the model; the raw
                // header value retains them when it is still usable.
            }
        }

        if can_use_header_value {
            result.header_value = header_value;
        }
        result
    }

    /// Whether the response may be served from cache without validation.
    pub fn no_cache(&self) -> bool {
        self.no_cache
    }

    /// Whether the response may be stored at all.
    pub fn no_store(&self) -> bool {
        self.no_store
    }

    /// `max-age` in seconds, or `-1` when absent.
    pub fn max_age_seconds(&self) -> i64 {
        self.max_age_seconds
    }

    /// `s-maxage` in seconds, or `-1` when absent.
    pub fn s_max_age_seconds(&self) -> i64 {
        self.s_max_age_seconds
    }

    /// Whether the response is for a single user only.
    pub fn is_private(&self) -> bool {
        self.is_private
    }

    /// Whether the response may be cached by shared caches.
    pub fn is_public(&self) -> bool {
        self.is_public
    }

    /// Whether a stale response must be revalidated before use.
    pub fn must_revalidate(&self) -> bool {
        self.must_revalidate
    }

    /// `max-stale` in seconds, or `-1` when absent.
    pub fn max_stale_seconds(&self) -> i64 {
        self.max_stale_seconds
    }

    /// `min-fresh` in seconds, or `-1` when absent.
    pub fn min_fresh_seconds(&self) -> i64 {
        self.min_fresh_seconds
    }

    /// Whether the request insists on a cached response.
    pub fn only_if_cached(&self) -> bool {
        self.only_if_cached
    }

    /// Whether intermediaries must not transform the body.
    pub fn no_transform(&self) -> bool {
        self.no_transform
    }

    /// Whether the response will not change over time.
    pub fn immutable(&self) -> bool {
        self.immutable
    }
}

impl PartialEq for CacheControl {
    fn eq(&self, other: &CacheControl) -> bool {
        // The retained raw header value is a rendering detail.
        self.no_cache == other.no_cache
            && self.no_store == other.no_store
            && self.max_age_seconds == other.max_age_seconds
            && self.s_max_age_seconds == other.s_max_age_seconds
            && self.is_private == other.is_private
            && self.is_public == other.is_public
            && self.must_revalidate == other.must_revalidate
            && self.max_stale_seconds == other.max_stale_seconds
            && self.min_fresh_seconds == other.min_fresh_seconds
            && self.only_if_cached == other.only_if_cached
            && self.no_transform == other.no_transform
            && self.immutable == other.immutable
    }
}

impl Eq for CacheControl {}

impl fmt::Display for CacheControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref header_value) = self.header_value {
            return f.write_str(header_value);
        }

        let mut first = true;
        let mut directive = |f: &mut fmt::Formatter<'_>, text: &str| -> fmt::Result {
            if !first {
                f.write_str(", ")?;
            }
            first = false;
            f.write_str(text)
        };

        if self.no_cache {
            directive(f, "no-cache")?;
        }
        if self.no_store {
            directive(f, "no-store")?;
        }
        if self.max_age_seconds != -1 {
            directive(f, &format!("max-age={}", self.max_age_seconds))?;
        }
        if self.s_max_age_seconds != -1 {
            directive(f, &format!("s-maxage={}", self.s_max_age_seconds))?;
        }
        if self.is_private {
            directive(f, "private")?;
        }
        if self.is_public {
            directive(f, "public")?;
        }
        if self.must_revalidate {
            directive(f, "must-revalidate")?;
        }
        if self.max_stale_seconds != -1 {
            directive(f, &format!("max-stale={}", self.max_stale_seconds))?;
        }
        if self.min_fresh_seconds != -1 {
            directive(f, &format!("min-fresh={}", self.min_fresh_seconds))?;
        }
        if self.only_if_cached {
            directive(f, "only-if-cached")?;
        }
        if self.no_transform {
            directive(f, "no-transform")?;
        }
        if self.immutable {
            directive(f, "immutable")?;
        }
        Ok(())
    }
}

/// Builds a [`CacheControl`] for a request.
#[derive(Clone, Debug)]
pub struct CacheControlBuilder {
    inner: CacheControl,
}

impl CacheControlBuilder {
    /// Don't accept an unvalidated cached response.
    pub fn no_cache(mut self) -> CacheControlBuilder {
        self.inner.no_cache = true;
        self
    }

    /// Don't store the server's response in any cache.
    pub fn no_store(mut self) -> CacheControlBuilder {
        self.inner.no_store = true;
        self
    }

    /// Only accept a response whose age is no greater than `max_age`.
    /// Truncated to whole seconds and saturated at `i32::MAX`.
    pub fn max_age(mut self, max_age: Duration) -> CacheControlBuilder {
        self.inner.max_age_seconds = saturated_seconds(max_age);
        self
    }

    /// Accept a response that has exceeded its freshness lifetime by up to
    /// `max_stale`. Truncated to whole seconds and saturated at `i32::MAX`.
    pub fn max_stale(mut self, max_stale: Duration) -> CacheControlBuilder {
        self.inner.max_stale_seconds = saturated_seconds(max_stale);
        self
    }

    /// Only accept a response that will still be fresh `min_fresh` from
    /// now. Truncated to whole seconds and saturated at `i32::MAX`.
    pub fn min_fresh(mut self, min_fresh: Duration) -> CacheControlBuilder {
        self.inner.min_fresh_seconds = saturated_seconds(min_fresh);
        self
    }

    /// Only accept the response if it is in the cache.
    pub fn only_if_cached(mut self) -> CacheControlBuilder {
        self.inner.only_if_cached = true;
        self
    }

    /// Don't accept a transformed response.
    pub fn no_transform(mut self) -> CacheControlBuilder {
        self.inner.no_transform = true;
        self
    }

    /// Mark the response as immutable for its freshness lifetime.
    pub fn immutable(mut self) -> CacheControlBuilder {
        self.inner.immutable = true;
        self
    }

    /// Builds the directives.
    pub fn build(self) -> CacheControl {
        self.inner
    }
}

fn saturated_seconds(duration: Duration) -> i64 {
    duration.as_secs().min(i32::MAX as u64) as i64
}

fn to_non_negative_seconds(parameter: Option<&str>, default: i64) -> i64 {
    match parameter.map(|p| p.parse::<u64>()) {
        Some(Ok(n)) => n.min(i32::MAX as u64) as i64,
        _ => default,
    }
}

fn index_of_element(input: &str, characters: &str, from: usize) -> usize {
    input[from..]
        .find(|c| characters.contains(c))
        .map(|i| i + from)
        .unwrap_or(input.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::Headers;
    use std::time::Duration;

    #[test]
    fn parse_every_directive() {
        let header = "no-cache, no-store, max-age=1, s-maxage=2, private, public, \
                      must-revalidate, max-stale=3, min-fresh=4, only-if-cached, no-transform";
        let headers = Headers::of(&[("Cache-Control", header)]);
        let cc = CacheControl::parse(&headers);
        assert!(cc.no_cache());
        assert!(cc.no_store());
        assert_eq!(cc.max_age_seconds(), 1);
        assert_eq!(cc.s_max_age_seconds(), 2);
        assert!(cc.is_private());
        assert!(cc.is_public());
        assert!(cc.must_revalidate());
        assert_eq!(cc.max_stale_seconds(), 3);
        assert_eq!(cc.min_fresh_seconds(), 4);
        assert!(cc.only_if_cached());
        assert!(cc.no_transform());
        assert_eq!(cc.to_string(), header);
    }

    #[test]
    fn unknown_directives_survive_in_single_header() {
        let headers = Headers::of(&[("Cache-Control", "no-cache, x-special=\"a,b\"")]);
        let cc = CacheControl::parse(&headers);
        assert!(cc.no_cache());
        assert_eq!(cc.to_string(), "no-cache, x-special=\"a,b\"");
    }

    #[test]
    fn pragma_invalidates_raw_header() {
        let headers = Headers::of(&[
            ("Cache-Control", "no-cache, x-special"),
            ("Pragma", "no-store"),
        ]);
        let cc = CacheControl::parse(&headers);
        assert!(cc.no_cache());
        assert!(cc.no_store());
        // Rebuilt canonically; the unknown directive is gone.
        assert_eq!(cc.to_string(), "no-cache, no-store");
    }

    #[test]
    fn multiple_cache_control_headers_combine() {
        let headers = Headers::of(&[
            ("Cache-Control", "max-age=12"),
            ("Cache-Control", "public"),
        ]);
        let cc = CacheControl::parse(&headers);
        assert_eq!(cc.max_age_seconds(), 12);
        assert!(cc.is_public());
        assert_eq!(cc.to_string(), "max-age=12, public");
    }

    #[test]
    fn quoted_parameters() {
        let headers = Headers::of(&[("Cache-Control", "max-age=\"10\"")]);
        assert_eq!(CacheControl::parse(&headers).max_age_seconds(), 10);
    }

    #[test]
    fn max_stale_without_value_is_unbounded() {
        let headers = Headers::of(&[("Cache-Control", "max-stale")]);
        assert_eq!(
            CacheControl::parse(&headers).max_stale_seconds(),
            i32::MAX as i64
        );
    }

    #[test]
    fn oversized_values_saturate() {
        let headers = Headers::of(&[("Cache-Control", "max-age=3141592653589793")]);
        assert_eq!(
            CacheControl::parse(&headers).max_age_seconds(),
            i32::MAX as i64
        );
    }

    #[test]
    fn invalid_values_are_absent() {
        let headers = Headers::of(&[("Cache-Control", "max-age=soon")]);
        assert_eq!(CacheControl::parse(&headers).max_age_seconds(), -1);
    }

    #[test]
    fn builder_round_trips_through_parse() {
        let cc = CacheControl::builder()
            .no_cache()
            .no_store()
            .max_age(Duration::from_secs(120))
            .max_stale(Duration::from_millis(4500))
            .min_fresh(Duration::from_secs(10))
            .only_if_cached()
            .no_transform()
            .build();
        // Truncated to whole seconds.
        assert_eq!(cc.max_stale_seconds(), 4);

        let headers = Headers::of(&[("Cache-Control", &cc.to_string())]);
        assert_eq!(CacheControl::parse(&headers), cc);
    }

    #[test]
    fn builder_saturates_at_i32_max() {
        let cc = CacheControl::builder()
            .max_age(Duration::from_secs(u64::MAX / 2))
            .build();
        assert_eq!(cc.max_age_seconds(), i32::MAX as i64);
    }
}
