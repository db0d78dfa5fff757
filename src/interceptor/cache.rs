//! RFC 7234 caching: decide between the cache and the network, revalidate
//! conditionally, and observe responses for storage.

use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::SystemTime;

use log::trace;

use crate::body::ResponseBody;
use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::http_date::{now_epoch_millis, parse_http_date};
use crate::interceptor::{Chain, Interceptor};
use crate::request::Request;
use crate::response::Response;

const ONE_DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// The persistence port for cached responses.
///
/// The core computes the [`CacheStrategy`] and drives revalidation; the
/// store only holds response data. Bodies are streamed: [`put`](CacheStore::put)
/// returns a [`CacheWriter`] that observes the body bytes as the
/// application reads them, so storing never buffers a response the
/// application is still streaming.
pub trait CacheStore: Send + Sync + fmt::Debug {
    /// The stored response matching `request`, if any.
    fn get(&self, request: &Request) -> Option<Response>;

    /// Begins storing `response`, whose body has not been read yet.
    /// Return `None` to decline.
    fn put(&self, response: &Response) -> Option<Box<dyn CacheWriter>>;

    /// Replaces the headers of `cached` with those of `network` after a
    /// conditional hit. The stored body is unchanged.
    fn update(&self, cached: &Response, network: &Response);

    /// Drops the entry for `request`, after a request whose method
    /// invalidates it.
    fn remove(&self, request: &Request);

    /// Observes the strategy chosen for one request, for hit/miss
    /// statistics.
    fn track_response(&self, strategy: &CacheStrategy) {
        let _ = strategy;
    }

    /// Observes a conditional request answered with `304 Not Modified`.
    fn track_conditional_hit(&self) {}
}

/// Receives one response body as the application consumes it.
pub trait CacheWriter: Send {
    /// Appends body bytes, in order.
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// The body was read to the end; the entry is complete.
    fn commit(&mut self);

    /// The body was abandoned or failed; discard the partial entry.
    fn abort(&mut self);
}

/// Given a request and a cached response, decides whether to use the
/// network, the cache, or both.
///
/// Selecting a strategy may add conditions to the request, asking the
/// server to send the body only when the cached copy is out of date.
#[derive(Debug)]
pub struct CacheStrategy {
    network_request: Option<Request>,
    cache_response: Option<Response>,
}

impl CacheStrategy {
    /// The request to send over the network, or `None` when the cache
    /// suffices.
    pub fn network_request(&self) -> Option<&Request> {
        self.network_request.as_ref()
    }

    /// The cached response to return or validate, or `None` when none is
    /// usable.
    pub fn cache_response(&self) -> Option<&Response> {
        self.cache_response.as_ref()
    }

    pub(crate) fn into_parts(self) -> (Option<Request>, Option<Response>) {
        (self.network_request, self.cache_response)
    }

    /// Computes the strategy for `request` at `now_millis`, given the
    /// response the store currently holds.
    pub fn compute(now_millis: i64, request: &Request, cached: Option<Response>) -> CacheStrategy {
        let candidate = CacheStrategy::compute_candidate(now_millis, request, cached);
        if candidate.network_request.is_some() && request.cache_control().only_if_cached() {
            // The caller forbade the network and the cache cannot answer.
            return CacheStrategy {
                network_request: None,
                cache_response: None,
            };
        }
        candidate
    }

    fn compute_candidate(
        now_millis: i64,
        request: &Request,
        cached: Option<Response>,
    ) -> CacheStrategy {
        let network_only = |request: &Request| CacheStrategy {
            network_request: Some(request.clone()),
            cache_response: None,
        };

        let cached = match cached {
            Some(cached) => cached,
            None => return network_only(request),
        };

        // A cached response from a handshake we no longer have is useless.
        if request.is_https() && cached.handshake().is_none() {
            return network_only(request);
        }
        if !CacheStrategy::is_cacheable(&cached, request) {
            return network_only(request);
        }

        let request_caching = request.cache_control();
        if request_caching.no_cache() || has_conditions(request) {
            return network_only(request);
        }

        let response_caching = cached.cache_control();
        let served_date = cached.header("Date").and_then(parse_http_date).map(millis);
        let last_modified = cached
            .header("Last-Modified")
            .and_then(parse_http_date)
            .map(millis);

        let age_millis = cache_response_age(&cached, served_date, now_millis);
        let mut fresh_millis = freshness_lifetime(&cached, served_date, last_modified);
        if request_caching.max_age_seconds() != -1 {
            fresh_millis = fresh_millis.min(request_caching.max_age_seconds() * 1000);
        }

        let min_fresh_millis = match request_caching.min_fresh_seconds() {
            -1 => 0,
            seconds => seconds * 1000,
        };
        let max_stale_millis = if !response_caching.must_revalidate()
            && request_caching.max_stale_seconds() != -1
        {
            request_caching.max_stale_seconds() * 1000
        } else {
            0
        };

        if !response_caching.no_cache()
            && age_millis + min_fresh_millis < fresh_millis + max_stale_millis
        {
            let heuristic = is_freshness_heuristic(&cached, last_modified);
            let mut builder = cached.new_builder();
            if age_millis + min_fresh_millis >= fresh_millis {
                builder = builder.add_header("Warning", "110 courier \"Response is stale\"");
            }
            if age_millis > ONE_DAY_MILLIS && heuristic {
                builder = builder.add_header("Warning", "113 courier \"Heuristic expiration\"");
            }
            return CacheStrategy {
                network_request: None,
                cache_response: Some(builder.build()),
            };
        }

        // The cached copy needs validating. Ask the server to skip the body
        // when it has not changed.
        let (condition_name, condition_value) = if let Some(etag) = cached.header("ETag") {
            ("If-None-Match", etag.to_owned())
        } else if let Some(last_modified) = cached.header("Last-Modified") {
            ("If-Modified-Since", last_modified.to_owned())
        } else if let Some(date) = cached.header("Date") {
            ("If-Modified-Since", date.to_owned())
        } else {
            // No way to express a condition; refetch unconditionally.
            return network_only(request);
        };

        let conditional = request
            .new_builder()
            .header(condition_name, &condition_value)
            .build()
            .expect("a valid request stays valid with a condition header");
        CacheStrategy {
            network_request: Some(conditional),
            cache_response: Some(cached),
        }
    }

    /// Whether `response` may be stored and later served for requests like
    /// `request`. This applies the status-code and `no-store` rules; it
    /// says nothing about freshness.
    pub fn is_cacheable(response: &Response, request: &Request) -> bool {
        match response.code() {
            200 | 203 | 204 | 300 | 301 | 308 | 404 | 405 | 410 | 414 | 501 => {}
            302 | 307 => {
                // Cacheable only with explicit freshness information.
                let caching = response.cache_control();
                if response.header("Expires").is_none()
                    && caching.max_age_seconds() == -1
                    && !caching.is_public()
                    && !caching.is_private()
                {
                    return false;
                }
            }
            _ => return false,
        }

        // A response varying on everything matches nothing.
        if response
            .headers()
            .values("Vary")
            .iter()
            .flat_map(|v| v.split(','))
            .any(|field| field.trim() == "*")
        {
            return false;
        }

        !response.cache_control().no_store() && !request.cache_control().no_store()
    }
}

fn has_conditions(request: &Request) -> bool {
    request.header("If-Modified-Since").is_some() || request.header("If-None-Match").is_some()
}

fn millis(time: SystemTime) -> i64 {
    match time.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// The response's current age, RFC 7234 §4.2.3.
fn cache_response_age(cached: &Response, served_date: Option<i64>, now_millis: i64) -> i64 {
    let sent = cached.sent_request_at_millis();
    let received = cached.received_response_at_millis();

    let apparent_received_age = served_date.map_or(0, |served| (received - served).max(0));
    let received_age = cached
        .header("Age")
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map_or(apparent_received_age, |age| {
            apparent_received_age.max(age * 1000)
        });
    let response_duration = received - sent;
    let resident_duration = now_millis - received;
    received_age + response_duration + resident_duration
}

/// How long the response stays fresh from its serve date, RFC 7234 §4.2.1.
fn freshness_lifetime(
    cached: &Response,
    served_date: Option<i64>,
    last_modified: Option<i64>,
) -> i64 {
    let caching = cached.cache_control();
    if caching.max_age_seconds() != -1 {
        return caching.max_age_seconds() * 1000;
    }

    if let Some(expires) = cached.header("Expires").and_then(parse_http_date).map(millis) {
        let served = served_date.unwrap_or_else(|| cached.received_response_at_millis());
        return (expires - served).max(0);
    }

    if let Some(last_modified) = last_modified {
        // Heuristic freshness, one tenth of the document's age when
        // served. Only safe without a query: query results change faster
        // than documents.
        if cached.request().url().encoded_query().is_none() {
            let served = served_date.unwrap_or_else(|| cached.sent_request_at_millis());
            let delta = served - last_modified;
            if delta > 0 {
                return delta / 10;
            }
        }
    }
    0
}

fn is_freshness_heuristic(cached: &Response, last_modified: Option<i64>) -> bool {
    cached.cache_control().max_age_seconds() == -1
        && cached.header("Expires").is_none()
        && last_modified.is_some()
}

/// Serves requests from the cache and writes responses to the cache.
pub(crate) struct CacheInterceptor {
    cache: Option<Arc<dyn CacheStore>>,
}

impl CacheInterceptor {
    pub(crate) fn new(cache: Option<Arc<dyn CacheStore>>) -> CacheInterceptor {
        CacheInterceptor { cache }
    }
}

impl Interceptor for CacheInterceptor {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let request = chain.request().clone();
        let cache_candidate = self.cache.as_ref().and_then(|cache| cache.get(&request));

        let strategy = CacheStrategy::compute(now_epoch_millis(), &request, cache_candidate);
        if let Some(ref cache) = self.cache {
            cache.track_response(&strategy);
        }
        let (network_request, mut cache_response) = strategy.into_parts();

        if network_request.is_none() && cache_response.is_none() {
            // only-if-cached with nothing to satisfy it.
            return Err(Error::new_unsatisfiable_request());
        }

        // The cache wins outright.
        let network_request = match network_request {
            Some(network_request) => network_request,
            None => {
                let cached = cache_response.expect("a strategy names a source");
                trace!("cache hit for {}", request.url());
                let stripped = cached.copy_without_body();
                return Ok(cached.new_builder().cache_response(Some(stripped)).build());
            }
        };

        let network_response = chain.proceed(network_request)?;

        if network_response.code() == 304 {
            if let Some(cached) = cache_response.take() {
                trace!("conditional cache hit for {}", request.url());
                let stripped_cached = cached.copy_without_body();
                let stripped_network = network_response.copy_without_body();
                let combined = combine_headers(cached.headers(), network_response.headers());
                let response = cached
                    .new_builder()
                    .headers(combined)
                    .sent_request_at_millis(network_response.sent_request_at_millis())
                    .received_response_at_millis(network_response.received_response_at_millis())
                    .cache_response(Some(stripped_cached))
                    .network_response(Some(stripped_network))
                    .build();
                // The 304 carries no body; drain it so its exchange ends
                // cleanly.
                let _ = network_response.body().bytes();
                if let Some(ref cache) = self.cache {
                    cache.track_conditional_hit();
                    cache.update(response.cache_response().expect("set above"), &response);
                }
                return Ok(response);
            }
        }

        let stripped_network = network_response.copy_without_body();
        let mut response = network_response
            .new_builder()
            .cache_response(cache_response.map(|cached| cached.copy_without_body()))
            .network_response(Some(stripped_network))
            .build();

        if let Some(ref cache) = self.cache {
            if response.promises_body() && CacheStrategy::is_cacheable(&response, &request) {
                if let Some(writer) = cache.put(&response) {
                    response = cache_writing_response(response, writer);
                }
            }
            if request.method().invalidates_cache() {
                cache.remove(&request);
            }
        }
        Ok(response)
    }
}

/// Wraps the response body so the bytes the application reads are copied
/// into the cache, committing on EOF and aborting on failure or
/// abandonment.
fn cache_writing_response(response: Response, writer: Box<dyn CacheWriter>) -> Response {
    let mut builder = response.new_builder();
    let body = builder.take_body().unwrap_or_else(ResponseBody::empty);
    let media_type = body.content_type().cloned();
    let content_length = body.content_length();
    builder
        .body(ResponseBody::new(
            media_type,
            content_length,
            Box::new(CacheWritingSource {
                source: body.into_source(),
                writer: Some(writer),
            }),
        ))
        .build()
}

struct CacheWritingSource {
    source: Box<dyn Read + Send>,
    writer: Option<Box<dyn CacheWriter>>,
}

impl Read for CacheWritingSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.source.read(buf) {
            Ok(0) => {
                if let Some(mut writer) = self.writer.take() {
                    writer.commit();
                }
                Ok(0)
            }
            Ok(n) => {
                if let Some(ref mut writer) = self.writer {
                    if writer.write(&buf[..n]).is_err() {
                        // The store failed; stop copying, keep serving.
                        if let Some(mut writer) = self.writer.take() {
                            writer.abort();
                        }
                    }
                }
                Ok(n)
            }
            Err(e) => {
                if let Some(mut writer) = self.writer.take() {
                    writer.abort();
                }
                Err(e)
            }
        }
    }
}

impl Drop for CacheWritingSource {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            writer.abort();
        }
    }
}

/// Merges cached headers with those of a `304 Not Modified`, RFC 7234
/// §4.3.4: the network's end-to-end headers replace the cached ones,
/// except the content-specific trio which describe the stored body.
fn combine_headers(cached: &Headers, network: &Headers) -> Headers {
    let mut builder = Headers::builder();
    for (name, value) in cached.iter() {
        if name.eq_ignore_ascii_case("Warning") && value.starts_with('1') {
            // 1xx warnings describe the stale copy being replaced.
            continue;
        }
        if is_content_specific(name) || !is_end_to_end(name) || network.get(name).is_none() {
            builder = builder.add(name, value);
        }
    }
    for (name, value) in network.iter() {
        if !is_content_specific(name) && is_end_to_end(name) {
            builder = builder.add(name, value);
        }
    }
    builder.build()
}

fn is_end_to_end(name: &str) -> bool {
    ![
        "Connection",
        "Keep-Alive",
        "Proxy-Authenticate",
        "Proxy-Authorization",
        "TE",
        "Trailers",
        "Transfer-Encoding",
        "Upgrade",
    ]
    .iter()
    .any(|hop| name.eq_ignore_ascii_case(hop))
}

fn is_content_specific(name: &str) -> bool {
    name.eq_ignore_ascii_case("Content-Length")
        || name.eq_ignore_ascii_case("Content-Encoding")
        || name.eq_ignore_ascii_case("Content-Type")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Protocol;

    fn request(url: &str) -> Request {
        Request::builder().url(url).unwrap().build().unwrap()
    }

    fn cached_response(headers: &[(&str, &str)], sent: i64, received: i64) -> Response {
        let mut builder = Response::builder()
            .request(request("http://h/a"))
            .protocol(Protocol::Http11)
            .code(200)
            .message("OK")
            .sent_request_at_millis(sent)
            .received_response_at_millis(received);
        for (name, value) in headers {
            builder = builder.add_header(name, value);
        }
        builder.build()
    }

    #[test]
    fn no_cached_response_goes_to_network() {
        let strategy = CacheStrategy::compute(0, &request("http://h/a"), None);
        assert!(strategy.network_request().is_some());
        assert!(strategy.cache_response().is_none());
    }

    #[test]
    fn fresh_max_age_served_from_cache() {
        let now = 1_000_000;
        let cached = cached_response(&[("Cache-Control", "max-age=60")], now - 1000, now - 1000);
        let strategy = CacheStrategy::compute(now, &request("http://h/a"), Some(cached));
        assert!(strategy.network_request().is_none());
        assert!(strategy.cache_response().is_some());
    }

    #[test]
    fn expired_max_age_revalidates_with_etag() {
        let now = 1_000_000_000;
        let cached = cached_response(
            &[("Cache-Control", "max-age=1"), ("ETag", "\"v1\"")],
            now - 10_000,
            now - 10_000,
        );
        let strategy = CacheStrategy::compute(now, &request("http://h/a"), Some(cached));
        let conditional = strategy.network_request().unwrap();
        assert_eq!(conditional.header("If-None-Match"), Some("\"v1\""));
        assert!(strategy.cache_response().is_some());
    }

    #[test]
    fn request_no_cache_skips_the_cache() {
        let now = 1_000_000;
        let cached = cached_response(&[("Cache-Control", "max-age=600")], now - 1000, now - 1000);
        let request = Request::builder()
            .url("http://h/a")
            .unwrap()
            .header("Cache-Control", "no-cache")
            .build()
            .unwrap();
        let strategy = CacheStrategy::compute(now, &request, Some(cached));
        assert!(strategy.network_request().is_some());
        assert!(strategy.cache_response().is_none());
    }

    #[test]
    fn only_if_cached_miss_yields_neither() {
        let request = Request::builder()
            .url("http://h/a")
            .unwrap()
            .header("Cache-Control", "only-if-cached")
            .build()
            .unwrap();
        let strategy = CacheStrategy::compute(0, &request, None);
        assert!(strategy.network_request().is_none());
        assert!(strategy.cache_response().is_none());
    }

    #[test]
    fn no_store_is_not_cacheable() {
        let cached = cached_response(&[("Cache-Control", "no-store")], 0, 0);
        assert!(!CacheStrategy::is_cacheable(&cached, &request("http://h/a")));
    }

    #[test]
    fn vary_star_is_not_cacheable() {
        let cached = cached_response(&[("Vary", "*")], 0, 0);
        assert!(!CacheStrategy::is_cacheable(&cached, &request("http://h/a")));
        let cached = cached_response(&[("Vary", "Accept-Encoding")], 0, 0);
        assert!(CacheStrategy::is_cacheable(&cached, &request("http://h/a")));
    }

    #[test]
    fn redirect_needs_explicit_freshness() {
        let mut cached = Response::builder()
            .request(request("http://h/a"))
            .protocol(Protocol::Http11)
            .code(302)
            .build();
        assert!(!CacheStrategy::is_cacheable(&cached, &request("http://h/a")));

        cached = Response::builder()
            .request(request("http://h/a"))
            .protocol(Protocol::Http11)
            .code(302)
            .header("Cache-Control", "max-age=60")
            .build();
        assert!(CacheStrategy::is_cacheable(&cached, &request("http://h/a")));
    }

    #[test]
    fn stale_cache_gains_a_warning() {
        let now = 1_000_000_000;
        // Fresh for 10 seconds, 100 seconds old, max-stale riding over it.
        let cached = cached_response(
            &[("Cache-Control", "max-age=10")],
            now - 100_000,
            now - 100_000,
        );
        let request = Request::builder()
            .url("http://h/a")
            .unwrap()
            .header("Cache-Control", "max-stale=600")
            .build()
            .unwrap();
        let strategy = CacheStrategy::compute(now, &request, Some(cached));
        let served = strategy.cache_response().unwrap();
        assert!(served
            .headers()
            .values("Warning")
            .iter()
            .any(|w| w.starts_with("110")));
    }

    #[test]
    fn combine_prefers_network_end_to_end_headers() {
        let cached = Headers::of(&[
            ("Content-Type", "text/plain"),
            ("ETag", "\"v1\""),
            ("Warning", "113 - \"Heuristic expiration\""),
        ]);
        let network = Headers::of(&[("ETag", "\"v2\""), ("Transfer-Encoding", "chunked")]);
        let combined = combine_headers(&cached, &network);
        assert_eq!(combined.get("Content-Type"), Some("text/plain"));
        assert_eq!(combined.get("ETag"), Some("\"v2\""));
        assert_eq!(combined.get("Warning"), None);
        assert_eq!(combined.get("Transfer-Encoding"), None);
    }
}
