//! Recovery from failures and construction of follow-up requests.

use std::io::Read;

use log::debug;

use crate::client::Client;
use crate::error::{Error, Result};
use crate::interceptor::{Chain, Interceptor};
use crate::method::Method;
use crate::proto::h2::frame::ErrorCode;
use crate::request::Request;
use crate::response::Response;
use crate::url::HttpUrl;

/// How many follow-ups (redirects, auth challenges, retries) to attempt
/// before giving up. Chrome follows 21; Firefox, curl, and wget follow
/// 20.
const MAX_FOLLOW_UPS: u32 = 20;

/// How much of an abandoned response body to drain in hope of reusing
/// the connection.
const MAX_DISCARD_BYTES: u64 = 64 * 1024;

/// Recovers from connection-level failures by trying another route, and
/// follows redirects and authentication challenges, within a bounded
/// number of attempts.
pub(crate) struct RetryAndFollowUp {
    client: Client,
}

impl RetryAndFollowUp {
    pub(crate) fn new(client: Client) -> RetryAndFollowUp {
        RetryAndFollowUp { client }
    }

    /// Whether the failed attempt may be retried on another route.
    fn recover(&self, error: &Error, chain: &Chain<'_>, request: &Request) -> bool {
        if !self.client.retry_on_connection_failure() {
            return false;
        }
        // A body that can only be sent once disqualifies the request when
        // any of it may already be on the wire.
        if error.request_sent()
            && request.body().map(|b| b.is_one_shot()).unwrap_or(false)
        {
            return false;
        }
        let refused_stream = error
            .stream_reset_code()
            .map(|code| code == ErrorCode::RefusedStream)
            .unwrap_or(false);
        let failure_is_route_scoped = error.is_connect()
            || error.is_unknown_host()
            || refused_stream
            || (error.is_timeout() && !error.request_sent())
            || error.is_io();
        if !failure_is_route_scoped {
            return false;
        }
        if refused_stream {
            // The route is fine; the connection refused the stream. Dial
            // the same route again rather than advancing past it.
            chain.call().inner.plan_retry_on_current_route();
        }
        chain.call().inner.retry_after_failure()
    }

    /// The request to attempt next, or `None` when `response` is final.
    fn follow_up_request(&self, response: &Response, chain: &Chain<'_>) -> Result<Option<Request>> {
        let route = chain.call().inner.current_route();
        match response.code() {
            401 => Ok(self
                .client
                .authenticator()
                .authenticate(route.as_ref(), response)),
            407 => Ok(self
                .client
                .proxy_authenticator()
                .authenticate(route.as_ref(), response)),
            300 | 301 | 302 | 303 | 307 | 308 => self.build_redirect_request(response),
            408 => {
                // The server asked us to try again.
                if !self.client.retry_on_connection_failure() {
                    return Ok(None);
                }
                let request = response.request();
                if request.body().map(|b| b.is_one_shot()).unwrap_or(false) {
                    return Ok(None);
                }
                if response.prior_response().map(Response::code) == Some(408) {
                    return Ok(None);
                }
                if retry_after_seconds(response).unwrap_or(0) > 0 {
                    return Ok(None);
                }
                Ok(Some(request.new_builder().build()?))
            }
            503 => {
                if response.prior_response().map(Response::code) == Some(503) {
                    return Ok(None);
                }
                if retry_after_seconds(response) == Some(0) {
                    return Ok(Some(response.request().new_builder().build()?));
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn build_redirect_request(&self, response: &Response) -> Result<Option<Request>> {
        if !self.client.follow_redirects() {
            return Ok(None);
        }
        let location = match response.header("Location") {
            Some(location) => location,
            None => return Ok(None),
        };
        let url = match response.request().url().resolve(location) {
            Ok(url) => url,
            Err(_) => return Ok(None),
        };
        if url.scheme() != response.request().url().scheme()
            && !self.client.follow_ssl_redirects()
        {
            return Ok(None);
        }

        let mut builder = response.request().new_builder();
        let method = response.request().method().clone();
        let preserve_method = matches!(response.code(), 307 | 308);
        if !preserve_method && method.redirects_to_get() {
            builder = builder
                .method(Method::Get)
                .body_arc(None)
                .remove_header("Transfer-Encoding")
                .remove_header("Content-Length")
                .remove_header("Content-Type");
        }

        // When redirecting across origins, drop everything that might
        // leak credentials.
        if !same_origin(response.request().url(), &url) {
            builder = builder
                .remove_header("Authorization")
                .remove_header("Cookie")
                .remove_header("Proxy-Authorization");
        }

        Ok(Some(builder.http_url(url).build()?))
    }
}

impl Interceptor for RetryAndFollowUp {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let mut request = chain.request().clone();
        let mut prior_response: Option<Response> = None;
        let mut recovered_failures: Vec<Error> = Vec::new();
        let mut follow_up_count = 0u32;

        loop {
            chain.call().inner.enter_exchange_phase(&request);

            let response = match chain.proceed(request.clone()) {
                Ok(response) => response,
                Err(e) => {
                    if e.is_canceled() || !self.recover(&e, chain, &request) {
                        let mut e = e;
                        for suppressed in recovered_failures {
                            e.push_suppressed(suppressed);
                        }
                        return Err(e);
                    }
                    debug!("recovering from failure, trying next route: {}", e);
                    recovered_failures.push(e);
                    continue;
                }
            };

            let response = match prior_response.take() {
                Some(prior) => response
                    .new_builder()
                    .prior_response(Some(prior.strip_body()))
                    .build(),
                None => response,
            };

            let follow_up = match self.follow_up_request(&response, chain)? {
                Some(follow_up) => follow_up,
                None => return Ok(response),
            };
            if follow_up
                .body()
                .map(|b| b.is_one_shot())
                .unwrap_or(false)
            {
                // Re-sending the body is impossible; surface what we got.
                return Ok(response);
            }

            discard_body(&response);

            follow_up_count += 1;
            if follow_up_count > MAX_FOLLOW_UPS {
                return Err(Error::new_too_many_redirects(follow_up_count));
            }

            debug!("following up with {} {}", follow_up.method(), follow_up.url());
            request = follow_up;
            prior_response = Some(response);
        }
    }
}

/// Drains a bounded amount of an unwanted body so its connection can go
/// back to the pool.
fn discard_body(response: &Response) {
    let mut reader = response.body().byte_stream().take(MAX_DISCARD_BYTES);
    let mut sink = [0u8; 8 * 1024];
    while matches!(reader.read(&mut sink), Ok(n) if n > 0) {}
}

fn same_origin(a: &HttpUrl, b: &HttpUrl) -> bool {
    a.scheme() == b.scheme() && a.host() == b.host() && a.port() == b.port()
}

fn retry_after_seconds(response: &Response) -> Option<u64> {
    let value = response.header("Retry-After")?;
    if value.bytes().all(|b| b.is_ascii_digit()) {
        value.parse().ok()
    } else {
        None
    }
}
