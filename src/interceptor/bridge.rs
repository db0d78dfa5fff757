//! Bridges the application request to a network request: default
//! headers on the way out, cookies and transparent gzip on the way back.

use std::sync::Arc;

use flate2::read::GzDecoder;

use crate::body::ResponseBody;
use crate::cookie::{Cookie, CookieJar};
use crate::error::Result;
use crate::interceptor::{Chain, Interceptor};
use crate::media_type::MediaType;
use crate::response::Response;

pub(crate) struct BridgeHeaders {
    cookie_jar: Arc<dyn CookieJar>,
}

impl BridgeHeaders {
    pub(crate) fn new(cookie_jar: Arc<dyn CookieJar>) -> BridgeHeaders {
        BridgeHeaders { cookie_jar }
    }
}

impl Interceptor for BridgeHeaders {
    fn intercept(&self, chain: &mut Chain<'_>) -> Result<Response> {
        let user_request = chain.request().clone();
        let url = user_request.url().clone();
        let mut builder = user_request.new_builder();

        if let Some(body) = user_request.body() {
            if let Some(content_type) = body.content_type() {
                if user_request.header("Content-Type").is_none() {
                    builder = builder.header("Content-Type", &content_type.to_string());
                }
            }
            let content_length = body.content_length();
            if content_length != -1 {
                builder = builder
                    .header(
                        "Content-Length",
                        itoa::Buffer::new().format(content_length),
                    )
                    .remove_header("Transfer-Encoding");
            } else {
                builder = builder
                    .header("Transfer-Encoding", "chunked")
                    .remove_header("Content-Length");
            }
        }

        if user_request.header("Host").is_none() {
            builder = builder.header("Host", &url.host_header());
        }
        if user_request.header("Connection").is_none() {
            builder = builder.header("Connection", "Keep-Alive");
        }

        // When we add Accept-Encoding ourselves we also own undoing the
        // compression. A user Range request must see raw bytes.
        let mut transparent_gzip = false;
        if user_request.header("Accept-Encoding").is_none()
            && user_request.header("Range").is_none()
        {
            transparent_gzip = true;
            builder = builder.header("Accept-Encoding", "gzip");
        }

        let cookies = self.cookie_jar.load_for_request(&url);
        if !cookies.is_empty() {
            builder = builder.header("Cookie", &cookie_header(&cookies));
        }

        if user_request.header("User-Agent").is_none() {
            builder = builder.header("User-Agent", crate::client::USER_AGENT);
        }

        let network_response = chain.proceed(builder.build()?)?;

        let received = Cookie::parse_all(&url, network_response.headers());
        if !received.is_empty() {
            self.cookie_jar.save_from_response(&url, received);
        }

        let gunzip = transparent_gzip
            && network_response
                .header("Content-Encoding")
                .map(|v| v.eq_ignore_ascii_case("gzip"))
                .unwrap_or(false)
            && network_response.promises_body();

        let mut response_builder = network_response.new_builder().request(user_request);
        if gunzip {
            let media_type = response_builder
                .peek_header("Content-Type")
                .and_then(|ct| MediaType::parse(&ct).ok());
            let body = response_builder
                .take_body()
                .unwrap_or_else(ResponseBody::empty);
            response_builder = response_builder
                .remove_header("Content-Encoding")
                .remove_header("Content-Length")
                .body(ResponseBody::new(
                    media_type,
                    -1,
                    Box::new(GzDecoder::new(body.into_source())),
                ));
        }
        Ok(response_builder.build())
    }
}

fn cookie_header(cookies: &[Cookie]) -> String {
    let mut header = String::new();
    for (i, cookie) in cookies.iter().enumerate() {
        if i > 0 {
            header.push_str("; ");
        }
        header.push_str(cookie.name());
        header.push('=');
        header.push_str(cookie.value());
    }
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::HttpUrl;

    #[test]
    fn cookie_header_joins_pairs() {
        let url = HttpUrl::parse("https://example.com/").unwrap();
        let cookies = vec![
            Cookie::parse(&url, "a=1").unwrap(),
            Cookie::parse(&url, "b=2").unwrap(),
        ];
        assert_eq!(cookie_header(&cookies), "a=1; b=2");
    }
}
