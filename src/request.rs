//! An HTTP request.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::body::RequestBody;
use crate::cache_control::CacheControl;
use crate::error::{Error, Result};
use crate::headers::{Headers, HeadersBuilder};
use crate::method::Method;
use crate::url::HttpUrl;

type TagMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// An HTTP request. Instances are immutable; derive variants with
/// [`new_builder`](Request::new_builder).
#[derive(Clone)]
pub struct Request {
    url: HttpUrl,
    method: Method,
    headers: Headers,
    body: Option<Arc<dyn RequestBody>>,
    tags: Arc<TagMap>,
}

impl Request {
    /// Returns a new builder.
    pub fn builder() -> RequestBuilder {
        RequestBuilder {
            url: None,
            method: None,
            headers: Headers::builder(),
            body: None,
            tags: TagMap::new(),
        }
    }

    /// The request URL.
    pub fn url(&self) -> &HttpUrl {
        &self.url
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The last header value for `name`, or `None`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// The request body, if any.
    pub fn body(&self) -> Option<&Arc<dyn RequestBody>> {
        self.body.as_ref()
    }

    /// The tag attached with type `T`, or `None`.
    ///
    /// Tags are a type-keyed side channel: interceptors and listeners can
    /// recover values the caller attached without coordination over names.
    pub fn tag<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.tags
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// The cache directives of this request.
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::parse(&self.headers)
    }

    /// Whether the URL scheme is `https`.
    pub fn is_https(&self) -> bool {
        self.url.is_https()
    }

    /// Returns a builder carrying this request's data.
    pub fn new_builder(&self) -> RequestBuilder {
        RequestBuilder {
            url: Some(self.url.clone()),
            method: Some(self.method.clone()),
            headers: self.headers.new_builder(),
            body: self.body.clone(),
            tags: (*self.tags).clone(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .finish()
    }
}

/// Builds a [`Request`].
pub struct RequestBuilder {
    url: Option<HttpUrl>,
    method: Option<Method>,
    headers: HeadersBuilder,
    body: Option<Arc<dyn RequestBody>>,
    tags: TagMap,
}

impl RequestBuilder {
    /// Sets the URL target, parsing `url`.
    pub fn url(mut self, url: &str) -> Result<RequestBuilder> {
        self.url = Some(HttpUrl::parse(url)?);
        Ok(self)
    }

    /// Sets the URL target.
    pub fn http_url(mut self, url: HttpUrl) -> RequestBuilder {
        self.url = Some(url);
        self
    }

    /// Sets the method. When never called, the method defaults to GET
    /// without a body and POST with one.
    pub fn method(mut self, method: Method) -> RequestBuilder {
        self.method = Some(method);
        self
    }

    /// Sets the request body.
    pub fn body(mut self, body: impl RequestBody + 'static) -> RequestBuilder {
        self.body = Some(Arc::new(body));
        self
    }

    pub(crate) fn body_arc(mut self, body: Option<Arc<dyn RequestBody>>) -> RequestBuilder {
        self.body = body;
        self
    }

    /// Shorthand for `method(Method::Get)`.
    pub fn get(self) -> RequestBuilder {
        self.method(Method::Get)
    }

    /// Shorthand for `method(Method::Head)`.
    pub fn head(self) -> RequestBuilder {
        self.method(Method::Head)
    }

    /// Shorthand for `method(Method::Post)` with `body`.
    pub fn post(self, body: impl RequestBody + 'static) -> RequestBuilder {
        self.method(Method::Post).body(body)
    }

    /// Shorthand for `method(Method::Put)` with `body`.
    pub fn put(self, body: impl RequestBody + 'static) -> RequestBuilder {
        self.method(Method::Put).body(body)
    }

    /// Shorthand for `method(Method::Patch)` with `body`.
    pub fn patch(self, body: impl RequestBody + 'static) -> RequestBuilder {
        self.method(Method::Patch).body(body)
    }

    /// Shorthand for `method(Method::Delete)`, without a body.
    pub fn delete(self) -> RequestBuilder {
        self.method(Method::Delete)
    }

    /// Shorthand for `method(Method::Query)` with `body`.
    pub fn query(self, body: impl RequestBody + 'static) -> RequestBuilder {
        self.method(Method::Query).body(body)
    }

    /// Sets a header, replacing any prior values for its name.
    pub fn header(mut self, name: &str, value: &str) -> RequestBuilder {
        self.headers = self.headers.set(name, value);
        self
    }

    /// Adds a header without removing prior values for its name.
    pub fn add_header(mut self, name: &str, value: &str) -> RequestBuilder {
        self.headers = self.headers.add(name, value);
        self
    }

    /// Removes every header named `name`.
    pub fn remove_header(mut self, name: &str) -> RequestBuilder {
        self.headers = self.headers.remove_all(name);
        self
    }

    /// Replaces all headers.
    pub fn headers(mut self, headers: Headers) -> RequestBuilder {
        self.headers = headers.new_builder();
        self
    }

    /// Sets this request's `Cache-Control` header, replacing any present.
    /// An empty directive set removes the header.
    pub fn cache_control(self, cache_control: &CacheControl) -> RequestBuilder {
        let value = cache_control.to_string();
        if value.is_empty() {
            self.remove_header("Cache-Control")
        } else {
            self.header("Cache-Control", &value)
        }
    }

    /// Attaches `tag` keyed by its type, replacing any prior tag of the
    /// same type.
    pub fn tag<T: Any + Send + Sync>(mut self, tag: T) -> RequestBuilder {
        self.tags.insert(TypeId::of::<T>(), Arc::new(tag));
        self
    }

    /// Builds the request.
    ///
    /// Fails when no URL was set, or when the method and body disagree:
    /// GET and HEAD forbid bodies; POST, PUT, PATCH, and QUERY require
    /// them.
    pub fn build(self) -> Result<Request> {
        let url = self
            .url
            .ok_or_else(|| Error::new_invalid_url("url == null"))?;
        let method = match self.method {
            Some(method) => method,
            None if self.body.is_some() => Method::Post,
            None => Method::Get,
        };
        if self.body.is_some() && !method.permits_request_body() {
            return Err(Error::new_protocol(format!(
                "method {} must not have a request body",
                method
            )));
        }
        if self.body.is_none() && method.requires_request_body() {
            return Err(Error::new_protocol(format!(
                "method {} must have a request body",
                method
            )));
        }
        Ok(Request {
            url,
            method,
            headers: self.headers.build(),
            body: self.body,
            tags: Arc::new(self.tags),
        })
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestBuilder")
            .field("method", &self.method)
            .field("url", &self.url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::ByteBody;

    #[test]
    fn default_method_tracks_body() {
        let request = Request::builder().url("http://h/").unwrap().build().unwrap();
        assert_eq!(request.method(), &Method::Get);

        let request = Request::builder()
            .url("http://h/")
            .unwrap()
            .body(ByteBody::new(&b"x"[..], None))
            .build()
            .unwrap();
        assert_eq!(request.method(), &Method::Post);
    }

    #[test]
    fn get_with_body_rejected() {
        let result = Request::builder()
            .url("http://h/")
            .unwrap()
            .get()
            .body(ByteBody::new(&b"x"[..], None))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn post_without_body_rejected() {
        let result = Request::builder()
            .url("http://h/")
            .unwrap()
            .method(Method::Post)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn delete_body_is_optional() {
        assert!(Request::builder()
            .url("http://h/")
            .unwrap()
            .delete()
            .build()
            .is_ok());
    }

    #[test]
    fn rebuild_preserves_request() {
        let request = Request::builder()
            .url("http://h/a?b=c")
            .unwrap()
            .header("X-One", "1")
            .tag(42u64)
            .build()
            .unwrap();
        let copy = request.new_builder().build().unwrap();
        assert_eq!(copy.url(), request.url());
        assert_eq!(copy.method(), request.method());
        assert_eq!(copy.headers(), request.headers());
        assert_eq!(copy.tag::<u64>(), Some(&42));
    }

    #[test]
    fn tags_are_type_keyed() {
        #[derive(Debug, PartialEq)]
        struct TraceId(&'static str);

        let request = Request::builder()
            .url("http://h/")
            .unwrap()
            .tag(TraceId("abc"))
            .tag(7i32)
            .build()
            .unwrap();
        assert_eq!(request.tag::<TraceId>(), Some(&TraceId("abc")));
        assert_eq!(request.tag::<i32>(), Some(&7));
        assert_eq!(request.tag::<u8>(), None);
    }
}
