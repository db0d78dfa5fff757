#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! # courier
//!
//! courier is a correct and ergonomic HTTP client for Rust.
//!
//! ## Features
//!
//! - HTTP/1.1 and HTTP/2, negotiated over ALPN
//! - Connection pooling with keep-alive and HTTP/2 multiplexing
//! - Transparent gzip, redirects, retries, and RFC 7234 caching
//! - HTTP and SOCKS proxies
//! - A pluggable interceptor pipeline
//!
//! A [`Client`] is cheap to share and holds the connection pool and
//! dispatcher. Build a [`Request`], obtain a [`Call`], and either
//! [`execute`](Call::execute) it on the current thread or
//! [`enqueue`](Call::enqueue) it on the dispatcher:
//!
//! ```no_run
//! use courier::{Client, Request};
//!
//! # fn run() -> courier::Result<()> {
//! let client = Client::new();
//! let request = Request::builder().url("http://httpbin.org/get")?.build()?;
//! let response = client.call(request).execute()?;
//! println!("{}", response.body().string()?);
//! # Ok(())
//! # }
//! ```
//!
//! Most behavior is configured on [`ClientBuilder`]; pieces with an
//! environment dependency (DNS, TLS, cookies, the cache) are injected as
//! trait objects and default to reasonable built-ins.

pub use crate::body::{ByteBody, RequestBody, ResponseBody};
pub use crate::cache_control::CacheControl;
pub use crate::client::{Call, Callback, Client, ClientBuilder};
pub use crate::error::{Error, Result};
pub use crate::headers::{Headers, HeadersBuilder};
pub use crate::media_type::MediaType;
pub use crate::method::Method;
pub use crate::multipart::MultipartBody;
pub use crate::protocol::Protocol;
pub use crate::request::{Request, RequestBuilder};
pub use crate::response::{Response, ResponseBuilder};
pub use crate::url::{HttpUrl, UrlBuilder};

pub mod body;
pub mod cache_control;
pub mod client;
pub mod connect;
pub mod cookie;
pub mod headers;
pub mod interceptor;
pub mod media_type;
pub mod multipart;
pub mod request;
pub mod response;
pub mod tls;
pub mod url;

mod error;
mod exchange;
mod http_date;
mod method;
mod proto;
mod protocol;
