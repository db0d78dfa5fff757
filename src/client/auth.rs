//! The authenticator capability port.

use std::fmt;

use crate::connect::Route;
use crate::request::Request;
use crate::response::Response;

/// Reacts to `401 Unauthorized` and `407 Proxy Authentication Required`
/// by producing a request with credentials attached, or `None` to give
/// up.
///
/// Implementations should check whether the failed request already
/// carried credentials; returning the same credentials again loops until
/// the follow-up cap trips.
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Returns a request including credentials satisfying the challenge
    /// in `response`, or `None` when the challenge cannot be satisfied.
    fn authenticate(&self, route: Option<&Route>, response: &Response) -> Option<Request>;
}

/// An authenticator that knows no credentials and gives up immediately.
#[derive(Debug, Default)]
pub struct NoAuthentication;

impl Authenticator for NoAuthentication {
    fn authenticate(&self, _route: Option<&Route>, _response: &Response) -> Option<Request> {
        None
    }
}
