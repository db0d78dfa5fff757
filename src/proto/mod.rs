//! Wire protocol codecs: HTTP/1.1 framing and the HTTP/2 session layer.

pub(crate) mod h1;
pub(crate) mod h2;
