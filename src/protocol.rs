//! Application protocols negotiated over a connection.
use std::fmt;
use std::str::FromStr;

/// An application protocol, as identified in ALPN.
///
/// The client offers its configured protocols in order; the connection
/// adopts the server's selection.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Protocol {
    /// An obsolete plaintext framing; never offered, but servers may still
    /// answer with it.
    Http10,
    /// The classic framing: one exchange at a time per connection.
    Http11,
    /// Binary framing multiplexing concurrent exchanges over one connection.
    H2,
}

impl Protocol {
    /// The ALPN protocol identifier, e.g. `"h2"`.
    pub fn alpn_id(&self) -> &'static str {
        match *self {
            Protocol::Http10 => "http/1.0",
            Protocol::Http11 => "http/1.1",
            Protocol::H2 => "h2",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.alpn_id())
    }
}

impl FromStr for Protocol {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Protocol, crate::Error> {
        match s {
            "http/1.0" => Ok(Protocol::Http10),
            "http/1.1" => Ok(Protocol::Http11),
            "h2" => Ok(Protocol::H2),
            _ => Err(crate::Error::new_protocol(format!(
                "unexpected protocol {:?}",
                s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Protocol;

    #[test]
    fn alpn_ids_round_trip() {
        for p in [Protocol::Http10, Protocol::Http11, Protocol::H2] {
            assert_eq!(p.alpn_id().parse::<Protocol>().unwrap(), p);
        }
    }
}
