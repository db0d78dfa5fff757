//! The DNS capability port.

use std::fmt;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};

use log::debug;

/// Resolves hostnames to IP addresses.
///
/// Implementations must return at least one address or fail; an empty
/// result is treated as an unknown host by the route planner.
pub trait Dns: Send + Sync + fmt::Debug {
    /// Resolves `hostname` into a set of IP addresses, in preference
    /// order.
    fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>>;
}

/// Resolution using the operating system's `getaddrinfo`.
#[derive(Clone, Debug, Default)]
pub struct SystemDns;

impl Dns for SystemDns {
    fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>> {
        debug!("resolve {:?}", hostname);
        // ToSocketAddrs needs a port; it does not affect the lookup.
        let addresses = (hostname, 0u16).to_socket_addrs()?;
        Ok(addresses.map(|sa| sa.ip()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_literals_resolve_without_dns() {
        let addresses = SystemDns.lookup("127.0.0.1").unwrap();
        assert_eq!(addresses, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);

        let addresses = SystemDns.lookup("::1").unwrap();
        assert_eq!(addresses, vec!["::1".parse::<IpAddr>().unwrap()]);
    }
}
