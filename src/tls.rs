//! Byte-stream transports and the TLS capability ports.
//!
//! The core dials plaintext TCP through a [`SocketFactory`] and upgrades it
//! through a [`SecureSocketFactory`]; the TLS stack itself lives behind
//! that port. A [`Transport`] takes `&self` for reads and writes so one
//! connection can be read by its reader thread while another thread
//! writes, the way a socket works.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::protocol::Protocol;

/// A full-duplex byte stream.
///
/// Reads and writes may block and may time out per the configured
/// timeouts. Implementations must support one thread reading concurrently
/// with another writing, and [`shutdown`](Transport::shutdown) from any
/// thread to wake both.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Reads into `buf`, blocking until some bytes arrive, EOF, or the
    /// read timeout fires.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes from `buf`, returning how many bytes were accepted.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Flushes buffered writes to the peer.
    fn flush(&self) -> io::Result<()>;

    /// Sets the timeout for subsequent reads. `None` blocks indefinitely.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Sets the timeout for subsequent writes. `None` blocks indefinitely.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Closes both directions. Blocked reads and writes fail promptly.
    fn shutdown(&self);
}

impl Transport for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn flush(&self) -> io::Result<()> {
        Write::flush(&mut &*self)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn shutdown(&self) {
        let _ = TcpStream::shutdown(self, Shutdown::Both);
    }
}

/// `std::io::Read` over a shared transport.
pub(crate) struct TransportReader {
    transport: Arc<dyn Transport>,
}

impl TransportReader {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> TransportReader {
        TransportReader { transport }
    }
}

impl Read for TransportReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.transport.read(buf)
    }
}

impl fmt::Debug for TransportReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("TransportReader")
    }
}

/// `std::io::Write` over a shared transport.
pub(crate) struct TransportWriter {
    transport: Arc<dyn Transport>,
}

impl TransportWriter {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> TransportWriter {
        TransportWriter { transport }
    }
}

impl Write for TransportWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.transport.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.transport.flush()
    }
}

impl fmt::Debug for TransportWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("TransportWriter")
    }
}

/// Dials plaintext TCP connections.
pub trait SocketFactory: Send + Sync + fmt::Debug {
    /// Connects to `address`, bounding the dial by `timeout` when given.
    fn connect(
        &self,
        address: SocketAddr,
        timeout: Option<Duration>,
    ) -> io::Result<Box<dyn Transport>>;
}

/// Dials with `TcpStream` and disables Nagle's algorithm.
#[derive(Debug, Default)]
pub struct DefaultSocketFactory;

impl SocketFactory for DefaultSocketFactory {
    fn connect(
        &self,
        address: SocketAddr,
        timeout: Option<Duration>,
    ) -> io::Result<Box<dyn Transport>> {
        let stream = match timeout {
            Some(timeout) => TcpStream::connect_timeout(&address, timeout)?,
            None => TcpStream::connect(address)?,
        };
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// A transport that has completed a TLS handshake.
pub trait SecureTransport: Transport {
    /// The protocol the server selected via ALPN, if any.
    fn negotiated_protocol(&self) -> Option<Protocol>;

    /// The negotiated TLS session parameters and certificates.
    fn handshake(&self) -> Handshake;
}

/// Upgrades a plaintext stream to TLS.
pub trait SecureSocketFactory: Send + Sync + fmt::Debug {
    /// Performs a TLS handshake over `raw` for `host:port`, offering
    /// `protocols` in order via ALPN. `raw` is shared: the caller keeps a
    /// handle only to shut it down on cancellation.
    fn upgrade(
        &self,
        raw: Arc<dyn Transport>,
        host: &str,
        port: u16,
        protocols: &[Protocol],
    ) -> io::Result<Box<dyn SecureTransport>>;
}

/// A record of a TLS handshake.
#[derive(Clone, Debug)]
pub struct Handshake {
    /// The TLS version, e.g. `"TLSv1.3"`.
    pub tls_version: String,
    /// The negotiated cipher suite.
    pub cipher_suite: String,
    /// The certificates the peer presented, leaf first.
    pub peer_certificates: Vec<PeerCertificate>,
    /// The certificates this client presented, if any.
    pub local_certificates: Vec<PeerCertificate>,
}

/// A certificate presented during the handshake, reduced to what the core
/// needs: its identity names and raw encoding.
#[derive(Clone, Debug)]
pub struct PeerCertificate {
    /// The subject distinguished name.
    pub subject: String,
    /// DNS names from subjectAltName. May carry a leading wildcard label.
    pub dns_names: Vec<String>,
    /// The DER encoding.
    pub der: Bytes,
}

impl PeerCertificate {
    /// Whether this certificate covers `host`, honoring a single leading
    /// wildcard label.
    pub fn matches_hostname(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.dns_names
            .iter()
            .any(|pattern| hostname_matches(&pattern.to_ascii_lowercase(), &host))
    }
}

fn hostname_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        // The wildcard spans exactly one label.
        match host.strip_suffix(suffix) {
            Some(prefix) => {
                !prefix.is_empty() && prefix.ends_with('.') && !prefix[..prefix.len() - 1].contains('.')
            }
            None => false,
        }
    } else {
        pattern == host
    }
}

/// Decides whether the peer's certificates are acceptable for a hostname.
pub trait HostnameVerifier: Send + Sync + fmt::Debug {
    /// Whether `handshake` authenticates `host`.
    fn verify(&self, host: &str, handshake: &Handshake) -> bool;
}

/// Accepts a handshake whose leaf certificate covers the hostname.
#[derive(Debug, Default)]
pub struct DefaultHostnameVerifier;

impl HostnameVerifier for DefaultHostnameVerifier {
    fn verify(&self, host: &str, handshake: &Handshake) -> bool {
        handshake
            .peer_certificates
            .first()
            .map(|cert| cert.matches_hostname(host))
            .unwrap_or(false)
    }
}

/// Constrains which certificates are trusted for particular hosts, beyond
/// what the TLS stack already verified.
pub trait CertificatePinner: Send + Sync + fmt::Debug {
    /// Confirms that `peer_certificates` satisfies the pins for `host`.
    /// A pin failure is fatal for the call; it is never retried.
    fn check(&self, host: &str, peer_certificates: &[PeerCertificate]) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(names: &[&str]) -> PeerCertificate {
        PeerCertificate {
            subject: "CN=test".to_owned(),
            dns_names: names.iter().map(|n| n.to_string()).collect(),
            der: Bytes::new(),
        }
    }

    #[test]
    fn exact_hostname_match() {
        assert!(cert(&["example.com"]).matches_hostname("EXAMPLE.com"));
        assert!(!cert(&["example.com"]).matches_hostname("other.com"));
    }

    #[test]
    fn wildcard_spans_one_label() {
        let c = cert(&["*.example.com"]);
        assert!(c.matches_hostname("a.example.com"));
        assert!(!c.matches_hostname("example.com"));
        assert!(!c.matches_hostname("a.b.example.com"));
    }
}
