//! A live connection to an origin: socket, optional tunnel and TLS, and
//! the protocol codec driving it.

use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::client::call::CallInner;
use crate::client::events::EventListener;
use crate::client::Call;
use crate::error::{Error, Result};
use crate::exchange::ExchangeCodec;
use crate::method::Method;
use crate::proto::h1::{Http1Codec, Http1ExchangeCodec};
use crate::proto::h2::conn::Http2Connection;
use crate::proto::h2::Http2ExchangeCodec;
use crate::protocol::Protocol;
use crate::request::Request;
use crate::tls::{Handshake, Transport, TransportWriter};

use super::{Address, Proxy, Route};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// How many CONNECT attempts to make through an authenticating proxy.
const MAX_TUNNEL_ATTEMPTS: usize = 21;

/// A socket bound to one route, running one codec. Connections are owned
/// by the pool and shared by the exchanges allocated on them.
pub struct Connection {
    id: u64,
    route: Route,
    transport: Arc<dyn Transport>,
    handshake: Option<Handshake>,
    protocol: Protocol,
    h1: Option<Arc<Http1Codec>>,
    h2: Option<Arc<Http2Connection>>,
    state: Mutex<ConnectionState>,
}

struct ConnectionState {
    /// Refuse new exchanges: the peer signalled close, or an allocation
    /// failed fatally.
    no_new_exchanges: bool,
    success_count: u64,
    refused_stream_count: u32,
    /// The calls currently holding an allocation here.
    calls: Vec<Weak<CallInner>>,
    idle_at: Instant,
}

pub(crate) enum IdleStats {
    InUse,
    Idle(Duration),
}

impl Connection {
    /// Dials `route` and brings the connection to the point where
    /// exchanges can run: SOCKS greeting, CONNECT tunnel, TLS with ALPN,
    /// and the HTTP/2 preface, each as the route demands.
    pub(crate) fn connect(
        route: Route,
        connect_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
        call: &Call,
        events: &Arc<dyn EventListener>,
    ) -> Result<Arc<Connection>> {
        let address = route.address().clone();
        events.connect_start(call, route.socket_address(), route.proxy());

        let result = Connection::connect_route(
            &route,
            &address,
            connect_timeout,
            read_timeout,
            write_timeout,
            call,
            events,
        );
        match result {
            Ok(connection) => {
                events.connect_end(
                    call,
                    route.socket_address(),
                    route.proxy(),
                    Some(connection.protocol),
                );
                Ok(connection)
            }
            Err(e) => {
                events.connect_failed(call, route.socket_address(), route.proxy(), &e);
                Err(e)
            }
        }
    }

    fn connect_route(
        route: &Route,
        address: &Arc<Address>,
        connect_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
        call: &Call,
        events: &Arc<dyn EventListener>,
    ) -> Result<Arc<Connection>> {
        let raw = address
            .socket_factory()
            .connect(route.socket_address(), connect_timeout)
            .map_err(Error::new_connect)?;
        let mut transport: Arc<dyn Transport> = Arc::from(raw);
        let _ = transport.set_read_timeout(read_timeout);
        let _ = transport.set_write_timeout(write_timeout);

        if let Proxy::Socks { .. } = route.proxy() {
            socks5_connect(&*transport, address.host(), address.port())
                .map_err(Error::new_connect)?;
        }

        let mut handshake = None;
        let mut protocol = Protocol::Http11;

        if let Some(ssl_factory) = address.ssl_socket_factory() {
            if route.requires_tunnel() {
                create_tunnel(&transport, route, address)?;
            }

            events.secure_connect_start(call);
            let secure = ssl_factory
                .upgrade(
                    transport.clone(),
                    address.host(),
                    address.port(),
                    address.protocols(),
                )
                .map_err(Error::new_connect)?;
            let session = secure.handshake();

            let verifier = address
                .hostname_verifier()
                .expect("https addresses carry a hostname verifier");
            if !verifier.verify(address.host(), &session) {
                return Err(Error::new_connect(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Hostname {} not verified", address.host()),
                )));
            }
            if let Some(pinner) = address.certificate_pinner() {
                pinner
                    .check(address.host(), &session.peer_certificates)
                    .map_err(Error::new_connect)?;
            }

            protocol = match secure.negotiated_protocol() {
                Some(protocol) => protocol,
                // No ALPN answer: acceptable only when http/1.1 was on
                // offer anyway.
                None if address.protocols().contains(&Protocol::Http11) => Protocol::Http11,
                None => {
                    return Err(Error::new_protocol(
                        "expected an ALPN protocol but the server selected none",
                    ))
                }
            };
            events.secure_connect_end(call, Some(&session));
            handshake = Some(session);
            let secure: Box<dyn Transport> = secure;
            transport = Arc::from(secure);
        }

        let (h1, h2) = match protocol {
            Protocol::H2 => {
                let name = format!("{}:{}", address.host(), address.port());
                let h2 = Http2Connection::start(transport.clone(), name)
                    .map_err(Error::new_connect)?;
                (None, Some(h2))
            }
            _ => {
                let absolute_targets =
                    matches!(route.proxy(), Proxy::Http { .. }) && !address.is_https();
                (
                    Some(Arc::new(Http1Codec::new(transport.clone(), absolute_targets))),
                    None,
                )
            }
        };

        let connection = Arc::new(Connection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            route: route.clone(),
            transport,
            handshake,
            protocol,
            h1,
            h2,
            state: Mutex::new(ConnectionState {
                no_new_exchanges: false,
                success_count: 0,
                refused_stream_count: 0,
                calls: Vec::new(),
                idle_at: Instant::now(),
            }),
        });
        debug!(
            "new connection {} to {:?} over {}",
            connection.id, route, protocol
        );
        Ok(connection)
    }

    /// An identifier for logs and event listeners.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The route this connection dialed.
    pub fn route(&self) -> &Route {
        &self.route
    }

    /// The negotiated application protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// The TLS handshake, or `None` for plaintext.
    pub fn handshake(&self) -> Option<&Handshake> {
        self.handshake.as_ref()
    }

    /// How many concurrent exchanges this connection can carry.
    fn allocation_limit(&self) -> usize {
        match self.h2 {
            Some(ref h2) => h2.max_concurrent_streams().min(u32::MAX) as usize,
            None => 1,
        }
    }

    pub(crate) fn is_multiplexed(&self) -> bool {
        self.h2.is_some()
    }

    /// Builds the codec for one exchange.
    pub(crate) fn new_codec(
        &self,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Box<dyn ExchangeCodec> {
        match (self.h1.as_ref(), self.h2.as_ref()) {
            (_, Some(h2)) => Box::new(Http2ExchangeCodec::new(
                h2.clone(),
                read_timeout,
                write_timeout,
            )),
            (Some(h1), _) => Box::new(Http1ExchangeCodec::new(
                h1.clone(),
                read_timeout,
                write_timeout,
            )),
            _ => unreachable!("connection has a codec"),
        }
    }

    /// Atomically checks eligibility for `address` and, when eligible,
    /// registers `call`'s allocation. Called under the pool lock.
    pub(crate) fn acquire_if_eligible(
        &self,
        address: &Address,
        routes: Option<&[Route]>,
        call: &Call,
        require_multiplexed: bool,
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.no_new_exchanges {
            return false;
        }
        if require_multiplexed && self.h2.is_none() {
            return false;
        }
        state.calls.retain(|weak| weak.strong_count() > 0);
        if state.calls.len() >= self.allocation_limit() {
            return false;
        }

        let matches = if self.route.address().as_ref() == address {
            true
        } else {
            self.is_coalescable(address, routes)
        };
        if !matches {
            return false;
        }

        state.calls.push(Arc::downgrade(&call.inner));
        true
    }

    /// HTTP/2 coalescing: an existing connection to another hostname may
    /// be shared when it dials the same endpoint directly and its
    /// certificate covers the requested host.
    fn is_coalescable(&self, address: &Address, routes: Option<&[Route]>) -> bool {
        if self.h2.is_none() {
            return false;
        }
        if !self.route.address().equals_non_host(address) {
            return false;
        }
        let routes_align = routes.map_or(false, |routes| {
            routes.iter().any(|candidate| {
                *candidate.proxy() == Proxy::Direct
                    && *self.route.proxy() == Proxy::Direct
                    && candidate.socket_address() == self.route.socket_address()
            })
        });
        if !routes_align {
            return false;
        }
        match self.handshake {
            Some(ref handshake) => handshake
                .peer_certificates
                .first()
                .map(|cert| cert.matches_hostname(address.host()))
                .unwrap_or(false),
            None => false,
        }
    }

    /// Registers an allocation for a freshly connected call, before the
    /// connection enters the pool.
    pub(crate) fn register_call(&self, call: &Call) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Arc::downgrade(&call.inner));
    }

    /// Releases `call`'s allocation. The last release stamps the idle
    /// time.
    pub(crate) fn release_allocation(&self, call: &Call) {
        let mut state = self.state.lock().unwrap();
        let target = Arc::as_ptr(&call.inner);
        if let Some(i) = state
            .calls
            .iter()
            .position(|weak| weak.as_ptr() == target)
        {
            state.calls.swap_remove(i);
        }
        state.success_count += 1;
        if state.calls.is_empty() {
            state.idle_at = Instant::now();
        }
    }

    /// Refuses future exchanges; in-flight ones continue.
    pub(crate) fn no_new_exchanges(&self) {
        self.state.lock().unwrap().no_new_exchanges = true;
    }

    pub(crate) fn has_no_new_exchanges(&self) -> bool {
        self.state.lock().unwrap().no_new_exchanges
    }

    /// Notes a failure observed on this connection, for route planning
    /// and pool bookkeeping.
    pub(crate) fn track_failure(&self, error: &Error) {
        let mut state = self.state.lock().unwrap();
        if error.is_stream_reset() {
            state.refused_stream_count += 1;
        }
    }

    /// Whether this connection can host a new exchange right now.
    /// `liveness_check` additionally probes idle HTTP/2 connections with
    /// a PING.
    pub(crate) fn is_healthy(&self, liveness_check: bool) -> bool {
        if self.has_no_new_exchanges() {
            return false;
        }
        if let Some(ref h2) = self.h2 {
            if !h2.is_healthy() {
                return false;
            }
            if liveness_check {
                let idle = {
                    let state = self.state.lock().unwrap();
                    state.calls.is_empty()
                };
                if idle {
                    h2.send_liveness_ping();
                }
            }
            return true;
        }
        match self.h1 {
            Some(ref h1) => h1.is_healthy(),
            None => false,
        }
    }

    /// In-use / idle accounting for the pool's eviction pass. Dead call
    /// references count as released.
    pub(crate) fn idle_stats(&self, now: Instant) -> IdleStats {
        let mut state = self.state.lock().unwrap();
        state.calls.retain(|weak| weak.strong_count() > 0);
        if state.calls.is_empty() {
            IdleStats::Idle(now.saturating_duration_since(state.idle_at))
        } else {
            IdleStats::InUse
        }
    }

    /// Closes the socket. Any blocked I/O fails promptly.
    pub(crate) fn close(&self) {
        trace!("closing connection {}", self.id);
        if let Some(ref h2) = self.h2 {
            h2.close();
        } else {
            self.transport.shutdown();
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("route", &self.route)
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Establishes a CONNECT tunnel through an HTTP proxy, answering proxy
/// authentication challenges as they come.
fn create_tunnel(
    transport: &Arc<dyn Transport>,
    route: &Route,
    address: &Arc<Address>,
) -> Result<()> {
    let mut request = Request::builder()
        .http_url(address.url().clone())
        .method(Method::Connect)
        .header("Host", &address.url().authority())
        .header("Proxy-Connection", "Keep-Alive")
        .header("User-Agent", crate::client::USER_AGENT)
        .build()?;

    for _ in 0..MAX_TUNNEL_ATTEMPTS {
        let codec = Http1Codec::new(transport.clone(), false);
        codec.write_request(&request).map_err(Error::new_connect)?;
        let mut writer = TransportWriter::new(transport.clone());
        writer.flush().map_err(Error::new_connect)?;

        let response = codec
            .read_response_head(false)?
            .expect("non-continue response")
            .request(request.clone())
            .build();

        match response.code() {
            200 => return Ok(()),
            407 => {
                // Drain the challenge body so the socket is positioned at
                // the next response.
                codec.open_response_body(&response)?;
                let mut sink = [0u8; 4096];
                while codec.read_tunnel_body(&mut sink).map_err(Error::new_connect)? > 0 {}

                let next = address
                    .proxy_authenticator()
                    .authenticate(Some(route), &response);
                match next {
                    Some(next) => request = next,
                    None => {
                        return Err(Error::new_connect(io::Error::new(
                            io::ErrorKind::PermissionDenied,
                            "Failed to authenticate with proxy",
                        )))
                    }
                }
            }
            code => {
                return Err(Error::new_connect(io::Error::new(
                    io::ErrorKind::Other,
                    format!("Unexpected response code for CONNECT: {}", code),
                )))
            }
        }
    }
    Err(Error::new_connect(io::Error::new(
        io::ErrorKind::PermissionDenied,
        "Too many tunnel connections attempted",
    )))
}

/// A minimal SOCKS5 CONNECT greeting, RFC 1928: no authentication, the
/// target hostname sent unresolved so the proxy does the DNS.
fn socks5_connect(transport: &dyn Transport, host: &str, port: u16) -> io::Result<()> {
    // Greeting: version 5, one method, no-auth.
    write_all(transport, &[0x05, 0x01, 0x00])?;
    let mut reply = [0u8; 2];
    read_exact(transport, &mut reply)?;
    if reply != [0x05, 0x00] {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "SOCKS5 authentication method rejected",
        ));
    }

    // Request: CONNECT to a domain name.
    if host.len() > 255 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "host too long"));
    }
    let mut request = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    request.extend_from_slice(host.as_bytes());
    request.extend_from_slice(&port.to_be_bytes());
    write_all(transport, &request)?;

    let mut reply = [0u8; 4];
    read_exact(transport, &mut reply)?;
    if reply[1] != 0x00 {
        return Err(io::Error::new(
            io::ErrorKind::Other,
            format!("SOCKS5 connect failed: reply {}", reply[1]),
        ));
    }
    // Drain the bound address, whose length depends on its type.
    let addr_len = match reply[3] {
        0x01 => 4,
        0x04 => 16,
        0x03 => {
            let mut len = [0u8; 1];
            read_exact(transport, &mut len)?;
            len[0] as usize
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("SOCKS5 unknown address type {}", other),
            ))
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    read_exact(transport, &mut bound)?;
    Ok(())
}

fn write_all(transport: &dyn Transport, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = transport.write(buf)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "write zero"));
        }
        buf = &buf[n..];
    }
    transport.flush()
}

fn read_exact(transport: &dyn Transport, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = transport.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "unexpected end of stream",
            ));
        }
        filled += n;
    }
    Ok(())
}
