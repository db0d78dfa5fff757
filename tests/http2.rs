#![deny(warnings)]

use std::io::{self, Read, Write};
use std::net::{IpAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use courier::body::ByteBody;
use courier::client::dns::Dns;
use courier::tls::{
    Handshake, PeerCertificate, SecureSocketFactory, SecureTransport, Transport,
};
use courier::{Client, Protocol, Request};

fn init_log() {
    let _ = pretty_env_logger::try_init();
}

fn get(url: &str) -> Request {
    Request::builder().url(url).unwrap().build().unwrap()
}

/// Resolves every hostname to loopback.
#[derive(Debug)]
struct Loopback;

impl Dns for Loopback {
    fn lookup(&self, _hostname: &str) -> io::Result<Vec<IpAddr>> {
        Ok(vec![IpAddr::from([127, 0, 0, 1])])
    }
}

/// A TLS stack that performs no cryptography: the "secure" stream is the
/// raw stream, with a scripted ALPN answer and peer certificate.
#[derive(Debug)]
struct FakeTls {
    alpn: Option<Protocol>,
    cert_hosts: Vec<String>,
}

impl SecureSocketFactory for FakeTls {
    fn upgrade(
        &self,
        raw: Arc<dyn Transport>,
        _host: &str,
        _port: u16,
        protocols: &[Protocol],
    ) -> io::Result<Box<dyn SecureTransport>> {
        let negotiated = self.alpn.filter(|protocol| protocols.contains(protocol));
        Ok(Box::new(FakeSecureTransport {
            raw,
            negotiated,
            cert_hosts: self.cert_hosts.clone(),
        }))
    }
}

#[derive(Debug)]
struct FakeSecureTransport {
    raw: Arc<dyn Transport>,
    negotiated: Option<Protocol>,
    cert_hosts: Vec<String>,
}

impl Transport for FakeSecureTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.raw.read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.raw.write(buf)
    }

    fn flush(&self) -> io::Result<()> {
        self.raw.flush()
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.raw.set_read_timeout(timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.raw.set_write_timeout(timeout)
    }

    fn shutdown(&self) {
        self.raw.shutdown();
    }
}

impl SecureTransport for FakeSecureTransport {
    fn negotiated_protocol(&self) -> Option<Protocol> {
        self.negotiated
    }

    fn handshake(&self) -> Handshake {
        Handshake {
            tls_version: "TLSv1.3".to_owned(),
            cipher_suite: "TLS_AES_128_GCM_SHA256".to_owned(),
            peer_certificates: vec![PeerCertificate {
                subject: "CN=test".to_owned(),
                dns_names: self.cert_hosts.clone(),
                der: Bytes::new(),
            }],
            local_certificates: Vec::new(),
        }
    }
}

fn h2_client(alpn: Option<Protocol>) -> Client {
    Client::builder()
        .dns(Loopback)
        .ssl_socket_factory(FakeTls {
            alpn,
            cert_hosts: vec!["h2.example".to_owned()],
        })
        .build()
}

// Minimal server-side HTTP/2 plumbing.

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const TYPE_DATA: u8 = 0x0;
const TYPE_HEADERS: u8 = 0x1;
const TYPE_SETTINGS: u8 = 0x4;
const TYPE_GOAWAY: u8 = 0x7;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;

fn read_frame(stream: &mut TcpStream) -> (u8, u8, u32, Vec<u8>) {
    let mut header = [0u8; 9];
    stream.read_exact(&mut header).unwrap();
    let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
    let frame_type = header[3];
    let flags = header[4];
    let stream_id = u32::from_be_bytes([header[5] & 0x7f, header[6], header[7], header[8]]);
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    (frame_type, flags, stream_id, payload)
}

fn write_frame(stream: &mut TcpStream, frame_type: u8, flags: u8, stream_id: u32, payload: &[u8]) {
    let mut frame = Vec::with_capacity(9 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes()[1..]);
    frame.push(frame_type);
    frame.push(flags);
    frame.extend_from_slice(&stream_id.to_be_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).unwrap();
}

/// Encodes a header block as literal fields without indexing, which every
/// HPACK decoder accepts.
fn hpack_literal(headers: &[(&str, &str)]) -> Vec<u8> {
    let mut block = Vec::new();
    for (name, value) in headers {
        block.push(0x00);
        block.push(name.len() as u8);
        block.extend_from_slice(name.as_bytes());
        block.push(value.len() as u8);
        block.extend_from_slice(value.as_bytes());
    }
    block
}

/// Accepts the preface and exchanges SETTINGS.
fn server_handshake(stream: &mut TcpStream) {
    let mut preface = [0u8; 24];
    stream.read_exact(&mut preface).unwrap();
    assert_eq!(&preface[..], PREFACE);
    write_frame(stream, TYPE_SETTINGS, 0, 0, &[]);
    loop {
        let (frame_type, flags, _, _) = read_frame(stream);
        if frame_type == TYPE_SETTINGS && flags & FLAG_ACK == 0 {
            write_frame(stream, TYPE_SETTINGS, FLAG_ACK, 0, &[]);
            return;
        }
    }
}

/// Reads frames until a HEADERS frame arrives, skipping connection
/// housekeeping.
fn read_headers_frame(stream: &mut TcpStream) -> (u32, u8) {
    loop {
        let (frame_type, flags, stream_id, _) = read_frame(stream);
        if frame_type == TYPE_HEADERS {
            assert_ne!(flags & FLAG_END_HEADERS, 0, "continuation not expected");
            return (stream_id, flags);
        }
    }
}

fn write_response(stream: &mut TcpStream, stream_id: u32, body: &[u8]) {
    let block = hpack_literal(&[(":status", "200"), ("content-type", "text/plain")]);
    write_frame(stream, TYPE_HEADERS, FLAG_END_HEADERS, stream_id, &block);
    write_frame(stream, TYPE_DATA, FLAG_END_STREAM, stream_id, body);
}

#[test]
fn http2_get_roundtrip() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        server_handshake(&mut stream);
        let (stream_id, flags) = read_headers_frame(&mut stream);
        assert_eq!(stream_id, 3);
        assert_ne!(flags & FLAG_END_STREAM, 0, "GET carries no body");
        write_response(&mut stream, stream_id, b"hello");
    });

    let client = h2_client(Some(Protocol::H2));
    let response = client
        .call(get(&format!("https://h2.example:{}/", port)))
        .execute()
        .unwrap();
    assert_eq!(response.protocol(), Protocol::H2);
    assert_eq!(response.code(), 200);
    assert_eq!(response.message(), "");
    assert_eq!(response.header("content-type"), Some("text/plain"));
    assert!(response.handshake().is_some());
    assert_eq!(response.body().string().unwrap(), "hello");
}

#[test]
fn http2_sequential_requests_share_the_session() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        counter.fetch_add(1, Ordering::SeqCst);
        server_handshake(&mut stream);
        let (first_id, _) = read_headers_frame(&mut stream);
        write_response(&mut stream, first_id, b"one");
        let (second_id, _) = read_headers_frame(&mut stream);
        write_response(&mut stream, second_id, b"two");
        (first_id, second_id)
    });

    let client = h2_client(Some(Protocol::H2));
    let url = format!("https://h2.example:{}/", port);

    let first = client.call(get(&url)).execute().unwrap();
    assert_eq!(first.body().string().unwrap(), "one");

    let second = client.call(get(&url)).execute().unwrap();
    assert_eq!(second.body().string().unwrap(), "two");

    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert_eq!(client.connection_pool().connection_count(), 1);
}

#[test]
fn http2_request_body_flows_in_data_frames() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        server_handshake(&mut stream);
        let (stream_id, flags) = read_headers_frame(&mut stream);
        assert_eq!(flags & FLAG_END_STREAM, 0, "POST body follows");

        let mut body = Vec::new();
        loop {
            let (frame_type, flags, id, payload) = read_frame(&mut stream);
            if frame_type != TYPE_DATA || id != stream_id {
                continue;
            }
            body.extend_from_slice(&payload);
            if flags & FLAG_END_STREAM != 0 {
                break;
            }
        }
        write_response(&mut stream, stream_id, b"received");
        body
    });

    let client = h2_client(Some(Protocol::H2));
    let response = client
        .call(
            Request::builder()
                .url(&format!("https://h2.example:{}/upload", port))
                .unwrap()
                .post(ByteBody::new(&b"frame me"[..], None))
                .build()
                .unwrap(),
        )
        .execute()
        .unwrap();
    assert_eq!(response.body().string().unwrap(), "received");
    assert_eq!(server.join().unwrap(), b"frame me");
}

#[test]
fn goaway_refused_stream_retries_on_a_new_connection() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    thread::spawn(move || {
        // First connection refuses the stream with GOAWAY naming no
        // handled streams.
        {
            let (mut stream, _) = listener.accept().unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            server_handshake(&mut stream);
            let (stream_id, _) = read_headers_frame(&mut stream);
            assert_eq!(stream_id, 3);
            let mut payload = Vec::new();
            payload.extend_from_slice(&0u32.to_be_bytes()); // last good stream
            payload.extend_from_slice(&0u32.to_be_bytes()); // NO_ERROR
            write_frame(&mut stream, TYPE_GOAWAY, 0, 0, &payload);
            thread::sleep(Duration::from_millis(200));
        }

        // The retry lands on a fresh connection.
        let (mut stream, _) = listener.accept().unwrap();
        counter.fetch_add(1, Ordering::SeqCst);
        server_handshake(&mut stream);
        let (stream_id, _) = read_headers_frame(&mut stream);
        write_response(&mut stream, stream_id, b"second try");
    });

    let client = h2_client(Some(Protocol::H2));
    let response = client
        .call(get(&format!("https://h2.example:{}/", port)))
        .execute()
        .unwrap();
    assert_eq!(response.code(), 200);
    assert_eq!(response.body().string().unwrap(), "second try");
    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[test]
fn no_alpn_answer_falls_back_to_http11() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        // Plain HTTP/1.1 on the "secure" stream.
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nh1")
            .unwrap();
    });

    let client = h2_client(None);
    let response = client
        .call(get(&format!("https://h2.example:{}/", port)))
        .execute()
        .unwrap();
    assert_eq!(response.protocol(), Protocol::Http11);
    assert!(response.handshake().is_some());
    assert_eq!(response.body().string().unwrap(), "h1");
}

#[test]
fn connect_tunnel_through_an_http_proxy() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        let connect_head = String::from_utf8(head).unwrap();
        stream.write_all(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();

        // Inside the tunnel: plain HTTP/1.1 (ALPN picked nothing).
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).unwrap();
            head.push(byte[0]);
        }
        let inner_head = String::from_utf8(head).unwrap();
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\ntunneled")
            .unwrap();
        (connect_head, inner_head)
    });

    let client = Client::builder()
        .dns(Loopback)
        .ssl_socket_factory(FakeTls {
            alpn: None,
            cert_hosts: vec!["secure.example".to_owned()],
        })
        .proxy(courier::connect::Proxy::Http {
            host: "127.0.0.1".to_owned(),
            port,
        })
        .build();
    let response = client
        .call(get("https://secure.example/private"))
        .execute()
        .unwrap();
    assert_eq!(response.body().string().unwrap(), "tunneled");

    let (connect_head, inner_head) = server.join().unwrap();
    assert!(
        connect_head.starts_with("CONNECT secure.example:443 HTTP/1.1\r\n"),
        "{:?}",
        connect_head
    );
    // The tunneled request goes back to origin form.
    assert!(
        inner_head.starts_with("GET /private HTTP/1.1\r\n"),
        "{:?}",
        inner_head
    );
}
