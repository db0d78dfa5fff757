#![deny(warnings)]

#[macro_use]
extern crate matches;

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use courier::body::{ByteBody, RequestBody, ResponseBody};
use courier::client::dns::Dns;
use courier::client::events::EventListener;
use courier::connect::Proxy;
use courier::interceptor::{CacheStore, CacheWriter, Chain, Interceptor};
use courier::media_type::MediaType;
use courier::tls::{DefaultSocketFactory, SocketFactory, Transport};
use courier::{Call, Client, Protocol, Request, Response};

fn init_log() {
    let _ = pretty_env_logger::try_init();
}

fn get(url: &str) -> Request {
    Request::builder().url(url).unwrap().build().unwrap()
}

/// Reads one request head, returning the empty string at EOF.
fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => head.push(byte[0]),
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (n, v) = line.split_once(':')?;
        if n.trim().eq_ignore_ascii_case(name) {
            Some(v.trim())
        } else {
            None
        }
    })
}

fn read_exact_body(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).unwrap();
    body
}

fn gzip(data: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

#[test]
fn get_roundtrip() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let head = read_head(&mut stream);
        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
            )
            .unwrap();
        head
    });

    let client = Client::new();
    let response = client
        .call(get(&format!("http://{}/a?b=c", addr)))
        .execute()
        .unwrap();
    assert_eq!(response.code(), 200);
    assert_eq!(response.message(), "OK");
    assert_eq!(response.protocol(), Protocol::Http11);
    assert_eq!(response.header("Content-Type"), Some("text/plain"));
    assert_eq!(response.body().content_length(), 5);
    assert_eq!(response.body().string().unwrap(), "hello");

    let head = server.join().unwrap();
    assert!(head.starts_with("GET /a?b=c HTTP/1.1\r\n"), "{:?}", head);
    assert_eq!(
        header_value(&head, "Host"),
        Some(format!("{}", addr).as_str())
    );
    assert_eq!(header_value(&head, "Connection"), Some("Keep-Alive"));
    assert_eq!(header_value(&head, "Accept-Encoding"), Some("gzip"));
    assert!(header_value(&head, "User-Agent")
        .unwrap()
        .starts_with("courier/"));
}

/// Serves every request on every connection with a per-connection
/// sequence number. Returns the address and a connection counter.
fn sequence_server() -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = connections.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            thread::spawn(move || {
                let mut sequence = 0;
                loop {
                    let head = read_head(&mut stream);
                    if head.is_empty() {
                        return;
                    }
                    let close = header_value(&head, "Connection") == Some("close");
                    let connection = if close { "close" } else { "keep-alive" };
                    let reply = format!(
                        "HTTP/1.1 200 OK\r\nX-Sequence: {}\r\nConnection: {}\r\nContent-Length: 2\r\n\r\nok",
                        sequence, connection,
                    );
                    if stream.write_all(reply.as_bytes()).is_err() {
                        return;
                    }
                    if close {
                        return;
                    }
                    sequence += 1;
                }
            });
        }
    });
    (addr, connections)
}

#[test]
fn sequential_gets_reuse_the_connection() {
    init_log();
    let (addr, connections) = sequence_server();
    let client = Client::new();
    let url = format!("http://{}/", addr);

    let first = client.call(get(&url)).execute().unwrap();
    assert_matches!(first.header("X-Sequence"), Some("0"));
    first.body().string().unwrap();

    let second = client.call(get(&url)).execute().unwrap();
    assert_matches!(second.header("X-Sequence"), Some("1"));
    second.body().string().unwrap();

    assert_eq!(connections.load(Ordering::SeqCst), 1);
    assert_eq!(client.connection_pool().connection_count(), 1);
}

#[test]
fn connection_close_forces_a_new_connection() {
    init_log();
    let (addr, connections) = sequence_server();
    let client = Client::new();
    let url = format!("http://{}/", addr);

    let first = client
        .call(
            Request::builder()
                .url(&url)
                .unwrap()
                .header("Connection", "close")
                .build()
                .unwrap(),
        )
        .execute()
        .unwrap();
    assert_matches!(first.header("X-Sequence"), Some("0"));
    first.body().string().unwrap();

    let second = client.call(get(&url)).execute().unwrap();
    assert_matches!(second.header("X-Sequence"), Some("0"));
    second.body().string().unwrap();

    assert_eq!(connections.load(Ordering::SeqCst), 2);
}

#[test]
fn redirect_strips_credentials_across_origins() {
    init_log();
    let target = TcpListener::bind("127.0.0.1:0").unwrap();
    let target_addr = target.local_addr().unwrap();
    let target_thread = thread::spawn(move || {
        let (mut stream, _) = target.accept().unwrap();
        let head = read_head(&mut stream);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone")
            .unwrap();
        head
    });

    let origin = TcpListener::bind("127.0.0.1:0").unwrap();
    let origin_addr = origin.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = origin.accept().unwrap();
        let head = read_head(&mut stream);
        assert_eq!(header_value(&head, "Authorization"), Some("Bearer X"));
        let reply = format!(
            "HTTP/1.1 302 Found\r\nLocation: http://{}/\r\nContent-Length: 0\r\n\r\n",
            target_addr,
        );
        stream.write_all(reply.as_bytes()).unwrap();
    });

    // The two listeners share a host but not a port, so the redirect
    // crosses origins.
    let client = Client::new();
    let response = client
        .call(
            Request::builder()
                .url(&format!("http://{}/", origin_addr))
                .unwrap()
                .header("Authorization", "Bearer X")
                .build()
                .unwrap(),
        )
        .execute()
        .unwrap();

    assert_eq!(response.code(), 200);
    assert_eq!(response.body().string().unwrap(), "done");
    assert_eq!(response.request().url().port(), target_addr.port());
    let prior = response.prior_response().unwrap();
    assert_eq!(prior.code(), 302);

    let target_head = target_thread.join().unwrap();
    assert_eq!(header_value(&target_head, "Authorization"), None);
}

#[test]
fn same_origin_redirect_keeps_credentials() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let first = read_head(&mut stream);
        stream
            .write_all(b"HTTP/1.1 302 Found\r\nLocation: /there\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        let second = read_head(&mut stream);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        (first, second)
    });

    let client = Client::new();
    let response = client
        .call(
            Request::builder()
                .url(&format!("http://{}/here", addr))
                .unwrap()
                .header("Authorization", "Bearer X")
                .build()
                .unwrap(),
        )
        .execute()
        .unwrap();
    assert_eq!(response.code(), 200);
    response.body().string().unwrap();

    let (_, second) = server.join().unwrap();
    assert!(second.starts_with("GET /there HTTP/1.1\r\n"), "{:?}", second);
    assert_eq!(header_value(&second, "Authorization"), Some("Bearer X"));
}

#[test]
fn post_redirect_rewrites_to_get() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let first = read_head(&mut stream);
        let len: usize = header_value(&first, "Content-Length")
            .unwrap()
            .parse()
            .unwrap();
        read_exact_body(&mut stream, len);
        stream
            .write_all(
                b"HTTP/1.1 301 Moved Permanently\r\nLocation: /next\r\nContent-Length: 0\r\n\r\n",
            )
            .unwrap();
        let second = read_head(&mut stream);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        (first, second)
    });

    let client = Client::new();
    let response = client
        .call(
            Request::builder()
                .url(&format!("http://{}/form", addr))
                .unwrap()
                .post(ByteBody::new(&b"a=b"[..], None))
                .build()
                .unwrap(),
        )
        .execute()
        .unwrap();
    assert_eq!(response.code(), 200);
    response.body().string().unwrap();

    let (first, second) = server.join().unwrap();
    assert!(first.starts_with("POST /form HTTP/1.1\r\n"));
    assert!(second.starts_with("GET /next HTTP/1.1\r\n"), "{:?}", second);
    assert_eq!(header_value(&second, "Content-Length"), None);
}

#[test]
fn transparent_gzip_decompresses() {
    init_log();
    let compressed = gzip(b"hello hello hello");
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_head(&mut stream);
        let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            compressed.len(),
        );
        stream.write_all(reply.as_bytes()).unwrap();
        stream.write_all(&compressed).unwrap();
    });

    let client = Client::new();
    let response = client
        .call(get(&format!("http://{}/", addr)))
        .execute()
        .unwrap();
    // The decompressed length is unknown ahead of reading.
    assert_eq!(response.body().content_length(), -1);
    assert_eq!(response.header("Content-Encoding"), None);
    assert_eq!(response.body().string().unwrap(), "hello hello hello");
}

#[test]
fn explicit_accept_encoding_disables_transparent_gzip() {
    init_log();
    let compressed = gzip(b"raw bytes please");
    let expected = compressed.clone();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_head(&mut stream);
        let reply = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            compressed.len(),
        );
        stream.write_all(reply.as_bytes()).unwrap();
        stream.write_all(&compressed).unwrap();
    });

    let client = Client::new();
    let response = client
        .call(
            Request::builder()
                .url(&format!("http://{}/", addr))
                .unwrap()
                .header("Accept-Encoding", "gzip")
                .build()
                .unwrap(),
        )
        .execute()
        .unwrap();
    assert_eq!(response.header("Content-Encoding"), Some("gzip"));
    assert_eq!(&response.body().bytes().unwrap()[..], &expected[..]);
}

#[test]
fn chunked_response_body() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_head(&mut stream);
        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                  5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n",
            )
            .unwrap();
    });

    let client = Client::new();
    let response = client
        .call(get(&format!("http://{}/", addr)))
        .execute()
        .unwrap();
    assert_eq!(response.body().content_length(), -1);
    assert_eq!(response.body().string().unwrap(), "hello, world");
}

#[test]
fn chunked_trailers_are_readable_after_the_body() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_head(&mut stream);
        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
                  4\r\ndata\r\n0\r\nX-Checksum: abc\r\n\r\n",
            )
            .unwrap();
    });

    let client = Client::new();
    let response = client
        .call(get(&format!("http://{}/", addr)))
        .execute()
        .unwrap();
    assert_eq!(response.body().string().unwrap(), "data");
    let trailers = response.body().trailers().unwrap();
    assert_eq!(trailers.get("X-Checksum"), Some("abc"));
}

/// A body of unknown length, to force chunked transfer encoding.
struct StreamingBody(&'static [u8]);

impl RequestBody for StreamingBody {
    fn content_type(&self) -> Option<MediaType> {
        None
    }

    fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(self.0)
    }
}

#[test]
fn unknown_length_request_body_is_chunked() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let head = read_head(&mut stream);
        // Read the chunked body to its terminator.
        let mut raw = Vec::new();
        let mut byte = [0u8; 1];
        while !raw.ends_with(b"0\r\n\r\n") {
            match stream.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => raw.push(byte[0]),
                Err(_) => break,
            }
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        (head, raw)
    });

    let client = Client::new();
    let response = client
        .call(
            Request::builder()
                .url(&format!("http://{}/", addr))
                .unwrap()
                .post(StreamingBody(b"streamed"))
                .build()
                .unwrap(),
        )
        .execute()
        .unwrap();
    assert_eq!(response.code(), 200);

    let (head, raw) = server.join().unwrap();
    assert_eq!(header_value(&head, "Transfer-Encoding"), Some("chunked"));
    assert_eq!(header_value(&head, "Content-Length"), None);
    assert_eq!(&raw[..], b"8\r\nstreamed\r\n0\r\n\r\n");
}

#[test]
fn expect_continue_waits_for_the_server() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let head = read_head(&mut stream);
        assert_eq!(header_value(&head, "Expect"), Some("100-continue"));
        stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").unwrap();
        let len: usize = header_value(&head, "Content-Length")
            .unwrap()
            .parse()
            .unwrap();
        let body = read_exact_body(&mut stream, len);
        let reply = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
        stream.write_all(reply.as_bytes()).unwrap();
        stream.write_all(&body).unwrap();
    });

    let client = Client::new();
    let response = client
        .call(
            Request::builder()
                .url(&format!("http://{}/upload", addr))
                .unwrap()
                .header("Expect", "100-continue")
                .post(ByteBody::new(&b"payload"[..], None))
                .build()
                .unwrap(),
        )
        .execute()
        .unwrap();
    assert_eq!(response.code(), 200);
    assert_eq!(response.body().string().unwrap(), "payload");
    server.join().unwrap();
}

/// Resolves every host to two loopback addresses, giving the route
/// planner a second route to fall back on.
#[derive(Debug)]
struct TwoRoutes;

impl Dns for TwoRoutes {
    fn lookup(&self, _hostname: &str) -> io::Result<Vec<IpAddr>> {
        let loopback = IpAddr::from([127, 0, 0, 1]);
        Ok(vec![loopback, loopback])
    }
}

#[test]
fn abrupt_close_retries_on_the_next_route() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        // First connection dies before any response byte.
        let (mut stream, _) = listener.accept().unwrap();
        read_head(&mut stream);
        drop(stream);

        let (mut stream, _) = listener.accept().unwrap();
        read_head(&mut stream);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .unwrap();
    });

    let client = Client::builder().dns(TwoRoutes).build();
    let response = client
        .call(get(&format!("http://{}/", addr)))
        .execute()
        .unwrap();
    assert_eq!(response.code(), 200);
    assert_eq!(response.body().string().unwrap(), "ok");
}

/// A body that refuses to be replayed.
struct OneShotBody(&'static [u8]);

impl RequestBody for OneShotBody {
    fn content_type(&self) -> Option<MediaType> {
        None
    }

    fn content_length(&self) -> i64 {
        self.0.len() as i64
    }

    fn write_to(&self, sink: &mut dyn Write) -> io::Result<()> {
        sink.write_all(self.0)
    }

    fn is_one_shot(&self) -> bool {
        true
    }
}

#[test]
fn one_shot_body_is_not_retried() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            read_head(&mut stream);
            drop(stream);
        }
    });

    let client = Client::builder().dns(TwoRoutes).build();
    let error = client
        .call(
            Request::builder()
                .url(&format!("http://{}/", addr))
                .unwrap()
                .post(OneShotBody(b"precious"))
                .build()
                .unwrap(),
        )
        .execute()
        .unwrap_err();
    assert!(error.is_io(), "{:?}", error);
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
}

#[derive(Debug)]
struct FlakyFactory {
    failures_left: AtomicUsize,
    attempts: AtomicUsize,
}

#[derive(Debug, Clone)]
struct SharedFlakyFactory(Arc<FlakyFactory>);

impl SocketFactory for SharedFlakyFactory {
    fn connect(
        &self,
        address: SocketAddr,
        timeout: Option<Duration>,
    ) -> io::Result<Box<dyn Transport>> {
        self.0.attempts.fetch_add(1, Ordering::SeqCst);
        if self
            .0
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "synthetic refusal",
            ));
        }
        DefaultSocketFactory.connect(address, timeout)
    }
}

#[test]
fn connect_failure_tries_the_next_route() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_head(&mut stream);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
    });

    let factory = Arc::new(FlakyFactory {
        failures_left: AtomicUsize::new(1),
        attempts: AtomicUsize::new(0),
    });
    let client = Client::builder()
        .dns(TwoRoutes)
        .socket_factory(SharedFlakyFactory(factory.clone()))
        .build();
    let response = client
        .call(get(&format!("http://{}/", addr)))
        .execute()
        .unwrap();
    assert_eq!(response.code(), 200);
    assert_eq!(factory.attempts.load(Ordering::SeqCst), 2);
}

#[test]
fn read_timeout_surfaces_as_timeout() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_head(&mut stream);
        thread::sleep(Duration::from_secs(5));
        drop(stream);
    });

    let client = Client::builder()
        .read_timeout(Duration::from_millis(250))
        .build();
    let error = client
        .call(get(&format!("http://{}/", addr)))
        .execute()
        .unwrap_err();
    assert!(error.is_timeout(), "{:?}", error);
}

#[test]
fn cancel_wakes_a_blocked_call() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_head(&mut stream);
        thread::sleep(Duration::from_secs(30));
        drop(stream);
    });

    let client = Client::new();
    let call = client.call(get(&format!("http://{}/", addr)));
    let canceler: Call = call.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        canceler.cancel();
    });

    let error = call.execute().unwrap_err();
    assert!(error.is_canceled(), "{:?}", error);
    assert!(call.is_canceled());
}

#[test]
fn enqueued_calls_complete_and_the_dispatcher_goes_idle() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            thread::spawn(move || loop {
                let head = read_head(&mut stream);
                if head.is_empty() {
                    return;
                }
                if stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
                    .is_err()
                {
                    return;
                }
            });
        }
    });

    let client = Client::new();
    let (idle_tx, idle_rx) = mpsc::channel();
    client.dispatcher().set_idle_callback(move || {
        let _ = idle_tx.send(());
    });

    let (tx, rx) = mpsc::channel();
    for _ in 0..3 {
        let tx = tx.clone();
        client.call(get(&format!("http://{}/", addr))).enqueue(
            move |_call: Call, result: courier::Result<Response>| {
                let body = result.and_then(|response| response.body().string());
                tx.send(body).unwrap();
            },
        );
    }
    for _ in 0..3 {
        let body = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(body.unwrap(), "ok");
    }
    idle_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(client.dispatcher().running_calls_count(), 0);
}

#[test]
fn canceled_queued_call_fails_without_a_response() {
    init_log();
    let client = Client::new();
    let call = client.call(get("http://127.0.0.1:1/"));
    call.cancel();

    let (tx, rx) = mpsc::channel();
    call.enqueue(move |_call: Call, result: courier::Result<Response>| {
        tx.send(result.map(|_| ())).unwrap();
    });
    let result = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(result.unwrap_err().is_canceled());
}

#[test]
fn application_interceptor_can_short_circuit() {
    init_log();

    struct CannedResponse;
    impl Interceptor for CannedResponse {
        fn intercept(&self, chain: &mut Chain<'_>) -> courier::Result<Response> {
            Ok(Response::builder()
                .request(chain.request().clone())
                .protocol(Protocol::Http11)
                .code(200)
                .message("OK")
                .body(ResponseBody::from_bytes(
                    None,
                    Bytes::from_static(b"intercepted"),
                ))
                .build())
        }
    }

    // No server exists; the interceptor answers before any I/O.
    let client = Client::builder().add_interceptor(CannedResponse).build();
    let response = client.call(get("http://127.0.0.1:1/")).execute().unwrap();
    assert_eq!(response.body().string().unwrap(), "intercepted");
}

#[test]
fn network_interceptor_may_not_change_the_host() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_secs(5));
        drop(stream);
    });

    struct RewriteHost;
    impl Interceptor for RewriteHost {
        fn intercept(&self, chain: &mut Chain<'_>) -> courier::Result<Response> {
            let url = courier::HttpUrl::parse("http://other.invalid:1/").unwrap();
            let request = chain.request().new_builder().http_url(url).build()?;
            chain.proceed(request)
        }
    }

    let client = Client::builder()
        .add_network_interceptor(RewriteHost)
        .build();
    let error = client
        .call(get(&format!("http://{}/", addr)))
        .execute()
        .unwrap_err();
    assert!(error.is_protocol(), "{:?}", error);
}

#[test]
fn interceptor_tiers_see_different_requests() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_head(&mut stream);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
    });

    struct RecordHost(Arc<Mutex<Vec<Option<String>>>>);
    impl Interceptor for RecordHost {
        fn intercept(&self, chain: &mut Chain<'_>) -> courier::Result<Response> {
            self.0
                .lock()
                .unwrap()
                .push(chain.request().header("Host").map(str::to_owned));
            let request = chain.request().clone();
            chain.proceed(request)
        }
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let client = Client::builder()
        .add_interceptor(RecordHost(seen.clone()))
        .add_network_interceptor(RecordHost(seen.clone()))
        .build();
    client
        .call(get(&format!("http://{}/", addr)))
        .execute()
        .unwrap()
        .body()
        .string()
        .unwrap();

    let seen = seen.lock().unwrap();
    // The application tier runs before default headers exist; the network
    // tier sees the request as it is framed.
    assert_eq!(seen[0], None);
    assert_eq!(seen[1], Some(format!("{}", addr)));
}

#[derive(Clone, Debug)]
struct StoredResponse {
    code: u16,
    message: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    sent_at: i64,
    received_at: i64,
}

/// A whole-response in-memory cache, keyed by URL.
#[derive(Clone, Debug, Default)]
struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, StoredResponse>>>,
}

struct MemoryCacheWriter {
    key: String,
    entry: StoredResponse,
    entries: Arc<Mutex<HashMap<String, StoredResponse>>>,
}

impl CacheWriter for MemoryCacheWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.entry.body.extend_from_slice(data);
        Ok(())
    }

    fn commit(&mut self) {
        self.entries
            .lock()
            .unwrap()
            .insert(self.key.clone(), self.entry.clone());
    }

    fn abort(&mut self) {}
}

impl CacheStore for MemoryCache {
    fn get(&self, request: &Request) -> Option<Response> {
        let stored = self
            .entries
            .lock()
            .unwrap()
            .get(request.url().as_str())?
            .clone();
        let mut builder = Response::builder()
            .request(request.clone())
            .protocol(Protocol::Http11)
            .code(stored.code)
            .message(&stored.message)
            .sent_request_at_millis(stored.sent_at)
            .received_response_at_millis(stored.received_at)
            .body(ResponseBody::from_bytes(None, Bytes::from(stored.body)));
        for (name, value) in &stored.headers {
            builder = builder.add_header(name, value);
        }
        Some(builder.build())
    }

    fn put(&self, response: &Response) -> Option<Box<dyn CacheWriter>> {
        Some(Box::new(MemoryCacheWriter {
            key: response.request().url().as_str().to_owned(),
            entry: StoredResponse {
                code: response.code(),
                message: response.message().to_owned(),
                headers: response
                    .headers()
                    .iter()
                    .map(|(n, v)| (n.to_owned(), v.to_owned()))
                    .collect(),
                body: Vec::new(),
                sent_at: response.sent_request_at_millis(),
                received_at: response.received_response_at_millis(),
            },
            entries: self.entries.clone(),
        }))
    }

    fn update(&self, cached: &Response, network: &Response) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(cached.request().url().as_str()) {
            entry.headers = network
                .headers()
                .iter()
                .map(|(n, v)| (n.to_owned(), v.to_owned()))
                .collect();
        }
    }

    fn remove(&self, request: &Request) {
        self.entries.lock().unwrap().remove(request.url().as_str());
    }
}

#[test]
fn fresh_responses_are_served_from_cache() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));
    let counter = requests.clone();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        loop {
            let head = read_head(&mut stream);
            if head.is_empty() {
                return;
            }
            counter.fetch_add(1, Ordering::SeqCst);
            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nCache-Control: max-age=60\r\nContent-Length: 6\r\n\r\ncached",
                )
                .unwrap();
        }
    });

    let cache = MemoryCache::default();
    let client = Client::builder().cache(cache.clone()).build();
    let url = format!("http://{}/doc", addr);

    let first = client.call(get(&url)).execute().unwrap();
    assert_eq!(first.body().string().unwrap(), "cached");
    assert!(first.network_response().is_some());
    assert!(first.cache_response().is_none());

    let second = client.call(get(&url)).execute().unwrap();
    assert_eq!(second.body().string().unwrap(), "cached");
    assert!(second.network_response().is_none());
    assert!(second.cache_response().is_some());

    assert_eq!(requests.load(Ordering::SeqCst), 1);
}

#[test]
fn stale_responses_revalidate_with_etag() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let first = read_head(&mut stream);
        stream
            .write_all(
                b"HTTP/1.1 200 OK\r\nCache-Control: max-age=0\r\nETag: \"v1\"\r\nContent-Length: 8\r\n\r\noriginal",
            )
            .unwrap();
        let second = read_head(&mut stream);
        stream
            .write_all(b"HTTP/1.1 304 Not Modified\r\nETag: \"v1\"\r\nX-Revalidated: true\r\n\r\n")
            .unwrap();
        (first, second)
    });

    let cache = MemoryCache::default();
    let client = Client::builder().cache(cache.clone()).build();
    let url = format!("http://{}/doc", addr);

    let first = client.call(get(&url)).execute().unwrap();
    assert_eq!(first.body().string().unwrap(), "original");

    let second = client.call(get(&url)).execute().unwrap();
    assert_eq!(second.code(), 200);
    assert_eq!(second.header("X-Revalidated"), Some("true"));
    assert_eq!(second.header("ETag"), Some("\"v1\""));
    assert!(second.cache_response().is_some());
    assert!(second.network_response().is_some());
    assert_eq!(second.body().string().unwrap(), "original");

    let (_, second_head) = server.join().unwrap();
    assert_eq!(header_value(&second_head, "If-None-Match"), Some("\"v1\""));
}

#[test]
fn only_if_cached_miss_is_unsatisfiable() {
    init_log();
    let client = Client::new();
    let error = client
        .call(
            Request::builder()
                .url("http://127.0.0.1:1/")
                .unwrap()
                .header("Cache-Control", "only-if-cached")
                .build()
                .unwrap(),
        )
        .execute()
        .unwrap_err();
    assert!(error.is_unsatisfiable_request(), "{:?}", error);
}

/// Resolves only the loopback literal, to prove a host's DNS was skipped.
#[derive(Debug)]
struct LoopbackOnly;

impl Dns for LoopbackOnly {
    fn lookup(&self, hostname: &str) -> io::Result<Vec<IpAddr>> {
        if hostname == "127.0.0.1" {
            Ok(vec![IpAddr::from([127, 0, 0, 1])])
        } else {
            Err(io::Error::new(
                io::ErrorKind::Other,
                format!("unexpected lookup of {}", hostname),
            ))
        }
    }
}

#[test]
fn http_proxy_gets_absolute_form_and_does_the_dns() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let head = read_head(&mut stream);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\nproxied")
            .unwrap();
        head
    });

    let client = Client::builder()
        .dns(LoopbackOnly)
        .proxy(Proxy::Http {
            host: "127.0.0.1".to_owned(),
            port: addr.port(),
        })
        .build();
    let response = client
        .call(get("http://origin.example/path"))
        .execute()
        .unwrap();
    assert_eq!(response.body().string().unwrap(), "proxied");

    let head = server.join().unwrap();
    assert!(
        head.starts_with("GET http://origin.example/path HTTP/1.1\r\n"),
        "{:?}",
        head
    );
    assert_eq!(header_value(&head, "Host"), Some("origin.example"));
}

#[test]
fn socks_proxy_receives_the_unresolved_hostname() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();

        // Greeting: no authentication.
        let mut greeting = [0u8; 3];
        stream.read_exact(&mut greeting).unwrap();
        assert_eq!(greeting, [0x05, 0x01, 0x00]);
        stream.write_all(&[0x05, 0x00]).unwrap();

        // CONNECT with a domain target.
        let mut request_head = [0u8; 5];
        stream.read_exact(&mut request_head).unwrap();
        assert_eq!(&request_head[..4], &[0x05, 0x01, 0x00, 0x03]);
        let mut host = vec![0u8; request_head[4] as usize];
        stream.read_exact(&mut host).unwrap();
        let mut port = [0u8; 2];
        stream.read_exact(&mut port).unwrap();
        stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .unwrap();

        let head = read_head(&mut stream);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        (
            String::from_utf8(host).unwrap(),
            u16::from_be_bytes(port),
            head,
        )
    });

    let client = Client::builder()
        .dns(LoopbackOnly)
        .proxy(Proxy::Socks {
            host: "127.0.0.1".to_owned(),
            port: addr.port(),
        })
        .build();
    let response = client
        .call(get("http://proxied.example:8080/x"))
        .execute()
        .unwrap();
    assert_eq!(response.code(), 200);

    let (host, port, head) = server.join().unwrap();
    assert_eq!(host, "proxied.example");
    assert_eq!(port, 8080);
    // Through SOCKS the request target stays in origin form.
    assert!(head.starts_with("GET /x HTTP/1.1\r\n"), "{:?}", head);
}

#[test]
fn events_fire_in_order() {
    init_log();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        read_head(&mut stream);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .unwrap();
    });

    struct Recording(Arc<Mutex<Vec<&'static str>>>);
    impl Recording {
        fn push(&self, name: &'static str) {
            self.0.lock().unwrap().push(name);
        }
    }
    impl EventListener for Recording {
        fn call_start(&self, _: &Call) {
            self.push("call_start");
        }
        fn dns_start(&self, _: &Call, _: &str) {
            self.push("dns_start");
        }
        fn connect_start(&self, _: &Call, _: SocketAddr, _: &Proxy) {
            self.push("connect_start");
        }
        fn connection_acquired(&self, _: &Call, _: &courier::connect::Connection) {
            self.push("connection_acquired");
        }
        fn request_headers_start(&self, _: &Call) {
            self.push("request_headers_start");
        }
        fn request_headers_end(&self, _: &Call, _: &Request) {
            self.push("request_headers_end");
        }
        fn response_headers_start(&self, _: &Call) {
            self.push("response_headers_start");
        }
        fn response_headers_end(&self, _: &Call, _: &Response) {
            self.push("response_headers_end");
        }
        fn response_body_start(&self, _: &Call) {
            self.push("response_body_start");
        }
        fn response_body_end(&self, _: &Call, _: u64) {
            self.push("response_body_end");
        }
        fn connection_released(&self, _: &Call, _: &courier::connect::Connection) {
            self.push("connection_released");
        }
        fn call_end(&self, _: &Call) {
            self.push("call_end");
        }
    }

    let events = Arc::new(Mutex::new(Vec::new()));
    let client = Client::builder()
        .event_listener(Recording(events.clone()))
        .build();
    let response = client
        .call(get(&format!("http://{}/", addr)))
        .execute()
        .unwrap();
    response.body().string().unwrap();

    let events = events.lock().unwrap();
    let expected = [
        "call_start",
        "dns_start",
        "connect_start",
        "connection_acquired",
        "request_headers_start",
        "request_headers_end",
        "response_headers_start",
        "response_headers_end",
        "response_body_start",
        "call_end",
        "response_body_end",
        "connection_released",
    ];
    let mut last = 0;
    for name in expected {
        let position = events[last..]
            .iter()
            .position(|e| *e == name)
            .unwrap_or_else(|| panic!("missing {} after {:?}", name, &events[..last]));
        last += position + 1;
    }
}
