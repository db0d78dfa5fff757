//! One HTTP/2 session over one socket, multiplexing streams.
//!
//! A single reader thread demultiplexes inbound frames; writers share the
//! outbound half behind a mutex so a HEADERS + CONTINUATION block is
//! always contiguous on the wire.

use std::collections::HashMap;
use std::io::{self, BufReader};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::ConnectionShutdown;
use crate::tls::{Transport, TransportReader, TransportWriter};

use super::frame::{
    ErrorCode, Frame, FrameReader, FrameWriter, Settings, DEFAULT_INITIAL_WINDOW_SIZE,
    SETTINGS_ENABLE_PUSH, SETTINGS_INITIAL_WINDOW_SIZE,
};
use super::stream::Http2Stream;

/// The connection-level receive window this client maintains.
const CLIENT_WINDOW_SIZE: u64 = 16 * 1024 * 1024;

/// How long a liveness ping may go unanswered before the connection is
/// considered degraded.
const DEGRADED_PONG_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) struct Http2Connection {
    connection_name: String,
    transport: Arc<dyn Transport>,
    writer: Mutex<FrameWriter<TransportWriter>>,
    state: Mutex<ConnState>,
    state_cond: Condvar,
    /// Connection-level send window, granted by the peer.
    write_window: Mutex<i64>,
    window_cond: Condvar,
    /// Cached from the peer's SETTINGS for lock-free sizing decisions.
    max_frame_size: AtomicUsize,
    /// Write timeout applied to window waits.
    write_timeout: Mutex<Option<Duration>>,
}

struct ConnState {
    streams: HashMap<u32, Arc<Http2Stream>>,
    next_stream_id: u32,
    /// The highest stream id we created, reported in our GOAWAY.
    last_created_stream_id: u32,
    is_shutdown: bool,
    peer_settings: Settings,
    /// Connection-level bytes read but not yet returned as WINDOW_UPDATE.
    unacknowledged_bytes_read: u64,
    awaiting_pong: bool,
    pong_deadline: Option<Instant>,
}

impl Http2Connection {
    /// Sends the preface and initial SETTINGS, raises the connection
    /// receive window, and starts the reader thread.
    pub(crate) fn start(
        transport: Arc<dyn Transport>,
        connection_name: String,
    ) -> io::Result<Arc<Http2Connection>> {
        let mut writer = FrameWriter::new(TransportWriter::new(transport.clone()));
        writer.connection_preface()?;
        let mut settings = Settings::new();
        settings.set(SETTINGS_ENABLE_PUSH, 0);
        settings.set(SETTINGS_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE);
        writer.settings(&settings)?;
        writer.window_update(0, CLIENT_WINDOW_SIZE - DEFAULT_INITIAL_WINDOW_SIZE as u64)?;

        let connection = Arc::new(Http2Connection {
            connection_name: connection_name.clone(),
            transport: transport.clone(),
            writer: Mutex::new(writer),
            state: Mutex::new(ConnState {
                streams: HashMap::new(),
                next_stream_id: 3,
                last_created_stream_id: 0,
                is_shutdown: false,
                peer_settings: Settings::new(),
                unacknowledged_bytes_read: 0,
                awaiting_pong: false,
                pong_deadline: None,
            }),
            state_cond: Condvar::new(),
            write_window: Mutex::new(DEFAULT_INITIAL_WINDOW_SIZE as i64),
            window_cond: Condvar::new(),
            max_frame_size: AtomicUsize::new(super::frame::DEFAULT_MAX_FRAME_SIZE),
            write_timeout: Mutex::new(None),
        });

        let reader_conn = connection.clone();
        thread::Builder::new()
            .name(format!("courier {} Http2Reader", connection_name))
            .spawn(move || reader_conn.read_frames())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

        Ok(connection)
    }

    pub(crate) fn set_write_timeout(&self, timeout: Option<Duration>) {
        *self.write_timeout.lock().unwrap() = timeout;
    }

    /// Creates the next outbound stream and writes its HEADERS. The
    /// writer lock spans id allocation and the write so stream ids reach
    /// the wire in increasing order.
    pub(crate) fn new_stream(
        self: &Arc<Self>,
        headers: &[(String, String)],
        out_finished: bool,
    ) -> io::Result<Arc<Http2Stream>> {
        let mut writer = self.writer.lock().unwrap();
        let stream = {
            let mut state = self.state.lock().unwrap();
            if state.is_shutdown {
                return Err(io::Error::new(io::ErrorKind::Other, ConnectionShutdown));
            }
            let id = state.next_stream_id;
            state.next_stream_id += 2;
            state.last_created_stream_id = id;
            let stream = Arc::new(Http2Stream::new(
                id,
                self.clone(),
                state.peer_settings.initial_window_size() as i64,
                out_finished,
            ));
            state.streams.insert(id, stream.clone());
            stream
        };
        writer.headers(stream.id(), headers, out_finished)?;
        Ok(stream)
    }

    pub(crate) fn max_data_length(&self) -> usize {
        self.max_frame_size.load(Ordering::Relaxed)
    }

    /// Writes DATA, waiting for connection-level window as needed. The
    /// stream-level window was already charged by the caller.
    pub(crate) fn write_data(
        &self,
        stream_id: u32,
        out_finished: bool,
        buf: &[u8],
    ) -> io::Result<()> {
        if buf.is_empty() {
            return self.writer.lock().unwrap().data(stream_id, out_finished, buf);
        }
        let timeout = *self.write_timeout.lock().unwrap();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut offset = 0;
        while offset < buf.len() {
            let n;
            {
                let mut window = self.write_window.lock().unwrap();
                loop {
                    if self.is_shutdown() {
                        return Err(io::Error::new(io::ErrorKind::Other, ConnectionShutdown));
                    }
                    if *window > 0 {
                        n = (buf.len() - offset)
                            .min(*window as usize)
                            .min(self.max_data_length());
                        *window -= n as i64;
                        break;
                    }
                    window = match deadline {
                        None => self.window_cond.wait(window).unwrap(),
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                return Err(io::Error::new(
                                    io::ErrorKind::TimedOut,
                                    "write timed out awaiting window",
                                ));
                            }
                            self.window_cond.wait_timeout(window, deadline - now).unwrap().0
                        }
                    };
                }
            }
            let end = offset + n;
            self.writer.lock().unwrap().data(
                stream_id,
                out_finished && end == buf.len(),
                &buf[offset..end],
            )?;
            offset = end;
        }
        Ok(())
    }

    pub(crate) fn write_window_update(&self, stream_id: u32, increment: u64) -> io::Result<()> {
        self.writer.lock().unwrap().window_update(stream_id, increment)
    }

    pub(crate) fn write_rst(&self, stream_id: u32, error_code: ErrorCode) -> io::Result<()> {
        self.writer.lock().unwrap().rst_stream(stream_id, error_code)
    }

    /// Sends an unsolicited PING to probe liveness. The answer is
    /// observed by [`is_healthy`](Http2Connection::is_healthy).
    pub(crate) fn send_liveness_ping(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.awaiting_pong || state.is_shutdown {
                return;
            }
            state.awaiting_pong = true;
            state.pong_deadline = Some(Instant::now() + DEGRADED_PONG_TIMEOUT);
        }
        if let Err(e) = self.writer.lock().unwrap().ping(false, 0x4f4b_6f6b, 0) {
            debug!("{}: liveness ping failed: {}", self.connection_name, e);
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.state.lock().unwrap().is_shutdown
    }

    /// Whether new exchanges may be dispatched here.
    pub(crate) fn is_healthy(&self) -> bool {
        let state = self.state.lock().unwrap();
        if state.is_shutdown {
            return false;
        }
        match (state.awaiting_pong, state.pong_deadline) {
            (true, Some(deadline)) => Instant::now() < deadline,
            _ => true,
        }
    }

    pub(crate) fn max_concurrent_streams(&self) -> u32 {
        self.state.lock().unwrap().peer_settings.max_concurrent_streams()
    }

    pub(crate) fn forget(&self, stream_id: u32) {
        self.state.lock().unwrap().streams.remove(&stream_id);
    }

    /// Sends GOAWAY and refuses further streams. In-flight streams
    /// continue.
    pub(crate) fn shutdown(&self, error_code: ErrorCode) {
        let last_created = {
            let mut state = self.state.lock().unwrap();
            if state.is_shutdown {
                return;
            }
            state.is_shutdown = true;
            state.last_created_stream_id
        };
        if let Err(e) = self
            .writer
            .lock()
            .unwrap()
            .goaway(last_created, error_code, b"")
        {
            debug!("{}: goaway failed: {}", self.connection_name, e);
        }
    }

    /// Tears the whole session down: GOAWAY, fail every stream, close the
    /// socket.
    pub(crate) fn close(&self) {
        self.shutdown(ErrorCode::NoError);
        self.fail_streams("connection closed");
        self.transport.shutdown();
    }

    fn fail_streams(&self, message: &str) {
        let streams: Vec<Arc<Http2Stream>> = {
            let mut state = self.state.lock().unwrap();
            state.streams.drain().map(|(_, s)| s).collect()
        };
        for stream in streams {
            stream.connection_error(message);
        }
        self.window_cond.notify_all();
        self.state_cond.notify_all();
    }

    // The reader thread.

    fn read_frames(self: Arc<Self>) {
        // Stream read timeouts are enforced on the stream condvars, so
        // the demultiplexer itself blocks without a deadline.
        let _ = self.transport.set_read_timeout(None);
        let mut reader = FrameReader::new(BufReader::with_capacity(
            16 * 1024,
            TransportReader::new(self.transport.clone()),
        ));
        loop {
            match reader.next_frame() {
                Ok(frame) => {
                    if let Err(e) = self.handle_frame(frame) {
                        warn!("{}: failing connection: {}", self.connection_name, e);
                        self.fail_connection(&e);
                        return;
                    }
                }
                Err(e) => {
                    debug!("{}: reader finished: {}", self.connection_name, e);
                    self.fail_connection(&e);
                    return;
                }
            }
        }
    }

    fn handle_frame(&self, frame: Frame) -> io::Result<()> {
        match frame {
            Frame::Data {
                stream_id,
                data,
                end_stream,
            } => {
                // Connection-level flow accounting covers every DATA
                // frame, even ones for forgotten streams.
                let acknowledge = {
                    let mut state = self.state.lock().unwrap();
                    state.unacknowledged_bytes_read += data.len() as u64;
                    if state.unacknowledged_bytes_read >= CLIENT_WINDOW_SIZE / 2 {
                        std::mem::take(&mut state.unacknowledged_bytes_read)
                    } else {
                        0
                    }
                };
                if acknowledge > 0 {
                    self.write_window_update(0, acknowledge)?;
                }

                let stream = self.state.lock().unwrap().streams.get(&stream_id).cloned();
                match stream {
                    Some(stream) => {
                        stream.receive_data(data, end_stream);
                        if stream.is_done() {
                            self.forget(stream_id);
                        }
                    }
                    None => {
                        trace!("data for unknown stream {}", stream_id);
                        let _ = self.write_rst(stream_id, ErrorCode::StreamClosed);
                    }
                }
            }
            Frame::Headers {
                stream_id,
                headers,
                end_stream,
            } => {
                let stream = self.state.lock().unwrap().streams.get(&stream_id).cloned();
                match stream {
                    Some(stream) => {
                        stream.receive_headers(headers, end_stream);
                        if stream.is_done() {
                            self.forget(stream_id);
                        }
                    }
                    None => trace!("headers for unknown stream {}", stream_id),
                }
            }
            Frame::Priority { .. } => {}
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                let stream = self.state.lock().unwrap().streams.remove(&stream_id);
                if let Some(stream) = stream {
                    debug!("stream {} reset by peer: {:?}", stream_id, error_code);
                    stream.receive_rst(error_code);
                }
            }
            Frame::Settings { settings, ack } => {
                if !ack {
                    self.apply_settings(&settings)?;
                }
            }
            Frame::PushPromise {
                promised_stream_id,
            } => {
                // We advertised ENABLE_PUSH = 0; decline anything pushed.
                let _ = self.write_rst(promised_stream_id, ErrorCode::Cancel);
            }
            Frame::Ping {
                ack,
                payload1,
                payload2,
            } => {
                if ack {
                    let mut state = self.state.lock().unwrap();
                    state.awaiting_pong = false;
                    state.pong_deadline = None;
                    self.state_cond.notify_all();
                } else {
                    self.writer.lock().unwrap().ping(true, payload1, payload2)?;
                }
            }
            Frame::Goaway {
                last_good_stream_id,
                error_code,
                debug_data,
            } => {
                debug!(
                    "{}: goaway last={} code={:?} debug={:?}",
                    self.connection_name, last_good_stream_id, error_code, debug_data
                );
                let refused: Vec<Arc<Http2Stream>> = {
                    let mut state = self.state.lock().unwrap();
                    state.is_shutdown = true;
                    let ids: Vec<u32> = state
                        .streams
                        .keys()
                        .copied()
                        .filter(|&id| id > last_good_stream_id)
                        .collect();
                    ids.iter()
                        .filter_map(|id| state.streams.remove(id))
                        .collect()
                };
                for stream in refused {
                    // Beyond the server's cutoff: safe to retry elsewhere.
                    stream.receive_rst(ErrorCode::RefusedStream);
                }
            }
            Frame::WindowUpdate {
                stream_id,
                window_size_increment,
            } => {
                if stream_id == 0 {
                    let mut window = self.write_window.lock().unwrap();
                    *window += window_size_increment as i64;
                    self.window_cond.notify_all();
                } else {
                    let stream =
                        self.state.lock().unwrap().streams.get(&stream_id).cloned();
                    if let Some(stream) = stream {
                        stream.receive_window_update(window_size_increment);
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_settings(&self, settings: &Settings) -> io::Result<()> {
        let (delta, streams) = {
            let mut state = self.state.lock().unwrap();
            let old_initial = state.peer_settings.initial_window_size() as i64;
            state.peer_settings.merge(settings);
            let new_initial = state.peer_settings.initial_window_size() as i64;
            self.max_frame_size
                .store(state.peer_settings.max_frame_size(), Ordering::Relaxed);
            let streams: Vec<Arc<Http2Stream>> = state.streams.values().cloned().collect();
            (new_initial - old_initial, streams)
        };
        if delta != 0 {
            for stream in streams {
                stream.adjust_send_window(delta);
            }
        }
        let mut writer = self.writer.lock().unwrap();
        let peer_settings = self.state.lock().unwrap().peer_settings;
        writer.apply_peer_settings(&peer_settings);
        writer.ack_settings()
    }

    fn fail_connection(&self, error: &io::Error) {
        {
            let mut state = self.state.lock().unwrap();
            state.is_shutdown = true;
        }
        self.fail_streams(&format!("http2 connection failed: {}", error));
        self.writer.lock().unwrap().mark_closed();
        self.transport.shutdown();
    }
}

impl std::fmt::Debug for Http2Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Connection")
            .field("connection_name", &self.connection_name)
            .finish()
    }
}
