//! One logical stream within an HTTP/2 connection.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::StreamResetCause;

use super::conn::Http2Connection;
use super::frame::ErrorCode;

/// A bidirectional stream: client-initiated, odd-numbered, carrying one
/// request and one response.
///
/// The connection's reader thread feeds inbound frames in; application
/// threads block on the condvar until data, headers, a reset, or a
/// timeout arrives.
pub(crate) struct Http2Stream {
    id: u32,
    connection: Arc<Http2Connection>,
    state: Mutex<StreamState>,
    cond: Condvar,
}

struct StreamState {
    /// Inbound header blocks not yet taken: the response headers, then
    /// possibly interim ones before it.
    headers_queue: VecDeque<Vec<(String, String)>>,
    /// Whether at least one header block was handed out, after which a
    /// further END_STREAM block is trailers.
    headers_taken: bool,
    /// Inbound data not yet read.
    buffer: VecDeque<Bytes>,
    trailers: Option<Vec<(String, String)>>,
    /// The peer sent END_STREAM.
    in_finished: bool,
    /// We sent END_STREAM.
    out_finished: bool,
    /// The stream was reset, by the peer or by cancel.
    error_code: Option<ErrorCode>,
    /// The whole connection failed.
    connection_error: Option<String>,
    /// How many bytes we may still send on this stream.
    send_window: i64,
    /// Bytes read but not yet returned to the peer as WINDOW_UPDATE.
    unacknowledged_bytes_read: u64,
}

impl Http2Stream {
    pub(crate) fn new(
        id: u32,
        connection: Arc<Http2Connection>,
        send_window: i64,
        out_finished: bool,
    ) -> Http2Stream {
        Http2Stream {
            id,
            connection,
            state: Mutex::new(StreamState {
                headers_queue: VecDeque::new(),
                headers_taken: false,
                buffer: VecDeque::new(),
                trailers: None,
                in_finished: false,
                out_finished,
                error_code: None,
                connection_error: None,
                send_window,
                unacknowledged_bytes_read: 0,
            }),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    fn stream_error(state: &StreamState) -> Option<io::Error> {
        if let Some(ref message) = state.connection_error {
            return Some(io::Error::new(
                io::ErrorKind::ConnectionReset,
                message.clone(),
            ));
        }
        state.error_code.map(|code| {
            io::Error::new(io::ErrorKind::Other, StreamResetCause { code })
        })
    }

    /// Blocks until a header block arrives.
    pub(crate) fn take_headers(
        &self,
        timeout: Option<Duration>,
    ) -> io::Result<Vec<(String, String)>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(headers) = state.headers_queue.pop_front() {
                state.headers_taken = true;
                return Ok(headers);
            }
            if let Some(e) = Self::stream_error(&state) {
                return Err(e);
            }
            if state.in_finished {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream finished without response headers",
                ));
            }
            state = wait(&self.cond, state, deadline)?;
        }
    }

    /// Reads response data, blocking until some is available, the stream
    /// ends, or it fails.
    pub(crate) fn read(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let acknowledge;
        let read;
        {
            let mut state = self.state.lock().unwrap();
            loop {
                if let Some(front) = state.buffer.front_mut() {
                    let n = front.len().min(buf.len());
                    buf[..n].copy_from_slice(&front[..n]);
                    let _ = front.split_to(n);
                    if front.is_empty() {
                        state.buffer.pop_front();
                    }
                    state.unacknowledged_bytes_read += n as u64;
                    acknowledge = if state.unacknowledged_bytes_read
                        >= super::frame::DEFAULT_INITIAL_WINDOW_SIZE as u64 / 2
                    {
                        std::mem::take(&mut state.unacknowledged_bytes_read)
                    } else {
                        0
                    };
                    read = n;
                    break;
                }
                if let Some(e) = Self::stream_error(&state) {
                    return Err(e);
                }
                if state.in_finished {
                    return Ok(0);
                }
                state = wait(&self.cond, state, deadline)?;
            }
        }
        if acknowledge > 0 {
            let _ = self.connection.write_window_update(self.id, acknowledge);
        }
        Ok(read)
    }

    /// Writes request data, honoring the stream's send window. The
    /// connection applies its own window before the bytes hit the wire.
    pub(crate) fn write(&self, buf: &[u8], timeout: Option<Duration>) -> io::Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut remaining = buf;
        while !remaining.is_empty() {
            let n;
            {
                let mut state = self.state.lock().unwrap();
                loop {
                    if let Some(e) = Self::stream_error(&state) {
                        return Err(e);
                    }
                    if state.out_finished {
                        return Err(io::Error::new(io::ErrorKind::Other, "stream finished"));
                    }
                    if state.send_window > 0 {
                        n = remaining
                            .len()
                            .min(state.send_window as usize)
                            .min(self.connection.max_data_length());
                        state.send_window -= n as i64;
                        break;
                    }
                    state = wait(&self.cond, state, deadline)?;
                }
            }
            self.connection.write_data(self.id, false, &remaining[..n])?;
            remaining = &remaining[n..];
        }
        Ok(())
    }

    /// Sends END_STREAM, completing the outbound direction.
    pub(crate) fn finish_out(&self) -> io::Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.out_finished || state.error_code.is_some() {
                return Ok(());
            }
            state.out_finished = true;
        }
        self.connection.write_data(self.id, true, &[])
    }

    pub(crate) fn trailers(&self) -> Vec<(String, String)> {
        let state = self.state.lock().unwrap();
        state.trailers.clone().unwrap_or_default()
    }

    /// Resets the stream with CANCEL and wakes any blocked reader or
    /// writer.
    pub(crate) fn cancel(&self) {
        let _ = self.connection.write_rst(self.id, ErrorCode::Cancel);
        self.receive_rst(ErrorCode::Cancel);
        self.connection.forget(self.id);
    }

    pub(crate) fn is_done(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.error_code.is_some() || (state.in_finished && state.out_finished)
    }

    // Inbound, called from the connection's reader thread.

    pub(crate) fn receive_headers(&self, headers: Vec<(String, String)>, end_stream: bool) {
        let mut state = self.state.lock().unwrap();
        if state.headers_taken && end_stream {
            state.trailers = Some(headers);
        } else {
            state.headers_queue.push_back(headers);
        }
        if end_stream {
            state.in_finished = true;
        }
        self.cond.notify_all();
    }

    pub(crate) fn receive_data(&self, data: Bytes, end_stream: bool) {
        let mut state = self.state.lock().unwrap();
        if !data.is_empty() {
            state.buffer.push_back(data);
        }
        if end_stream {
            state.in_finished = true;
        }
        self.cond.notify_all();
    }

    pub(crate) fn receive_rst(&self, error_code: ErrorCode) {
        let mut state = self.state.lock().unwrap();
        if state.error_code.is_none() {
            state.error_code = Some(error_code);
        }
        self.cond.notify_all();
    }

    pub(crate) fn receive_window_update(&self, increment: u32) {
        let mut state = self.state.lock().unwrap();
        state.send_window += increment as i64;
        self.cond.notify_all();
    }

    /// Applies a SETTINGS_INITIAL_WINDOW_SIZE change to the send window.
    pub(crate) fn adjust_send_window(&self, delta: i64) {
        let mut state = self.state.lock().unwrap();
        state.send_window += delta;
        self.cond.notify_all();
    }

    /// Fails the stream because its connection failed.
    pub(crate) fn connection_error(&self, message: &str) {
        let mut state = self.state.lock().unwrap();
        if state.connection_error.is_none() {
            state.connection_error = Some(message.to_owned());
        }
        self.cond.notify_all();
    }
}

impl std::fmt::Debug for Http2Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Http2Stream").field("id", &self.id).finish()
    }
}

fn wait<'a>(
    cond: &Condvar,
    state: std::sync::MutexGuard<'a, StreamState>,
    deadline: Option<Instant>,
) -> io::Result<std::sync::MutexGuard<'a, StreamState>> {
    match deadline {
        None => Ok(cond.wait(state).unwrap()),
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "stream timed out"));
            }
            let (state, _result) = cond.wait_timeout(state, deadline - now).unwrap();
            Ok(state)
        }
    }
}
