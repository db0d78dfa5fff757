//! HTTP/2 frame reading and writing, RFC 7540 §4 and §6.

use std::io::{self, Read, Write};

use bytes::Bytes;
use log::trace;

use super::hpack;

/// The client connection preface, sent before any frame.
pub(crate) const CONNECTION_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub(crate) const FRAME_HEADER_LEN: usize = 9;
pub(crate) const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub(crate) const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;

const TYPE_DATA: u8 = 0x0;
const TYPE_HEADERS: u8 = 0x1;
const TYPE_PRIORITY: u8 = 0x2;
const TYPE_RST_STREAM: u8 = 0x3;
const TYPE_SETTINGS: u8 = 0x4;
const TYPE_PUSH_PROMISE: u8 = 0x5;
const TYPE_PING: u8 = 0x6;
const TYPE_GOAWAY: u8 = 0x7;
const TYPE_WINDOW_UPDATE: u8 = 0x8;
const TYPE_CONTINUATION: u8 = 0x9;

pub(crate) const FLAG_END_STREAM: u8 = 0x1;
pub(crate) const FLAG_ACK: u8 = 0x1;
pub(crate) const FLAG_END_HEADERS: u8 = 0x4;
pub(crate) const FLAG_PADDED: u8 = 0x8;
pub(crate) const FLAG_PRIORITY: u8 = 0x20;

/// The error codes of RST_STREAM and GOAWAY frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum ErrorCode {
    NoError,
    ProtocolError,
    InternalError,
    FlowControlError,
    SettingsTimeout,
    StreamClosed,
    FrameSizeError,
    RefusedStream,
    Cancel,
    CompressionError,
    ConnectError,
    EnhanceYourCalm,
    InadequateSecurity,
    Http11Required,
}

impl ErrorCode {
    pub(crate) fn from_code(code: u32) -> Option<ErrorCode> {
        Some(match code {
            0 => ErrorCode::NoError,
            1 => ErrorCode::ProtocolError,
            2 => ErrorCode::InternalError,
            3 => ErrorCode::FlowControlError,
            4 => ErrorCode::SettingsTimeout,
            5 => ErrorCode::StreamClosed,
            6 => ErrorCode::FrameSizeError,
            7 => ErrorCode::RefusedStream,
            8 => ErrorCode::Cancel,
            9 => ErrorCode::CompressionError,
            10 => ErrorCode::ConnectError,
            11 => ErrorCode::EnhanceYourCalm,
            12 => ErrorCode::InadequateSecurity,
            13 => ErrorCode::Http11Required,
            _ => return None,
        })
    }

    pub(crate) fn code(&self) -> u32 {
        match *self {
            ErrorCode::NoError => 0,
            ErrorCode::ProtocolError => 1,
            ErrorCode::InternalError => 2,
            ErrorCode::FlowControlError => 3,
            ErrorCode::SettingsTimeout => 4,
            ErrorCode::StreamClosed => 5,
            ErrorCode::FrameSizeError => 6,
            ErrorCode::RefusedStream => 7,
            ErrorCode::Cancel => 8,
            ErrorCode::CompressionError => 9,
            ErrorCode::ConnectError => 10,
            ErrorCode::EnhanceYourCalm => 11,
            ErrorCode::InadequateSecurity => 12,
            ErrorCode::Http11Required => 13,
        }
    }
}

/// SETTINGS parameters, ours or the peer's.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Settings {
    values: [u32; 7],
    set: u8,
}

pub(crate) const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub(crate) const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub(crate) const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub(crate) const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub(crate) const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub(crate) const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;

impl Settings {
    pub(crate) fn new() -> Settings {
        Settings {
            values: [0; 7],
            set: 0,
        }
    }

    pub(crate) fn set(&mut self, id: u16, value: u32) -> &mut Settings {
        if (1..7).contains(&(id as usize)) {
            self.values[id as usize] = value;
            self.set |= 1 << id;
        }
        self
    }

    pub(crate) fn is_set(&self, id: u16) -> bool {
        self.set & (1 << id) != 0
    }

    fn get(&self, id: u16, default: u32) -> u32 {
        if self.is_set(id) {
            self.values[id as usize]
        } else {
            default
        }
    }

    pub(crate) fn header_table_size(&self) -> u32 {
        self.get(SETTINGS_HEADER_TABLE_SIZE, 4096)
    }

    pub(crate) fn max_concurrent_streams(&self) -> u32 {
        self.get(SETTINGS_MAX_CONCURRENT_STREAMS, u32::MAX)
    }

    pub(crate) fn initial_window_size(&self) -> u32 {
        self.get(SETTINGS_INITIAL_WINDOW_SIZE, DEFAULT_INITIAL_WINDOW_SIZE)
    }

    pub(crate) fn max_frame_size(&self) -> usize {
        self.get(SETTINGS_MAX_FRAME_SIZE, DEFAULT_MAX_FRAME_SIZE as u32) as usize
    }

    /// Overlays `other`'s explicit values onto this one.
    pub(crate) fn merge(&mut self, other: &Settings) {
        for id in 1..7u16 {
            if other.is_set(id) {
                self.set(id, other.values[id as usize]);
            }
        }
    }

    fn entries(&self) -> Vec<(u16, u32)> {
        (1..7u16)
            .filter(|&id| self.is_set(id))
            .map(|id| (id, self.values[id as usize]))
            .collect()
    }
}

/// One decoded frame, with header blocks already assembled across
/// CONTINUATION frames and run through HPACK.
#[derive(Debug)]
pub(crate) enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
    },
    Headers {
        stream_id: u32,
        headers: Vec<(String, String)>,
        end_stream: bool,
    },
    Priority {
        stream_id: u32,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    Settings {
        settings: Settings,
        ack: bool,
    },
    /// A push the client did not ask for. The header block is decoded to
    /// keep HPACK state consistent, then dropped.
    PushPromise {
        promised_stream_id: u32,
    },
    Ping {
        ack: bool,
        payload1: u32,
        payload2: u32,
    },
    Goaway {
        last_good_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        window_size_increment: u32,
    },
}

fn protocol_error(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

struct RawFrame {
    length: usize,
    type_: u8,
    flags: u8,
    stream_id: u32,
    payload: Vec<u8>,
}

/// Reads frames from the connection, demultiplexer side.
pub(crate) struct FrameReader<R> {
    source: R,
    hpack: hpack::Decoder,
    max_frame_size: usize,
}

impl<R: Read> FrameReader<R> {
    pub(crate) fn new(source: R) -> FrameReader<R> {
        FrameReader {
            source,
            hpack: hpack::Decoder::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    fn read_raw(&mut self) -> io::Result<RawFrame> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        read_full(&mut self.source, &mut header)?;
        let length = ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize;
        if length > self.max_frame_size {
            return Err(protocol_error(format!("FRAME_SIZE_ERROR: {}", length)));
        }
        let type_ = header[3];
        let flags = header[4];
        let stream_id = u32::from_be_bytes([header[5], header[6], header[7], header[8]])
            & 0x7fff_ffff; // dropping the reserved bit
        let mut payload = vec![0u8; length];
        read_full(&mut self.source, &mut payload)?;
        trace!(
            "<< frame type={} flags={:#x} stream={} length={}",
            type_,
            flags,
            stream_id,
            length
        );
        Ok(RawFrame {
            length,
            type_,
            flags,
            stream_id,
            payload,
        })
    }

    /// Reads the next logical frame, assembling CONTINUATIONs.
    pub(crate) fn next_frame(&mut self) -> io::Result<Frame> {
        let raw = self.read_raw()?;
        match raw.type_ {
            TYPE_DATA => self.read_data(raw),
            TYPE_HEADERS => self.read_headers(raw),
            TYPE_PRIORITY => {
                if raw.length != 5 {
                    return Err(protocol_error("TYPE_PRIORITY length != 5"));
                }
                Ok(Frame::Priority {
                    stream_id: raw.stream_id,
                })
            }
            TYPE_RST_STREAM => {
                if raw.length != 4 {
                    return Err(protocol_error("TYPE_RST_STREAM length != 4"));
                }
                if raw.stream_id == 0 {
                    return Err(protocol_error("TYPE_RST_STREAM streamId == 0"));
                }
                let code = u32::from_be_bytes(raw.payload[..4].try_into().unwrap());
                let error_code = ErrorCode::from_code(code)
                    .ok_or_else(|| protocol_error(format!("unexpected error code: {}", code)))?;
                Ok(Frame::RstStream {
                    stream_id: raw.stream_id,
                    error_code,
                })
            }
            TYPE_SETTINGS => self.read_settings(raw),
            TYPE_PUSH_PROMISE => self.read_push_promise(raw),
            TYPE_PING => {
                if raw.length != 8 {
                    return Err(protocol_error("TYPE_PING length != 8"));
                }
                if raw.stream_id != 0 {
                    return Err(protocol_error("TYPE_PING streamId != 0"));
                }
                Ok(Frame::Ping {
                    ack: raw.flags & FLAG_ACK != 0,
                    payload1: u32::from_be_bytes(raw.payload[..4].try_into().unwrap()),
                    payload2: u32::from_be_bytes(raw.payload[4..8].try_into().unwrap()),
                })
            }
            TYPE_GOAWAY => {
                if raw.length < 8 {
                    return Err(protocol_error("TYPE_GOAWAY length < 8"));
                }
                let last_good_stream_id =
                    u32::from_be_bytes(raw.payload[..4].try_into().unwrap()) & 0x7fff_ffff;
                let code = u32::from_be_bytes(raw.payload[4..8].try_into().unwrap());
                let error_code = ErrorCode::from_code(code)
                    .ok_or_else(|| protocol_error(format!("unexpected error code: {}", code)))?;
                Ok(Frame::Goaway {
                    last_good_stream_id,
                    error_code,
                    debug_data: Bytes::copy_from_slice(&raw.payload[8..]),
                })
            }
            TYPE_WINDOW_UPDATE => {
                if raw.length != 4 {
                    return Err(protocol_error("TYPE_WINDOW_UPDATE length != 4"));
                }
                let increment =
                    u32::from_be_bytes(raw.payload[..4].try_into().unwrap()) & 0x7fff_ffff;
                if increment == 0 {
                    return Err(protocol_error("windowSizeIncrement was 0"));
                }
                Ok(Frame::WindowUpdate {
                    stream_id: raw.stream_id,
                    window_size_increment: increment,
                })
            }
            TYPE_CONTINUATION => Err(protocol_error("CONTINUATION without preceding HEADERS")),
            _ => {
                // Unknown frame types must be ignored.
                trace!("ignoring unknown frame type {}", raw.type_);
                self.next_frame()
            }
        }
    }

    fn read_data(&mut self, raw: RawFrame) -> io::Result<Frame> {
        if raw.stream_id == 0 {
            return Err(protocol_error("TYPE_DATA streamId == 0"));
        }
        let end_stream = raw.flags & FLAG_END_STREAM != 0;
        let payload = strip_padding(raw.payload, raw.flags)?;
        Ok(Frame::Data {
            stream_id: raw.stream_id,
            data: Bytes::from(payload),
            end_stream,
        })
    }

    fn read_headers(&mut self, raw: RawFrame) -> io::Result<Frame> {
        if raw.stream_id == 0 {
            return Err(protocol_error("TYPE_HEADERS streamId == 0"));
        }
        let end_stream = raw.flags & FLAG_END_STREAM != 0;
        let mut payload = strip_padding(raw.payload, raw.flags)?;
        if raw.flags & FLAG_PRIORITY != 0 {
            if payload.len() < 5 {
                return Err(protocol_error("TYPE_HEADERS priority too short"));
            }
            payload.drain(..5);
        }
        let block = self.read_header_block(payload, raw.flags, raw.stream_id)?;
        let headers = self
            .hpack
            .decode(&block)
            .map_err(|e| protocol_error(format!("COMPRESSION_ERROR: {}", e)))?;
        Ok(Frame::Headers {
            stream_id: raw.stream_id,
            headers,
            end_stream,
        })
    }

    fn read_settings(&mut self, raw: RawFrame) -> io::Result<Frame> {
        if raw.stream_id != 0 {
            return Err(protocol_error("TYPE_SETTINGS streamId != 0"));
        }
        if raw.flags & FLAG_ACK != 0 {
            if raw.length != 0 {
                return Err(protocol_error("FRAME_SIZE_ERROR ack frame should be empty"));
            }
            return Ok(Frame::Settings {
                settings: Settings::new(),
                ack: true,
            });
        }
        if raw.length % 6 != 0 {
            return Err(protocol_error(format!(
                "TYPE_SETTINGS length % 6 != 0: {}",
                raw.length
            )));
        }
        let mut settings = Settings::new();
        for chunk in raw.payload.chunks_exact(6) {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
            match id {
                SETTINGS_ENABLE_PUSH if value > 1 => {
                    return Err(protocol_error("PROTOCOL_ERROR SETTINGS_ENABLE_PUSH != 0 or 1"))
                }
                SETTINGS_INITIAL_WINDOW_SIZE if value > 0x7fff_ffff => {
                    return Err(protocol_error(
                        "PROTOCOL_ERROR SETTINGS_INITIAL_WINDOW_SIZE > 2^31 - 1",
                    ))
                }
                SETTINGS_MAX_FRAME_SIZE if !(16_384..=16_777_215).contains(&value) => {
                    return Err(protocol_error(format!(
                        "PROTOCOL_ERROR SETTINGS_MAX_FRAME_SIZE: {}",
                        value
                    )))
                }
                _ => {}
            }
            settings.set(id, value);
        }
        Ok(Frame::Settings {
            settings,
            ack: false,
        })
    }

    fn read_push_promise(&mut self, raw: RawFrame) -> io::Result<Frame> {
        if raw.stream_id == 0 {
            return Err(protocol_error("TYPE_PUSH_PROMISE streamId == 0"));
        }
        let mut payload = strip_padding(raw.payload, raw.flags)?;
        if payload.len() < 4 {
            return Err(protocol_error("TYPE_PUSH_PROMISE too short"));
        }
        let promised_stream_id =
            u32::from_be_bytes(payload[..4].try_into().unwrap()) & 0x7fff_ffff;
        payload.drain(..4);
        // Decode the block to keep the HPACK dynamic table in sync, then
        // drop it: this client never accepts pushes.
        let block = self.read_header_block(payload, raw.flags, raw.stream_id)?;
        let _ = self
            .hpack
            .decode(&block)
            .map_err(|e| protocol_error(format!("COMPRESSION_ERROR: {}", e)))?;
        Ok(Frame::PushPromise {
            promised_stream_id,
        })
    }

    /// Concatenates CONTINUATION payloads until END_HEADERS.
    fn read_header_block(
        &mut self,
        first: Vec<u8>,
        first_flags: u8,
        stream_id: u32,
    ) -> io::Result<Vec<u8>> {
        let mut block = first;
        let mut end_headers = first_flags & FLAG_END_HEADERS != 0;
        while !end_headers {
            let raw = self.read_raw()?;
            if raw.type_ != TYPE_CONTINUATION {
                return Err(protocol_error(format!(
                    "{} frame during header block",
                    raw.type_
                )));
            }
            if raw.stream_id != stream_id {
                return Err(protocol_error("TYPE_CONTINUATION streamId changed"));
            }
            end_headers = raw.flags & FLAG_END_HEADERS != 0;
            block.extend_from_slice(&raw.payload);
        }
        Ok(block)
    }
}

fn strip_padding(mut payload: Vec<u8>, flags: u8) -> io::Result<Vec<u8>> {
    if flags & FLAG_PADDED != 0 {
        if payload.is_empty() {
            return Err(protocol_error("PROTOCOL_ERROR padded frame is empty"));
        }
        let pad_length = payload[0] as usize;
        if pad_length + 1 > payload.len() {
            return Err(protocol_error("PROTOCOL_ERROR padding > frame length"));
        }
        payload.drain(..1);
        payload.truncate(payload.len() - pad_length);
    }
    Ok(payload)
}

fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..])?;
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

/// Writes frames to the connection. Callers hold the connection's writer
/// lock, which is what makes a HEADERS + CONTINUATION sequence atomic on
/// the wire.
pub(crate) struct FrameWriter<W> {
    sink: W,
    hpack: hpack::Encoder,
    max_frame_size: usize,
    closed: bool,
}

impl<W: Write> FrameWriter<W> {
    pub(crate) fn new(sink: W) -> FrameWriter<W> {
        FrameWriter {
            sink,
            hpack: hpack::Encoder::new(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            closed: false,
        }
    }

    pub(crate) fn connection_preface(&mut self) -> io::Result<()> {
        self.sink.write_all(CONNECTION_PREFACE)
    }

    /// Applies the peer's settings to outbound framing.
    pub(crate) fn apply_peer_settings(&mut self, settings: &Settings) {
        self.max_frame_size = settings.max_frame_size();
        self.hpack
            .set_max_dynamic_table_size(settings.header_table_size() as usize);
    }

    pub(crate) fn settings(&mut self, settings: &Settings) -> io::Result<()> {
        let entries = settings.entries();
        self.frame_header(entries.len() * 6, TYPE_SETTINGS, 0, 0)?;
        for (id, value) in entries {
            self.sink.write_all(&id.to_be_bytes())?;
            self.sink.write_all(&value.to_be_bytes())?;
        }
        self.sink.flush()
    }

    pub(crate) fn ack_settings(&mut self) -> io::Result<()> {
        self.frame_header(0, TYPE_SETTINGS, FLAG_ACK, 0)?;
        self.sink.flush()
    }

    pub(crate) fn headers(
        &mut self,
        stream_id: u32,
        headers: &[(String, String)],
        end_stream: bool,
    ) -> io::Result<()> {
        let mut block = Vec::new();
        self.hpack.encode(headers, &mut block);

        let mut offset = 0;
        let mut first = true;
        while first || offset < block.len() {
            let length = (block.len() - offset).min(self.max_frame_size);
            let end = offset + length;
            let type_ = if first { TYPE_HEADERS } else { TYPE_CONTINUATION };
            let mut flags = 0;
            if end == block.len() {
                flags |= FLAG_END_HEADERS;
            }
            if first && end_stream {
                flags |= FLAG_END_STREAM;
            }
            self.frame_header(length, type_, flags, stream_id)?;
            self.sink.write_all(&block[offset..end])?;
            offset = end;
            first = false;
        }
        self.sink.flush()
    }

    pub(crate) fn data(&mut self, stream_id: u32, end_stream: bool, buf: &[u8]) -> io::Result<()> {
        debug_assert!(buf.len() <= self.max_frame_size);
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        self.frame_header(buf.len(), TYPE_DATA, flags, stream_id)?;
        self.sink.write_all(buf)?;
        self.sink.flush()
    }

    pub(crate) fn rst_stream(&mut self, stream_id: u32, error_code: ErrorCode) -> io::Result<()> {
        self.frame_header(4, TYPE_RST_STREAM, 0, stream_id)?;
        self.sink.write_all(&error_code.code().to_be_bytes())?;
        self.sink.flush()
    }

    pub(crate) fn ping(&mut self, ack: bool, payload1: u32, payload2: u32) -> io::Result<()> {
        let flags = if ack { FLAG_ACK } else { 0 };
        self.frame_header(8, TYPE_PING, flags, 0)?;
        self.sink.write_all(&payload1.to_be_bytes())?;
        self.sink.write_all(&payload2.to_be_bytes())?;
        self.sink.flush()
    }

    pub(crate) fn goaway(
        &mut self,
        last_good_stream_id: u32,
        error_code: ErrorCode,
        debug_data: &[u8],
    ) -> io::Result<()> {
        self.frame_header(8 + debug_data.len(), TYPE_GOAWAY, 0, 0)?;
        self.sink.write_all(&last_good_stream_id.to_be_bytes())?;
        self.sink.write_all(&error_code.code().to_be_bytes())?;
        self.sink.write_all(debug_data)?;
        self.sink.flush()
    }

    pub(crate) fn window_update(&mut self, stream_id: u32, increment: u64) -> io::Result<()> {
        debug_assert!(increment != 0 && increment <= 0x7fff_ffff);
        self.frame_header(4, TYPE_WINDOW_UPDATE, 0, stream_id)?;
        self.sink.write_all(&(increment as u32).to_be_bytes())?;
        self.sink.flush()
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    fn frame_header(
        &mut self,
        length: usize,
        type_: u8,
        flags: u8,
        stream_id: u32,
    ) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(io::ErrorKind::Other, "closed"));
        }
        trace!(
            ">> frame type={} flags={:#x} stream={} length={}",
            type_,
            flags,
            stream_id,
            length
        );
        let header = [
            (length >> 16) as u8,
            (length >> 8) as u8,
            length as u8,
            type_,
            flags,
            (stream_id >> 24) as u8,
            (stream_id >> 16) as u8,
            (stream_id >> 8) as u8,
            stream_id as u8,
        ];
        self.sink.write_all(&header)
    }
}
