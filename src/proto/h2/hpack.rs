//! HPACK header compression, RFC 7541.
//!
//! The decoder handles every instruction; the encoder emits indexed
//! entries where it can and plain literals otherwise, never huffman.

use std::collections::VecDeque;
use std::io;

use super::huffman;

/// The predefined static table, RFC 7541 Appendix A.
const STATIC_TABLE: [(&str, &str); 61] = [
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-charset", ""),
    ("accept-encoding", "gzip, deflate"),
    ("accept-language", ""),
    ("accept-ranges", ""),
    ("accept", ""),
    ("access-control-allow-origin", ""),
    ("age", ""),
    ("allow", ""),
    ("authorization", ""),
    ("cache-control", ""),
    ("content-disposition", ""),
    ("content-encoding", ""),
    ("content-language", ""),
    ("content-length", ""),
    ("content-location", ""),
    ("content-range", ""),
    ("content-type", ""),
    ("cookie", ""),
    ("date", ""),
    ("etag", ""),
    ("expect", ""),
    ("expires", ""),
    ("from", ""),
    ("host", ""),
    ("if-match", ""),
    ("if-modified-since", ""),
    ("if-none-match", ""),
    ("if-range", ""),
    ("if-unmodified-since", ""),
    ("last-modified", ""),
    ("link", ""),
    ("location", ""),
    ("max-forwards", ""),
    ("proxy-authenticate", ""),
    ("proxy-authorization", ""),
    ("range", ""),
    ("referer", ""),
    ("refresh", ""),
    ("retry-after", ""),
    ("server", ""),
    ("set-cookie", ""),
    ("strict-transport-security", ""),
    ("transfer-encoding", ""),
    ("user-agent", ""),
    ("vary", ""),
    ("via", ""),
    ("www-authenticate", ""),
];

/// Headers whose values must never enter a compression table.
const NEVER_INDEXED: [&str; 4] = [
    "authorization",
    "proxy-authorization",
    "cookie",
    "set-cookie",
];

const ENTRY_OVERHEAD: usize = 32;

fn entry_size(name: &str, value: &str) -> usize {
    name.len() + value.len() + ENTRY_OVERHEAD
}

fn compression_error(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

/// Decodes header blocks, maintaining the peer-fed dynamic table.
pub(crate) struct Decoder {
    /// Front is the most recently inserted entry (index 62).
    dynamic_table: VecDeque<(String, String)>,
    dynamic_table_size: usize,
    /// The limit the encoder may move the table size up to, from our
    /// SETTINGS.
    max_dynamic_table_size: usize,
    /// The size currently in force, possibly lowered by a table size
    /// update instruction.
    dynamic_table_size_limit: usize,
}

impl Decoder {
    pub(crate) fn new() -> Decoder {
        Decoder {
            dynamic_table: VecDeque::new(),
            dynamic_table_size: 0,
            max_dynamic_table_size: 4096,
            dynamic_table_size_limit: 4096,
        }
    }

    pub(crate) fn decode(&mut self, block: &[u8]) -> io::Result<Vec<(String, String)>> {
        let mut headers = Vec::new();
        let mut pos = 0;
        while pos < block.len() {
            let b = block[pos];
            if b & 0x80 != 0 {
                // Indexed header field.
                let (index, next) = decode_int(block, pos, 7)?;
                pos = next;
                let (name, value) = self.lookup(index)?;
                headers.push((name, value));
            } else if b & 0x40 != 0 {
                // Literal with incremental indexing.
                let (name_index, next) = decode_int(block, pos, 6)?;
                pos = next;
                let name = if name_index == 0 {
                    let (name, next) = decode_string(block, pos)?;
                    pos = next;
                    name
                } else {
                    self.lookup(name_index)?.0
                };
                let (value, next) = decode_string(block, pos)?;
                pos = next;
                self.insert(name.clone(), value.clone());
                headers.push((name, value));
            } else if b & 0x20 != 0 {
                // Dynamic table size update.
                let (size, next) = decode_int(block, pos, 5)?;
                pos = next;
                if size > self.max_dynamic_table_size {
                    return Err(compression_error(format!(
                        "Invalid dynamic table size update {}",
                        size
                    )));
                }
                self.dynamic_table_size_limit = size;
                self.evict();
            } else {
                // Literal without indexing (0x00) or never indexed (0x10).
                let (name_index, next) = decode_int(block, pos, 4)?;
                pos = next;
                let name = if name_index == 0 {
                    let (name, next) = decode_string(block, pos)?;
                    pos = next;
                    name
                } else {
                    self.lookup(name_index)?.0
                };
                let (value, next) = decode_string(block, pos)?;
                pos = next;
                headers.push((name, value));
            }
        }
        Ok(headers)
    }

    fn lookup(&self, index: usize) -> io::Result<(String, String)> {
        if index == 0 {
            return Err(compression_error("index == 0"));
        }
        if index <= STATIC_TABLE.len() {
            let (name, value) = STATIC_TABLE[index - 1];
            return Ok((name.to_owned(), value.to_owned()));
        }
        self.dynamic_table
            .get(index - STATIC_TABLE.len() - 1)
            .cloned()
            .ok_or_else(|| compression_error(format!("Header index too large {}", index)))
    }

    fn insert(&mut self, name: String, value: String) {
        let size = entry_size(&name, &value);
        if size > self.dynamic_table_size_limit {
            self.dynamic_table.clear();
            self.dynamic_table_size = 0;
            return;
        }
        self.dynamic_table_size += size;
        self.dynamic_table.push_front((name, value));
        self.evict();
    }

    fn evict(&mut self) {
        while self.dynamic_table_size > self.dynamic_table_size_limit {
            let (name, value) = self.dynamic_table.pop_back().expect("table accounting");
            self.dynamic_table_size -= entry_size(&name, &value);
        }
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("hpack::Decoder")
            .field("dynamic_table", &self.dynamic_table.len())
            .finish()
    }
}

/// Encodes header blocks, mirroring the insertions the peer's decoder
/// will make.
pub(crate) struct Encoder {
    dynamic_table: VecDeque<(String, String)>,
    dynamic_table_size: usize,
    max_dynamic_table_size: usize,
    /// A pending table size instruction to emit before the next block.
    pending_table_size_update: Option<usize>,
}

impl Encoder {
    pub(crate) fn new() -> Encoder {
        Encoder {
            dynamic_table: VecDeque::new(),
            dynamic_table_size: 0,
            max_dynamic_table_size: 4096,
            pending_table_size_update: None,
        }
    }

    pub(crate) fn set_max_dynamic_table_size(&mut self, size: usize) {
        if size != self.max_dynamic_table_size {
            self.max_dynamic_table_size = size;
            self.pending_table_size_update = Some(size);
            self.evict();
        }
    }

    pub(crate) fn encode(&mut self, headers: &[(String, String)], out: &mut Vec<u8>) {
        if let Some(size) = self.pending_table_size_update.take() {
            encode_int(size, 5, 0x20, out);
        }
        for (name, value) in headers {
            self.encode_one(name, value, out);
        }
    }

    fn encode_one(&mut self, name: &str, value: &str, out: &mut Vec<u8>) {
        if NEVER_INDEXED.contains(&name) {
            let name_index = self.find_name(name);
            encode_int(name_index, 4, 0x10, out);
            if name_index == 0 {
                encode_string(name, out);
            }
            encode_string(value, out);
            return;
        }

        if let Some(index) = self.find_full(name, value) {
            encode_int(index, 7, 0x80, out);
            return;
        }

        let name_index = self.find_name(name);
        encode_int(name_index, 6, 0x40, out);
        if name_index == 0 {
            encode_string(name, out);
        }
        encode_string(value, out);
        self.insert(name.to_owned(), value.to_owned());
    }

    fn find_full(&self, name: &str, value: &str) -> Option<usize> {
        for (i, &(n, v)) in STATIC_TABLE.iter().enumerate() {
            if n == name && v == value {
                return Some(i + 1);
            }
        }
        for (i, (n, v)) in self.dynamic_table.iter().enumerate() {
            if n == name && v == value {
                return Some(STATIC_TABLE.len() + i + 1);
            }
        }
        None
    }

    fn find_name(&self, name: &str) -> usize {
        for (i, &(n, _)) in STATIC_TABLE.iter().enumerate() {
            if n == name {
                return i + 1;
            }
        }
        for (i, (n, _)) in self.dynamic_table.iter().enumerate() {
            if n == name {
                return STATIC_TABLE.len() + i + 1;
            }
        }
        0
    }

    fn insert(&mut self, name: String, value: String) {
        let size = entry_size(&name, &value);
        if size > self.max_dynamic_table_size {
            self.dynamic_table.clear();
            self.dynamic_table_size = 0;
            return;
        }
        self.dynamic_table_size += size;
        self.dynamic_table.push_front((name, value));
        self.evict();
    }

    fn evict(&mut self) {
        while self.dynamic_table_size > self.max_dynamic_table_size {
            let (name, value) = self.dynamic_table.pop_back().expect("table accounting");
            self.dynamic_table_size -= entry_size(&name, &value);
        }
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("hpack::Encoder")
            .field("dynamic_table", &self.dynamic_table.len())
            .finish()
    }
}

/// Reads an integer with an N-bit prefix, RFC 7541 §5.1.
fn decode_int(block: &[u8], pos: usize, prefix_bits: u8) -> io::Result<(usize, usize)> {
    let mask = (1usize << prefix_bits) - 1;
    let mut value = (block[pos] as usize) & mask;
    let mut pos = pos + 1;
    if value < mask {
        return Ok((value, pos));
    }
    let mut shift = 0u32;
    loop {
        let b = *block
            .get(pos)
            .ok_or_else(|| compression_error("truncated integer"))?;
        pos += 1;
        value = value
            .checked_add(((b & 0x7f) as usize) << shift)
            .ok_or_else(|| compression_error("integer overflow"))?;
        if b & 0x80 == 0 {
            return Ok((value, pos));
        }
        shift += 7;
        if shift > 28 {
            return Err(compression_error("integer overflow"));
        }
    }
}

fn encode_int(value: usize, prefix_bits: u8, first_byte: u8, out: &mut Vec<u8>) {
    let mask = (1usize << prefix_bits) - 1;
    if value < mask {
        out.push(first_byte | value as u8);
        return;
    }
    out.push(first_byte | mask as u8);
    let mut value = value - mask;
    while value >= 0x80 {
        out.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Reads a string literal, RFC 7541 §5.2.
fn decode_string(block: &[u8], pos: usize) -> io::Result<(String, usize)> {
    let b = *block
        .get(pos)
        .ok_or_else(|| compression_error("truncated string"))?;
    let huffman_coded = b & 0x80 != 0;
    let (length, data_start) = decode_int(block, pos, 7)?;
    let data_end = data_start
        .checked_add(length)
        .filter(|&end| end <= block.len())
        .ok_or_else(|| compression_error("truncated string"))?;
    let raw = &block[data_start..data_end];
    let bytes = if huffman_coded {
        huffman::decode(raw).ok_or_else(|| compression_error("invalid huffman coding"))?
    } else {
        raw.to_vec()
    };
    let text = String::from_utf8_lossy(&bytes).into_owned();
    Ok((text, data_end))
}

fn encode_string(value: &str, out: &mut Vec<u8>) {
    encode_int(value.len(), 7, 0, out);
    out.extend_from_slice(value.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn static_indexed_fields() {
        // RFC 7541 C.2.4: ":method: GET" is index 2.
        let mut decoder = Decoder::new();
        assert_eq!(
            decoder.decode(&[0x82]).unwrap(),
            pairs(&[(":method", "GET")])
        );
    }

    #[test]
    fn rfc7541_c2_1_literal_with_indexing() {
        let block = [
            0x40, 0x0a, b'c', b'u', b's', b't', b'o', b'm', b'-', b'k', b'e', b'y', 0x0d, b'c',
            b'u', b's', b't', b'o', b'm', b'-', b'h', b'e', b'a', b'd', b'e', b'r',
        ];
        let mut decoder = Decoder::new();
        assert_eq!(
            decoder.decode(&block).unwrap(),
            pairs(&[("custom-key", "custom-header")])
        );
        // The entry landed in the dynamic table at index 62.
        assert_eq!(
            decoder.decode(&[0xbe]).unwrap(),
            pairs(&[("custom-key", "custom-header")])
        );
    }

    #[test]
    fn encode_decode_round_trip() {
        let headers = pairs(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":path", "/search?q=hpack"),
            (":authority", "example.com"),
            ("user-agent", "courier/0.1.0"),
            ("x-custom", "value"),
        ]);
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();

        for _ in 0..3 {
            let mut block = Vec::new();
            encoder.encode(&headers, &mut block);
            assert_eq!(decoder.decode(&block).unwrap(), headers);
        }
    }

    #[test]
    fn repeated_fields_shrink() {
        let headers = pairs(&[("x-trace-id", "abc123def456")]);
        let mut encoder = Encoder::new();
        let mut first = Vec::new();
        encoder.encode(&headers, &mut first);
        let mut second = Vec::new();
        encoder.encode(&headers, &mut second);
        // The second encoding is a single indexed byte.
        assert_eq!(second.len(), 1);
        assert!(first.len() > second.len());
    }

    #[test]
    fn sensitive_headers_never_indexed() {
        let headers = pairs(&[("authorization", "Bearer secret")]);
        let mut encoder = Encoder::new();
        let mut decoder = Decoder::new();
        let mut block = Vec::new();
        encoder.encode(&headers, &mut block);
        // 0x10 prefix: literal never indexed, name from static index 23.
        assert_eq!(block[0] & 0xf0, 0x10);
        assert_eq!(decoder.decode(&block).unwrap(), headers);
        assert!(decoder.dynamic_table.is_empty());
    }

    #[test]
    fn table_size_update_evicts() {
        let mut decoder = Decoder::new();
        let block = [
            0x40, 0x03, b'a', b'b', b'c', 0x03, b'd', b'e', b'f', // insert abc: def
        ];
        decoder.decode(&block).unwrap();
        assert_eq!(decoder.dynamic_table.len(), 1);
        // Size update to zero clears the table.
        decoder.decode(&[0x20]).unwrap();
        assert!(decoder.dynamic_table.is_empty());
    }

    #[test]
    fn oversized_table_update_rejected() {
        let mut decoder = Decoder::new();
        let mut block = Vec::new();
        encode_int(1 << 20, 5, 0x20, &mut block);
        assert!(decoder.decode(&block).is_err());
    }

    #[test]
    fn integer_primitives() {
        // RFC 7541 C.1.1: 10 with a 5-bit prefix.
        let mut out = Vec::new();
        encode_int(10, 5, 0, &mut out);
        assert_eq!(out, [0x0a]);
        assert_eq!(decode_int(&out, 0, 5).unwrap(), (10, 1));

        // C.1.2: 1337 with a 5-bit prefix.
        let mut out = Vec::new();
        encode_int(1337, 5, 0, &mut out);
        assert_eq!(out, [0x1f, 0x9a, 0x0a]);
        assert_eq!(decode_int(&out, 0, 5).unwrap(), (1337, 3));
    }

    #[test]
    fn huffman_strings_decode() {
        // RFC 7541 C.4.1: :authority www.example.com, huffman coded.
        let block = [
            0x41, 0x8c, 0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff,
        ];
        let mut decoder = Decoder::new();
        assert_eq!(
            decoder.decode(&block).unwrap(),
            pairs(&[(":authority", "www.example.com")])
        );
    }
}
