//! Host canonicalisation: IPv6 text form, domain mapping, and Punycode.

/// Canonicalises a percent-decoded host. Returns `None` for invalid hosts.
///
/// `[ipv6]` forms are canonicalised per RFC 5952 and returned without
/// brackets. Domains get lower-cased, mapped, and Punycode-encoded per
/// label.
pub(crate) fn canonicalize_host(host: &str) -> Option<String> {
    if host.starts_with('[') {
        if !host.ends_with(']') {
            return None;
        }
        let address = decode_ipv6(&host[1..host.len() - 1])?;
        return Some(inet6_to_ascii(&address));
    }
    domain_to_ascii(host)
}

/// ASCII characters that terminate a host, and so may never appear inside
/// one once percent-decoding has run.
fn is_forbidden_host_char(c: char) -> bool {
    matches!(
        c,
        '\u{0}'..='\u{1f}' | '\u{7f}' | ' ' | '#' | '%' | '/' | ':' | '?' | '@' | '[' | '\\' | ']'
    )
}

fn domain_to_ascii(host: &str) -> Option<String> {
    let mut mapped = String::with_capacity(host.len());
    for c in host.chars() {
        // UTS 46 mapping, abridged: case-fold, drop soft hyphens, reject
        // anything that cannot appear in a registered name.
        match c {
            '\u{ad}' | '\u{200b}' | '\u{feff}' => continue,
            c if is_forbidden_host_char(c) => return None,
            c if c.is_whitespace() || c.is_control() => return None,
            c if c.is_ascii() => mapped.push(c.to_ascii_lowercase()),
            c => {
                for lower in c.to_lowercase() {
                    mapped.push(lower);
                }
            }
        }
    }

    let mut mapped = mapped.as_str();
    if mapped.ends_with('.') {
        mapped = &mapped[..mapped.len() - 1];
    }
    if mapped.is_empty() {
        return None;
    }

    let mut result = String::with_capacity(mapped.len());
    for label in mapped.split('.') {
        if label.is_empty() {
            return None;
        }
        let ascii_label = if label.is_ascii() {
            label.to_owned()
        } else {
            format!("xn--{}", punycode_encode(label)?)
        };
        if ascii_label.len() > 63 {
            return None;
        }
        if !result.is_empty() {
            result.push('.');
        }
        result.push_str(&ascii_label);
    }
    if result.len() > 253 {
        return None;
    }
    Some(result)
}

/// Decodes an IPv6 address from its text form, without brackets.
///
/// Accepts an embedded dotted-decimal IPv4 suffix; octal and hex octets in
/// the suffix are rejected.
pub(crate) fn decode_ipv6(input: &str) -> Option<[u8; 16]> {
    let input = input.as_bytes();
    let limit = input.len();
    let mut address = [0u8; 16];
    let mut b = 0;
    let mut compress: i32 = -1;
    let mut group_offset: usize = 0;

    let mut i = 0;
    while i < limit {
        if b == 16 {
            return None;
        }

        // Read a delimiter.
        if i + 2 <= limit && input[i] == b':' && input[i + 1] == b':' {
            if compress != -1 {
                return None;
            }
            i += 2;
            compress = b as i32;
            if i == limit {
                break;
            }
        } else if b != 0 {
            if input[i] == b':' {
                i += 1;
            } else if input[i] == b'.' {
                // A '.' means the previous group was the first IPv4 octet;
                // rewind to it and parse the rest as dotted decimal.
                if b < 2 || !decode_ipv4_suffix(input, group_offset, limit, &mut address, b - 2) {
                    return None;
                }
                b += 2;
                break;
            } else {
                return None;
            }
        }

        // Read a group, one to four hex digits.
        let mut value: u32 = 0;
        group_offset = i;
        while i < limit && input[i].is_ascii_hexdigit() {
            value = (value << 4) + (input[i] as char).to_digit(16).unwrap();
            i += 1;
        }
        let group_len = i - group_offset;
        if group_len == 0 || group_len > 4 {
            return None;
        }
        address[b] = (value >> 8) as u8;
        address[b + 1] = (value & 0xff) as u8;
        b += 2;
    }

    if b != 16 {
        if compress == -1 {
            return None;
        }
        let compress = compress as usize;
        let tail = b - compress;
        for j in (0..tail).rev() {
            address[16 - tail + j] = address[compress + j];
        }
        for slot in address.iter_mut().take(16 - tail).skip(compress) {
            *slot = 0;
        }
    }

    Some(address)
}

fn decode_ipv4_suffix(
    input: &[u8],
    pos: usize,
    limit: usize,
    address: &mut [u8; 16],
    address_offset: usize,
) -> bool {
    let mut b = address_offset;
    let mut i = pos;
    while i < limit {
        if b == address_offset + 4 {
            return false;
        }
        if b > address_offset {
            if input[i] != b'.' {
                return false;
            }
            i += 1;
        }

        let mut value: u32 = 0;
        let group_start = i;
        while i < limit && input[i].is_ascii_digit() {
            if value == 0 && i > group_start {
                return false; // leading zero: rejects octal notation
            }
            value = value * 10 + (input[i] - b'0') as u32;
            if value > 255 {
                return false;
            }
            i += 1;
        }
        if i == group_start {
            return false;
        }
        address[b] = value as u8;
        b += 1;
    }
    b == address_offset + 4
}

/// Emits the canonical RFC 5952 text form: lower-case hex, leading zeros
/// dropped, the longest run of two or more zero groups collapsed to `::`.
pub(crate) fn inet6_to_ascii(address: &[u8; 16]) -> String {
    let mut longest_run_offset = -1i32;
    let mut longest_run_length = 0;
    let mut i = 0;
    while i < 16 {
        let current_run_offset = i;
        while i < 16 && address[i] == 0 && address[i + 1] == 0 {
            i += 2;
        }
        let current_run_length = i - current_run_offset;
        if current_run_length > longest_run_length && current_run_length >= 4 {
            longest_run_offset = current_run_offset as i32;
            longest_run_length = current_run_length;
        }
        if i == current_run_offset {
            i += 2;
        }
    }

    let mut result = String::new();
    let mut i = 0;
    while i < 16 {
        if i as i32 == longest_run_offset {
            result.push_str("::");
            i += longest_run_length;
            if i == 16 {
                break;
            }
        } else if i > 0 {
            result.push(':');
        }
        let group = ((address[i] as u32) << 8) | address[i + 1] as u32;
        result.push_str(&format!("{:x}", group));
        i += 2;
    }
    result
}

// Punycode, RFC 3492. Encoding only: already-encoded `xn--` labels pass
// through `domain_to_ascii` untouched because they are ASCII.

const BASE: u32 = 36;
const TMIN: u32 = 1;
const TMAX: u32 = 26;
const SKEW: u32 = 38;
const DAMP: u32 = 700;
const INITIAL_BIAS: u32 = 72;
const INITIAL_N: u32 = 128;

fn punycode_encode(label: &str) -> Option<String> {
    let input: Vec<u32> = label.chars().map(|c| c as u32).collect();
    let mut output = String::new();

    let mut b = 0;
    for &c in &input {
        if c < 0x80 {
            output.push(c as u8 as char);
            b += 1;
        }
    }
    let basic = b;
    if basic > 0 {
        output.push('-');
    }

    let mut n = INITIAL_N;
    let mut delta: u32 = 0;
    let mut bias = INITIAL_BIAS;
    let mut h = basic;
    while h < input.len() {
        let m = input.iter().copied().filter(|&c| c >= n).min()?;
        delta = delta.checked_add((m - n).checked_mul((h + 1) as u32)?)?;
        n = m;
        for &c in &input {
            if c < n {
                delta = delta.checked_add(1)?;
            }
            if c == n {
                let mut q = delta;
                let mut k = BASE;
                loop {
                    let t = if k <= bias {
                        TMIN
                    } else if k >= bias + TMAX {
                        TMAX
                    } else {
                        k - bias
                    };
                    if q < t {
                        break;
                    }
                    output.push(encode_digit(t + (q - t) % (BASE - t)));
                    q = (q - t) / (BASE - t);
                    k += BASE;
                }
                output.push(encode_digit(q));
                bias = adapt(delta, (h + 1) as u32, h == basic);
                delta = 0;
                h += 1;
            }
        }
        delta = delta.checked_add(1)?;
        n += 1;
    }
    Some(output)
}

fn adapt(mut delta: u32, num_points: u32, first_time: bool) -> u32 {
    delta = if first_time { delta / DAMP } else { delta / 2 };
    delta += delta / num_points;
    let mut k = 0;
    while delta > ((BASE - TMIN) * TMAX) / 2 {
        delta /= BASE - TMIN;
        k += BASE;
    }
    k + (((BASE - TMIN + 1) * delta) / (delta + SKEW))
}

fn encode_digit(d: u32) -> char {
    if d < 26 {
        (b'a' + d as u8) as char
    } else {
        (b'0' + (d - 26) as u8) as char
    }
}
