//! An ordered, case-insensitive list of HTTP header fields.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::Error;

/// An immutable sequence of `(name, value)` pairs.
///
/// Name lookup is ASCII case-insensitive; iteration preserves insertion
/// order. Instances are created with [`Headers::builder`] or
/// [`Headers::of`].
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Headers {
    pairs: Vec<(String, String)>,
}

impl Headers {
    /// An empty header list.
    pub fn new() -> Headers {
        Headers { pairs: Vec::new() }
    }

    /// Returns headers for the given name and value pairs.
    ///
    /// # Panics
    ///
    /// Panics if any name or value is invalid. Use [`Headers::builder`] for
    /// checked construction.
    pub fn of(pairs: &[(&str, &str)]) -> Headers {
        let mut builder = Headers::builder();
        for (name, value) in pairs {
            builder = builder.add(name, value);
        }
        builder.build()
    }

    /// Returns a new builder.
    pub fn builder() -> HeadersBuilder {
        HeadersBuilder { pairs: Vec::new() }
    }

    /// Returns a builder seeded with these headers.
    pub fn new_builder(&self) -> HeadersBuilder {
        HeadersBuilder {
            pairs: self.pairs.clone(),
        }
    }

    /// The number of fields.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether there are no fields.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// The field name at `index`, as it was added.
    pub fn name(&self, index: usize) -> &str {
        &self.pairs[index].0
    }

    /// The field value at `index`.
    pub fn value(&self, index: usize) -> &str {
        &self.pairs[index].1
    }

    /// The last value corresponding to `name`, or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values corresponding to `name`, in insertion order.
    pub fn values(&self, name: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// The distinct field names, lower-cased, in lexicographic order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pairs
            .iter()
            .map(|(n, _)| n.to_ascii_lowercase())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Groups the fields by lower-cased name, preserving the value order
    /// within each name.
    pub fn to_multimap(&self) -> BTreeMap<String, Vec<String>> {
        let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &self.pairs {
            map.entry(name.to_ascii_lowercase())
                .or_default()
                .push(value.clone());
        }
        map
    }

    /// The size of the header block when emitted as HTTP/1.1 field lines.
    pub fn byte_count(&self) -> usize {
        self.pairs
            .iter()
            .map(|(n, v)| n.len() + 2 + v.len() + 1)
            .sum()
    }

    /// Iterates the fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.pairs {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.pairs.iter().map(|(n, v)| (n, v)))
            .finish()
    }
}

/// Builds a [`Headers`] value.
#[derive(Clone, Debug, Default)]
pub struct HeadersBuilder {
    pairs: Vec<(String, String)>,
}

impl HeadersBuilder {
    /// Adds a field with the given name and value.
    ///
    /// # Panics
    ///
    /// Panics if the name or value contains forbidden characters.
    pub fn add(mut self, name: &str, value: &str) -> HeadersBuilder {
        self.try_add(name, value).unwrap_or_else(|e| panic!("{}", e));
        self
    }

    /// Adds a field from a raw `"Name: Value"` line, trimming whitespace on
    /// both sides of the colon.
    ///
    /// # Panics
    ///
    /// Panics if the line has no colon or the parts are invalid.
    pub fn add_line(mut self, line: &str) -> HeadersBuilder {
        let index = line
            .find(':')
            .unwrap_or_else(|| panic!("unexpected header: {:?}", line));
        let (name, value) = line.split_at(index);
        self.try_add(name.trim(), value[1..].trim())
            .unwrap_or_else(|e| panic!("{}", e));
        self
    }

    /// Adds a field whose value may contain non-ASCII bytes. The name is
    /// still restricted to ASCII.
    ///
    /// # Panics
    ///
    /// Panics if the name is invalid or the value contains CR, LF, or NUL.
    pub fn add_unsafe_non_ascii(mut self, name: &str, value: &str) -> HeadersBuilder {
        check_name(name).unwrap_or_else(|e| panic!("{}", e));
        check_value_lenient(value).unwrap_or_else(|e| panic!("{}", e));
        self.pairs.push((name.to_owned(), value.trim().to_owned()));
        self
    }

    /// Sets a field, removing any values previously added for its name.
    pub fn set(mut self, name: &str, value: &str) -> HeadersBuilder {
        self = self.remove_all(name);
        self.add(name, value)
    }

    /// Removes every field with the given name.
    pub fn remove_all(mut self, name: &str) -> HeadersBuilder {
        self.pairs.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self
    }

    /// The last value corresponding to `name` added so far, or `None`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Checked insert, used on wire-parsing paths where invalid input is a
    /// peer bug rather than a caller bug.
    pub(crate) fn try_add(&mut self, name: &str, value: &str) -> Result<(), Error> {
        check_name(name)?;
        check_value(value, name)?;
        self.pairs.push((name.to_owned(), value.trim().to_owned()));
        Ok(())
    }

    /// Lenient insert for received headers: trims the value and tolerates
    /// non-ASCII value bytes, but still rejects line terminators.
    pub(crate) fn try_add_lenient(&mut self, name: &str, value: &str) -> Result<(), Error> {
        check_name(name)?;
        check_value_lenient(value)?;
        self.pairs.push((name.to_owned(), value.trim().to_owned()));
        Ok(())
    }

    /// Builds the header list.
    pub fn build(self) -> Headers {
        Headers { pairs: self.pairs }
    }
}

fn check_name(name: &str) -> Result<(), Error> {
    if name.is_empty() {
        return Err(Error::new_bad_response("header name is empty"));
    }
    for (i, b) in name.bytes().enumerate() {
        if !(0x21..=0x7e).contains(&b) || b == b':' {
            return Err(Error::new_bad_response(format!(
                "unexpected char 0x{:02x} at {} in header name: {:?}",
                b, i, name
            )));
        }
    }
    Ok(())
}

fn check_value(value: &str, name: &str) -> Result<(), Error> {
    for (i, b) in value.bytes().enumerate() {
        if !(b == b'\t' || (0x20..=0x7e).contains(&b)) {
            return Err(Error::new_bad_response(format!(
                "unexpected char 0x{:02x} at {} in {} value",
                b, i, name
            )));
        }
    }
    Ok(())
}

fn check_value_lenient(value: &str) -> Result<(), Error> {
    for b in value.bytes() {
        if b == b'\r' || b == b'\n' || b == b'\0' {
            return Err(Error::new_bad_response("line terminator in header value"));
        }
    }
    Ok(())
}

// Shared header interrogation, used by the codecs and interceptors.

pub(crate) fn has_connection_token(headers: &Headers, needle: &str) -> bool {
    for value in headers.values("Connection") {
        for token in value.split(',') {
            if token.trim().eq_ignore_ascii_case(needle) {
                return true;
            }
        }
    }
    false
}

/// Parses `Content-Length`, returning `None` when absent, malformed, or
/// contradictory. If multiple values were sent they must agree.
pub(crate) fn content_length(headers: &Headers) -> Option<u64> {
    let mut folded: Option<u64> = None;
    for value in headers.values("Content-Length") {
        match value.trim().parse::<u64>() {
            Ok(n) => match folded {
                Some(prev) if prev != n => return None,
                _ => folded = Some(n),
            },
            Err(_) => return None,
        }
    }
    folded
}

/// Whether the final transfer coding is chunked.
pub(crate) fn is_chunked(headers: &Headers) -> bool {
    if let Some(value) = headers.values("Transfer-Encoding").last() {
        if let Some(encoding) = value.rsplit(',').next() {
            return encoding.trim().eq_ignore_ascii_case("chunked");
        }
    }
    false
}
