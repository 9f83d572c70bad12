// Copyright 2024 The Revfs Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Serialized property lists.
//!
//! Revision properties, node properties, and directory-entry tables all use
//! the same length-prefixed text format:
//!
//! ```text
//! K <keylen>\n<key>\nV <vallen>\n<value>\n ... END\n
//! ```
//!
//! Mutable overlay files inside a transaction additionally use `D <keylen>`
//! records to mark deletions; committed data never contains `D` records.

use std::collections::BTreeMap;

use thiserror::Error;

/// Property values are byte strings; keys are UTF-8.
pub type PropList = BTreeMap<String, Vec<u8>>;

/// Parse failure; callers wrap this into a corruption error with location.
#[derive(Debug, Error)]
#[error("Malformed property list: {reason}")]
pub struct ProplistParseError {
    /// Human-readable description of the malformation.
    pub reason: String,
}

fn malformed(reason: impl Into<String>) -> ProplistParseError {
    ProplistParseError {
        reason: reason.into(),
    }
}

/// One record of the incremental overlay format.
#[derive(Debug, PartialEq, Eq)]
pub enum PropRecord {
    /// Set `key` to `value`.
    Set(String, Vec<u8>),
    /// Delete `key`.
    Delete(String),
}

/// Serializes a property list, terminated by `END`.
pub fn write(props: &PropList) -> Vec<u8> {
    let mut out = vec![];
    for (key, value) in props {
        write_record(&mut out, &PropRecord::Set(key.clone(), value.clone()));
    }
    out.extend_from_slice(b"END\n");
    out
}

/// Appends one incremental record (no terminator).
pub fn write_record(out: &mut Vec<u8>, record: &PropRecord) {
    match record {
        PropRecord::Set(key, value) => {
            out.extend_from_slice(format!("K {}\n", key.len()).as_bytes());
            out.extend_from_slice(key.as_bytes());
            out.push(b'\n');
            out.extend_from_slice(format!("V {}\n", value.len()).as_bytes());
            out.extend_from_slice(value);
            out.push(b'\n');
        }
        PropRecord::Delete(key) => {
            out.extend_from_slice(format!("D {}\n", key.len()).as_bytes());
            out.extend_from_slice(key.as_bytes());
            out.push(b'\n');
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn read_header(&mut self) -> Result<(u8, usize), ProplistParseError> {
        let rest = &self.data[self.pos..];
        let eol = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| malformed("missing newline in record header"))?;
        let line = &rest[..eol];
        self.pos += eol + 1;
        let (tag, len_str) = match line {
            [tag @ (b'K' | b'V' | b'D'), b' ', len @ ..] => (*tag, len),
            _ => return Err(malformed("unrecognized record header")),
        };
        let len: usize = std::str::from_utf8(len_str)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| malformed("bad length in record header"))?;
        Ok((tag, len))
    }

    fn read_body(&mut self, len: usize) -> Result<&'a [u8], ProplistParseError> {
        // Body is followed by exactly one newline.
        if self.pos + len + 1 > self.data.len() {
            return Err(malformed("record body extends past end of data"));
        }
        let body = &self.data[self.pos..self.pos + len];
        if self.data[self.pos + len] != b'\n' {
            return Err(malformed("record body not newline-terminated"));
        }
        self.pos += len + 1;
        Ok(body)
    }

    fn peek_end(&mut self) -> bool {
        let rest = &self.data[self.pos..];
        if rest.starts_with(b"END\n") {
            self.pos += 4;
            true
        } else {
            false
        }
    }
}

/// Parses a terminated property list. Returns the map and the number of
/// bytes consumed (including the `END` line).
pub fn parse(data: &[u8]) -> Result<(PropList, usize), ProplistParseError> {
    let mut cursor = Cursor { data, pos: 0 };
    let mut props = PropList::new();
    loop {
        if cursor.peek_end() {
            return Ok((props, cursor.pos));
        }
        if cursor.at_end() {
            return Err(malformed("missing END terminator"));
        }
        match read_one(&mut cursor)? {
            PropRecord::Set(key, value) => {
                props.insert(key, value);
            }
            PropRecord::Delete(_) => {
                return Err(malformed("deletion record in committed data"));
            }
        }
    }
}

/// Parses an unterminated incremental overlay (a transaction children or
/// props file): `K`/`V` pairs upsert, `D` records delete.
pub fn parse_incremental(data: &[u8]) -> Result<PropList, ProplistParseError> {
    let mut cursor = Cursor { data, pos: 0 };
    let mut props = PropList::new();
    while !cursor.at_end() {
        // A full dump may be followed by incremental records; accept and
        // skip an embedded END line.
        if cursor.peek_end() {
            continue;
        }
        match read_one(&mut cursor)? {
            PropRecord::Set(key, value) => {
                props.insert(key, value);
            }
            PropRecord::Delete(key) => {
                props.remove(&key);
            }
        }
    }
    Ok(props)
}

fn read_one(cursor: &mut Cursor<'_>) -> Result<PropRecord, ProplistParseError> {
    let (tag, len) = cursor.read_header()?;
    let key = std::str::from_utf8(cursor.read_body(len)?)
        .map_err(|_| malformed("non-UTF-8 key"))?
        .to_string();
    match tag {
        b'K' => {
            let (tag, len) = cursor.read_header()?;
            if tag != b'V' {
                return Err(malformed("K record not followed by V record"));
            }
            let value = cursor.read_body(len)?.to_vec();
            Ok(PropRecord::Set(key, value))
        }
        b'D' => Ok(PropRecord::Delete(key)),
        _ => Err(malformed("V record without preceding K record")),
    }
}
