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

//! The svndiff (version 0) binary delta format.
//!
//! A delta stream is the 4-byte header `SVN\0` followed by windows. Each
//! window reconstructs a bounded span of the target from three sources: a
//! window of the source text, earlier bytes of the window's own output
//! (which permits self-referential runs), and fresh literal bytes carried
//! in the window.
//!
//! Window header fields and instruction operands are variable-length
//! integers, 7 bits per byte, most significant group first, with the high
//! bit marking continuation.

use std::collections::HashMap;

use thiserror::Error;

/// Stream header magic.
pub const HEADER: &[u8; 4] = b"SVN\0";

/// Bound on the target bytes a single window may produce.
pub const WINDOW_SIZE: usize = 100_000;

// Matching granularity of the encoder. Runs shorter than this are carried
// as literal new data.
const MATCH_BLOCKSIZE: usize = 64;

/// Malformed delta stream.
#[derive(Debug, Error)]
#[error("Malformed svndiff data: {reason}")]
pub struct SvndiffError {
    /// What was wrong.
    pub reason: &'static str,
}

fn bad(reason: &'static str) -> SvndiffError {
    SvndiffError { reason }
}

/// One delta instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Copy `len` bytes from offset `offset` of the source view.
    CopySource {
        /// Offset within the source view.
        offset: usize,
        /// Number of bytes.
        len: usize,
    },
    /// Copy `len` bytes from offset `offset` of the target view produced so
    /// far. `offset + len` may exceed the bytes already produced; the copy
    /// then repeats them (a run).
    CopyTarget {
        /// Offset within the target view.
        offset: usize,
        /// Number of bytes.
        len: usize,
    },
    /// Copy the next `len` bytes of the window's new data.
    CopyNew {
        /// Number of bytes.
        len: usize,
    },
}

/// One decoded window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    /// Offset of the source view within the source text.
    pub sview_offset: u64,
    /// Length of the source view.
    pub sview_len: usize,
    /// Length of the target view this window produces.
    pub tview_len: usize,
    /// The instruction list.
    pub ops: Vec<Op>,
    /// Literal bytes consumed by [`Op::CopyNew`].
    pub new_data: Vec<u8>,
}

fn write_varint(out: &mut Vec<u8>, value: u64) {
    let mut groups = [(0u8); 10];
    let mut n = 0;
    let mut rest = value;
    loop {
        groups[n] = (rest & 0x7f) as u8;
        n += 1;
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }
    for i in (1..n).rev() {
        out.push(groups[i] | 0x80);
    }
    out.push(groups[0]);
}

fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64, SvndiffError> {
    let mut value: u64 = 0;
    loop {
        let byte = *data.get(*pos).ok_or_else(|| bad("truncated integer"))?;
        *pos += 1;
        value = value
            .checked_shl(7)
            .and_then(|v| v.checked_add(u64::from(byte & 0x7f)))
            .ok_or_else(|| bad("integer overflow"))?;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

fn write_op(instrs: &mut Vec<u8>, op: &Op) {
    let (selector, len, offset) = match op {
        Op::CopySource { offset, len } => (0u8, *len, Some(*offset)),
        Op::CopyTarget { offset, len } => (1u8, *len, Some(*offset)),
        Op::CopyNew { len } => (2u8, *len, None),
    };
    if len > 0 && len < 64 {
        instrs.push(selector << 6 | len as u8);
    } else {
        instrs.push(selector << 6);
        write_varint(instrs, len as u64);
    }
    if let Some(offset) = offset {
        write_varint(instrs, offset as u64);
    }
}

fn read_op(data: &[u8], pos: &mut usize) -> Result<Op, SvndiffError> {
    let byte = *data.get(*pos).ok_or_else(|| bad("truncated instruction"))?;
    *pos += 1;
    let selector = byte >> 6;
    let mut len = usize::from(byte & 0x3f);
    if len == 0 {
        len = read_varint(data, pos)? as usize;
        if len == 0 {
            return Err(bad("zero-length instruction"));
        }
    }
    match selector {
        0 | 1 => {
            let offset = read_varint(data, pos)? as usize;
            if selector == 0 {
                Ok(Op::CopySource { offset, len })
            } else {
                Ok(Op::CopyTarget { offset, len })
            }
        }
        2 => Ok(Op::CopyNew { len }),
        _ => Err(bad("invalid instruction selector")),
    }
}

/// Serializes one window (no stream header).
pub fn write_window(out: &mut Vec<u8>, window: &Window) {
    let mut instrs = vec![];
    for op in &window.ops {
        write_op(&mut instrs, op);
    }
    write_varint(out, window.sview_offset);
    write_varint(out, window.sview_len as u64);
    write_varint(out, window.tview_len as u64);
    write_varint(out, instrs.len() as u64);
    write_varint(out, window.new_data.len() as u64);
    out.extend_from_slice(&instrs);
    out.extend_from_slice(&window.new_data);
}

/// Parses the windows of a complete delta stream, header included.
pub fn parse_stream(data: &[u8]) -> Result<Vec<Window>, SvndiffError> {
    if !data.starts_with(HEADER) {
        return Err(bad("missing SVN\\0 header"));
    }
    let mut pos = HEADER.len();
    let mut windows = vec![];
    while pos < data.len() {
        let sview_offset = read_varint(data, &mut pos)?;
        let sview_len = read_varint(data, &mut pos)? as usize;
        let tview_len = read_varint(data, &mut pos)? as usize;
        let instr_len = read_varint(data, &mut pos)? as usize;
        let new_len = read_varint(data, &mut pos)? as usize;
        let end = pos
            .checked_add(instr_len)
            .and_then(|p| p.checked_add(new_len))
            .filter(|&end| end <= data.len());
        if end.is_none() {
            return Err(bad("window extends past end of stream"));
        }
        let instr_end = pos + instr_len;
        let mut ops = vec![];
        while pos < instr_end {
            ops.push(read_op(data, &mut pos)?);
        }
        if pos != instr_end {
            return Err(bad("instruction ran past its area"));
        }
        let new_data = data[pos..pos + new_len].to_vec();
        pos += new_len;
        windows.push(Window {
            sview_offset,
            sview_len,
            tview_len,
            ops,
            new_data,
        });
    }
    Ok(windows)
}

/// Applies one window against the full source text, appending the produced
/// target view to `out`.
pub fn apply_window(window: &Window, source: &[u8], out: &mut Vec<u8>) -> Result<(), SvndiffError> {
    let sview_end = (window.sview_offset as usize)
        .checked_add(window.sview_len)
        .filter(|&end| end <= source.len())
        .ok_or_else(|| bad("source view outside source text"))?;
    let sview = &source[window.sview_offset as usize..sview_end];

    let mut tview = Vec::with_capacity(window.tview_len);
    let mut new_pos = 0;
    for op in &window.ops {
        match *op {
            Op::CopySource { offset, len } => {
                let end = offset.checked_add(len).filter(|&e| e <= sview.len());
                let end = end.ok_or_else(|| bad("source copy outside source view"))?;
                tview.extend_from_slice(&sview[offset..end]);
            }
            Op::CopyTarget { offset, len } => {
                if offset >= tview.len() {
                    return Err(bad("target copy from unwritten bytes"));
                }
                // May overlap its own output; copy bytewise.
                for i in 0..len {
                    let byte = tview[offset + i];
                    tview.push(byte);
                }
            }
            Op::CopyNew { len } => {
                let end = new_pos + len;
                if end > window.new_data.len() {
                    return Err(bad("new-data copy past end of new data"));
                }
                tview.extend_from_slice(&window.new_data[new_pos..end]);
                new_pos = end;
            }
        }
    }
    if tview.len() != window.tview_len {
        return Err(bad("window produced wrong number of bytes"));
    }
    if new_pos != window.new_data.len() {
        return Err(bad("unconsumed new data"));
    }
    out.extend_from_slice(&tview);
    Ok(())
}

/// Applies a complete delta stream to `source`, yielding the target text.
pub fn apply(source: &[u8], delta: &[u8]) -> Result<Vec<u8>, SvndiffError> {
    let mut out = vec![];
    for window in parse_stream(delta)? {
        apply_window(&window, source, &mut out)?;
    }
    Ok(out)
}

/// Encodes `target` as a delta against `source`, producing a complete
/// stream (header included).
///
/// Windows are aligned: window `i` produces target bytes
/// `[i*W, (i+1)*W)` against the same span of the source. Within a window,
/// runs of at least [`MATCH_BLOCKSIZE`] source bytes are emitted as source
/// copies; everything else rides along as new data.
pub fn encode(source: &[u8], target: &[u8]) -> Vec<u8> {
    let mut out = HEADER.to_vec();
    if target.is_empty() {
        return out;
    }
    let mut tview_start = 0;
    while tview_start < target.len() {
        let tview_end = (tview_start + WINDOW_SIZE).min(target.len());
        let sview_start = tview_start.min(source.len());
        let sview_end = (sview_start + WINDOW_SIZE).min(source.len());
        let window = encode_window(
            &source[sview_start..sview_end],
            sview_start as u64,
            &target[tview_start..tview_end],
        );
        write_window(&mut out, &window);
        tview_start = tview_end;
    }
    out
}

/// Encodes one aligned window: `tview` against `sview`, which starts at
/// `sview_offset` of the source text. Streaming writers call this per
/// window; [`encode`] is the whole-buffer convenience.
pub fn encode_window(sview: &[u8], sview_offset: u64, tview: &[u8]) -> Window {
    let mut ops = vec![];
    let mut new_data = vec![];
    let mut pending_new = 0usize; // length of the literal run ending at `pos`

    // Index the source view by fixed-size blocks. Last write wins; a missed
    // match only costs compression, never correctness.
    let mut block_index: HashMap<&[u8], usize> = HashMap::new();
    let mut block_start = 0;
    while block_start + MATCH_BLOCKSIZE <= sview.len() {
        block_index.insert(&sview[block_start..block_start + MATCH_BLOCKSIZE], block_start);
        block_start += MATCH_BLOCKSIZE;
    }

    let mut pos = 0;
    while pos < tview.len() {
        let matched = if pos + MATCH_BLOCKSIZE <= tview.len() {
            block_index
                .get(&tview[pos..pos + MATCH_BLOCKSIZE])
                .copied()
                .map(|src_pos| {
                    let mut len = MATCH_BLOCKSIZE;
                    while pos + len < tview.len()
                        && src_pos + len < sview.len()
                        && tview[pos + len] == sview[src_pos + len]
                    {
                        len += 1;
                    }
                    (src_pos, len)
                })
        } else {
            None
        };
        match matched {
            Some((src_pos, len)) => {
                if pending_new > 0 {
                    ops.push(Op::CopyNew { len: pending_new });
                    pending_new = 0;
                }
                ops.push(Op::CopySource {
                    offset: src_pos,
                    len,
                });
                pos += len;
            }
            None => {
                new_data.push(tview[pos]);
                pending_new += 1;
                pos += 1;
            }
        }
    }
    if pending_new > 0 {
        ops.push(Op::CopyNew { len: pending_new });
    }
    Window {
        sview_offset,
        sview_len: sview.len(),
        tview_len: tview.len(),
        ops,
        new_data,
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn varint_round_trips() {
        for value in [0u64, 1, 127, 128, 300, 100_000, u64::from(u32::MAX), u64::MAX] {
            let mut buf = vec![];
            write_varint(&mut buf, value);
            let mut pos = 0;
            assert_eq!(read_varint(&buf, &mut pos).unwrap(), value);
            assert_eq!(pos, buf.len());
        }
    }

    #[test_case(b"", b"" ; "empty to empty")]
    #[test_case(b"", b"hello" ; "empty to text")]
    #[test_case(b"hello", b"" ; "text to empty")]
    #[test_case(b"hello world", b"hello world" ; "identical")]
    #[test_case(b"hello world", b"goodbye world" ; "small change")]
    fn encode_apply_round_trips(source: &[u8], target: &[u8]) {
        let delta = encode(source, target);
        assert_eq!(apply(source, &delta).unwrap(), target);
    }

    #[test]
    fn long_common_run_becomes_source_copy() {
        let source: Vec<u8> = (0..200u8).cycle().take(4096).collect();
        let mut target = source.clone();
        target.extend_from_slice(b"tail");
        let delta = encode(&source, &target);
        let windows = parse_stream(&delta).unwrap();
        assert!(windows[0]
            .ops
            .iter()
            .any(|op| matches!(op, Op::CopySource { len, .. } if *len >= 4096)));
        assert_eq!(apply(&source, &delta).unwrap(), target);
    }

    #[test]
    fn multi_window_targets_round_trip() {
        let source: Vec<u8> = (0..251u8).cycle().take(WINDOW_SIZE * 2 + 17).collect();
        let mut target = source.clone();
        target[3] = !target[3];
        target[WINDOW_SIZE + 5] = !target[WINDOW_SIZE + 5];
        target.extend_from_slice(b"beyond the last window");
        let delta = encode(&source, &target);
        assert!(parse_stream(&delta).unwrap().len() >= 3);
        assert_eq!(apply(&source, &delta).unwrap(), target);
    }

    #[test]
    fn self_referential_target_copy_expands_run() {
        // "ab" repeated via an overlapping target copy.
        let window = Window {
            sview_offset: 0,
            sview_len: 0,
            tview_len: 10,
            ops: vec![Op::CopyNew { len: 2 }, Op::CopyTarget { offset: 0, len: 8 }],
            new_data: b"ab".to_vec(),
        };
        let mut out = vec![];
        apply_window(&window, b"", &mut out).unwrap();
        assert_eq!(out, b"ababababab");
    }

    #[test]
    fn malformed_streams_are_rejected() {
        assert!(apply(b"", b"XXX").is_err());
        // Window claiming more target bytes than its ops produce.
        let mut data = HEADER.to_vec();
        let window = Window {
            sview_offset: 0,
            sview_len: 0,
            tview_len: 5,
            ops: vec![Op::CopyNew { len: 2 }],
            new_data: b"ab".to_vec(),
        };
        write_window(&mut data, &window);
        assert!(apply(b"", &data).is_err());
        // Source copy outside the source view.
        let mut data = HEADER.to_vec();
        let window = Window {
            sview_offset: 0,
            sview_len: 2,
            tview_len: 4,
            ops: vec![Op::CopySource { offset: 0, len: 4 }],
            new_data: vec![],
        };
        write_window(&mut data, &window);
        assert!(apply(b"ab", &data).is_err());
    }
}
