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

//! The representation store.
//!
//! A representation is written as a one-line header (`PLAIN`, or
//! `DELTA <base-rev> <base-offset> <base-length>`, or bare `DELTA` for a
//! delta against the empty stream), the payload, and a cosmetic `ENDREP`
//! sentinel. Reading chases base pointers back to a PLAIN root and applies
//! the collected svndiff streams forward.
//!
//! Base selection follows the skip-delta rule: clear the lowest set bit of
//! the predecessor count and delta against the ancestor at that depth,
//! except that short jumps collapse into a linear chain and pathologically
//! long walks abandon deltification altogether.

use std::fs::File;
use std::io::Seek as _;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use digest::Digest as _;
use md5::Md5;
use sha1::Sha1;

use crate::file_util::IoResultExt as _;
use crate::id::RevNum;
use crate::id::TxnId;
use crate::node_rev::Md5Digest;
use crate::node_rev::NodeRevision;
use crate::node_rev::Representation;
use crate::node_rev::Sha1Digest;
use crate::revision;
use crate::store::FileSystem;
use crate::store::FsError;
use crate::store::FsResult;
use crate::svndiff;

/// Ceiling on delta-chain hops while reading; a longer chain means the
/// base pointers cycle and the data is corrupt.
const MAX_CHAIN_LENGTH: usize = 4096;

/// Parsed representation header line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RepHeader {
    /// Payload is the fulltext.
    Plain,
    /// Payload is an svndiff stream against the empty stream.
    DeltaAgainstEmpty,
    /// Payload is an svndiff stream against the named base representation.
    Delta {
        /// Revision holding the base.
        rev: RevNum,
        /// Offset of the base's header in that revision.
        offset: u64,
        /// On-disk payload size of the base.
        size: u64,
    },
}

impl RepHeader {
    pub(crate) fn to_line(&self) -> String {
        match self {
            Self::Plain => "PLAIN\n".to_string(),
            Self::DeltaAgainstEmpty => "DELTA\n".to_string(),
            Self::Delta { rev, offset, size } => format!("DELTA {rev} {offset} {size}\n"),
        }
    }

    fn parse(line: &str, path: &Path) -> FsResult<Self> {
        if line == "PLAIN" {
            return Ok(Self::Plain);
        }
        if line == "DELTA" {
            return Ok(Self::DeltaAgainstEmpty);
        }
        if let Some(rest) = line.strip_prefix("DELTA ") {
            let mut tokens = rest.split(' ');
            if let (Some(rev), Some(offset), Some(size), None) =
                (tokens.next(), tokens.next(), tokens.next(), tokens.next())
            {
                if let (Ok(rev), Ok(offset), Ok(size)) =
                    (rev.parse(), offset.parse(), size.parse())
                {
                    return Ok(Self::Delta { rev, offset, size });
                }
            }
        }
        Err(FsError::corrupt(path, format!("bad representation header {line:?}")))
    }
}

/// Where a representation's payload physically lives.
enum RepFile {
    Committed(RevNum),
    Proto(TxnId),
}

fn open_rep_slice(fs: &FileSystem, location: &RepFile) -> FsResult<revision::RevSlice> {
    match location {
        RepFile::Committed(rev) => revision::open_rev_slice(fs, *rev),
        RepFile::Proto(txn_id) => revision::open_file_slice(&fs.protorev_file(txn_id)),
    }
}

/// Reassembles a representation's fulltext.
///
/// The MD5 recorded in the descriptor is verified in debug builds; a
/// mismatch against the expanded size is always fatal.
pub fn read_fulltext(fs: &FileSystem, rep: &Representation) -> FsResult<Vec<u8>> {
    let location = match (&rep.txn_id, rep.revision) {
        (Some(txn_id), _) => RepFile::Proto(txn_id.clone()),
        (None, Some(rev)) => RepFile::Committed(rev),
        (None, None) => {
            return Err(FsError::corrupt(
                fs.path(),
                "representation carries neither a revision nor a transaction",
            ));
        }
    };

    // Walk to the PLAIN root, collecting the delta payloads on the way.
    let mut deltas: Vec<Vec<u8>> = vec![];
    let mut cursor = (location, rep.offset, rep.size);
    let mut fulltext = loop {
        if deltas.len() > MAX_CHAIN_LENGTH {
            return Err(FsError::corrupt(fs.path(), "delta chain does not terminate"));
        }
        let (location, offset, size) = cursor;
        let mut slice = open_rep_slice(fs, &location)?;
        let line = slice.read_line_at(offset)?;
        let header = RepHeader::parse(&line, slice.path())?;
        let payload = slice.read_at(offset + line.len() as u64 + 1, size as usize)?;
        match header {
            RepHeader::Plain => break payload,
            RepHeader::DeltaAgainstEmpty => {
                deltas.push(payload);
                break vec![];
            }
            RepHeader::Delta { rev, offset, size } => {
                deltas.push(payload);
                cursor = (RepFile::Committed(rev), offset, size);
            }
        }
    };
    for delta in deltas.into_iter().rev() {
        fulltext = svndiff::apply(&fulltext, &delta)
            .map_err(|err| FsError::corrupt(fs.path(), err))?;
    }

    if fulltext.len() as u64 != rep.expanded_size {
        return Err(FsError::corrupt(
            fs.path(),
            format!(
                "representation expanded to {} bytes, expected {}",
                fulltext.len(),
                rep.expanded_size
            ),
        ));
    }
    #[cfg(debug_assertions)]
    if let Some(expected) = &rep.md5 {
        let actual: Md5Digest = Md5::digest(&fulltext).into();
        if actual != *expected {
            return Err(FsError::corrupt(fs.path(), "representation MD5 mismatch"));
        }
    }
    Ok(fulltext)
}

/// Which representation of a node the base selection concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RepSelector {
    /// The data representation.
    Data,
    /// The property representation.
    Props,
}

fn rep_of(node: &NodeRevision, which: RepSelector) -> Option<&Representation> {
    match which {
        RepSelector::Data => node.data_rep.as_ref(),
        RepSelector::Props => node.prop_rep.as_ref(),
    }
}

/// Picks the delta base for a new representation of `node`, or `None` for
/// PLAIN. `node.predecessor_count` must already reflect the new revision.
pub(crate) fn choose_delta_base(
    fs: &FileSystem,
    node: &NodeRevision,
    which: RepSelector,
) -> FsResult<Option<Representation>> {
    let config = fs.config();
    let p = node.predecessor_count;
    if p == 0 || config.max_deltification_walk == 0 {
        return Ok(None);
    }
    let c = p & (p - 1);
    let mut walk = p - c;
    if walk < config.max_linear_deltification {
        walk = 1;
    }
    if walk > config.max_deltification_walk {
        return Ok(None);
    }

    let mut cursor = node.clone();
    for _ in 0..walk {
        let pred = cursor.predecessor.clone().ok_or_else(|| {
            FsError::corrupt(fs.path(), "predecessor chain shorter than its recorded count")
        })?;
        cursor = revision::read_node_rev(fs, &pred)?;
    }
    let Some(base_rep) = rep_of(&cursor, which).cloned() else {
        return Ok(None);
    };
    if base_rep.is_mutable() {
        // Predecessors are committed; a mutable rep here means the chain
        // points back into an aborted transaction.
        return Err(FsError::corrupt(fs.path(), "delta base is still mutable"));
    }

    // A shared base lives in a different revision than the node revision
    // that references it; its chain was built for another lineage, so
    // re-measure before committing to it.
    if base_rep.revision != cursor.id.revision() {
        let chain = measure_chain_length(fs, &base_rep)?;
        if chain > 2 * config.max_linear_deltification + 2 {
            return Ok(None);
        }
    }
    Ok(Some(base_rep))
}

/// Number of DELTA hops from `rep` to its PLAIN root.
fn measure_chain_length(fs: &FileSystem, rep: &Representation) -> FsResult<u64> {
    let mut hops = 0u64;
    let mut cursor = (
        match (&rep.txn_id, rep.revision) {
            (Some(txn_id), _) => RepFile::Proto(txn_id.clone()),
            (None, rev) => RepFile::Committed(rev.unwrap_or(0)),
        },
        rep.offset,
    );
    loop {
        if hops as usize > MAX_CHAIN_LENGTH {
            return Err(FsError::corrupt(fs.path(), "delta chain does not terminate"));
        }
        let (location, offset) = cursor;
        let mut slice = open_rep_slice(fs, &location)?;
        let line = slice.read_line_at(offset)?;
        match RepHeader::parse(&line, slice.path())? {
            RepHeader::Plain | RepHeader::DeltaAgainstEmpty => return Ok(hops),
            RepHeader::Delta { rev, offset, .. } => {
                hops += 1;
                cursor = (RepFile::Committed(rev), offset);
            }
        }
    }
}

/// The base a [`RepWriter`] deltifies against.
pub(crate) struct DeltaBase {
    /// Revision holding the base representation.
    pub rev: RevNum,
    /// Offset of the base's header.
    pub offset: u64,
    /// On-disk payload size of the base.
    pub size: u64,
    /// The base's fulltext, pre-assembled.
    pub fulltext: Vec<u8>,
}

impl DeltaBase {
    /// Loads the fulltext of a chosen base representation.
    pub(crate) fn load(fs: &FileSystem, base: &Representation) -> FsResult<Self> {
        Ok(Self {
            rev: base
                .revision
                .ok_or_else(|| FsError::corrupt(fs.path(), "delta base is still mutable"))?,
            offset: base.offset,
            size: base.size,
            fulltext: read_fulltext(fs, base)?,
        })
    }
}

/// The finished measurements of a written representation.
#[derive(Debug)]
pub(crate) struct FinishedRep {
    /// Offset of the header line within the file written to.
    pub offset: u64,
    /// On-disk payload size.
    pub size: u64,
    /// Fulltext size.
    pub expanded_size: u64,
    /// MD5 of the fulltext.
    pub md5: Md5Digest,
    /// SHA-1 of the fulltext.
    pub sha1: Sha1Digest,
    /// Offset just past the `ENDREP` sentinel.
    pub end_offset: u64,
}

/// Streams one representation into an (proto-)revision file: header,
/// payload (raw fulltext or svndiff windows), `ENDREP`.
pub(crate) struct RepWriter<'a> {
    file: &'a mut File,
    path: PathBuf,
    header_offset: u64,
    body_offset: u64,
    base: Option<DeltaBase>,
    window: Vec<u8>,
    windows_emitted: u64,
    bytes_on_disk: u64,
    expanded: u64,
    md5: Md5,
    sha1: Sha1,
}

impl<'a> RepWriter<'a> {
    /// Positions at end of file and writes the representation header.
    pub(crate) fn start(
        file: &'a mut File,
        path: &Path,
        base: Option<DeltaBase>,
    ) -> FsResult<Self> {
        let header_offset = file.seek(std::io::SeekFrom::End(0)).context(path)?;
        let header = match &base {
            None => RepHeader::Plain,
            Some(base) => RepHeader::Delta {
                rev: base.rev,
                offset: base.offset,
                size: base.size,
            },
        };
        file.write_all(header.to_line().as_bytes()).context(path)?;
        let mut writer = Self {
            file,
            path: path.to_path_buf(),
            header_offset,
            body_offset: 0,
            base,
            window: vec![],
            windows_emitted: 0,
            bytes_on_disk: 0,
            expanded: 0,
            md5: Md5::new(),
            sha1: Sha1::new(),
        };
        writer.body_offset = writer.header_offset + header.to_line().len() as u64;
        if writer.base.is_some() {
            writer
                .file
                .write_all(svndiff::HEADER)
                .context(&writer.path)?;
            writer.bytes_on_disk += svndiff::HEADER.len() as u64;
        }
        Ok(writer)
    }

    /// Appends fulltext bytes.
    pub(crate) fn write_all(&mut self, mut data: &[u8]) -> FsResult<()> {
        self.md5.update(data);
        self.sha1.update(data);
        self.expanded += data.len() as u64;
        match &self.base {
            None => {
                self.file.write_all(data).context(&self.path)?;
                self.bytes_on_disk += data.len() as u64;
            }
            Some(_) => {
                while !data.is_empty() {
                    let room = svndiff::WINDOW_SIZE - self.window.len();
                    let take = room.min(data.len());
                    self.window.extend_from_slice(&data[..take]);
                    data = &data[take..];
                    if self.window.len() == svndiff::WINDOW_SIZE {
                        self.flush_window()?;
                    }
                }
            }
        }
        Ok(())
    }

    fn flush_window(&mut self) -> FsResult<()> {
        let base = self.base.as_ref().expect("only delta writers buffer windows");
        let tview_start = self.windows_emitted as usize * svndiff::WINDOW_SIZE;
        let sview_start = tview_start.min(base.fulltext.len());
        let sview_end = (sview_start + svndiff::WINDOW_SIZE).min(base.fulltext.len());
        let window = svndiff::encode_window(
            &base.fulltext[sview_start..sview_end],
            sview_start as u64,
            &self.window,
        );
        let mut encoded = vec![];
        svndiff::write_window(&mut encoded, &window);
        self.file.write_all(&encoded).context(&self.path)?;
        self.bytes_on_disk += encoded.len() as u64;
        self.windows_emitted += 1;
        self.window.clear();
        Ok(())
    }

    /// Flushes the trailing window, writes the `ENDREP` sentinel, and
    /// reports the finished measurements.
    pub(crate) fn finish(mut self) -> FsResult<FinishedRep> {
        if self.base.is_some() && !self.window.is_empty() {
            self.flush_window()?;
        }
        self.file.write_all(b"ENDREP\n").context(&self.path)?;
        let end_offset = self
            .file
            .seek(std::io::SeekFrom::Current(0))
            .context(&self.path)?;
        debug_assert_eq!(end_offset, self.body_offset + self.bytes_on_disk + 7);
        Ok(FinishedRep {
            offset: self.header_offset,
            size: self.bytes_on_disk,
            expanded_size: self.expanded,
            md5: self.md5.finalize().into(),
            sha1: self.sha1.finalize().into(),
            end_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_line_round_trips() {
        let path = Path::new("rev");
        for header in [
            RepHeader::Plain,
            RepHeader::DeltaAgainstEmpty,
            RepHeader::Delta {
                rev: 12,
                offset: 345,
                size: 67,
            },
        ] {
            let line = header.to_line();
            let parsed = RepHeader::parse(line.trim_end(), path).unwrap();
            assert_eq!(parsed, header);
        }
        assert!(RepHeader::parse("DELTA 1 2", path).is_err());
        assert!(RepHeader::parse("plain", path).is_err());
    }
}
