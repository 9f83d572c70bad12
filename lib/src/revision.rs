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

//! Random-access reading of committed revisions.
//!
//! A revision file is a sequence of representation bodies and node-rev
//! records followed by the folded change list and a trailer line holding
//! the root node-rev offset and the changes offset. Revisions may live
//! unpacked (one file each) or inside a shard's pack file; the reader
//! handles both through [`RevSlice`], which exposes one revision as a
//! bounded byte range of whichever physical file holds it.

use std::fs;
use std::fs::File;
use std::io::Seek as _;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::changes;
use crate::changes::Change;
use crate::file_util;
use crate::file_util::IoResultExt as _;
use crate::id::CopyId;
use crate::id::IdLocation;
use crate::id::NodeId;
use crate::id::NodeRevId;
use crate::id::RevNum;
use crate::node_rev;
use crate::node_rev::DirEntries;
use crate::node_rev::NodeKind;
use crate::node_rev::NodeRevision;
use crate::node_rev::Representation;
use crate::proplist::PropList;
use crate::store::CorruptResultExt as _;
use crate::store::FileSystem;
use crate::store::FsError;
use crate::store::FsResult;
use crate::store::Format;
use crate::store::WarningKind;

/// One revision's bytes within its physical file.
pub(crate) struct RevSlice {
    file: File,
    start: u64,
    len: u64,
    path: std::path::PathBuf,
}

impl RevSlice {
    /// Reads `len` bytes at the revision-relative `offset`.
    pub(crate) fn read_at(&mut self, offset: u64, len: usize) -> FsResult<Vec<u8>> {
        if offset + len as u64 > self.len {
            return Err(FsError::corrupt(
                &self.path,
                format!("read of {len} bytes at {offset} runs past the revision end"),
            ));
        }
        Ok(file_util::read_exact_at(&mut self.file, self.start + offset, len).context(&self.path)?)
    }

    /// The revision's total size in bytes.
    pub(crate) fn len(&self) -> u64 {
        self.len
    }

    pub(crate) fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Reads one text line starting at `offset` (up to a bounded length).
    pub(crate) fn read_line_at(&mut self, offset: u64) -> FsResult<String> {
        let want = 512.min(self.len - offset.min(self.len)) as usize;
        let buf = self.read_at(offset, want)?;
        match buf.iter().position(|&b| b == b'\n') {
            Some(eol) => String::from_utf8(buf[..eol].to_vec())
                .map_err(|_| FsError::corrupt(&self.path, "non-UTF-8 header line")),
            None => Err(FsError::corrupt(&self.path, "unterminated header line")),
        }
    }
}

/// Opens an arbitrary whole file (a proto-revision) as a slice.
pub(crate) fn open_file_slice(path: &std::path::Path) -> FsResult<RevSlice> {
    let mut file = File::open(path).context(path)?;
    let len = file.seek(std::io::SeekFrom::End(0)).context(path)?;
    Ok(RevSlice {
        file,
        start: 0,
        len,
        path: path.to_path_buf(),
    })
}

/// Opens revision `rev` for reading, without the visibility check (used by
/// internal walkers that already validated the revision).
pub(crate) fn open_rev_slice(fs: &FileSystem, rev: RevNum) -> FsResult<RevSlice> {
    let unpacked = fs.rev_file_path(rev);
    match File::open(&unpacked) {
        Ok(mut file) => {
            let len = file.seek(std::io::SeekFrom::End(0)).context(&unpacked)?;
            Ok(RevSlice {
                file,
                start: 0,
                len,
                path: unpacked,
            })
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => open_packed_slice(fs, rev),
        Err(err) => Err(file_util::PathError::new(&unpacked, err).into()),
    }
}

fn open_packed_slice(fs: &FileSystem, rev: RevNum) -> FsResult<RevSlice> {
    let Some(shard_size) = fs.format().shard_size() else {
        return Err(FsError::NoSuchRevision(rev));
    };
    let shard = rev / shard_size;
    let pack_dir = fs.pack_dir_path(shard);
    let manifest_path = pack_dir.join("manifest");
    let manifest = match fs::read_to_string(&manifest_path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(FsError::NoSuchRevision(rev));
        }
        Err(err) => return Err(file_util::PathError::new(&manifest_path, err).into()),
    };
    let offsets: Vec<u64> = manifest
        .lines()
        .map(|line| {
            line.trim()
                .parse()
                .map_err(|_| FsError::corrupt(&manifest_path, "bad manifest offset"))
        })
        .collect::<FsResult<_>>()?;
    let index = (rev - shard * shard_size) as usize;
    let start = *offsets
        .get(index)
        .ok_or_else(|| FsError::corrupt(&manifest_path, "manifest is short"))?;
    let pack_path = pack_dir.join("pack");
    let mut file = File::open(&pack_path).context(&pack_path)?;
    let file_len = file.seek(std::io::SeekFrom::End(0)).context(&pack_path)?;
    let end = offsets.get(index + 1).copied().unwrap_or(file_len);
    if start > end || end > file_len {
        return Err(FsError::corrupt(&manifest_path, "manifest offsets out of order"));
    }
    Ok(RevSlice {
        file,
        start,
        len: end - start,
        path: pack_path,
    })
}

/// Whether revision `rev` exists on disk, packed or unpacked.
pub(crate) fn revision_file_exists(fs: &FileSystem, rev: RevNum) -> FsResult<bool> {
    if fs.rev_file_path(rev).is_file() {
        return Ok(true);
    }
    match open_packed_slice(fs, rev) {
        Ok(_) => Ok(true),
        Err(FsError::NoSuchRevision(_)) => Ok(false),
        Err(err) => Err(err),
    }
}

/// Reads one node-rev record at a revision-relative offset.
fn read_record_at(slice: &mut RevSlice, offset: u64) -> FsResult<Vec<u8>> {
    // Records are a few hundred bytes; grow the read window until the
    // terminating blank line shows up.
    let mut window = 1024usize;
    loop {
        let avail = (slice.len() - offset) as usize;
        let take = window.min(avail);
        let buf = slice.read_at(offset, take)?;
        if let Some(end) = find_record_end(&buf) {
            return Ok(buf[..end].to_vec());
        }
        if take == avail {
            return Err(FsError::corrupt(slice.path(), "unterminated node-rev record"));
        }
        window *= 2;
    }
}

fn find_record_end(buf: &[u8]) -> Option<usize> {
    if buf.starts_with(b"\n") {
        return Some(1);
    }
    buf.windows(2)
        .position(|pair| pair == b"\n\n")
        .map(|pos| pos + 2)
}

/// An opened revision root.
#[derive(Debug)]
pub struct Revision<'a> {
    fs: &'a FileSystem,
    rev: RevNum,
    root_offset: u64,
    changes_offset: u64,
}

impl<'a> Revision<'a> {
    /// Opens revision `rev`. Revisions beyond the `current` pointer do not
    /// exist, even when their files are already in place.
    pub fn open(fs: &'a FileSystem, rev: RevNum) -> FsResult<Self> {
        if rev > fs.youngest()? {
            return Err(FsError::NoSuchRevision(rev));
        }
        let mut slice = open_rev_slice(fs, rev)?;
        let trailer = read_trailer(&mut slice)?;
        Ok(Self {
            fs,
            rev,
            root_offset: trailer.root_offset,
            changes_offset: trailer.changes_offset,
        })
    }

    /// The revision number.
    pub fn rev(&self) -> RevNum {
        self.rev
    }

    /// The root directory's node revision.
    pub fn root_node_rev(&self) -> FsResult<NodeRevision> {
        read_node_rev_in_revision(self.fs, self.rev, self.root_offset)
    }

    /// Walks `path` from the root; `None` if any component is missing.
    pub fn node_rev_at(&self, path: &str) -> FsResult<Option<NodeRevision>> {
        let mut current = self.root_node_rev()?;
        for component in split_path(path) {
            if current.kind != NodeKind::Dir {
                return Ok(None);
            }
            let entries = self.dir_entries_of(&current)?;
            let Some(entry) = entries.get(component) else {
                return Ok(None);
            };
            current = read_node_rev(self.fs, &entry.id)?;
        }
        Ok(Some(current))
    }

    /// The kind of the node at `path`, or `None` when absent.
    pub fn check_path(&self, path: &str) -> FsResult<Option<NodeKind>> {
        Ok(self.node_rev_at(path)?.map(|node| node.kind))
    }

    /// Lists a directory, going through the per-process directory cache.
    pub fn dir_entries_of(&self, node: &NodeRevision) -> FsResult<Arc<DirEntries>> {
        dir_entries(self.fs, node)
    }

    /// The file contents (or symlink target / serialized entries) of a
    /// node revision.
    pub fn file_contents(&self, node: &NodeRevision) -> FsResult<Vec<u8>> {
        match &node.data_rep {
            Some(rep) => crate::representation::read_fulltext(self.fs, rep),
            None => Ok(vec![]),
        }
    }

    /// The property list of a node revision.
    pub fn node_proplist(&self, node: &NodeRevision) -> FsResult<PropList> {
        node_proplist(self.fs, node)
    }

    /// The revision's folded change list, in committed order.
    pub fn changed_paths(&self) -> FsResult<IndexMap<String, Change>> {
        let mut slice = open_rev_slice(self.fs, self.rev)?;
        let trailer = read_trailer(&mut slice)?;
        let len = (trailer.trailer_offset - self.changes_offset) as usize;
        let data = slice.read_at(self.changes_offset, len)?;
        let parsed = changes::parse(&data).corruption_in(slice.path())?;
        changes::fold(parsed, true).corruption_in(slice.path())
    }
}

/// Splits a repository path into components; leading/duplicate slashes are
/// tolerated, and `""`/`"/"` both name the root.
pub(crate) fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|component| !component.is_empty())
}

/// The parsed trailer line plus its starting offset (which is where the
/// change list ends).
struct Trailer {
    root_offset: u64,
    changes_offset: u64,
    trailer_offset: u64,
}

fn read_trailer(slice: &mut RevSlice) -> FsResult<Trailer> {
    let tail_len = 64.min(slice.len()) as usize;
    let tail_offset = slice.len() - tail_len as u64;
    let tail = slice.read_at(tail_offset, tail_len)?;
    let Some((&b'\n', line)) = tail.split_last() else {
        return Err(FsError::corrupt(slice.path(), "revision does not end in a newline"));
    };
    let line_start = line
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|pos| pos + 1)
        .unwrap_or(0);
    let text = std::str::from_utf8(&line[line_start..])
        .map_err(|_| FsError::corrupt(slice.path(), "non-UTF-8 trailer"))?;
    let mut tokens = text.split_whitespace();
    let (Some(root), Some(changes), None) = (tokens.next(), tokens.next(), tokens.next()) else {
        return Err(FsError::corrupt(slice.path(), "unexpected trailer"));
    };
    let parse = |tok: &str| {
        tok.parse::<u64>()
            .map_err(|_| FsError::corrupt(slice.path(), "non-numeric trailer offset"))
    };
    Ok(Trailer {
        root_offset: parse(root)?,
        changes_offset: parse(changes)?,
        trailer_offset: tail_offset + line_start as u64,
    })
}

fn read_node_rev_in_revision(fs: &FileSystem, rev: RevNum, offset: u64) -> FsResult<NodeRevision> {
    let mut slice = open_rev_slice(fs, rev)?;
    let data = read_record_at(&mut slice, offset)?;
    let (node, _) = NodeRevision::parse(&data).corruption_in(slice.path())?;
    Ok(node)
}

/// Reads the node revision named by `id`, committed or in-transaction.
pub fn read_node_rev(fs: &FileSystem, id: &NodeRevId) -> FsResult<NodeRevision> {
    match &id.location {
        IdLocation::Revision { rev, offset } => read_node_rev_in_revision(fs, *rev, *offset),
        IdLocation::Transaction(txn_id) => {
            crate::transaction::read_txn_node_rev(fs, txn_id, &id.node_id, &id.copy_id)
        }
    }
}

/// Lists the entries of a directory node revision, consulting the
/// per-process cache for committed directories.
pub fn dir_entries(fs: &FileSystem, node: &NodeRevision) -> FsResult<Arc<DirEntries>> {
    debug_assert_eq!(node.kind, NodeKind::Dir);
    let cache_key = (!node.id.is_txn()).then(|| node.id.unparse());
    if let Some(key) = &cache_key {
        match fs.shared.dir_cache.lock() {
            Ok(mut cache) => {
                if let Some(entries) = cache.get(key) {
                    return Ok(entries.clone());
                }
            }
            Err(_) => fs.warn(WarningKind::Cache, "directory cache mutex poisoned"),
        }
    }
    let entries: Arc<DirEntries> = match &node.data_rep {
        Some(rep) if rep.is_mutable() => {
            Arc::new(crate::transaction::read_mutable_dir_entries(fs, node)?)
        }
        Some(rep) => {
            let data = crate::representation::read_fulltext(fs, rep)?;
            Arc::new(
                node_rev::parse_dir_entries(&data)
                    .corruption_in(&fs.rev_file_path(rep.revision.unwrap_or(0)))?,
            )
        }
        None => Arc::new(DirEntries::new()),
    };
    if let Some(key) = cache_key {
        if let Ok(mut cache) = fs.shared.dir_cache.lock() {
            cache.put(key, entries.clone());
        }
    }
    Ok(entries)
}

/// Reads the property list of a node revision.
pub fn node_proplist(fs: &FileSystem, node: &NodeRevision) -> FsResult<PropList> {
    match &node.prop_rep {
        Some(rep) if rep.is_mutable() => crate::transaction::read_mutable_props(fs, node),
        Some(rep) => {
            let data = crate::representation::read_fulltext(fs, rep)?;
            let (props, _) = crate::proplist::parse(&data)
                .corruption_in(&fs.rev_file_path(rep.revision.unwrap_or(0)))?;
            Ok(props)
        }
        None => Ok(PropList::new()),
    }
}

/// Largest node-ID and copy-ID keys reachable from the root of `rev`,
/// incremented by one; used by recovery on legacy repositories.
pub(crate) fn max_ids_in_revision(fs: &FileSystem, rev: RevNum) -> FsResult<(String, String)> {
    use crate::base36;
    let mut max_node = 0u64;
    let mut max_copy = 0u64;
    let revision = Revision::open(fs, rev)?;
    let mut stack = vec![revision.root_node_rev()?];
    while let Some(node) = stack.pop() {
        if let Some(value) = base36::decode(node.id.node_id.as_str()) {
            max_node = max_node.max(value + 1);
        }
        if let Some(value) = base36::decode(node.id.copy_id.as_str()) {
            max_copy = max_copy.max(value + 1);
        }
        if node.kind == NodeKind::Dir {
            for entry in dir_entries(fs, &node)?.values() {
                stack.push(read_node_rev(fs, &entry.id)?);
            }
        }
    }
    Ok((base36::encode(max_node), base36::encode(max_copy)))
}

/// Writes the hard-coded revision 0: an empty root directory, no changed
/// paths, and an `svn:date` revprop. The empty directory's checksum is
/// computed from our own serialization.
pub(crate) fn write_revision_zero(repo_path: &std::path::Path, format: &Format) -> FsResult<()> {
    use md5::Digest as _;

    let empty_dir = crate::proplist::write(&PropList::new());
    let mut body = b"PLAIN\n".to_vec();
    body.extend_from_slice(&empty_dir);
    body.extend_from_slice(b"ENDREP\n");

    let root_offset = body.len() as u64;
    let data_rep = Representation {
        revision: Some(0),
        offset: 0,
        size: empty_dir.len() as u64,
        expanded_size: empty_dir.len() as u64,
        md5: Some(md5::Md5::digest(&empty_dir).into()),
        sha1: None,
        txn_id: None,
        uniquifier: None,
    };
    let root = NodeRevision {
        id: NodeRevId::committed(NodeId::new("0"), CopyId::root(), 0, root_offset),
        kind: NodeKind::Dir,
        predecessor: None,
        predecessor_count: 0,
        created_path: "/".to_string(),
        copyroot: None,
        copyfrom: None,
        data_rep: Some(data_rep),
        prop_rep: None,
        mergeinfo: false,
        is_fresh_txn_root: false,
    };
    body.extend_from_slice(&root.write());
    let changes_offset = body.len() as u64;
    body.extend_from_slice(&changes::write([]));
    body.extend_from_slice(format!("{root_offset} {changes_offset}\n").as_bytes());

    let rev_path = match format.shard_size() {
        Some(_) => repo_path.join("revs").join("0").join("0"),
        None => repo_path.join("revs").join("0"),
    };
    fs::write(&rev_path, &body).context(&rev_path)?;

    let mut props = PropList::new();
    props.insert(
        crate::store::PROP_REVISION_DATE.to_string(),
        crate::store::date_now().into_bytes(),
    );
    let revprops_path = match format.shard_size() {
        Some(_) => repo_path.join("revprops").join("0").join("0"),
        None => repo_path.join("revprops").join("0"),
    };
    fs::write(&revprops_path, crate::proplist::write(&props)).context(&revprops_path)?;
    Ok(())
}
