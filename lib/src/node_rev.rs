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

//! Node-revision records.
//!
//! A node revision describes one version of one filesystem entity. On disk
//! it is a block of `key: value` lines terminated by a blank line, written
//! into revision files (committed form) and into per-node files inside a
//! transaction directory (mutable form).

use std::collections::BTreeMap;
use std::fmt::Write as _;

use thiserror::Error;

use crate::id::NodeRevId;
use crate::id::RevNum;
use crate::id::TxnId;
use crate::proplist;
use crate::proplist::PropList;

/// MD5 digest of a representation's fulltext.
pub type Md5Digest = [u8; 16];
/// SHA-1 digest of a representation's fulltext.
pub type Sha1Digest = [u8; 20];

/// Record parse failure. Callers wrap this into a corruption error naming
/// the file the record came from.
#[derive(Debug, Error)]
#[error("Malformed node revision: {reason}")]
pub struct NodeRevParseError {
    /// What was wrong.
    pub reason: String,
}

fn malformed(reason: impl Into<String>) -> NodeRevParseError {
    NodeRevParseError {
        reason: reason.into(),
    }
}

/// The kind of filesystem entity a node revision describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// A regular file.
    File,
    /// A directory.
    Dir,
    /// A symbolic link; the representation stores the target string.
    Symlink,
}

impl NodeKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Dir => "dir",
            Self::Symlink => "symlink",
        }
    }

    fn parse(s: &str) -> Result<Self, NodeRevParseError> {
        match s {
            "file" => Ok(Self::File),
            "dir" => Ok(Self::Dir),
            "symlink" => Ok(Self::Symlink),
            _ => Err(malformed(format!("unknown node kind {s:?}"))),
        }
    }
}

/// A descriptor naming a byte stream in storage.
///
/// While the representation is mutable its location is the owning
/// transaction; the commit rewrite replaces that with the final revision
/// number. Committed representations are immutable forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Representation {
    /// Revision whose file holds the representation; `None` while mutable.
    pub revision: Option<RevNum>,
    /// Byte offset of the representation header within the revision file
    /// (or proto-revision file while in a transaction).
    pub offset: u64,
    /// On-disk size of the payload, headers excluded.
    pub size: u64,
    /// Fulltext size after delta expansion.
    pub expanded_size: u64,
    /// MD5 of the fulltext.
    pub md5: Option<Md5Digest>,
    /// SHA-1 of the fulltext. Persisted only for file data-reps (directory
    /// and property representations keep it in memory for sharing lookups
    /// but never write it to disk).
    pub sha1: Option<Sha1Digest>,
    /// Owning transaction while mutable.
    pub txn_id: Option<TxnId>,
    /// Disambiguates otherwise-identical representations created in the
    /// same transaction: `<txn-id>/<node-id>`.
    pub uniquifier: Option<String>,
}

impl Representation {
    /// A placeholder for a representation that is mutable and has not been
    /// written yet (directory children and property overlays).
    pub fn mutable_placeholder(txn_id: TxnId, uniquifier: String) -> Self {
        Self {
            revision: None,
            offset: 0,
            size: 0,
            expanded_size: 0,
            md5: None,
            sha1: None,
            txn_id: Some(txn_id),
            uniquifier: Some(uniquifier),
        }
    }

    /// Whether this representation may still be written to.
    pub fn is_mutable(&self) -> bool {
        self.txn_id.is_some()
    }

    /// Renders the descriptor string used in `text:`/`props:` headers and
    /// in the transaction's SHA-1 sidecar files.
    pub(crate) fn unparse(&self) -> String {
        let md5_hex = |digest: &Option<Md5Digest>| {
            digest.map_or_else(|| "-".to_string(), hex::encode)
        };
        match &self.txn_id {
            Some(txn_id) => {
                if self.md5.is_none() && self.size == 0 && self.offset == 0 {
                    match &self.uniquifier {
                        Some(uniq) if !uniq.is_empty() => format!("-1 {txn_id} {uniq}"),
                        _ => format!("-1 {txn_id}"),
                    }
                } else {
                    let mut s = format!(
                        "-1 {} {} {} {}",
                        self.offset,
                        self.size,
                        self.expanded_size,
                        md5_hex(&self.md5),
                    );
                    if let (Some(sha1), Some(uniq)) = (&self.sha1, &self.uniquifier) {
                        write!(s, " {} {uniq}", hex::encode(sha1)).unwrap();
                    }
                    write!(s, " {txn_id}").unwrap();
                    s
                }
            }
            None => {
                let rev = self.revision.expect("committed rep must carry a revision");
                let mut s = format!(
                    "{rev} {} {} {} {}",
                    self.offset,
                    self.size,
                    self.expanded_size,
                    md5_hex(&self.md5),
                );
                if let (Some(sha1), Some(uniq)) = (&self.sha1, &self.uniquifier) {
                    write!(s, " {} {uniq}", hex::encode(sha1)).unwrap();
                }
                s
            }
        }
    }

    /// Parses a descriptor string.
    pub(crate) fn parse(s: &str) -> Result<Self, NodeRevParseError> {
        fn num(tok: &str) -> Result<u64, NodeRevParseError> {
            tok.parse()
                .map_err(|_| malformed(format!("bad number {tok:?} in representation")))
        }
        fn md5(tok: &str) -> Result<Option<Md5Digest>, NodeRevParseError> {
            if tok == "-" {
                return Ok(None);
            }
            let bytes = hex::decode(tok).map_err(|_| malformed("bad MD5 hex"))?;
            Ok(Some(bytes.try_into().map_err(|_| malformed("bad MD5 length"))?))
        }
        fn sha1(tok: &str) -> Result<Sha1Digest, NodeRevParseError> {
            let bytes = hex::decode(tok).map_err(|_| malformed("bad SHA-1 hex"))?;
            bytes.try_into().map_err(|_| malformed("bad SHA-1 length"))
        }
        let tokens: Vec<&str> = s.split(' ').collect();
        if tokens.first() == Some(&"-1") {
            match tokens.len() {
                2 | 3 => Ok(Self::mutable_placeholder(
                    TxnId::parse(tokens[1]).map_err(|err| malformed(err.to_string()))?,
                    tokens.get(2).copied().unwrap_or_default().to_string(),
                )),
                6 | 8 => {
                    let (sha1_digest, uniquifier, txn_tok) = if tokens.len() == 8 {
                        (Some(sha1(tokens[5])?), Some(tokens[6].to_string()), tokens[7])
                    } else {
                        (None, None, tokens[5])
                    };
                    Ok(Self {
                        revision: None,
                        offset: num(tokens[1])?,
                        size: num(tokens[2])?,
                        expanded_size: num(tokens[3])?,
                        md5: md5(tokens[4])?,
                        sha1: sha1_digest,
                        txn_id: Some(
                            TxnId::parse(txn_tok).map_err(|err| malformed(err.to_string()))?,
                        ),
                        uniquifier,
                    })
                }
                _ => Err(malformed("wrong token count in mutable representation")),
            }
        } else {
            match tokens.len() {
                5 | 7 => {
                    let (sha1_digest, uniquifier) = if tokens.len() == 7 {
                        (Some(sha1(tokens[5])?), Some(tokens[6].to_string()))
                    } else {
                        (None, None)
                    };
                    Ok(Self {
                        revision: Some(num(tokens[0])?),
                        offset: num(tokens[1])?,
                        size: num(tokens[2])?,
                        expanded_size: num(tokens[3])?,
                        md5: md5(tokens[4])?,
                        sha1: sha1_digest,
                        txn_id: None,
                        uniquifier,
                    })
                }
                _ => Err(malformed("wrong token count in representation")),
            }
        }
    }
}

/// One version of one filesystem entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRevision {
    /// The record's own identifier.
    pub id: NodeRevId,
    /// Entity kind.
    pub kind: NodeKind,
    /// The previous node revision in this node's history.
    pub predecessor: Option<NodeRevId>,
    /// Exact length of the predecessor chain back to the node's origin.
    pub predecessor_count: u64,
    /// The canonical repository path at which this node revision came into
    /// being; stable across copies of an unmodified node.
    pub created_path: String,
    /// Revision and path of the nearest ancestor created by a copy.
    /// `None` means the node revision is its own copy root (copied nodes
    /// before their commit revision is known, and nodes with no copy
    /// ancestry, whose effective root is themselves at their origin).
    pub copyroot: Option<(RevNum, String)>,
    /// Set on the copy destination itself.
    pub copyfrom: Option<(RevNum, String)>,
    /// File contents, serialized directory entries, or symlink target.
    pub data_rep: Option<Representation>,
    /// Node properties.
    pub prop_rep: Option<Representation>,
    /// Whether the subtree rooted here contains mergeinfo.
    pub mergeinfo: bool,
    /// Marks the root node-rev created by `begin-txn`; cleared by commit.
    pub is_fresh_txn_root: bool,
}

impl NodeRevision {
    /// The effective copy root: the stored value, or the node revision
    /// itself when none is recorded.
    pub fn copy_root(&self) -> (RevNum, String) {
        match &self.copyroot {
            Some((rev, path)) => (*rev, path.clone()),
            None => (
                self.id.revision().unwrap_or(0),
                self.created_path.clone(),
            ),
        }
    }

    /// Serializes the record, including the terminating blank line.
    pub fn write(&self) -> Vec<u8> {
        let mut out = String::new();
        writeln!(out, "id: {}", self.id.unparse()).unwrap();
        writeln!(out, "type: {}", self.kind.as_str()).unwrap();
        if let Some(pred) = &self.predecessor {
            writeln!(out, "pred: {}", pred.unparse()).unwrap();
        }
        writeln!(out, "count: {}", self.predecessor_count).unwrap();
        if let Some(rep) = &self.data_rep {
            writeln!(out, "text: {}", rep.unparse()).unwrap();
        }
        if let Some(rep) = &self.prop_rep {
            writeln!(out, "props: {}", rep.unparse()).unwrap();
        }
        writeln!(out, "cpath: {}", self.created_path).unwrap();
        if let Some((rev, path)) = &self.copyfrom {
            writeln!(out, "copyfrom: {rev} {path}").unwrap();
        }
        if let Some((rev, path)) = &self.copyroot {
            writeln!(out, "copyroot: {rev} {path}").unwrap();
        }
        if self.mergeinfo {
            writeln!(out, "minfo-here: y").unwrap();
        }
        if self.is_fresh_txn_root {
            writeln!(out, "is-fresh-txn-root: y").unwrap();
        }
        out.push('\n');
        out.into_bytes()
    }

    /// Parses a record from `data`, which must start at the record's first
    /// byte. Returns the record and the number of bytes consumed.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), NodeRevParseError> {
        let mut headers = BTreeMap::new();
        let mut pos = 0;
        loop {
            let rest = &data[pos..];
            let eol = rest
                .iter()
                .position(|&b| b == b'\n')
                .ok_or_else(|| malformed("unterminated record"))?;
            let line = std::str::from_utf8(&rest[..eol])
                .map_err(|_| malformed("non-UTF-8 record line"))?;
            pos += eol + 1;
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(": ")
                .ok_or_else(|| malformed(format!("header line without separator: {line:?}")))?;
            headers.insert(key.to_string(), value.to_string());
        }

        let require = |key: &str| {
            headers
                .get(key)
                .cloned()
                .ok_or_else(|| malformed(format!("missing {key} header")))
        };
        let id = NodeRevId::parse(&require("id")?).map_err(|err| malformed(err.to_string()))?;
        let kind = NodeKind::parse(&require("type")?)?;
        let predecessor = headers
            .get("pred")
            .map(|s| NodeRevId::parse(s).map_err(|err| malformed(err.to_string())))
            .transpose()?;
        let predecessor_count: u64 = require("count")?
            .parse()
            .map_err(|_| malformed("bad count header"))?;
        let data_rep = headers.get("text").map(|s| Representation::parse(s)).transpose()?;
        let prop_rep = headers.get("props").map(|s| Representation::parse(s)).transpose()?;
        let created_path = require("cpath")?;
        let copyfrom = headers
            .get("copyfrom")
            .map(|s| -> Result<_, NodeRevParseError> {
                let (rev, path) = s
                    .split_once(' ')
                    .ok_or_else(|| malformed("bad copyfrom header"))?;
                Ok((
                    rev.parse().map_err(|_| malformed("bad copyfrom revision"))?,
                    path.to_string(),
                ))
            })
            .transpose()?;
        let copyroot = headers
            .get("copyroot")
            .map(|s| -> Result<_, NodeRevParseError> {
                let (rev, path) = s
                    .split_once(' ')
                    .ok_or_else(|| malformed("bad copyroot header"))?;
                Ok((
                    rev.parse().map_err(|_| malformed("bad copyroot revision"))?,
                    path.to_string(),
                ))
            })
            .transpose()?;
        Ok((
            Self {
                id,
                kind,
                predecessor,
                predecessor_count,
                created_path,
                copyroot,
                copyfrom,
                data_rep,
                prop_rep,
                mergeinfo: headers.contains_key("minfo-here"),
                is_fresh_txn_root: headers.contains_key("is-fresh-txn-root"),
            },
            pos,
        ))
    }
}

/// One directory entry: the child's kind and node-revision ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Child kind.
    pub kind: NodeKind,
    /// Child node-revision ID.
    pub id: NodeRevId,
}

/// A directory's name-to-entry mapping; serialization is order-independent
/// (entries are always written sorted).
pub type DirEntries = BTreeMap<String, DirEntry>;

/// Serializes directory entries as a terminated property list whose values
/// are `<kind> <id>`.
pub fn write_dir_entries(entries: &DirEntries) -> Vec<u8> {
    let props: PropList = entries
        .iter()
        .map(|(name, entry)| {
            (
                name.clone(),
                format!("{} {}", entry.kind.as_str(), entry.id.unparse()).into_bytes(),
            )
        })
        .collect();
    proplist::write(&props)
}

/// Parses a serialized entry value (`<kind> <id>`).
pub fn parse_dir_entry(value: &[u8]) -> Result<DirEntry, NodeRevParseError> {
    let value = std::str::from_utf8(value).map_err(|_| malformed("non-UTF-8 entry"))?;
    let (kind, id) = value
        .split_once(' ')
        .ok_or_else(|| malformed("entry without separator"))?;
    Ok(DirEntry {
        kind: NodeKind::parse(kind)?,
        id: NodeRevId::parse(id).map_err(|err| malformed(err.to_string()))?,
    })
}

/// Parses a full serialized directory.
pub fn parse_dir_entries(data: &[u8]) -> Result<DirEntries, NodeRevParseError> {
    let (props, _) = proplist::parse(data).map_err(|err| malformed(err.to_string()))?;
    props
        .into_iter()
        .map(|(name, value)| Ok((name, parse_dir_entry(&value)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use crate::id::CopyId;
    use crate::id::NodeId;

    use super::*;

    fn file_rep() -> Representation {
        Representation {
            revision: Some(3),
            offset: 17,
            size: 40,
            expanded_size: 120,
            md5: Some([0xab; 16]),
            sha1: Some([0xcd; 20]),
            txn_id: None,
            uniquifier: Some("3-1/_2".to_string()),
        }
    }

    fn sample() -> NodeRevision {
        NodeRevision {
            id: NodeRevId::committed(NodeId::new("4"), CopyId::new("0"), 3, 99),
            kind: NodeKind::File,
            predecessor: Some(NodeRevId::committed(NodeId::new("4"), CopyId::new("0"), 2, 8)),
            predecessor_count: 2,
            created_path: "/trunk/a".to_string(),
            copyroot: None,
            copyfrom: None,
            data_rep: Some(file_rep()),
            prop_rep: None,
            mergeinfo: false,
            is_fresh_txn_root: false,
        }
    }

    #[test]
    fn record_round_trips() {
        let record = sample();
        let data = record.write();
        let (parsed, consumed) = NodeRevision::parse(&data).unwrap();
        assert_eq!(parsed, record);
        assert_eq!(consumed, data.len());
    }

    #[test]
    fn copy_metadata_round_trips() {
        let mut record = sample();
        record.copyfrom = Some((7, "/trunk/old".to_string()));
        record.copyroot = Some((9, "/branches/b".to_string()));
        record.mergeinfo = true;
        let (parsed, _) = NodeRevision::parse(&record.write()).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn mutable_representation_round_trips() {
        let txn = TxnId::parse("9-4").unwrap();
        let placeholder =
            Representation::mutable_placeholder(txn.clone(), String::new());
        let parsed = Representation::parse(&placeholder.unparse()).unwrap();
        assert_eq!(parsed, placeholder);

        let written = Representation {
            revision: None,
            offset: 100,
            size: 6,
            expanded_size: 6,
            md5: Some([1; 16]),
            sha1: Some([2; 20]),
            txn_id: Some(txn),
            uniquifier: Some("9-4/_1".to_string()),
        };
        assert_eq!(Representation::parse(&written.unparse()).unwrap(), written);
    }

    #[test]
    fn dir_entries_round_trip_sorted() {
        let mut entries = DirEntries::new();
        for name in ["zeta", "alpha", "mid"] {
            entries.insert(
                name.to_string(),
                DirEntry {
                    kind: NodeKind::Dir,
                    id: NodeRevId::committed(NodeId::new("7"), CopyId::new("0"), 1, 0),
                },
            );
        }
        let data = write_dir_entries(&entries);
        assert_eq!(parse_dir_entries(&data).unwrap(), entries);
        // Serialization starts with the lexicographically first name.
        assert!(data.starts_with(b"K 5\nalpha\n"));
    }

    #[test]
    fn missing_headers_are_corruption() {
        assert!(NodeRevision::parse(b"type: file\ncount: 0\ncpath: /\n\n").is_err());
        assert!(NodeRevision::parse(b"id: 4.0.r1/0\n").is_err());
    }
}
