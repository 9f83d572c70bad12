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

//! In-progress commits.
//!
//! A transaction is a private mutable staging area: a directory of
//! node-rev files and overlay files, an append-only proto-revision file
//! that accumulates the eventual body of the new revision, and a change
//! log. Mutations clone committed node revisions into transaction form on
//! first touch; the commit pipeline later rewrites the whole staged tree
//! into its permanent form.

use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::Ordering;

use indexmap::IndexMap;

use crate::base36;
use crate::changes;
use crate::changes::Change;
use crate::changes::ChangeKind;
use crate::file_util;
use crate::file_util::IoResultExt as _;
use crate::id::CopyId;
use crate::id::NodeId;
use crate::id::NodeRevId;
use crate::id::RevNum;
use crate::id::TxnId;
use crate::lock::FileLock;
use crate::node_rev;
use crate::node_rev::DirEntries;
use crate::node_rev::DirEntry;
use crate::node_rev::NodeKind;
use crate::node_rev::NodeRevision;
use crate::node_rev::Representation;
use crate::node_rev::Sha1Digest;
use crate::proplist;
use crate::proplist::PropList;
use crate::proplist::PropRecord;
use crate::rep_cache::RepCache;
use crate::representation;
use crate::representation::DeltaBase;
use crate::representation::RepSelector;
use crate::revision;
use crate::revision::Revision;
use crate::store::CorruptResultExt as _;
use crate::store::FileSystem;
use crate::store::FsError;
use crate::store::FsResult;
use crate::store::TxnShared;
use crate::store::WarningKind;

const LEGACY_NAME_ATTEMPTS: u32 = 50;

/// One in-progress commit.
pub struct Transaction<'a> {
    fs: &'a FileSystem,
    id: TxnId,
    base_rev: RevNum,
    shared: Arc<TxnShared>,
    /// SHA-1 of every representation finished in this transaction, for the
    /// first tier of rep-sharing lookups.
    rep_map: Mutex<HashMap<Sha1Digest, Representation>>,
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("base_rev", &self.base_rev)
            .finish_non_exhaustive()
    }
}

fn txn_node_file(fs: &FileSystem, txn_id: &TxnId, node_id: &NodeId, copy_id: &CopyId) -> PathBuf {
    fs.txn_dir(txn_id).join(format!("node.{node_id}.{copy_id}"))
}

/// Reads a transaction-form node revision (the dispatch target of
/// [`revision::read_node_rev`]).
pub(crate) fn read_txn_node_rev(
    fs: &FileSystem,
    txn_id: &TxnId,
    node_id: &NodeId,
    copy_id: &CopyId,
) -> FsResult<NodeRevision> {
    let path = txn_node_file(fs, txn_id, node_id, copy_id);
    let data = match fs::read(&path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(FsError::NoSuchTransaction(txn_id.as_str().to_string()));
        }
        Err(err) => return Err(file_util::PathError::new(&path, err).into()),
    };
    let (node, _) = NodeRevision::parse(&data).corruption_in(&path)?;
    Ok(node)
}

fn write_txn_node_rev(fs: &FileSystem, node: &NodeRevision) -> FsResult<()> {
    let crate::id::IdLocation::Transaction(txn_id) = &node.id.location else {
        return Err(FsError::corrupt(
            fs.path(),
            "attempt to write a committed node revision into a transaction",
        ));
    };
    let path = txn_node_file(fs, txn_id, &node.id.node_id, &node.id.copy_id);
    file_util::write_file_atomically(&path, &node.write())?;
    Ok(())
}

fn overlay_file(fs: &FileSystem, id: &NodeRevId, suffix: &str) -> FsResult<PathBuf> {
    let crate::id::IdLocation::Transaction(txn_id) = &id.location else {
        return Err(FsError::corrupt(fs.path(), "overlay file of a committed node"));
    };
    Ok(fs
        .txn_dir(txn_id)
        .join(format!("node.{}.{}.{suffix}", id.node_id, id.copy_id)))
}

/// Reads the children of a directory whose data-rep is mutable: the full
/// dump written when the directory went mutable, plus incremental `K`/`D`
/// records appended since.
pub(crate) fn read_mutable_dir_entries(
    fs: &FileSystem,
    node: &NodeRevision,
) -> FsResult<DirEntries> {
    let path = overlay_file(fs, &node.id, "children")?;
    let data = file_util::read_file(&path)?;
    let raw = proplist::parse_incremental(&data).corruption_in(&path)?;
    raw.into_iter()
        .map(|(name, value)| {
            Ok((name, node_rev::parse_dir_entry(&value).corruption_in(&path)?))
        })
        .collect()
}

/// Reads the property overlay of a node whose prop-rep is mutable.
pub(crate) fn read_mutable_props(fs: &FileSystem, node: &NodeRevision) -> FsResult<PropList> {
    let path = overlay_file(fs, &node.id, "props")?;
    let data = file_util::read_file(&path)?;
    let (props, _) = proplist::parse(&data).corruption_in(&path)?;
    Ok(props)
}

impl<'a> Transaction<'a> {
    /// Begins a transaction based on revision `base_rev`.
    pub fn begin(fs: &'a FileSystem, base_rev: RevNum) -> FsResult<Self> {
        if base_rev > fs.youngest()? {
            return Err(FsError::NoSuchRevision(base_rev));
        }
        let id = if fs.format().has_txn_current() {
            let txn_id = allocate_txn_id(fs, base_rev)?;
            let dir = fs.txn_dir(&txn_id);
            if dir.exists() {
                // The counter is monotonic; an existing directory means the
                // counter file was rolled back out from under us.
                return Err(FsError::corrupt(&dir, "transaction ID was reused"));
            }
            fs::create_dir(&dir).context(&dir)?;
            txn_id
        } else {
            legacy_create_txn_dir(fs, base_rev)?
        };

        let dir = fs.txn_dir(&id);
        fs::write(dir.join("changes"), b"").context(dir.join("changes"))?;
        fs::write(dir.join("next-ids"), b"0 0\n").context(dir.join("next-ids"))?;
        fs::write(dir.join("props"), proplist::write(&PropList::new()))
            .context(dir.join("props"))?;
        let protorev = fs.protorev_file(&id);
        fs::write(&protorev, b"").context(&protorev)?;
        let protorev_lock = fs.protorev_lock_file(&id);
        fs::write(&protorev_lock, b"").context(&protorev_lock)?;

        let txn = Self {
            fs,
            id: id.clone(),
            base_rev,
            shared: fs.shared.txn_record(&id),
            rep_map: Mutex::new(HashMap::new()),
        };

        // Stage the base revision's root in transaction form: fresh ID,
        // incremented predecessor count, copy metadata cleared.
        let base_root = Revision::open(fs, base_rev)?.root_node_rev()?;
        let root_node_id = txn.allocate_node_id()?;
        let root = NodeRevision {
            id: NodeRevId::in_txn(root_node_id, base_root.id.copy_id.clone(), id.clone()),
            kind: NodeKind::Dir,
            predecessor: Some(base_root.id.clone()),
            predecessor_count: base_root.predecessor_count + 1,
            created_path: "/".to_string(),
            copyroot: base_root.copyroot.clone(),
            copyfrom: None,
            data_rep: base_root.data_rep.clone(),
            prop_rep: base_root.prop_rep.clone(),
            mergeinfo: base_root.mergeinfo,
            is_fresh_txn_root: true,
        };
        write_txn_node_rev(fs, &root)?;
        fs::write(dir.join("root-id"), root.id.unparse().as_bytes())
            .context(dir.join("root-id"))?;
        Ok(txn)
    }

    /// Reopens an existing transaction by ID.
    pub fn open(fs: &'a FileSystem, txn_id: &str) -> FsResult<Self> {
        let id = TxnId::parse(txn_id)
            .map_err(|_| FsError::NoSuchTransaction(txn_id.to_string()))?;
        if !fs.txn_dir(&id).is_dir() {
            return Err(FsError::NoSuchTransaction(txn_id.to_string()));
        }
        Ok(Self {
            fs,
            base_rev: id.base_rev(),
            shared: fs.shared.txn_record(&id),
            rep_map: Mutex::new(HashMap::new()),
            id,
        })
    }

    /// The transaction ID.
    pub fn id(&self) -> &TxnId {
        &self.id
    }

    /// The revision this transaction is based on.
    pub fn base_rev(&self) -> RevNum {
        self.base_rev
    }

    pub(crate) fn fs(&self) -> &FileSystem {
        self.fs
    }

    pub(crate) fn shared(&self) -> &Arc<TxnShared> {
        &self.shared
    }

    /// The staged root's node revision.
    pub fn root(&self) -> FsResult<NodeRevision> {
        revision::read_node_rev(self.fs, &self.root_id()?)
    }

    pub(crate) fn root_id(&self) -> FsResult<NodeRevId> {
        let path = self.fs.txn_dir(&self.id).join("root-id");
        let text = file_util::read_line_file(&path)?;
        NodeRevId::parse(&text).corruption_in(&path)
    }

    // Identifier allocation.

    fn bump_next_ids(&self, which: usize) -> FsResult<u64> {
        let path = self.fs.txn_dir(&self.id).join("next-ids");
        let text = file_util::read_line_file(&path)?;
        let mut keys: Vec<String> = text.split(' ').map(str::to_string).collect();
        if keys.len() != 2 {
            return Err(FsError::corrupt(&path, "expected two keys"));
        }
        let value = base36::decode(&keys[which])
            .ok_or_else(|| FsError::corrupt(&path, "bad base-36 key"))?;
        keys[which] = base36::encode(value + 1);
        file_util::write_file_atomically(&path, format!("{} {}\n", keys[0], keys[1]).as_bytes())?;
        Ok(value)
    }

    pub(crate) fn allocate_node_id(&self) -> FsResult<NodeId> {
        Ok(NodeId::transient(self.bump_next_ids(0)?))
    }

    pub(crate) fn allocate_copy_id(&self) -> FsResult<CopyId> {
        Ok(CopyId::transient(self.bump_next_ids(1)?))
    }

    /// Final values of the per-transaction counters.
    pub(crate) fn next_ids(&self) -> FsResult<(u64, u64)> {
        let path = self.fs.txn_dir(&self.id).join("next-ids");
        let text = file_util::read_line_file(&path)?;
        let mut tokens = text.split(' ');
        let parse = |tok: Option<&str>| {
            tok.and_then(base36::decode)
                .ok_or_else(|| FsError::corrupt(&path, "bad next-ids file"))
        };
        let node = parse(tokens.next())?;
        let copy = parse(tokens.next())?;
        Ok((node, copy))
    }

    // Tree mutation.

    /// Creates an empty file at `path`.
    pub fn make_file(&self, path: &str) -> FsResult<()> {
        self.make_node(path, NodeKind::File)
    }

    /// Creates an empty directory at `path`.
    pub fn make_dir(&self, path: &str) -> FsResult<()> {
        self.make_node(path, NodeKind::Dir)
    }

    fn make_node(&self, path: &str, kind: NodeKind) -> FsResult<()> {
        let (parent_path, name) = split_parent(path)?;
        let mut parent = self.mutable_node_at(parent_path)?;
        if revision::dir_entries(self.fs, &parent)?.contains_key(name) {
            return Err(FsError::PathAlreadyExists(path.to_string()));
        }
        let node = NodeRevision {
            id: NodeRevId::in_txn(
                self.allocate_node_id()?,
                parent.id.copy_id.clone(),
                self.id.clone(),
            ),
            kind,
            predecessor: None,
            predecessor_count: 0,
            created_path: canonical(path),
            copyroot: parent.copyroot.clone(),
            copyfrom: None,
            data_rep: None,
            prop_rep: None,
            mergeinfo: false,
            is_fresh_txn_root: false,
        };
        write_txn_node_rev(self.fs, &node)?;
        self.set_entry(
            &mut parent,
            name,
            Some(DirEntry {
                kind,
                id: node.id.clone(),
            }),
        )?;
        self.add_change(&Change {
            path: canonical(path),
            id: Some(node.id),
            kind: ChangeKind::Add,
            node_kind: Some(kind),
            text_mod: false,
            prop_mod: false,
            copyfrom: None,
        })
    }

    /// Deletes the entry at `path` (recursively, for directories; the
    /// subtree simply becomes unreachable).
    pub fn delete(&self, path: &str) -> FsResult<()> {
        let (parent_path, name) = split_parent(path)?;
        let mut parent = self.mutable_node_at(parent_path)?;
        let entries = revision::dir_entries(self.fs, &parent)?;
        let entry = entries
            .get(name)
            .ok_or_else(|| FsError::PathNotFound(path.to_string()))?
            .clone();
        self.set_entry(&mut parent, name, None)?;
        self.add_change(&Change {
            path: canonical(path),
            id: Some(entry.id),
            kind: ChangeKind::Delete,
            node_kind: Some(entry.kind),
            text_mod: false,
            prop_mod: false,
            copyfrom: None,
        })
    }

    /// Copies `from_path` as of revision `from_rev` to `to_path`. The
    /// destination must not exist. Sharing is structural: the copied node
    /// references the source's representations and children.
    pub fn copy(&self, from_rev: RevNum, from_path: &str, to_path: &str) -> FsResult<()> {
        let source = Revision::open(self.fs, from_rev)?
            .node_rev_at(from_path)?
            .ok_or_else(|| FsError::PathNotFound(from_path.to_string()))?;
        let (parent_path, name) = split_parent(to_path)?;
        let mut parent = self.mutable_node_at(parent_path)?;
        if revision::dir_entries(self.fs, &parent)?.contains_key(name) {
            return Err(FsError::PathAlreadyExists(to_path.to_string()));
        }
        let node = NodeRevision {
            id: NodeRevId::in_txn(
                source.id.node_id.clone(),
                self.allocate_copy_id()?,
                self.id.clone(),
            ),
            kind: source.kind,
            predecessor: Some(source.id.clone()),
            predecessor_count: source.predecessor_count + 1,
            created_path: canonical(to_path),
            // The copy is its own copy root; its final revision is not
            // known until commit, so the self-default stands in.
            copyroot: None,
            copyfrom: Some((from_rev, canonical(from_path))),
            data_rep: source.data_rep.clone(),
            prop_rep: source.prop_rep.clone(),
            mergeinfo: source.mergeinfo,
            is_fresh_txn_root: false,
        };
        write_txn_node_rev(self.fs, &node)?;
        self.set_entry(
            &mut parent,
            name,
            Some(DirEntry {
                kind: node.kind,
                id: node.id.clone(),
            }),
        )?;
        self.add_change(&Change {
            path: canonical(to_path),
            id: Some(node.id),
            kind: ChangeKind::Add,
            node_kind: Some(node.kind),
            text_mod: false,
            prop_mod: false,
            copyfrom: Some((from_rev, canonical(from_path))),
        })
    }

    /// Replaces the properties of the node at `path`.
    pub fn set_proplist(&self, path: &str, props: &PropList) -> FsResult<()> {
        let mut node = self.mutable_node_at(path)?;
        let overlay = overlay_file(self.fs, &node.id, "props")?;
        file_util::write_file_atomically(&overlay, &proplist::write(props))?;
        if node.prop_rep.as_ref().is_none_or(|rep| !rep.is_mutable()) {
            node.prop_rep = Some(Representation::mutable_placeholder(
                self.id.clone(),
                format!("{}/{}", self.id, node.id.node_id),
            ));
            write_txn_node_rev(self.fs, &node)?;
        }
        self.add_change(&Change {
            path: canonical(path),
            id: Some(node.id.clone()),
            kind: ChangeKind::Modify,
            node_kind: Some(node.kind),
            text_mod: false,
            prop_mod: true,
            copyfrom: None,
        })
    }

    /// Replaces the transaction's own properties (`svn:log` and friends);
    /// these become the new revision's revprops at commit.
    pub fn set_txn_prop(&self, name: &str, value: Option<&[u8]>) -> FsResult<()> {
        let path = self.fs.txn_dir(&self.id).join("props");
        let mut props = self.txn_proplist()?;
        match value {
            Some(value) => {
                props.insert(name.to_string(), value.to_vec());
            }
            None => {
                props.remove(name);
            }
        }
        file_util::write_file_atomically(&path, &proplist::write(&props))?;
        Ok(())
    }

    /// The transaction's properties.
    pub fn txn_proplist(&self) -> FsResult<PropList> {
        let path = self.fs.txn_dir(&self.id).join("props");
        let data = file_util::read_file(&path)?;
        let (props, _) = proplist::parse(&data).corruption_in(&path)?;
        Ok(props)
    }

    /// Streams new contents for the file at `path`. The returned writer
    /// holds the proto-revision lock until closed.
    pub fn begin_text(&self, path: &str) -> FsResult<ContentsWriter<'_>> {
        let node = self.mutable_node_at(path)?;
        if node.kind != NodeKind::File {
            return Err(FsError::NotAFile(path.to_string()));
        }
        ContentsWriter::start(self, node, canonical(path))
    }

    /// Convenience wrapper: replaces the file contents in one call.
    pub fn apply_text(&self, path: &str, contents: &[u8]) -> FsResult<()> {
        let mut writer = self.begin_text(path)?;
        writer.write_all(contents)?;
        writer.close()
    }

    /// Appends one record to the change log.
    pub fn add_change(&self, change: &Change) -> FsResult<()> {
        let path = self.fs.txn_dir(&self.id).join("changes");
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .context(&path)?;
        file.write_all(&changes::write_record(change)).context(&path)?;
        Ok(())
    }

    /// The raw (unfolded) change log.
    pub(crate) fn raw_changes(&self) -> FsResult<Vec<Change>> {
        let path = self.fs.txn_dir(&self.id).join("changes");
        let data = file_util::read_file(&path)?;
        changes::parse(&data).corruption_in(&path)
    }

    /// The folded view of the change log.
    pub fn changed_paths(&self) -> FsResult<IndexMap<String, Change>> {
        let path = self.fs.txn_dir(&self.id).join("changes");
        changes::fold(self.raw_changes()?, false).corruption_in(&path)
    }

    /// Reads a staged node (or the committed node it still shares) at
    /// `path`, without making anything mutable.
    pub fn node_at(&self, path: &str) -> FsResult<Option<NodeRevision>> {
        let mut node = self.root()?;
        for component in revision::split_path(path) {
            if node.kind != NodeKind::Dir {
                return Ok(None);
            }
            let entries = revision::dir_entries(self.fs, &node)?;
            let Some(entry) = entries.get(component) else {
                return Ok(None);
            };
            node = revision::read_node_rev(self.fs, &entry.id)?;
        }
        Ok(Some(node))
    }

    /// Reads the current contents of the file at `path` as staged.
    pub fn file_contents(&self, path: &str) -> FsResult<Vec<u8>> {
        let node = self
            .node_at(path)?
            .ok_or_else(|| FsError::PathNotFound(path.to_string()))?;
        if node.kind != NodeKind::File {
            return Err(FsError::NotAFile(path.to_string()));
        }
        match &node.data_rep {
            Some(rep) => representation::read_fulltext(self.fs, rep),
            None => Ok(vec![]),
        }
    }

    /// Commits: turns the staged tree into the next revision. On success
    /// the staging area is gone and this handle is dead; on failure the
    /// transaction survives for inspection or [`Self::abort`]. See
    /// [`crate::commit`] for the pipeline.
    pub fn commit(&self, cancel: &crate::store::CancelToken) -> FsResult<RevNum> {
        crate::commit::commit_txn(self, cancel)
    }

    /// Aborts: removes the staging area and its proto-revision.
    pub fn abort(self) -> FsResult<()> {
        cleanup_txn_files(self.fs, &self.id)?;
        self.fs.shared.forget_txn(&self.id);
        Ok(())
    }

    /// Clones the node at `path` (and every ancestor on the way) into
    /// transaction form, so it can be mutated.
    pub(crate) fn mutable_node_at(&self, path: &str) -> FsResult<NodeRevision> {
        let mut node = self.root()?;
        let mut walked = String::new();
        for component in revision::split_path(path) {
            if node.kind != NodeKind::Dir {
                return Err(FsError::NotADirectory(walked));
            }
            walked.push('/');
            walked.push_str(component);
            let entries = revision::dir_entries(self.fs, &node)?;
            let entry = entries
                .get(component)
                .ok_or_else(|| FsError::PathNotFound(walked.clone()))?
                .clone();
            let child = revision::read_node_rev(self.fs, &entry.id)?;
            let child = if child.id.is_txn() {
                child
            } else {
                let clone = NodeRevision {
                    id: NodeRevId::in_txn(
                        child.id.node_id.clone(),
                        child.id.copy_id.clone(),
                        self.id.clone(),
                    ),
                    predecessor: Some(child.id.clone()),
                    predecessor_count: child.predecessor_count + 1,
                    created_path: walked.clone(),
                    copyfrom: None,
                    is_fresh_txn_root: false,
                    ..child
                };
                write_txn_node_rev(self.fs, &clone)?;
                let mut parent = node.clone();
                self.set_entry(
                    &mut parent,
                    component,
                    Some(DirEntry {
                        kind: clone.kind,
                        id: clone.id.clone(),
                    }),
                )?;
                clone
            };
            node = child;
        }
        Ok(node)
    }

    /// Updates (or with `None` removes) one entry of a mutable directory,
    /// making its data-rep mutable first if needed.
    pub(crate) fn set_entry(
        &self,
        parent: &mut NodeRevision,
        name: &str,
        entry: Option<DirEntry>,
    ) -> FsResult<()> {
        debug_assert!(parent.id.is_txn());
        if parent.kind != NodeKind::Dir {
            return Err(FsError::NotADirectory(parent.created_path.clone()));
        }
        let overlay = overlay_file(self.fs, &parent.id, "children")?;
        if parent.data_rep.as_ref().is_none_or(|rep| !rep.is_mutable()) {
            // First mutation: dump the inherited entries, then mark the
            // rep mutable with a sentinel the commit rewrite recognizes.
            let entries = revision::dir_entries(self.fs, parent)?;
            file_util::write_file_atomically(&overlay, &node_rev::write_dir_entries(&entries))?;
            parent.data_rep = Some(Representation::mutable_placeholder(
                self.id.clone(),
                format!("{}/{}", self.id, parent.id.node_id),
            ));
            write_txn_node_rev(self.fs, parent)?;
        }
        let mut record = vec![];
        match entry {
            Some(entry) => proplist::write_record(
                &mut record,
                &PropRecord::Set(
                    name.to_string(),
                    format!(
                        "{} {}",
                        match entry.kind {
                            NodeKind::File => "file",
                            NodeKind::Dir => "dir",
                            NodeKind::Symlink => "symlink",
                        },
                        entry.id.unparse()
                    )
                    .into_bytes(),
                ),
            ),
            None => proplist::write_record(&mut record, &PropRecord::Delete(name.to_string())),
        }
        let mut file = OpenOptions::new()
            .append(true)
            .open(&overlay)
            .context(&overlay)?;
        file.write_all(&record).context(&overlay)?;
        Ok(())
    }

    /// Consults the rep-sharing tiers for an identical fulltext: the
    /// in-memory map of this transaction, the SHA-1 sidecar files in the
    /// transaction directory, and finally the repository rep-cache.
    pub(crate) fn lookup_shared_rep(&self, sha1: &Sha1Digest) -> Option<Representation> {
        if !self.fs.config().enable_rep_sharing || !self.fs.format().supports_rep_sharing() {
            return None;
        }
        if let Some(rep) = self.rep_map.lock().unwrap().get(sha1) {
            return Some(rep.clone());
        }
        let sidecar = self
            .fs
            .txn_dir(&self.id)
            .join(format!("rep.{}", hex::encode(sha1)));
        if let Ok(text) = fs::read_to_string(&sidecar) {
            if let Ok(rep) = Representation::parse(text.trim()) {
                return Some(rep);
            }
        }
        match RepCache::open(&self.fs.rep_cache_file()) {
            Ok(cache) => match cache.get(sha1) {
                Ok(Some(entry)) => Some(Representation {
                    revision: Some(entry.revision),
                    offset: entry.offset,
                    size: entry.size,
                    expanded_size: entry.expanded_size,
                    md5: None,
                    sha1: Some(*sha1),
                    txn_id: None,
                    uniquifier: None,
                }),
                Ok(None) => None,
                Err(err) => {
                    self.fs.warn(
                        WarningKind::RepCache,
                        &format!("rep-cache lookup failed: {err}"),
                    );
                    None
                }
            },
            Err(err) => {
                self.fs.warn(
                    WarningKind::RepCache,
                    &format!("cannot open rep-cache: {err}"),
                );
                None
            }
        }
    }

    /// Records a freshly written representation for later sharing: the
    /// in-memory map for this handle, and a sidecar file so a reopened
    /// transaction still finds it.
    pub(crate) fn record_rep_for_sharing(&self, rep: &Representation) {
        let Some(sha1) = rep.sha1 else { return };
        self.rep_map.lock().unwrap().insert(sha1, rep.clone());
        let sidecar = self
            .fs
            .txn_dir(&self.id)
            .join(format!("rep.{}", hex::encode(sha1)));
        if let Err(err) = fs::write(&sidecar, format!("{}\n", rep.unparse())) {
            self.fs.warn(
                WarningKind::RepCache,
                &format!("cannot write rep sidecar: {err}"),
            );
        }
    }
}

fn allocate_txn_id(fs: &FileSystem, base_rev: RevNum) -> FsResult<TxnId> {
    let _lock = FileLock::lock(fs.txn_current_lock_file())?;
    let path = fs.txn_current_file();
    let key = file_util::read_line_file(&path)?;
    if !base36::is_key(&key) {
        return Err(FsError::corrupt(&path, "bad transaction counter"));
    }
    let next = base36::next_key(&key)
        .ok_or_else(|| FsError::corrupt(&path, "transaction counter overflow"))?;
    file_util::write_file_atomically(&path, format!("{next}\n").as_bytes())?;
    Ok(TxnId::form(base_rev, &key))
}

fn legacy_create_txn_dir(fs: &FileSystem, base_rev: RevNum) -> FsResult<TxnId> {
    use rand::Rng as _;
    let mut rng = rand::rng();
    for _ in 0..LEGACY_NAME_ATTEMPTS {
        let key = base36::encode(rng.random::<u32>().into());
        let id = TxnId::form(base_rev, &key);
        let dir = fs.txn_dir(&id);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(id),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(file_util::PathError::new(&dir, err).into()),
        }
    }
    Err(FsError::UniqueNameExhausted)
}

/// Removes a transaction's on-disk state (abort and post-commit purge).
pub(crate) fn cleanup_txn_files(fs: &FileSystem, txn_id: &TxnId) -> FsResult<()> {
    let dir = fs.txn_dir(txn_id);
    fs::remove_dir_all(&dir).context(&dir)?;
    if fs.format().has_protorevs_dir() {
        for path in [fs.protorev_file(txn_id), fs.protorev_lock_file(txn_id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(file_util::PathError::new(&path, err).into()),
            }
        }
    }
    Ok(())
}

/// Lists the IDs of in-progress transactions.
pub fn list_transactions(fs: &FileSystem) -> FsResult<Vec<String>> {
    let dir = fs.transactions_dir();
    let mut ids = vec![];
    for entry in dir.read_dir().context(&dir)? {
        let entry = entry.context(&dir)?;
        if let Some(name) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.strip_suffix(".txn"))
        {
            ids.push(name.to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

/// Removes a transaction by ID (administrative cleanup).
pub fn purge_txn(fs: &FileSystem, txn_id: &str) -> FsResult<()> {
    Transaction::open(fs, txn_id)?.abort()
}

/// Guard over the proto-revision file while a representation is being
/// streamed into it. Acquisition never blocks: a second writer gets
/// [`FsError::RepBeingWritten`] immediately.
pub(crate) struct ProtoRevLock<'a> {
    txn: &'a Transaction<'a>,
    _file_lock: FileLock,
}

impl<'a> ProtoRevLock<'a> {
    pub(crate) fn acquire(txn: &'a Transaction<'a>) -> FsResult<Self> {
        let shared = txn.shared();
        if shared
            .being_written
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(FsError::RepBeingWritten(txn.id().clone()));
        }
        let file_lock = match FileLock::try_lock(txn.fs().protorev_lock_file(txn.id())) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                shared.being_written.store(false, Ordering::Release);
                return Err(FsError::RepBeingWritten(txn.id().clone()));
            }
            Err(err) => {
                shared.being_written.store(false, Ordering::Release);
                return Err(err.into());
            }
        };
        Ok(Self {
            txn,
            _file_lock: file_lock,
        })
    }
}

impl Drop for ProtoRevLock<'_> {
    fn drop(&mut self) {
        self.txn
            .shared()
            .being_written
            .store(false, Ordering::Release);
    }
}

/// A stream writing one file's new contents into the proto-revision.
///
/// Dropping the writer without [`ContentsWriter::close`] truncates the
/// proto-revision back to where the write began and releases the lock, so
/// an unwound caller leaves no partial representation behind.
pub struct ContentsWriter<'a> {
    txn: &'a Transaction<'a>,
    node: NodeRevision,
    path: String,
    file: Option<File>,
    start_offset: u64,
    writer_state: Option<WriterState>,
    pending: Vec<u8>,
    closed: bool,
    _lock: ProtoRevLock<'a>,
}

struct WriterState {
    base: Option<DeltaBase>,
}

impl<'a> ContentsWriter<'a> {
    fn start(txn: &'a Transaction<'a>, node: NodeRevision, path: String) -> FsResult<Self> {
        let lock = ProtoRevLock::acquire(txn)?;
        let protorev_path = txn.fs().protorev_file(txn.id());
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&protorev_path)
            .context(&protorev_path)?;
        let start_offset = file.metadata().context(&protorev_path)?.len();
        let base = match representation::choose_delta_base(txn.fs(), &node, RepSelector::Data)? {
            Some(base_rep) => Some(DeltaBase::load(txn.fs(), &base_rep)?),
            None => None,
        };
        Ok(Self {
            txn,
            node,
            path,
            file: Some(file),
            start_offset,
            writer_state: Some(WriterState { base }),
            pending: vec![],
            closed: false,
            _lock: lock,
        })
    }

    /// Appends contents. Buffered internally; call [`Self::close`] to
    /// finalize the representation.
    pub fn write_all(&mut self, data: &[u8]) -> FsResult<()> {
        self.pending.extend_from_slice(data);
        Ok(())
    }

    /// Finalizes: encodes the representation, computes checksums, and
    /// consults rep-sharing (truncating the just-written bytes away on a
    /// hit).
    pub fn close(mut self) -> FsResult<()> {
        let mut file = self.file.take().expect("close runs once");
        let state = self.writer_state.take().expect("close runs once");
        let protorev_path = self.txn.fs().protorev_file(self.txn.id());

        let mut writer =
            representation::RepWriter::start(&mut file, &protorev_path, state.base)?;
        writer.write_all(&self.pending)?;
        let finished = writer.finish()?;
        file.sync_data().context(&protorev_path)?;

        let uniquifier = format!("{}/{}", self.txn.id(), self.node.id.node_id);
        let rep = match self.txn.lookup_shared_rep(&finished.sha1) {
            Some(shared) => {
                // Identical fulltext already stored: give the bytes back.
                file.set_len(self.start_offset).context(&protorev_path)?;
                Representation {
                    md5: Some(finished.md5),
                    sha1: Some(finished.sha1),
                    uniquifier: shared.uniquifier.clone(),
                    ..shared
                }
            }
            None => {
                let rep = Representation {
                    revision: None,
                    offset: finished.offset,
                    size: finished.size,
                    expanded_size: finished.expanded_size,
                    md5: Some(finished.md5),
                    sha1: Some(finished.sha1),
                    txn_id: Some(self.txn.id().clone()),
                    uniquifier: Some(uniquifier),
                };
                self.txn.record_rep_for_sharing(&rep);
                rep
            }
        };
        self.node.data_rep = Some(rep);
        write_txn_node_rev(self.txn.fs(), &self.node)?;
        self.txn.add_change(&Change {
            path: self.path.clone(),
            id: Some(self.node.id.clone()),
            kind: ChangeKind::Modify,
            node_kind: Some(NodeKind::File),
            text_mod: true,
            prop_mod: false,
            copyfrom: None,
        })?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for ContentsWriter<'_> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Unwound without close: discard any partial representation.
        if let Some(file) = self.file.take() {
            if let Err(err) = file.set_len(self.start_offset) {
                tracing::warn!(?err, "cannot truncate abandoned proto-revision write");
            }
        }
    }
}

fn canonical(path: &str) -> String {
    let mut out = String::from("/");
    for component in revision::split_path(path) {
        if out.len() > 1 {
            out.push('/');
        }
        out.push_str(component);
    }
    out
}

fn split_parent(path: &str) -> FsResult<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(pos) if pos + 1 < trimmed.len() => Ok((&trimmed[..pos], &trimmed[pos + 1..])),
        _ if !trimmed.is_empty() && !trimmed.starts_with('/') => Ok(("", trimmed)),
        _ => Err(FsError::PathNotFound(path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_parent_handles_roots_and_nesting() {
        assert_eq!(split_parent("/a").unwrap(), ("", "a"));
        assert_eq!(split_parent("/a/b/c").unwrap(), ("/a/b", "c"));
        assert_eq!(split_parent("a").unwrap(), ("", "a"));
        assert!(split_parent("/").is_err());
        assert!(split_parent("").is_err());
    }

    #[test]
    fn canonical_normalizes_separators() {
        assert_eq!(canonical("a/b"), "/a/b");
        assert_eq!(canonical("/a//b/"), "/a/b");
        assert_eq!(canonical(""), "/");
    }
}
