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

//! The commit pipeline.
//!
//! Commit is a single-writer critical section under the repository write
//! lock. It renumbers the staged tree into committed form, deltifies
//! directory and property representations against their chosen bases,
//! appends everything to the proto-revision file, moves that file into
//! place as revision N, writes the revprops, and finally advances the
//! `current` pointer — the linearization point. Errors before the bump
//! abort the revision; errors after it are at most cleanup warnings.

use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Seek as _;
use std::io::Write as _;

use itertools::Itertools as _;
use tracing::instrument;

use crate::base36;
use crate::changes;
use crate::changes::Change;
use crate::changes::ChangeKind;
use crate::file_util;
use crate::file_util::IoResultExt as _;
use crate::id::IdLocation;
use crate::id::NodeRevId;
use crate::id::RevNum;
use crate::locks;
use crate::node_rev;
use crate::node_rev::NodeKind;
use crate::node_rev::NodeRevision;
use crate::node_rev::Representation;
use crate::proplist;
use crate::rep_cache::RepCache;
use crate::rep_cache::RepCacheEntry;
use crate::representation;
use crate::representation::DeltaBase;
use crate::representation::RepSelector;
use crate::revision;
use crate::revision::Revision;
use crate::store::CancelToken;
use crate::store::CurrentState;
use crate::store::FileSystem;
use crate::store::FsError;
use crate::store::FsResult;
use crate::store::PROP_REVISION_DATE;
use crate::store::WarningKind;
use crate::transaction::ProtoRevLock;
use crate::transaction::Transaction;
use crate::transaction::cleanup_txn_files;

/// Scratch state threaded through the tree rewrite.
struct CommitContext<'a> {
    fs: &'a FileSystem,
    txn: &'a Transaction<'a>,
    new_rev: RevNum,
    /// Legacy starting keys for permanent ID assignment; `None` for
    /// no-global-IDs formats.
    legacy_starts: Option<(u64, u64)>,
    /// Proto-revision length before the rewrite began; anything a staged
    /// representation claims beyond this is truncation corruption.
    protorev_len_before: u64,
    /// Old transaction-form ID (unparsed) to final committed ID.
    id_map: HashMap<String, NodeRevId>,
    /// Entries queued for the rep-cache after the commit is durable.
    rep_queue: Vec<RepCacheEntry>,
    cancel: &'a CancelToken,
}

/// Commits `txn`, returning the new revision number.
#[instrument(skip_all, fields(txn = %txn.id()))]
pub fn commit_txn(txn: &Transaction<'_>, cancel: &CancelToken) -> FsResult<RevNum> {
    let fs = txn.fs();
    let new_rev = fs.with_write_lock(|guard| {
        // Step 1: the transaction must still be based on the youngest.
        if guard.youngest != txn.base_rev() {
            return Err(FsError::TxnOutOfDate {
                base: txn.base_rev(),
                youngest: guard.youngest,
            });
        }
        let new_rev = guard.youngest + 1;

        // Step 2: lock verification over the folded change list.
        verify_locks(fs, txn)?;

        // Step 3: shard directories for a revision that opens a new shard.
        if let Some(size) = fs.format().shard_size() {
            if new_rev % size == 0 {
                let shard = new_rev / size;
                for parent in [fs.revs_dir(), fs.revprops_dir()] {
                    let dir = parent.join(shard.to_string());
                    file_util::create_or_reuse_dir(&dir).context(&dir)?;
                }
            }
        }

        let current = fs.current()?;
        let legacy_starts = if fs.format().no_global_ids() {
            None
        } else {
            let node = current
                .next_node_id
                .as_deref()
                .and_then(base36::decode)
                .ok_or_else(|| FsError::corrupt(fs.current_file(), "bad next-node-id"))?;
            let copy = current
                .next_copy_id
                .as_deref()
                .and_then(base36::decode)
                .ok_or_else(|| FsError::corrupt(fs.current_file(), "bad next-copy-id"))?;
            Some((node, copy))
        };

        // Step 4: rewrite the staged tree into the proto-revision.
        let protorev_lock = ProtoRevLock::acquire(txn)?;
        let protorev_path = fs.protorev_file(txn.id());
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&protorev_path)
            .context(&protorev_path)?;
        let protorev_len_before = file.metadata().context(&protorev_path)?.len();
        file.seek(std::io::SeekFrom::End(0)).context(&protorev_path)?;

        let mut ctx = CommitContext {
            fs,
            txn,
            new_rev,
            legacy_starts,
            protorev_len_before,
            id_map: HashMap::new(),
            rep_queue: vec![],
            cancel,
        };
        let root_txn_id = txn.root_id()?;
        let root = rewrite_node(&mut ctx, &mut file, &root_txn_id)?;

        // Step 5: the root's predecessor count must extend the previous
        // head's chain by exactly one.
        let prev_count = Revision::open(fs, guard.youngest)?
            .root_node_rev()?
            .predecessor_count;
        let staged_count = txn.root()?.predecessor_count;
        if staged_count != prev_count + 1 {
            return Err(FsError::corrupt(
                &protorev_path,
                format!(
                    "root predecessor count {staged_count} does not follow {prev_count}"
                ),
            ));
        }

        // Step 6: the folded change list.
        let changes_offset = file
            .seek(std::io::SeekFrom::End(0))
            .context(&protorev_path)?;
        let folded = txn.changed_paths()?;
        let rewritten = folded
            .into_values()
            .map(|change| rewrite_change_ids(&ctx, change))
            .collect::<FsResult<Vec<Change>>>()?;
        file.write_all(&changes::write(rewritten))
            .context(&protorev_path)?;

        // Step 7: trailer, then flush to disk.
        let root_offset = root.offset().expect("root was just committed");
        file.write_all(format!("{root_offset} {changes_offset}\n").as_bytes())
            .context(&protorev_path)?;
        file.sync_all().context(&protorev_path)?;
        drop(file);

        // Step 8: move the proto-revision into place, borrowing the
        // previous revision file's permissions.
        let rev_path = fs.rev_file_path(new_rev);
        fs::rename(&protorev_path, &rev_path).context(&rev_path)?;
        let prev_path = fs.rev_file_path(guard.youngest);
        if prev_path.is_file() {
            file_util::copy_permissions(&prev_path, &rev_path)?;
        }

        // Step 9: the proto-revision is gone; release its lock.
        drop(protorev_lock);

        // Step 10: revprops, with a fresh datestamp so dates stay
        // monotone across the revision sequence.
        let mut revprops = txn.txn_proplist()?;
        revprops.insert(
            PROP_REVISION_DATE.to_string(),
            crate::store::date_now().into_bytes(),
        );
        file_util::write_file_atomically(
            &fs.revprops_file_path(new_rev),
            &proplist::write(&revprops),
        )?;

        // Step 11: the linearization point.
        let (txn_nodes, txn_copies) = txn.next_ids()?;
        fs.write_current(&CurrentState {
            youngest: new_rev,
            next_node_id: ctx
                .legacy_starts
                .map(|(node, _)| base36::encode(node + txn_nodes)),
            next_copy_id: ctx
                .legacy_starts
                .map(|(_, copy)| base36::encode(copy + txn_copies)),
        })?;

        // Step 12: the staging area is dead.
        if let Err(err) = cleanup_txn_files(fs, txn.id()) {
            fs.warn(
                WarningKind::Cleanup,
                &format!("cannot remove transaction {}: {err}", txn.id()),
            );
        }
        fs.shared.forget_txn(txn.id());

        // Step 13: rep-cache rows; the commit is durable regardless.
        if fs.config().enable_rep_sharing
            && fs.format().supports_rep_sharing()
            && !ctx.rep_queue.is_empty()
        {
            match RepCache::open(&fs.rep_cache_file()) {
                Ok(mut cache) => {
                    if let Err(err) = cache.insert_all(&ctx.rep_queue) {
                        fs.warn(
                            WarningKind::RepCache,
                            &format!("cannot record representations of r{new_rev}: {err}"),
                        );
                    }
                }
                Err(err) => {
                    fs.warn(
                        WarningKind::RepCache,
                        &format!("cannot open rep-cache: {err}"),
                    );
                }
            }
        }
        Ok(new_rev)
    })?;
    tracing::debug!(rev = new_rev, "committed");
    Ok(new_rev)
}

/// Depth-first, lexicographic rewrite of one staged node. Children are
/// finalized before their parent so the parent's entry table can be
/// patched with committed IDs.
fn rewrite_node(
    ctx: &mut CommitContext<'_>,
    file: &mut File,
    id: &NodeRevId,
) -> FsResult<NodeRevId> {
    ctx.cancel.check()?;
    let fs = ctx.fs;
    let mut node = revision::read_node_rev(fs, id)?;
    let protorev_path = fs.protorev_file(ctx.txn.id());

    let mut final_entries = None;
    if node.kind == NodeKind::Dir {
        let mut entries = (*revision::dir_entries(fs, &node)?).clone();
        for (name, entry) in entries.clone() {
            if entry.id.is_txn() {
                let new_id = rewrite_node(ctx, file, &entry.id)?;
                entries.insert(
                    name,
                    node_rev::DirEntry {
                        kind: entry.kind,
                        id: new_id,
                    },
                );
            }
        }
        final_entries = Some(entries);
    }

    // Finalize the data representation.
    match (&node.kind, node.data_rep.clone()) {
        (NodeKind::Dir, Some(rep)) if rep.is_mutable() => {
            let entries = final_entries.as_ref().expect("directories list entries");
            let serialized = node_rev::write_dir_entries(entries);
            let base = if fs.config().deltify_directories {
                representation::choose_delta_base(fs, &node, RepSelector::Data)?
            } else {
                None
            };
            // Directory reps never persist a SHA-1.
            node.data_rep = Some(write_rep(ctx, file, &serialized, base, false)?);
        }
        (NodeKind::Dir, None) => {
            let entries = final_entries.as_ref().expect("directories list entries");
            let serialized = node_rev::write_dir_entries(entries);
            node.data_rep = Some(write_rep(ctx, file, &serialized, None, false)?);
        }
        (_, Some(mut rep)) if rep.is_mutable() => {
            // File contents already live in the proto-revision; just
            // renumber the descriptor, after the truncation check.
            if rep.offset + rep.size > ctx.protorev_len_before {
                return Err(FsError::corrupt(
                    &protorev_path,
                    "proto-revision was truncated under a staged representation",
                ));
            }
            rep.revision = Some(ctx.new_rev);
            rep.txn_id = None;
            if let Some(sha1) = rep.sha1 {
                ctx.rep_queue.push(RepCacheEntry {
                    sha1,
                    revision: ctx.new_rev,
                    offset: rep.offset,
                    size: rep.size,
                    expanded_size: rep.expanded_size,
                });
            }
            node.data_rep = Some(rep);
        }
        _ => {}
    }

    // Finalize the property representation.
    if node.prop_rep.as_ref().is_some_and(Representation::is_mutable) {
        let props = crate::transaction::read_mutable_props(fs, &node)?;
        let serialized = proplist::write(&props);
        let base = if fs.config().deltify_properties {
            representation::choose_delta_base(fs, &node, RepSelector::Props)?
        } else {
            None
        };
        // Property reps omit the SHA-1 on disk as well.
        node.prop_rep = Some(write_rep(ctx, file, &serialized, base, false)?);
    }

    // The committed ID.
    let IdLocation::Transaction(_) = &node.id.location else {
        return Err(FsError::corrupt(&protorev_path, "rewriting a committed node"));
    };
    let node_id = permanent_node_id(ctx, &node.id)?;
    let copy_id = permanent_copy_id(ctx, &node.id)?;
    let offset = file.seek(std::io::SeekFrom::End(0)).context(&protorev_path)?;
    let new_id = NodeRevId::committed(node_id, copy_id, ctx.new_rev, offset);

    let old_unparse = node.id.unparse();
    let committed = NodeRevision {
        id: new_id.clone(),
        is_fresh_txn_root: false,
        ..node
    };
    file.write_all(&committed.write()).context(&protorev_path)?;
    ctx.id_map.insert(old_unparse, new_id.clone());

    // Remember fresh origins for the node-origins cache; failures only
    // cost a later walk.
    if committed.predecessor_count == 0 {
        let origin_path = fs.node_origins_dir().join(new_id.node_id.as_str());
        if let Err(err) =
            file_util::write_file_atomically(&origin_path, new_id.unparse().as_bytes())
        {
            fs.warn(
                WarningKind::NodeOrigins,
                &format!("cannot record origin of {}: {err}", new_id.node_id),
            );
        }
    }
    Ok(new_id)
}

/// Writes one serialized blob as a representation of the new revision,
/// honoring rep sharing.
fn write_rep(
    ctx: &mut CommitContext<'_>,
    file: &mut File,
    fulltext: &[u8],
    base: Option<Representation>,
    persist_sha1: bool,
) -> FsResult<Representation> {
    let fs = ctx.fs;
    let protorev_path = fs.protorev_file(ctx.txn.id());
    let delta_base = match base {
        Some(rep) => Some(DeltaBase::load(fs, &rep)?),
        None => None,
    };
    let start_offset = file.seek(std::io::SeekFrom::End(0)).context(&protorev_path)?;
    let mut writer = representation::RepWriter::start(file, &protorev_path, delta_base)?;
    writer.write_all(fulltext)?;
    let finished = writer.finish()?;

    if let Some(shared) = ctx.txn.lookup_shared_rep(&finished.sha1) {
        if !shared.is_mutable() {
            file.set_len(start_offset).context(&protorev_path)?;
            file.seek(std::io::SeekFrom::End(0)).context(&protorev_path)?;
            return Ok(Representation {
                md5: Some(finished.md5),
                sha1: persist_sha1.then_some(finished.sha1),
                uniquifier: None,
                ..shared
            });
        }
    }
    let rep = Representation {
        revision: Some(ctx.new_rev),
        offset: finished.offset,
        size: finished.size,
        expanded_size: finished.expanded_size,
        md5: Some(finished.md5),
        sha1: persist_sha1.then_some(finished.sha1),
        txn_id: None,
        uniquifier: None,
    };
    ctx.rep_queue.push(RepCacheEntry {
        sha1: finished.sha1,
        revision: ctx.new_rev,
        offset: rep.offset,
        size: rep.size,
        expanded_size: rep.expanded_size,
    });
    Ok(rep)
}

fn permanent_node_id(
    ctx: &CommitContext<'_>,
    id: &NodeRevId,
) -> FsResult<crate::id::NodeId> {
    if !id.node_id.is_transient() {
        return Ok(id.node_id.clone());
    }
    match ctx.legacy_starts {
        None => Ok(id.node_id.permanent(ctx.new_rev)),
        Some((node_start, _)) => {
            let local = base36::decode(&id.node_id.as_str()[1..])
                .ok_or_else(|| FsError::corrupt(ctx.fs.path(), "bad transient node-ID"))?;
            Ok(crate::id::NodeId::new(base36::encode(node_start + local)))
        }
    }
}

fn permanent_copy_id(
    ctx: &CommitContext<'_>,
    id: &NodeRevId,
) -> FsResult<crate::id::CopyId> {
    if !id.copy_id.is_transient() {
        return Ok(id.copy_id.clone());
    }
    match ctx.legacy_starts {
        None => Ok(id.copy_id.permanent(ctx.new_rev)),
        Some((_, copy_start)) => {
            let local = base36::decode(&id.copy_id.as_str()[1..])
                .ok_or_else(|| FsError::corrupt(ctx.fs.path(), "bad transient copy-ID"))?;
            Ok(crate::id::CopyId::new(base36::encode(copy_start + local)))
        }
    }
}

/// Maps a change record's transaction-form ID to its committed form. A
/// deleted clone never reaches the revision file; its identity falls back
/// to the predecessor it was cloned from.
fn rewrite_change_ids(ctx: &CommitContext<'_>, mut change: Change) -> FsResult<Change> {
    if let Some(id) = &change.id {
        if id.is_txn() {
            if let Some(new_id) = ctx.id_map.get(&id.unparse()) {
                change.id = Some(new_id.clone());
            } else {
                let node = revision::read_node_rev(ctx.fs, id)?;
                change.id = Some(node.predecessor.ok_or_else(|| {
                    FsError::corrupt(
                        ctx.fs.path(),
                        "change references an unreachable staged node",
                    )
                })?);
            }
        }
    }
    Ok(change)
}

/// Step 2: every changed path must be clear of other users' locks. Paths
/// are checked in depth-first (lexicographic) order; a recursive check at
/// an ancestor covers its descendants.
fn verify_locks(fs: &FileSystem, txn: &Transaction<'_>) -> FsResult<()> {
    let folded = txn.changed_paths()?;
    let mut covered: Option<String> = None;
    for (path, change) in folded.iter().sorted_by(|(a, _), (b, _)| a.cmp(b)) {
        if let Some(prefix) = &covered {
            if path.starts_with(&format!("{prefix}/")) {
                continue;
            }
        }
        let recursive = !matches!(change.kind, ChangeKind::Modify);
        locks::verify_path(fs, path, recursive)?;
        if recursive {
            covered = Some(path.clone());
        }
    }
    Ok(())
}
