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

//! Hot-copy: producing a usable replica of a repository that keeps
//! accepting writes.
//!
//! Fresh mode populates an empty destination; incremental mode catches an
//! existing replica up. The destination's write lock is held throughout.
//! Revisions become visible at the destination in order: its `current`
//! pointer is bumped as packs land and every shard's worth of unpacked
//! revisions, so a reader of the half-built replica still sees a
//! consistent (if old) repository. The format stamp is written last; in
//! fresh mode a marker file makes a torn-off destination refuse to open.

use std::fs;
use std::path::Path;

use tracing::instrument;

use crate::config::FsConfig;
use crate::file_util;
use crate::file_util::IoResultExt as _;
use crate::id::RevNum;
use crate::lock::FileLock;
use crate::rep_cache::RepCache;
use crate::store::CancelToken;
use crate::store::CurrentState;
use crate::store::FileSystem;
use crate::store::FsError;
use crate::store::FsResult;
use crate::store::HOTCOPY_MARKER_FILE;
use crate::store::WarningKind;

/// Produces (or catches up) a replica of `src_path` at `dst_path`.
#[instrument(skip(cancel))]
pub fn hotcopy(
    src_path: &Path,
    dst_path: &Path,
    incremental: bool,
    cancel: &CancelToken,
) -> FsResult<()> {
    let src = FileSystem::open(src_path)?;
    let dst = if incremental {
        let dst = FileSystem::open(dst_path)?;
        if dst.format().number != src.format().number {
            return Err(FsError::HotCopyMismatch(format!(
                "format {} at the source, {} at the destination",
                src.format().number,
                dst.format().number
            )));
        }
        if dst.uuid() != src.uuid() {
            return Err(FsError::HotCopyMismatch("UUID mismatch".to_string()));
        }
        if dst.format().shard_size() != src.format().shard_size() {
            return Err(FsError::HotCopyMismatch("shard size mismatch".to_string()));
        }
        dst
    } else {
        create_skeleton(&src, dst_path)?
    };

    // The whole copy is one mutation of the destination.
    let _dst_write_lock = FileLock::lock(dst.path().join("write-lock"))?;

    // Step 1: the config file first, so an early failure cannot leave a
    // destination that opens but behaves differently from its source.
    copy_if_exists(&src.path().join("fsfs.conf"), &dst.path().join("fsfs.conf"))?;

    // Step 2: youngest on both sides; a destination ahead of its source
    // means the arguments are swapped.
    let src_youngest = src.youngest()?;
    let mut dst_youngest = if incremental { dst.youngest()? } else { 0 };
    if src_youngest < dst_youngest {
        return Err(FsError::HotCopyMismatch(format!(
            "source r{src_youngest} is older than destination r{dst_youngest} (swapped arguments?)"
        )));
    }

    // Step 3: the packing boundary.
    let src_min_unpacked = src.min_unpacked_rev()?;
    copy_if_exists(
        &src.path().join("min-unpacked-rev"),
        &dst.path().join("min-unpacked-rev"),
    )?;

    // Step 4: packed shards.
    if let Some(shard_size) = src.format().shard_size() {
        let mut shard = 0;
        while (shard + 1) * shard_size <= src_min_unpacked {
            cancel.check()?;
            copy_packed_shard(&src, &dst, shard, shard_size, &mut dst_youngest, incremental)?;
            shard += 1;
        }
    }

    // Step 5: unpacked revisions, resilient to the source packing them
    // away mid-copy.
    let shard_size = src.format().shard_size().unwrap_or(u64::MAX);
    let mut rev = src_min_unpacked;
    while rev <= src_youngest {
        cancel.check()?;
        match copy_revision(&src, &dst, rev) {
            Ok(()) => {}
            Err(FsError::Io(err)) if err.is_not_found() => {
                // The source packed this revision while we were copying.
                let new_min = src.min_unpacked_rev()?;
                if new_min > src_youngest {
                    return Err(FsError::RestartHotCopy);
                }
                if rev >= new_min {
                    return Err(err.into());
                }
                let shard = rev / shard_size;
                copy_packed_shard(&src, &dst, shard, shard_size, &mut dst_youngest, incremental)?;
                rev = (shard + 1) * shard_size;
                continue;
            }
            Err(err) => return Err(err),
        }
        // Step 6: publish progress at every shard boundary.
        if rev > dst_youngest && (rev % shard_size == 0 || rev == src_youngest) {
            bump_current(&src, &dst, rev)?;
            dst_youngest = rev;
        }
        rev += 1;
    }

    // Step 7: the destination reaches the source's youngest.
    if dst_youngest < src_youngest {
        bump_current(&src, &dst, src_youngest)?;
    }

    // Step 8: the locks tree, accepting the brief staleness window.
    replace_tree(&src.path().join("locks"), &dst.path().join("locks"))?;

    // Step 9: node-origins.
    replace_tree(
        &src.path().join("node-origins"),
        &dst.path().join("node-origins"),
    )?;

    // Step 10: the rep-cache, trimmed to what the destination can serve.
    if src.path().join(crate::rep_cache::REP_CACHE_FILE).is_file() {
        copy_if_exists(
            &src.path().join(crate::rep_cache::REP_CACHE_FILE),
            &dst.path().join(crate::rep_cache::REP_CACHE_FILE),
        )?;
        match RepCache::open(&dst.path().join(crate::rep_cache::REP_CACHE_FILE)) {
            Ok(mut cache) => {
                if let Err(err) = cache.purge_beyond(src_youngest) {
                    dst.warn(
                        WarningKind::RepCache,
                        &format!("cannot trim the copied rep-cache: {err}"),
                    );
                }
            }
            Err(err) => dst.warn(
                WarningKind::RepCache,
                &format!("cannot open the copied rep-cache: {err}"),
            ),
        }
    }

    // Step 11: the transaction counter; a replica starts with a clean
    // revprop generation.
    copy_if_exists(&src.path().join("txn-current"), &dst.path().join("txn-current"))?;
    if src.path().join("revprop-generation").is_file() {
        file_util::write_file_atomically(&dst.path().join("revprop-generation"), b"0\n")?;
    }

    // Step 12: the stamp that makes the destination a repository.
    file_util::write_file_atomically(
        &dst.path().join("format"),
        src.format().to_file_contents().as_bytes(),
    )?;
    let marker = dst.path().join(HOTCOPY_MARKER_FILE);
    if marker.is_file() {
        fs::remove_file(&marker).context(&marker)?;
    }
    tracing::debug!(youngest = src_youngest, "hot-copy finished");
    Ok(())
}

/// Fresh mode: lay out an empty destination, marked in-progress until the
/// format stamp lands.
fn create_skeleton(src: &FileSystem, dst_path: &Path) -> FsResult<FileSystem> {
    file_util::create_or_reuse_dir(dst_path).context(dst_path)?;
    if fs::read_dir(dst_path).context(dst_path)?.next().is_some() {
        return Err(FsError::HotCopyMismatch(
            "fresh hot-copy destination is not empty".to_string(),
        ));
    }
    fs::write(dst_path.join(HOTCOPY_MARKER_FILE), b"")
        .context(dst_path.join(HOTCOPY_MARKER_FILE))?;
    for dir in ["revs", "revprops", "transactions", "txn-protorevs", "locks", "node-origins"] {
        let dir = dst_path.join(dir);
        fs::create_dir(&dir).context(&dir)?;
    }
    for lock_file in ["write-lock", "txn-current-lock"] {
        fs::write(dst_path.join(lock_file), b"").context(dst_path.join(lock_file))?;
    }
    fs::write(dst_path.join("uuid"), format!("{}\n", src.uuid()))
        .context(dst_path.join("uuid"))?;
    let initial = CurrentState {
        youngest: 0,
        next_node_id: (!src.format().no_global_ids()).then(|| "0".to_string()),
        next_copy_id: (!src.format().no_global_ids()).then(|| "0".to_string()),
    };
    let dst = FileSystem::open_unverified(
        dst_path,
        *src.format(),
        src.uuid().to_string(),
        FsConfig::default(),
    );
    dst.write_current(&initial)?;
    Ok(dst)
}

fn copy_packed_shard(
    src: &FileSystem,
    dst: &FileSystem,
    shard: u64,
    shard_size: u64,
    dst_youngest: &mut RevNum,
    incremental: bool,
) -> FsResult<()> {
    let src_pack = src.pack_dir_path(shard);
    let dst_pack = dst.pack_dir_path(shard);
    file_util::copy_dir_recursively(&src_pack, &dst_pack)?;

    // Bring the shard's revprops over before revisions become visible.
    let src_props_shard = src.revprops_dir().join(shard.to_string());
    if src_props_shard.is_dir() {
        file_util::copy_dir_recursively(
            &src_props_shard,
            &dst.revprops_dir().join(shard.to_string()),
        )?;
    }

    let last_rev = (shard + 1) * shard_size - 1;
    if last_rev > *dst_youngest {
        bump_current(src, dst, last_rev)?;
        *dst_youngest = last_rev;
    }

    if incremental {
        // The unpacked copies of these revisions are now redundant.
        let dst_shard_dir = dst.revs_dir().join(shard.to_string());
        if dst_shard_dir.is_dir() {
            for rev in shard * shard_size..=last_rev {
                let file = dst.rev_file_path(rev);
                match fs::remove_file(&file) {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => return Err(file_util::PathError::new(&file, err).into()),
                }
            }
            // Leftover stragglers keep the directory; that is fine.
            let _ = fs::remove_dir(&dst_shard_dir);
        }
    }
    Ok(())
}

fn copy_revision(src: &FileSystem, dst: &FileSystem, rev: RevNum) -> FsResult<()> {
    if let Some(shard) = src.shard_of(rev) {
        for parent in [dst.revs_dir(), dst.revprops_dir()] {
            let dir = parent.join(shard.to_string());
            file_util::create_or_reuse_dir(&dir).context(&dir)?;
        }
    }
    let src_rev = src.rev_file_path(rev);
    let dst_rev = dst.rev_file_path(rev);
    if !file_util::same_file_cheap(&src_rev, &dst_rev) {
        file_util::copy_file(&src_rev, &dst_rev)?;
    }
    let src_props = src.revprops_file_path(rev);
    let dst_props = dst.revprops_file_path(rev);
    if !file_util::same_file_cheap(&src_props, &dst_props) {
        file_util::copy_file(&src_props, &dst_props)?;
    }
    Ok(())
}

/// Advances the destination's `current`, carrying the legacy next-ID
/// tokens over from the source where the format demands them.
fn bump_current(src: &FileSystem, dst: &FileSystem, youngest: RevNum) -> FsResult<()> {
    let (next_node_id, next_copy_id) = if src.format().no_global_ids() {
        (None, None)
    } else {
        let state = src.current()?;
        (state.next_node_id, state.next_copy_id)
    };
    dst.write_current(&CurrentState {
        youngest,
        next_node_id,
        next_copy_id,
    })
}

fn copy_if_exists(src: &Path, dst: &Path) -> FsResult<()> {
    if src.is_file() {
        if !file_util::same_file_cheap(src, dst) {
            file_util::copy_file(src, dst)?;
        }
    }
    Ok(())
}

fn replace_tree(src: &Path, dst: &Path) -> FsResult<()> {
    if !src.is_dir() {
        return Ok(());
    }
    if dst.is_dir() {
        fs::remove_dir_all(dst).context(dst)?;
    }
    file_util::copy_dir_recursively(src, dst)?;
    Ok(())
}
