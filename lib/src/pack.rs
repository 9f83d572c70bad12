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

//! Shard packing.
//!
//! A completed shard's revision files can be consolidated into a single
//! `<N>.pack/pack` file plus a `manifest` of per-revision offsets. Packed
//! and unpacked revisions coexist; `min-unpacked-rev` records the
//! boundary. Packing never touches the shard containing the youngest
//! revision, so readers racing a pack only ever lose the unpacked copy of
//! data that is already available packed.

use std::fs;
use std::fs::File;
use std::io::Read as _;
use std::io::Write as _;

use tracing::instrument;

use crate::file_util;
use crate::file_util::IoResultExt as _;
use crate::id::RevNum;
use crate::store::CancelToken;
use crate::store::FileSystem;
use crate::store::FsError;
use crate::store::FsResult;

/// Packs every completed shard below the youngest revision's shard.
/// Returns the new `min-unpacked-rev`.
#[instrument(skip_all)]
pub fn pack(fs_handle: &FileSystem, cancel: &CancelToken) -> FsResult<RevNum> {
    let Some(shard_size) = fs_handle.format().shard_size() else {
        return Err(FsError::HotCopyMismatch(
            "linear repositories have no shards to pack".to_string(),
        ));
    };
    if !fs_handle.format().supports_packing() {
        return Err(FsError::UnsupportedFormat(fs_handle.format().number));
    }
    fs_handle.with_write_lock(|guard| {
        // The shard holding youngest stays unpacked; everything below the
        // youngest's shard boundary is fair game.
        let completed_shards = guard.youngest / shard_size;
        let mut min_unpacked = guard.min_unpacked_rev;
        while min_unpacked / shard_size < completed_shards {
            cancel.check()?;
            let shard = min_unpacked / shard_size;
            pack_shard(fs_handle, shard, shard_size)?;
            min_unpacked = (shard + 1) * shard_size;
            fs_handle.write_min_unpacked_rev(min_unpacked)?;
        }
        Ok(min_unpacked)
    })
}

fn pack_shard(fs_handle: &FileSystem, shard: u64, shard_size: u64) -> FsResult<()> {
    let first_rev = shard * shard_size;
    let shard_dir = fs_handle.revs_dir().join(shard.to_string());
    let pack_dir = fs_handle.pack_dir_path(shard);
    // A pack directory left by an interrupted run is rebuilt from scratch.
    if pack_dir.exists() {
        fs::remove_dir_all(&pack_dir).context(&pack_dir)?;
    }
    fs::create_dir(&pack_dir).context(&pack_dir)?;

    let pack_path = pack_dir.join("pack");
    let mut pack_file = File::create(&pack_path).context(&pack_path)?;
    let mut manifest = String::new();
    let mut offset = 0u64;
    for rev in first_rev..first_rev + shard_size {
        let rev_path = fs_handle.rev_file_path(rev);
        let mut rev_file = File::open(&rev_path).context(&rev_path)?;
        manifest.push_str(&format!("{offset}\n"));
        let mut buf = [0u8; 1 << 16];
        loop {
            let n = rev_file.read(&mut buf).context(&rev_path)?;
            if n == 0 {
                break;
            }
            pack_file.write_all(&buf[..n]).context(&pack_path)?;
            offset += n as u64;
        }
    }
    pack_file.sync_all().context(&pack_path)?;
    file_util::write_file_atomically(&pack_dir.join("manifest"), manifest.as_bytes())?;

    fs::remove_dir_all(&shard_dir).context(&shard_dir)?;
    tracing::debug!(shard, "packed");
    Ok(())
}
