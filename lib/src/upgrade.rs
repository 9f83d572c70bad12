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

//! In-place format upgrades.
//!
//! Upgrading creates the files newer formats expect, rewrites the
//! `current` pointer into its new shape, and stamps the new format number
//! last, so an interrupted upgrade leaves a repository that still opens at
//! its old format. Downgrades never happen. The existing revision layout
//! (linear or sharded) is kept as-is.

use std::fs;
use std::path::Path;

use tracing::instrument;

use crate::config::FsConfig;
use crate::file_util;
use crate::file_util::IoResultExt as _;
use crate::store::FORMAT_NUMBER;
use crate::store::FileSystem;
use crate::store::Format;
use crate::store::FsResult;

/// Upgrades the repository at `path` to the current format. Returns the
/// format number in effect afterwards; a no-op when already current.
#[instrument]
pub fn upgrade(path: &Path) -> FsResult<u32> {
    let fs_handle = FileSystem::open(path)?;
    let old = *fs_handle.format();
    if old.number == FORMAT_NUMBER {
        return Ok(FORMAT_NUMBER);
    }
    let new = Format {
        number: FORMAT_NUMBER,
        layout: old.layout,
    };
    fs_handle.with_write_lock(|_guard| {
        // The counter and lock files that formats >= 3 expect.
        if !old.has_txn_current() {
            let txn_current = path.join("txn-current");
            if !txn_current.is_file() {
                fs::write(&txn_current, b"0\n").context(&txn_current)?;
            }
            let txn_current_lock = path.join("txn-current-lock");
            if !txn_current_lock.is_file() {
                fs::write(&txn_current_lock, b"").context(&txn_current_lock)?;
            }
        }
        if !old.has_protorevs_dir() {
            let dir = path.join("txn-protorevs");
            file_util::create_or_reuse_dir(&dir).context(&dir)?;
        }
        let min_unpacked = path.join("min-unpacked-rev");
        if !min_unpacked.is_file() {
            fs::write(&min_unpacked, b"0\n").context(&min_unpacked)?;
        }
        let conf = path.join("fsfs.conf");
        if !conf.is_file() {
            fs::write(&conf, FsConfig::default_file_contents()).context(&conf)?;
        }
        let origins = path.join("node-origins");
        file_util::create_or_reuse_dir(&origins).context(&origins)?;

        // The `current` pointer changes shape at format 4: the global ID
        // counters disappear.
        let state = fs_handle.current()?;
        if !old.no_global_ids() && new.no_global_ids() {
            file_util::write_file_atomically(
                &fs_handle.current_file(),
                format!("{}\n", state.youngest).as_bytes(),
            )?;
        }

        // Packed revprops are recognized but never produced here, so the
        // new layout demands no repacking and leaves nothing to delete.

        // The stamp goes last.
        file_util::write_file_atomically(
            &path.join("format"),
            new.to_file_contents().as_bytes(),
        )?;
        Ok(FORMAT_NUMBER)
    })
}
