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

//! Scratch repositories for the integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::path::PathBuf;

use revfs_lib::id::RevNum;
use revfs_lib::revision::Revision;
use revfs_lib::store::CancelToken;
use revfs_lib::store::FileSystem;
use revfs_lib::store::Format;
use revfs_lib::store::Layout;
use revfs_lib::transaction::Transaction;
use tempfile::TempDir;

pub fn new_temp_dir() -> TempDir {
    tempfile::Builder::new()
        .prefix("revfs-test-")
        .tempdir()
        .unwrap()
}

/// A freshly created repository inside its own temp dir.
pub struct TestRepo {
    pub temp_dir: TempDir,
    pub fs: FileSystem,
}

impl TestRepo {
    pub fn init() -> Self {
        let temp_dir = new_temp_dir();
        let fs = FileSystem::create(temp_dir.path().join("repo")).unwrap();
        Self { temp_dir, fs }
    }

    pub fn init_sharded(shard_size: u64) -> Self {
        let temp_dir = new_temp_dir();
        let format = Format {
            layout: Layout::Sharded(shard_size),
            ..Format::current()
        };
        let fs =
            FileSystem::create_with_format(temp_dir.path().join("repo"), format).unwrap();
        Self { temp_dir, fs }
    }

    pub fn path(&self) -> PathBuf {
        self.temp_dir.path().join("repo")
    }

    /// Commits `contents` at `path`, creating the file if needed. Returns
    /// the new revision.
    pub fn commit_file(&self, path: &str, contents: &[u8]) -> RevNum {
        let base = self.fs.youngest().unwrap();
        let txn = Transaction::begin(&self.fs, base).unwrap();
        if Revision::open(&self.fs, base)
            .unwrap()
            .check_path(path)
            .unwrap()
            .is_none()
        {
            txn.make_file(path).unwrap();
        }
        txn.apply_text(path, contents).unwrap();
        txn.commit(&CancelToken::never()).unwrap()
    }

    /// Reads a file's committed contents at `rev`.
    pub fn read_file(&self, rev: RevNum, path: &str) -> Vec<u8> {
        let revision = Revision::open(&self.fs, rev).unwrap();
        let node = revision.node_rev_at(path).unwrap().unwrap();
        revision.file_contents(&node).unwrap()
    }
}

/// Byte-for-byte file comparison.
pub fn files_identical(a: &Path, b: &Path) -> bool {
    std::fs::read(a).unwrap() == std::fs::read(b).unwrap()
}
