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

use assert_matches::assert_matches;
use revfs_lib::hotcopy::hotcopy;
use revfs_lib::pack::pack;
use revfs_lib::store::CancelToken;
use revfs_lib::store::FileSystem;
use revfs_lib::store::FsError;

use crate::testutils::TestRepo;
use crate::testutils::files_identical;
use crate::testutils::new_temp_dir;

fn assert_replica_matches(repo: &TestRepo, dst: &std::path::Path) {
    let src_fs = FileSystem::open(repo.path()).unwrap();
    let dst_fs = FileSystem::open(dst).unwrap();
    assert_eq!(dst_fs.youngest().unwrap(), src_fs.youngest().unwrap());
    assert_eq!(dst_fs.uuid(), src_fs.uuid());
    for rev in 0..=src_fs.youngest().unwrap() {
        for path in [format!("revs/0/{rev}"), format!("revprops/0/{rev}")] {
            assert!(
                files_identical(&repo.path().join(&path), &dst.join(&path)),
                "replica differs at {path}"
            );
        }
    }
    assert!(files_identical(
        &repo.path().join("current"),
        &dst.join("current")
    ));
}

#[test]
fn fresh_hotcopy_replicates_every_revision() {
    let repo = TestRepo::init();
    for i in 0..3u8 {
        repo.commit_file(&format!("/f{i}"), &[i; 10]);
    }
    let dst_dir = new_temp_dir();
    let dst = dst_dir.path().join("replica");
    hotcopy(&repo.path(), &dst, false, &CancelToken::never()).unwrap();
    assert_replica_matches(&repo, &dst);
    // The replica is independently readable.
    let dst_fs = FileSystem::open(&dst).unwrap();
    let revision = revfs_lib::revision::Revision::open(&dst_fs, 2).unwrap();
    assert!(revision.check_path("/f1").unwrap().is_some());
}

#[test]
fn incremental_hotcopy_catches_up() {
    let repo = TestRepo::init();
    for i in 0..3u8 {
        repo.commit_file(&format!("/f{i}"), &[i; 10]);
    }
    let dst_dir = new_temp_dir();
    let dst = dst_dir.path().join("replica");
    hotcopy(&repo.path(), &dst, false, &CancelToken::never()).unwrap();

    for i in 3..6u8 {
        repo.commit_file(&format!("/f{i}"), &[i; 10]);
    }
    hotcopy(&repo.path(), &dst, true, &CancelToken::never()).unwrap();
    assert_replica_matches(&repo, &dst);

    // An incremental catch-up and a fresh copy agree.
    let fresh_dir = new_temp_dir();
    let fresh = fresh_dir.path().join("replica2");
    hotcopy(&repo.path(), &fresh, false, &CancelToken::never()).unwrap();
    let a = FileSystem::open(&dst).unwrap();
    let b = FileSystem::open(&fresh).unwrap();
    assert_eq!(a.youngest().unwrap(), b.youngest().unwrap());
    for rev in 0..=a.youngest().unwrap() {
        assert!(files_identical(
            &dst.join(format!("revs/0/{rev}")),
            &fresh.join(format!("revs/0/{rev}"))
        ));
    }
}

#[test]
fn swapped_arguments_are_rejected() {
    let repo = TestRepo::init();
    repo.commit_file("/a", b"x");
    repo.commit_file("/b", b"y");
    let dst_dir = new_temp_dir();
    let dst = dst_dir.path().join("replica");
    hotcopy(&repo.path(), &dst, false, &CancelToken::never()).unwrap();
    repo.commit_file("/c", b"z");

    assert_matches!(
        hotcopy(&dst, &repo.path(), true, &CancelToken::never()),
        Err(FsError::HotCopyMismatch(_))
    );
}

#[test]
fn interrupted_fresh_destination_refuses_to_open() {
    let repo = TestRepo::init();
    repo.commit_file("/a", b"x");
    let dst_dir = new_temp_dir();
    let dst = dst_dir.path().join("replica");
    hotcopy(&repo.path(), &dst, false, &CancelToken::never()).unwrap();

    std::fs::write(dst.join("hotcopy-in-progress"), b"").unwrap();
    assert_matches!(
        FileSystem::open(&dst),
        Err(FsError::HotCopyIncomplete(_))
    );
}

#[test]
fn hotcopy_carries_packed_shards() {
    let repo = TestRepo::init_sharded(4);
    for i in 0..9u8 {
        repo.commit_file(&format!("/f{i}"), &[i; 8]);
    }
    // Shards 0 and 1 (revisions 0..=7) become packs; 8..=9 stay loose.
    let min_unpacked = pack(&repo.fs, &CancelToken::never()).unwrap();
    assert_eq!(min_unpacked, 8);
    assert!(repo.path().join("revs/0.pack/pack").is_file());
    assert!(!repo.path().join("revs/0").exists());
    // Packed revisions still read.
    assert_eq!(repo.read_file(3, "/f2"), [2; 8]);

    let dst_dir = new_temp_dir();
    let dst = dst_dir.path().join("replica");
    hotcopy(&repo.path(), &dst, false, &CancelToken::never()).unwrap();

    let dst_fs = FileSystem::open(&dst).unwrap();
    assert_eq!(dst_fs.youngest().unwrap(), 9);
    assert_eq!(dst_fs.min_unpacked_rev().unwrap(), 8);
    assert!(dst.join("revs/0.pack/pack").is_file());
    assert!(files_identical(
        &repo.path().join("revs/0.pack/pack"),
        &dst.join("revs/0.pack/pack")
    ));
    let revision = revfs_lib::revision::Revision::open(&dst_fs, 3).unwrap();
    assert!(revision.check_path("/f2").unwrap().is_some());
}
