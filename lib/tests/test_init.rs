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
use revfs_lib::node_rev::NodeKind;
use revfs_lib::revision::Revision;
use revfs_lib::store::FileSystem;
use revfs_lib::store::FsError;

use crate::testutils::TestRepo;
use crate::testutils::new_temp_dir;

#[test]
fn empty_init() {
    let repo = TestRepo::init();
    let path = repo.path();

    let format = std::fs::read_to_string(path.join("format")).unwrap();
    assert_eq!(format.lines().next().unwrap(), "6");
    assert_eq!(std::fs::read(path.join("current")).unwrap(), b"0\n");
    assert_eq!(repo.fs.youngest().unwrap(), 0);

    let rev0 = Revision::open(&repo.fs, 0).unwrap();
    let root = rev0.root_node_rev().unwrap();
    assert_eq!(root.kind, NodeKind::Dir);
    assert_eq!(root.predecessor_count, 0);
    assert!(rev0.dir_entries_of(&root).unwrap().is_empty());
    assert!(rev0.changed_paths().unwrap().is_empty());

    // Revision 0 carries a datestamp.
    assert!(repo.fs.revision_prop(0, "svn:date").unwrap().is_some());
}

#[test]
fn reopen_sees_committed_state() {
    let repo = TestRepo::init();
    let rev = repo.commit_file("/a", b"first\n");
    assert_eq!(rev, 1);

    let reopened = FileSystem::open(repo.path()).unwrap();
    assert!(reopened.youngest().unwrap() >= rev);
    assert_eq!(reopened.uuid(), repo.fs.uuid());
}

#[test]
fn revisions_beyond_current_do_not_exist() {
    let repo = TestRepo::init();
    assert_matches!(
        Revision::open(&repo.fs, 1),
        Err(FsError::NoSuchRevision(1))
    );
}

#[test]
fn unknown_format_is_rejected_untouched() {
    let temp_dir = new_temp_dir();
    let path = temp_dir.path().join("repo");
    std::fs::create_dir(&path).unwrap();
    std::fs::write(path.join("format"), "99\n").unwrap();
    assert_matches!(
        FileSystem::open(&path),
        Err(FsError::UnsupportedFormat(99))
    );
    // The stamp is all the directory ever contains.
    assert_eq!(std::fs::read_dir(&path).unwrap().count(), 1);
}

#[test]
fn create_refuses_populated_directory() {
    let temp_dir = new_temp_dir();
    let path = temp_dir.path().join("repo");
    std::fs::create_dir(&path).unwrap();
    std::fs::write(path.join("stray"), "x").unwrap();
    assert!(FileSystem::create(&path).is_err());
}

#[test]
fn zero_byte_file_round_trips() {
    let repo = TestRepo::init();
    let rev = repo.commit_file("/empty", b"");
    assert_eq!(repo.read_file(rev, "/empty"), b"");

    let revision = Revision::open(&repo.fs, rev).unwrap();
    let node = revision.node_rev_at("/empty").unwrap().unwrap();
    let rep = node.data_rep.unwrap();
    assert_eq!(rep.expanded_size, 0);
    // SHA-1 of the empty string.
    assert_eq!(
        hex::encode(rep.sha1.unwrap()),
        "da39a3ee5e6b4b0d3255bfef95601890afd80709"
    );
}
