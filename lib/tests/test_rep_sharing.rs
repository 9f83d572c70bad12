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

use pretty_assertions::assert_eq;
use revfs_lib::config::FsConfig;
use revfs_lib::node_rev::Representation;
use revfs_lib::rep_cache::RepCache;
use revfs_lib::revision::Revision;
use revfs_lib::store::CancelToken;
use revfs_lib::transaction::Transaction;

use crate::testutils::TestRepo;

fn data_rep(repo: &TestRepo, rev: u64, path: &str) -> Representation {
    Revision::open(&repo.fs, rev)
        .unwrap()
        .node_rev_at(path)
        .unwrap()
        .unwrap()
        .data_rep
        .unwrap()
}

fn location(rep: &Representation) -> (Option<u64>, u64, u64) {
    (rep.revision, rep.offset, rep.size)
}

#[test]
fn identical_contents_share_one_representation_across_revisions() {
    let repo = TestRepo::init();
    repo.commit_file("/a", b"payload");
    repo.commit_file("/b", b"payload");

    let rep_a = data_rep(&repo, 2, "/a");
    let rep_b = data_rep(&repo, 2, "/b");
    assert_eq!(location(&rep_a), location(&rep_b));
    assert_eq!(rep_a.revision, Some(1));

    // Exactly one rep-cache row resolves that fulltext, at its first home.
    let cache = RepCache::open(&repo.path().join("rep-cache.db")).unwrap();
    let entry = cache.get(&rep_a.sha1.unwrap()).unwrap().unwrap();
    assert_eq!(entry.revision, 1);
    assert_eq!(entry.offset, rep_a.offset);
}

#[test]
fn identical_contents_share_within_one_transaction() {
    let repo = TestRepo::init();
    let txn = Transaction::begin(&repo.fs, 0).unwrap();
    txn.make_file("/a").unwrap();
    txn.apply_text("/a", b"same bytes").unwrap();
    txn.make_file("/b").unwrap();
    txn.apply_text("/b", b"same bytes").unwrap();
    let rev = txn.commit(&CancelToken::never()).unwrap();

    let rep_a = data_rep(&repo, rev, "/a");
    let rep_b = data_rep(&repo, rev, "/b");
    assert_eq!(location(&rep_a), location(&rep_b));
}

#[test]
fn sharing_disabled_stores_duplicates() {
    let repo = TestRepo::init();
    let mut config = FsConfig::default();
    config.enable_rep_sharing = false;
    let mut fs = revfs_lib::store::FileSystem::open(repo.path()).unwrap();
    fs.set_config(config);

    let txn = Transaction::begin(&fs, 0).unwrap();
    txn.make_file("/a").unwrap();
    txn.apply_text("/a", b"dup").unwrap();
    txn.commit(&CancelToken::never()).unwrap();
    let txn = Transaction::begin(&fs, 1).unwrap();
    txn.make_file("/b").unwrap();
    txn.apply_text("/b", b"dup").unwrap();
    let rev = txn.commit(&CancelToken::never()).unwrap();

    let rep_a = data_rep(&repo, rev, "/a");
    let rep_b = data_rep(&repo, rev, "/b");
    assert_ne!(location(&rep_a), location(&rep_b));
    assert_eq!(rep_b.revision, Some(2));
}

#[test]
fn shared_write_truncates_the_duplicate_bytes() {
    let repo = TestRepo::init();
    let payload = vec![7u8; 4096];
    repo.commit_file("/a", &payload);
    let size_with_one_copy = std::fs::metadata(repo.path().join("revs/0/1"))
        .unwrap()
        .len();
    repo.commit_file("/b", &payload);
    let second_rev_size = std::fs::metadata(repo.path().join("revs/0/2"))
        .unwrap()
        .len();
    // The second revision references the first; it stores directory and
    // node records but not another 4 KiB of payload.
    assert!(second_rev_size < size_with_one_copy);
    assert!(second_rev_size < 2048);
    assert_eq!(repo.read_file(2, "/b"), payload);
}
