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

use revfs_lib::store::FileSystem;
use revfs_lib::transaction::list_transactions;
use revfs_lib::transaction::purge_txn;
use revfs_lib::transaction::Transaction;
use revfs_lib::upgrade::upgrade;

use crate::testutils::TestRepo;

#[test]
fn recover_rebuilds_current_from_the_revs_tree() {
    let repo = TestRepo::init();
    repo.commit_file("/a", b"one");
    repo.commit_file("/b", b"two");
    assert_eq!(repo.fs.youngest().unwrap(), 2);

    // Simulate a crash that lost the pointer bump.
    std::fs::write(repo.path().join("current"), "0\n").unwrap();
    assert_eq!(repo.fs.youngest().unwrap(), 0);
    assert_eq!(repo.fs.recover().unwrap(), 2);
    assert_eq!(repo.fs.youngest().unwrap(), 2);
    assert_eq!(repo.read_file(2, "/b"), b"two");
}

#[test]
fn upgrade_is_idempotent_at_the_current_format() {
    let repo = TestRepo::init();
    assert_eq!(upgrade(&repo.path()).unwrap(), 6);
    assert!(FileSystem::open(repo.path()).is_ok());
}

#[test]
fn upgrade_stamps_an_older_format_forward() {
    let repo = TestRepo::init();
    repo.commit_file("/a", b"x");
    // Rewind the stamp to format 4 (same layout, same current shape).
    std::fs::write(
        repo.path().join("format"),
        "4\nlayout sharded 1000\n",
    )
    .unwrap();
    std::fs::remove_file(repo.path().join("fsfs.conf")).unwrap();

    assert_eq!(upgrade(&repo.path()).unwrap(), 6);
    let fs = FileSystem::open(repo.path()).unwrap();
    assert_eq!(fs.format().number, 6);
    assert!(repo.path().join("fsfs.conf").is_file());
    assert!(repo.path().join("txn-current").is_file());
    // History is untouched.
    assert_eq!(fs.youngest().unwrap(), 1);
}

#[test]
fn purge_txn_removes_abandoned_transactions() {
    let repo = TestRepo::init();
    let txn = Transaction::begin(&repo.fs, 0).unwrap();
    txn.make_file("/orphan").unwrap();
    let id = txn.id().as_str().to_string();
    drop(txn);

    assert_eq!(list_transactions(&repo.fs).unwrap().len(), 1);
    purge_txn(&repo.fs, &id).unwrap();
    assert!(list_transactions(&repo.fs).unwrap().is_empty());
}
