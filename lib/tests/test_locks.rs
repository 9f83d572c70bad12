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
use revfs_lib::locks::get_lock;
use revfs_lib::locks::get_locks_under;
use revfs_lib::locks::lock_path;
use revfs_lib::locks::unlock_path;
use revfs_lib::store::AccessContext;
use revfs_lib::store::CancelToken;
use revfs_lib::store::FileSystem;
use revfs_lib::store::FsError;
use revfs_lib::transaction::Transaction;

use crate::testutils::TestRepo;

#[test]
fn lock_cycle() {
    let repo = TestRepo::init();
    repo.commit_file("/a", b"contents");

    let lock = lock_path(&repo.fs, "/a", "ada", None).unwrap();
    assert_eq!(lock.owner, "ada");
    assert_eq!(get_lock(&repo.fs, "/a").unwrap().unwrap().token, lock.token);

    // A second lock attempt fails; so does unlocking with a wrong token.
    assert_matches!(
        lock_path(&repo.fs, "/a", "grace", None),
        Err(FsError::LockVerification { .. })
    );
    assert_matches!(
        unlock_path(&repo.fs, "/a", Some("not-the-token"), false),
        Err(FsError::LockVerification { .. })
    );
    unlock_path(&repo.fs, "/a", Some(&lock.token), false).unwrap();
    assert!(get_lock(&repo.fs, "/a").unwrap().is_none());
}

#[test]
fn locks_enumerate_by_prefix() {
    let repo = TestRepo::init();
    let txn = Transaction::begin(&repo.fs, 0).unwrap();
    txn.make_dir("/d").unwrap();
    txn.make_file("/d/one").unwrap();
    txn.make_file("/d/two").unwrap();
    txn.make_file("/done").unwrap();
    txn.commit(&CancelToken::never()).unwrap();

    lock_path(&repo.fs, "/d/one", "ada", None).unwrap();
    lock_path(&repo.fs, "/d/two", "ada", None).unwrap();
    lock_path(&repo.fs, "/done", "ada", None).unwrap();

    let under = get_locks_under(&repo.fs, "/d").unwrap();
    let paths: Vec<&str> = under.iter().map(|lock| lock.path.as_str()).collect();
    assert_eq!(paths, ["/d/one", "/d/two"]);
}

#[test]
fn commit_requires_matching_lock_token() {
    let repo = TestRepo::init();
    repo.commit_file("/a", b"v1");
    let lock = lock_path(&repo.fs, "/a", "ada", None).unwrap();

    // No access context: the commit is rejected.
    let txn = Transaction::begin(&repo.fs, 1).unwrap();
    txn.apply_text("/a", b"v2").unwrap();
    assert_matches!(
        txn.commit(&CancelToken::never()),
        Err(FsError::LockVerification { .. })
    );

    // The owner with the right token gets through.
    let mut fs = FileSystem::open(repo.path()).unwrap();
    let mut access = AccessContext {
        username: "ada".to_string(),
        tokens: Default::default(),
    };
    access.tokens.insert(lock.token.clone());
    fs.set_access(Some(access));
    let txn = Transaction::begin(&fs, 1).unwrap();
    txn.apply_text("/a", b"v2").unwrap();
    assert_eq!(txn.commit(&CancelToken::never()).unwrap(), 2);
}

#[test]
fn recursive_verification_covers_descendants() {
    let repo = TestRepo::init();
    let txn = Transaction::begin(&repo.fs, 0).unwrap();
    txn.make_dir("/d").unwrap();
    txn.make_file("/d/f").unwrap();
    txn.commit(&CancelToken::never()).unwrap();
    lock_path(&repo.fs, "/d/f", "ada", None).unwrap();

    // Deleting the parent directory needs the descendant's lock.
    let txn = Transaction::begin(&repo.fs, 1).unwrap();
    txn.delete("/d").unwrap();
    assert_matches!(
        txn.commit(&CancelToken::never()),
        Err(FsError::LockVerification { .. })
    );
}
