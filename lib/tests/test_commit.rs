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
use pretty_assertions::assert_eq;
use revfs_lib::changes::ChangeKind;
use revfs_lib::node_rev::NodeKind;
use revfs_lib::revision::Revision;
use revfs_lib::store::CancelToken;
use revfs_lib::store::FsError;
use revfs_lib::transaction::Transaction;
use revfs_lib::transaction::list_transactions;

use crate::testutils::TestRepo;

#[test]
fn single_file_commit() {
    let repo = TestRepo::init();
    let txn = Transaction::begin(&repo.fs, 0).unwrap();
    txn.make_file("/a").unwrap();
    txn.apply_text("/a", b"hello\n").unwrap();
    let rev = txn.commit(&CancelToken::never()).unwrap();

    assert_eq!(rev, 1);
    assert_eq!(repo.fs.youngest().unwrap(), 1);
    assert_eq!(repo.read_file(1, "/a"), b"hello\n");

    let revision = Revision::open(&repo.fs, 1).unwrap();
    let node = revision.node_rev_at("/a").unwrap().unwrap();
    assert_eq!(node.kind, NodeKind::File);
    assert_eq!(node.predecessor_count, 0);
    let rep = node.data_rep.unwrap();
    assert_eq!(rep.revision, Some(1));
    assert_eq!(rep.expanded_size, 6);
    // A first revision of a node has no delta base: fulltext on disk.
    assert_eq!(rep.size, 6);
    assert_eq!(
        hex::encode(rep.md5.unwrap()),
        "b1946ac92492d2347c6235b4d2611184"
    );
}

#[test]
fn staged_state_is_readable_before_commit() {
    let repo = TestRepo::init();
    let txn = Transaction::begin(&repo.fs, 0).unwrap();
    txn.make_dir("/d").unwrap();
    txn.make_file("/d/f").unwrap();
    txn.apply_text("/d/f", b"staged").unwrap();
    assert_eq!(txn.file_contents("/d/f").unwrap(), b"staged");
    assert_eq!(
        txn.node_at("/d").unwrap().unwrap().kind,
        NodeKind::Dir
    );
    // Nothing is visible outside the transaction.
    assert_eq!(repo.fs.youngest().unwrap(), 0);
    txn.commit(&CancelToken::never()).unwrap();
    assert_eq!(repo.read_file(1, "/d/f"), b"staged");
}

#[test]
fn out_of_date_transaction_is_rejected() {
    let repo = TestRepo::init();
    let t1 = Transaction::begin(&repo.fs, 0).unwrap();
    let t2 = Transaction::begin(&repo.fs, 0).unwrap();
    t1.make_file("/a").unwrap();
    t1.apply_text("/a", b"one").unwrap();
    assert_eq!(t1.commit(&CancelToken::never()).unwrap(), 1);

    t2.make_file("/b").unwrap();
    assert_matches!(
        t2.commit(&CancelToken::never()),
        Err(FsError::TxnOutOfDate {
            base: 0,
            youngest: 1
        })
    );
    assert_eq!(repo.fs.youngest().unwrap(), 1);
}

#[test]
fn changed_paths_round_trip_folded() {
    let repo = TestRepo::init();
    let txn = Transaction::begin(&repo.fs, 0).unwrap();
    txn.make_dir("/d").unwrap();
    txn.make_file("/d/a").unwrap();
    txn.apply_text("/d/a", b"x").unwrap();
    txn.make_file("/b").unwrap();
    let rev = txn.commit(&CancelToken::never()).unwrap();

    let committed = Revision::open(&repo.fs, rev)
        .unwrap()
        .changed_paths()
        .unwrap();
    assert_eq!(committed.len(), 3);
    assert_eq!(committed["/d"].kind, ChangeKind::Add);
    assert_eq!(committed["/d/a"].kind, ChangeKind::Add);
    assert!(committed["/d/a"].text_mod);
    assert_eq!(committed["/b"].kind, ChangeKind::Add);
    // Committed change records carry committed-form IDs.
    for change in committed.values() {
        assert!(!change.id.as_ref().unwrap().is_txn());
    }
}

#[test]
fn delete_and_modify_fold_into_the_revision() {
    let repo = TestRepo::init();
    repo.commit_file("/a", b"v1");
    repo.commit_file("/b", b"other");

    let txn = Transaction::begin(&repo.fs, 2).unwrap();
    txn.delete("/a").unwrap();
    txn.apply_text("/b", b"other-v2").unwrap();
    let rev = txn.commit(&CancelToken::never()).unwrap();

    let revision = Revision::open(&repo.fs, rev).unwrap();
    assert_eq!(revision.check_path("/a").unwrap(), None);
    assert_eq!(repo.read_file(rev, "/b"), b"other-v2");
    let committed = revision.changed_paths().unwrap();
    assert_eq!(committed["/a"].kind, ChangeKind::Delete);
    assert_eq!(committed["/b"].kind, ChangeKind::Modify);
}

#[test]
fn copy_shares_history_and_contents() {
    let repo = TestRepo::init();
    repo.commit_file("/a", b"payload");

    let txn = Transaction::begin(&repo.fs, 1).unwrap();
    txn.copy(1, "/a", "/b").unwrap();
    let rev = txn.commit(&CancelToken::never()).unwrap();

    let revision = Revision::open(&repo.fs, rev).unwrap();
    let original = revision.node_rev_at("/a").unwrap().unwrap();
    let copied = revision.node_rev_at("/b").unwrap().unwrap();
    assert_eq!(repo.read_file(rev, "/b"), b"payload");
    // Same node lineage, new copy lineage.
    assert_eq!(copied.id.node_id, original.id.node_id);
    assert_ne!(copied.id.copy_id, original.id.copy_id);
    assert_eq!(copied.copyfrom, Some((1, "/a".to_string())));
    assert_eq!(copied.predecessor, Some(original.id.clone()));
    assert_eq!(copied.predecessor_count, original.predecessor_count + 1);
}

#[test]
fn predecessor_chain_matches_recorded_count() {
    let repo = TestRepo::init();
    for i in 0..5u8 {
        repo.commit_file("/f", &vec![i; i as usize + 1]);
    }
    let revision = Revision::open(&repo.fs, 5).unwrap();
    let mut node = revision.node_rev_at("/f").unwrap().unwrap();
    let count = node.predecessor_count;
    let mut walked = 0;
    while let Some(pred) = node.predecessor.clone() {
        node = revfs_lib::revision::read_node_rev(&repo.fs, &pred).unwrap();
        walked += 1;
    }
    assert_eq!(walked, count);
}

#[test]
fn directory_listing_is_stable() {
    let repo = TestRepo::init();
    let txn = Transaction::begin(&repo.fs, 0).unwrap();
    for name in ["b", "a", "c"] {
        txn.make_file(&format!("/{name}")).unwrap();
    }
    let rev = txn.commit(&CancelToken::never()).unwrap();

    let revision = Revision::open(&repo.fs, rev).unwrap();
    let root = revision.root_node_rev().unwrap();
    let first = revision.dir_entries_of(&root).unwrap();
    let second = revision.dir_entries_of(&root).unwrap();
    assert_eq!(first, second);
    let names: Vec<&String> = first.keys().collect();
    assert_eq!(names, ["a", "b", "c"]);
}

#[test]
fn txn_props_become_revprops() {
    let repo = TestRepo::init();
    let txn = Transaction::begin(&repo.fs, 0).unwrap();
    txn.set_txn_prop("svn:log", Some(b"fix the frobnicator")).unwrap();
    txn.set_txn_prop("svn:author", Some(b"ada")).unwrap();
    txn.make_file("/a").unwrap();
    let rev = txn.commit(&CancelToken::never()).unwrap();

    assert_eq!(
        repo.fs.revision_prop(rev, "svn:log").unwrap().as_deref(),
        Some(b"fix the frobnicator".as_slice())
    );
    assert!(repo.fs.revision_prop(rev, "svn:date").unwrap().is_some());
}

#[test]
fn revprop_cas_detects_mismatch() {
    let repo = TestRepo::init();
    let rev = repo.commit_file("/a", b"x");
    repo.fs
        .set_revision_prop(rev, "note", None, Some(b"v1"))
        .unwrap();
    // Correct expectation succeeds.
    repo.fs
        .set_revision_prop(rev, "note", Some(Some(b"v1")), Some(b"v2"))
        .unwrap();
    // Stale expectation fails.
    assert_matches!(
        repo.fs
            .set_revision_prop(rev, "note", Some(Some(b"v1")), Some(b"v3")),
        Err(FsError::RevPropMismatch { .. })
    );
    assert_eq!(
        repo.fs.revision_prop(rev, "note").unwrap().as_deref(),
        Some(b"v2".as_slice())
    );
}

#[test]
fn node_props_survive_commit() {
    let repo = TestRepo::init();
    let txn = Transaction::begin(&repo.fs, 0).unwrap();
    txn.make_file("/a").unwrap();
    let mut props = std::collections::BTreeMap::new();
    props.insert("svn:eol-style".to_string(), b"native".to_vec());
    txn.set_proplist("/a", &props).unwrap();
    let rev = txn.commit(&CancelToken::never()).unwrap();

    let revision = Revision::open(&repo.fs, rev).unwrap();
    let node = revision.node_rev_at("/a").unwrap().unwrap();
    assert_eq!(revision.node_proplist(&node).unwrap(), props);
}

#[test]
fn abort_leaves_no_trace() {
    let repo = TestRepo::init();
    let txn = Transaction::begin(&repo.fs, 0).unwrap();
    let id = txn.id().as_str().to_string();
    txn.make_file("/a").unwrap();
    txn.abort().unwrap();

    assert_eq!(repo.fs.youngest().unwrap(), 0);
    assert!(list_transactions(&repo.fs).unwrap().is_empty());
    assert_matches!(
        Transaction::open(&repo.fs, &id),
        Err(FsError::NoSuchTransaction(_))
    );
}

#[test]
fn transactions_are_listed_until_resolved() {
    let repo = TestRepo::init();
    let txn = Transaction::begin(&repo.fs, 0).unwrap();
    let id = txn.id().as_str().to_string();
    assert_eq!(list_transactions(&repo.fs).unwrap(), vec![id.clone()]);

    let reopened = Transaction::open(&repo.fs, &id).unwrap();
    reopened.make_file("/x").unwrap();
    reopened.commit(&CancelToken::never()).unwrap();
    assert!(list_transactions(&repo.fs).unwrap().is_empty());
}
