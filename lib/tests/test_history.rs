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

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::TimeZone as _;
use chrono::Utc;
use revfs_lib::history::closest_copy;
use revfs_lib::history::dated_revision;
use revfs_lib::history::deleted_rev;
use revfs_lib::history::get_file_revs;
use revfs_lib::store::CancelToken;
use revfs_lib::svndiff;
use revfs_lib::transaction::Transaction;

use crate::testutils::TestRepo;

fn set_date(repo: &TestRepo, rev: u64, iso: &str) {
    repo.fs
        .set_revision_prop(rev, "svn:date", None, Some(iso.as_bytes()))
        .unwrap();
}

#[test]
fn dated_revision_bisects_the_datestamps() {
    let repo = TestRepo::init();
    for i in 1..=4u8 {
        repo.commit_file("/f", &[i]);
    }
    set_date(&repo, 0, "2020-01-01T00:00:00.000000Z");
    set_date(&repo, 1, "2020-02-01T00:00:00.000000Z");
    set_date(&repo, 2, "2020-03-01T00:00:00.000000Z");
    set_date(&repo, 3, "2020-04-01T00:00:00.000000Z");
    set_date(&repo, 4, "2020-05-01T00:00:00.000000Z");

    let at = |y, m, d| Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap();
    // Between r2 and r3.
    assert_eq!(dated_revision(&repo.fs, at(2020, 3, 15)).unwrap(), 2);
    // Exactly at r3's date (same day, later time).
    assert_eq!(dated_revision(&repo.fs, at(2020, 4, 1)).unwrap(), 3);
    // Before revision 1.
    assert_eq!(dated_revision(&repo.fs, at(2019, 6, 1)).unwrap(), 0);
    // After the youngest.
    assert_eq!(dated_revision(&repo.fs, at(2021, 1, 1)).unwrap(), 4);
}

#[test]
fn deleted_rev_finds_the_deletion_within_probe_budget() {
    let repo = TestRepo::init();
    repo.commit_file("/x", b"keep me"); // r1
    for i in 2..20u64 {
        repo.commit_file(&format!("/filler{i}"), b"."); // r2..r19
    }
    let txn = Transaction::begin(&repo.fs, 19).unwrap();
    txn.delete("/x").unwrap();
    assert_eq!(txn.commit(&CancelToken::never()).unwrap(), 20);

    let probes = Arc::new(AtomicUsize::new(0));
    let counter = probes.clone();
    let cancel = CancelToken::new(move || {
        counter.fetch_add(1, Ordering::Relaxed);
        false
    });
    let found = deleted_rev(&repo.fs, "/x", 1, 50, &cancel).unwrap();
    assert_eq!(found, Some(20));
    assert!(
        probes.load(Ordering::Relaxed) <= 6,
        "bisection took {} probes",
        probes.load(Ordering::Relaxed)
    );
}

#[test]
fn deleted_rev_reports_survivors_as_none() {
    let repo = TestRepo::init();
    repo.commit_file("/x", b"v1");
    repo.commit_file("/x", b"v2");
    let youngest = repo.fs.youngest().unwrap();
    assert_eq!(
        deleted_rev(&repo.fs, "/x", 1, youngest, &CancelToken::never()).unwrap(),
        None
    );
}

#[test]
fn deleted_rev_sees_through_a_replacing_copy() {
    let repo = TestRepo::init();
    repo.commit_file("/x", b"original"); // r1
    let txn = Transaction::begin(&repo.fs, 1).unwrap();
    txn.delete("/x").unwrap();
    assert_eq!(txn.commit(&CancelToken::never()).unwrap(), 2);
    let txn = Transaction::begin(&repo.fs, 2).unwrap();
    txn.copy(1, "/x", "/x").unwrap();
    assert_eq!(txn.commit(&CancelToken::never()).unwrap(), 3);

    // The path exists again at r3, but through a copy: the original
    // instance died at r2.
    assert_eq!(
        deleted_rev(&repo.fs, "/x", 1, 3, &CancelToken::never()).unwrap(),
        Some(2)
    );
}

#[test]
fn closest_copy_reports_the_copy_event() {
    let repo = TestRepo::init();
    repo.commit_file("/a", b"contents"); // r1
    let txn = Transaction::begin(&repo.fs, 1).unwrap();
    txn.copy(1, "/a", "/b").unwrap();
    let rev = txn.commit(&CancelToken::never()).unwrap();

    let copy = closest_copy(&repo.fs, rev, "/b").unwrap().unwrap();
    assert_eq!(copy.0, rev);
    assert_eq!(copy.1, "/b");
    assert_eq!(copy.2, (1, "/a".to_string()));

    // A plainly created path reports no copy event.
    assert_eq!(closest_copy(&repo.fs, rev, "/a").unwrap(), None);
}

#[test]
fn file_revs_stream_oldest_to_newest_with_deltas() {
    let repo = TestRepo::init();
    repo.commit_file("/f", b"one"); // r1
    repo.commit_file("/other", b"noise"); // r2
    repo.commit_file("/f", b"one two"); // r3
    let txn = Transaction::begin(&repo.fs, 3).unwrap();
    let mut props = std::collections::BTreeMap::new();
    props.insert("color".to_string(), b"red".to_vec());
    txn.set_proplist("/f", &props).unwrap();
    assert_eq!(txn.commit(&CancelToken::never()).unwrap(), 4);

    let mut seen: Vec<(u64, bool)> = vec![];
    let mut reconstructed: Vec<u8> = vec![];
    get_file_revs(
        &repo.fs,
        "/f",
        0,
        4,
        false,
        None,
        &CancelToken::never(),
        |entry| {
            assert_eq!(entry.path, "/f");
            assert!(!entry.merged);
            let delta = entry.text_delta(&repo.fs).unwrap();
            reconstructed = svndiff::apply(&reconstructed, &delta).unwrap();
            seen.push((entry.revision, entry.content_changed));
            Ok(())
        },
    )
    .unwrap();

    // The file changed in r1, r3 (text) and r4 (props only).
    assert_eq!(seen, [(1, true), (3, true), (4, false)]);
    assert_eq!(reconstructed, b"one two");

    // The props-only step reported its property diff.
    let mut diffs = vec![];
    get_file_revs(
        &repo.fs,
        "/f",
        4,
        4,
        false,
        None,
        &CancelToken::never(),
        |entry| {
            diffs = entry.prop_diffs.clone();
            Ok(())
        },
    )
    .unwrap();
    assert_eq!(diffs, [("color".to_string(), Some(b"red".to_vec()))]);
}
