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

//! History navigation.
//!
//! Three revision hunts over a committed history: finding the revision in
//! effect at a point in time, bisecting for the revision that deleted a
//! path, and enumerating the revisions that touched a file across copies.

use chrono::DateTime;
use chrono::Utc;

use crate::id::NodeRevId;
use crate::id::RevNum;
use crate::node_rev::NodeKind;
use crate::node_rev::NodeRevision;
use crate::node_rev::Representation;
use crate::proplist::PropList;
use crate::representation;
use crate::revision;
use crate::revision::Revision;
use crate::store::CancelToken;
use crate::store::FileSystem;
use crate::store::FsError;
use crate::store::FsResult;
use crate::store::PROP_REVISION_DATE;
use crate::svndiff;

/// A predicate deciding whether a repository path may be read; history
/// enumeration stops at the newest unreadable ancestor.
pub type PathPredicate<'a> = dyn Fn(&str) -> bool + 'a;

fn revision_date(fs: &FileSystem, rev: RevNum) -> FsResult<DateTime<Utc>> {
    let value = fs
        .revision_prop(rev, PROP_REVISION_DATE)?
        .ok_or_else(|| FsError::corrupt(fs.revprops_file_path(rev), "missing svn:date"))?;
    let text = String::from_utf8(value)
        .map_err(|_| FsError::corrupt(fs.revprops_file_path(rev), "non-UTF-8 svn:date"))?;
    DateTime::parse_from_rfc3339(&text)
        .map(|date| date.with_timezone(&Utc))
        .map_err(|_| FsError::corrupt(fs.revprops_file_path(rev), "unparsable svn:date"))
}

/// The largest revision whose `svn:date` is at or before `time`.
///
/// Assumes datestamps are monotone (the commit pipeline injects them under
/// the write lock). A time before revision 1 yields 0; a time after the
/// youngest yields the youngest.
pub fn dated_revision(fs: &FileSystem, time: DateTime<Utc>) -> FsResult<RevNum> {
    let youngest = fs.youngest()?;
    let mut lo = 0;
    let mut hi = youngest;
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if revision_date(fs, mid)? <= time {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(lo)
}

/// The nearest copy event at or above `path` as of `rev`: the copy
/// destination's (revision, path) and its copy source.
pub fn closest_copy(
    fs: &FileSystem,
    rev: RevNum,
    path: &str,
) -> FsResult<Option<(RevNum, String, (RevNum, String))>> {
    let revision = Revision::open(fs, rev)?;
    let Some(node) = revision.node_rev_at(path)? else {
        return Ok(None);
    };
    let (copy_rev, copy_path) = node.copy_root();
    let copy_dst = Revision::open(fs, copy_rev)?.node_rev_at(&copy_path)?;
    match copy_dst.and_then(|node| node.copyfrom) {
        // A copy root without copyfrom is a plainly created node: no copy
        // event governs this path.
        None => Ok(None),
        Some(copyfrom) => Ok(Some((copy_rev, copy_path, copyfrom))),
    }
}

/// Finds the revision in `[start, end]` (reordered ascending on entry)
/// that first deleted — or replaced with an unrelated node — the path.
///
/// Returns `None` when the path still exists at `end` with its identity
/// intact. Bisection probes node-ID identity: an absent path, an
/// unrelated node, or a copy event newer than `start` all push the search
/// downward; an intact identity pushes it upward.
pub fn deleted_rev(
    fs: &FileSystem,
    path: &str,
    start: RevNum,
    end: RevNum,
    cancel: &CancelToken,
) -> FsResult<Option<RevNum>> {
    let (start, end) = if start <= end { (start, end) } else { (end, start) };
    let end = end.min(fs.youngest()?);

    let start_node = Revision::open(fs, start)?
        .node_rev_at(path)?
        .ok_or_else(|| FsError::PathNotFound(path.to_string()))?;
    if survives_at(fs, path, &start_node.id, start, end)? {
        return Ok(None);
    }
    let mut lo = start;
    let mut hi = end;
    while hi - lo > 1 {
        cancel.check()?;
        let mid = lo + (hi - lo) / 2;
        if survives_at(fs, path, &start_node.id, start, mid)? {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    Ok(Some(hi))
}

/// Whether the node at `path` in revision `rev` is still the lineage
/// observed at `start` (present, related, and not reintroduced by a copy
/// since `start`).
fn survives_at(
    fs: &FileSystem,
    path: &str,
    start_id: &NodeRevId,
    start: RevNum,
    rev: RevNum,
) -> FsResult<bool> {
    let Some(node) = Revision::open(fs, rev)?.node_rev_at(path)? else {
        return Ok(false);
    };
    if !node.id.is_related_to(start_id) {
        return Ok(false);
    }
    if let Some((copy_rev, _, _)) = closest_copy(fs, rev, path)? {
        if copy_rev > start {
            // The path exists through a copy made after `start`; the
            // original instance was deleted or replaced in between.
            return Ok(false);
        }
    }
    Ok(true)
}

/// Walks a node lineage back to its origin node revision.
pub(crate) fn walk_to_origin(fs: &FileSystem, id: &NodeRevId) -> FsResult<NodeRevId> {
    let mut current = revision::read_node_rev(fs, id)?;
    let mut remaining = current.predecessor_count;
    while let Some(pred) = current.predecessor.clone() {
        if remaining == 0 {
            return Err(FsError::corrupt(
                fs.path(),
                "predecessor chain longer than its recorded count",
            ));
        }
        remaining -= 1;
        current = revision::read_node_rev(fs, &pred)?;
    }
    Ok(current.id)
}

/// One step of a file's history, oldest to newest.
#[derive(Debug)]
pub struct FileRevEntry {
    /// The path the file lived at in this revision.
    pub path: String,
    /// The revision that created this node revision.
    pub revision: RevNum,
    /// Whether the step was reached by traversing a merge. Mergeinfo is
    /// opaque at this layer, so merge sources are not traversed and this
    /// is always `false`.
    pub merged: bool,
    /// The revision's properties.
    pub rev_props: PropList,
    /// The node's properties at this step.
    pub node_props: PropList,
    /// Property changes against the previous step (`None` = deleted).
    pub prop_diffs: Vec<(String, Option<Vec<u8>>)>,
    /// Whether the contents changed in this step.
    pub content_changed: bool,
    prev_rep: Option<Representation>,
    cur_rep: Option<Representation>,
}

impl FileRevEntry {
    /// The svndiff stream from the previous step's fulltext to this one,
    /// produced on demand. The first step deltas from empty.
    pub fn text_delta(&self, fs: &FileSystem) -> FsResult<Vec<u8>> {
        let prev = match &self.prev_rep {
            Some(rep) => representation::read_fulltext(fs, rep)?,
            None => vec![],
        };
        let cur = match &self.cur_rep {
            Some(rep) => representation::read_fulltext(fs, rep)?,
            None => vec![],
        };
        Ok(svndiff::encode(&prev, &cur))
    }
}

/// Enumerates the revisions in `[start, end]` that changed the file at
/// `path` (as of `end`), following its ancestry across copies, and feeds
/// them oldest-to-newest to `handler`.
pub fn get_file_revs(
    fs: &FileSystem,
    path: &str,
    start: RevNum,
    end: RevNum,
    _include_merged: bool,
    readable: Option<&PathPredicate<'_>>,
    cancel: &CancelToken,
    mut handler: impl FnMut(&FileRevEntry) -> FsResult<()>,
) -> FsResult<()> {
    let head = Revision::open(fs, end)?;
    let node = head
        .node_rev_at(path)?
        .ok_or_else(|| FsError::PathNotFound(path.to_string()))?;
    if node.kind != NodeKind::File {
        return Err(FsError::NotAFile(path.to_string()));
    }

    // Collect (node revision, revision) pairs in descending order.
    let mut steps: Vec<NodeRevision> = vec![];
    let mut current = Some(node);
    while let Some(node) = current {
        cancel.check()?;
        let rev = node
            .id
            .revision()
            .ok_or_else(|| FsError::corrupt(fs.path(), "history walk reached a transaction"))?;
        if rev < start {
            break;
        }
        if let Some(readable) = readable {
            if !readable(&node.created_path) {
                break;
            }
        }
        let pred = node.predecessor.clone();
        steps.push(node);
        current = pred
            .map(|id| revision::read_node_rev(fs, &id))
            .transpose()?;
    }

    // Emit oldest to newest, diffing each step against its predecessor.
    let mut prev_props = PropList::new();
    let mut prev_rep: Option<Representation> = None;
    for node in steps.into_iter().rev() {
        cancel.check()?;
        let rev = node.id.revision().expect("collected steps are committed");
        let node_props = revision::node_proplist(fs, &node)?;
        let mut prop_diffs: Vec<(String, Option<Vec<u8>>)> = vec![];
        for (name, value) in &node_props {
            if prev_props.get(name) != Some(value) {
                prop_diffs.push((name.clone(), Some(value.clone())));
            }
        }
        for name in prev_props.keys() {
            if !node_props.contains_key(name) {
                prop_diffs.push((name.clone(), None));
            }
        }
        let content_changed = !same_contents(&prev_rep, &node.data_rep);
        let entry = FileRevEntry {
            path: node.created_path.clone(),
            revision: rev,
            merged: false,
            rev_props: fs.revision_proplist(rev)?,
            node_props: node_props.clone(),
            prop_diffs,
            content_changed,
            prev_rep: prev_rep.clone(),
            cur_rep: node.data_rep.clone(),
        };
        handler(&entry)?;
        prev_props = node_props;
        prev_rep = node.data_rep;
    }
    Ok(())
}

/// Two representation descriptors carry the same bytes when they resolve
/// to the same location or the same checksums.
fn same_contents(a: &Option<Representation>, b: &Option<Representation>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            (a.revision == b.revision && a.offset == b.offset && a.revision.is_some())
                || (a.md5.is_some() && a.md5 == b.md5)
        }
        _ => false,
    }
}
