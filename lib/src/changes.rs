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

//! Changed-path records.
//!
//! A transaction appends one record per mutation to its changes log; the
//! commit pipeline folds the log into one record per path before writing
//! it into the revision file. Committed streams are therefore pre-folded,
//! and re-folding them is the identity.
//!
//! The fold enforces one set of ordering rules in both the commit-time and
//! read-time paths: a non-reset record must carry a node-rev ID; the ID may
//! only change across a delete; an add may only follow a delete (or a reset,
//! which erases the path's history); and after a delete only another
//! delete, an add, a replace, or a reset is legal.

use indexmap::IndexMap;
use thiserror::Error;

use crate::id::NodeRevId;
use crate::id::RevNum;
use crate::node_rev::NodeKind;

/// Violation of the change-ordering rules; treated as corruption.
#[derive(Debug, Error)]
#[error("Invalid change ordering for path {path:?}: {reason}")]
pub struct ChangeOrderError {
    /// The path whose records misbehaved.
    pub path: String,
    /// Which rule was violated.
    pub reason: &'static str,
}

/// What happened to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// The path was added.
    Add,
    /// The path was deleted.
    Delete,
    /// The path was deleted and re-added in one revision.
    Replace,
    /// The path's text and/or properties changed.
    Modify,
    /// Erase any accumulated change record for the path (transaction-only;
    /// folded streams never contain resets).
    Reset,
}

impl ChangeKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Delete => "delete",
            Self::Replace => "replace",
            Self::Modify => "modify",
            Self::Reset => "reset",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "add" => Some(Self::Add),
            "delete" => Some(Self::Delete),
            "replace" => Some(Self::Replace),
            "modify" => Some(Self::Modify),
            "reset" => Some(Self::Reset),
            _ => None,
        }
    }
}

/// One changed-path record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// The changed path.
    pub path: String,
    /// Node revision affected; `None` only for [`ChangeKind::Reset`].
    pub id: Option<NodeRevId>,
    /// What happened.
    pub kind: ChangeKind,
    /// Kind of the node at the path, when known.
    pub node_kind: Option<NodeKind>,
    /// Whether text content changed.
    pub text_mod: bool,
    /// Whether properties changed.
    pub prop_mod: bool,
    /// Copy source for copied adds/replaces.
    pub copyfrom: Option<(RevNum, String)>,
}

fn order_error(path: &str, reason: &'static str) -> ChangeOrderError {
    ChangeOrderError {
        path: path.to_string(),
        reason,
    }
}

/// Folds a change stream into one record per path, preserving first-seen
/// path order.
///
/// `prefolded` declares that the input already went through the fold (the
/// committed stream always has); sub-path pruning under deleted or replaced
/// directories is skipped in that case, and folding is the identity.
pub fn fold(
    changes: impl IntoIterator<Item = Change>,
    prefolded: bool,
) -> Result<IndexMap<String, Change>, ChangeOrderError> {
    let mut folded: IndexMap<String, Change> = IndexMap::new();
    for change in changes {
        if change.kind != ChangeKind::Reset && change.id.is_none() {
            return Err(order_error(&change.path, "missing node-rev ID"));
        }
        let prior = folded.get(&change.path);
        let merged = match prior {
            None => match change.kind {
                ChangeKind::Reset => None,
                _ => Some(change.clone()),
            },
            Some(prior) => merge_pair(prior, &change)?,
        };
        match merged {
            Some(record) => {
                let prune = !prefolded
                    && matches!(record.kind, ChangeKind::Delete | ChangeKind::Replace)
                    && record.node_kind != Some(NodeKind::File);
                folded.insert(change.path.clone(), record);
                if prune {
                    let prefix = format!("{}/", change.path);
                    folded.retain(|path, _| !path.starts_with(&prefix));
                }
            }
            None => {
                folded.shift_remove(&change.path);
            }
        }
    }
    Ok(folded)
}

/// Combines a path's accumulated record with the next one. `None` means
/// the path drops out of the folded map entirely.
fn merge_pair(prior: &Change, new: &Change) -> Result<Option<Change>, ChangeOrderError> {
    let path = &new.path;
    if new.kind == ChangeKind::Reset {
        return Ok(None);
    }
    if prior.kind == ChangeKind::Delete
        && !matches!(
            new.kind,
            ChangeKind::Add | ChangeKind::Replace | ChangeKind::Delete
        )
    {
        return Err(order_error(path, "only add, replace, or delete may follow a delete"));
    }
    if prior.kind != ChangeKind::Delete && prior.id != new.id {
        return Err(order_error(path, "node-rev ID changed without a delete"));
    }
    if new.kind == ChangeKind::Add && prior.kind != ChangeKind::Delete {
        return Err(order_error(path, "add follows a surviving change"));
    }
    let merged = match (prior.kind, new.kind) {
        (ChangeKind::Delete, ChangeKind::Delete) => prior.clone(),
        (ChangeKind::Delete, ChangeKind::Add | ChangeKind::Replace) => Change {
            kind: ChangeKind::Replace,
            ..new.clone()
        },
        (ChangeKind::Add, ChangeKind::Delete) => {
            // Added and deleted within the same transaction: the path never
            // existed as far as this revision is concerned.
            return Ok(None);
        }
        (_, ChangeKind::Delete) => Change {
            text_mod: false,
            prop_mod: false,
            copyfrom: None,
            ..new.clone()
        },
        (_, ChangeKind::Modify) => Change {
            kind: prior.kind,
            text_mod: prior.text_mod || new.text_mod,
            prop_mod: prior.prop_mod || new.prop_mod,
            copyfrom: prior.copyfrom.clone(),
            ..new.clone()
        },
        (_, ChangeKind::Replace) => new.clone(),
        (_, ChangeKind::Add | ChangeKind::Reset) => unreachable!("rejected above"),
    };
    Ok(Some(merged))
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Serializes one record: two lines (the second carries the copy source
/// and may be empty). The transaction's change log is an append sequence
/// of these.
pub fn write_record(change: &Change) -> Vec<u8> {
    let mut out = String::new();
    let id = change
        .id
        .as_ref()
        .map_or_else(|| "-".to_string(), |id| id.unparse());
    let node_kind = change.node_kind.map_or("-", |kind| match kind {
        NodeKind::File => "file",
        NodeKind::Dir => "dir",
        NodeKind::Symlink => "symlink",
    });
    out.push_str(&format!(
        "{id} {} {node_kind} {} {} {}\n",
        change.kind.as_str(),
        bool_str(change.text_mod),
        bool_str(change.prop_mod),
        change.path,
    ));
    match &change.copyfrom {
        Some((rev, path)) => out.push_str(&format!("{rev} {path}\n")),
        None => out.push('\n'),
    }
    out.into_bytes()
}

/// Serializes a change list, closed by one blank line.
pub fn write(changes: impl IntoIterator<Item = Change>) -> Vec<u8> {
    let mut out = vec![];
    for change in changes {
        out.extend_from_slice(&write_record(&change));
    }
    out.push(b'\n');
    out
}

/// Malformed change list; treated as corruption by callers.
#[derive(Debug, Error)]
#[error("Malformed change list: {reason}")]
pub struct ChangeParseError {
    /// What was wrong.
    pub reason: String,
}

fn parse_error(reason: impl Into<String>) -> ChangeParseError {
    ChangeParseError {
        reason: reason.into(),
    }
}

/// Parses a serialized change list, stopping at the terminating blank line
/// (or end of input).
pub fn parse(data: &[u8]) -> Result<Vec<Change>, ChangeParseError> {
    let text = std::str::from_utf8(data).map_err(|_| parse_error("non-UTF-8 change list"))?;
    let mut lines = text.split('\n');
    let mut changes = vec![];
    while let Some(line) = lines.next() {
        if line.is_empty() {
            break;
        }
        let mut tokens = line.splitn(6, ' ');
        let (Some(id), Some(kind), Some(node_kind), Some(text_mod), Some(prop_mod), Some(path)) = (
            tokens.next(),
            tokens.next(),
            tokens.next(),
            tokens.next(),
            tokens.next(),
            tokens.next(),
        ) else {
            return Err(parse_error(format!("short change line: {line:?}")));
        };
        let id = match id {
            "-" => None,
            _ => Some(
                NodeRevId::parse(id).map_err(|err| parse_error(err.to_string()))?,
            ),
        };
        let kind = ChangeKind::parse(kind)
            .ok_or_else(|| parse_error(format!("unknown change kind {kind:?}")))?;
        if kind != ChangeKind::Reset && id.is_none() {
            return Err(parse_error(format!("missing node-rev ID for {path:?}")));
        }
        let node_kind = match node_kind {
            "-" => None,
            "file" => Some(NodeKind::File),
            "dir" => Some(NodeKind::Dir),
            "symlink" => Some(NodeKind::Symlink),
            _ => return Err(parse_error(format!("unknown node kind {node_kind:?}"))),
        };
        let parse_bool = |s: &str| match s {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(parse_error(format!("bad boolean {s:?}"))),
        };
        let copyfrom_line = lines
            .next()
            .ok_or_else(|| parse_error("change record missing copyfrom line"))?;
        let copyfrom = if copyfrom_line.is_empty() {
            None
        } else {
            let (rev, from_path) = copyfrom_line
                .split_once(' ')
                .ok_or_else(|| parse_error("bad copyfrom line"))?;
            Some((
                rev.parse()
                    .map_err(|_| parse_error("bad copyfrom revision"))?,
                from_path.to_string(),
            ))
        };
        changes.push(Change {
            path: path.to_string(),
            id,
            kind,
            node_kind,
            text_mod: parse_bool(text_mod)?,
            prop_mod: parse_bool(prop_mod)?,
            copyfrom,
        });
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::id::CopyId;
    use crate::id::NodeId;

    use super::*;

    fn id(node: &str, rev: RevNum) -> NodeRevId {
        NodeRevId::committed(NodeId::new(node), CopyId::new("0"), rev, 0)
    }

    fn change(path: &str, node: &str, kind: ChangeKind) -> Change {
        Change {
            path: path.to_string(),
            id: Some(id(node, 1)),
            kind,
            node_kind: Some(NodeKind::File),
            text_mod: false,
            prop_mod: false,
            copyfrom: None,
        }
    }

    #[test]
    fn serialization_round_trips() {
        let mut copied = change("/b", "5", ChangeKind::Add);
        copied.copyfrom = Some((3, "/a".to_string()));
        let changes = vec![change("/a", "4", ChangeKind::Modify), copied];
        let parsed = parse(&write(changes.clone())).unwrap();
        assert_eq!(parsed, changes);
    }

    #[test]
    fn paths_may_contain_spaces() {
        let changes = vec![change("/dir with space/f x", "4", ChangeKind::Add)];
        assert_eq!(parse(&write(changes.clone())).unwrap(), changes);
    }

    #[test]
    fn modify_after_modify_unions_flags() {
        let mut first = change("/a", "4", ChangeKind::Modify);
        first.text_mod = true;
        let mut second = change("/a", "4", ChangeKind::Modify);
        second.prop_mod = true;
        let folded = fold([first, second], false).unwrap();
        let record = &folded["/a"];
        assert!(record.text_mod && record.prop_mod);
        assert_eq!(record.kind, ChangeKind::Modify);
    }

    #[test]
    fn delete_then_add_becomes_replace() {
        let folded = fold(
            [
                change("/a", "4", ChangeKind::Delete),
                change("/a", "9", ChangeKind::Add),
            ],
            false,
        )
        .unwrap();
        assert_eq!(folded["/a"].kind, ChangeKind::Replace);
        assert_eq!(folded["/a"].id, Some(id("9", 1)));
    }

    #[test]
    fn add_then_delete_vanishes() {
        let folded = fold(
            [
                change("/new", "4", ChangeKind::Add),
                change("/new", "4", ChangeKind::Delete),
            ],
            false,
        )
        .unwrap();
        assert!(folded.is_empty());
    }

    #[test]
    fn two_deletes_keep_one() {
        let folded = fold(
            [
                change("/a", "4", ChangeKind::Delete),
                change("/a", "4", ChangeKind::Delete),
            ],
            false,
        )
        .unwrap();
        assert_eq!(folded.len(), 1);
        assert_eq!(folded["/a"].kind, ChangeKind::Delete);
    }

    #[test]
    fn reset_erases_the_record() {
        let reset = Change {
            id: None,
            ..change("/a", "4", ChangeKind::Reset)
        };
        let folded = fold([change("/a", "4", ChangeKind::Modify), reset], false).unwrap();
        assert!(folded.is_empty());
    }

    #[test]
    fn deleted_directory_prunes_descendants() {
        let mut dir_delete = change("/d", "7", ChangeKind::Delete);
        dir_delete.node_kind = Some(NodeKind::Dir);
        let folded = fold(
            [
                change("/d/inner", "8", ChangeKind::Modify),
                change("/dx", "9", ChangeKind::Modify),
                dir_delete.clone(),
            ],
            false,
        )
        .unwrap();
        assert!(!folded.contains_key("/d/inner"));
        assert!(folded.contains_key("/dx"));

        // The committed stream is already folded; no pruning there.
        let folded = fold(
            [change("/d/inner", "8", ChangeKind::Modify), dir_delete],
            true,
        )
        .unwrap();
        assert!(folded.contains_key("/d/inner"));
    }

    #[test]
    fn ordering_violations_are_corruption() {
        // Missing ID on a non-reset change.
        let mut no_id = change("/a", "4", ChangeKind::Modify);
        no_id.id = None;
        assert_matches!(fold([no_id], false), Err(_));
        // ID change without an intervening delete.
        assert_matches!(
            fold(
                [
                    change("/a", "4", ChangeKind::Modify),
                    change("/a", "5", ChangeKind::Modify),
                ],
                false,
            ),
            Err(err) if err.reason.contains("ID changed")
        );
        // Add on top of a live change.
        assert_matches!(
            fold(
                [
                    change("/a", "4", ChangeKind::Modify),
                    change("/a", "4", ChangeKind::Add),
                ],
                false,
            ),
            Err(_)
        );
        // Modify directly after a delete.
        assert_matches!(
            fold(
                [
                    change("/a", "4", ChangeKind::Delete),
                    change("/a", "4", ChangeKind::Modify),
                ],
                false,
            ),
            Err(_)
        );
    }

    #[test]
    fn folding_is_idempotent() {
        let changes = vec![
            change("/a", "4", ChangeKind::Modify),
            change("/b", "5", ChangeKind::Add),
            change("/a", "4", ChangeKind::Delete),
        ];
        let once: Vec<Change> = fold(changes, false).unwrap().into_values().collect();
        let twice: Vec<Change> = fold(once.clone(), true).unwrap().into_values().collect();
        assert_eq!(once, twice);
    }
}
