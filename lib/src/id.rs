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

//! Identifiers.
//!
//! Every node revision is identified by a `(node-id, copy-id, location)`
//! triple. Node-IDs and copy-IDs are base-36 keys; IDs minted inside a
//! transaction carry a `_` prefix until the commit rewrite assigns their
//! permanent form. The location is either `r<rev>/<offset>` (committed,
//! with the byte offset of the node-rev record inside the revision file)
//! or `t<txn-id>` (in-flight).

use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;

use thiserror::Error;

use crate::base36;

/// A revision number.
pub type RevNum = u64;

/// Error for malformed identifier syntax. Callers generally map this to a
/// corruption error carrying the source location.
#[derive(Debug, Error)]
#[error("Malformed identifier {input:?}")]
pub struct ParseIdError {
    /// The offending input.
    pub input: String,
}

fn bad_id(input: &str) -> ParseIdError {
    ParseIdError {
        input: input.to_string(),
    }
}

macro_rules! key_id_type {
    (   $(#[$attr:meta])*
        $vis:vis $name:ident
    ) => {
        $(#[$attr])*
        #[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
        $vis struct $name(String);

        impl $name {
            /// Wraps an already-validated key.
            pub fn new(key: impl Into<String>) -> Self {
                Self(key.into())
            }

            /// Parses a base-36 key, optionally prefixed with `_` for
            /// transaction-scoped identifiers.
            pub fn parse(s: &str) -> Result<Self, ParseIdError> {
                let key = s.strip_prefix('_').unwrap_or(s);
                if base36::is_key(key) {
                    Ok(Self(s.to_string()))
                } else {
                    Err(bad_id(s))
                }
            }

            /// Whether this identifier was minted inside a transaction and
            /// still awaits its permanent form.
            pub fn is_transient(&self) -> bool {
                self.0.starts_with('_')
            }

            /// The raw key string.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name)).field(&self.0).finish()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(&self.0)
            }
        }
    };
}

key_id_type!(
    /// Identifies a node (a file or directory) across all of its revisions.
    pub NodeId
);
key_id_type!(
    /// Identifies the copy that brought a node into the tree.
    pub CopyId
);

impl NodeId {
    /// The transient form for the `n`th node minted in a transaction.
    pub fn transient(counter: u64) -> Self {
        Self(format!("_{}", base36::encode(counter)))
    }

    /// The permanent form assigned at commit in no-global-IDs repositories:
    /// `<local-key>-<rev>`.
    pub fn permanent(&self, rev: RevNum) -> Self {
        debug_assert!(self.is_transient());
        Self(format!("{}-{rev}", &self.0[1..]))
    }
}

impl CopyId {
    /// The copy-id of nodes that were never copied.
    pub fn root() -> Self {
        Self("0".to_string())
    }

    /// The transient form for the `n`th copy minted in a transaction.
    pub fn transient(counter: u64) -> Self {
        Self(format!("_{}", base36::encode(counter)))
    }

    /// The permanent form assigned at commit: `<local-key>-<rev>`.
    pub fn permanent(&self, rev: RevNum) -> Self {
        debug_assert!(self.is_transient());
        Self(format!("{}-{rev}", &self.0[1..]))
    }
}

/// Identifies one in-progress transaction: `<base-rev>-<base36 counter>`.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Hash)]
pub struct TxnId(String);

impl TxnId {
    /// Forms the ID of a transaction based on revision `base_rev` with the
    /// given repository transaction counter value.
    pub fn form(base_rev: RevNum, counter: &str) -> Self {
        Self(format!("{base_rev}-{counter}"))
    }

    /// Parses a transaction ID.
    pub fn parse(s: &str) -> Result<Self, ParseIdError> {
        let (rev, counter) = s.split_once('-').ok_or_else(|| bad_id(s))?;
        if rev.bytes().all(|b| b.is_ascii_digit())
            && !rev.is_empty()
            && base36::is_key(counter)
        {
            Ok(Self(s.to_string()))
        } else {
            Err(bad_id(s))
        }
    }

    /// The base revision this transaction was opened against.
    pub fn base_rev(&self) -> RevNum {
        self.0
            .split_once('-')
            .and_then(|(rev, _)| rev.parse().ok())
            .expect("TxnId is validated on construction")
    }

    /// The raw ID string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Debug for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TxnId").field(&self.0).finish()
    }
}

impl Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Where a node revision record lives.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub enum IdLocation {
    /// Committed: inside revision `rev`'s file, at `offset`.
    Revision {
        /// The revision.
        rev: RevNum,
        /// Byte offset of the node-rev record, for random access.
        offset: u64,
    },
    /// Still mutable inside a transaction.
    Transaction(TxnId),
}

/// A full node-revision identifier.
#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct NodeRevId {
    /// The node this revision belongs to.
    pub node_id: NodeId,
    /// The copy lineage of the node.
    pub copy_id: CopyId,
    /// Committed or transaction location.
    pub location: IdLocation,
}

impl NodeRevId {
    /// Forms a committed-form ID.
    pub fn committed(node_id: NodeId, copy_id: CopyId, rev: RevNum, offset: u64) -> Self {
        Self {
            node_id,
            copy_id,
            location: IdLocation::Revision { rev, offset },
        }
    }

    /// Forms a transaction-form ID.
    pub fn in_txn(node_id: NodeId, copy_id: CopyId, txn_id: TxnId) -> Self {
        Self {
            node_id,
            copy_id,
            location: IdLocation::Transaction(txn_id),
        }
    }

    /// Whether the ID refers into a transaction.
    pub fn is_txn(&self) -> bool {
        matches!(self.location, IdLocation::Transaction(_))
    }

    /// The revision this ID was committed in, if committed.
    pub fn revision(&self) -> Option<RevNum> {
        match &self.location {
            IdLocation::Revision { rev, .. } => Some(*rev),
            IdLocation::Transaction(_) => None,
        }
    }

    /// The node-rev record offset, if committed.
    pub fn offset(&self) -> Option<u64> {
        match &self.location {
            IdLocation::Revision { offset, .. } => Some(*offset),
            IdLocation::Transaction(_) => None,
        }
    }

    /// Renders `node.copy.r<rev>/<offset>` or `node.copy.t<txn>`.
    pub fn unparse(&self) -> String {
        match &self.location {
            IdLocation::Revision { rev, offset } => {
                format!("{}.{}.r{rev}/{offset}", self.node_id, self.copy_id)
            }
            IdLocation::Transaction(txn_id) => {
                format!("{}.{}.t{txn_id}", self.node_id, self.copy_id)
            }
        }
    }

    /// Parses the unparse form back into an ID.
    pub fn parse(s: &str) -> Result<Self, ParseIdError> {
        let mut parts = s.splitn(3, '.');
        let (Some(node), Some(copy), Some(loc)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(bad_id(s));
        };
        let node_id = NodeId::parse(node).map_err(|_| bad_id(s))?;
        let copy_id = CopyId::parse(copy).map_err(|_| bad_id(s))?;
        let location = if let Some(txn) = loc.strip_prefix('t') {
            IdLocation::Transaction(TxnId::parse(txn).map_err(|_| bad_id(s))?)
        } else if let Some(rest) = loc.strip_prefix('r') {
            let (rev, offset) = rest.split_once('/').ok_or_else(|| bad_id(s))?;
            IdLocation::Revision {
                rev: rev.parse().map_err(|_| bad_id(s))?,
                offset: offset.parse().map_err(|_| bad_id(s))?,
            }
        } else {
            return Err(bad_id(s));
        };
        Ok(Self {
            node_id,
            copy_id,
            location,
        })
    }

    /// Whether two IDs refer to revisions of the same node.
    ///
    /// This is the identity used by history navigation: node lineage is the
    /// node-id part, regardless of where the node revision lives.
    pub fn is_related_to(&self, other: &Self) -> bool {
        self.node_id == other.node_id
    }
}

impl Display for NodeRevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.unparse())
    }
}

/// Node-IDs may not carry both committed and transaction markers; the
/// parser enforces that structurally, but the permanent-form rewrite also
/// asserts it when patching IDs at commit.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unparse_round_trips_committed_form() {
        let id = NodeRevId::committed(NodeId::new("3j"), CopyId::new("0"), 17, 1234);
        assert_eq!(id.unparse(), "3j.0.r17/1234");
        assert_eq!(NodeRevId::parse("3j.0.r17/1234").unwrap(), id);
    }

    #[test]
    fn unparse_round_trips_txn_form() {
        let txn = TxnId::parse("5-1b").unwrap();
        let id = NodeRevId::in_txn(NodeId::new("_4"), CopyId::new("_1"), txn.clone());
        assert_eq!(id.unparse(), "_4._1.t5-1b");
        let parsed = NodeRevId::parse("_4._1.t5-1b").unwrap();
        assert_eq!(parsed, id);
        assert!(parsed.node_id.is_transient());
        assert_eq!(txn.base_rev(), 5);
    }

    #[test]
    fn parse_rejects_mixed_and_malformed_ids() {
        assert!(NodeRevId::parse("3j.0").is_err());
        assert!(NodeRevId::parse("3j.0.x17/12").is_err());
        assert!(NodeRevId::parse("3!.0.r1/0").is_err());
        assert!(NodeRevId::parse("3j.0.r17").is_err());
        assert!(TxnId::parse("nodash").is_err());
        assert!(TxnId::parse("x-1").is_err());
    }

    #[test]
    fn permanent_form_appends_revision() {
        let node = NodeId::transient(11);
        assert_eq!(node.as_str(), "_b");
        assert_eq!(node.permanent(42).as_str(), "b-42");
    }

    #[test]
    fn relation_ignores_location() {
        let a = NodeRevId::committed(NodeId::new("7"), CopyId::new("0"), 3, 10);
        let b = NodeRevId::committed(NodeId::new("7"), CopyId::new("2-9"), 9, 99);
        let c = NodeRevId::committed(NodeId::new("8"), CopyId::new("0"), 3, 10);
        assert!(a.is_related_to(&b));
        assert!(!a.is_related_to(&c));
    }
}
