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

//! The repository-level rep-sharing index.
//!
//! Maps the SHA-1 of a representation's fulltext to where an identical
//! representation already lives. The index is reconstructible: every
//! failure here degrades to "no sharing" and is reported through the
//! warning sink rather than failing the commit.

use std::path::Path;

use rusqlite::Connection;
use rusqlite::OptionalExtension as _;

use crate::id::RevNum;
use crate::node_rev::Sha1Digest;

/// File name of the index inside the repository.
pub const REP_CACHE_FILE: &str = "rep-cache.db";

/// One row: where the canonical copy of some fulltext lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepCacheEntry {
    /// SHA-1 of the fulltext.
    pub sha1: Sha1Digest,
    /// Revision holding the representation.
    pub revision: RevNum,
    /// Offset of the representation header in that revision's file.
    pub offset: u64,
    /// On-disk payload size.
    pub size: u64,
    /// Fulltext size.
    pub expanded_size: u64,
}

/// Handle on the rep-cache database.
#[derive(Debug)]
pub struct RepCache {
    connection: Connection,
}

impl RepCache {
    /// Opens (creating if necessary) the index at `path`.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let connection = Connection::open(path)?;
        connection.execute_batch(
            "CREATE TABLE IF NOT EXISTS rep_cache (
                 hash TEXT NOT NULL PRIMARY KEY,
                 revision INTEGER NOT NULL,
                 offset INTEGER NOT NULL,
                 size INTEGER NOT NULL,
                 expanded_size INTEGER NOT NULL
             );",
        )?;
        Ok(Self { connection })
    }

    /// Looks up a fulltext by SHA-1.
    pub fn get(&self, sha1: &Sha1Digest) -> rusqlite::Result<Option<RepCacheEntry>> {
        self.connection
            .query_row(
                "SELECT revision, offset, size, expanded_size FROM rep_cache WHERE hash = ?1",
                [hex::encode(sha1)],
                |row| {
                    Ok(RepCacheEntry {
                        sha1: *sha1,
                        revision: row.get::<_, i64>(0)? as RevNum,
                        offset: row.get::<_, i64>(1)? as u64,
                        size: row.get::<_, i64>(2)? as u64,
                        expanded_size: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()
    }

    /// Inserts the queued entries of a committed revision under one outer
    /// transaction. Existing rows win; a duplicate hash is not an error.
    pub fn insert_all(&mut self, entries: &[RepCacheEntry]) -> rusqlite::Result<()> {
        let tx = self.connection.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO rep_cache (hash, revision, offset, size, expanded_size)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for entry in entries {
                stmt.execute((
                    hex::encode(entry.sha1),
                    entry.revision as i64,
                    entry.offset as i64,
                    entry.size as i64,
                    entry.expanded_size as i64,
                ))?;
            }
        }
        tx.commit()
    }

    /// Removes rows that reference revisions younger than `youngest`;
    /// hot-copy uses this after trimming a destination.
    pub fn purge_beyond(&mut self, youngest: RevNum) -> rusqlite::Result<usize> {
        self.connection.execute(
            "DELETE FROM rep_cache WHERE revision > ?1",
            [youngest as i64],
        )
    }

    /// Number of rows, for verification.
    pub fn len(&self) -> rusqlite::Result<u64> {
        self.connection
            .query_row("SELECT COUNT(*) FROM rep_cache", [], |row| {
                row.get::<_, i64>(0).map(|n| n as u64)
            })
    }

    /// Whether the index has no rows.
    pub fn is_empty(&self) -> rusqlite::Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(byte: u8, revision: RevNum) -> RepCacheEntry {
        RepCacheEntry {
            sha1: [byte; 20],
            revision,
            offset: 10,
            size: 20,
            expanded_size: 30,
        }
    }

    #[test]
    fn insert_then_get() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = RepCache::open(&dir.path().join(REP_CACHE_FILE)).unwrap();
        cache.insert_all(&[entry(1, 4), entry(2, 5)]).unwrap();
        assert_eq!(cache.get(&[1; 20]).unwrap(), Some(entry(1, 4)));
        assert_eq!(cache.get(&[9; 20]).unwrap(), None);
        assert_eq!(cache.len().unwrap(), 2);
    }

    #[test]
    fn duplicate_hash_keeps_first_row() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = RepCache::open(&dir.path().join(REP_CACHE_FILE)).unwrap();
        cache.insert_all(&[entry(1, 4)]).unwrap();
        cache.insert_all(&[entry(1, 9)]).unwrap();
        assert_eq!(cache.get(&[1; 20]).unwrap().unwrap().revision, 4);
    }

    #[test]
    fn purge_drops_younger_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = RepCache::open(&dir.path().join(REP_CACHE_FILE)).unwrap();
        cache
            .insert_all(&[entry(1, 4), entry(2, 8), entry(3, 12)])
            .unwrap();
        assert_eq!(cache.purge_beyond(8).unwrap(), 1);
        assert_eq!(cache.len().unwrap(), 2);
    }
}
