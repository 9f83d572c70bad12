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

//! Path locks.
//!
//! A lock reserves a file path for one user. Locks live as small
//! digest-addressed files under the repository's `locks/` tree (the tree
//! hot-copy replicates wholesale), and the commit pipeline verifies that
//! every changed path is clear of other users' locks.

use std::fs;
use std::path::PathBuf;

use digest::Digest as _;
use sha1::Sha1;

use crate::file_util;
use crate::file_util::IoResultExt as _;
use crate::proplist;
use crate::proplist::PropList;
use crate::revision::Revision;
use crate::store::CorruptResultExt as _;
use crate::store::FileSystem;
use crate::store::FsError;
use crate::store::FsResult;

/// One held path lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathLock {
    /// The locked path.
    pub path: String,
    /// The opaque token proving ownership.
    pub token: String,
    /// The user holding the lock.
    pub owner: String,
    /// Creation datestamp.
    pub created: String,
}

fn lock_file_path(fs: &FileSystem, path: &str) -> PathBuf {
    let digest = hex::encode(Sha1::digest(path.as_bytes()));
    fs.locks_dir().join(&digest[..2]).join(&digest)
}

fn write_lock_file(fs: &FileSystem, lock: &PathLock) -> FsResult<()> {
    let file = lock_file_path(fs, &lock.path);
    let dir = file.parent().expect("lock files have a fanout directory");
    file_util::create_or_reuse_dir(dir).context(dir)?;
    let mut props = PropList::new();
    props.insert("path".to_string(), lock.path.clone().into_bytes());
    props.insert("token".to_string(), lock.token.clone().into_bytes());
    props.insert("owner".to_string(), lock.owner.clone().into_bytes());
    props.insert("created".to_string(), lock.created.clone().into_bytes());
    file_util::write_file_atomically(&file, &proplist::write(&props))?;
    Ok(())
}

fn read_lock_file(fs: &FileSystem, file: &PathBuf) -> FsResult<PathLock> {
    let data = file_util::read_file(file)?;
    let (props, _) = proplist::parse(&data).corruption_in(file)?;
    let get = |key: &str| -> FsResult<String> {
        props
            .get(key)
            .and_then(|value| String::from_utf8(value.clone()).ok())
            .ok_or_else(|| FsError::corrupt(file, format!("lock file missing {key}")))
    };
    Ok(PathLock {
        path: get("path")?,
        token: get("token")?,
        owner: get("owner")?,
        created: get("created")?,
    })
}

/// Locks `path` for `owner`. The path must name an existing file at the
/// youngest revision. A caller-provided token is honored (lock recovery);
/// otherwise a fresh one is generated.
pub fn lock_path(
    fs: &FileSystem,
    path: &str,
    owner: &str,
    token: Option<String>,
) -> FsResult<PathLock> {
    fs.with_write_lock(|guard| {
        let head = Revision::open(fs, guard.youngest)?;
        match head.check_path(path)? {
            Some(crate::node_rev::NodeKind::File) => {}
            Some(_) => return Err(FsError::NotAFile(path.to_string())),
            None => return Err(FsError::PathNotFound(path.to_string())),
        }
        if let Some(existing) = get_lock(fs, path)? {
            return Err(FsError::LockVerification {
                path: path.to_string(),
                reason: format!("already locked by {:?}", existing.owner),
            });
        }
        let lock = PathLock {
            path: path.to_string(),
            token: token
                .unwrap_or_else(|| format!("opaquelocktoken:{}", uuid::Uuid::new_v4())),
            owner: owner.to_string(),
            created: crate::store::date_now(),
        };
        write_lock_file(fs, &lock)?;
        Ok(lock)
    })
}

/// Releases the lock on `path`. Without `break_lock`, the presented token
/// must match.
pub fn unlock_path(
    fs: &FileSystem,
    path: &str,
    token: Option<&str>,
    break_lock: bool,
) -> FsResult<()> {
    fs.with_write_lock(|_guard| {
        let Some(lock) = get_lock(fs, path)? else {
            return Err(FsError::LockVerification {
                path: path.to_string(),
                reason: "no lock to release".to_string(),
            });
        };
        if !break_lock && token != Some(lock.token.as_str()) {
            return Err(FsError::LockVerification {
                path: path.to_string(),
                reason: "wrong lock token".to_string(),
            });
        }
        let file = lock_file_path(fs, path);
        fs::remove_file(&file).context(&file)?;
        Ok(())
    })
}

/// The lock on `path`, if any.
pub fn get_lock(fs: &FileSystem, path: &str) -> FsResult<Option<PathLock>> {
    let file = lock_file_path(fs, path);
    if !file.is_file() {
        return Ok(None);
    }
    read_lock_file(fs, &file).map(Some)
}

/// All locks at or under `path`, in path order.
pub fn get_locks_under(fs: &FileSystem, path: &str) -> FsResult<Vec<PathLock>> {
    let mut locks = vec![];
    let root = fs.locks_dir();
    if !root.is_dir() {
        return Ok(locks);
    }
    for shard in root.read_dir().context(&root)? {
        let shard = shard.context(&root)?.path();
        if !shard.is_dir() {
            continue;
        }
        for entry in shard.read_dir().context(&shard)? {
            let file = entry.context(&shard)?.path();
            let lock = read_lock_file(fs, &file)?;
            if lock.path == path || lock.path.starts_with(&format!("{}/", path.trim_end_matches('/'))) {
                locks.push(lock);
            }
        }
    }
    locks.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(locks)
}

/// Commit-time verification: the caller's access context must cover the
/// lock on `path` (and, recursively, on every descendant).
pub(crate) fn verify_path(fs: &FileSystem, path: &str, recursive: bool) -> FsResult<()> {
    let relevant = if recursive {
        get_locks_under(fs, path)?
    } else {
        get_lock(fs, path)?.into_iter().collect()
    };
    for lock in relevant {
        let Some(access) = fs.access() else {
            return Err(FsError::LockVerification {
                path: lock.path.clone(),
                reason: "no lock token supplied".to_string(),
            });
        };
        if access.username != lock.owner {
            return Err(FsError::LockVerification {
                path: lock.path.clone(),
                reason: format!("lock is held by {:?}", lock.owner),
            });
        }
        if !access.tokens.contains(&lock.token) {
            return Err(FsError::LockVerification {
                path: lock.path.clone(),
                reason: "no matching lock token supplied".to_string(),
            });
        }
    }
    Ok(())
}
