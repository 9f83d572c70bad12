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

//! Advisory file locks.
//!
//! Every repository-level lock (write lock, `txn-current` lock, proto-rev
//! lock) is an OS advisory lock on a dedicated lock file, wrapped in a
//! guard that releases on drop. Cross-process exclusion comes from the OS
//! lock; intra-process exclusion is layered on top by the shared state in
//! [`crate::store`].

use std::fs::File;
use std::fs::OpenOptions;
use std::path::Path;
use std::path::PathBuf;

use fs4::FileExt as _;

use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;

/// An exclusively held advisory file lock, released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    file: File,
}

fn open_lock_file(path: &Path) -> Result<File, PathError> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .context(path)
}

impl FileLock {
    /// Acquires the lock, blocking for as long as another holder exists.
    pub fn lock(path: impl Into<PathBuf>) -> Result<Self, PathError> {
        let path = path.into();
        let file = open_lock_file(&path)?;
        file.lock_exclusive().context(&path)?;
        Ok(Self { path, file })
    }

    /// Attempts the lock without blocking. Returns `Ok(None)` when another
    /// process holds it.
    pub fn try_lock(path: impl Into<PathBuf>) -> Result<Option<Self>, PathError> {
        let path = path.into();
        let file = open_lock_file(&path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { path, file })),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err).context(&path),
        }
    }

    /// The lock file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::warn!(path = %self.path.display(), ?err, "failed to release file lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_lock_excludes_second_holder() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("write-lock");
        let held = FileLock::lock(&path).unwrap();
        // Advisory locks are per file description; a second handle in the
        // same process still observes the exclusion on Unix.
        #[cfg(unix)]
        assert!(FileLock::try_lock(&path).unwrap().is_none());
        drop(held);
        assert!(FileLock::try_lock(&path).unwrap().is_some());
    }
}
