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

#![expect(missing_docs)]

use std::fs;
use std::fs::File;
use std::io;
use std::io::Read as _;
use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tempfile::PersistError;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Cannot access {path}")]
pub struct PathError {
    pub path: PathBuf,
    pub source: io::Error,
}

pub trait IoResultExt<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn context(self, path: impl AsRef<Path>) -> Result<T, PathError> {
        self.map_err(|error| PathError {
            path: path.as_ref().to_path_buf(),
            source: error,
        })
    }
}

impl PathError {
    pub fn new(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.source.kind() == io::ErrorKind::NotFound
    }
}

/// Creates a directory or does nothing if the directory already exists.
///
/// The function will fail if intermediate directories on the path do not
/// already exist.
pub fn create_or_reuse_dir(dirname: &Path) -> io::Result<()> {
    match fs::create_dir(dirname) {
        Ok(()) => Ok(()),
        Err(_) if dirname.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Persists the temporary file after synchronizing the content.
///
/// After a system crash, the persisted file should have valid content if it
/// exists at all. The persisted directory entry could still be lost; it's up
/// to the caller to synchronize the directory when that matters.
pub fn persist_temp_file<P: AsRef<Path>>(
    temp_file: NamedTempFile,
    new_path: P,
) -> io::Result<File> {
    temp_file.as_file().sync_data()?;
    temp_file
        .persist(new_path)
        .map_err(|PersistError { error, file: _ }| error)
}

/// Atomically replaces (or creates) the file at `path` with `contents`.
///
/// The write goes through a temporary file in the same directory, is synced,
/// and is renamed into place, so a reader never observes a partial file.
pub fn write_file_atomically(path: &Path, contents: &[u8]) -> Result<(), PathError> {
    let dir = path.parent().expect("target path must have a parent");
    let mut temp_file = NamedTempFile::new_in(dir).context(dir)?;
    temp_file.write_all(contents).context(path)?;
    persist_temp_file(temp_file, path).context(path)?;
    Ok(())
}

/// Reads a whole file, mapping "not found" through like any other error.
pub fn read_file(path: &Path) -> Result<Vec<u8>, PathError> {
    fs::read(path).context(path)
}

/// Reads a file expected to contain a single trimmed line.
pub fn read_line_file(path: &Path) -> Result<String, PathError> {
    let data = fs::read_to_string(path).context(path)?;
    Ok(data.trim_end_matches(['\r', '\n']).to_string())
}

/// Clones the permission bits of `reference` onto `path`.
///
/// Used when a new revision file should borrow the permissions of the
/// previous one. On non-Unix platforms this is a no-op.
pub fn copy_permissions(reference: &Path, path: &Path) -> Result<(), PathError> {
    #[cfg(unix)]
    {
        let perms = fs::metadata(reference).context(reference)?.permissions();
        fs::set_permissions(path, perms).context(path)?;
    }
    #[cfg(not(unix))]
    {
        let _ = (reference, path);
    }
    Ok(())
}

/// Whether `dst` already matches `src` by `(kind, size, mtime)`.
///
/// Hot-copy uses this to skip recopying files that are unchanged since a
/// previous run. A `false` answer is always safe.
pub fn same_file_cheap(src: &Path, dst: &Path) -> bool {
    let (Ok(a), Ok(b)) = (fs::metadata(src), fs::metadata(dst)) else {
        return false;
    };
    if a.is_dir() != b.is_dir() || a.len() != b.len() {
        return false;
    }
    matches!((a.modified(), b.modified()), (Ok(ma), Ok(mb)) if ma == mb)
}

/// Copies a regular file, preserving its length and permissions, atomically
/// on the destination side.
pub fn copy_file(src: &Path, dst: &Path) -> Result<(), PathError> {
    let dir = dst.parent().expect("target path must have a parent");
    let mut reader = File::open(src).context(src)?;
    let mut temp_file = NamedTempFile::new_in(dir).context(dir)?;
    io::copy(&mut reader, temp_file.as_file_mut()).context(src)?;
    persist_temp_file(temp_file, dst).context(dst)?;
    copy_permissions(src, dst)?;
    // Restore the source mtime so the same-file skip can recognize the copy.
    if let Ok(meta) = fs::metadata(src) {
        if let Ok(mtime) = meta.modified() {
            let _ = File::options()
                .write(true)
                .open(dst)
                .and_then(|f| f.set_times(fs::FileTimes::new().set_modified(mtime)));
        }
    }
    Ok(())
}

/// Recursively copies a directory tree (used for pack directories).
pub fn copy_dir_recursively(src: &Path, dst: &Path) -> Result<(), PathError> {
    create_or_reuse_dir(dst).context(dst)?;
    for entry in src.read_dir().context(src)? {
        let entry = entry.context(src)?;
        let src_entry = entry.path();
        let dst_entry = dst.join(entry.file_name());
        if entry.file_type().context(&src_entry)?.is_dir() {
            copy_dir_recursively(&src_entry, &dst_entry)?;
        } else if !same_file_cheap(&src_entry, &dst_entry) {
            copy_file(&src_entry, &dst_entry)?;
        }
    }
    Ok(())
}

/// Reads exactly `len` bytes at `offset` without assuming a cursor position.
pub fn read_exact_at(file: &mut File, offset: u64, len: usize) -> io::Result<Vec<u8>> {
    use std::io::Seek as _;
    file.seek(io::SeekFrom::Start(offset))?;
    let mut buf = vec![0; len];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_file_atomically_replaces_existing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("current");
        write_file_atomically(&target, b"4\n").unwrap();
        write_file_atomically(&target, b"5\n").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"5\n");
    }

    #[test]
    fn read_line_file_strips_newline() {
        let temp_dir = tempfile::tempdir().unwrap();
        let target = temp_dir.path().join("current");
        fs::write(&target, "12\n").unwrap();
        assert_eq!(read_line_file(&target).unwrap(), "12");
    }

    #[test]
    fn copy_file_preserves_contents_and_mtime() {
        let temp_dir = tempfile::tempdir().unwrap();
        let src = temp_dir.path().join("src");
        let dst = temp_dir.path().join("dst");
        fs::write(&src, b"payload").unwrap();
        copy_file(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"payload");
        assert!(same_file_cheap(&src, &dst));
    }

    #[test]
    fn same_file_cheap_rejects_size_mismatch() {
        let temp_dir = tempfile::tempdir().unwrap();
        let a = temp_dir.path().join("a");
        let b = temp_dir.path().join("b");
        fs::write(&a, b"xx").unwrap();
        fs::write(&b, b"xxx").unwrap();
        assert!(!same_file_cheap(&a, &b));
    }
}
