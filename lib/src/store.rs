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

//! The top-level filesystem object.
//!
//! A [`FileSystem`] handle opens a repository directory, discovers the
//! format version, and shares caches and intra-process mutexes with every
//! other handle on the same path in this process. The handle caches the
//! youngest revision opportunistically; the value is re-read from disk
//! whenever staleness would be observable.

use std::collections::HashMap;
use std::fmt;
use std::fmt::Debug;
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::Mutex;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use chrono::SecondsFormat;
use chrono::Utc;
use clru::CLruCache;
use thiserror::Error;

use crate::base36;
use crate::changes::ChangeOrderError;
use crate::changes::ChangeParseError;
use crate::config::ConfigError;
use crate::config::DEFAULT_SHARD_SIZE;
use crate::config::FsConfig;
use crate::file_util;
use crate::file_util::IoResultExt as _;
use crate::file_util::PathError;
use crate::id::NodeId;
use crate::id::NodeRevId;
use crate::id::ParseIdError;
use crate::id::RevNum;
use crate::id::TxnId;
use crate::lock::FileLock;
use crate::node_rev::DirEntries;
use crate::node_rev::NodeRevParseError;
use crate::proplist;
use crate::proplist::ProplistParseError;
use crate::proplist::PropList;
use crate::svndiff::SvndiffError;

/// The newest repository format this library reads and writes.
pub const FORMAT_NUMBER: u32 = 6;
/// The oldest format still readable.
pub const MIN_SUPPORTED_FORMAT: u32 = 1;

/// The revision property carrying the commit datestamp.
pub const PROP_REVISION_DATE: &str = "svn:date";

/// Marker dropped by fresh-mode hot-copy until the destination is complete.
pub const HOTCOPY_MARKER_FILE: &str = "hotcopy-in-progress";

/// Result alias for filesystem operations.
pub type FsResult<T> = Result<T, FsError>;

/// The error taxonomy of the storage engine.
#[derive(Debug, Error)]
pub enum FsError {
    /// Malformed on-disk data; fatal to the current operation.
    #[error("Corrupt filesystem data in {path}: {reason}")]
    Corrupt {
        /// File the malformation was found in.
        path: PathBuf,
        /// What was wrong.
        reason: String,
    },
    /// The transaction's base revision is no longer the youngest.
    #[error("Transaction out of date: based on r{base}, but the youngest revision is r{youngest}")]
    TxnOutOfDate {
        /// The transaction's base revision.
        base: RevNum,
        /// The current youngest revision.
        youngest: RevNum,
    },
    /// Another writer holds the proto-revision lock of this transaction.
    #[error("Representation of transaction {0} is already being written")]
    RepBeingWritten(TxnId),
    /// A changed path is locked and the commit does not own the lock.
    #[error("Cannot verify lock on path {path:?}: {reason}")]
    LockVerification {
        /// The locked path.
        path: String,
        /// Why verification failed.
        reason: String,
    },
    /// The revision does not exist (or is not yet visible).
    #[error("No such revision r{0}")]
    NoSuchRevision(RevNum),
    /// The transaction directory is missing.
    #[error("No such transaction {0:?}")]
    NoSuchTransaction(String),
    /// A path named by a mutation does not exist.
    #[error("Path {0:?} not found")]
    PathNotFound(String),
    /// A path being created already exists.
    #[error("Path {0:?} already exists")]
    PathAlreadyExists(String),
    /// A non-directory path was used as a directory.
    #[error("Path {0:?} is not a directory")]
    NotADirectory(String),
    /// A non-file path was used as a file.
    #[error("Path {0:?} is not a file")]
    NotAFile(String),
    /// The format stamp names a version outside the supported range.
    #[error("Unsupported filesystem format {0}")]
    UnsupportedFormat(u32),
    /// Optimistic revision-property update lost the race.
    #[error("Revision property {name:?} of r{rev} does not have the expected value")]
    RevPropMismatch {
        /// The revision.
        rev: RevNum,
        /// The property.
        name: String,
    },
    /// Legacy transaction-directory creation ran out of retry attempts.
    #[error("Ran out of unique names for the transaction directory")]
    UniqueNameExhausted,
    /// The source repository packed the revisions being hot-copied; the
    /// whole hot-copy must be restarted.
    #[error("Revisions were packed at the source mid-copy; restart the hot-copy")]
    RestartHotCopy,
    /// The destination of a previous fresh hot-copy was never completed.
    #[error("Hot-copy into {0} was interrupted; the destination is unusable")]
    HotCopyIncomplete(PathBuf),
    /// Source/destination constraints of hot-copy are violated.
    #[error("Cannot hot-copy: {0}")]
    HotCopyMismatch(String),
    /// The operation was cancelled through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,
    /// Bad `fsfs.conf`.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// I/O failure with path context.
    #[error(transparent)]
    Io(#[from] PathError),
}

impl FsError {
    /// Convenience constructor for corruption findings.
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl fmt::Display) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Attaches a file path to a format-level parse error, turning it into a
/// corruption report.
pub(crate) trait CorruptResultExt<T> {
    fn corruption_in(self, path: &Path) -> FsResult<T>;
}

macro_rules! corruption_source {
    ($($err:ty),*) => {
        $(
            impl<T> CorruptResultExt<T> for Result<T, $err> {
                fn corruption_in(self, path: &Path) -> FsResult<T> {
                    self.map_err(|err| FsError::corrupt(path, err))
                }
            }
        )*
    };
}

corruption_source!(
    NodeRevParseError,
    ProplistParseError,
    ChangeParseError,
    ChangeOrderError,
    ParseIdError,
    SvndiffError
);

/// Non-fatal problem categories reported through the warning sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningKind {
    /// The rep-sharing index misbehaved; sharing is degraded.
    RepCache,
    /// A reconstructible cache failed.
    Cache,
    /// The node-origins cache failed.
    NodeOrigins,
    /// Post-commit cleanup failed; the revision itself is durable.
    Cleanup,
}

/// Structured diagnostic channel for non-fatal degradation, injected at
/// repository open.
pub trait WarningSink: Send + Sync {
    /// Reports one warning.
    fn warn(&self, kind: WarningKind, message: &str);
}

/// Default sink: forward to `tracing`.
#[derive(Debug, Default)]
pub struct TracingWarningSink;

impl WarningSink for TracingWarningSink {
    fn warn(&self, kind: WarningKind, message: &str) {
        tracing::warn!(?kind, message, "filesystem warning");
    }
}

/// Cooperative cancellation, polled at coarse boundaries of long
/// operations (between shards in hot-copy, between nodes in the commit
/// tree walk, between probes in history navigation).
#[derive(Clone, Default)]
pub struct CancelToken(Option<Arc<dyn Fn() -> bool + Send + Sync>>);

impl CancelToken {
    /// A token that never cancels.
    pub fn never() -> Self {
        Self(None)
    }

    /// Wraps a predicate returning `true` when the operation should stop.
    pub fn new(f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        Self(Some(Arc::new(f)))
    }

    /// Fails with [`FsError::Cancelled`] if cancellation was requested.
    pub fn check(&self) -> FsResult<()> {
        match &self.0 {
            Some(f) if f() => Err(FsError::Cancelled),
            _ => Ok(()),
        }
    }
}

impl Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CancelToken")
            .field(&self.0.is_some())
            .finish()
    }
}

/// Identity and lock tokens a caller presents for commit-time lock
/// verification.
#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    /// The committing user.
    pub username: String,
    /// Lock tokens the user holds.
    pub tokens: std::collections::HashSet<String>,
}

/// How revision files are arranged under `revs/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// All revision files in one flat directory.
    Linear,
    /// Shard directories of at most this many revisions each.
    Sharded(u64),
}

/// Parsed format stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// The format number (1..=[`FORMAT_NUMBER`]).
    pub number: u32,
    /// The revision file layout.
    pub layout: Layout,
}

impl Format {
    /// The format given to newly created repositories.
    pub fn current() -> Self {
        Self {
            number: FORMAT_NUMBER,
            layout: Layout::Sharded(DEFAULT_SHARD_SIZE),
        }
    }

    /// Parses the format stamp file contents.
    pub fn parse(text: &str, path: &Path) -> FsResult<Self> {
        let mut lines = text.lines();
        let number: u32 = lines
            .next()
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| FsError::corrupt(path, "missing format number"))?;
        if !(MIN_SUPPORTED_FORMAT..=FORMAT_NUMBER).contains(&number) {
            return Err(FsError::UnsupportedFormat(number));
        }
        let mut layout = Layout::Linear;
        for line in lines {
            let mut tokens = line.split_whitespace();
            match tokens.next() {
                Some("layout") => match (tokens.next(), tokens.next()) {
                    (Some("linear"), None) => layout = Layout::Linear,
                    (Some("sharded"), Some(size)) => {
                        let size: u64 = size
                            .parse()
                            .ok()
                            .filter(|&s| s > 0)
                            .ok_or_else(|| FsError::corrupt(path, "bad shard size"))?;
                        layout = Layout::Sharded(size);
                    }
                    _ => return Err(FsError::corrupt(path, "bad layout option")),
                },
                // Unknown options are carried by future formats we already
                // rejected above; within 1..=N anything else is noise.
                Some(_) => return Err(FsError::corrupt(path, "unknown format option")),
                None => {}
            }
        }
        Ok(Self { number, layout })
    }

    /// Renders the format stamp file contents.
    pub fn to_file_contents(&self) -> String {
        let mut out = format!("{}\n", self.number);
        match self.layout {
            Layout::Linear => out.push_str("layout linear\n"),
            Layout::Sharded(size) => out.push_str(&format!("layout sharded {size}\n")),
        }
        out
    }

    /// Shard size, if sharded.
    pub fn shard_size(&self) -> Option<u64> {
        match self.layout {
            Layout::Linear => None,
            Layout::Sharded(size) => Some(size),
        }
    }

    /// Whether shards may be packed into single files.
    pub fn supports_packing(&self) -> bool {
        self.number >= 4 && self.shard_size().is_some()
    }

    /// Whether the rep-sharing index is maintained.
    pub fn supports_rep_sharing(&self) -> bool {
        self.number >= 4
    }

    /// Whether the mergeinfo flag is tracked on node revisions.
    pub fn supports_mergeinfo(&self) -> bool {
        self.number >= 3
    }

    /// Whether the repository has a `txn-current` counter file.
    pub fn has_txn_current(&self) -> bool {
        self.number >= 3
    }

    /// Whether proto-revisions live in the shared `txn-protorevs/`
    /// directory rather than inside each transaction directory.
    pub fn has_protorevs_dir(&self) -> bool {
        self.number >= 3
    }

    /// Whether committed IDs take the `<local>-<rev>` form instead of
    /// globally allocated keys.
    pub fn no_global_ids(&self) -> bool {
        self.number >= 4
    }

    /// Whether revprops may be packed (recognized, never produced here).
    pub fn supports_packed_revprops(&self) -> bool {
        self.number >= 6
    }

    /// Whether `fsfs.conf` deltification knobs are honored.
    pub fn supports_deltification_controls(&self) -> bool {
        self.number >= 6
    }
}

/// Contents of the `current` file. Legacy formats (< 4) also track the
/// next node-ID/copy-ID keys here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentState {
    /// Youngest revision.
    pub youngest: RevNum,
    /// Next unassigned node-ID key (legacy formats only).
    pub next_node_id: Option<String>,
    /// Next unassigned copy-ID key (legacy formats only).
    pub next_copy_id: Option<String>,
}

impl CurrentState {
    fn parse(text: &str, format: &Format, path: &Path) -> FsResult<Self> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if format.no_global_ids() {
            match tokens.as_slice() {
                [youngest] => Ok(Self {
                    youngest: youngest
                        .parse()
                        .map_err(|_| FsError::corrupt(path, "bad youngest revision"))?,
                    next_node_id: None,
                    next_copy_id: None,
                }),
                _ => Err(FsError::corrupt(path, "expected a single revision number")),
            }
        } else {
            match tokens.as_slice() {
                [youngest, node, copy] if base36::is_key(node) && base36::is_key(copy) => {
                    Ok(Self {
                        youngest: base36::decode(youngest)
                            .ok_or_else(|| FsError::corrupt(path, "bad youngest revision"))?,
                        next_node_id: Some((*node).to_string()),
                        next_copy_id: Some((*copy).to_string()),
                    })
                }
                _ => Err(FsError::corrupt(path, "expected three base-36 tokens")),
            }
        }
    }

    fn to_file_contents(&self, format: &Format) -> String {
        if format.no_global_ids() {
            format!("{}\n", self.youngest)
        } else {
            format!(
                "{} {} {}\n",
                base36::encode(self.youngest),
                self.next_node_id.as_deref().unwrap_or("0"),
                self.next_copy_id.as_deref().unwrap_or("0"),
            )
        }
    }
}

/// In-process record of one in-flight transaction, shared between handles.
#[derive(Debug, Default)]
pub(crate) struct TxnShared {
    /// Set while a proto-revision stream is open for this transaction.
    pub(crate) being_written: AtomicBool,
}

/// Caches and mutexes shared by all handles on one repository path within
/// this process. Dropped when the last handle goes away.
pub(crate) struct SharedState {
    pub(crate) txns: Mutex<HashMap<String, Arc<TxnShared>>>,
    pub(crate) dir_cache: Mutex<CLruCache<String, Arc<DirEntries>>>,
}

const DIR_CACHE_CAPACITY: usize = 1024;

impl SharedState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            txns: Mutex::new(HashMap::new()),
            dir_cache: Mutex::new(CLruCache::new(
                NonZeroUsize::new(DIR_CACHE_CAPACITY).unwrap(),
            )),
        })
    }

    pub(crate) fn txn_record(&self, txn_id: &TxnId) -> Arc<TxnShared> {
        let mut txns = self.txns.lock().unwrap();
        txns.entry(txn_id.as_str().to_string())
            .or_default()
            .clone()
    }

    pub(crate) fn forget_txn(&self, txn_id: &TxnId) {
        self.txns.lock().unwrap().remove(txn_id.as_str());
    }
}

impl Debug for SharedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedState").finish_non_exhaustive()
    }
}

static REGISTRY: LazyLock<Mutex<HashMap<PathBuf, Weak<SharedState>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn shared_state_for(path: &Path) -> Arc<SharedState> {
    let key = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let mut registry = REGISTRY.lock().unwrap();
    if let Some(existing) = registry.get(&key).and_then(Weak::upgrade) {
        return existing;
    }
    let state = SharedState::new();
    registry.insert(key, Arc::downgrade(&state));
    // Opportunistically drop entries whose repositories are closed.
    registry.retain(|_, weak| weak.strong_count() > 0);
    state
}

/// Guard of the repository-wide write lock. Holds the youngest and
/// min-unpacked-rev values observed at acquisition; no other writer can
/// invalidate them while the guard lives.
#[derive(Debug)]
pub struct WriteLockGuard {
    _lock: FileLock,
    /// Youngest revision at lock-acquire time.
    pub youngest: RevNum,
    /// `min-unpacked-rev` at lock-acquire time.
    pub min_unpacked_rev: RevNum,
}

/// An open repository.
pub struct FileSystem {
    path: PathBuf,
    format: Format,
    uuid: String,
    config: FsConfig,
    warnings: Arc<dyn WarningSink>,
    access: Option<AccessContext>,
    pub(crate) shared: Arc<SharedState>,
}

impl Debug for FileSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSystem")
            .field("path", &self.path)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

impl FileSystem {
    /// Opens an existing repository.
    pub fn open(path: impl Into<PathBuf>) -> FsResult<Self> {
        Self::open_with_sink(path, Arc::new(TracingWarningSink))
    }

    /// Opens an existing repository with an injected warning sink.
    pub fn open_with_sink(
        path: impl Into<PathBuf>,
        warnings: Arc<dyn WarningSink>,
    ) -> FsResult<Self> {
        let path = path.into();
        if path.join(HOTCOPY_MARKER_FILE).exists() {
            return Err(FsError::HotCopyIncomplete(path));
        }
        let format_file = path.join("format");
        let text = fs::read_to_string(&format_file).context(&format_file)?;
        let format = Format::parse(&text, &format_file)?;
        let uuid_file = path.join("uuid");
        let uuid = file_util::read_line_file(&uuid_file)?;
        let mut config = FsConfig::load(&path.join("fsfs.conf"))?;
        if !format.supports_deltification_controls() {
            let defaults = FsConfig::default();
            config.deltify_directories = defaults.deltify_directories;
            config.deltify_properties = defaults.deltify_properties;
            config.max_deltification_walk = defaults.max_deltification_walk;
            config.max_linear_deltification = defaults.max_linear_deltification;
        }
        let shared = shared_state_for(&path);
        Ok(Self {
            path,
            format,
            uuid,
            config,
            warnings,
            access: None,
            shared,
        })
    }

    /// Builds a handle on a directory that is not (yet) a stamped
    /// repository — the hot-copy destination before its format file lands.
    pub(crate) fn open_unverified(
        path: impl Into<PathBuf>,
        format: Format,
        uuid: String,
        config: FsConfig,
    ) -> Self {
        let path = path.into();
        let shared = shared_state_for(&path);
        Self {
            path,
            format,
            uuid,
            config,
            warnings: Arc::new(TracingWarningSink),
            access: None,
            shared,
        }
    }

    /// Creates a new repository at `path` (the directory may exist but
    /// must be empty) and opens it. Revision 0 is created with an empty
    /// root directory.
    pub fn create(path: impl Into<PathBuf>) -> FsResult<Self> {
        Self::create_with_format(path, Format::current())
    }

    /// Like [`Self::create`], with an explicit layout (administrative
    /// tools pick shard sizes here).
    pub fn create_with_format(path: impl Into<PathBuf>, format: Format) -> FsResult<Self> {
        let path = path.into();
        file_util::create_or_reuse_dir(&path).context(&path)?;
        if fs::read_dir(&path).context(&path)?.next().is_some() {
            return Err(FsError::corrupt(&path, "directory is not empty"));
        }

        for dir in ["revs", "revprops", "transactions", "txn-protorevs", "locks", "node-origins"] {
            let dir = path.join(dir);
            fs::create_dir(&dir).context(&dir)?;
        }
        if format.shard_size().is_some() {
            for dir in ["revs/0", "revprops/0"] {
                let dir = path.join(dir);
                fs::create_dir(&dir).context(&dir)?;
            }
        }
        let uuid = uuid::Uuid::new_v4().to_string();
        fs::write(path.join("uuid"), format!("{uuid}\n")).context(path.join("uuid"))?;
        fs::write(path.join("min-unpacked-rev"), "0\n").context(path.join("min-unpacked-rev"))?;
        fs::write(path.join("txn-current"), "0\n").context(path.join("txn-current"))?;
        for lock_file in ["txn-current-lock", "write-lock"] {
            fs::write(path.join(lock_file), "").context(path.join(lock_file))?;
        }
        fs::write(path.join("fsfs.conf"), FsConfig::default_file_contents())
            .context(path.join("fsfs.conf"))?;

        crate::revision::write_revision_zero(&path, &format)?;

        let current = CurrentState {
            youngest: 0,
            next_node_id: None,
            next_copy_id: None,
        };
        fs::write(path.join("current"), current.to_file_contents(&format))
            .context(path.join("current"))?;
        // The format stamp makes the directory a repository; write it last.
        file_util::write_file_atomically(
            &path.join("format"),
            format.to_file_contents().as_bytes(),
        )?;
        Self::open(path)
    }

    /// The repository directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The parsed format stamp.
    pub fn format(&self) -> &Format {
        &self.format
    }

    /// The repository UUID.
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// The `fsfs.conf` settings in effect.
    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    /// Overrides config (testing and administrative tools).
    pub fn set_config(&mut self, config: FsConfig) {
        self.config = config;
    }

    /// Attaches the caller's identity and lock tokens for commit-time lock
    /// verification.
    pub fn set_access(&mut self, access: Option<AccessContext>) {
        self.access = access;
    }

    /// The attached access context.
    pub fn access(&self) -> Option<&AccessContext> {
        self.access.as_ref()
    }

    /// Reports a non-fatal problem.
    pub(crate) fn warn(&self, kind: WarningKind, message: &str) {
        self.warnings.warn(kind, message);
    }

    // Path helpers.

    pub(crate) fn current_file(&self) -> PathBuf {
        self.path.join("current")
    }

    pub(crate) fn min_unpacked_rev_file(&self) -> PathBuf {
        self.path.join("min-unpacked-rev")
    }

    pub(crate) fn txn_current_file(&self) -> PathBuf {
        self.path.join("txn-current")
    }

    pub(crate) fn txn_current_lock_file(&self) -> PathBuf {
        self.path.join("txn-current-lock")
    }

    pub(crate) fn write_lock_file(&self) -> PathBuf {
        self.path.join("write-lock")
    }

    pub(crate) fn revs_dir(&self) -> PathBuf {
        self.path.join("revs")
    }

    pub(crate) fn revprops_dir(&self) -> PathBuf {
        self.path.join("revprops")
    }

    pub(crate) fn transactions_dir(&self) -> PathBuf {
        self.path.join("transactions")
    }

    pub(crate) fn protorevs_dir(&self) -> PathBuf {
        self.path.join("txn-protorevs")
    }

    pub(crate) fn locks_dir(&self) -> PathBuf {
        self.path.join("locks")
    }

    pub(crate) fn node_origins_dir(&self) -> PathBuf {
        self.path.join("node-origins")
    }

    pub(crate) fn rep_cache_file(&self) -> PathBuf {
        self.path.join(crate::rep_cache::REP_CACHE_FILE)
    }

    /// Directory of one transaction's mutable files.
    pub(crate) fn txn_dir(&self, txn_id: &TxnId) -> PathBuf {
        self.transactions_dir().join(format!("{txn_id}.txn"))
    }

    /// The proto-revision file of a transaction. Formats with a
    /// `txn-protorevs` directory keep it there; legacy formats keep it
    /// inside the transaction directory.
    pub(crate) fn protorev_file(&self, txn_id: &TxnId) -> PathBuf {
        if self.format.has_protorevs_dir() {
            self.protorevs_dir().join(format!("{txn_id}.rev"))
        } else {
            self.txn_dir(txn_id).join("rev")
        }
    }

    /// The proto-revision lock file of a transaction.
    pub(crate) fn protorev_lock_file(&self, txn_id: &TxnId) -> PathBuf {
        if self.format.has_protorevs_dir() {
            self.protorevs_dir().join(format!("{txn_id}.rev-lock"))
        } else {
            self.txn_dir(txn_id).join("rev-lock")
        }
    }

    /// The shard a revision belongs to, if the layout is sharded.
    pub(crate) fn shard_of(&self, rev: RevNum) -> Option<u64> {
        self.format.shard_size().map(|size| rev / size)
    }

    /// Path of an unpacked revision file.
    pub(crate) fn rev_file_path(&self, rev: RevNum) -> PathBuf {
        match self.shard_of(rev) {
            Some(shard) => self.revs_dir().join(shard.to_string()).join(rev.to_string()),
            None => self.revs_dir().join(rev.to_string()),
        }
    }

    /// Path of a shard's pack directory.
    pub(crate) fn pack_dir_path(&self, shard: u64) -> PathBuf {
        self.revs_dir().join(format!("{shard}.pack"))
    }

    /// Path of a revision's revprops file.
    pub(crate) fn revprops_file_path(&self, rev: RevNum) -> PathBuf {
        match self.shard_of(rev) {
            Some(shard) => self
                .revprops_dir()
                .join(shard.to_string())
                .join(rev.to_string()),
            None => self.revprops_dir().join(rev.to_string()),
        }
    }

    // Pointers.

    /// Reads the `current` file.
    pub fn current(&self) -> FsResult<CurrentState> {
        let path = self.current_file();
        let text = fs::read_to_string(&path).context(&path)?;
        CurrentState::parse(&text, &self.format, &path)
    }

    /// The youngest committed revision.
    pub fn youngest(&self) -> FsResult<RevNum> {
        Ok(self.current()?.youngest)
    }

    /// Atomically rewrites the `current` file.
    pub(crate) fn write_current(&self, state: &CurrentState) -> FsResult<()> {
        file_util::write_file_atomically(
            &self.current_file(),
            state.to_file_contents(&self.format).as_bytes(),
        )?;
        Ok(())
    }

    /// Reads `min-unpacked-rev`; 0 when the file does not exist (formats
    /// that never pack).
    pub fn min_unpacked_rev(&self) -> FsResult<RevNum> {
        match file_util::read_line_file(&self.min_unpacked_rev_file()) {
            Ok(text) => text
                .trim()
                .parse()
                .map_err(|_| FsError::corrupt(self.min_unpacked_rev_file(), "bad revision number")),
            Err(err) if err.is_not_found() => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn write_min_unpacked_rev(&self, rev: RevNum) -> FsResult<()> {
        file_util::write_file_atomically(
            &self.min_unpacked_rev_file(),
            format!("{rev}\n").as_bytes(),
        )?;
        Ok(())
    }

    /// Runs `body` while holding the repository write lock. The guard
    /// carries the youngest and min-unpacked-rev observed under the lock.
    pub fn with_write_lock<R>(
        &self,
        body: impl FnOnce(&WriteLockGuard) -> FsResult<R>,
    ) -> FsResult<R> {
        let lock = FileLock::lock(self.write_lock_file())?;
        let guard = WriteLockGuard {
            youngest: self.youngest()?,
            min_unpacked_rev: self.min_unpacked_rev()?,
            _lock: lock,
        };
        body(&guard)
    }

    // Revision properties.

    /// Reads the property list of revision `rev`.
    pub fn revision_proplist(&self, rev: RevNum) -> FsResult<PropList> {
        if rev > self.youngest()? {
            return Err(FsError::NoSuchRevision(rev));
        }
        let path = self.revprops_file_path(rev);
        let data = file_util::read_file(&path)?;
        let (props, _) = proplist::parse(&data).corruption_in(&path)?;
        Ok(props)
    }

    /// Reads one revision property.
    pub fn revision_prop(&self, rev: RevNum, name: &str) -> FsResult<Option<Vec<u8>>> {
        Ok(self.revision_proplist(rev)?.get(name).cloned())
    }

    /// Sets (or with `value = None` deletes) one revision property.
    ///
    /// When `expected_old` is given, the update is optimistic: it fails
    /// with [`FsError::RevPropMismatch`] unless the stored value (or its
    /// absence) matches.
    pub fn set_revision_prop(
        &self,
        rev: RevNum,
        name: &str,
        expected_old: Option<Option<&[u8]>>,
        value: Option<&[u8]>,
    ) -> FsResult<()> {
        self.with_write_lock(|_guard| {
            let mut props = self.revision_proplist(rev)?;
            if let Some(expected) = expected_old {
                if props.get(name).map(|v| v.as_slice()) != expected {
                    return Err(FsError::RevPropMismatch {
                        rev,
                        name: name.to_string(),
                    });
                }
            }
            match value {
                Some(value) => {
                    props.insert(name.to_string(), value.to_vec());
                }
                None => {
                    props.remove(name);
                }
            }
            file_util::write_file_atomically(
                &self.revprops_file_path(rev),
                &proplist::write(&props),
            )?;
            Ok(())
        })
    }

    // Node-origins cache.

    /// Returns the origin (first) node revision of a node lineage,
    /// consulting and opportunistically maintaining the `node-origins`
    /// cache. `hint` is any known node revision of the lineage.
    pub fn node_origin(&self, node_id: &NodeId, hint: &NodeRevId) -> FsResult<NodeRevId> {
        let cache_path = self.node_origins_dir().join(node_id.as_str());
        if let Ok(text) = file_util::read_line_file(&cache_path) {
            if let Ok(id) = NodeRevId::parse(&text) {
                return Ok(id);
            }
            self.warn(
                WarningKind::NodeOrigins,
                &format!("discarding malformed node-origins entry for {node_id}"),
            );
        }
        let origin = crate::history::walk_to_origin(self, hint)?;
        if let Err(err) =
            file_util::write_file_atomically(&cache_path, origin.unparse().as_bytes())
        {
            self.warn(
                WarningKind::NodeOrigins,
                &format!("cannot record origin of {node_id}: {err}"),
            );
        }
        Ok(origin)
    }

    /// Recomputes `current` from the `revs` tree after a crash: youngest
    /// becomes the largest revision reachable contiguously from 0.
    pub fn recover(&self) -> FsResult<RevNum> {
        self.with_write_lock(|_guard| {
            let mut youngest = 0;
            while crate::revision::revision_file_exists(self, youngest + 1)? {
                youngest += 1;
            }
            let (next_node_id, next_copy_id) = if self.format.no_global_ids() {
                (None, None)
            } else {
                let (node, copy) = crate::revision::max_ids_in_revision(self, youngest)?;
                (Some(node), Some(copy))
            };
            self.write_current(&CurrentState {
                youngest,
                next_node_id,
                next_copy_id,
            })?;
            Ok(youngest)
        })
    }
}

/// The current UTC time in the RFC-3339 rendering used for `svn:date`.
pub fn date_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn format_stamp_round_trips() {
        let path = Path::new("format");
        let format = Format::current();
        let parsed = Format::parse(&format.to_file_contents(), path).unwrap();
        assert_eq!(parsed, format);

        let linear = Format::parse("3\nlayout linear\n", path).unwrap();
        assert_eq!(linear.layout, Layout::Linear);
        assert!(!linear.no_global_ids());
    }

    #[test]
    fn format_gap_is_rejected() {
        let path = Path::new("format");
        assert_matches!(
            Format::parse("99\n", path),
            Err(FsError::UnsupportedFormat(99))
        );
        assert_matches!(Format::parse("0\n", path), Err(FsError::UnsupportedFormat(0)));
        assert_matches!(Format::parse("", path), Err(FsError::Corrupt { .. }));
    }

    #[test]
    fn current_state_has_two_renderings() {
        let path = Path::new("current");
        let modern = Format::current();
        let legacy = Format {
            number: 2,
            layout: Layout::Linear,
        };
        let state = CurrentState {
            youngest: 41,
            next_node_id: None,
            next_copy_id: None,
        };
        assert_eq!(state.to_file_contents(&modern), "41\n");
        assert_eq!(
            CurrentState::parse("41\n", &modern, path).unwrap().youngest,
            41
        );

        let parsed = CurrentState::parse("15 a7 4\n", &legacy, path).unwrap();
        assert_eq!(parsed.youngest, 41); // base-36 "15"
        assert_eq!(parsed.next_node_id.as_deref(), Some("a7"));
        assert_eq!(parsed.to_file_contents(&legacy), "15 a7 4\n");
    }

    #[test]
    fn cancel_token_reports_cancellation() {
        assert!(CancelToken::never().check().is_ok());
        let token = CancelToken::new(|| true);
        assert_matches!(token.check(), Err(FsError::Cancelled));
    }
}
