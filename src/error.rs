//! Crate-level error taxonomy.
//!
//! Mirrors the three-tier status model of the original driver (in-progress /
//! non-fatal failure / fatal) but expresses it as ordinary Rust types instead
//! of an integer status code: [`OpStatus`] carries the in-progress/non-fatal
//! split for a single pending operation, while [`AfatfsError`] is the error
//! payload for both non-fatal failures and the fatal conditions that latch
//! the whole filesystem.

use core::fmt;

/// Every error this crate can report.
///
/// Fatal variants (see [`AfatfsError::is_fatal`]) latch [`crate::fs::AfatFs`]
/// into `Lifecycle::Fatal`; every public entry point then short-circuits
/// with `FilesystemFatal` before touching any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AfatfsError {
    /// The underlying block device reported an I/O failure.
    DeviceError,
    /// Boot sector is missing the 0x55AA signature, or no partition entry
    /// carries a recognised FAT partition type (0x0B / 0x0C).
    BadSignature,
    /// Volume ID fields are inconsistent (bytes-per-sector != 512, numFATs
    /// != 2, zero sectors-per-cluster, non-power-of-two cluster size, ...).
    BadGeometry,
    /// The volume classifies as FAT12, which this driver does not support.
    Fat12Unsupported,
    /// A cache completion arrived for a slot whose (sector, token) no
    /// longer matches any live request, or a slot reached a state the
    /// cache state machine has no transition for.
    CacheInconsistent,
    /// The filesystem has already latched fatal and refuses further work.
    FilesystemFatal,
    /// A file handle already has a queued operation.
    HandleBusy,
    /// No unused file handle is available in the fixed pool.
    TooManyOpenFiles,
    /// `find_file` walked the whole directory without a match.
    NotFound,
    /// A directory is full and cannot be extended (FAT16 root, or generic
    /// cluster-append failure while extending).
    DirectoryFull,
    /// The free-space search and/or FAT walk found no more free clusters.
    VolumeFull,
    /// Operation required a directory handle but got a plain file, or vice
    /// versa.
    NotADirectory,
    /// `mkdir`/`fopen(..., Create)` target already exists.
    AlreadyExists,
    /// Caller asked for a byte range outside what the handle permits
    /// (e.g. attempted write on a handle opened without `Write`).
    PermissionDenied,
    /// Caller-supplied filename does not fit the 8.3 mapping.
    InvalidName,
    /// The volume has not finished mounting yet.
    NotReady,
}

impl AfatfsError {
    /// True for the "fatal" tier of §7: the filesystem must fail fast after
    /// this is observed.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            AfatfsError::BadSignature
                | AfatfsError::BadGeometry
                | AfatfsError::Fat12Unsupported
                | AfatfsError::CacheInconsistent
                | AfatfsError::FilesystemFatal
        )
    }
}

impl fmt::Display for AfatfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AfatfsError::DeviceError => "block device reported an error",
            AfatfsError::BadSignature => "boot sector signature or partition table is invalid",
            AfatfsError::BadGeometry => "FAT volume ID fields are inconsistent",
            AfatfsError::Fat12Unsupported => "FAT12 volumes are not supported",
            AfatfsError::CacheInconsistent => "sector cache reached an inconsistent state",
            AfatfsError::FilesystemFatal => "filesystem is in the fatal state",
            AfatfsError::HandleBusy => "file handle already has a queued operation",
            AfatfsError::TooManyOpenFiles => "no free file handle in the open-file pool",
            AfatfsError::NotFound => "no such file or directory",
            AfatfsError::DirectoryFull => "directory is full and cannot be extended",
            AfatfsError::VolumeFull => "volume has no free clusters left",
            AfatfsError::NotADirectory => "handle does not refer to a directory",
            AfatfsError::AlreadyExists => "name already exists in the directory",
            AfatfsError::PermissionDenied => "operation not permitted by the handle's open mode",
            AfatfsError::InvalidName => "name does not fit the 8.3 short-name format",
            AfatfsError::NotReady => "filesystem has not finished mounting yet",
        };
        f.write_str(msg)
    }
}

impl core::error::Error for AfatfsError {}

/// Status of a single pending operation, threaded through every
/// micro-state-machine in this crate.
///
/// `InProgress` must always be recoverable by polling again; it is never a
/// final state. Low-level helpers return this unchanged; state machines
/// advance only on `Done` and propagate `InProgress`/`Failed` upward as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus<T> {
    /// Caller must call `poll` and retry; no bytes/objects were consumed.
    InProgress,
    /// Operation reached its terminal success state with this value.
    Done(T),
    /// Operation failed, non-fatally or fatally (see [`AfatfsError::is_fatal`]).
    Failed(AfatfsError),
}

impl<T> OpStatus<T> {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, OpStatus::InProgress)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, OpStatus::Done(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OpStatus<U> {
        match self {
            OpStatus::InProgress => OpStatus::InProgress,
            OpStatus::Done(v) => OpStatus::Done(f(v)),
            OpStatus::Failed(e) => OpStatus::Failed(e),
        }
    }

    /// Turns a quiescent status into a `Result`, panicking if still pending.
    /// Intended for test harnesses that poll to quiescence first.
    #[cfg(any(test, feature = "std"))]
    pub fn expect_quiescent(self) -> Result<T, AfatfsError> {
        match self {
            OpStatus::InProgress => panic!("operation had not reached a quiescent state"),
            OpStatus::Done(v) => Ok(v),
            OpStatus::Failed(e) => Err(e),
        }
    }
}
