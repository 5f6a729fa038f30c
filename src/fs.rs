//! Top-level driver: owns the device, the mount state machine, and the
//! fixed pool of open file/directory handles, and exposes the public
//! blocking-free API of §6 (`fopen`, `fread`, `fwrite`, `fseek`, `fclose`,
//! `funlink`, `mkdir`, `chdir`, `find_first`/`find_next`, and friends).
//!
//! A single `poll()` call advances the device by one completion and steps
//! every busy handle once; every public method additionally drains its own
//! work inline in a bounded loop so a caller that never touches `poll`
//! directly still observes synchronous-feeling behaviour whenever the cache
//! already holds what it needs.

use crate::cache::SectorCache;
use crate::config::Config;
use crate::core_state::Core;
use crate::device::BlockDevice;
use crate::dir::{DirFinder, DirRoot, FindNextOutcome};
use crate::error::{AfatfsError, OpStatus};
use crate::file::{
    fseek_atomic, parse_mode, read_file, step_handle, write_file, CloseOp, FileHandle, FileKind,
    FileOp, OpenCreate, OpenMode, SeekFrom, SeekWalk, UnlinkOp,
};
use crate::layout::{name_to_short, VolumeGeometry};
use crate::mount::MountDriver;

/// Compile-time ceiling on simultaneously open handles; `Config.max_open_files`
/// is checked against this at `init` time but never grows the array itself
/// (§3 "fixed pool", kept `no_std`-friendly).
pub const MAX_OPEN_FILES: usize = 16;

/// Opaque handle returned by `fopen`/`mkdir`, indexing into `AfatFs`'s
/// internal handle pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Unknown,
    Initializing,
    Ready,
    Fatal(AfatfsError),
}

/// Public view of `Lifecycle` (§3 "lifecycle state"), returned by
/// [`AfatFs::get_filesystem_state`]. Carries no payload for `Fatal` — callers
/// that need the triggering error should capture it from the `init` call
/// that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsState {
    Unknown,
    Initialization,
    Ready,
    Fatal,
}

impl From<Lifecycle> for FsState {
    fn from(l: Lifecycle) -> Self {
        match l {
            Lifecycle::Unknown => FsState::Unknown,
            Lifecycle::Initializing => FsState::Initialization,
            Lifecycle::Ready => FsState::Ready,
            Lifecycle::Fatal(_) => FsState::Fatal,
        }
    }
}

struct PendingUnlink {
    op: UnlinkOp,
}

/// The filesystem driver. Owns the block device (through its sector cache)
/// and every piece of state a caller would otherwise have to thread through
/// by hand.
pub struct AfatFs<D: BlockDevice> {
    core: Core<D>,
    lifecycle: Lifecycle,
    mount: Option<MountDriver>,
    cwd: DirRoot,
    handles: [FileHandle; MAX_OPEN_FILES],
    pending_unlink: Option<PendingUnlink>,
}

impl<D: BlockDevice> AfatFs<D> {
    /// Constructs a driver around `device`, not yet mounted — call `init`
    /// (possibly several times) until it reports `Done`.
    pub fn new(device: D, config: Config) -> Self {
        let max_open_files = config.max_open_files.min(MAX_OPEN_FILES);
        let trace_sink = config.trace_sink;
        let mut config = config;
        config.max_open_files = max_open_files;
        AfatFs {
            core: Core {
                cache: SectorCache::new(device, trace_sink),
                geometry: VolumeGeometry::unmounted(),
                config,
                freefile_range: None,
                freefile_dir_location: None,
                last_alloc_cluster: 2,
                filesystem_full: false,
            },
            lifecycle: Lifecycle::Unknown,
            mount: None,
            cwd: DirRoot::Fat16Root,
            handles: core::array::from_fn(|_| FileHandle::closed()),
            pending_unlink: None,
        }
    }

    /// Drives the mount sequence (§4.13) forward by as much as the cache
    /// allows in one call. Call repeatedly (interleaved with `poll`, or via
    /// the device's own progress) until `Done`.
    pub fn init(&mut self) -> OpStatus<()> {
        if let Lifecycle::Fatal(e) = self.lifecycle {
            return OpStatus::Failed(e);
        }
        if matches!(self.lifecycle, Lifecycle::Ready) {
            return OpStatus::Done(());
        }
        self.lifecycle = Lifecycle::Initializing;
        let driver = self.mount.get_or_insert_with(MountDriver::new);
        match driver.step(&mut self.core) {
            OpStatus::InProgress => OpStatus::InProgress,
            OpStatus::Failed(e) => {
                if e.is_fatal() {
                    self.lifecycle = Lifecycle::Fatal(e);
                }
                OpStatus::Failed(e)
            }
            OpStatus::Done(outcome) => {
                self.core.geometry = outcome.geometry;
                self.core.freefile_range = Some(outcome.freefile_range);
                self.core.freefile_dir_location = Some(outcome.freefile_dir_location);
                self.mount = None;
                self.lifecycle = Lifecycle::Ready;
                self.cwd = if outcome.geometry.root_cluster != 0 {
                    DirRoot::Cluster(outcome.geometry.root_cluster)
                } else {
                    DirRoot::Fat16Root
                };
                OpStatus::Done(())
            }
        }
    }

    fn ready(&self) -> Result<(), AfatfsError> {
        match self.lifecycle {
            Lifecycle::Ready => Ok(()),
            Lifecycle::Fatal(e) => Err(e),
            Lifecycle::Unknown | Lifecycle::Initializing => Err(AfatfsError::NotReady),
        }
    }

    /// Advances the device by at most one completion and steps every busy
    /// handle (and any pending `funlink`) once. Callers that want a purely
    /// poll-driven loop call this repeatedly; callers happy with inline
    /// draining inside each operation rarely need to call it directly.
    pub fn poll(&mut self) {
        self.core.cache.poll_device();
        for handle in self.handles.iter_mut() {
            if handle.is_busy() {
                let _ = step_handle(&mut self.core, handle);
            }
        }
        if let Some(pending) = self.pending_unlink.as_mut() {
            match pending.op.step(&mut self.core) {
                OpStatus::InProgress => {}
                OpStatus::Done(()) | OpStatus::Failed(_) => {
                    self.pending_unlink = None;
                }
            }
        }
    }

    fn find_free_slot(&self) -> Option<usize> {
        self.handles
            .iter()
            .take(self.core.config.max_open_files)
            .position(|h| !h.is_open())
    }

    /// Resolves `root` (or the current directory if `None`) into a
    /// `DirRoot`, validating that a supplied handle really is a directory.
    fn resolve_dir(&self, dir: Option<FileId>) -> Result<DirRoot, AfatfsError> {
        match dir {
            None => Ok(self.cwd),
            Some(FileId(idx)) => {
                let handle = &self.handles[idx];
                match handle.kind {
                    FileKind::Directory => Ok(DirRoot::Cluster(handle.first_cluster)),
                    FileKind::Fat16Root => Ok(DirRoot::Fat16Root),
                    _ => Err(AfatfsError::NotADirectory),
                }
            }
        }
    }

    fn parent_cluster_of(&self, root: DirRoot) -> u32 {
        match root {
            DirRoot::Fat16Root => 0,
            DirRoot::Cluster(c) => c,
        }
    }

    /// Steps `idx`'s queued op to quiescence inline, also draining the
    /// cache's device completions as needed. Used by `fopen`/`fclose`/
    /// `fseek`/`mkdir`/`funlink` so ordinary cache-hit-speed work completes
    /// within the call instead of forcing the caller through `poll`.
    fn drain_handle(&mut self, idx: usize) -> OpStatus<()> {
        loop {
            match step_handle(&mut self.core, &mut self.handles[idx]) {
                OpStatus::InProgress => {
                    if self.core.cache.poll_device() == crate::cache::CachePollOutcome::Idle {
                        return OpStatus::InProgress;
                    }
                }
                other => return other,
            }
        }
    }

    fn drain_unlink(&mut self) -> OpStatus<()> {
        loop {
            let Some(pending) = self.pending_unlink.as_mut() else {
                return OpStatus::Done(());
            };
            match pending.op.step(&mut self.core) {
                OpStatus::InProgress => {
                    if self.core.cache.poll_device() == crate::cache::CachePollOutcome::Idle {
                        return OpStatus::InProgress;
                    }
                }
                OpStatus::Done(()) => {
                    self.pending_unlink = None;
                    return OpStatus::Done(());
                }
                OpStatus::Failed(e) => {
                    self.pending_unlink = None;
                    return OpStatus::Failed(e);
                }
            }
        }
    }

    /// Opens (or creates, per `mode`) `name` in `dir` (current directory if
    /// `None`). Handle-slot reservation happens synchronously; the actual
    /// directory scan/create work is driven to completion inline before
    /// returning, since nothing else can be done with a `FileId` whose open
    /// hasn't finished (§4.11, §6).
    pub fn fopen(&mut self, dir: Option<FileId>, name: &str, mode: &str) -> Result<FileId, AfatfsError> {
        self.ready()?;
        let open_mode = parse_mode(mode).ok_or(AfatfsError::InvalidName)?;
        let short_name = name_to_short(name).ok_or(AfatfsError::InvalidName)?;
        let root = self.resolve_dir(dir)?;
        let parent_cluster = self.parent_cluster_of(root);

        let idx = self.find_free_slot().ok_or(AfatfsError::TooManyOpenFiles)?;
        self.handles[idx] = FileHandle::closed();
        self.handles[idx].kind = FileKind::Pending;
        self.handles[idx].mode = open_mode;
        self.handles[idx].op = Some(FileOp::Open(OpenCreate::new(root, short_name, false, parent_cluster)));

        match self.drain_handle(idx) {
            OpStatus::Done(()) => Ok(FileId(idx)),
            OpStatus::Failed(e) => {
                self.handles[idx] = FileHandle::closed();
                Err(e)
            }
            OpStatus::InProgress => Ok(FileId(idx)),
        }
    }

    /// Creates a subdirectory named `name` in `dir` (current directory if
    /// `None`) and returns a handle already open on it (§4.11 tail).
    pub fn mkdir(&mut self, dir: Option<FileId>, name: &str) -> Result<FileId, AfatfsError> {
        self.ready()?;
        let short_name = name_to_short(name).ok_or(AfatfsError::InvalidName)?;
        let root = self.resolve_dir(dir)?;
        let parent_cluster = self.parent_cluster_of(root);

        let idx = self.find_free_slot().ok_or(AfatfsError::TooManyOpenFiles)?;
        self.handles[idx] = FileHandle::closed();
        self.handles[idx].kind = FileKind::Pending;
        self.handles[idx].mode = OpenMode::READ | OpenMode::CREATE;
        self.handles[idx].op = Some(FileOp::Open(OpenCreate::new(root, short_name, true, parent_cluster)));

        match self.drain_handle(idx) {
            OpStatus::Done(()) => Ok(FileId(idx)),
            OpStatus::Failed(e) => {
                self.handles[idx] = FileHandle::closed();
                Err(e)
            }
            OpStatus::InProgress => Ok(FileId(idx)),
        }
    }

    /// Re-persists the directory entry (regular files only) and releases
    /// any cache slot the handle held, then frees the slot (§4.12).
    pub fn fclose(&mut self, id: FileId) -> OpStatus<()> {
        let idx = id.0;
        if !self.handles[idx].is_open() {
            return OpStatus::Done(());
        }
        if self.handles[idx].is_busy() {
            return OpStatus::Failed(AfatfsError::HandleBusy);
        }
        self.handles[idx].op = Some(FileOp::Close(CloseOp::new()));
        self.drain_handle(idx)
    }

    /// Writes as much of `buf` as can be transferred without blocking.
    /// `Done(n)` with `n < buf.len()` means "call again" — not every byte
    /// made it this call (§4.9).
    pub fn fwrite(&mut self, id: FileId, buf: &[u8]) -> OpStatus<usize> {
        let idx = id.0;
        if !self.handles[idx].is_open() {
            return OpStatus::Failed(AfatfsError::NotFound);
        }
        if self.handles[idx].is_busy() {
            return OpStatus::InProgress;
        }
        write_file(&mut self.core, &mut self.handles[idx], buf)
    }

    /// Reads as much of `buf` as can be filled without blocking, clamped to
    /// the file's logical size (§4.9).
    pub fn fread(&mut self, id: FileId, buf: &mut [u8]) -> OpStatus<usize> {
        let idx = id.0;
        if !self.handles[idx].is_open() {
            return OpStatus::Failed(AfatfsError::NotFound);
        }
        if self.handles[idx].is_busy() {
            return OpStatus::InProgress;
        }
        read_file(&mut self.core, &mut self.handles[idx], buf)
    }

    /// Moves the cursor to `offset` interpreted according to `whence`
    /// (§4.8). Tries the O(1) fast path first, falling back to a full
    /// cluster-chain walk from the start of the file.
    pub fn fseek(&mut self, id: FileId, offset: i64, whence: SeekFrom) -> OpStatus<()> {
        let idx = id.0;
        if !self.handles[idx].is_open() {
            return OpStatus::Failed(AfatfsError::NotFound);
        }
        if self.handles[idx].is_busy() {
            return OpStatus::Failed(AfatfsError::HandleBusy);
        }

        let base = match whence {
            SeekFrom::Set => 0i64,
            SeekFrom::Cur => self.handles[idx].cursor_offset as i64,
            SeekFrom::End => self.handles[idx].file_size as i64,
        };
        let new_offset = base.saturating_add(offset).max(0) as u32;

        loop {
            match fseek_atomic(&mut self.core, &mut self.handles[idx], new_offset) {
                OpStatus::Done(true) => return OpStatus::Done(()),
                OpStatus::Done(false) => break,
                OpStatus::InProgress => {
                    if self.core.cache.poll_device() == crate::cache::CachePollOutcome::Idle {
                        return OpStatus::InProgress;
                    }
                }
                OpStatus::Failed(e) => return OpStatus::Failed(e),
            }
        }

        let first_cluster = self.handles[idx].first_cluster;
        let cluster_size = self.core.cluster_size();
        self.handles[idx].op = Some(FileOp::Seek(SeekWalk::new(first_cluster, new_offset, cluster_size)));
        match self.drain_handle(idx) {
            OpStatus::Done(()) => {
                self.handles[idx].cursor_offset = new_offset;
                OpStatus::Done(())
            }
            other => other,
        }
    }

    pub fn ftell(&self, id: FileId) -> u32 {
        self.handles[id.0].cursor()
    }

    pub fn feof(&self, id: FileId) -> bool {
        self.handles[id.0].is_eof()
    }

    pub fn file_size(&self, id: FileId) -> u32 {
        self.handles[id.0].file_size()
    }

    /// Removes `name` from `dir` (current directory if `None`), freeing its
    /// whole FAT chain. Driven by a single pending slot rather than the
    /// handle pool — `funlink` never requires the caller to hold the file
    /// open (§4.5 analogue for deletion; see the scenarios in SPEC_FULL.md
    /// §8 for the delete/retain tests this must satisfy).
    pub fn funlink(&mut self, dir: Option<FileId>, name: &str) -> OpStatus<()> {
        if let Err(e) = self.ready() {
            return OpStatus::Failed(e);
        }
        if self.pending_unlink.is_some() {
            return OpStatus::Failed(AfatfsError::HandleBusy);
        }
        let Some(short_name) = name_to_short(name) else {
            return OpStatus::Failed(AfatfsError::InvalidName);
        };
        let root = match self.resolve_dir(dir) {
            Ok(r) => r,
            Err(e) => return OpStatus::Failed(e),
        };
        self.pending_unlink = Some(PendingUnlink { op: UnlinkOp::new(root, short_name) });
        self.drain_unlink()
    }

    /// Changes the current working directory; `None` resets to the volume
    /// root.
    pub fn chdir(&mut self, dir: Option<FileId>) -> Result<(), AfatfsError> {
        self.ready()?;
        let root = self.resolve_dir(dir)?;
        self.cwd = root;
        Ok(())
    }

    /// `find_first`/`find_next` operate directly on a `DirRoot`, not a
    /// handle — enumerating a directory's entries does not require opening
    /// it first (§4.10).
    pub fn find_first(&self, dir: Option<DirRoot>) -> DirFinder {
        let root = dir.unwrap_or(self.cwd);
        DirFinder::find_first(&self.core, root)
    }

    pub fn find_next(&mut self, finder: &mut DirFinder) -> OpStatus<FindNextOutcome> {
        finder.find_next(&mut self.core)
    }

    pub fn cwd(&self) -> DirRoot {
        self.cwd
    }

    pub fn cluster_size(&self) -> u32 {
        self.core.cluster_size()
    }

    pub fn supercluster_size(&self) -> u32 {
        self.core.supercluster_size()
    }

    pub fn is_full(&self) -> bool {
        self.core.filesystem_full
    }

    /// Reports the driver's coarse lifecycle state (§3, §6 `getFilesystemState`).
    pub fn get_filesystem_state(&self) -> FsState {
        FsState::from(self.lifecycle)
    }

    /// Remaining clusters in the freefile's single contiguous run — the
    /// largest run a `ws`/`as` open could hand out without donating a
    /// partial supercluster (§4.7, §6 `getContiguousFreeSpace`).
    pub fn get_contiguous_free_space(&self) -> u32 {
        self.core
            .freefile_range
            .map(|r| r.cluster_count * self.core.cluster_size())
            .unwrap_or(0)
    }

    /// Starts (or continues) a write-back pass over every dirty cache slot.
    /// Returns `true` once nothing dirty remains.
    pub fn flush(&mut self) -> bool {
        self.core.cache.flush()
    }

    /// Consumes the driver, returning the underlying device. No implicit
    /// flush — callers that need dirty data persisted must `flush` first
    /// (§4.12/§9: this driver never flushes on a timer or on drop).
    pub fn destroy(self) -> D {
        self.core.cache.into_device()
    }
}
