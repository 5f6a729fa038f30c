//! Per-file operation state machines (§4.7-§4.12): open/create, seek,
//! supercluster append, close, and the subdirectory-init helper invoked
//! from `mkdir`. The cursor/mode/queued-op bookkeeping this module defines
//! is embedded directly in each slot of `AfatFs`'s fixed open-file pool
//! (see `crate::fs`).

use bitflags::bitflags;

use crate::append::FreeClusterAppend;
use crate::cache::CacheFlags;
use crate::core_state::{Core, FreefileRange};
use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::dir::{AllocateEntry, DirFinder, DirRoot, EntryLocation, FindNextOutcome};
use crate::dirent::{attrs, RawDirEntry};
use crate::error::{AfatfsError, OpStatus};
use crate::fat::{get_next_cluster, set_next_cluster, FatEntry, NextClusterValue};

bitflags! {
    /// §3 "File handle": mode bitset.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenMode: u16 {
        const READ             = 0b0000_0001;
        const WRITE            = 0b0000_0010;
        const APPEND           = 0b0000_0100;
        const CREATE           = 0b0000_1000;
        const CONTIGUOUS       = 0b0001_0000;
        const RETAIN_DIRECTORY = 0b0010_0000;
    }
}

/// Parses the mode strings of §6's table. Exact-match, not combinatorial —
/// the table only ever names these eight spellings.
pub fn parse_mode(mode: &str) -> Option<OpenMode> {
    use OpenMode as M;
    Some(match mode {
        "r" => M::READ,
        "w" => M::WRITE | M::CREATE,
        "a" => M::APPEND | M::CREATE,
        "r+" => M::READ | M::WRITE,
        "w+" => M::READ | M::WRITE | M::CREATE,
        "a+" => M::READ | M::APPEND | M::CREATE,
        "ws" => M::WRITE | M::CREATE | M::CONTIGUOUS | M::RETAIN_DIRECTORY,
        "as" => M::APPEND | M::CREATE | M::CONTIGUOUS | M::RETAIN_DIRECTORY,
        _ => return None,
    })
}

/// §3 "File handle": type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    /// Slot is unused.
    None,
    /// Slot is reserved but the open/create/close state machine has not
    /// yet reached a quiescent point.
    Pending,
    Normal,
    Directory,
    Fat16Root,
}

/// `whence` for `AfatFs::fseek`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Set,
    Cur,
    End,
}

/// One slot of the fixed open-file pool (§3 "File handle").
pub struct FileHandle {
    pub(crate) kind: FileKind,
    pub(crate) mode: OpenMode,
    pub(crate) cursor_offset: u32,
    /// 0 means "past the last allocated cluster" (§3 invariant).
    pub(crate) cursor_cluster: u32,
    pub(crate) previous_cluster: u32,
    pub(crate) first_cluster: u32,
    pub(crate) file_size: u32,
    pub(crate) locked_slot: Option<usize>,
    /// `None` for the FAT16 root, which has no directory entry of its own.
    pub(crate) dir_location: Option<EntryLocation>,
    pub(crate) dir_entry: RawDirEntry,
    pub(crate) retained_dir_sector: Option<usize>,
    pub(crate) op: Option<FileOp>,
}

impl FileHandle {
    pub(crate) const fn closed() -> Self {
        FileHandle {
            kind: FileKind::None,
            mode: OpenMode::empty(),
            cursor_offset: 0,
            cursor_cluster: 0,
            previous_cluster: 0,
            first_cluster: 0,
            file_size: 0,
            locked_slot: None,
            dir_location: None,
            dir_entry: RawDirEntry::EMPTY,
            retained_dir_sector: None,
            op: None,
        }
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.kind, FileKind::None)
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn is_busy(&self) -> bool {
        self.op.is_some()
    }

    pub fn file_size(&self) -> u32 {
        self.file_size
    }

    pub fn cursor(&self) -> u32 {
        self.cursor_offset
    }

    pub fn is_eof(&self) -> bool {
        self.cursor_offset >= self.file_size
    }
}

/// The one queued operation a busy handle may carry (§3 invariant: only
/// one at a time).
pub(crate) enum FileOp {
    Open(OpenCreate),
    Close(CloseOp),
    Seek(SeekWalk),
    AppendFree(FreeClusterAppend),
    AppendSuper(SuperClusterAppend),
}

/// Advances whatever operation `handle` has queued by exactly one step,
/// applying its result to the handle's fields on completion. Called from
/// `AfatFs::poll` for every busy slot, and inline (in a bounded loop) by
/// `fopen`/`fclose`/`fseek` so synchronous-feeling completions do not
/// force the caller through an external poll loop.
pub(crate) fn step_handle<D: BlockDevice>(core: &mut Core<D>, handle: &mut FileHandle) -> OpStatus<()> {
    let Some(op) = handle.op.take() else {
        return OpStatus::Done(());
    };
    match op {
        FileOp::Open(mut o) => match o.step(core, handle) {
            OpStatus::InProgress => {
                handle.op = Some(FileOp::Open(o));
                OpStatus::InProgress
            }
            OpStatus::Done(()) => OpStatus::Done(()),
            OpStatus::Failed(e) => {
                handle.kind = FileKind::None;
                OpStatus::Failed(e)
            }
        },
        FileOp::Close(mut o) => match o.step(core, handle) {
            OpStatus::InProgress => {
                handle.op = Some(FileOp::Close(o));
                OpStatus::InProgress
            }
            OpStatus::Done(()) => {
                handle.kind = FileKind::None;
                OpStatus::Done(())
            }
            OpStatus::Failed(e) => {
                handle.kind = FileKind::None;
                OpStatus::Failed(e)
            }
        },
        FileOp::Seek(mut walk) => match walk.step(core) {
            OpStatus::InProgress => {
                handle.op = Some(FileOp::Seek(walk));
                OpStatus::InProgress
            }
            OpStatus::Done((cluster, previous)) => {
                handle.cursor_cluster = cluster;
                handle.previous_cluster = previous;
                OpStatus::Done(())
            }
            OpStatus::Failed(e) => OpStatus::Failed(e),
        },
        FileOp::AppendFree(mut append) => match append.step(core) {
            OpStatus::InProgress => {
                handle.op = Some(FileOp::AppendFree(append));
                OpStatus::InProgress
            }
            OpStatus::Done(new_cluster) => {
                apply_append_result(handle, new_cluster);
                OpStatus::Done(())
            }
            OpStatus::Failed(e) => OpStatus::Failed(e),
        },
        FileOp::AppendSuper(mut append) => match append.step(core) {
            OpStatus::InProgress => {
                handle.op = Some(FileOp::AppendSuper(append));
                OpStatus::InProgress
            }
            OpStatus::Done(new_cluster) => {
                apply_append_result(handle, new_cluster);
                OpStatus::Done(())
            }
            OpStatus::Failed(e) => OpStatus::Failed(e),
        },
    }
}

fn apply_append_result(handle: &mut FileHandle, new_cluster: u32) {
    if handle.first_cluster == 0 {
        handle.first_cluster = new_cluster;
        handle.dir_entry.set_first_cluster(new_cluster);
    }
    handle.cursor_cluster = new_cluster;
}

// ---------------------------------------------------------------------
// §4.8 Seek
// ---------------------------------------------------------------------

/// Slow-path cluster walk (§4.8 `fseek_internal`): rewound to the file's
/// first cluster by the caller, then consumes whole clusters from
/// `remaining` one FAT lookup at a time. Yields `(cursor_cluster,
/// previous_cluster)`; `cursor_cluster == 0` if the target offset runs
/// past the last allocated cluster (cursor parked at end, per §3).
pub(crate) struct SeekWalk {
    remaining: u32,
    cluster: u32,
    previous: u32,
}

impl SeekWalk {
    pub fn new(first_cluster: u32, target_offset: u32, _cluster_size: u32) -> Self {
        SeekWalk {
            remaining: target_offset,
            cluster: first_cluster,
            previous: 0,
        }
    }

    pub fn step<D: BlockDevice>(&mut self, core: &mut Core<D>) -> OpStatus<(u32, u32)> {
        let cluster_size = core.cluster_size();
        loop {
            if self.cluster == 0 {
                return OpStatus::Done((0, self.previous));
            }
            if self.remaining < cluster_size {
                return OpStatus::Done((self.cluster, self.previous));
            }
            match get_next_cluster(core, self.cluster) {
                OpStatus::InProgress => return OpStatus::InProgress,
                OpStatus::Failed(e) => return OpStatus::Failed(e),
                OpStatus::Done(FatEntry::Next(next)) => {
                    self.previous = self.cluster;
                    self.cluster = next;
                    self.remaining -= cluster_size;
                }
                OpStatus::Done(FatEntry::EndOfChain) | OpStatus::Done(FatEntry::Free) => {
                    self.previous = self.cluster;
                    self.cluster = 0;
                    return OpStatus::Done((0, self.previous));
                }
            }
        }
    }
}

/// §4.8 `fseek_atomic`: the fast path. `Done(true)` means the move
/// completed synchronously; `Done(false)` means "try again" — the caller
/// must fall back to the slow path (`SeekWalk` rewound from the first
/// cluster).
pub(crate) fn fseek_atomic<D: BlockDevice>(
    core: &mut Core<D>,
    handle: &mut FileHandle,
    new_offset: u32,
) -> OpStatus<bool> {
    let bytes_per_sector = core.geometry.bytes_per_sector as u32;
    let cluster_size = core.cluster_size();

    let old_sector_in_cluster = handle.cursor_offset % cluster_size / bytes_per_sector;
    let new_sector_in_cluster = new_offset % cluster_size / bytes_per_sector;
    let same_cluster_span = new_offset / cluster_size == handle.cursor_offset / cluster_size;

    if same_cluster_span && old_sector_in_cluster == new_sector_in_cluster {
        handle.cursor_offset = new_offset;
        return OpStatus::Done(true);
    }
    if same_cluster_span
        && (matches!(handle.kind, FileKind::Fat16Root) || handle.mode.contains(OpenMode::CONTIGUOUS))
    {
        handle.cursor_offset = new_offset;
        return OpStatus::Done(true);
    }

    let old_cluster_index = handle.cursor_offset / cluster_size;
    let new_cluster_index = new_offset / cluster_size;
    if new_offset > handle.cursor_offset
        && new_cluster_index == old_cluster_index + 1
        && handle.cursor_cluster != 0
    {
        match get_next_cluster(core, handle.cursor_cluster) {
            OpStatus::InProgress => return OpStatus::InProgress,
            OpStatus::Failed(e) => return OpStatus::Failed(e),
            OpStatus::Done(FatEntry::Next(next)) => {
                handle.previous_cluster = handle.cursor_cluster;
                handle.cursor_cluster = next;
                handle.cursor_offset = new_offset;
                return OpStatus::Done(true);
            }
            OpStatus::Done(FatEntry::EndOfChain) | OpStatus::Done(FatEntry::Free) => {
                handle.previous_cluster = handle.cursor_cluster;
                handle.cursor_cluster = 0;
                handle.cursor_offset = new_offset;
                return OpStatus::Done(true);
            }
        }
    }

    OpStatus::Done(false)
}

// ---------------------------------------------------------------------
// §4.7 Supercluster append (contiguous mode)
// ---------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum SuperPhase {
    WritingChain,
    LinkPrevious,
    UpdateFreefileDirectory,
}

/// Steals the freefile's first supercluster whole, rewrites its FAT chain
/// so it terminates (the freefile's own chain runs straight through it
/// into the remainder of the freefile — see `FreefileInit`), links the
/// file's previous tail cluster into it if the file was non-empty, then
/// shrinks the freefile and re-persists its directory entry (§4.7).
pub(crate) struct SuperClusterAppend {
    phase: SuperPhase,
    stolen_start: u32,
    stolen_count: u32,
    cursor: u32,
    link_previous: Option<u32>,
    new_freefile_first: u32,
    new_freefile_count: u32,
}

impl SuperClusterAppend {
    pub fn new<D: BlockDevice>(
        core: &Core<D>,
        previous_last_cluster: Option<u32>,
    ) -> Result<Self, AfatfsError> {
        let range = core.freefile_range.ok_or(AfatfsError::VolumeFull)?;
        if range.cluster_count == 0 {
            return Err(AfatfsError::VolumeFull);
        }
        let per_supercluster = core.geometry.fat_entries_per_sector();
        let count = per_supercluster.min(range.cluster_count);
        Ok(SuperClusterAppend {
            phase: SuperPhase::WritingChain,
            stolen_start: range.first_cluster,
            stolen_count: count,
            cursor: range.first_cluster,
            link_previous: previous_last_cluster,
            new_freefile_first: range.first_cluster + count,
            new_freefile_count: range.cluster_count - count,
        })
    }

    pub fn step<D: BlockDevice>(&mut self, core: &mut Core<D>) -> OpStatus<u32> {
        loop {
            match self.phase {
                SuperPhase::WritingChain => {
                    let end = self.stolen_start + self.stolen_count;
                    if self.cursor + 1 >= end {
                        match set_next_cluster(core, self.cursor, NextClusterValue::Terminate) {
                            OpStatus::InProgress => return OpStatus::InProgress,
                            OpStatus::Failed(e) => return OpStatus::Failed(e),
                            OpStatus::Done(()) => {
                                self.phase = if self.link_previous.is_some() {
                                    SuperPhase::LinkPrevious
                                } else {
                                    SuperPhase::UpdateFreefileDirectory
                                };
                            }
                        }
                    } else {
                        let next = self.cursor + 1;
                        match set_next_cluster(core, self.cursor, NextClusterValue::Cluster(next)) {
                            OpStatus::InProgress => return OpStatus::InProgress,
                            OpStatus::Failed(e) => return OpStatus::Failed(e),
                            OpStatus::Done(()) => self.cursor = next,
                        }
                    }
                }
                SuperPhase::LinkPrevious => {
                    let previous = self.link_previous.expect("checked above");
                    match set_next_cluster(core, previous, NextClusterValue::Cluster(self.stolen_start)) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(()) => self.phase = SuperPhase::UpdateFreefileDirectory,
                    }
                }
                SuperPhase::UpdateFreefileDirectory => {
                    let location = core.freefile_dir_location.expect("set once freefile is mounted");
                    let size = self.new_freefile_count * core.cluster_size();
                    let mut entry = RawDirEntry::new(
                        crate::freefile::freefile_short_name(),
                        attrs::SYSTEM,
                        self.new_freefile_first,
                        size,
                    );
                    entry.set_first_cluster(self.new_freefile_first);
                    match crate::dir::write_entry(core, location, &entry) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(()) => {
                            core.freefile_range = Some(FreefileRange {
                                first_cluster: self.new_freefile_first,
                                cluster_count: self.new_freefile_count,
                            });
                            core.last_alloc_cluster = self.stolen_start;
                            return OpStatus::Done(self.stolen_start);
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// §4.11 Create / open state machine
// ---------------------------------------------------------------------

enum OpenPhase {
    FindFile,
    CreateNewFile(AllocateEntry),
    InitSubdir(InitSubdirOp),
    SeekToEnd(SeekWalk),
    /// `w`/`w+` opened an existing non-empty file: its old chain must be
    /// freed before the handle starts writing from offset 0 (§6 "truncate
    /// semantics are implied by Write without Append").
    Truncating { cursor: u32 },
    /// Terminal step shared by every success path: bumps the directory
    /// sector's retain-count for `RetainDirectory` mode before reporting
    /// `Done` (§4.11 "Success: if RetainDirectory mode, bump the
    /// retainCount on the directory sector").
    Finalizing,
}

pub(crate) struct OpenCreate {
    phase: OpenPhase,
    finder: Option<DirFinder>,
    root: DirRoot,
    short_name: [u8; 11],
    creating_directory: bool,
    parent_for_dotdot: u32,
}

impl OpenCreate {
    pub fn new(root: DirRoot, short_name: [u8; 11], creating_directory: bool, parent_for_dotdot: u32) -> Self {
        OpenCreate {
            phase: OpenPhase::FindFile,
            finder: None,
            root,
            short_name,
            creating_directory,
            parent_for_dotdot,
        }
    }

    pub fn step<D: BlockDevice>(&mut self, core: &mut Core<D>, handle: &mut FileHandle) -> OpStatus<()> {
        loop {
            match &mut self.phase {
                OpenPhase::FindFile => {
                    let finder = self.finder.get_or_insert_with(|| DirFinder::find_first(core, self.root));
                    match finder.find_next(core) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(FindNextOutcome::Entry(location, entry)) => {
                            if entry.matches_short_name(&self.short_name) {
                                if self.creating_directory {
                                    return OpStatus::Failed(AfatfsError::AlreadyExists);
                                }
                                self.apply_found_entry(core, handle, location, entry);
                                let truncate = handle.mode.contains(OpenMode::WRITE)
                                    && !handle.mode.contains(OpenMode::APPEND)
                                    && handle.file_size > 0;
                                if truncate {
                                    self.phase = OpenPhase::Truncating { cursor: handle.first_cluster };
                                } else if handle.mode.contains(OpenMode::APPEND) && handle.file_size > 0 {
                                    self.phase = OpenPhase::SeekToEnd(SeekWalk::new(
                                        handle.first_cluster,
                                        handle.file_size,
                                        core.cluster_size(),
                                    ));
                                } else {
                                    handle.cursor_cluster = handle.first_cluster;
                                    handle.cursor_offset = 0;
                                    self.phase = OpenPhase::Finalizing;
                                }
                            }
                            // not a match, keep scanning
                        }
                        OpStatus::Done(FindNextOutcome::EndOfDirectory) => {
                            if !handle.mode.contains(OpenMode::CREATE) {
                                return OpStatus::Failed(AfatfsError::NotFound);
                            }
                            let finder = self.finder.take().expect("set above");
                            self.phase = OpenPhase::CreateNewFile(AllocateEntry::new(finder));
                        }
                    }
                }
                OpenPhase::CreateNewFile(allocator) => match allocator.step(core) {
                    OpStatus::InProgress => return OpStatus::InProgress,
                    OpStatus::Failed(e) => return OpStatus::Failed(e),
                    OpStatus::Done(location) => {
                        let attributes = if self.creating_directory { attrs::DIRECTORY } else { attrs::ARCHIVE };
                        let entry = RawDirEntry::new(self.short_name, attributes, 0, 0);
                        match crate::dir::write_entry(core, location, &entry) {
                            OpStatus::InProgress => return OpStatus::InProgress,
                            OpStatus::Failed(e) => return OpStatus::Failed(e),
                            OpStatus::Done(()) => {
                                handle.dir_entry = entry;
                                handle.dir_location = Some(location);
                                handle.first_cluster = 0;
                                handle.file_size = 0;
                                handle.cursor_cluster = 0;
                                handle.cursor_offset = 0;
                                handle.kind =
                                    if self.creating_directory { FileKind::Directory } else { FileKind::Normal };
                                if self.creating_directory {
                                    self.phase = OpenPhase::InitSubdir(InitSubdirOp::new(0, self.parent_for_dotdot));
                                } else {
                                    self.phase = OpenPhase::Finalizing;
                                }
                            }
                        }
                    }
                },
                OpenPhase::InitSubdir(op) => match op.step(core) {
                    OpStatus::InProgress => return OpStatus::InProgress,
                    OpStatus::Failed(e) => return OpStatus::Failed(e),
                    OpStatus::Done(first_cluster) => {
                        handle.first_cluster = first_cluster;
                        handle.dir_entry.set_first_cluster(first_cluster);
                        handle.cursor_cluster = first_cluster;
                        handle.cursor_offset = 0;
                        let location = handle.dir_location.expect("set in CreateNewFile");
                        let entry = handle.dir_entry;
                        match crate::dir::write_entry(core, location, &entry) {
                            OpStatus::InProgress => return OpStatus::InProgress,
                            OpStatus::Failed(e) => return OpStatus::Failed(e),
                            OpStatus::Done(()) => self.phase = OpenPhase::Finalizing,
                        }
                    }
                },
                OpenPhase::SeekToEnd(walk) => match walk.step(core) {
                    OpStatus::InProgress => return OpStatus::InProgress,
                    OpStatus::Failed(e) => return OpStatus::Failed(e),
                    OpStatus::Done((cluster, previous)) => {
                        handle.cursor_cluster = cluster;
                        handle.previous_cluster = previous;
                        handle.cursor_offset = handle.file_size;
                        self.phase = OpenPhase::Finalizing;
                    }
                },
                OpenPhase::Truncating { cursor } => {
                    if *cursor == 0 {
                        handle.first_cluster = 0;
                        handle.previous_cluster = 0;
                        handle.cursor_cluster = 0;
                        handle.cursor_offset = 0;
                        handle.file_size = 0;
                        handle.dir_entry.set_first_cluster(0);
                        handle.dir_entry.file_size = 0;
                        let location = handle.dir_location.expect("set by apply_found_entry");
                        let entry = handle.dir_entry;
                        match crate::dir::write_entry(core, location, &entry) {
                            OpStatus::InProgress => return OpStatus::InProgress,
                            OpStatus::Failed(e) => return OpStatus::Failed(e),
                            OpStatus::Done(()) => self.phase = OpenPhase::Finalizing,
                        }
                        continue;
                    }
                    let freed = *cursor;
                    match get_next_cluster(core, freed) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(next_entry) => {
                            let next = match next_entry {
                                FatEntry::Next(n) => n,
                                FatEntry::EndOfChain | FatEntry::Free => 0,
                            };
                            match set_next_cluster(core, freed, NextClusterValue::Free) {
                                OpStatus::InProgress => return OpStatus::InProgress,
                                OpStatus::Failed(e) => return OpStatus::Failed(e),
                                OpStatus::Done(()) => {
                                    self.phase = OpenPhase::Truncating { cursor: next };
                                }
                            }
                        }
                    }
                }
                OpenPhase::Finalizing => {
                    if handle.mode.contains(OpenMode::RETAIN_DIRECTORY) && handle.retained_dir_sector.is_none() {
                        let location = handle.dir_location.expect("set on every open/create success path");
                        match core.cache.cache_sector(location.sector, CacheFlags::READ | CacheFlags::RETAIN) {
                            OpStatus::InProgress => return OpStatus::InProgress,
                            OpStatus::Failed(e) => return OpStatus::Failed(e),
                            OpStatus::Done(slot) => handle.retained_dir_sector = Some(slot),
                        }
                    }
                    return OpStatus::Done(());
                }
            }
        }
    }

    fn apply_found_entry<D: BlockDevice>(
        &self,
        _core: &Core<D>,
        handle: &mut FileHandle,
        location: EntryLocation,
        entry: RawDirEntry,
    ) {
        handle.dir_entry = entry;
        handle.dir_location = Some(location);
        handle.first_cluster = entry.first_cluster();
        handle.file_size = entry.file_size;
        handle.kind = if entry.is_directory() { FileKind::Directory } else { FileKind::Normal };
        // §3 invariant: Contiguous is cleared if Append opens a non-empty
        // file — its existing chain is not guaranteed freefile-donated.
        if handle.mode.contains(OpenMode::APPEND) && entry.file_size > 0 {
            handle.mode.remove(OpenMode::CONTIGUOUS);
        }
    }
}

// ---------------------------------------------------------------------
// §4.11 tail: InitSubdirectory
// ---------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum InitPhase {
    Append,
    Zeroing,
    WriteDotEntries,
}

/// Appends a cluster if the new directory has none yet, zeroes it, and
/// writes `.`/`..` entries into its first sector (§4.11 tail).
pub(crate) struct InitSubdirOp {
    phase: InitPhase,
    append: Option<FreeClusterAppend>,
    cluster: u32,
    zero_sector_idx: u32,
    parent_cluster: u32,
}

impl InitSubdirOp {
    pub fn new(existing_first_cluster: u32, parent_cluster: u32) -> Self {
        let phase = if existing_first_cluster == 0 { InitPhase::Append } else { InitPhase::Zeroing };
        InitSubdirOp {
            phase,
            append: None,
            cluster: existing_first_cluster,
            zero_sector_idx: 0,
            parent_cluster,
        }
    }

    pub fn step<D: BlockDevice>(&mut self, core: &mut Core<D>) -> OpStatus<u32> {
        loop {
            match self.phase {
                InitPhase::Append => {
                    let append = self
                        .append
                        .get_or_insert_with(|| FreeClusterAppend::new(None, core.last_alloc_cluster));
                    match append.step(core) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(new_cluster) => {
                            self.cluster = new_cluster;
                            self.append = None;
                            self.zero_sector_idx = 0;
                            self.phase = InitPhase::Zeroing;
                        }
                    }
                }
                InitPhase::Zeroing => {
                    if self.zero_sector_idx >= core.geometry.sectors_per_cluster as u32 {
                        self.phase = InitPhase::WriteDotEntries;
                        continue;
                    }
                    let sector = core.geometry.cluster_to_sector(self.cluster) + self.zero_sector_idx;
                    let slot = match core.cache.cache_sector(sector, CacheFlags::WRITE) {
                        OpStatus::Done(s) => s,
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                    };
                    *core.cache.buffer_mut(slot) = [0u8; SECTOR_SIZE];
                    self.zero_sector_idx += 1;
                }
                InitPhase::WriteDotEntries => {
                    let sector = core.geometry.cluster_to_sector(self.cluster);
                    let slot = match core.cache.cache_sector(sector, CacheFlags::READ | CacheFlags::WRITE) {
                        OpStatus::Done(s) => s,
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                    };
                    let dot = RawDirEntry::new(*b".          ", attrs::DIRECTORY, self.cluster, 0);
                    let dotdot = RawDirEntry::new(*b"..         ", attrs::DIRECTORY, self.parent_cluster, 0);
                    let buf = core.cache.buffer_mut(slot);
                    dot.write_into(&mut buf[0..32]);
                    dotdot.write_into(&mut buf[32..64]);
                    return OpStatus::Done(self.cluster);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// §4.12 Close
// ---------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum ClosePhase {
    SaveEntry,
}

/// Re-saves the directory entry with the logical size (regular files
/// only — directories never update their own size), unlocks any held
/// cache slot, and releases the directory-sector retain (§4.12).
pub(crate) struct CloseOp {
    phase: ClosePhase,
}

impl CloseOp {
    pub fn new() -> Self {
        CloseOp { phase: ClosePhase::SaveEntry }
    }

    pub fn step<D: BlockDevice>(&mut self, core: &mut Core<D>, handle: &mut FileHandle) -> OpStatus<()> {
        match self.phase {
            ClosePhase::SaveEntry => {
                if let (FileKind::Normal, Some(location)) = (handle.kind, handle.dir_location) {
                    handle.dir_entry.file_size = handle.file_size;
                    match crate::dir::write_entry(core, location, &handle.dir_entry) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(()) => {}
                    }
                }
                if let Some(slot) = handle.locked_slot.take() {
                    core.cache.unlock(slot);
                }
                if let Some(slot) = handle.retained_dir_sector.take() {
                    core.cache.release_retain(slot);
                }
                OpStatus::Done(())
            }
        }
    }
}

// ---------------------------------------------------------------------
// funlink
// ---------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq)]
enum UnlinkPhase {
    Finding,
    Freeing,
    MarkingFree,
}

/// `funlink`'s state machine: find the name in `root`, walk and free its
/// FAT chain cluster by cluster, then mark the directory slot free.
pub(crate) struct UnlinkOp {
    phase: UnlinkPhase,
    root: DirRoot,
    short_name: [u8; 11],
    finder: Option<DirFinder>,
    location: Option<EntryLocation>,
    cluster_cursor: u32,
}

impl UnlinkOp {
    pub fn new(root: DirRoot, short_name: [u8; 11]) -> Self {
        UnlinkOp {
            phase: UnlinkPhase::Finding,
            root,
            short_name,
            finder: None,
            location: None,
            cluster_cursor: 0,
        }
    }

    pub fn step<D: BlockDevice>(&mut self, core: &mut Core<D>) -> OpStatus<()> {
        loop {
            match self.phase {
                UnlinkPhase::Finding => {
                    let finder = self.finder.get_or_insert_with(|| DirFinder::find_first(core, self.root));
                    match finder.find_next(core) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(FindNextOutcome::Entry(location, entry)) => {
                            if entry.matches_short_name(&self.short_name) {
                                self.location = Some(location);
                                self.cluster_cursor = entry.first_cluster();
                                self.phase =
                                    if self.cluster_cursor == 0 { UnlinkPhase::MarkingFree } else { UnlinkPhase::Freeing };
                            }
                        }
                        OpStatus::Done(FindNextOutcome::EndOfDirectory) => {
                            return OpStatus::Failed(AfatfsError::NotFound);
                        }
                    }
                }
                UnlinkPhase::Freeing => {
                    if self.cluster_cursor == 0 {
                        self.phase = UnlinkPhase::MarkingFree;
                        continue;
                    }
                    let freed = self.cluster_cursor;
                    match get_next_cluster(core, freed) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(next_entry) => {
                            let next = match next_entry {
                                FatEntry::Next(n) => n,
                                FatEntry::EndOfChain | FatEntry::Free => 0,
                            };
                            match set_next_cluster(core, freed, NextClusterValue::Free) {
                                OpStatus::InProgress => return OpStatus::InProgress,
                                OpStatus::Failed(e) => return OpStatus::Failed(e),
                                OpStatus::Done(()) => self.cluster_cursor = next,
                            }
                        }
                    }
                }
                UnlinkPhase::MarkingFree => {
                    let location = self.location.expect("set in Finding");
                    match crate::dir::free_entry(core, location) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(()) => return OpStatus::Done(()),
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------
// §4.9 read/write loops (free functions; called from AfatFs)
// ---------------------------------------------------------------------

/// Copies as many bytes of `buf` into the file as can be transferred
/// without blocking, appending new clusters (queued on `handle.op` if an
/// append does not complete inline) as the cursor runs off the allocated
/// chain. Returns the count actually transferred — may be less than
/// `buf.len()` (§4.9; see SPEC_FULL.md on the short-write adaptation).
pub(crate) fn write_file<D: BlockDevice>(core: &mut Core<D>, handle: &mut FileHandle, buf: &[u8]) -> OpStatus<usize> {
    if handle.op.is_some() {
        return OpStatus::InProgress;
    }
    if !handle.mode.contains(OpenMode::WRITE) && !handle.mode.contains(OpenMode::APPEND) {
        return OpStatus::Failed(AfatfsError::PermissionDenied);
    }

    let bytes_per_sector = core.geometry.bytes_per_sector as u32;
    let cluster_size = core.cluster_size();
    let mut written = 0usize;

    while written < buf.len() {
        if handle.cursor_cluster == 0 {
            let op = if handle.mode.contains(OpenMode::CONTIGUOUS) {
                let previous = if handle.previous_cluster == 0 { None } else { Some(handle.previous_cluster) };
                match SuperClusterAppend::new(core, previous) {
                    Ok(op) => FileOp::AppendSuper(op),
                    Err(e) => return if written > 0 { OpStatus::Done(written) } else { OpStatus::Failed(e) },
                }
            } else {
                let previous = if handle.previous_cluster == 0 { None } else { Some(handle.previous_cluster) };
                FileOp::AppendFree(FreeClusterAppend::new(previous, core.last_alloc_cluster))
            };
            handle.op = Some(op);
            match step_handle(core, handle) {
                OpStatus::Done(()) => {}
                OpStatus::InProgress => return OpStatus::Done(written),
                OpStatus::Failed(e) => {
                    return if written > 0 { OpStatus::Done(written) } else { OpStatus::Failed(e) }
                }
            }
        }

        let offset_in_cluster = handle.cursor_offset % cluster_size;
        let sector = core.geometry.cluster_to_sector(handle.cursor_cluster) + offset_in_cluster / bytes_per_sector;
        let offset_in_sector = (offset_in_cluster % bytes_per_sector) as usize;

        let slot = match core.cache.cache_sector(sector, CacheFlags::WRITE | CacheFlags::LOCK) {
            OpStatus::Done(s) => s,
            OpStatus::InProgress => return OpStatus::Done(written),
            OpStatus::Failed(e) => return if written > 0 { OpStatus::Done(written) } else { OpStatus::Failed(e) },
        };
        if let Some(old) = handle.locked_slot.replace(slot) {
            if old != slot {
                core.cache.unlock(old);
            }
        }

        let space_in_sector = SECTOR_SIZE - offset_in_sector;
        let n = space_in_sector.min(buf.len() - written);
        core.cache.buffer_mut(slot)[offset_in_sector..offset_in_sector + n].copy_from_slice(&buf[written..written + n]);

        written += n;
        handle.cursor_offset += n as u32;
        handle.file_size = handle.file_size.max(handle.cursor_offset);

        if handle.cursor_offset % cluster_size == 0 {
            match get_next_cluster(core, handle.cursor_cluster) {
                OpStatus::Done(FatEntry::Next(next)) => {
                    handle.previous_cluster = handle.cursor_cluster;
                    handle.cursor_cluster = next;
                }
                OpStatus::Done(FatEntry::EndOfChain) | OpStatus::Done(FatEntry::Free) => {
                    handle.previous_cluster = handle.cursor_cluster;
                    handle.cursor_cluster = 0;
                }
                OpStatus::InProgress => return OpStatus::Done(written),
                OpStatus::Failed(e) => {
                    return if written > 0 { OpStatus::Done(written) } else { OpStatus::Failed(e) }
                }
            }
        }
    }

    // Optimistic directory-size writeback (§4.9): best-effort, not
    // required to complete here — `fclose` re-saves the final size.
    if let Some(location) = handle.dir_location {
        handle.dir_entry.file_size = handle.file_size;
        let _ = crate::dir::write_entry(core, location, &handle.dir_entry);
    }

    OpStatus::Done(written)
}

/// Copies as many bytes as can be transferred without blocking into
/// `buf`, clamped to the lesser of sector remainder and logical-size
/// remainder, advancing the cursor through FAT chains at cluster
/// boundaries (§4.9). A short read (fewer bytes than requested, short of
/// EOF) means the caller should retry after the next `poll`.
pub(crate) fn read_file<D: BlockDevice>(core: &mut Core<D>, handle: &mut FileHandle, buf: &mut [u8]) -> OpStatus<usize> {
    if handle.op.is_some() {
        return OpStatus::InProgress;
    }
    if !handle.mode.contains(OpenMode::READ) {
        return OpStatus::Failed(AfatfsError::PermissionDenied);
    }

    let bytes_per_sector = core.geometry.bytes_per_sector as u32;
    let cluster_size = core.cluster_size();
    let mut read = 0usize;

    while read < buf.len() {
        let remaining_in_file = handle.file_size.saturating_sub(handle.cursor_offset);
        if remaining_in_file == 0 || handle.cursor_cluster == 0 {
            break;
        }

        let offset_in_cluster = handle.cursor_offset % cluster_size;
        let sector = core.geometry.cluster_to_sector(handle.cursor_cluster) + offset_in_cluster / bytes_per_sector;
        let offset_in_sector = (offset_in_cluster % bytes_per_sector) as usize;

        let slot = match core.cache.cache_sector(sector, CacheFlags::READ | CacheFlags::LOCK) {
            OpStatus::Done(s) => s,
            OpStatus::InProgress => break,
            OpStatus::Failed(e) => return if read > 0 { OpStatus::Done(read) } else { OpStatus::Failed(e) },
        };
        if let Some(old) = handle.locked_slot.replace(slot) {
            if old != slot {
                core.cache.unlock(old);
            }
        }

        let space_in_sector = SECTOR_SIZE - offset_in_sector;
        let n = space_in_sector.min(buf.len() - read).min(remaining_in_file as usize);
        buf[read..read + n].copy_from_slice(&core.cache.buffer(slot)[offset_in_sector..offset_in_sector + n]);

        read += n;
        handle.cursor_offset += n as u32;

        if handle.cursor_offset % cluster_size == 0 {
            match get_next_cluster(core, handle.cursor_cluster) {
                OpStatus::Done(FatEntry::Next(next)) => {
                    handle.previous_cluster = handle.cursor_cluster;
                    handle.cursor_cluster = next;
                }
                OpStatus::Done(FatEntry::EndOfChain) | OpStatus::Done(FatEntry::Free) => {
                    handle.previous_cluster = handle.cursor_cluster;
                    handle.cursor_cluster = 0;
                }
                OpStatus::InProgress => break,
                OpStatus::Failed(e) => return if read > 0 { OpStatus::Done(read) } else { OpStatus::Failed(e) },
            }
        }
    }

    OpStatus::Done(read)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_table_matches_spec() {
        assert_eq!(parse_mode("r"), Some(OpenMode::READ));
        assert_eq!(parse_mode("w"), Some(OpenMode::WRITE | OpenMode::CREATE));
        assert_eq!(parse_mode("a"), Some(OpenMode::APPEND | OpenMode::CREATE));
        assert_eq!(parse_mode("r+"), Some(OpenMode::READ | OpenMode::WRITE));
        assert_eq!(parse_mode("w+"), Some(OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE));
        assert_eq!(parse_mode("a+"), Some(OpenMode::READ | OpenMode::APPEND | OpenMode::CREATE));
        assert!(parse_mode("as").unwrap().contains(OpenMode::CONTIGUOUS | OpenMode::RETAIN_DIRECTORY));
        assert!(parse_mode("ws").unwrap().contains(OpenMode::CONTIGUOUS | OpenMode::RETAIN_DIRECTORY));
        assert_eq!(parse_mode("bogus"), None);
    }

    #[test]
    fn fresh_handle_is_closed() {
        let h = FileHandle::closed();
        assert!(!h.is_open());
        assert!(!h.is_busy());
    }
}
