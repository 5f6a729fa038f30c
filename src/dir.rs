//! Directory engine (§4.10): cursor-based enumeration and entry
//! allocation, working over either a FAT16 fixed-size root or a normal
//! cluster-chain directory.

use crate::append::FreeClusterAppend;
use crate::cache::CacheFlags;
use crate::core_state::Core;
use crate::device::{BlockDevice, SectorBuf, SECTOR_SIZE};
use crate::dirent::{RawDirEntry, SlotKind, DIR_ENTRY_SIZE};
use crate::error::{AfatfsError, OpStatus};
use crate::fat::{get_next_cluster, FatEntry};

pub const ENTRIES_PER_SECTOR: usize = SECTOR_SIZE / DIR_ENTRY_SIZE;

/// Where a directory's entries live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirRoot {
    /// FAT16's fixed-size root: a flat run of sectors with no cluster
    /// chain and no ability to extend.
    Fat16Root,
    /// Any other directory (FAT32 root, or a subdirectory on either
    /// flavour): a normal cluster chain.
    Cluster(u32),
}

/// Absolute location of one on-disk 32-byte directory-entry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryLocation {
    pub sector: u32,
    pub index_in_sector: u16,
}

/// Enumeration cursor over a directory (§4.10 `find_first`/`find_next`).
pub struct DirFinder {
    root: DirRoot,
    current_cluster: u32,
    current_sector: u32,
    sector_offset_in_cluster: u32,
    entry_index: i32,
    at_end: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindNextOutcome {
    Entry(EntryLocation, RawDirEntry),
    EndOfDirectory,
}

impl DirFinder {
    /// `find_first` (§4.10): seeks to offset 0 and resets the entry index.
    pub fn find_first<D: BlockDevice>(core: &Core<D>, root: DirRoot) -> Self {
        let current_sector = match root {
            DirRoot::Fat16Root => core.geometry.root_dir_start_sector,
            DirRoot::Cluster(cluster) => core.geometry.cluster_to_sector(cluster),
        };
        DirFinder {
            root,
            current_cluster: match root {
                DirRoot::Fat16Root => 0,
                DirRoot::Cluster(c) => c,
            },
            current_sector,
            sector_offset_in_cluster: 0,
            entry_index: -1,
            at_end: false,
        }
    }

    fn advance_to_next_sector<D: BlockDevice>(&mut self, core: &mut Core<D>) -> OpStatus<bool> {
        match self.root {
            DirRoot::Fat16Root => {
                let bound = core.geometry.root_dir_start_sector + core.geometry.root_dir_sectors;
                self.current_sector += 1;
                if self.current_sector >= bound {
                    self.at_end = true;
                    return OpStatus::Done(false);
                }
                OpStatus::Done(true)
            }
            DirRoot::Cluster(_) => {
                self.sector_offset_in_cluster += 1;
                if self.sector_offset_in_cluster < core.geometry.sectors_per_cluster as u32 {
                    self.current_sector += 1;
                    return OpStatus::Done(true);
                }
                match get_next_cluster(core, self.current_cluster) {
                    OpStatus::InProgress => OpStatus::InProgress,
                    OpStatus::Failed(e) => OpStatus::Failed(e),
                    OpStatus::Done(FatEntry::Next(next)) => {
                        self.current_cluster = next;
                        self.sector_offset_in_cluster = 0;
                        self.current_sector = core.geometry.cluster_to_sector(next);
                        self.root = DirRoot::Cluster(next);
                        OpStatus::Done(true)
                    }
                    OpStatus::Done(FatEntry::EndOfChain) => {
                        self.at_end = true;
                        OpStatus::Done(false)
                    }
                    OpStatus::Done(FatEntry::Free) => OpStatus::Failed(AfatfsError::CacheInconsistent),
                }
            }
        }
    }

    /// Advances the cursor by exactly one 32-byte slot and classifies it,
    /// without interpreting what that classification means to the caller
    /// (that differs between enumeration and allocation — see
    /// `find_next`/`next_allocatable_slot` below). `Ok(None)` means the
    /// cursor ran off the directory's actual allocated end (FAT16 root
    /// bound, or end-of-chain) without ever decoding a terminator byte.
    fn advance_one_slot<D: BlockDevice>(
        &mut self,
        core: &mut Core<D>,
    ) -> OpStatus<Option<(EntryLocation, SlotKind)>> {
        if self.at_end {
            return OpStatus::Done(None);
        }

        if self.entry_index + 1 >= ENTRIES_PER_SECTOR as i32 || self.entry_index < 0 {
            if self.entry_index >= 0 {
                match self.advance_to_next_sector(core) {
                    OpStatus::InProgress => return OpStatus::InProgress,
                    OpStatus::Failed(e) => return OpStatus::Failed(e),
                    OpStatus::Done(false) => {
                        self.at_end = true;
                        return OpStatus::Done(None);
                    }
                    OpStatus::Done(true) => {}
                }
            }
            self.entry_index = 0;
        } else {
            self.entry_index += 1;
        }

        let slot = match core.cache.cache_sector(self.current_sector, CacheFlags::READ) {
            OpStatus::Done(s) => s,
            OpStatus::InProgress => return OpStatus::InProgress,
            OpStatus::Failed(e) => return OpStatus::Failed(e),
        };

        let offset = self.entry_index as usize * DIR_ENTRY_SIZE;
        let raw = &core.cache.buffer(slot)[offset..offset + DIR_ENTRY_SIZE];
        let kind = RawDirEntry::classify_slot(raw);
        let location = EntryLocation {
            sector: self.current_sector,
            index_in_sector: self.entry_index as u16,
        };
        OpStatus::Done(Some((location, kind)))
    }

    /// `find_next` (§4.10): returns an owned copy of the next live entry,
    /// skipping free slots, and signals end-of-directory at the terminator
    /// byte or at the actual end of the allocated directory, whichever
    /// comes first. Never hands back a borrowed cache pointer (see
    /// SPEC_FULL.md §9 on directory-entry ownership).
    pub fn find_next<D: BlockDevice>(&mut self, core: &mut Core<D>) -> OpStatus<FindNextOutcome> {
        loop {
            let step = match self.advance_one_slot(core) {
                OpStatus::Done(v) => v,
                OpStatus::InProgress => return OpStatus::InProgress,
                OpStatus::Failed(e) => return OpStatus::Failed(e),
            };
            let Some((location, kind)) = step else {
                return OpStatus::Done(FindNextOutcome::EndOfDirectory);
            };
            match kind {
                SlotKind::Terminator => {
                    self.at_end = true;
                    return OpStatus::Done(FindNextOutcome::EndOfDirectory);
                }
                SlotKind::Free => continue,
                SlotKind::Live => {
                    let slot = match core.cache.cache_sector(location.sector, CacheFlags::READ) {
                        OpStatus::Done(s) => s,
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                    };
                    let offset = location.index_in_sector as usize * DIR_ENTRY_SIZE;
                    let entry = RawDirEntry::parse(&core.cache.buffer(slot)[offset..offset + DIR_ENTRY_SIZE]);
                    return OpStatus::Done(FindNextOutcome::Entry(location, entry));
                }
            }
        }
    }

    /// Scan variant used by `allocate_directory_entry`: skips live entries
    /// and returns the first free slot *or* the first terminator slot
    /// (both are immediately writable); `Done(None)` only when the cursor
    /// ran off the directory's actual allocated end without ever seeing
    /// either, meaning the caller must extend (§4.10).
    fn next_allocatable_slot<D: BlockDevice>(
        &mut self,
        core: &mut Core<D>,
    ) -> OpStatus<Option<EntryLocation>> {
        loop {
            let step = match self.advance_one_slot(core) {
                OpStatus::Done(v) => v,
                OpStatus::InProgress => return OpStatus::InProgress,
                OpStatus::Failed(e) => return OpStatus::Failed(e),
            };
            let Some((location, kind)) = step else {
                return OpStatus::Done(None);
            };
            match kind {
                SlotKind::Terminator | SlotKind::Free => return OpStatus::Done(Some(location)),
                SlotKind::Live => continue,
            }
        }
    }

    pub fn current_cluster(&self) -> u32 {
        self.current_cluster
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocatePhase {
    Scanning,
    Zeroing { cluster: u32, sector_in_cluster: u32 },
}

/// `allocate_directory_entry` (§4.10): scans for a reusable free/terminator
/// slot, extending the directory with a fresh zeroed cluster if the scan
/// runs off the end without finding one. FAT16 roots cannot extend.
pub struct AllocateEntry {
    finder: DirFinder,
    phase: AllocatePhase,
    append: Option<FreeClusterAppend>,
}

impl AllocateEntry {
    pub fn new(finder: DirFinder) -> Self {
        AllocateEntry {
            finder,
            phase: AllocatePhase::Scanning,
            append: None,
        }
    }

    pub fn step<D: BlockDevice>(&mut self, core: &mut Core<D>) -> OpStatus<EntryLocation> {
        loop {
            match self.phase {
                AllocatePhase::Scanning => match self.finder.next_allocatable_slot(core) {
                    OpStatus::InProgress => return OpStatus::InProgress,
                    OpStatus::Failed(e) => return OpStatus::Failed(e),
                    OpStatus::Done(Some(location)) => {
                        return OpStatus::Done(location);
                    }
                    OpStatus::Done(None) => {
                        if matches!(self.finder.root, DirRoot::Fat16Root) {
                            return OpStatus::Failed(AfatfsError::DirectoryFull);
                        }
                        if self.append.is_none() {
                            self.append = Some(FreeClusterAppend::new(
                                Some(self.finder.current_cluster()),
                                core.last_alloc_cluster,
                            ));
                        }
                        let append = self.append.as_mut().expect("set above");
                        match append.step(core) {
                            OpStatus::InProgress => return OpStatus::InProgress,
                            OpStatus::Failed(e) => return OpStatus::Failed(e),
                            OpStatus::Done(new_cluster) => {
                                self.append = None;
                                self.phase = AllocatePhase::Zeroing {
                                    cluster: new_cluster,
                                    sector_in_cluster: 0,
                                };
                            }
                        }
                    }
                },
                AllocatePhase::Zeroing { cluster, sector_in_cluster } => {
                    if sector_in_cluster >= core.geometry.sectors_per_cluster as u32 {
                        self.finder = DirFinder::find_first(core, DirRoot::Cluster(cluster));
                        self.phase = AllocatePhase::Scanning;
                        continue;
                    }
                    let sector = core.geometry.cluster_to_sector(cluster) + sector_in_cluster;
                    let slot = match core.cache.cache_sector(sector, CacheFlags::WRITE) {
                        OpStatus::Done(s) => s,
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                    };
                    *core.cache.buffer_mut(slot) = [0u8; SECTOR_SIZE];
                    self.phase = AllocatePhase::Zeroing {
                        cluster,
                        sector_in_cluster: sector_in_cluster + 1,
                    };
                }
            }
        }
    }
}

/// Writes the 32 bytes of `entry` into the directory slot at `location`
/// and marks the cache sector dirty.
pub fn write_entry<D: BlockDevice>(
    core: &mut Core<D>,
    location: EntryLocation,
    entry: &RawDirEntry,
) -> OpStatus<()> {
    let slot = match core.cache.cache_sector(location.sector, CacheFlags::READ | CacheFlags::WRITE) {
        OpStatus::Done(s) => s,
        OpStatus::InProgress => return OpStatus::InProgress,
        OpStatus::Failed(e) => return OpStatus::Failed(e),
    };
    let offset = location.index_in_sector as usize * DIR_ENTRY_SIZE;
    let buf: &mut SectorBuf = core.cache.buffer_mut(slot);
    entry.write_into(&mut buf[offset..offset + DIR_ENTRY_SIZE]);
    OpStatus::Done(())
}

/// Marks the slot at `location` free (first byte 0xE5, with the KANJI
/// escape where needed) — used by `funlink`.
pub fn free_entry<D: BlockDevice>(core: &mut Core<D>, location: EntryLocation) -> OpStatus<()> {
    let slot = match core.cache.cache_sector(location.sector, CacheFlags::READ | CacheFlags::WRITE) {
        OpStatus::Done(s) => s,
        OpStatus::InProgress => return OpStatus::InProgress,
        OpStatus::Failed(e) => return OpStatus::Failed(e),
    };
    let offset = location.index_in_sector as usize * DIR_ENTRY_SIZE;
    core.cache.buffer_mut(slot)[offset] = crate::dirent::ENTRY_FREE;
    OpStatus::Done(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SectorCache;
    use crate::config::Config;
    use crate::dirent::attrs;
    use crate::layout::{derive_geometry, parse_bpb};
    use crate::testutil::RamDisk;

    fn test_core() -> Core<RamDisk> {
        let mut sector = [0u8; 512];
        sector[11..13].copy_from_slice(&512u16.to_le_bytes());
        sector[13] = 1;
        sector[14..16].copy_from_slice(&1u16.to_le_bytes());
        sector[16] = 2;
        sector[17..19].copy_from_slice(&16u16.to_le_bytes());
        sector[19..21].copy_from_slice(&4500u16.to_le_bytes());
        sector[22..24].copy_from_slice(&10u16.to_le_bytes());
        sector[510] = 0x55;
        sector[511] = 0xAA;
        let bpb = parse_bpb(&sector).unwrap();
        let geometry = derive_geometry(&bpb, 0).unwrap();
        Core {
            cache: SectorCache::new(RamDisk::new(512), None),
            geometry,
            config: Config::default(),
            freefile_range: None,
            freefile_dir_location: None,
            last_alloc_cluster: 2,
            filesystem_full: false,
        }
    }

    fn drain<T>(core: &mut Core<RamDisk>, mut f: impl FnMut(&mut Core<RamDisk>) -> OpStatus<T>) -> T {
        loop {
            match f(core) {
                OpStatus::Done(v) => return v,
                OpStatus::InProgress => {
                    core.cache.poll_device();
                }
                OpStatus::Failed(e) => panic!("{e}"),
            }
        }
    }

    #[test]
    fn empty_root_reports_end_of_directory_immediately() {
        let mut core = test_core();
        let mut finder = DirFinder::find_first(&core, DirRoot::Fat16Root);
        let outcome = drain(&mut core, |c| finder.find_next(c));
        assert_eq!(outcome, FindNextOutcome::EndOfDirectory);
    }

    #[test]
    fn allocate_then_find_roundtrips_entry() {
        let mut core = test_core();
        let finder = DirFinder::find_first(&core, DirRoot::Fat16Root);
        let mut allocator = AllocateEntry::new(finder);
        let location = drain(&mut core, |c| allocator.step(c));

        let entry = RawDirEntry::new(*b"README  TXT", attrs::ARCHIVE, 5, 1234);
        drain(&mut core, |c| write_entry(c, location, &entry));

        let mut finder = DirFinder::find_first(&core, DirRoot::Fat16Root);
        let outcome = drain(&mut core, |c| finder.find_next(c));
        match outcome {
            FindNextOutcome::Entry(loc, found) => {
                assert_eq!(loc, location);
                assert_eq!(found, entry);
            }
            FindNextOutcome::EndOfDirectory => panic!("expected the entry just written"),
        }
    }

    #[test]
    fn fat16_root_cannot_extend() {
        let mut core = test_core();
        // Fill every slot in the (tiny, 16-entry) root with a live entry.
        let total_slots = core.geometry.root_dir_sectors as usize * ENTRIES_PER_SECTOR;
        for i in 0..total_slots {
            let finder = DirFinder::find_first(&core, DirRoot::Fat16Root);
            let mut allocator = AllocateEntry::new(finder);
            let location = drain(&mut core, |c| allocator.step(c));
            let entry = RawDirEntry::new(*b"FILE0000TXT", attrs::ARCHIVE, 2, i as u32);
            drain(&mut core, |c| write_entry(c, location, &entry));
        }

        let finder = DirFinder::find_first(&core, DirRoot::Fat16Root);
        let mut allocator = AllocateEntry::new(finder);
        loop {
            match allocator.step(&mut core) {
                OpStatus::Failed(AfatfsError::DirectoryFull) => break,
                OpStatus::InProgress => {
                    core.cache.poll_device();
                }
                OpStatus::Done(_) => panic!("root directory should have been full"),
                OpStatus::Failed(e) => panic!("unexpected error {e}"),
            }
        }
    }
}
