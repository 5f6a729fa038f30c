//! Freefile locate-or-create (§4.5): at mount, finds or creates
//! `FREESPAC.E` in the root directory and, if freshly created, sizes it
//! from the largest free run on the volume.

use crate::core_state::{Core, FreefileRange};
use crate::device::BlockDevice;
use crate::dir::{write_entry, AllocateEntry, DirFinder, DirRoot, EntryLocation, FindNextOutcome};
use crate::dirent::{attrs, RawDirEntry};
use crate::error::{AfatfsError, OpStatus};
use crate::fat::{set_next_cluster, NextClusterValue};
use crate::freespace::FreeSpaceSearch;
use crate::layout::name_to_short;

/// `FREESPAC.E`'s canonical 8.3 name, fixed by convention (§4.5).
pub fn freefile_short_name() -> [u8; 11] {
    name_to_short("FREESPAC.E").expect("FREESPAC.E fits the 8.3 mapping")
}

#[derive(Default)]
enum Phase {
    #[default]
    Locating,
    Allocating,
    Searching,
    WritingChain,
    SavingEntry,
}

pub struct FreefileInit {
    phase: Phase,
    root: DirRoot,
    finder: Option<DirFinder>,
    allocator: Option<AllocateEntry>,
    search: Option<FreeSpaceSearch>,
    entry_location: Option<EntryLocation>,
    entry: RawDirEntry,
    chain_cursor: u32,
    chain_start: u32,
    chain_count: u32,
}

/// Result of a completed freefile init: the range it now owns, and where
/// its directory entry lives (needed later by §4.7's directory writeback).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreefileInfo {
    pub range: FreefileRange,
    pub location: EntryLocation,
}

impl FreefileInit {
    /// `root` is the volume's root directory: a fixed FAT16 region, or a
    /// FAT32 cluster chain (§4.5 applies identically either way through
    /// `DirRoot`).
    pub fn new(root: DirRoot) -> Self {
        FreefileInit {
            phase: Phase::Locating,
            root,
            finder: None,
            allocator: None,
            search: None,
            entry_location: None,
            entry: RawDirEntry::EMPTY,
            chain_cursor: 0,
            chain_start: 0,
            chain_count: 0,
        }
    }

    pub fn step<D: BlockDevice>(&mut self, core: &mut Core<D>) -> OpStatus<FreefileInfo> {
        let short_name = freefile_short_name();
        loop {
            match self.phase {
                Phase::Locating => {
                    let root = self.root;
                    let finder = self.finder.get_or_insert_with(|| DirFinder::find_first(core, root));
                    match finder.find_next(core) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(FindNextOutcome::Entry(location, entry)) => {
                            if entry.matches_short_name(&short_name) {
                                self.entry_location = Some(location);
                                self.entry = entry;
                                if entry.file_size == 0 {
                                    self.phase = Phase::Searching;
                                } else {
                                    self.chain_start = entry.first_cluster();
                                    let total_clusters = entry.file_size / core.cluster_size();
                                    return OpStatus::Done(FreefileInfo {
                                        range: FreefileRange {
                                            first_cluster: self.chain_start,
                                            cluster_count: total_clusters,
                                        },
                                        location,
                                    });
                                }
                            }
                            // not our entry, keep scanning
                        }
                        OpStatus::Done(FindNextOutcome::EndOfDirectory) => {
                            self.phase = Phase::Allocating;
                        }
                    }
                }
                Phase::Allocating => {
                    let root = self.root;
                    let allocator = self
                        .allocator
                        .get_or_insert_with(|| AllocateEntry::new(DirFinder::find_first(core, root)));
                    match allocator.step(core) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(location) => {
                            self.entry = RawDirEntry::new(short_name, attrs::SYSTEM, 0, 0);
                            self.entry_location = Some(location);
                            self.allocator = None;
                            self.phase = Phase::Searching;
                        }
                    }
                }
                Phase::Searching => {
                    let search = self.search.get_or_insert_with(|| FreeSpaceSearch::new(2));
                    match search.step(core) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(gap) => {
                            let leave = core.config.freefile_leave_clusters;
                            let usable = gap.length.saturating_sub(leave);
                            let entries_per_sector = core.geometry.fat_entries_per_sector();
                            let supercluster_count = usable / entries_per_sector;
                            self.chain_start = gap.start;
                            self.chain_count = supercluster_count * entries_per_sector;
                            self.chain_cursor = gap.start;
                            self.search = None;
                            self.phase = Phase::WritingChain;
                        }
                    }
                }
                Phase::WritingChain => {
                    if self.chain_count == 0 {
                        self.phase = Phase::SavingEntry;
                        continue;
                    }
                    let end = self.chain_start + self.chain_count;
                    if self.chain_cursor + 1 >= end {
                        match set_next_cluster(core, self.chain_cursor, NextClusterValue::Terminate) {
                            OpStatus::InProgress => return OpStatus::InProgress,
                            OpStatus::Failed(e) => return OpStatus::Failed(e),
                            OpStatus::Done(()) => {
                                self.phase = Phase::SavingEntry;
                            }
                        }
                    } else {
                        let next = self.chain_cursor + 1;
                        match set_next_cluster(core, self.chain_cursor, NextClusterValue::Cluster(next)) {
                            OpStatus::InProgress => return OpStatus::InProgress,
                            OpStatus::Failed(e) => return OpStatus::Failed(e),
                            OpStatus::Done(()) => {
                                self.chain_cursor = next;
                            }
                        }
                    }
                }
                Phase::SavingEntry => {
                    let location = self.entry_location.expect("set before reaching here");
                    let size = self.chain_count * core.cluster_size();
                    self.entry.set_first_cluster(self.chain_start);
                    self.entry.file_size = size;
                    match write_entry(core, location, &self.entry) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(()) => {
                            if self.chain_count == 0 {
                                return OpStatus::Failed(AfatfsError::VolumeFull);
                            }
                            return OpStatus::Done(FreefileInfo {
                                range: FreefileRange {
                                    first_cluster: self.chain_start,
                                    cluster_count: self.chain_count,
                                },
                                location,
                            });
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SectorCache;
    use crate::config::Config;
    use crate::layout::{derive_geometry, parse_bpb};
    use crate::testutil::RamDisk;

    fn test_core() -> Core<RamDisk> {
        let mut sector = [0u8; 512];
        sector[11..13].copy_from_slice(&512u16.to_le_bytes());
        sector[13] = 1;
        sector[14..16].copy_from_slice(&1u16.to_le_bytes());
        sector[16] = 2;
        sector[17..19].copy_from_slice(&64u16.to_le_bytes());
        sector[19..21].copy_from_slice(&4500u16.to_le_bytes());
        sector[22..24].copy_from_slice(&10u16.to_le_bytes());
        sector[510] = 0x55;
        sector[511] = 0xAA;
        let bpb = parse_bpb(&sector).unwrap();
        let geometry = derive_geometry(&bpb, 0).unwrap();
        Core {
            cache: SectorCache::new(RamDisk::new(512), None),
            geometry,
            config: Config {
                freefile_leave_clusters: 4,
                ..Config::default()
            },
            freefile_range: None,
            freefile_dir_location: None,
            last_alloc_cluster: 2,
            filesystem_full: false,
        }
    }

    fn drain(core: &mut Core<RamDisk>, init: &mut FreefileInit) -> FreefileInfo {
        loop {
            match init.step(core) {
                OpStatus::Done(v) => return v,
                OpStatus::InProgress => {
                    core.cache.poll_device();
                }
                OpStatus::Failed(e) => panic!("{e}"),
            }
        }
    }

    #[test]
    fn creates_freefile_on_fresh_volume() {
        let mut core = test_core();
        let mut init = FreefileInit::new(DirRoot::Fat16Root);
        let info = drain(&mut core, &mut init);
        assert!(info.range.cluster_count > 0);
        assert_eq!(info.range.first_cluster, 2);
    }

    #[test]
    fn reuses_existing_nonzero_freefile() {
        let mut core = test_core();
        let mut init = FreefileInit::new(DirRoot::Fat16Root);
        let first = drain(&mut core, &mut init);

        // Re-run against the same volume: the entry now has non-zero size
        // and should be trusted as-is rather than re-searched.
        let mut init2 = FreefileInit::new(DirRoot::Fat16Root);
        let second = drain(&mut core, &mut init2);
        assert_eq!(first.range, second.range);
    }
}
