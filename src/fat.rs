//! FAT navigator (§4.3).
//!
//! Reads and writes individual next-cluster pointers through the cache, and
//! scans forward for a cluster satisfying one of three conditions. All of
//! it is FAT-0 only — the mirror FAT is never read and is only ever updated
//! by copying FAT 0 across during a flush, never addressed cluster-by-
//! cluster (§4.3 "neither touches the second FAT mirror").

use crate::cache::CacheFlags;
use crate::core_state::Core;
use crate::device::BlockDevice;
use crate::error::{AfatfsError, OpStatus};

/// Decoded value of one FAT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatEntry {
    Free,
    Next(u32),
    EndOfChain,
}

/// What to write into a FAT entry (§4.3 `fatSetNextCluster`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextClusterValue {
    Terminate,
    Cluster(u32),
    Free,
}

fn read_raw_entry<D: BlockDevice>(core: &mut Core<D>, cluster: u32, discardable: bool) -> OpStatus<u32> {
    let (sector, offset) = core.geometry.fat_entry_location(cluster);
    let mut flags = CacheFlags::READ;
    if discardable {
        flags |= CacheFlags::DISCARDABLE;
    }
    let slot = match core.cache.cache_sector(sector, flags) {
        OpStatus::Done(s) => s,
        OpStatus::InProgress => return OpStatus::InProgress,
        OpStatus::Failed(e) => return OpStatus::Failed(e),
    };
    let bytes = core.cache.buffer(slot);
    let raw = match core.geometry.fat_type.bytes_per_entry() {
        2 => u16::from_le_bytes([bytes[offset], bytes[offset + 1]]) as u32,
        4 => {
            u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
                & 0x0FFF_FFFF
        }
        _ => unreachable!("bytes_per_entry is always 2 or 4"),
    };
    OpStatus::Done(raw)
}

/// Reads the next-cluster pointer for `cluster` (§4.3 `fatGetNextCluster`).
pub fn get_next_cluster<D: BlockDevice>(core: &mut Core<D>, cluster: u32) -> OpStatus<FatEntry> {
    read_raw_entry(core, cluster, false).map(|raw| {
        if core.geometry.fat_type.is_free(raw) {
            FatEntry::Free
        } else if core.geometry.fat_type.is_eoc(raw) {
            FatEntry::EndOfChain
        } else {
            FatEntry::Next(raw)
        }
    })
}

/// Writes the next-cluster pointer for `cluster` (§4.3 `fatSetNextCluster`).
/// A read-modify-write against the already-cached sector; completes in one
/// call once the sector is resident, since the only device round trip is
/// the cache's own read.
pub fn set_next_cluster<D: BlockDevice>(
    core: &mut Core<D>,
    cluster: u32,
    value: NextClusterValue,
) -> OpStatus<()> {
    let (sector, offset) = core.geometry.fat_entry_location(cluster);
    let slot = match core.cache.cache_sector(sector, CacheFlags::READ | CacheFlags::WRITE) {
        OpStatus::Done(s) => s,
        OpStatus::InProgress => return OpStatus::InProgress,
        OpStatus::Failed(e) => return OpStatus::Failed(e),
    };

    let raw = match value {
        NextClusterValue::Terminate => core.geometry.fat_type.eoc_marker(),
        NextClusterValue::Cluster(c) => c,
        NextClusterValue::Free => 0,
    };

    let bytes = core.cache.buffer_mut(slot);
    match core.geometry.fat_type.bytes_per_entry() {
        2 => bytes[offset..offset + 2].copy_from_slice(&(raw as u16).to_le_bytes()),
        4 => {
            // Top 4 bits of a FAT32 entry are reserved; this driver always
            // writes them as zero (§5 "preserve-on-read, zero-on-write").
            bytes[offset..offset + 4].copy_from_slice(&(raw & 0x0FFF_FFFF).to_le_bytes());
        }
        _ => unreachable!(),
    }
    OpStatus::Done(())
}

/// Selects which clusters `find_cluster_with_condition` reports, and how
/// far it advances the cursor between candidates (§4.3, §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindCondition {
    FreeSector,
    OccupiedSector,
    /// Only evaluates clusters that sit at a FAT-sector boundary, advancing
    /// by a whole FAT sector's worth of entries between candidates. Used by
    /// the FindHole phase of the free-space searcher (§4.4).
    FreeSectorAtFatSectorBoundary,
}

impl FindCondition {
    fn step(self, entries_per_sector: u32) -> u32 {
        match self {
            FindCondition::FreeSector | FindCondition::OccupiedSector => 1,
            FindCondition::FreeSectorAtFatSectorBoundary => entries_per_sector,
        }
    }

    fn matches(self, entry: u32, fat_type: crate::layout::FatType) -> bool {
        match self {
            FindCondition::FreeSector | FindCondition::FreeSectorAtFatSectorBoundary => {
                fat_type.is_free(entry)
            }
            FindCondition::OccupiedSector => !fat_type.is_free(entry),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindOutcome {
    Found(u32),
    NotFound,
}

/// Upper bound on cache-hit iterations performed within a single call, so a
/// scan over an entirely already-cached FAT region still yields control
/// back to the caller's poll loop periodically instead of running to
/// completion in one shot (§3 "never blocks").
const MAX_STEPS_PER_CALL: u32 = 64;

/// Scans forward from `*cursor` (inclusive) for a cluster matching
/// `condition`, skipping over the freefile's range entirely when one is
/// allocated (§4.3, §4.5). `*cursor` is advanced in place; on `InProgress`
/// the next call resumes exactly where this one left off, on `Found` it
/// holds the matching cluster, and on `NotFound` it holds one past the
/// last cluster scanned.
pub fn find_cluster_with_condition<D: BlockDevice>(
    core: &mut Core<D>,
    condition: FindCondition,
    cursor: &mut u32,
) -> OpStatus<FindOutcome> {
    let last = core.geometry.last_cluster();
    let entries_per_sector = core.geometry.fat_entries_per_sector();

    for _ in 0..MAX_STEPS_PER_CALL {
        if *cursor > last {
            return OpStatus::Done(FindOutcome::NotFound);
        }

        if let Some(range) = core.freefile_range {
            if range.contains(*cursor) {
                *cursor = range.end();
                continue;
            }
        }

        let entry = match read_raw_entry(core, *cursor, true) {
            OpStatus::Done(v) => v,
            OpStatus::InProgress => return OpStatus::InProgress,
            OpStatus::Failed(e) => return OpStatus::Failed(e),
        };

        if condition.matches(entry, core.geometry.fat_type) {
            return OpStatus::Done(FindOutcome::Found(*cursor));
        }
        *cursor += condition.step(entries_per_sector);
    }

    OpStatus::InProgress
}

/// Fatal helper: both FAT entry reads and the boundary sanity check share
/// this. Any cluster number outside `[2, last_cluster]` reaching here is a
/// programming error in a higher layer, not a recoverable condition.
pub fn assert_valid_cluster<D: BlockDevice>(core: &Core<D>, cluster: u32) -> Result<(), AfatfsError> {
    if cluster < 2 || cluster > core.geometry.last_cluster() {
        return Err(AfatfsError::CacheInconsistent);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::layout::{derive_geometry, parse_bpb, VolumeGeometry};
    use crate::testutil::RamDisk;

    fn small_fat16_geometry() -> VolumeGeometry {
        let mut sector = [0u8; 512];
        sector[11..13].copy_from_slice(&512u16.to_le_bytes());
        sector[13] = 1; // sectors per cluster
        sector[14..16].copy_from_slice(&1u16.to_le_bytes());
        sector[16] = 2;
        sector[17..19].copy_from_slice(&16u16.to_le_bytes());
        sector[19..21].copy_from_slice(&4500u16.to_le_bytes());
        sector[22..24].copy_from_slice(&10u16.to_le_bytes());
        sector[510] = 0x55;
        sector[511] = 0xAA;
        let bpb = parse_bpb(&sector).unwrap();
        derive_geometry(&bpb, 0).unwrap()
    }

    fn test_core() -> Core<RamDisk> {
        Core {
            cache: crate::cache::SectorCache::new(RamDisk::new(512), None),
            geometry: small_fat16_geometry(),
            config: Config::default(),
            freefile_range: None,
            freefile_dir_location: None,
            last_alloc_cluster: 2,
            filesystem_full: false,
        }
    }

    fn drain<T: Clone>(core: &mut Core<RamDisk>, mut f: impl FnMut(&mut Core<RamDisk>) -> OpStatus<T>) -> T {
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
    fn fresh_cluster_reads_as_free() {
        let mut core = test_core();
        let entry = drain(&mut core, |c| get_next_cluster(c, 2));
        assert_eq!(entry, FatEntry::Free);
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut core = test_core();
        drain(&mut core, |c| set_next_cluster(c, 2, NextClusterValue::Cluster(9)));
        let entry = drain(&mut core, |c| get_next_cluster(c, 2));
        assert_eq!(entry, FatEntry::Next(9));
    }

    #[test]
    fn terminate_reads_back_as_end_of_chain() {
        let mut core = test_core();
        drain(&mut core, |c| set_next_cluster(c, 5, NextClusterValue::Terminate));
        assert_eq!(drain(&mut core, |c| get_next_cluster(c, 5)), FatEntry::EndOfChain);
    }

    #[test]
    fn find_free_sector_finds_first_untouched_cluster() {
        let mut core = test_core();
        drain(&mut core, |c| set_next_cluster(c, 2, NextClusterValue::Terminate));
        let mut cursor = 2;
        let outcome = drain(&mut core, |c| {
            find_cluster_with_condition(c, FindCondition::FreeSector, &mut cursor)
        });
        assert_eq!(outcome, FindOutcome::Found(3));
    }

    #[test]
    fn find_skips_over_freefile_range() {
        let mut core = test_core();
        core.freefile_range = Some(crate::core_state::FreefileRange {
            first_cluster: 2,
            cluster_count: 10,
        });
        let mut cursor = 2;
        let outcome = drain(&mut core, |c| {
            find_cluster_with_condition(c, FindCondition::FreeSector, &mut cursor)
        });
        assert_eq!(outcome, FindOutcome::Found(12));
    }
}
