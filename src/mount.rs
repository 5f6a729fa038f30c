//! Mount driver (§4.13): ReadMBR -> ReadVolumeID -> freefile
//! locate-or-create, in that order, parking at any step that returns
//! `InProgress` and resuming on the next `poll`.

use crate::cache::CacheFlags;
use crate::core_state::{Core, FreefileRange};
use crate::device::{BlockDevice, SECTOR_SIZE};
use crate::dir::DirRoot;
use crate::error::OpStatus;
use crate::freefile::FreefileInit;
use crate::layout::{derive_geometry, parse_bpb, parse_mbr, VolumeGeometry};

#[derive(Default)]
enum Phase {
    #[default]
    ReadMbr,
    ReadVolumeId {
        partition_start: u32,
    },
    Freefile {
        geometry: VolumeGeometry,
    },
}

pub struct MountDriver {
    phase: Phase,
    freefile: Option<FreefileInit>,
}

pub struct MountOutcome {
    pub geometry: VolumeGeometry,
    pub freefile_range: FreefileRange,
    pub freefile_dir_location: crate::dir::EntryLocation,
}

impl MountDriver {
    pub fn new() -> Self {
        MountDriver {
            phase: Phase::ReadMbr,
            freefile: None,
        }
    }

    /// Drives the mount forward. `core`'s `geometry` is a throwaway
    /// placeholder until `ReadVolumeId` completes, at which point the
    /// caller should replace it with `MountOutcome::geometry` — see
    /// `AfatFs::poll`'s mount branch.
    pub fn step<D: BlockDevice>(&mut self, core: &mut Core<D>) -> OpStatus<MountOutcome> {
        loop {
            match &self.phase {
                Phase::ReadMbr => {
                    let slot = match core.cache.cache_sector(0, CacheFlags::READ) {
                        OpStatus::Done(s) => s,
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                    };
                    let sector: &[u8; SECTOR_SIZE] = core.cache.buffer(slot);
                    let partition_start = match parse_mbr(sector) {
                        Ok(lba) => lba,
                        Err(e) => return OpStatus::Failed(e),
                    };
                    self.phase = Phase::ReadVolumeId { partition_start };
                }
                Phase::ReadVolumeId { partition_start } => {
                    let partition_start = *partition_start;
                    let slot = match core.cache.cache_sector(partition_start, CacheFlags::READ) {
                        OpStatus::Done(s) => s,
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                    };
                    let sector: &[u8; SECTOR_SIZE] = core.cache.buffer(slot);
                    let bpb = match parse_bpb(sector) {
                        Ok(bpb) => bpb,
                        Err(e) => return OpStatus::Failed(e),
                    };
                    let geometry = match derive_geometry(&bpb, partition_start) {
                        Ok(g) => g,
                        Err(e) => return OpStatus::Failed(e),
                    };
                    core.geometry = geometry;
                    self.phase = Phase::Freefile { geometry };
                }
                Phase::Freefile { geometry } => {
                    let geometry = *geometry;
                    let root = if geometry.root_cluster != 0 {
                        DirRoot::Cluster(geometry.root_cluster)
                    } else {
                        DirRoot::Fat16Root
                    };
                    let init = self.freefile.get_or_insert_with(|| FreefileInit::new(root));
                    match init.step(core) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(info) => {
                            core.freefile_range = Some(info.range);
                            core.freefile_dir_location = Some(info.location);
                            return OpStatus::Done(MountOutcome {
                                geometry,
                                freefile_range: info.range,
                                freefile_dir_location: info.location,
                            });
                        }
                    }
                }
            }
        }
    }
}

impl Default for MountDriver {
    fn default() -> Self {
        Self::new()
    }
}
