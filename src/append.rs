//! Free cluster append (§4.6): the generic "attach one more cluster to a
//! chain" state machine shared by regular file writes and directory
//! extension. Deliberately ignorant of directory entries — the caller is
//! responsible for persisting a file/directory's first-cluster field once
//! this returns `Done` with a fresh head (no previous cluster supplied).

use crate::core_state::Core;
use crate::device::BlockDevice;
use crate::error::{AfatfsError, OpStatus};
use crate::fat::{find_cluster_with_condition, set_next_cluster, FindCondition, FindOutcome, NextClusterValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    FindFreespace,
    TerminateNew,
    LinkPrevious,
}

/// Init -> FindFreespace -> UpdateFAT1 -> (UpdateFAT2, if extending a chain)
/// -> Complete (§4.6).
pub struct FreeClusterAppend {
    previous_cluster: Option<u32>,
    search_cursor: u32,
    /// Set once the forward scan has run off the end of the volume and
    /// restarted from cluster 2 (see `step`'s `NotFound` arm).
    wrapped: bool,
    new_cluster: u32,
    phase: Phase,
}

impl FreeClusterAppend {
    /// `previous_cluster` is `None` when this append is creating a brand
    /// new chain (the caller must then persist `new_cluster` as the first
    /// cluster itself); `search_start` seeds the scan, normally the
    /// volume's rolling allocation cursor.
    pub fn new(previous_cluster: Option<u32>, search_start: u32) -> Self {
        FreeClusterAppend {
            previous_cluster,
            search_cursor: search_start,
            wrapped: false,
            new_cluster: 0,
            phase: Phase::FindFreespace,
        }
    }

    pub fn step<D: BlockDevice>(&mut self, core: &mut Core<D>) -> OpStatus<u32> {
        loop {
            match self.phase {
                Phase::FindFreespace => {
                    match find_cluster_with_condition(core, FindCondition::FreeSector, &mut self.search_cursor) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(FindOutcome::NotFound) => {
                            // The rolling cursor only ever moves forward, so a file
                            // created early and deleted late leaves free clusters
                            // behind it that a pure forward scan would never see
                            // again. One wrap back to cluster 2 catches those before
                            // the volume is actually declared full.
                            if !self.wrapped {
                                self.wrapped = true;
                                self.search_cursor = 2;
                                continue;
                            }
                            core.filesystem_full = true;
                            return OpStatus::Failed(AfatfsError::VolumeFull);
                        }
                        OpStatus::Done(FindOutcome::Found(c)) => {
                            self.new_cluster = c;
                            self.phase = Phase::TerminateNew;
                        }
                    }
                }
                Phase::TerminateNew => {
                    match set_next_cluster(core, self.new_cluster, NextClusterValue::Terminate) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(()) => {
                            core.last_alloc_cluster = self.new_cluster;
                            if self.previous_cluster.is_some() {
                                self.phase = Phase::LinkPrevious;
                            } else {
                                return OpStatus::Done(self.new_cluster);
                            }
                        }
                    }
                }
                Phase::LinkPrevious => {
                    let previous = self.previous_cluster.expect("checked above");
                    match set_next_cluster(core, previous, NextClusterValue::Cluster(self.new_cluster)) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(()) => return OpStatus::Done(self.new_cluster),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::layout::VolumeGeometry;
    use crate::testutil::RamDisk;

    /// A `VolumeGeometry` built directly (bypassing `derive_geometry`'s
    /// 4085-cluster FAT16 floor) so these tests can exhaustively occupy
    /// every data cluster without looping thousands of times.
    fn tiny_geometry(total_clusters: u32) -> VolumeGeometry {
        VolumeGeometry {
            fat_type: crate::layout::FatType::Fat16,
            fat_start_sector: 1,
            sectors_per_fat: 1,
            num_fats: 1,
            sectors_per_cluster: 1,
            cluster_start_sector: 2,
            root_dir_sectors: 0,
            root_dir_start_sector: 0,
            root_cluster: 0,
            total_clusters,
            bytes_per_sector: 512,
        }
    }

    fn test_core(total_clusters: u32) -> Core<RamDisk> {
        Core {
            cache: crate::cache::SectorCache::new(RamDisk::new(16), None),
            geometry: tiny_geometry(total_clusters),
            config: Config::default(),
            freefile_range: None,
            freefile_dir_location: None,
            last_alloc_cluster: 2,
            filesystem_full: false,
        }
    }

    fn drain_append(core: &mut Core<RamDisk>, op: &mut FreeClusterAppend) -> Result<u32, AfatfsError> {
        loop {
            match op.step(core) {
                OpStatus::Done(c) => return Ok(c),
                OpStatus::InProgress => {
                    core.cache.poll_device();
                }
                OpStatus::Failed(e) => return Err(e),
            }
        }
    }

    #[test]
    fn starting_past_the_last_free_cluster_wraps_to_find_one_behind_it() {
        // Three data clusters (2, 3, 4); only the last is occupied, so the
        // forward pass starting there fails and the wrap-around pass
        // (restarting at 2) must be what actually finds cluster 2.
        let mut core = test_core(3);
        let last = core.geometry.last_cluster();
        drain_append_set(&mut core, last);

        let mut op = FreeClusterAppend::new(None, last);
        let found = drain_append(&mut core, &mut op).expect("wraparound scan should find cluster 2");
        assert_eq!(found, 2);
    }

    #[test]
    fn volume_genuinely_full_after_both_passes_miss() {
        // Two data clusters (2, 3), both occupied: neither the forward pass
        // nor the wrap-around pass has anywhere left to find.
        let mut core = test_core(2);
        let last = core.geometry.last_cluster();
        drain_append_set(&mut core, last);
        drain_append_set(&mut core, 2);

        let mut op = FreeClusterAppend::new(None, last);
        let err = drain_append(&mut core, &mut op).expect_err("both passes exhausted, no free cluster exists");
        assert_eq!(err, AfatfsError::VolumeFull);
        assert!(core.filesystem_full);
    }

    fn drain_append_set(core: &mut Core<RamDisk>, cluster: u32) {
        loop {
            match set_next_cluster(core, cluster, NextClusterValue::Terminate) {
                OpStatus::Done(()) => return,
                OpStatus::InProgress => {
                    core.cache.poll_device();
                }
                OpStatus::Failed(e) => panic!("{e}"),
            }
        }
    }
}
