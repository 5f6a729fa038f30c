//! Free-space searcher (§4.4): alternates a FindHole phase and a GrowHole
//! phase to find the largest FAT-sector-aligned free run on the volume,
//! used once at mount time to size the freefile.

use crate::core_state::Core;
use crate::device::BlockDevice;
use crate::error::OpStatus;
use crate::fat::{find_cluster_with_condition, FindCondition, FindOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    FindHole,
    GrowHole,
}

/// Largest FAT-sector-aligned free run found so far.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BestGap {
    pub start: u32,
    pub length: u32,
}

/// Resumable scan state (§4.4). Call `step` repeatedly until it returns
/// `Done`.
pub struct FreeSpaceSearch {
    phase: Phase,
    candidate_start: u32,
    candidate_end: u32,
    best: BestGap,
}

impl FreeSpaceSearch {
    pub fn new(start_cluster: u32) -> Self {
        FreeSpaceSearch {
            phase: Phase::FindHole,
            candidate_start: start_cluster,
            candidate_end: start_cluster,
            best: BestGap::default(),
        }
    }

    /// Advances the search by as much as the cache allows this call.
    /// Returns `Done(best gap found)` once FindHole exhausts the volume.
    pub fn step<D: BlockDevice>(&mut self, core: &mut Core<D>) -> OpStatus<BestGap> {
        loop {
            match self.phase {
                Phase::FindHole => {
                    match find_cluster_with_condition(
                        core,
                        FindCondition::FreeSectorAtFatSectorBoundary,
                        &mut self.candidate_start,
                    ) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(FindOutcome::NotFound) => return OpStatus::Done(self.best),
                        OpStatus::Done(FindOutcome::Found(c)) => {
                            self.candidate_end = c;
                            self.phase = Phase::GrowHole;
                        }
                    }
                }
                Phase::GrowHole => {
                    match find_cluster_with_condition(
                        core,
                        FindCondition::OccupiedSector,
                        &mut self.candidate_end,
                    ) {
                        OpStatus::InProgress => return OpStatus::InProgress,
                        OpStatus::Failed(e) => return OpStatus::Failed(e),
                        OpStatus::Done(outcome) => {
                            let gap_end = match outcome {
                                FindOutcome::Found(c) => c,
                                FindOutcome::NotFound => core.geometry.last_cluster() + 1,
                            };
                            let length = gap_end - self.candidate_start;
                            if length > self.best.length {
                                self.best = BestGap {
                                    start: self.candidate_start,
                                    length,
                                };
                            }

                            let entries_per_sector = core.geometry.fat_entries_per_sector();
                            self.candidate_start = align_up(gap_end, entries_per_sector);
                            self.phase = Phase::FindHole;

                            if matches!(outcome, FindOutcome::NotFound) {
                                return OpStatus::Done(self.best);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    let rem = value % align;
    if rem == 0 {
        value
    } else {
        value + (align - rem)
    }
}
