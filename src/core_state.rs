//! Bundles the pieces every higher-level module (FAT navigator, directory
//! engine, file operations, freefile, mount driver) needs shared, mutable
//! access to: the cache, the volume geometry, and the allocator's rolling
//! state. Kept as one struct (rather than threading five separate
//! `&mut` parameters through every function) because nearly every
//! operation in this crate needs all of it.

use crate::cache::SectorCache;
use crate::config::Config;
use crate::device::BlockDevice;
use crate::layout::VolumeGeometry;

/// Inclusive-exclusive cluster range `[start, end)` currently owned by the
/// freefile, used by the FAT navigator to skip over it during a free-space
/// scan (§4.3) and by the supercluster-append state machine (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreefileRange {
    pub first_cluster: u32,
    pub cluster_count: u32,
}

impl FreefileRange {
    pub fn end(&self) -> u32 {
        self.first_cluster + self.cluster_count
    }

    pub fn contains(&self, cluster: u32) -> bool {
        cluster >= self.first_cluster && cluster < self.end()
    }
}

pub(crate) struct Core<D: BlockDevice> {
    pub cache: SectorCache<D>,
    pub geometry: VolumeGeometry,
    pub config: Config,
    /// `None` until the freefile has been located/created (§4.5) and until
    /// it has been fully drained to nothing.
    pub freefile_range: Option<FreefileRange>,
    /// Directory entry location of the freefile (cluster, sector, index),
    /// persisted whenever the range above changes (§4.5, §4.7).
    pub freefile_dir_location: Option<crate::dir::EntryLocation>,
    /// Cursor the free-cluster searcher resumes scanning from (§3 "last
    /// cluster allocated cursor").
    pub last_alloc_cluster: u32,
    pub filesystem_full: bool,
}

impl<D: BlockDevice> Core<D> {
    pub fn cluster_size(&self) -> u32 {
        self.geometry.cluster_size()
    }

    pub fn supercluster_size(&self) -> u32 {
        self.geometry.supercluster_size()
    }
}
