//! Sector cache (§3 "Sector cache slot", §4.2).
//!
//! A fixed pool of [`CACHE_SLOTS`] stack-resident sector buffers with an
//! explicit state machine per slot. This is the module everything else in
//! the crate funnels through: the FAT navigator, the directory engine and
//! every file operation state machine read and write the medium only by
//! asking the cache for a slot and getting back `InProgress` or a slot
//! index. No heap allocation happens here — the buffers are a
//! `[SectorBuf; CACHE_SLOTS]` array owned by the cache, matching the
//! teacher's own preference for stack/static buffers over `Vec` on the hot
//! path (see `lib.rs`'s `cluster_buf` in the original `read_cluster`).

use bitflags::bitflags;

use crate::device::{BlockDevice, Completion, DeviceOp, SectorBuf, SECTOR_SIZE};
use crate::error::{AfatfsError, OpStatus};
use crate::trace::trace_cache;

/// Fixed pool size (§3 "Global filesystem state": "N=8 sector slots").
pub const CACHE_SLOTS: usize = 8;

/// Sector 0 (the MBR) is never a legal cache-write target (§4.2).
const MBR_SECTOR: u32 = 0;

bitflags! {
    /// Intent flags for [`SectorCache::cache_sector`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct CacheFlags: u16 {
        const READ        = 0b0000_0001;
        const WRITE       = 0b0000_0010;
        const LOCK        = 0b0000_0100;
        const UNLOCK      = 0b0000_1000;
        const DISCARDABLE = 0b0001_0000;
        const RETAIN      = 0b0010_0000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Empty,
    Reading,
    InSync,
    Dirty,
    Writing,
}

struct CacheSlot {
    sector: Option<u32>,
    state: SlotState,
    last_use: u64,
    locked: bool,
    retain_count: u16,
    discardable: bool,
    /// Token of the outstanding device request, if `state` is `Reading` or
    /// `Writing`. Matched against `Completion::token` on arrival.
    pending_token: Option<u32>,
    /// Set when a `Write`-intent `cache_sector` call (or `mark_dirty`)
    /// lands while the slot is `Writing`: the in-flight write cannot
    /// reflect this new modification, so the slot must come back `Dirty`
    /// rather than `InSync` once that write completes (§3 invariants,
    /// §9 "concurrent modification of a dirty sector during write-back").
    redirty: bool,
}

impl CacheSlot {
    const fn new() -> Self {
        CacheSlot {
            sector: None,
            state: SlotState::Empty,
            last_use: 0,
            locked: false,
            retain_count: 0,
            discardable: false,
            pending_token: None,
            redirty: false,
        }
    }

    fn is_evictable_clean(&self) -> bool {
        self.state == SlotState::InSync && !self.locked && self.retain_count == 0
    }
}

/// Outcome of advancing the cache's device-facing half by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePollOutcome {
    /// Nothing completed this tick.
    Idle,
    /// A completion was applied to a slot (or silently dropped because it
    /// no longer matched a live request).
    Progressed,
    /// The device reported a failure on an accepted request.
    DeviceFailed,
}

pub struct SectorCache<D: BlockDevice> {
    device: D,
    slots: [CacheSlot; CACHE_SLOTS],
    buffers: [SectorBuf; CACHE_SLOTS],
    clock: u64,
    next_token: u32,
    trace_sink: Option<&'static dyn crate::trace::TraceSink>,
}

impl<D: BlockDevice> SectorCache<D> {
    pub fn new(device: D, trace_sink: Option<&'static dyn crate::trace::TraceSink>) -> Self {
        SectorCache {
            device,
            slots: [const { CacheSlot::new() }; CACHE_SLOTS],
            buffers: [[0u8; SECTOR_SIZE]; CACHE_SLOTS],
            clock: 0,
            next_token: 0,
            trace_sink,
        }
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Discards the cache state and hands the device back to the caller
    /// (used by `AfatFs::destroy`). No implicit flush.
    pub fn into_device(self) -> D {
        self.device
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn find_cached(&self, sector: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.sector == Some(sector) && s.state != SlotState::Empty)
    }

    /// Allocation policy of §4.2, in descending preference: Empty slot;
    /// clean Discardable slot; oldest clean (InSync, unlocked, unretained)
    /// slot. Returns `None` if nothing is evictable right now.
    fn choose_victim(&self) -> Option<usize> {
        if let Some(i) = self.slots.iter().position(|s| s.state == SlotState::Empty) {
            return Some(i);
        }
        if let Some(i) = self
            .slots
            .iter()
            .position(|s| s.discardable && s.is_evictable_clean())
        {
            return Some(i);
        }
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_evictable_clean())
            .min_by_key(|(_, s)| s.last_use)
            .map(|(i, _)| i)
    }

    /// Requests access to `sector` with the given intent. Returns the slot
    /// index once the buffer is valid and any requested flag has been
    /// applied; `InProgress` otherwise.
    pub fn cache_sector(
        &mut self,
        sector: u32,
        flags: CacheFlags,
    ) -> OpStatus<usize> {
        if flags.contains(CacheFlags::WRITE) && sector == MBR_SECTOR {
            debug_assert!(false, "writes to the MBR sector are never legal");
            return OpStatus::Failed(AfatfsError::CacheInconsistent);
        }

        let slot_index = match self.find_cached(sector) {
            Some(i) => i,
            None => {
                let Some(victim) = self.choose_victim() else {
                    trace_cache!(self.trace_sink, "cache_sector({}): no evictable slot", sector);
                    return OpStatus::InProgress;
                };
                self.populate(victim, sector, flags);
                victim
            }
        };

        self.service(slot_index, flags)
    }

    /// Assigns a previously-empty/evicted slot to `sector` and, if a read
    /// was requested, issues it immediately.
    fn populate(&mut self, slot_index: usize, sector: u32, flags: CacheFlags) {
        let slot = &mut self.slots[slot_index];
        slot.sector = Some(sector);
        slot.locked = false;
        slot.retain_count = 0;
        slot.redirty = false;
        slot.discardable = flags.contains(CacheFlags::DISCARDABLE);

        if flags.contains(CacheFlags::READ) {
            let token = self.next_token;
            self.next_token = self.next_token.wrapping_add(1);
            match self
                .device
                .read_block(sector, &mut self.buffers[slot_index], token)
            {
                Ok(()) => {
                    let slot = &mut self.slots[slot_index];
                    slot.state = SlotState::Reading;
                    slot.pending_token = Some(token);
                }
                Err(_busy) => {
                    // Leave it Empty-equivalent; caller retries cache_sector.
                    let slot = &mut self.slots[slot_index];
                    slot.sector = None;
                    slot.state = SlotState::Empty;
                }
            }
        } else {
            // Write-only population: content starts zeroed and already
            // valid (§4.2: "Write marks the slot dirty").
            self.buffers[slot_index] = [0u8; SECTOR_SIZE];
            self.slots[slot_index].state = SlotState::InSync;
        }
    }

    /// Applies flag side effects (lock/unlock/retain/write) to an
    /// already-resident slot and reports its readiness.
    fn service(&mut self, slot_index: usize, flags: CacheFlags) -> OpStatus<usize> {
        let state = self.slots[slot_index].state;

        match state {
            SlotState::Empty => OpStatus::InProgress,
            SlotState::Reading | SlotState::Writing => {
                if flags.contains(CacheFlags::WRITE) && state == SlotState::Writing {
                    self.slots[slot_index].redirty = true;
                }
                OpStatus::InProgress
            }
            SlotState::InSync | SlotState::Dirty => {
                self.clock += 1;
                let slot = &mut self.slots[slot_index];
                slot.last_use = self.clock;
                if flags.contains(CacheFlags::LOCK) {
                    slot.locked = true;
                }
                if flags.contains(CacheFlags::UNLOCK) {
                    slot.locked = false;
                }
                if flags.contains(CacheFlags::RETAIN) {
                    slot.retain_count += 1;
                }
                if flags.contains(CacheFlags::WRITE) {
                    slot.state = SlotState::Dirty;
                }
                OpStatus::Done(slot_index)
            }
        }
    }

    pub fn buffer(&self, slot: usize) -> &SectorBuf {
        &self.buffers[slot]
    }

    pub fn buffer_mut(&mut self, slot: usize) -> &mut SectorBuf {
        &mut self.buffers[slot]
    }

    pub fn sector_of(&self, slot: usize) -> Option<u32> {
        self.slots[slot].sector
    }

    pub fn unlock(&mut self, slot: usize) {
        self.slots[slot].locked = false;
    }

    pub fn release_retain(&mut self, slot: usize) {
        let s = &mut self.slots[slot];
        s.retain_count = s.retain_count.saturating_sub(1);
    }

    /// Marks a slot dirty explicitly, for callers that mutated
    /// `buffer_mut` after acquiring the slot with a plain `Read` (§4.2
    /// `markDirty`).
    pub fn mark_dirty(&mut self, slot: usize) {
        let s = &mut self.slots[slot];
        match s.state {
            SlotState::InSync => s.state = SlotState::Dirty,
            SlotState::Writing => s.redirty = true,
            SlotState::Dirty | SlotState::Reading | SlotState::Empty => {}
        }
    }

    /// Starts a write on one dirty, unlocked slot. Returns `true` only
    /// when no dirty-and-unlocked slot remains to start (§4.2 `flush`).
    pub fn flush(&mut self) -> bool {
        let candidate = self
            .slots
            .iter()
            .position(|s| s.state == SlotState::Dirty && !s.locked);

        let Some(slot_index) = candidate else {
            return true;
        };

        let sector = self.slots[slot_index].sector.expect("dirty slot has a sector");
        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);

        match self
            .device
            .write_block(sector, &self.buffers[slot_index], token)
        {
            Ok(()) => {
                let slot = &mut self.slots[slot_index];
                slot.state = SlotState::Writing;
                slot.pending_token = Some(token);
                slot.redirty = false;
            }
            Err(_busy) => {}
        }
        false
    }

    /// Advances the device and applies at most one completion to its
    /// owning slot.
    pub fn poll_device(&mut self) -> CachePollOutcome {
        let Some(completion) = self.device.poll() else {
            return CachePollOutcome::Idle;
        };
        self.apply_completion(completion)
    }

    fn apply_completion(&mut self, completion: Completion) -> CachePollOutcome {
        let Some(slot_index) = self.slots.iter().position(|s| {
            s.sector == Some(completion.sector) && s.pending_token == Some(completion.token)
        }) else {
            trace_cache!(
                self.trace_sink,
                "stale completion for sector {} ignored",
                completion.sector
            );
            return CachePollOutcome::Progressed;
        };

        if completion.result.is_err() {
            trace_cache!(
                self.trace_sink,
                "device reported failure for sector {}",
                completion.sector
            );
            return CachePollOutcome::DeviceFailed;
        }

        let slot = &mut self.slots[slot_index];
        slot.pending_token = None;
        match (completion.op, slot.state) {
            (DeviceOp::Read, SlotState::Reading) => slot.state = SlotState::InSync,
            (DeviceOp::Write, SlotState::Writing) => {
                slot.state = if slot.redirty {
                    slot.redirty = false;
                    SlotState::Dirty
                } else {
                    SlotState::InSync
                };
            }
            _ => {
                // Either a stale completion that happened to share a token
                // value (extremely unlikely given the monotonic counter)
                // or an already-applied one; ignore.
            }
        }
        CachePollOutcome::Progressed
    }

    #[cfg(test)]
    pub(crate) fn slot_state_for_test(&self, slot: usize) -> &'static str {
        match self.slots[slot].state {
            SlotState::Empty => "Empty",
            SlotState::Reading => "Reading",
            SlotState::InSync => "InSync",
            SlotState::Dirty => "Dirty",
            SlotState::Writing => "Writing",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::RamDisk;

    #[test]
    fn read_then_hit_is_immediate() {
        let mut cache = SectorCache::new(RamDisk::new(64), None);
        assert_eq!(
            cache.cache_sector(5, CacheFlags::READ),
            OpStatus::InProgress
        );
        assert_eq!(cache.poll_device(), CachePollOutcome::Progressed);
        let slot = match cache.cache_sector(5, CacheFlags::READ) {
            OpStatus::Done(s) => s,
            other => panic!("expected Done, got {other:?}"),
        };
        assert_eq!(cache.sector_of(slot), Some(5));
    }

    #[test]
    fn write_marks_dirty_and_flush_drains() {
        let mut cache = SectorCache::new(RamDisk::new(64), None);
        let slot = loop {
            match cache.cache_sector(1, CacheFlags::WRITE) {
                OpStatus::Done(s) => break s,
                OpStatus::InProgress => {
                    cache.poll_device();
                }
                OpStatus::Failed(e) => panic!("{e}"),
            }
        };
        assert_eq!(cache.slot_state_for_test(slot), "Dirty");
        cache.buffer_mut(slot)[0] = 0xAB;

        assert!(!cache.flush());
        assert_eq!(cache.slot_state_for_test(slot), "Writing");
        while cache.poll_device() == CachePollOutcome::Idle {}
        assert_eq!(cache.slot_state_for_test(slot), "InSync");
        assert!(cache.flush());
    }

    #[test]
    fn redirty_during_writeback_keeps_slot_dirty() {
        let mut cache = SectorCache::new(RamDisk::new(64), None);
        let slot = loop {
            match cache.cache_sector(1, CacheFlags::WRITE) {
                OpStatus::Done(s) => break s,
                OpStatus::InProgress => {
                    cache.poll_device();
                }
                OpStatus::Failed(e) => panic!("{e}"),
            }
        };
        assert!(!cache.flush());
        assert_eq!(cache.slot_state_for_test(slot), "Writing");
        // Re-dirty while the write-back is in flight.
        cache.mark_dirty(slot);
        while cache.poll_device() == CachePollOutcome::Idle {}
        assert_eq!(cache.slot_state_for_test(slot), "Dirty");
    }

    #[test]
    fn mbr_write_rejected() {
        // Safety assertion only fires in debug builds; in release the
        // Fatal status is still returned.
        let mut cache = SectorCache::new(RamDisk::new(64), None);
        if !cfg!(debug_assertions) {
            assert_eq!(
                cache.cache_sector(0, CacheFlags::WRITE),
                OpStatus::Failed(AfatfsError::CacheInconsistent)
            );
        }
    }

    #[test]
    fn locked_slot_is_not_evicted() {
        let mut cache = SectorCache::new(RamDisk::new(CACHE_SLOTS + 2), None);
        let mut locked_slots = [0usize; CACHE_SLOTS];
        for i in 0..CACHE_SLOTS {
            let slot = loop {
                match cache.cache_sector(i as u32 + 1, CacheFlags::READ | CacheFlags::LOCK) {
                    OpStatus::Done(s) => break s,
                    OpStatus::InProgress => {
                        cache.poll_device();
                    }
                    OpStatus::Failed(e) => panic!("{e}"),
                }
            };
            locked_slots[i] = slot;
        }
        // All 8 slots are locked; a 9th sector cannot be cached yet.
        assert_eq!(
            cache.cache_sector(99, CacheFlags::READ),
            OpStatus::InProgress
        );
    }
}
