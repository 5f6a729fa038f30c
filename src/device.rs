//! Block device contract (external collaborator, §4.1/§6).
//!
//! Grounded in the teacher's `watos-driver-traits::block::BlockDevice`
//! trait (itself a synchronous `Result`-returning trait), reshaped here
//! into the non-blocking, completion-callback contract the specification
//! requires: every call either completes inline (rare — reserved for
//! "accept failed") or is accepted and later surfaces through `poll`.

/// Sector size this driver operates on. The on-disk format is only
/// specified for 512-byte sectors.
pub const SECTOR_SIZE: usize = 512;

/// One physical sector's worth of bytes.
pub type SectorBuf = [u8; SECTOR_SIZE];

/// The device could not accept the request right now (single in-flight
/// operation, per §5 "Shared resources"). The caller must retry later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBusy;

/// The device accepted the request but the operation ultimately failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceError;

/// Which operation a [`Completion`] corresponds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    Read,
    Write,
}

/// Reported once per accepted request by [`BlockDevice::poll`].
///
/// `token` is opaque to the device — the cache passes its own cache-slot
/// index and matches completions back up by `(sector, token)`, tolerating
/// the case where the slot has since been recycled to a different sector
/// (§9 "Cyclic references avoided").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub op: DeviceOp,
    pub sector: u32,
    pub token: u32,
    pub result: Result<(), DeviceError>,
}

/// Asynchronous, non-blocking block device.
///
/// Implementations must never block inside `read_block`/`write_block`: if
/// the device cannot accept the request immediately, return `Err(DeviceBusy)`
/// and wait for the caller to retry after a `poll`. Exactly one completion
/// is reported per accepted request, via `poll`, matched by `(sector, token)`.
pub trait BlockDevice {
    /// Begin reading one sector into `buffer`. `token` is echoed back
    /// verbatim in the matching [`Completion`].
    fn read_block(
        &mut self,
        sector: u32,
        buffer: &mut SectorBuf,
        token: u32,
    ) -> Result<(), DeviceBusy>;

    /// Begin writing one sector from `buffer`. `token` is echoed back
    /// verbatim in the matching [`Completion`].
    fn write_block(
        &mut self,
        sector: u32,
        buffer: &SectorBuf,
        token: u32,
    ) -> Result<(), DeviceBusy>;

    /// Hint that a run of consecutive `write_block` calls is coming (used
    /// during flush to let devices batch DMA setup). Default no-op.
    fn begin_write_batch(&mut self) {}

    /// Matches [`BlockDevice::begin_write_batch`]. Default no-op.
    fn end_write_batch(&mut self) {}

    /// Advance pending I/O by one tick, yielding at most one completion.
    /// Must not block. Returns `None` if nothing completed this tick.
    fn poll(&mut self) -> Option<Completion>;
}
