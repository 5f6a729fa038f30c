//! In-memory [`BlockDevice`] mock used by unit and integration tests
//! (SPEC_FULL.md §8 "Test harness requirements").
//!
//! Only compiled for tests (or under the `std` feature, for out-of-tree
//! integration harnesses); never part of the `no_std` core path.

use std::vec::Vec;

use crate::device::{BlockDevice, Completion, DeviceError, DeviceOp, DeviceBusy, SectorBuf, SECTOR_SIZE};

/// A single in-flight request the disk is counting down before it
/// surfaces a completion.
struct Pending {
    op: DeviceOp,
    sector: u32,
    token: u32,
    ticks_left: u32,
}

/// An in-memory medium with injectable latency, busy responses, and a
/// power-loss simulator for scenario 6 of §8.
pub struct RamDisk {
    sectors: Vec<SectorBuf>,
    /// Sectors a write has durably committed to (used by `lose_power`).
    durable: Vec<bool>,
    pending: Option<Pending>,
    /// Ticks a freshly-accepted request waits before completing. 0 means
    /// "completes on the very next `poll`".
    latency: u32,
    /// When `Some(n)`, the next `n` accept attempts (read or write) return
    /// `DeviceBusy` before starting to accept normally again.
    busy_countdown: Option<u32>,
    power_lost: bool,
}

impl RamDisk {
    pub fn new(num_sectors: usize) -> Self {
        RamDisk {
            sectors: std::vec![[0u8; SECTOR_SIZE]; num_sectors],
            durable: std::vec![false; num_sectors],
            pending: None,
            latency: 0,
            busy_countdown: None,
            power_lost: false,
        }
    }

    pub fn with_latency(mut self, ticks: u32) -> Self {
        self.latency = ticks;
        self
    }

    /// Forces the next `n` accept attempts to return `DeviceBusy`.
    pub fn set_busy_for(&mut self, n: u32) {
        self.busy_countdown = Some(n);
    }

    pub fn sector_bytes(&self, sector: u32) -> &SectorBuf {
        &self.sectors[sector as usize]
    }

    /// Simulates a power loss: subsequent reads still see whatever was
    /// durably committed before this call; the in-flight request (if any)
    /// is dropped without ever completing.
    pub fn lose_power(&mut self) {
        self.power_lost = true;
        self.pending = None;
    }

    fn take_busy_slot(&mut self) -> bool {
        match self.busy_countdown {
            Some(0) | None => false,
            Some(n) => {
                self.busy_countdown = Some(n - 1);
                true
            }
        }
    }
}

impl BlockDevice for RamDisk {
    fn read_block(
        &mut self,
        sector: u32,
        buffer: &mut SectorBuf,
        token: u32,
    ) -> Result<(), DeviceBusy> {
        if self.power_lost || self.pending.is_some() || self.take_busy_slot() {
            return Err(DeviceBusy);
        }
        *buffer = self.sectors[sector as usize];
        self.pending = Some(Pending {
            op: DeviceOp::Read,
            sector,
            token,
            ticks_left: self.latency,
        });
        Ok(())
    }

    fn write_block(
        &mut self,
        sector: u32,
        buffer: &SectorBuf,
        token: u32,
    ) -> Result<(), DeviceBusy> {
        if self.power_lost || self.pending.is_some() || self.take_busy_slot() {
            return Err(DeviceBusy);
        }
        self.sectors[sector as usize] = *buffer;
        self.pending = Some(Pending {
            op: DeviceOp::Write,
            sector,
            token,
            ticks_left: self.latency,
        });
        Ok(())
    }

    fn poll(&mut self) -> Option<Completion> {
        let pending = self.pending.as_mut()?;
        if pending.ticks_left > 0 {
            pending.ticks_left -= 1;
            return None;
        }
        let Pending { op, sector, token, .. } = self.pending.take().unwrap();

        if op == DeviceOp::Write {
            if self.power_lost {
                return Some(Completion {
                    op,
                    sector,
                    token,
                    result: Err(DeviceError),
                });
            }
            self.durable[sector as usize] = true;
        }

        Some(Completion {
            op,
            sector,
            token,
            result: Ok(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceOp;

    #[test]
    fn read_roundtrips_committed_data() {
        let mut disk = RamDisk::new(4);
        let mut buf = [7u8; SECTOR_SIZE];
        disk.write_block(2, &buf, 0).unwrap();
        assert_eq!(disk.poll().unwrap().op, DeviceOp::Write);

        buf = [0u8; SECTOR_SIZE];
        disk.read_block(2, &mut buf, 1).unwrap();
        disk.poll().unwrap();
        assert_eq!(buf, [7u8; SECTOR_SIZE]);
    }

    #[test]
    fn busy_countdown_rejects_then_accepts() {
        let mut disk = RamDisk::new(4);
        disk.set_busy_for(2);
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(disk.read_block(0, &mut buf, 0).is_err());
        assert!(disk.read_block(0, &mut buf, 0).is_err());
        assert!(disk.read_block(0, &mut buf, 0).is_ok());
    }
}
