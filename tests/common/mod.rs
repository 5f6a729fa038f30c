//! Shared volume-image builder and drain helpers for the end-to-end
//! scenarios of SPEC_FULL.md §8. Every scenario formats its own small
//! in-memory volume through this module rather than shipping a prebuilt
//! image, so the on-disk layout stays obviously traceable to the BPB fields
//! `afatfs::layout` actually parses.
//!
//! Volume sizes here are scaled down from the literal figures in the
//! scenario prose (a "100 MB" volume becomes a few megabytes) so the test
//! suite runs in reasonable time; the structural assertions (root-directory
//! ceiling, reclaim-after-delete, retention, power-loss survival) are
//! unchanged.

use afatfs::{AfatFs, BlockDevice, Config, OpStatus};

/// One partition, starting at sector 1 (sector 0 is the MBR).
pub const PARTITION_START: u32 = 1;
pub const RESERVED_SECTORS: u16 = 1;
pub const SECTORS_PER_FAT: u16 = 40;
pub const ROOT_ENTRY_COUNT: u16 = 512;
pub const SECTORS_PER_CLUSTER: u8 = 1;

/// Data-cluster count chosen to land just inside the FAT16 classification
/// band (`[4085, 65525)` per `layout::derive_geometry`), matching scenario
/// 1's "FAT16 root has a fixed ~512-entry ceiling".
pub const DATA_CLUSTERS: u32 = 4096;

fn cluster_start_sector_rel() -> u32 {
    let fat_region = RESERVED_SECTORS as u32 + 2 * SECTORS_PER_FAT as u32;
    let root_dir_sectors = (ROOT_ENTRY_COUNT as u32 * 32 + 511) / 512;
    fat_region + root_dir_sectors
}

fn total_sectors_rel() -> u32 {
    cluster_start_sector_rel() + DATA_CLUSTERS * SECTORS_PER_CLUSTER as u32
}

/// Builds the MBR (sector 0) with a single FAT32-type partition entry
/// starting at [`PARTITION_START`].
fn build_mbr() -> [u8; 512] {
    let mut sector = [0u8; 512];
    let offset = 446;
    sector[offset + 4] = 0x0C; // FAT32 LBA partition type
    sector[offset + 8..offset + 12].copy_from_slice(&PARTITION_START.to_le_bytes());
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

/// Builds the volume-ID sector (the partition's first sector) as a FAT16 BPB.
fn build_bpb() -> [u8; 512] {
    let mut sector = [0u8; 512];
    sector[11..13].copy_from_slice(&512u16.to_le_bytes());
    sector[13] = SECTORS_PER_CLUSTER;
    sector[14..16].copy_from_slice(&RESERVED_SECTORS.to_le_bytes());
    sector[16] = 2; // num_fats
    sector[17..19].copy_from_slice(&ROOT_ENTRY_COUNT.to_le_bytes());
    sector[19..21].copy_from_slice(&(total_sectors_rel() as u16).to_le_bytes());
    sector[22..24].copy_from_slice(&SECTORS_PER_FAT.to_le_bytes());
    sector[510] = 0x55;
    sector[511] = 0xAA;
    sector
}

fn write_sector_sync(disk: &mut afatfs::testutil::RamDisk, sector: u32, data: [u8; 512]) {
    let mut token = 0u32;
    loop {
        match disk.write_block(sector, &data, token) {
            Ok(()) => break,
            Err(_) => token = token.wrapping_add(1),
        }
    }
    while disk.poll().is_none() {}
}

/// Formats a fresh, small FAT16 volume (see module docs for the sizing
/// rationale) and returns the backing `RamDisk`.
pub fn format_volume() -> afatfs::testutil::RamDisk {
    let total_disk_sectors = (PARTITION_START + total_sectors_rel() + 16) as usize;
    let mut disk = afatfs::testutil::RamDisk::new(total_disk_sectors);
    write_sector_sync(&mut disk, 0, build_mbr());
    write_sector_sync(&mut disk, PARTITION_START, build_bpb());
    disk
}

/// Constructs and mounts an `AfatFs` over a freshly formatted volume.
pub fn mounted_fs() -> AfatFs<afatfs::testutil::RamDisk> {
    let disk = format_volume();
    let mut fs = AfatFs::new(disk, Config::default());
    loop {
        match fs.init() {
            OpStatus::Done(()) => return fs,
            OpStatus::InProgress => fs.poll(),
            OpStatus::Failed(e) => panic!("mount failed: {e}"),
        }
    }
}

/// Polls `fs` until `f` reports a quiescent status, also advancing the
/// device between `InProgress` results.
pub fn drain<D: BlockDevice, T>(fs: &mut AfatFs<D>, mut f: impl FnMut(&mut AfatFs<D>) -> OpStatus<T>) -> Result<T, afatfs::AfatfsError> {
    loop {
        match f(fs) {
            OpStatus::Done(v) => return Ok(v),
            OpStatus::InProgress => fs.poll(),
            OpStatus::Failed(e) => return Err(e),
        }
    }
}

/// Writes the whole of `buf` to `id`, draining short writes across polls.
pub fn write_all<D: BlockDevice>(fs: &mut AfatFs<D>, id: afatfs::FileId, mut buf: &[u8]) {
    while !buf.is_empty() {
        let n = drain(fs, |fs| fs.fwrite(id, buf)).expect("write failed");
        if n == 0 {
            fs.poll();
            continue;
        }
        buf = &buf[n..];
    }
}

/// Reads exactly `out.len()` bytes from `id`, draining short reads across
/// polls. Panics if EOF is reached first.
pub fn read_exact<D: BlockDevice>(fs: &mut AfatFs<D>, id: afatfs::FileId, out: &mut [u8]) {
    let mut filled = 0;
    while filled < out.len() {
        let n = drain(fs, |fs| fs.fread(id, &mut out[filled..])).expect("read failed");
        if n == 0 {
            if fs.feof(id) {
                panic!("unexpected EOF after {filled} of {} bytes", out.len());
            }
            fs.poll();
            continue;
        }
        filled += n;
    }
}
