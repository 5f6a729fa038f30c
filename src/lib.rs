//! Asynchronous, non-blocking FAT16/FAT32 filesystem driver for
//! block-oriented flash media (SD cards, eMMC, raw NOR/NAND behind a
//! translation layer).
//!
//! Every operation that might need to wait on the underlying block device
//! is an explicit, resumable state machine advanced one step at a time by
//! [`fs::AfatFs::poll`] (and, for convenience, drained inline by the public
//! methods themselves whenever the cache already holds what they need) —
//! there is no `async`/`await`, no thread, and no blocking call anywhere in
//! this crate. See [`error::OpStatus`] for the status type every
//! asynchronous boundary in this crate returns.
//!
//! ```text
//! let mut fs = AfatFs::new(device, Config::default());
//! while fs.init().is_in_progress() { /* drive the device here */ }
//! let id = fs.fopen(None, "LOG.TXT", "a").unwrap();
//! fs.fwrite(id, b"hello\n");
//! fs.fclose(id);
//! ```
#![cfg_attr(not(any(test, feature = "std")), no_std)]

pub mod append;
pub mod cache;
pub mod config;
pub(crate) mod core_state;
pub mod device;
pub mod dir;
pub mod dirent;
pub mod error;
pub mod fat;
pub mod file;
pub mod freefile;
pub mod freespace;
pub mod fs;
pub mod layout;
pub mod mount;
pub mod trace;

#[cfg(any(test, feature = "std"))]
pub mod testutil;

pub use config::Config;
pub use device::{BlockDevice, Completion, DeviceBusy, DeviceError, DeviceOp, SectorBuf, SECTOR_SIZE};
pub use dir::{DirRoot, EntryLocation, FindNextOutcome};
pub use error::{AfatfsError, OpStatus};
pub use file::{OpenMode, SeekFrom};
pub use fs::{AfatFs, FileId, FsState, MAX_OPEN_FILES};
