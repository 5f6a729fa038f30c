//! Runtime-tunable configuration.
//!
//! Cache slot count and sector size are compile-time consts (see
//! [`crate::cache`]) because the slot array is a fixed-size, non-allocating
//! array; everything that is safe to decide at mount time without changing
//! a data layout lives here instead.

use crate::trace::TraceSink;

/// Clusters subtracted from the freefile after the free-space search, so
/// that ordinary (non-contiguous) allocation always has somewhere to draw
/// from even once the freefile owns the largest run on the volume.
pub const DEFAULT_FREEFILE_LEAVE_CLUSTERS: u32 = 100;

#[derive(Clone, Copy)]
pub struct Config {
    /// See [`DEFAULT_FREEFILE_LEAVE_CLUSTERS`].
    pub freefile_leave_clusters: u32,
    /// Maximum number of simultaneously open file/directory handles.
    pub max_open_files: usize,
    /// Optional sink for the `trace_*!` macros in [`crate::trace`].
    pub trace_sink: Option<&'static dyn TraceSink>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            freefile_leave_clusters: DEFAULT_FREEFILE_LEAVE_CLUSTERS,
            max_open_files: 8,
            trace_sink: None,
        }
    }
}
