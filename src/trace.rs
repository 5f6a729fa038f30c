//! Feature-gated tracing of cache/FAT/file-operation state transitions.
//!
//! The teacher crate hard-codes `watos_arch::serial_write` calls behind a
//! `fat_debug!` macro that compiles to nothing unless a `debug` feature is
//! enabled. This crate cannot assume any particular serial driver is
//! present, so the sink is injectable: [`Config`](crate::config::Config)
//! carries an `Option<&'static dyn TraceSink>`, and the `trace_*!` macros
//! below forward to whichever sink the filesystem was constructed with.
//! With the `trace` feature disabled, every macro call compiles to nothing.

/// Receives trace events from the filesystem when the `trace` feature is
/// enabled and a sink has been installed via [`Config`](crate::config::Config).
pub trait TraceSink: Sync {
    fn trace(&self, subsystem: &'static str, args: core::fmt::Arguments<'_>);
}

#[cfg(feature = "trace")]
macro_rules! trace_emit {
    ($self_sink:expr, $subsystem:literal, $($arg:tt)*) => {{
        if let Some(sink) = $self_sink {
            sink.trace($subsystem, format_args!($($arg)*));
        }
    }};
}

#[cfg(feature = "trace")]
macro_rules! trace_cache {
    ($sink:expr, $($arg:tt)*) => { $crate::trace::trace_emit!($sink, "cache", $($arg)*) };
}

#[cfg(feature = "trace")]
macro_rules! trace_fat {
    ($sink:expr, $($arg:tt)*) => { $crate::trace::trace_emit!($sink, "fat", $($arg)*) };
}

#[cfg(feature = "trace")]
macro_rules! trace_file {
    ($sink:expr, $($arg:tt)*) => { $crate::trace::trace_emit!($sink, "file", $($arg)*) };
}

#[cfg(feature = "trace")]
macro_rules! trace_mount {
    ($sink:expr, $($arg:tt)*) => { $crate::trace::trace_emit!($sink, "mount", $($arg)*) };
}

#[cfg(not(feature = "trace"))]
macro_rules! trace_cache {
    ($sink:expr, $($arg:tt)*) => {
        let _ = &$sink;
    };
}

#[cfg(not(feature = "trace"))]
macro_rules! trace_fat {
    ($sink:expr, $($arg:tt)*) => {
        let _ = &$sink;
    };
}

#[cfg(not(feature = "trace"))]
macro_rules! trace_file {
    ($sink:expr, $($arg:tt)*) => {
        let _ = &$sink;
    };
}

#[cfg(not(feature = "trace"))]
macro_rules! trace_mount {
    ($sink:expr, $($arg:tt)*) => {
        let _ = &$sink;
    };
}

#[cfg(feature = "trace")]
pub(crate) use trace_emit;
pub(crate) use {trace_cache, trace_fat, trace_file, trace_mount};
