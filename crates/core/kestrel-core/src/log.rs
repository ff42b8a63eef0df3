//! Leveled kernel logging.
//!
//! The boot code registers a sink with [`set_log_fn`]; until then every
//! message is dropped. [`set_max_level`] filters messages before they reach
//! the sink, so disabled `ktrace!` sites cost one atomic load.

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

// ---------------------------------------------------------------------------
// Log levels (lower = more severe)
// ---------------------------------------------------------------------------

/// Kernel log severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Unrecoverable error, the system will halt.
    Fatal = 0,
    /// Something failed but the system may continue.
    Error = 1,
    /// Unexpected condition, not necessarily an error.
    Warn = 2,
    /// High-level progress messages.
    Info = 3,
    /// Detailed diagnostic information.
    Debug = 4,
    /// Very verbose, per-operation tracing.
    Trace = 5,
}

impl LogLevel {
    /// Returns the fixed-width name used as a line prefix.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Fatal => "FATAL",
            Self::Error => "ERROR",
            Self::Warn => "WARN ",
            Self::Info => "INFO ",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name().trim_end())
    }
}

// ---------------------------------------------------------------------------
// Sink registration
// ---------------------------------------------------------------------------

/// The signature of the global leveled log function.
pub type LogFn = fn(LogLevel, fmt::Arguments<'_>);

fn null_log(_level: LogLevel, _args: fmt::Arguments<'_>) {}

static LOG_FN: AtomicPtr<()> = AtomicPtr::new(null_log as *mut ());

static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Trace as u8);

/// Registers the global log sink.
///
/// # Safety
///
/// `f` must be callable from any context, including with interrupts
/// disabled. It may be replaced later (early serial first, full logger
/// afterwards).
pub unsafe fn set_log_fn(f: LogFn) {
    LOG_FN.store(f as *mut (), Ordering::Release);
}

/// Sets the most verbose level that is forwarded to the sink.
pub fn set_max_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Returns `true` if messages at `level` currently reach the sink.
#[inline]
pub fn enabled(level: LogLevel) -> bool {
    level as u8 <= MAX_LEVEL.load(Ordering::Relaxed)
}

#[inline]
fn load_log_fn() -> LogFn {
    let ptr = LOG_FN.load(Ordering::Acquire);
    // SAFETY: Only `null_log` and pointers passed to `set_log_fn` are ever
    // stored, and both are valid `LogFn`s.
    unsafe { core::mem::transmute::<*mut (), LogFn>(ptr) }
}

/// Implementation detail for [`klog!`]. Not public API.
#[doc(hidden)]
pub fn _log(level: LogLevel, args: fmt::Arguments<'_>) {
    if enabled(level) {
        load_log_fn()(level, args);
    }
}

/// Logs a message at the given level.
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, format_args!($($arg)*))
    };
}

/// Logs a fatal-level message.
#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Fatal, $($arg)*) };
}

/// Logs an error-level message.
#[macro_export]
macro_rules! kerr {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Error, $($arg)*) };
}

/// Logs a warning-level message.
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Warn, $($arg)*) };
}

/// Logs an info-level message.
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Info, $($arg)*) };
}

/// Logs a debug-level message.
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Debug, $($arg)*) };
}

/// Logs a trace-level message.
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Trace, $($arg)*) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static CAPTURED: Mutex<Vec<(LogLevel, String)>> = Mutex::new(Vec::new());

    fn capture(level: LogLevel, args: fmt::Arguments<'_>) {
        CAPTURED.lock().unwrap().push((level, args.to_string()));
    }

    // The sink and level are process globals, so everything that touches
    // them lives in one test.
    #[test]
    fn sink_and_level_filter() {
        crate::kinfo!("dropped before registration");

        // SAFETY: `capture` only locks a host mutex.
        unsafe { set_log_fn(capture) };
        crate::kwarn!("range failed at page {}", 3);
        set_max_level(LogLevel::Info);
        crate::kdebug!("filtered");
        crate::kerr!("kept");
        set_max_level(LogLevel::Trace);

        let got = CAPTURED.lock().unwrap().clone();
        assert_eq!(
            got,
            [
                (LogLevel::Warn, "range failed at page 3".to_string()),
                (LogLevel::Error, "kept".to_string()),
            ]
        );
    }

    #[test]
    fn level_names() {
        assert_eq!(LogLevel::Warn.name(), "WARN ");
        assert_eq!(LogLevel::Warn.to_string(), "WARN");
        assert!(LogLevel::Fatal < LogLevel::Trace);
    }
}
