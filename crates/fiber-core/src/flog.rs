//! Kernel-style print macros for the fiber scheduler
//!
//! Thread-safe, optionally-flushing stderr output with a worker/fiber
//! context prefix.
//!
//! # Environment Variables
//!
//! - `FIBER_LOG_LEVEL=<level>` - 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `FIBER_FLUSH_EPRINT=1` - Flush stderr after each line (debugging crashes)

use std::cell::Cell;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

/// Log levels
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Off = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl LogLevel {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Off,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            LogLevel::Off => "",
            LogLevel::Error => "[ERROR]",
            LogLevel::Warn => "[WARN] ",
            LogLevel::Info => "[INFO] ",
            LogLevel::Debug => "[DEBUG]",
            LogLevel::Trace => "[TRACE]",
        }
    }
}

static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

thread_local! {
    /// Worker id prefix for log lines emitted from worker threads
    static LOG_WORKER: Cell<u32> = const { Cell::new(u32::MAX) };
}

/// Initialize logging from environment variables.
///
/// Called automatically on first use; calling explicitly makes
/// initialization deterministic.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    if let Ok(val) = std::env::var("FIBER_FLUSH_EPRINT") {
        let flush = matches!(val.as_str(), "1" | "true" | "yes" | "on");
        FLUSH_ENABLED.store(flush, Ordering::Relaxed);
    }

    if let Ok(val) = std::env::var("FIBER_LOG_LEVEL") {
        let level = match val.to_lowercase().as_str() {
            "off" | "0" => LogLevel::Off,
            "error" | "1" => LogLevel::Error,
            "warn" | "2" => LogLevel::Warn,
            "info" | "3" => LogLevel::Info,
            "debug" | "4" => LogLevel::Debug,
            "trace" | "5" => LogLevel::Trace,
            _ => LogLevel::Warn,
        };
        LOG_LEVEL.store(level as u8, Ordering::Relaxed);
    }
}

#[inline]
pub fn log_level() -> LogLevel {
    if !INITIALIZED.load(Ordering::Relaxed) {
        init();
    }
    LogLevel::from_u8(LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_log_level(level: LogLevel) {
    INITIALIZED.store(true, Ordering::SeqCst);
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn set_flush_enabled(enabled: bool) {
    FLUSH_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Tag this thread's log lines with a worker id.
pub fn set_log_worker(id: u32) {
    LOG_WORKER.with(|c| c.set(id));
}

pub fn clear_log_worker() {
    LOG_WORKER.with(|c| c.set(u32::MAX));
}

#[inline]
pub fn level_enabled(level: LogLevel) -> bool {
    level as u8 <= log_level() as u8
}

/// Internal: leveled line write, locked for atomic output.
#[doc(hidden)]
pub fn _flog_impl(level: LogLevel, args: std::fmt::Arguments<'_>) {
    if !level_enabled(level) {
        return;
    }
    let stderr = std::io::stderr();
    let mut handle = stderr.lock();
    let worker = LOG_WORKER.with(|c| c.get());
    if worker != u32::MAX {
        let _ = write!(handle, "{} [w{}] ", level.prefix(), worker);
    } else {
        let _ = write!(handle, "{} ", level.prefix());
    }
    let _ = handle.write_fmt(args);
    let _ = handle.write_all(b"\n");
    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = handle.flush();
    }
}

/// Error level log
#[macro_export]
macro_rules! ferror {
    ($($arg:tt)*) => {{
        $crate::flog::_flog_impl($crate::flog::LogLevel::Error, format_args!($($arg)*));
    }};
}

/// Warning level log
#[macro_export]
macro_rules! fwarn {
    ($($arg:tt)*) => {{
        $crate::flog::_flog_impl($crate::flog::LogLevel::Warn, format_args!($($arg)*));
    }};
}

/// Info level log
#[macro_export]
macro_rules! finfo {
    ($($arg:tt)*) => {{
        $crate::flog::_flog_impl($crate::flog::LogLevel::Info, format_args!($($arg)*));
    }};
}

/// Debug level log
#[macro_export]
macro_rules! fdebug {
    ($($arg:tt)*) => {{
        $crate::flog::_flog_impl($crate::flog::LogLevel::Debug, format_args!($($arg)*));
    }};
}

/// Trace level log (most verbose)
#[macro_export]
macro_rules! ftrace {
    ($($arg:tt)*) => {{
        $crate::flog::_flog_impl($crate::flog::LogLevel::Trace, format_args!($($arg)*));
    }};
}
