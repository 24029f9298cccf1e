//! Kernel-style log macros
//!
//! Leveled, thread-aware debug output on stderr, configured from the
//! environment:
//!
//! - `VD_LOG_LEVEL=<level>` — 0=off, 1=error, 2=warn, 3=info, 4=debug, 5=trace
//! - `VD_LOG_TIME=1` — prefix each line with a nanosecond timestamp
//! - `VD_LOG_FLUSH=1` — flush stderr after each line
//!
//! Output: `[LEVEL] [<ns>] [<thread>] message`

use crate::env::env_get_bool;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

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

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Warn as u8);
static FLUSH_ENABLED: AtomicBool = AtomicBool::new(false);
static TIME_ENABLED: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Initialise from the environment. Runs implicitly on first use.
pub fn init() {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    START_TIME.get_or_init(Instant::now);
    FLUSH_ENABLED.store(env_get_bool("VD_LOG_FLUSH", false), Ordering::Relaxed);
    TIME_ENABLED.store(env_get_bool("VD_LOG_TIME", false), Ordering::Relaxed);

    if let Ok(val) = std::env::var("VD_LOG_LEVEL") {
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
    init();
    LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Emit one formatted line. Use the macros instead of calling this.
pub fn emit(level: LogLevel, args: core::fmt::Arguments<'_>) {
    if level > log_level() {
        return;
    }

    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let thread = std::thread::current();
    let name = thread.name().unwrap_or("?").to_string();

    let _ = if TIME_ENABLED.load(Ordering::Relaxed) {
        let ns = START_TIME.get_or_init(Instant::now).elapsed().as_nanos();
        writeln!(out, "{} [{}] [{}] {}", level.prefix(), ns, name, args)
    } else {
        writeln!(out, "{} [{}] {}", level.prefix(), name, args)
    };

    if FLUSH_ENABLED.load(Ordering::Relaxed) {
        let _ = out.flush();
    }
}

#[macro_export]
macro_rules! kerror {
    ($($arg:tt)*) => {
        $crate::klog::emit($crate::klog::LogLevel::Error, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => {
        $crate::klog::emit($crate::klog::LogLevel::Warn, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => {
        $crate::klog::emit($crate::klog::LogLevel::Info, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => {
        $crate::klog::emit($crate::klog::LogLevel::Debug, format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => {
        $crate::klog::emit($crate::klog::LogLevel::Trace, format_args!($($arg)*))
    };
}
