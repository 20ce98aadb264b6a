// Kernel Logging Subsystem
//
// Structured, levelled logging for the virtual memory core. Every entry
// carries a timestamp, a severity and the subsystem origin that produced it,
// which is what makes eviction storms and fault loops debuggable after the
// fact.
//
// Key responsibilities:
// - Provide standardized log levels (Debug, Info, Warn, Error, Panic)
// - Attach timestamps and subsystem origin to every log entry
// - Include source location only for DEBUG entries (file:line)
// - Route formatted output to whatever console the embedding kernel owns
//
// Implementation details:
// - The level filter lives in an atomic so it can be changed at runtime
// - Output goes through a single registered sink (`set_sink`); the serial
//   and VGA drivers live outside this crate and register themselves here
// - Timestamps come from a registered tick clock (`set_clock`), 10 ms/tick
// - With no sink installed every macro is a cheap no-op after the level check
//
// Developer ergonomics:
// - Convenience macros (`log_debug!`, `log_info!`, etc.) wrap `_log`
// - Macros automatically capture `file!()` and `line!()` for debug context

use core::fmt;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Debug = 0,
    Info = 1,
    Warn = 2,
    Error = 3,
    Panic = 4,
}

impl LogLevel {
    pub const fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO ",
            LogLevel::Warn => "WARN ",
            LogLevel::Error => "ERROR",
            LogLevel::Panic => "PANIC",
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LogLevel::Debug,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            _ => LogLevel::Panic,
        }
    }
}

/// Receives one fully formatted log line (without the trailing newline).
pub type LogSink = fn(fmt::Arguments);

/// Returns the number of timer ticks since boot.
pub type TickClock = fn() -> u64;

const MS_PER_TICK: u64 = 10;

static CURRENT_LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);
static SINK: AtomicUsize = AtomicUsize::new(0);
static CLOCK: AtomicUsize = AtomicUsize::new(0);

pub fn set_level(level: LogLevel) {
    CURRENT_LOG_LEVEL.store(level as u8, Ordering::Relaxed);
}

pub fn get_level() -> LogLevel {
    LogLevel::from_u8(CURRENT_LOG_LEVEL.load(Ordering::Relaxed))
}

pub fn set_sink(sink: LogSink) {
    SINK.store(sink as usize, Ordering::Release);
}

pub fn clear_sink() {
    SINK.store(0, Ordering::Release);
}

pub fn set_clock(clock: TickClock) {
    CLOCK.store(clock as usize, Ordering::Release);
}

fn sink() -> Option<LogSink> {
    let raw = SINK.load(Ordering::Acquire);
    if raw == 0 {
        return None;
    }
    // SAFETY: only ever stored from a valid `LogSink` in `set_sink`.
    Some(unsafe { core::mem::transmute::<usize, LogSink>(raw) })
}

fn get_timestamp_ms() -> u64 {
    let raw = CLOCK.load(Ordering::Acquire);
    if raw == 0 {
        return 0;
    }
    // SAFETY: only ever stored from a valid `TickClock` in `set_clock`.
    let clock = unsafe { core::mem::transmute::<usize, TickClock>(raw) };
    clock() * MS_PER_TICK
}

fn format_timestamp(ms: u64) -> (u64, u64) {
    let seconds = ms / 1000;
    let milliseconds = ms % 1000;
    (seconds, milliseconds)
}

pub fn _log(level: LogLevel, origin: &str, args: fmt::Arguments, file: &str, line: u32) {
    if level < get_level() {
        return;
    }

    let Some(sink) = sink() else {
        return;
    };

    let (seconds, milliseconds) = format_timestamp(get_timestamp_ms());
    let level_str = level.as_str();

    if level == LogLevel::Debug {
        sink(format_args!(
            "[t={}.{:03}s] [{}] [{}] {} ({}:{})",
            seconds, milliseconds, level_str, origin, args, file, line
        ));
    } else {
        sink(format_args!(
            "[t={}.{:03}s] [{}] [{}] {}",
            seconds, milliseconds, level_str, origin, args
        ));
    }
}

#[macro_export]
macro_rules! log_debug {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Debug,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_info {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Info,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_warn {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Warn,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_error {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Error,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[macro_export]
macro_rules! log_panic {
    ($origin:expr, $($arg:tt)*) => {
        $crate::log::_log(
            $crate::log::LogLevel::Panic,
            $origin,
            format_args!($($arg)*),
            file!(),
            line!()
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::{String, ToString};
    use std::sync::Mutex;
    use std::vec::Vec;

    static LINES: Mutex<Vec<String>> = Mutex::new(Vec::new());

    fn capture(args: fmt::Arguments) {
        LINES.lock().unwrap().push(args.to_string());
    }

    fn fixed_clock() -> u64 {
        123
    }

    #[test]
    fn filters_below_level_and_formats_origin() {
        // Other tests log concurrently; only look at lines from this origin.
        set_clock(fixed_clock);
        set_sink(capture);
        set_level(LogLevel::Warn);

        crate::log_info!("logtest", "dropped {}", 1);
        crate::log_warn!("logtest", "kept {}", 2);

        set_level(LogLevel::Info);
        clear_sink();

        let lines: Vec<String> = LINES
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.contains("[logtest]"))
            .cloned()
            .collect();
        assert_eq!(lines, ["[t=1.230s] [WARN ] [logtest] kept 2"]);
    }
}
