//! Kernel log sink.
//!
//! Level-filtered logging for the simulated kernel. Lines go to stderr and
//! into a bounded ring of recent lines that tests can inspect after the
//! fact. The runtime level comes from the `VIREO_LOG` environment variable
//! (`fatal`..`trace`) and can be changed while running.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::Once;

use spin::Mutex;

/// Number of recent log lines retained for inspection.
const RING_CAPACITY: usize = 256;

static LOG_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info.priority());
static LEVEL_FROM_ENV: Once = Once::new();

static RING: Mutex<RingBuffer> = Mutex::new(RingBuffer::new());

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Fatal,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub const fn as_str(self) -> &'static str {
        match self {
            LogLevel::Fatal => "FATAL",
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    pub(crate) const fn priority(self) -> u8 {
        match self {
            LogLevel::Fatal => 0,
            LogLevel::Error => 1,
            LogLevel::Warn => 2,
            LogLevel::Info => 3,
            LogLevel::Debug => 4,
            LogLevel::Trace => 5,
        }
    }

    fn from_priority(value: u8) -> Self {
        match value {
            0 => LogLevel::Fatal,
            1 => LogLevel::Error,
            2 => LogLevel::Warn,
            3 => LogLevel::Info,
            4 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("fatal") {
            Some(LogLevel::Fatal)
        } else if value.eq_ignore_ascii_case("error") {
            Some(LogLevel::Error)
        } else if value.eq_ignore_ascii_case("warn") {
            Some(LogLevel::Warn)
        } else if value.eq_ignore_ascii_case("info") {
            Some(LogLevel::Info)
        } else if value.eq_ignore_ascii_case("debug") {
            Some(LogLevel::Debug)
        } else if value.eq_ignore_ascii_case("trace") {
            Some(LogLevel::Trace)
        } else {
            None
        }
    }
}

struct RingBuffer {
    lines: VecDeque<String>,
}

impl RingBuffer {
    const fn new() -> Self {
        Self {
            lines: VecDeque::new(),
        }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == RING_CAPACITY {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }
}

/// Set the runtime log level.
pub fn set_level(level: LogLevel) {
    LEVEL_FROM_ENV.call_once(|| {});
    LOG_LEVEL.store(level.priority(), Ordering::Relaxed);
}

/// Current runtime log level.
pub fn level() -> LogLevel {
    init_from_env();
    LogLevel::from_priority(LOG_LEVEL.load(Ordering::Relaxed))
}

fn init_from_env() {
    LEVEL_FROM_ENV.call_once(|| {
        if let Ok(value) = std::env::var("VIREO_LOG") {
            if let Some(parsed) = LogLevel::parse(&value) {
                LOG_LEVEL.store(parsed.priority(), Ordering::Relaxed);
            }
        }
    });
}

/// Emit one log line. Prefer the `kinfo!`-family macros over calling this
/// directly.
pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    if level.priority() > self::level().priority() {
        return;
    }

    let thread = std::thread::current();
    let line = format!(
        "[{:>5}] [{}] {}",
        level.as_str(),
        thread.name().unwrap_or("?"),
        args
    );

    RING.lock().push(line.clone());

    let mut err = std::io::stderr().lock();
    let _ = writeln!(err, "{line}");
}

/// Most recent log lines, oldest first. At most `n` entries.
pub fn recent_lines(n: usize) -> Vec<String> {
    let ring = RING.lock();
    let skip = ring.lines.len().saturating_sub(n);
    ring.lines.iter().skip(skip).cloned().collect()
}
