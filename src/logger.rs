use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
}

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn info(message: impl Into<String>) {
    LOGGER.log(LogLevel::Info, message.into());
}

pub fn debug(message: impl Into<String>) {
    LOGGER.log(LogLevel::Debug, message.into());
}

pub fn breadcrumb(flag: BreadcrumbFlags, message: impl Into<String>) {
    LOGGER.breadcrumb(flag, message.into());
}

/// Installs (or with `None`, removes) the process-wide log sink.
pub fn install_sink(
    sink: Option<LogSink>,
    level: Option<&str>,
    breadcrumbs: BreadcrumbFlags,
) -> io::Result<()> {
    LOGGER.install_sink(sink, level, breadcrumbs)
}

pub fn set_breadcrumb_mask(mask: u32) {
    LOGGER.set_breadcrumb_mask(mask);
}

bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct BreadcrumbFlags: u32 {
        const BOOT     = 0b0000_0001;
        const UDP      = 0b0000_0010;
        const TCP      = 0b0000_0100;
        const MUTATOR  = 0b0000_1000;
        const REGISTRY = 0b0001_0000;
        const ALL      = u32::MAX;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "error" | "err" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" | "dbg" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// Where log lines go.
#[derive(Clone, Debug)]
pub enum LogSink {
    Stderr,
    /// Appends to the given file, creating it if needed.
    File(PathBuf),
}

enum SinkWriter {
    Stderr,
    File(File),
}

struct LogSinkInner {
    writer: SinkWriter,
    breadcrumbs: BreadcrumbFlags,
    min_level: LogLevel,
}

struct LogManager {
    sink: Mutex<Option<LogSinkInner>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            sink: Mutex::new(None),
            prefix: format!("[fuzz-proxy p{pid}]"),
        }
    }

    fn install_sink(
        &self,
        sink: Option<LogSink>,
        level: Option<&str>,
        breadcrumbs: BreadcrumbFlags,
    ) -> io::Result<()> {
        let inner = match sink {
            Some(sink) => {
                let writer = match sink {
                    LogSink::Stderr => SinkWriter::Stderr,
                    LogSink::File(path) => SinkWriter::File(
                        OpenOptions::new().create(true).append(true).open(path)?,
                    ),
                };
                Some(LogSinkInner {
                    writer,
                    breadcrumbs,
                    min_level: level.map(LogLevel::from_str).unwrap_or(LogLevel::Info),
                })
            }
            None => None,
        };
        *self.sink.lock() = inner;
        Ok(())
    }

    fn set_breadcrumb_mask(&self, mask: u32) {
        if let Some(inner) = self.sink.lock().as_mut() {
            inner.breadcrumbs = BreadcrumbFlags::from_bits_truncate(mask);
        }
    }

    fn log(&self, level: LogLevel, message: String) {
        if message.is_empty() {
            return;
        }
        self.dispatch(level, BreadcrumbFlags::empty(), message);
    }

    fn breadcrumb(&self, flag: BreadcrumbFlags, message: String) {
        if message.is_empty() || flag.is_empty() {
            return;
        }
        self.dispatch(LogLevel::Debug, flag, message);
    }

    fn dispatch(&self, level: LogLevel, breadcrumbs: BreadcrumbFlags, message: String) {
        let mut guard = self.sink.lock();
        let Some(inner) = guard.as_mut() else { return };
        if level > inner.min_level && breadcrumbs.is_empty() {
            return;
        }
        if !breadcrumbs.is_empty() && !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let formatted = if !breadcrumbs.is_empty() {
            let label = label_for(breadcrumbs);
            format!(
                "{} {} [{}] [{}] {}\n",
                unix_millis(),
                self.prefix,
                level.as_str(),
                label,
                message
            )
        } else {
            format!(
                "{} {} [{}] {}\n",
                unix_millis(),
                self.prefix,
                level.as_str(),
                message
            )
        };

        // A failing sink must never take a relay thread down with it.
        let _ = match &mut inner.writer {
            SinkWriter::Stderr => io::stderr().lock().write_all(formatted.as_bytes()),
            SinkWriter::File(file) => file.write_all(formatted.as_bytes()),
        };
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::UDP) {
        "UDP"
    } else if flags.contains(BreadcrumbFlags::TCP) {
        "TCP"
    } else if flags.contains(BreadcrumbFlags::MUTATOR) {
        "MUTATOR"
    } else if flags.contains(BreadcrumbFlags::REGISTRY) {
        "REGISTRY"
    } else if flags.contains(BreadcrumbFlags::BOOT) {
        "BOOT"
    } else {
        "LOG"
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Rate-Limited Error Logging
// ============================================================================
// A relay thread spinning on a broken socket or a missing mutator would
// otherwise flood the log. Each category is limited independently.

/// Minimum interval between logs of the same error category (in milliseconds).
const RATE_LIMIT_INTERVAL_MS: u64 = 1000;

/// Error categories for rate-limited logging.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// socket/bind/option failures while building relays
    SocketSetup,
    /// receive failures on relay sockets
    Receive,
    /// send/forward failures on relay sockets
    Send,
    /// mutator spawn/pipe/timeout failures
    Mutator,
}

impl ErrorCategory {
    fn index(self) -> usize {
        match self {
            Self::SocketSetup => 0,
            Self::Receive => 1,
            Self::Send => 2,
            Self::Mutator => 3,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::SocketSetup => "SOCKET_SETUP",
            Self::Receive => "RECEIVE",
            Self::Send => "SEND",
            Self::Mutator => "MUTATOR",
        }
    }
}

/// Uses atomic timestamps for lock-free rate limiting.
struct RateLimitedLogger {
    /// Last log time (unix millis) for each error category.
    last_log_times: [AtomicU64; 4],
}

impl RateLimitedLogger {
    const fn new() -> Self {
        Self {
            last_log_times: [
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
                AtomicU64::new(0),
            ],
        }
    }

    /// Returns true if the log was emitted, false if rate-limited.
    fn try_log(&self, category: ErrorCategory, message: &str) -> bool {
        let now_ms = unix_millis();

        let idx = category.index();
        let last = self.last_log_times[idx].load(Ordering::Relaxed);

        if now_ms.saturating_sub(last) < RATE_LIMIT_INTERVAL_MS {
            return false;
        }

        if self.last_log_times[idx]
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            let formatted = format!("[{}] {}", category.label(), message);
            warn(formatted);
            true
        } else {
            false
        }
    }
}

static RATE_LIMITER: RateLimitedLogger = RateLimitedLogger::new();

/// Log an error with rate limiting to prevent log flooding.
/// Only one log per category per second will be emitted.
/// Returns true if the log was emitted, false if suppressed.
pub fn rate_limited_error(category: ErrorCategory, message: impl Into<String>) -> bool {
    RATE_LIMITER.try_log(category, &message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_parsing_accepts_aliases() {
        assert_eq!(LogLevel::from_str("ERR"), LogLevel::Error);
        assert_eq!(LogLevel::from_str("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("dbg"), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("verbose"), LogLevel::Info);
    }

    #[test]
    fn rate_limiter_suppresses_burst() {
        let limiter = RateLimitedLogger::new();
        assert!(limiter.try_log(ErrorCategory::Receive, "first"));
        assert!(!limiter.try_log(ErrorCategory::Receive, "second"));
        assert!(limiter.try_log(ErrorCategory::Send, "other category"));
    }

    #[test]
    fn label_prefers_most_specific_flag() {
        assert_eq!(label_for(BreadcrumbFlags::TCP), "TCP");
        assert_eq!(
            label_for(BreadcrumbFlags::UDP | BreadcrumbFlags::MUTATOR),
            "UDP"
        );
        assert_eq!(label_for(BreadcrumbFlags::empty()), "LOG");
    }
}
