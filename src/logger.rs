use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::sync::Arc;

/// Receives every formatted log line that clears the installed filters.
pub type LogSink = dyn Fn(LogLevel, &str) + Send + Sync;

static LOGGER: Lazy<LogManager> = Lazy::new(LogManager::new);

pub fn error(message: impl Into<String>) {
    LOGGER.log(LogLevel::Error, message.into());
}

pub fn warn(message: impl Into<String>) {
    LOGGER.log(LogLevel::Warn, message.into());
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

/// Installs (or clears, with `None`) the process-wide log sink. Until a sink
/// is installed every log line is discarded.
pub fn install_sink(sink: Option<Box<LogSink>>, level: Option<&str>) {
    LOGGER.install_sink(sink, level);
}

pub fn set_breadcrumb_mask(mask: BreadcrumbFlags) {
    LOGGER.set_breadcrumb_mask(mask);
}

bitflags! {
    #[derive(Clone, Copy, Debug)]
    pub struct BreadcrumbFlags: u32 {
        const SWITCH     = 0b0000_0001;
        const PROBE      = 0b0000_0010;
        const FLOW       = 0b0000_0100;
        const GENERATION = 0b0000_1000;
        const MESSENGER  = 0b0001_0000;
        const ALL        = u32::MAX;
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "error" | "err" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" | "dbg" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Clone)]
struct InstalledSink {
    sink: Arc<LogSink>,
    min_level: LogLevel,
    breadcrumbs: BreadcrumbFlags,
}

struct LogManager {
    sink: Mutex<Option<InstalledSink>>,
    prefix: String,
}

impl LogManager {
    fn new() -> Self {
        let pid = std::process::id();
        Self {
            sink: Mutex::new(None),
            prefix: format!("[lb-p{pid}]"),
        }
    }

    fn install_sink(&self, sink: Option<Box<LogSink>>, level: Option<&str>) {
        let mut guard = self.sink.lock();
        *guard = sink.map(|sink| InstalledSink {
            sink: Arc::from(sink),
            min_level: level.map(LogLevel::from_str).unwrap_or(LogLevel::Info),
            breadcrumbs: BreadcrumbFlags::empty(),
        });
    }

    fn set_breadcrumb_mask(&self, mask: BreadcrumbFlags) {
        if let Some(inner) = self.sink.lock().as_mut() {
            inner.breadcrumbs = mask;
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
        let sink = {
            let guard = self.sink.lock();
            guard.clone()
        };
        let Some(inner) = sink else { return };
        if level > inner.min_level && breadcrumbs.is_empty() {
            return;
        }
        if !breadcrumbs.is_empty() && !inner.breadcrumbs.intersects(breadcrumbs) {
            return;
        }

        let formatted = if breadcrumbs.is_empty() {
            format!("{} {}", self.prefix, message)
        } else {
            format!("{} [{}] {}", self.prefix, label_for(breadcrumbs), message)
        };
        (inner.sink)(level, &formatted);
    }
}

fn label_for(flags: BreadcrumbFlags) -> &'static str {
    if flags.contains(BreadcrumbFlags::PROBE) {
        "PROBE"
    } else if flags.contains(BreadcrumbFlags::FLOW) {
        "FLOW"
    } else if flags.contains(BreadcrumbFlags::GENERATION) {
        "GENERATION"
    } else if flags.contains(BreadcrumbFlags::MESSENGER) {
        "MESSENGER"
    } else if flags.contains(BreadcrumbFlags::SWITCH) {
        "SWITCH"
    } else {
        "LOG"
    }
}
