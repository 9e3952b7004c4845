use core::fmt;
use log::{Level, LevelFilter, Log, Metadata, Record, set_logger, set_max_level};
use spin::RwLock;

#[doc(hidden)]
pub use log;

/// Where formatted log lines end up, typically the firmware console.
pub trait LogSink: Sync {
    fn write_line(&self, args: fmt::Arguments);
}

static SINK: RwLock<Option<&'static dyn LogSink>> = RwLock::new(None);

pub struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let color = match record.level() {
            Level::Error => 31, // Red
            Level::Warn => 93,  // BrightYellow
            Level::Info => 20,  // White
            Level::Debug => 32, // Green
            Level::Trace => 90, // BrightBlack
        };
        if let Some(sink) = *SINK.read() {
            sink.write_line(format_args!(
                "\u{1B}[{}m[{:}] {}\u{1B}[0m",
                color,
                record.level(),
                record.args(),
            ));
        }
    }

    fn flush(&self) {}
}

/// Route log records to `sink`.
///
/// Calling this again swaps the sink and the level. If another logger was installed first,
/// only the level is updated.
pub fn init(sink: &'static dyn LogSink, level: LevelFilter) {
    static LOGGER: Logger = Logger;
    *SINK.write() = Some(sink);
    if set_logger(&LOGGER).is_err() {
        log::trace!("Logger already installed.");
    }
    set_max_level(level);
}

/// Improved debug macro,
/// only compiled in debug mode.
#[macro_export]
macro_rules! debug_ex {
    // debug_ex!(target: "my_target", "a {} event", "log")
    (target: $target:expr, $($arg:tt)+) => {
        #[cfg(debug_assertions)]
        {
            $crate::logging::log::log!(target: $target, $crate::logging::log::Level::Debug, $($arg)+)
        }
    };

    // debug_ex!("a {} event", "log")
    ($($arg:tt)+) => {
        #[cfg(debug_assertions)]
        {
            $crate::logging::log::log!($crate::logging::log::Level::Debug, $($arg)+)
        }
    }
}
