//! Driver logging facility
//!
//! The driver logs through the `log` crate facade. Where the records end up
//! is decided by the embedding system: it installs a sink function at `init`
//! (typically its console or serial writer). Tests install one that prints
//! to stdout.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Mutex;

/// Destination for formatted log records.
pub type Sink = fn(&Record);

/// Global logger instance registered with the `log` crate.
pub static LOGGER: Logger = Logger::new();

/// Logger that forwards enabled records to the installed sink.
pub struct Logger {
    sink: Mutex<Option<Sink>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    pub const fn new() -> Logger {
        Logger {
            sink: Mutex::new(None),
        }
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            if let Some(sink) = *self.sink.lock() {
                sink(record);
            }
        }
    }

    fn flush(&self) {}
}

/// Installs the sink and registers the logger.
///
/// Debug builds log at `Debug`, release builds at `Info`. Calling this more
/// than once only replaces the sink.
pub fn init(sink: Sink) {
    *LOGGER.sink.lock() = Some(sink);
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(
            #[cfg(debug_assertions)]
            LevelFilter::Debug,
            #[cfg(not(debug_assertions))]
            LevelFilter::Info,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stdout_sink(record: &Record) {
        println!("[{}] {}", record.level(), record.args());
    }

    #[test]
    fn init_is_idempotent() {
        init(stdout_sink);
        init(stdout_sink);
        log::info!("logger installed");
    }
}
