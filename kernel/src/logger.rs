//! Serial-backed `log` sink.
//!
//! The `log` crate is the kernel's logging facade; records are rendered as
//! `[LEVEL] target: message` lines on the serial console. The level filter
//! defaults to `Info` and can be raised from the boot command line
//! (`loglevel=debug`).

use log::{LevelFilter, Log, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("[{:>5}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Install the serial logger. Safe to call once; a second call is a no-op
/// because `set_logger` refuses to replace an installed logger.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(level);
}
