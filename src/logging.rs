//! `log` backend writing to the hypervisor console.

use log::{LevelFilter, Log, Metadata, Record};
use spin::Once;

struct Sink {
    write: fn(&str),
    cpu_id: fn() -> usize,
}

struct HvLogger;

static SINK: Once<Sink> = Once::new();
static LOGGER: HvLogger = HvLogger;

impl Log for HvLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(sink) = SINK.get() {
            let line = format!(
                "[{:<5} CPU{}] {}\n",
                record.level(),
                (sink.cpu_id)(),
                record.args()
            );
            (sink.write)(&line);
        }
    }

    fn flush(&self) {}
}

/// Installs the console logger.
///
/// Only the first call takes effect; later calls keep the existing sink.
pub fn init(write: fn(&str), cpu_id: fn() -> usize, level: LevelFilter) {
    SINK.call_once(|| Sink { write, cpu_id });
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Log level selected by the `LOG` variable at build time.
pub fn default_level() -> LevelFilter {
    match option_env!("LOG") {
        Some("off") => LevelFilter::Off,
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Info,
    }
}
