//! Colored console logger, installed once at worker start.
//!
//! Structurally the same `log::Log` implementation the teacher web server
//! used (`webserver::logger::Logger`): a level-tagged, ANSI-colored line to
//! the console. Transfer start/end lines replace the teacher's HTTP
//! request/response lines.

use chrono::Utc;
use log::{Level, LevelFilter, Metadata, Record};
use std::sync::OnceLock;

const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const GREEN: &str = "\x1b[32m";
const DIM: &str = "\x1b[2m";
const RESET: &str = "\x1b[0m";

/// The crate's `log::Log` implementation.
///
/// Writes to stderr (stdout is reserved for `-o -` output), colored by
/// level.
pub struct Logger;

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match record.level() {
            Level::Error => eprintln!("{RED}[ERROR] - {}{RESET}", record.args()),
            Level::Warn => eprintln!("{YELLOW}[WARN ]{RESET} - {}", record.args()),
            Level::Info => eprintln!("{BLUE}[INFO ]{RESET} - {}", record.args()),
            Level::Debug => eprintln!("{GREEN}[DEBUG]{RESET} - {}", record.args()),
            Level::Trace => eprintln!("{DIM}[TRACE] - {}{RESET}", record.args()),
        }
    }

    fn flush(&self) {}
}

static LOGGER: Logger = Logger;
static INIT: OnceLock<()> = OnceLock::new();

/// Installs [`Logger`] as the global `log` sink. `verbose` maps to
/// `Info`/`Debug` the same way the original's `-v`/`HTTP_DEBUG` pair did;
/// idempotent, so it's safe to call from both the parent and the worker
/// after a fork.
pub fn init(verbose: bool) {
    INIT.get_or_init(|| {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        });
    });
}

/// Logs the start of a transfer: `Trying host... / Connected to host`
/// style, timestamped like the teacher's `log_request_start`.
pub fn log_transfer_start(url: &str) {
    log::info!("[{}] fetching {url}", Utc::now().format("%Y-%m-%d %H:%M:%S"));
}

/// Logs the end of a transfer, coloring by outcome the way the teacher
/// colored HTTP status classes.
pub fn log_transfer_end(url: &str, bytes: u64, ok: bool) {
    let color = if ok { GREEN } else { RED };
    log::info!("{color}{url} -> {bytes} bytes{RESET}");
}
