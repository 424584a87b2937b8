//! Leveled, colorized logging.
//!
//! `ingest` logs at `Info` for new coverage or corpus-origin inputs, and at
//! `Debug` otherwise, gated by a single process-wide verbosity level.

use core::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use console::style;

#[derive(Debug, Eq, PartialEq, PartialOrd, Ord, Copy, Clone)]
#[repr(u8)]
pub enum Level {
    Fatal = 0,
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Level::Fatal => write!(f, "{}", style("[!]").red().bold()),
            Level::Error => write!(f, "{}", style("[!]").red()),
            Level::Warn => write!(f, "{}", style("[~]").yellow()),
            Level::Info => write!(f, "{}", style("[+]").green()),
            Level::Debug => write!(f, "{}", style("[-]").blue()),
        }
    }
}

/// Process-wide verbosity; `-v` on the CLI raises it to `Debug`.
static VERBOSITY: AtomicU8 = AtomicU8::new(Level::Info as u8);

pub fn set_verbosity(level: Level) {
    VERBOSITY.store(level as u8, Ordering::Relaxed);
}

fn enabled(level: Level) -> bool {
    (level as u8) <= VERBOSITY.load(Ordering::Relaxed)
}

pub fn log(level: Level, msg: &str) {
    if enabled(level) {
        println!("{} {}", level, msg);
    }
}

/// Picks the level based on whether this trace is "interesting" (new
/// coverage, or a corpus-sourced input).
pub fn log_trace_line(line: &str, interesting: bool) {
    log(if interesting { Level::Info } else { Level::Debug }, line);
}
