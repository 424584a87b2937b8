//! Error taxonomy.
//!
//! Categories (1)-(3) are fatal and surfaced through [`error_exit`]; (4) is
//! represented by `Ok(None)` at the call site rather than an error variant;
//! (5) never reaches a `Result` at all.

use std::process;

use crate::log::{self, Level};

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// Category 1: missing required flag, bad ELF path, missing section.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("ELF error: {0}")]
    Elf(String),

    #[error("basic-block loader error: {0}")]
    BasicBlocks(String),

    /// Category 2: BTS absent, `perf_event_open` rejected.
    #[error("platform not supported: {0}")]
    PlatformUnsupported(String),

    /// Category 3: pipe/fork/waitpid failure while tracing one input.
    #[error("trace failed: {0}")]
    Trace(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Zmq(#[from] zmq::Error),

    #[error(transparent)]
    Notify(#[from] notify::Error),
}

/// Reports an unrecoverable error through the leveled logger and exits.
pub fn error_exit(msg: &str) -> ! {
    log::log(Level::Fatal, msg);
    process::exit(1);
}
