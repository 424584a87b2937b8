use clap::Parser;

use btsmon::config::{self, Cli, Config};
use btsmon::error::error_exit;
use btsmon::ingest;
use btsmon::log::{self, Level};
use btsmon::Monitor;

extern "C" fn handle_sigint(_: libc::c_int) {
    ingest::SHUTDOWN.store(true, std::sync::atomic::Ordering::Relaxed);
}

fn install_sigint_handler() {
    // SAFETY: `handle_sigint` only stores to an `AtomicBool`, which is
    // async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
    }
}

fn main() {
    let cli = Cli::parse();
    log::set_verbosity(config::verbosity_from_count(cli.verbose));
    let config: Config = cli.into();

    install_sigint_handler();

    let mut monitor = match Monitor::new(config) {
        Ok(m) => m,
        Err(e) => error_exit(&e.to_string()),
    };

    let run_result = monitor.run();
    if let Err(e) = &run_result {
        log::log(Level::Error, &format!("ingestion loop terminated: {e}"));
    }

    if let Err(e) = monitor.shutdown() {
        error_exit(&format!("shutdown failed: {e}"));
    }

    if let Err(e) = run_result {
        error_exit(&format!("ingestion loop terminated: {e}"));
    }
}
