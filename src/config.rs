//! Configuration.
//!
//! CLI parsing via `clap`'s derive API: flags parse into [`Cli`], then
//! convert into a plain [`Config`] the rest of the crate carries around.

use std::path::PathBuf;

use clap::Parser;

/// `monitor [-g graph.gv] [-t snapshot_dir] [-s section_name] [-i] -b bb_script -c corpus_dir -- sut [args...]`
#[derive(Debug, Parser)]
#[clap(name = "btsmon", about = "branch-trace coverage monitor")]
pub struct Cli {
    /// Cumulative coverage graph written here in DOT on exit.
    #[clap(short = 'g', long = "graph")]
    pub graph: Option<PathBuf>,

    /// Per-new-coverage snapshot graphs written as `<dir>/graph.<n>.gv`.
    #[clap(short = 't', long = "snapshot-dir")]
    pub snapshot_dir: Option<PathBuf>,

    /// Restrict branches to this ELF section of the SUT.
    #[clap(short = 's', long = "section")]
    pub section: Option<String>,

    /// On exit, log the whole diversity table.
    #[clap(short = 'i')]
    pub dump_diversity: bool,

    /// Basic-block helper script (required).
    #[clap(short = 'b', long = "bb-script")]
    pub bb_script: PathBuf,

    /// Corpus watch directory (required).
    #[clap(short = 'c', long = "corpus")]
    pub corpus_dir: PathBuf,

    /// Raise log verbosity; repeatable.
    #[clap(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// SUT command and arguments, everything after `--`.
    #[clap(required = true, last = true)]
    pub sut: Vec<String>,
}

/// Process-wide configuration built once from parsed args.
#[derive(Debug, Clone)]
pub struct Config {
    pub graph: Option<PathBuf>,
    pub snapshot_dir: Option<PathBuf>,
    pub section: Option<String>,
    pub dump_diversity: bool,
    pub bb_script: PathBuf,
    pub corpus_dir: PathBuf,
    pub sut: Vec<String>,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Self {
            graph: cli.graph,
            snapshot_dir: cli.snapshot_dir,
            section: cli.section,
            dump_diversity: cli.dump_diversity,
            bb_script: cli.bb_script,
            corpus_dir: cli.corpus_dir,
            sut: cli.sut,
        }
    }
}

/// Maps repeated `-v` flags onto [`crate::log::Level`]: absent, only
/// `Info`+ prints; one or more `-v` reaches `Debug`.
pub fn verbosity_from_count(count: u8) -> crate::log::Level {
    if count > 0 {
        crate::log::Level::Debug
    } else {
        crate::log::Level::Info
    }
}
