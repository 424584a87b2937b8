//! # btsmon
//!
//! A branch-trace coverage monitor that cooperates with an external fuzzer:
//! forks the System Under Test (SUT) under Intel BTS, collapses raw branch
//! edges onto basic-block boundaries, aggregates them into a cumulative
//! coverage graph, and emits DOT graphs plus per-input log lines.

pub mod aggregator;
pub mod bblocks;
pub mod config;
pub mod crc64;
pub mod elf;
pub mod error;
pub mod graph;
pub mod ingest;
pub mod log;
pub mod sink;
pub mod tracer;

use num_format::{Locale, ToFormattedString};

use crate::aggregator::HitMap;
use crate::bblocks::BasicBlock;
use crate::config::Config;
use crate::elf::SectionBounds;
use crate::error::MonitorError;
use crate::graph::Graph;
use crate::ingest::IngestState;
use crate::log::{self, Level};
use crate::tracer::Tracer;

/// One per run; owns the tracer, basic-block table, and all mutable
/// ingestion state. Built by [`Monitor::new`], driven by [`ingest::run`],
/// torn down by [`Monitor::shutdown`].
pub struct Monitor {
    pub config: Config,
    pub bounds: Option<SectionBounds>,
    pub blocks: Vec<BasicBlock>,
    pub tracer: Tracer,
    pub state: IngestState,
}

impl Monitor {
    /// Performs all startup work: ELF section lookup (if `-s` was given),
    /// basic-block helper invocation, and a BTS-availability probe, all
    /// before the event loop starts.
    pub fn new(config: Config) -> Result<Self, MonitorError> {
        let sut_binary = config
            .sut
            .first()
            .ok_or_else(|| MonitorError::Config("no SUT command given".to_string()))?;

        elf::verify_executable(sut_binary)?;

        let bounds = match &config.section {
            Some(name) => Some(elf::find_section(sut_binary, name)?),
            None => None,
        };

        let blocks = bblocks::load_basic_blocks(
            config.bb_script.to_str().ok_or_else(|| {
                MonitorError::Config("basic-block script path is not valid UTF-8".to_string())
            })?,
            sut_binary,
        )?;

        let tracer = Tracer::new()?;

        Ok(Self { config, bounds, blocks, tracer, state: IngestState::new() })
    }

    pub fn run(&mut self) -> Result<(), MonitorError> {
        ingest::run(&self.config, &self.tracer, &self.blocks, self.bounds, &mut self.state)
    }

    /// A single pass over the cumulative hit map that writes the DOT file
    /// (if `-g` was given) and otherwise just logs node out-degrees, plus
    /// the optional `-i` diversity-table dump.
    pub fn shutdown(&self) -> Result<(), MonitorError> {
        let target = match &self.config.graph {
            Some(path) => sink::DumpTarget::DumpTo(path.clone()),
            None => sink::DumpTarget::LogOnly,
        };

        match target {
            sink::DumpTarget::DumpTo(path) => {
                sink::write_cumulative_dot(&path, &self.state.cumulative_graph, |from, to| {
                    self.state.hit_map.count((from, to))
                })?;
            }
            sink::DumpTarget::LogOnly => {
                let degrees = sink::format_node_degrees(&self.state.cumulative_graph);
                if !degrees.is_empty() {
                    log::log(Level::Info, &degrees);
                }
            }
            sink::DumpTarget::Silent => {}
        }

        log::log(
            Level::Info,
            &format!(
                "processed {} inputs, {} edges, {} nodes",
                self.state.input_n.to_formatted_string(&Locale::en),
                self.state.hit_map.len().to_formatted_string(&Locale::en),
                self.state.cumulative_graph.node_count().to_formatted_string(&Locale::en),
            ),
        );

        if self.config.dump_diversity {
            log::log(
                Level::Info,
                &format!(
                    "diversity: {} distinct fingerprints, seen_total={}",
                    self.state.diversity.distinct_count(),
                    self.state.diversity.seen_total(),
                ),
            );
        }

        Ok(())
    }
}
