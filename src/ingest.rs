//! Input ingestor.
//!
//! Owns the only genuinely stateful loop in the system: it multiplexes a
//! ZMQ `PULL` socket (fed by the SUT-side shim) and a watched corpus
//! directory, feeding whichever arrives first to the tracer and aggregator.
//! Single-threaded and cooperative.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};

use notify::event::{AccessKind, AccessMode, RemoveKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::aggregator::{self, DiversityTable, HitMap};
use crate::bblocks::BasicBlock;
use crate::config::Config;
use crate::crc64;
use crate::elf::SectionBounds;
use crate::error::MonitorError;
use crate::graph::Graph;
use crate::log;
use crate::sink::{self, InputOrigin};
use crate::tracer::Tracer;

/// Flipped by the SIGINT handler installed in `main.rs`; checked once per
/// loop iteration.
pub static SHUTDOWN: AtomicBool = AtomicBool::new(false);

const MAX_CORPUS_INPUT: usize = 1024 * 1024;
const BACKOFF: Duration = Duration::from_micros(100);

/// Watches a corpus directory for new files, falling back to watching its
/// parent directory until the corpus directory itself is created. Fatal if
/// the corpus path has no parent to watch.
struct CorpusWatcher {
    watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    corpus_dir: PathBuf,
    ready: bool,
}

impl CorpusWatcher {
    fn new(corpus_dir: &Path) -> Result<Self, MonitorError> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;

        let ready = corpus_dir.exists();
        if ready {
            watcher.watch(corpus_dir, RecursiveMode::NonRecursive)?;
        } else {
            let parent = corpus_dir.parent().ok_or_else(|| {
                MonitorError::Config(format!(
                    "corpus path {corpus_dir:?} has no parent directory to watch"
                ))
            })?;
            watcher.watch(parent, RecursiveMode::NonRecursive)?;
        }

        Ok(Self { watcher, rx, corpus_dir: corpus_dir.to_path_buf(), ready })
    }

    /// Drains at most one pending event, returning corpus input bytes when
    /// a file-close-for-write lands in the watched directory.
    fn poll(&mut self) -> Result<Option<Vec<u8>>, MonitorError> {
        let event = match self.rx.try_recv() {
            Ok(Ok(event)) => event,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Ok(None),
        };

        if !self.ready {
            if matches!(event.kind, EventKind::Create(_))
                && event.paths.iter().any(|p| p == &self.corpus_dir)
            {
                self.watcher.watch(&self.corpus_dir, RecursiveMode::NonRecursive)?;
                self.ready = true;
            }
            return Ok(None);
        }

        let in_watched_dir = event
            .paths
            .iter()
            .any(|p| p == &self.corpus_dir || p.parent() == Some(self.corpus_dir.as_path()));
        if !in_watched_dir {
            return Ok(None);
        }

        if matches!(event.kind, EventKind::Remove(RemoveKind::Any))
            && event.paths.iter().any(|p| p == &self.corpus_dir)
        {
            return Err(MonitorError::Config(format!(
                "corpus directory {:?} was deleted",
                self.corpus_dir
            )));
        }

        if matches!(event.kind, EventKind::Access(AccessKind::Close(AccessMode::Write))) {
            if let Some(path) = event.paths.first() {
                let bytes = std::fs::read(path)?;
                let bytes = if bytes.len() > MAX_CORPUS_INPUT {
                    bytes[..MAX_CORPUS_INPUT].to_vec()
                } else {
                    bytes
                };
                return Ok(Some(bytes));
            }
        }

        Ok(None)
    }
}

/// The mutable state that survives across the whole run: hit map,
/// cumulative graph, diversity table, and the input counter.
pub struct IngestState {
    pub hit_map: HitMap,
    pub cumulative_graph: Graph,
    pub diversity: DiversityTable,
    pub input_n: u64,
}

impl IngestState {
    pub fn new() -> Self {
        Self {
            hit_map: HitMap::new(),
            cumulative_graph: Graph::new(),
            diversity: DiversityTable::new(),
            input_n: 0,
        }
    }
}

impl Default for IngestState {
    fn default() -> Self {
        Self::new()
    }
}

fn is_interesting(new_branches: usize, origin: InputOrigin) -> bool {
    new_branches > 0 || origin == InputOrigin::Corpus
}

/// Runs the main ingestion loop until SIGINT or a fatal error.
pub fn run(
    config: &Config,
    tracer: &Tracer,
    blocks: &[BasicBlock],
    bounds: Option<SectionBounds>,
    state: &mut IngestState,
) -> Result<(), MonitorError> {
    let ctx = zmq::Context::new();
    let socket = ctx.socket(zmq::PULL)?;
    socket.bind("tcp://*:5558")?;

    let mut corpus = CorpusWatcher::new(&config.corpus_dir)?;

    loop {
        let shutdown_requested = SHUTDOWN.load(Ordering::Relaxed);

        let (input, origin) = match socket.recv_bytes(zmq::DONTWAIT) {
            Ok(bytes) => (Some(bytes), InputOrigin::Queue),
            Err(zmq::Error::EAGAIN) => match corpus.poll()? {
                Some(bytes) => (Some(bytes), InputOrigin::Corpus),
                None => (None, InputOrigin::Corpus),
            },
            Err(e) => return Err(e.into()),
        };

        let Some(input) = input else {
            if shutdown_requested {
                return Ok(());
            }
            std::thread::sleep(BACKOFF);
            continue;
        };

        let fingerprint = crc64::crc64(&input);
        let diversity = state.diversity.record(fingerprint);

        let started = Instant::now();
        let records = tracer.trace(&input, &config.sut)?;
        let result = aggregator::process(
            &records,
            blocks,
            bounds,
            &mut state.hit_map,
            &mut state.cumulative_graph,
            config.snapshot_dir.as_deref(),
            state.input_n,
        )?;
        let elapsed_ms = started.elapsed().as_millis();

        let line = sink::format_trace_line(
            result.total_branches,
            result.filtered,
            result.new_branches,
            elapsed_ms,
            diversity.seen_times,
            diversity.seen_avg,
            origin,
        );
        log::log_trace_line(&line, is_interesting(result.new_branches, origin));

        state.input_n += 1;

        if shutdown_requested {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_coverage_is_always_interesting() {
        assert!(is_interesting(1, InputOrigin::Queue));
        assert!(is_interesting(1, InputOrigin::Corpus));
    }

    #[test]
    fn corpus_origin_is_interesting_even_without_new_coverage() {
        assert!(is_interesting(0, InputOrigin::Corpus));
    }

    #[test]
    fn queue_origin_without_new_coverage_is_not_interesting() {
        assert!(!is_interesting(0, InputOrigin::Queue));
    }

    #[test]
    fn watcher_falls_back_to_parent_when_corpus_dir_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("not-yet-created");
        let watcher = CorpusWatcher::new(&missing).unwrap();
        assert!(!watcher.ready);
    }

    #[test]
    fn watcher_is_ready_immediately_when_corpus_dir_exists() {
        let dir = tempfile::tempdir().unwrap();
        let watcher = CorpusWatcher::new(dir.path()).unwrap();
        assert!(watcher.ready);
    }
}
