//! Coverage aggregator.
//!
//! Turns one trace's raw branch records into hit-map updates, cumulative
//! graph edges, and (optionally) a per-input snapshot graph. This is the
//! module every other piece of the pipeline feeds into:
//! `tracer::trace` produces [`BranchRecord`]s, `ingest::run` calls
//! [`process`] once per input, and the result drives the log line built in
//! `sink`.

use std::collections::HashMap;
use std::path::Path;

use rustc_hash::FxHashMap;

use crate::bblocks::BasicBlock;
use crate::elf::SectionBounds;
use crate::graph::Graph;
use crate::sink;
use crate::tracer::BranchRecord;

/// Cumulative `Edge -> hit count` map. Entries are created on first
/// observation and never removed.
#[derive(Debug, Default)]
pub struct HitMap {
    counts: HashMap<(u64, u64), u64>,
}

impl HitMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up `edge`, incrementing its counter if present or inserting it
    /// with count `1` otherwise. Returns `true` iff this is the edge's
    /// first observation.
    pub fn record(&mut self, edge: (u64, u64)) -> bool {
        match self.counts.entry(edge) {
            std::collections::hash_map::Entry::Occupied(mut e) => {
                *e.get_mut() += 1;
                false
            }
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(1);
                true
            }
        }
    }

    pub fn count(&self, edge: (u64, u64)) -> u64 {
        self.counts.get(&edge).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(u64, u64), &u64)> {
        self.counts.iter()
    }
}

/// Fingerprint table for input-diversity tracking.
#[derive(Debug, Default)]
pub struct DiversityTable {
    counts: FxHashMap<u64, u32>,
    seen_total: u64,
}

/// One [`DiversityTable::record`] observation: how many times this exact
/// fingerprint has been seen, and the running average across all distinct
/// fingerprints at the moment this input arrived.
#[derive(Debug, Clone, Copy)]
pub struct Diversity {
    pub seen_times: u32,
    pub seen_avg: f64,
}

impl DiversityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one observation of `fingerprint`. Once `seen_avg` exceeds
    /// `2.0`, `seen_total` resets to the number of distinct fingerprints.
    pub fn record(&mut self, fingerprint: u64) -> Diversity {
        let seen_times = {
            let entry = self.counts.entry(fingerprint).or_insert(0);
            *entry += 1;
            *entry
        };
        self.seen_total += 1;

        let distinct = self.counts.len() as u64;
        let seen_avg = self.seen_total as f64 / distinct as f64;
        if seen_avg > 2.0 {
            self.seen_total = distinct;
        }

        Diversity { seen_times, seen_avg }
    }

    pub fn distinct_count(&self) -> usize {
        self.counts.len()
    }

    pub fn seen_total(&self) -> u64 {
        self.seen_total
    }
}

/// Outcome of one [`process`] call, feeding directly into the log line
/// built by `sink::format_trace_line`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateResult {
    pub total_branches: usize,
    pub filtered: usize,
    pub new_branches: usize,
}

/// Snaps `addr` to the first basic block containing it (`bb.from <= addr <
/// bb.to`); unmatched addresses are returned unchanged. `blocks` must be
/// sorted by `from`, as guaranteed by [`crate::bblocks::load_basic_blocks`].
pub fn snap(blocks: &[BasicBlock], addr: u64) -> u64 {
    for bb in blocks {
        if bb.from > addr {
            break;
        }
        if addr < bb.to {
            return bb.from;
        }
    }
    addr
}

fn in_bounds(bounds: Option<SectionBounds>, addr: u64) -> bool {
    match bounds {
        None => true,
        Some(b) => addr >= b.start && addr <= b.end,
    }
}

/// Processes one trace's branch records: filters by section bounds, snaps
/// to basic blocks, deduplicates into `hit_map`, accumulates into
/// `cumulative_graph`, and (if `snapshot_dir` is set) dumps a per-input DOT
/// snapshot when this trace contributed new coverage.
pub fn process(
    records: &[BranchRecord],
    blocks: &[BasicBlock],
    bounds: Option<SectionBounds>,
    hit_map: &mut HitMap,
    cumulative_graph: &mut Graph,
    snapshot_dir: Option<&Path>,
    input_n: u64,
) -> std::io::Result<AggregateResult> {
    let total_branches = records.len();
    let mut filtered = 0usize;
    let mut new_branches = 0usize;
    let mut snapshot_graph = snapshot_dir.map(|_| Graph::new());

    for record in records {
        if !in_bounds(bounds, record.from) || !in_bounds(bounds, record.to) {
            filtered += 1;
            continue;
        }

        let from_bb = snap(blocks, record.from);
        let to_bb = snap(blocks, record.to);

        if hit_map.record((from_bb, to_bb)) {
            new_branches += 1;
        }
        cumulative_graph.add(from_bb, to_bb);
        if let Some(g) = snapshot_graph.as_mut() {
            g.add(from_bb, to_bb);
        }
    }

    if new_branches > 0 {
        if let (Some(dir), Some(graph)) = (snapshot_dir, &snapshot_graph) {
            let path = dir.join(format!("graph.{input_n}.gv"));
            sink::write_snapshot_dot(&path, graph)?;
        }
    }

    Ok(AggregateResult { total_branches, filtered, new_branches })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bb(from: u64, to: u64) -> BasicBlock {
        BasicBlock { from, to }
    }

    fn rec(from: u64, to: u64) -> BranchRecord {
        BranchRecord { from, to, misc: 0 }
    }

    #[test]
    fn hit_map_records_first_observation_then_increments() {
        let mut hm = HitMap::new();
        assert!(hm.record((1, 2)));
        assert!(!hm.record((1, 2)));
        assert_eq!(hm.count((1, 2)), 2);
    }

    #[test]
    fn snap_picks_first_containing_block() {
        let blocks = [bb(0x1000, 0x1010), bb(0x1010, 0x1020)];
        assert_eq!(snap(&blocks, 0x1004), 0x1000);
        assert_eq!(snap(&blocks, 0x1018), 0x1010);
    }

    #[test]
    fn snap_leaves_unmatched_addresses_verbatim() {
        let blocks = [bb(0x1000, 0x1010)];
        assert_eq!(snap(&blocks, 0x5000), 0x5000);
    }

    #[test]
    fn snap_with_empty_block_list_is_identity() {
        assert_eq!(snap(&[], 0x1234), 0x1234);
    }

    // Single input producing one new cross-block edge.
    #[test]
    fn scenario_hello_bts() {
        let blocks = [bb(0x1000, 0x1004), bb(0x2000, 0x2004)];
        let records = [rec(0x1000, 0x2000)];
        let mut hm = HitMap::new();
        let mut graph = Graph::new();
        let result = process(&records, &blocks, None, &mut hm, &mut graph, None, 0).unwrap();
        assert_eq!(result.new_branches, 1);
        assert_eq!(hm.count((0x1000, 0x2000)), 1);
    }

    // Duplicate edges across two identical inputs.
    #[test]
    fn scenario_duplicate_edges() {
        let blocks = [bb(0xA, 0xB), bb(0xB, 0xC), bb(0xC, 0xD)];
        let mut hm = HitMap::new();
        let mut graph = Graph::new();
        for _ in 0..2 {
            let records = [rec(0xA, 0xB), rec(0xA, 0xB), rec(0xB, 0xC)];
            process(&records, &blocks, None, &mut hm, &mut graph, None, 0).unwrap();
        }
        assert_eq!(hm.count((0xA, 0xB)), 4);
        assert_eq!(hm.count((0xB, 0xC)), 2);
        assert_eq!(graph.node_count(), 2);
        assert_eq!(graph.edge_count(), 2);
    }

    // Section filter.
    #[test]
    fn scenario_section_filter() {
        let bounds = SectionBounds { start: 0x400000, end: 0x400FFF, size: 0x1000 };
        let blocks = [bb(0x400100, 0x400200), bb(0x400200, 0x400300)];
        let records = [rec(0x400100, 0x400200), rec(0x400200, 0x7F0000)];
        let mut hm = HitMap::new();
        let mut graph = Graph::new();
        let result =
            process(&records, &blocks, Some(bounds), &mut hm, &mut graph, None, 0).unwrap();
        assert_eq!(result.filtered, 1);
        assert_eq!(hm.count((0x400100, 0x400200)), 1);
        assert_eq!(hm.len(), 1);
    }

    // Basic-block snapping.
    #[test]
    fn scenario_basic_block_snapping() {
        let blocks = [bb(0x1000, 0x1010), bb(0x1010, 0x1020)];
        let records = [rec(0x1004, 0x1018)];
        let mut hm = HitMap::new();
        let mut graph = Graph::new();
        process(&records, &blocks, None, &mut hm, &mut graph, None, 0).unwrap();
        assert_eq!(hm.count((0x1000, 0x1010)), 1);
    }

    #[test]
    fn zero_branches_yields_zero_new_branches_and_no_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut hm = HitMap::new();
        let mut graph = Graph::new();
        let result =
            process(&[], &[], None, &mut hm, &mut graph, Some(dir.path()), 0).unwrap();
        assert_eq!(result.new_branches, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn snapshot_written_only_when_new_coverage_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut hm = HitMap::new();
        let mut graph = Graph::new();
        process(&[rec(1, 2)], &[], None, &mut hm, &mut graph, Some(dir.path()), 7).unwrap();
        assert!(dir.path().join("graph.7.gv").exists());

        // Second identical input: zero new branches, no second snapshot.
        process(&[rec(1, 2)], &[], None, &mut hm, &mut graph, Some(dir.path()), 8).unwrap();
        assert!(!dir.path().join("graph.8.gv").exists());
    }

    // Diversity reset.
    #[test]
    fn scenario_diversity_reset() {
        let mut table = DiversityTable::new();
        for fp in 0..5u64 {
            table.record(fp);
        }
        assert_eq!(table.seen_total(), 5);

        let mut last = table.record(0);
        for _ in 0..5 {
            last = table.record(0);
        }
        assert!(last.seen_avg > 2.0);
        assert_eq!(table.seen_total(), 5);
    }

    #[test]
    fn diversity_seen_times_counts_per_fingerprint() {
        let mut table = DiversityTable::new();
        assert_eq!(table.record(42).seen_times, 1);
        assert_eq!(table.record(42).seen_times, 2);
        assert_eq!(table.record(7).seen_times, 1);
    }
}
