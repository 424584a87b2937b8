//! Sink & formatters.
//!
//! Owns every piece of output the monitor produces: DOT graph dumps and the
//! per-input log line.

use std::fs::File;
use std::io::{self, Write};

use crate::graph::Graph;

/// Where a graph dump should go.
pub enum DumpTarget {
    /// No file configured; only log node out-degrees.
    LogOnly,
    /// Write a DOT file to the given path.
    DumpTo(std::path::PathBuf),
    /// Caller already decided this dump isn't worth producing at all.
    Silent,
}

/// Whether an input arrived from the message queue or the corpus directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputOrigin {
    Corpus,
    Queue,
}

impl InputOrigin {
    fn letter(self) -> char {
        match self {
            InputOrigin::Corpus => 'C',
            InputOrigin::Queue => 'Z',
        }
    }
}

/// Writes `graph` as a labeled cumulative DOT digraph to `path`:
/// `"<from_hex>" -> "<to_hex>" [label="<count>"];` per edge, inside a
/// `digraph { ... }` wrapper. `counts` supplies the hit count for each
/// `(from, to)` edge; an empty graph still yields a valid `digraph {}`.
pub fn write_cumulative_dot(
    path: &std::path::Path,
    graph: &Graph,
    counts: impl Fn(u64, u64) -> u64,
) -> io::Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "digraph {{")?;
    graph.foreach(|from, outgoing| {
        for &to in outgoing {
            let _ = writeln!(
                file,
                "    \"{:#x}\" -> \"{:#x}\" [label=\"{}\"];",
                from,
                to,
                counts(from, to)
            );
        }
    });
    writeln!(file, "}}")?;
    Ok(())
}

/// Writes `graph` as an unlabeled snapshot DOT digraph to `path`.
pub fn write_snapshot_dot(path: &std::path::Path, graph: &Graph) -> io::Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "digraph {{")?;
    graph.foreach(|from, outgoing| {
        for &to in outgoing {
            let _ = writeln!(file, "    \"{:#x}\" -> \"{:#x}\";", from, to);
        }
    });
    writeln!(file, "}}")?;
    Ok(())
}

/// Dumps one line per source node with its out-degree, used for the
/// `LogOnly`/no-file branch of a cumulative dump.
pub fn format_node_degrees(graph: &Graph) -> String {
    let mut lines = Vec::new();
    graph.foreach(|node, outgoing| {
        lines.push(format!("{:#x}: {}", node, outgoing.len()));
    });
    lines.join("\n")
}

/// Builds the fixed-column per-input log line:
/// `<total_branches> <filtered> <new> <elapsed_ms> <seen_times> <seen_avg> <C|Z>`.
#[allow(clippy::too_many_arguments)]
pub fn format_trace_line(
    total_branches: usize,
    filtered: usize,
    new_branches: usize,
    elapsed_ms: u128,
    seen_times: u32,
    seen_avg: f64,
    origin: InputOrigin,
) -> String {
    format!(
        "{} {} {} {} {} {:.2} {}",
        total_branches,
        filtered,
        new_branches,
        elapsed_ms,
        seen_times,
        seen_avg,
        origin.letter()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    #[test]
    fn empty_graph_is_a_valid_empty_digraph() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.gv");
        let graph = Graph::new();
        write_cumulative_dot(&path, &graph, |_, _| 0).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "digraph {\n}\n");
    }

    #[test]
    fn cumulative_dot_contains_labeled_edges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.gv");
        let mut graph = Graph::new();
        graph.add(0x1000, 0x2000);

        write_cumulative_dot(&path, &graph, |_, _| 7).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"0x1000\" -> \"0x2000\" [label=\"7\"];"));
    }

    #[test]
    fn snapshot_dot_has_unlabeled_edges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snapshot.gv");
        let mut graph = Graph::new();
        graph.add(0x1000, 0x2000);

        write_snapshot_dot(&path, &graph).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"0x1000\" -> \"0x2000\";"));
        assert!(!contents.contains("label"));
    }

    #[test]
    fn node_degrees_reports_outdegree_per_node() {
        let mut graph = Graph::new();
        graph.add(0x1000, 0x2000);
        graph.add(0x1000, 0x3000);

        let dump = format_node_degrees(&graph);
        assert_eq!(dump, "0x1000: 2");
    }

    #[test]
    fn trace_line_has_seven_columns_in_order() {
        let line = format_trace_line(10, 2, 3, 42, 5, 1.5, InputOrigin::Corpus);
        assert_eq!(line, "10 2 3 42 5 1.50 C");
    }

    #[test]
    fn trace_line_marks_queue_origin() {
        let line = format_trace_line(1, 0, 1, 1, 1, 1.0, InputOrigin::Queue);
        assert!(line.ends_with(" Z"));
    }
}
