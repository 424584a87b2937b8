//! Basic-block loader.
//!
//! Runs the user-supplied discovery helper (e.g. a radare2/angr script) and
//! parses its stdout into an ordered, non-overlapping array of `[from, to)`
//! ranges. The helper itself is an external collaborator; this module only
//! owns the invocation and parsing contract.

use std::process::Command;

use crate::error::MonitorError;

/// A basic block: half-open instruction-address range `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicBlock {
    pub from: u64,
    pub to: u64,
}

/// Runs `script binary` and parses each `"<from_hex> <to_hex>"` stdout line
/// into a [`BasicBlock`]. Lines that fail to parse are skipped silently, as
/// they're expected to be the helper's own diagnostic chatter. The result is
/// sorted by `from` so [`snap`](crate::aggregator::snap) can assume a linear
/// scan finds the first match in address order.
pub fn load_basic_blocks(script: &str, binary: &str) -> Result<Vec<BasicBlock>, MonitorError> {
    let output = Command::new(script)
        .arg(binary)
        .output()
        .map_err(|e| MonitorError::BasicBlocks(format!("failed to spawn {script}: {e}")))?;

    if !output.status.success() {
        return Err(MonitorError::BasicBlocks(format!(
            "{script} exited with status {}",
            output.status
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut blocks: Vec<BasicBlock> = stdout
        .lines()
        .filter_map(parse_line)
        .collect();

    if blocks.is_empty() {
        return Err(MonitorError::BasicBlocks(format!(
            "{script} produced no parseable basic blocks"
        )));
    }

    blocks.sort_by_key(|bb| bb.from);
    Ok(blocks)
}

fn parse_line(line: &str) -> Option<BasicBlock> {
    let mut parts = line.split_whitespace();
    let from = parse_hex(parts.next()?)?;
    let to = parse_hex(parts.next()?)?;
    if parts.next().is_some() {
        return None;
    }
    Some(BasicBlock { from, to })
}

fn parse_hex(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_line() {
        assert_eq!(
            parse_line("0x1000 0x1010"),
            Some(BasicBlock { from: 0x1000, to: 0x1010 })
        );
    }

    #[test]
    fn skips_malformed_lines() {
        assert_eq!(parse_line("garbage"), None);
        assert_eq!(parse_line("0x1000"), None);
        assert_eq!(parse_line("0x1000 0x1010 extra"), None);
        assert_eq!(parse_line("not_hex not_hex_either"), None);
    }

    #[test]
    fn helper_that_cannot_spawn_is_an_error() {
        let err = load_basic_blocks("/nonexistent/helper/script.sh", "/bin/true");
        assert!(err.is_err());
    }

    #[test]
    fn helper_producing_nothing_parseable_is_an_error() {
        // /bin/true exits 0 but emits no stdout.
        let err = load_basic_blocks("/bin/true", "irrelevant");
        assert!(err.is_err());
    }

    #[test]
    fn output_is_sorted_by_from() {
        let stdout = "0x2000 0x2010\n0x1000 0x1010\n";
        let mut blocks: Vec<BasicBlock> = stdout.lines().filter_map(parse_line).collect();
        blocks.sort_by_key(|bb| bb.from);
        assert_eq!(blocks[0].from, 0x1000);
        assert_eq!(blocks[1].from, 0x2000);
    }
}
