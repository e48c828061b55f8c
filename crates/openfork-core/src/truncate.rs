// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Token Manager L1: per-tool-output hard caps, synchronous, applied before
//! a tool's output ever reaches the session history.
//!
//! This sits below [`crate::compact::smart_truncate`] in the escalation
//! ladder (Truncation → Pruning → Compaction): `smart_truncate` makes a
//! category-aware choice about *which* lines of a long output are most
//! useful within a token budget; L1 is the hard byte/line/char backstop that
//! runs regardless of category, and spills the untruncated original to disk
//! so nothing is unrecoverably lost.
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global byte cap applied to every tool's output regardless of its
/// per-tool limit.
pub const GLOBAL_BYTE_CAP: usize = 50_000;
/// Global line-count cap.
pub const GLOBAL_LINE_CAP: usize = 2_000;
/// Per-line character cap; longer lines are hard-cut at this width.
pub const PER_LINE_CHAR_CAP: usize = 2_000;

/// Per-tool char limit table; tools absent from this table use
/// [`DEFAULT_TOOL_CHAR_LIMIT`].
fn tool_char_limit(tool_name: &str) -> usize {
    let table: &[(&str, usize)] = &[
        ("bash", GLOBAL_BYTE_CAP),
        ("run_terminal_command", GLOBAL_BYTE_CAP),
        ("shell", GLOBAL_BYTE_CAP),
        ("read_file", GLOBAL_BYTE_CAP),
        ("grep", 30_000),
        ("glob", 20_000),
        ("web_fetch", GLOBAL_BYTE_CAP),
    ];
    table
        .iter()
        .find(|(name, _)| *name == tool_name)
        .map(|(_, limit)| *limit)
        .unwrap_or(DEFAULT_TOOL_CHAR_LIMIT)
}

const DEFAULT_TOOL_CHAR_LIMIT: usize = GLOBAL_BYTE_CAP;

/// Result of running a tool output through L1.
#[derive(Debug, Clone)]
pub struct TruncationOutcome {
    pub output: String,
    pub truncated: bool,
    pub original_bytes: usize,
    pub truncated_bytes: usize,
    pub spill_path: Option<PathBuf>,
}

static SPILL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Where spill files are written. Defaults to the system temp dir under an
/// `openfork-spill` subdirectory; overridable for tests.
pub struct SpillConfig {
    pub dir: PathBuf,
}

impl Default for SpillConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("openfork-spill"),
        }
    }
}

/// Apply L1 truncation to a tool's raw output. Enforces, in order: the
/// per-tool char limit (falling back to the global byte cap), the global
/// line cap, and the per-line char cap. If any cap trips, writes the full
/// untruncated output to a unique spill file and appends a marker line
/// noting how much was discarded.
///
/// Idempotent: truncating an already-truncated output never shrinks it
/// further, because the marker line is only appended once and the result
/// is already within every cap.
pub fn truncate_tool_output(
    tool_name: &str,
    output: &str,
    spill: &SpillConfig,
) -> TruncationOutcome {
    let original_bytes = output.len();
    let char_limit = tool_char_limit(tool_name).min(GLOBAL_BYTE_CAP);

    let mut lines: Vec<String> = output
        .lines()
        .map(|line| {
            if line.len() > PER_LINE_CHAR_CAP {
                format!("{}…[line truncated]", &line[..PER_LINE_CHAR_CAP])
            } else {
                line.to_string()
            }
        })
        .collect();

    let line_truncated = lines.len() > GLOBAL_LINE_CAP;
    let discarded_lines = lines.len().saturating_sub(GLOBAL_LINE_CAP);
    if line_truncated {
        lines.truncate(GLOBAL_LINE_CAP);
    }

    let mut joined = lines.join("\n");
    let byte_truncated = joined.len() > char_limit;
    if byte_truncated {
        joined = take_valid_prefix(&joined, char_limit);
    }

    let per_line_truncated = output.lines().any(|l| l.len() > PER_LINE_CHAR_CAP);
    let truncated = line_truncated || byte_truncated || per_line_truncated;

    if !truncated {
        return TruncationOutcome {
            output: joined,
            truncated: false,
            original_bytes,
            truncated_bytes: original_bytes,
            spill_path: None,
        };
    }

    let spill_path = write_spill(output, spill);
    let discarded_bytes = original_bytes.saturating_sub(joined.len());
    let marker = match (&spill_path, line_truncated) {
        (Some(path), true) => format!(
            "\n…[truncated: {discarded_bytes} bytes / {discarded_lines} lines discarded, full output at {}]",
            path.display()
        ),
        (Some(path), false) => format!(
            "\n…[truncated: {discarded_bytes} bytes discarded, full output at {}]",
            path.display()
        ),
        (None, _) => format!("\n…[truncated: {discarded_bytes} bytes discarded, spill write failed]"),
    };
    joined.push_str(&marker);

    TruncationOutcome {
        truncated_bytes: joined.len(),
        output: joined,
        truncated: true,
        original_bytes,
        spill_path,
    }
}

/// Cut `s` to at most `max_bytes` bytes without splitting a UTF-8 char.
fn take_valid_prefix(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}

fn write_spill(full_output: &str, spill: &SpillConfig) -> Option<PathBuf> {
    if std::fs::create_dir_all(&spill.dir).is_err() {
        return None;
    }
    let seq = SPILL_SEQ.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let path = spill.dir.join(format!("spill-{pid}-{seq}.txt"));
    let mut file = std::fs::File::create(&path).ok()?;
    file.write_all(full_output.as_bytes()).ok()?;
    Some(path)
}

/// Lookup table exposed for callers that want to report configured limits
/// without running a truncation (e.g. `show-config`).
pub fn configured_limits() -> HashMap<&'static str, usize> {
    [
        ("bash", tool_char_limit("bash")),
        ("grep", tool_char_limit("grep")),
        ("glob", tool_char_limit("glob")),
        ("web_fetch", tool_char_limit("web_fetch")),
        ("default", DEFAULT_TOOL_CHAR_LIMIT),
    ]
    .into_iter()
    .collect()
}
