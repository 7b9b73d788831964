//! Line-oriented noise filtering for streamed agent output.
//!
//! Agent CLIs interleave their answer with tool-call markers, progress counters
//! and raw event objects. These helpers drop such lines so consumers only see
//! the text the agent produced. Matching happens on an ANSI-stripped copy of
//! each line; surviving lines are emitted byte-for-byte, escapes included.

use std::sync::LazyLock;

use regex::{Regex, RegexSet};

static METADATA_PATTERNS: LazyLock<RegexSet> = LazyLock::new(|| {
    RegexSet::new([
        // Tool calls and status markers: "| read {...}", "! warning"
        r"^[|!]\s+",
        // Progress counters: "[1/3]"
        r"^\s*\[\d+/\d+\]",
        r"(?i)^(Reading|Writing|Creating|Updating|Running)\s+",
        // Raw structured events
        r#"^\s*\{.*"type":\s*""#,
        r#"^\s*\{.*"description":\s*""#,
        r#"^\s*\{.*"path":\s*""#,
        r#"^\s*\{.*"pattern":\s*""#,
        // Grep/glob style "file.ts: {...}"
        r#"^\S+\.(md|ts|tsx|js|json):\s*["{\[]"#,
        r"^skills/",
    ])
    .expect("metadata patterns are valid")
});

static ANSI_SGR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").expect("ansi pattern is valid"));

/// Whether a single line (without its newline) is tool metadata.
pub fn is_metadata_line(line: &str) -> bool {
    let clean = ANSI_SGR.replace_all(line, "");
    METADATA_PATTERNS.is_match(&clean)
}

/// Remove metadata lines from `text`, keeping every other line in order.
pub fn filter_metadata(text: &str) -> String {
    text.split('\n')
        .filter(|line| !is_metadata_line(line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Filter a streamed chunk; `None` when nothing worth forwarding remains.
///
/// Empty and whitespace-only results are never delivered downstream.
pub fn filter_chunk(text: &str) -> Option<String> {
    let filtered = filter_metadata(text);
    if filtered.trim().is_empty() {
        None
    } else {
        Some(filtered)
    }
}

/// Longest partial line held back before it is filtered as-is.
const MAX_PENDING_LINE: usize = 64 * 1024;

/// Line-buffered [`filter_chunk`] for streams whose chunks split lines
/// arbitrarily.
///
/// Only complete lines are filtered; a trailing partial line waits for the
/// chunk that ends it, or for [`LineFilter::finish`].
#[derive(Debug, Default)]
pub struct LineFilter {
    pending: String,
}

impl LineFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the filtered text of every line it completed.
    pub fn push(&mut self, chunk: &str) -> Option<String> {
        self.pending.push_str(chunk);
        let complete = match self.pending.rfind('\n') {
            Some(idx) => {
                let rest = self.pending.split_off(idx + 1);
                std::mem::replace(&mut self.pending, rest)
            }
            None if self.pending.len() > MAX_PENDING_LINE => std::mem::take(&mut self.pending),
            None => return None,
        };
        filter_chunk(&complete)
    }

    /// Flush the trailing partial line at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        if rest.is_empty() {
            None
        } else {
            filter_chunk(&rest)
        }
    }
}
