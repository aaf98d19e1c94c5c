//! Output classifier for the wrapped probe tool.
//!
//! Scans one decoded chunk of child output for three independent facts:
//!
//! - **severity tags** — bracket-padded grade fields like `[SSS] ` or
//!   `[B] `, one per visible region of a rendering pass;
//! - **the pass-complete marker** — printed once per pass, used to open the
//!   aggregation window;
//! - **prompt markers** — fixed substrings that mean the target is waiting
//!   for one line of input.
//!
//! Classification is a pure function of the text. Coalescing happens
//! downstream in the aggregator: a chunk boundary does not correspond to a
//! rendering-pass boundary, so every tag match is forwarded.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::level::Severity;

/// Default end-of-pass marker printed by the probe tool after each scan.
pub const DEFAULT_PASS_MARKER: &str = "探测完成";

/// Default prompt markers, matched as exact substrings.
pub const DEFAULT_PROMPT_MARKERS: [&str; 3] =
    ["[Y]我同意 [N]不同意:", "请输入命令:", "请输入选择:"];

/// Severity tag pattern: a bracketed grade followed by a space, e.g.
/// `[SSS] `, `[SS+] `, `[A] `. Longest labels first so `SS` never shadows
/// `SSS` or `SS+`.
static LEVEL_TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(SSS|SS\+|SS|S|A|B|C|D|E)\] ").unwrap());

/// Everything the classifier learned from one chunk.
#[derive(Debug, Default)]
pub struct Classification {
    /// Severity tags, in order of appearance. May repeat.
    pub levels: Vec<Severity>,
    /// A pass-complete marker was present.
    pub pass_complete: bool,
    /// A prompt marker was present.
    pub prompt: bool,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.levels.is_empty() && !self.pass_complete && !self.prompt
    }
}

/// Classifier policy: the marker lists live here so the matching is
/// declarative and testable on its own.
#[derive(Debug, Clone)]
pub struct Classifier {
    pass_marker: String,
    prompt_markers: Vec<String>,
}

impl Classifier {
    pub fn new(pass_marker: String, prompt_markers: Vec<String>) -> Self {
        Self {
            pass_marker,
            prompt_markers,
        }
    }

    /// Scan one decoded chunk. Never mutates the text.
    pub fn classify(&self, text: &str) -> Classification {
        let levels = LEVEL_TAG_PATTERN
            .captures_iter(text)
            .filter_map(|cap| cap[1].parse::<Severity>().ok())
            .collect();

        Classification {
            levels,
            pass_complete: text.contains(&self.pass_marker),
            prompt: self.prompt_markers.iter().any(|m| text.contains(m)),
        }
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(
            DEFAULT_PASS_MARKER.to_string(),
            DEFAULT_PROMPT_MARKERS.iter().map(|m| m.to_string()).collect(),
        )
    }
}
