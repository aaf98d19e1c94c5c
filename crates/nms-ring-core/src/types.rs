//! Shared types: error taxonomy, proxy options, output chunks.

use std::io;
use std::time::Duration;

/// Errors produced by the proxy and its collaborators.
///
/// Every variant except `Decode` is fatal: the proxy's only value is a
/// faithful mirror of one child process, so a broken link ends the session.
/// `Decode` failures skip the affected chunk and the loop continues.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("failed to launch target: {0}")]
    Launch(String),

    #[error("failed to read target output: {0}")]
    Read(#[source] io::Error),

    #[error("failed to forward input to target: {0}")]
    Write(#[source] io::Error),

    #[error("target exited abnormally: {0}")]
    Exit(String),

    #[error("failed to decode output chunk: {0}")]
    Decode(String),

    #[error("unsupported ring file format: {0}")]
    UnsupportedFormat(String),

    #[error("unknown severity level: {0}")]
    UnknownLevel(String),

    #[error("audio playback failed: {0}")]
    Playback(String),
}

/// One read from the child's combined output stream.
#[derive(Debug)]
pub enum OutputChunk {
    /// Raw bytes, exactly as the child wrote them.
    Data(Vec<u8>),
    /// The stream ended. `None` is a clean end-of-stream (child closed its
    /// output); `Some` is a real I/O failure.
    Closed(Option<io::Error>),
}

/// How the child's I/O is wired up.
///
/// The PTY transport is the default: the child believes it is on a real
/// terminal and its own formatting passes through untouched. The raw
/// transport is the legacy variant for builds of the target that write GBK
/// to plain pipes; the proxy then decodes and colorizes the text itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    #[default]
    Pty,
    Raw,
}

/// Proxy configuration.
///
/// The debounce delay and the pass-complete marker are heuristics tied to
/// one third-party program's output format, so both are settings rather
/// than constants.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub transport: Transport,
    /// PTY dimensions handed to the child.
    pub cols: u16,
    pub rows: u16,
    /// Quiet period after the last pass-complete marker before the
    /// aggregation window flushes.
    pub debounce: Duration,
    /// Substring that marks the end of one rendering pass of the target.
    pub pass_marker: String,
    /// Substrings that mark a prompt awaiting one line of operator input.
    pub prompt_markers: Vec<String>,
    /// Line terminator the target expects on forwarded input.
    pub line_ending: String,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            transport: Transport::Pty,
            cols: 120,
            rows: 30,
            debounce: Duration::from_millis(500),
            pass_marker: crate::classify::DEFAULT_PASS_MARKER.to_string(),
            prompt_markers: crate::classify::DEFAULT_PROMPT_MARKERS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            line_ending: "\n".to_string(),
        }
    }
}
