//! Text decoding and colorization for the raw-pipe transport.
//!
//! Legacy builds of the probe tool write GBK to plain pipes and rely on the
//! Windows console for color. When the proxy runs them over raw pipes it
//! normalizes each chunk to UTF-8 and re-synthesizes the color itself:
//! grade tags become colored badges and the tool's `[NN] (r,g,b)` cell
//! notation becomes true-color cells.
//!
//! The PTY transport needs none of this — bytes pass through verbatim and
//! classification uses a lossy UTF-8 view.

use std::borrow::Cow;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::types::ProxyError;

/// How chunk bytes become text for classification (and, on the raw
/// transport, for display).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextDecoder {
    /// Lossy UTF-8; never fails. Used by the PTY transport.
    #[default]
    Utf8,
    /// Simplified-Chinese code page used by legacy target builds.
    Gbk,
}

impl TextDecoder {
    /// Decode one chunk. A chunk that is not valid in the selected encoding
    /// is a `Decode` error; the caller logs it and skips the chunk.
    pub fn decode<'a>(&self, bytes: &'a [u8]) -> Result<Cow<'a, str>, ProxyError> {
        match self {
            TextDecoder::Utf8 => Ok(String::from_utf8_lossy(bytes)),
            TextDecoder::Gbk => {
                let (text, _, had_errors) = encoding_rs::GBK.decode(bytes);
                if had_errors {
                    return Err(ProxyError::Decode(format!(
                        "invalid GBK sequence in {}-byte chunk",
                        bytes.len()
                    )));
                }
                Ok(text)
            }
        }
    }
}

/// Grade tag → colored badge, widths padded so columns stay aligned.
const LEVEL_BADGES: [(&str, &str); 9] = [
    ("[SSS] ", "\x1b[48;2;255;215;0m SSS \x1b[0m "),
    ("[SS+] ", "\x1b[48;2;255;69;0m SS+ \x1b[0m "),
    ("[SS] ", "\x1b[48;2;255;69;0m SS  \x1b[0m "),
    ("[S] ", "\x1b[48;2;255;140;0m  S  \x1b[0m "),
    ("[A] ", "\x1b[48;2;131;90;170m  A  \x1b[0m "),
    ("[B] ", "\x1b[48;2;70;130;180m  B  \x1b[0m "),
    ("[C] ", "\x1b[48;2;60;130;80m  C  \x1b[0m "),
    ("[D] ", "\x1b[48;2;245;245;245m  D  \x1b[0m "),
    ("[E] ", "\x1b[48;2;200;200;210m  E  \x1b[0m "),
];

/// Map cell notation: `[42] (255,0,0)` or `[??] (10,10,10)`.
static COLOR_CELL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[(\?\?|\d{2})\]\s*\((\d{1,3}),(\d{1,3}),(\d{1,3})\)").unwrap());

/// Re-synthesize ANSI color for one decoded chunk of raw-pipe output.
pub fn colorize(text: &str) -> String {
    let mut out = text.to_string();
    for (tag, badge) in LEVEL_BADGES {
        if out.contains(tag) {
            out = out.replace(tag, badge);
        }
    }
    COLOR_CELL_PATTERN
        .replace_all(&out, |caps: &Captures<'_>| {
            let cell = if &caps[1] == "??" {
                "  ".to_string()
            } else {
                format!(" {} ", &caps[1])
            };
            format!("\x1b[48;2;{};{};{}m{}\x1b[0m", &caps[2], &caps[3], &caps[4], cell)
        })
        .into_owned()
}
