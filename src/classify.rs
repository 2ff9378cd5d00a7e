//! Output classification heuristics for captured pane text.
//!
//! The assistant CLI renders a full-screen TUI, so there is no structured
//! completion protocol to read; classification works on the text content
//! after ANSI stripping. The awaiting-input rule (last non-empty line ends
//! in a prompt character, or contains a question mark) is a known accuracy
//! risk: a line that merely contains `?` mid-sentence reads as a prompt.
//! Keeping every textual heuristic inside this module means a structured
//! signal (e.g. explicit completion markers) can replace it without
//! touching the control loop.

use std::sync::LazyLock;

use regex::Regex;

/// How many trailing non-empty lines the error scan inspects.
const ERROR_SCAN_LINES: usize = 5;

/// Result of comparing a fresh capture against the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The assistant is idle at a prompt, ready for input.
    AwaitingInput,
    /// The tail of the output matches a known error marker.
    ErrorDetected,
    /// Output is still moving.
    Changed,
    /// Output is identical to the previous capture.
    Unchanged,
}

/// Strip ANSI escape sequences from PTY output.
pub fn strip_ansi(input: &str) -> String {
    // Matches CSI sequences (ESC [ ... final byte), OSC sequences (ESC ] ... ST),
    // and simple two-byte escapes (ESC + one char).
    static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[^\[\]]").unwrap()
    });
    ANSI_RE.replace_all(input, "").to_string()
}

static ERROR_MARKERS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)^error[:\s]").unwrap(),
        Regex::new(r"\berror:\s").unwrap(),
        Regex::new(r"Traceback \(most recent call last\)").unwrap(),
        Regex::new(r"panicked at").unwrap(),
        Regex::new(r"command not found").unwrap(),
    ]
});

fn last_non_empty_line(stripped: &str) -> Option<&str> {
    stripped
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
}

/// Heuristic: is the assistant idle at a prompt, waiting for input?
///
/// Inspects only the last non-empty line of the capture. True when that
/// line ends with a prompt-like character (`>`, `❯`, `$`) or contains a
/// question mark.
pub fn is_awaiting_input(current: &str) -> bool {
    let stripped = strip_ansi(current);
    let Some(last) = last_non_empty_line(&stripped) else {
        return false;
    };

    last.ends_with('>') || last.ends_with('\u{276f}') || last.ends_with('$') || last.contains('?')
}

/// Heuristic: does the tail of the capture look like an error?
pub fn looks_like_error(current: &str) -> bool {
    let stripped = strip_ansi(current);
    stripped
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(ERROR_SCAN_LINES)
        .any(|line| ERROR_MARKERS.iter().any(|re| re.is_match(line)))
}

/// Classify a fresh capture against the previous one.
///
/// Pure and deterministic: identical inputs always yield the same
/// classification. Precedence: awaiting-input, then error, then
/// changed/unchanged.
pub fn classify(previous: &str, current: &str) -> Classification {
    if is_awaiting_input(current) {
        Classification::AwaitingInput
    } else if looks_like_error(current) {
        Classification::ErrorDetected
    } else if current == previous {
        Classification::Unchanged
    } else {
        Classification::Changed
    }
}
