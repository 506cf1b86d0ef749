//! Text cleanup passes applied after markup has been stripped.
//!
//! Each pass is a function `&str -> String` applied in sequence.

use std::sync::LazyLock;

use regex::Regex;

/// Run the full cleanup pipeline on visible page text.
pub(crate) fn run_pipeline(text: &str) -> String {
    let mut result = normalize_whitespace(text);
    result = strip_disallowed(&result);
    // Stripping can leave doubled separators behind.
    normalize_whitespace(&result)
}

// ---------------------------------------------------------------------------
// Pass 1: Normalize whitespace
// ---------------------------------------------------------------------------

/// Collapse runs of spaces to one space and runs of line breaks to one newline.
///
/// Tabs, no-break spaces and the ideographic space (U+3000) count as spaces.
pub(crate) fn normalize_whitespace(text: &str) -> String {
    static SPACES_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[ \t\x{00A0}\x{3000}\r\f\v]+").expect("valid regex"));
    static BREAKS_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r" ?\n[\s]*").expect("valid regex"));

    let spaced = SPACES_RE.replace_all(text, " ");
    let broken = BREAKS_RE.replace_all(&spaced, "\n");
    broken.trim().to_string()
}

// ---------------------------------------------------------------------------
// Pass 2: Strip characters outside the allow-list
// ---------------------------------------------------------------------------

/// Remove symbols, emoji and markup debris.
///
/// Kept: word characters (Unicode letters and digits), whitespace, the CJK
/// Unified Ideographs blocks (base, Extension A, Compatibility), ASCII
/// punctuation `-.,!?;:()` and full-width CJK punctuation.
pub(crate) fn strip_disallowed(text: &str) -> String {
    static DISALLOWED_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"[^\w\s\x{4E00}-\x{9FFF}\x{3400}-\x{4DBF}\x{F900}-\x{FAFF}\-.,!?;:()（）。，！？；：、【】「」『』《》〈〉]",
        )
        .expect("valid regex")
    });

    DISALLOWED_RE.replace_all(text, "").to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
