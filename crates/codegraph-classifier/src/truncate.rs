// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Input truncation for oversized files.
//!
//! Files over the input ceiling are cut in the middle: the head carries the
//! imports and top-level structure, the tail carries trailing exports, and
//! a sentinel marks the elision so the classifier knows content is missing.

use std::borrow::Cow;

/// Default input ceiling per classifier call, in characters.
pub const MAX_INPUT_CHARS: usize = 60_000;

/// Marker inserted where the middle of a file was elided.
pub const TRUNCATION_SENTINEL: &str = "\n/* ... content truncated for analysis ... */\n";

/// Rough token estimate (~4 chars per token for code).
#[must_use]
pub fn estimate_tokens(content: &str) -> usize {
    content.chars().count() / 4
}

/// Nearest char boundary at or below `index`.
fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Nearest char boundary at or above `index`.
fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

/// Truncate around the middle, preserving head and tail, if `content`
/// exceeds `max_chars`.
#[must_use]
pub fn truncate_middle(content: &str, max_chars: usize) -> Cow<'_, str> {
    if content.len() <= max_chars {
        return Cow::Borrowed(content);
    }
    let budget = max_chars.saturating_sub(TRUNCATION_SENTINEL.len()).max(2);
    let head_len = floor_char_boundary(content, budget / 2);
    let tail_start = ceil_char_boundary(content, content.len() - (budget - head_len));

    let mut out = String::with_capacity(max_chars);
    out.push_str(&content[..head_len]);
    out.push_str(TRUNCATION_SENTINEL);
    out.push_str(&content[tail_start..]);
    Cow::Owned(out)
}

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_input_untouched() {
        let content = "fn main() {}";
        assert!(matches!(truncate_middle(content, 1000), Cow::Borrowed(_)));
    }

    #[test]
    fn test_truncation_preserves_head_and_tail() {
        let content = format!("HEAD{}TAIL", "x".repeat(10_000));
        let truncated = truncate_middle(&content, 200);
        assert!(truncated.starts_with("HEAD"));
        assert!(truncated.ends_with("TAIL"));
        assert!(truncated.contains(TRUNCATION_SENTINEL.trim()));
        assert!(truncated.len() <= 200 + TRUNCATION_SENTINEL.len());
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        // Multi-byte chars straddling the cut points must not panic.
        let content = "é".repeat(50_000);
        let truncated = truncate_middle(&content, 1_000);
        assert!(truncated.contains(TRUNCATION_SENTINEL.trim()));
    }

    #[test]
    fn test_token_estimate() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }
}
