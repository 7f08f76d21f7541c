//! Character-aware string helpers.
//!
//! Limits in relay are expressed in characters, not bytes, so slicing must
//! always land on a `char` boundary.

/// Byte offset of the `n`-th character of `text`, or `text.len()` when the
/// text is shorter.
#[must_use]
pub fn char_offset(text: &str, n: usize) -> usize {
    text.char_indices()
        .nth(n)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len())
}

/// First `max_chars` characters of `text`.
#[must_use]
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    &text[..char_offset(text, max_chars)]
}

/// Like [`truncate_chars`], but appends an ellipsis when anything was cut.
#[must_use]
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    let head = truncate_chars(text, max_chars);
    if head.len() == text.len() {
        head.to_string()
    } else {
        format!("{head}…")
    }
}
