//! Markdown flattening and message chunking for plain-text channels.
//!
//! Agents answer in Markdown, but outbound messages are sent without a
//! parse mode, so markup is reduced to readable plain text first.

use relay_common::text::char_offset;

/// Reduce Markdown to plain text.
///
/// Fence lines are dropped and fenced content kept verbatim. Outside fences,
/// heading, quote and list markers are removed from line starts, table
/// separator rows are dropped, and inline emphasis, code and link syntax is
/// stripped. Best effort only; the result is not meant to round-trip.
#[must_use]
pub fn strip_markdown(md: &str) -> String {
    let mut out = String::with_capacity(md.len());
    let mut in_fence = false;

    for line in md.split_inclusive('\n') {
        let (body, newline) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };

        if body.trim_start().starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            out.push_str(line);
            continue;
        }
        if is_separator_row(body) {
            continue;
        }

        let body = strip_line_prefix(body);
        let body = strip_table_pipes(body);
        out.push_str(&render_inline(body));
        out.push_str(newline);
    }

    out
}

/// Strip one leading block marker (heading, quote, bullet, ordinal).
fn strip_line_prefix(line: &str) -> &str {
    let trimmed = line.trim_start();

    let hashes = trimmed.chars().take_while(|&c| c == '#').count();
    if (1..=6).contains(&hashes)
        && let Some(rest) = trimmed[hashes..].strip_prefix(' ')
    {
        return rest.trim_start();
    }

    if let Some(rest) = trimmed.strip_prefix("> ") {
        return rest;
    }

    for bullet in ["- ", "* ", "+ "] {
        if let Some(rest) = trimmed.strip_prefix(bullet) {
            return rest.trim_start_matches("[ ] ").trim_start_matches("[x] ");
        }
    }

    let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &trimmed[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return rest;
        }
    }

    line
}

/// Table rows lose their outer pipes; inner pipes stay as column separators.
fn strip_table_pipes(line: &str) -> &str {
    let trimmed = line.trim();
    if trimmed.len() > 1 && trimmed.starts_with('|') && trimmed.ends_with('|') {
        trimmed[1..trimmed.len() - 1].trim()
    } else {
        line
    }
}

/// `|---|:--:|` or `---+---` style table separator rows.
fn is_separator_row(line: &str) -> bool {
    let trimmed = line.trim();
    if !trimmed.contains('|') && !trimmed.contains('+') {
        return false;
    }
    let inner = trimmed.strip_prefix('|').unwrap_or(trimmed);
    let inner = inner.strip_suffix('|').unwrap_or(inner);
    !inner.is_empty()
        && inner.split(['|', '+']).all(|cell| {
            let c = cell.trim();
            !c.is_empty() && c.chars().all(|ch| ch == '-' || ch == ':')
        })
}

/// Strip inline markers: code spans, `**`/`__` bold, `*` italic, `~~`
/// strikethrough, links and images.
fn render_inline(line: &str) -> String {
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::with_capacity(line.len());
    let mut in_code = false;
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();

        if ch == '`' {
            in_code = !in_code;
            i += 1;
            continue;
        }
        if in_code {
            out.push(ch);
            i += 1;
            continue;
        }

        match (ch, next) {
            ('*', Some('*')) | ('_', Some('_')) | ('~', Some('~')) => {
                i += 2;
                continue;
            },
            ('*', _) => {
                let prev_space = i == 0 || chars[i - 1].is_whitespace();
                let next_space = next.is_none_or(char::is_whitespace);
                // A lone `*` between spaces is arithmetic, not emphasis.
                if !(prev_space && next_space) {
                    i += 1;
                    continue;
                }
            },
            ('!', Some('[')) => {
                if let Some((text, end)) = parse_link(&chars, i + 1) {
                    out.push_str(&text);
                    i = end;
                    continue;
                }
            },
            ('[', _) => {
                if let Some((text, end)) = parse_link(&chars, i) {
                    out.push_str(&text);
                    i = end;
                    continue;
                }
            },
            _ => {},
        }

        out.push(ch);
        i += 1;
    }

    out
}

/// Parse `[text](url)` starting at `start` (the `[`). Returns the link text
/// and the index just past the closing `)`.
fn parse_link(chars: &[char], start: usize) -> Option<(String, usize)> {
    let close = start + chars[start..].iter().position(|&c| c == ']')?;
    if chars.get(close + 1) != Some(&'(') {
        return None;
    }
    let end = close + 1 + chars[close + 1..].iter().position(|&c| c == ')')?;
    let text: String = chars[start + 1..close].iter().collect();
    Some((render_inline(&text), end + 1))
}

/// Split text into chunks of at most `max_len` characters.
///
/// Splits right after the last newline inside the window so lines stay
/// whole; a single line longer than the limit is cut at the limit. The
/// chunks concatenate back to the input exactly.
#[must_use]
pub fn chunk_message(text: &str, max_len: usize) -> Vec<String> {
    if max_len == 0 {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let window_end = char_offset(remaining, max_len);
        if window_end == remaining.len() {
            chunks.push(remaining.to_string());
            break;
        }

        let split_at = remaining[..window_end]
            .rfind('\n')
            .map_or(window_end, |pos| pos + 1);

        chunks.push(remaining[..split_at].to_string());
        remaining = &remaining[split_at..];
    }

    chunks
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("**bold** and *italic*", "bold and italic")]
    #[case("__bold__ text", "bold text")]
    #[case("use `cargo test` now", "use cargo test now")]
    #[case("~~old~~ new", "old new")]
    #[case("see [the docs](https://example.com)", "see the docs")]
    #[case("![diagram](img.png)", "diagram")]
    #[case("# Title", "Title")]
    #[case("### Sub **heading**", "Sub heading")]
    #[case("- item one", "item one")]
    #[case("  * nested", "nested")]
    #[case("- [x] done", "done")]
    #[case("12. twelfth", "twelfth")]
    #[case("> quoted", "quoted")]
    #[case("2 * 3 = 6", "2 * 3 = 6")]
    #[case("snake_case_name", "snake_case_name")]
    #[case("`**not bold**`", "**not bold**")]
    #[case("[not a link] here", "[not a link] here")]
    #[case("#hashtag", "#hashtag")]
    #[case("Hello World", "Hello World")]
    fn strips_inline_and_prefixes(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(strip_markdown(input), expected);
    }

    #[test]
    fn fenced_block_content_is_verbatim() {
        let input = "Run:\n```rust\nfn main() { let x = **y; }\n```\ndone";
        assert_eq!(
            strip_markdown(input),
            "Run:\nfn main() { let x = **y; }\ndone"
        );
    }

    #[test]
    fn table_is_flattened() {
        let input = "| a | b |\n|---|:-:|\n| 1 | 2 |\n";
        assert_eq!(strip_markdown(input), "a | b\n1 | 2\n");
    }

    #[test]
    fn trailing_newlines_are_preserved() {
        assert_eq!(strip_markdown("line\n\n"), "line\n\n");
    }

    #[test]
    fn chunk_short_message() {
        assert_eq!(chunk_message("hello", 100), vec!["hello"]);
        assert!(chunk_message("", 100).is_empty());
        assert!(chunk_message("hello", 0).is_empty());
    }

    #[test]
    fn chunk_at_newline() {
        let chunks = chunk_message("line1\nline2\nline3", 10);
        assert_eq!(chunks, vec!["line1\n", "line2\n", "line3"]);
    }

    #[test]
    fn overlong_line_is_cut_at_limit() {
        let chunks = chunk_message("abcdefghij\nk", 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij\nk"]);
    }

    #[test]
    fn chunk_message_handles_utf8() {
        let text = "é".repeat(10);
        let chunks = chunk_message(&text, 3);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.chars().count() <= 3));
    }

    #[rstest]
    #[case(7)]
    #[case(50)]
    #[case(4000)]
    fn chunks_reassemble_exactly(#[case] limit: usize) {
        let text: String = (0..400)
            .map(|i| format!("line {i} {}\n", "word ".repeat(i % 17)))
            .collect();
        let chunks = chunk_message(&text, limit);
        assert!(chunks.iter().all(|c| c.chars().count() <= limit));
        assert_eq!(chunks.concat(), text);
    }
}
