use crate::classifier::{Category, classify_line, is_structured};

/// Plain-text result of an attempt, used for the completion notice and the
/// conversation memory.
///
/// Concatenates every `text` event. When the agent produced none, falls back
/// to the lines that were not structured records at all.
#[must_use]
pub fn summarize<S: AsRef<str>>(lines: &[S]) -> String {
    let text: String = lines
        .iter()
        .filter_map(|line| classify_line(line.as_ref(), true))
        .filter(|event| event.category == Category::Text)
        .map(|event| event.payload)
        .collect();

    if !text.trim().is_empty() {
        return text.trim().to_string();
    }

    lines
        .iter()
        .map(AsRef::as_ref)
        .filter(|line| !line.trim().is_empty() && !is_structured(line))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
