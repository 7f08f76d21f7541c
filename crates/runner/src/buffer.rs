//! Per-category accumulation of classified output.

use std::collections::BTreeMap;

use relay_common::text::char_offset;

use crate::classifier::Category;

/// Accumulated content for one category, ready to be delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushUnit {
    pub category: Category,
    pub text: String,
}

impl FlushUnit {
    /// Message body as shown to the user.
    #[must_use]
    pub fn render(&self) -> String {
        match self.category {
            Category::Thinking => format!("💭 {}", self.text),
            _ => self.text.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Pending {
    text: String,
    chars: usize,
}

/// Pending text per category with an eager character threshold.
#[derive(Debug)]
pub struct ContentBuffer {
    threshold: usize,
    pending: BTreeMap<Category, Pending>,
}

impl ContentBuffer {
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            pending: BTreeMap::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn append(&mut self, category: Category, text: &str) {
        if text.is_empty() {
            return;
        }
        let entry = self.pending.entry(category).or_default();
        entry.text.push_str(text);
        entry.chars += text.chars().count();
    }

    /// Characters waiting in `category`.
    #[must_use]
    pub fn pending_len(&self, category: Category) -> usize {
        self.pending.get(&category).map_or(0, |p| p.chars)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.values().all(|p| p.chars == 0)
    }

    #[must_use]
    pub fn should_flush(&self, category: Category) -> bool {
        self.pending_len(category) > self.threshold
    }

    /// Take the whole pending text when `force` is set, otherwise the first
    /// threshold-sized slice. Returns `None` when nothing is pending.
    pub fn take_flush(&mut self, category: Category, force: bool) -> Option<FlushUnit> {
        let pending = self.pending.get_mut(&category)?;
        if pending.chars == 0 {
            return None;
        }

        let text = if force || pending.chars <= self.threshold {
            pending.chars = 0;
            std::mem::take(&mut pending.text)
        } else {
            let split = char_offset(&pending.text, self.threshold);
            let rest = pending.text.split_off(split);
            pending.chars -= self.threshold;
            std::mem::replace(&mut pending.text, rest)
        };
        Some(FlushUnit { category, text })
    }

    /// Slices `category` until its pending text is back under the threshold.
    pub fn drain_ready(&mut self, category: Category) -> Vec<FlushUnit> {
        let mut units = Vec::new();
        while self.should_flush(category) {
            match self.take_flush(category, false) {
                Some(unit) => units.push(unit),
                None => break,
            }
        }
        units
    }

    /// Force-flush every non-empty category in [`Category`] order.
    pub fn drain_all(&mut self) -> Vec<FlushUnit> {
        Category::ALL
            .into_iter()
            .filter_map(|category| self.take_flush(category, true))
            .collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn accumulates_until_forced() {
        let mut buffer = ContentBuffer::new(1000);
        buffer.append(Category::Text, "Hello ");
        buffer.append(Category::Text, "World");
        assert!(!buffer.should_flush(Category::Text));
        assert!(buffer.drain_ready(Category::Text).is_empty());

        let units = buffer.drain_all();
        assert_eq!(units, vec![FlushUnit {
            category: Category::Text,
            text: "Hello World".into(),
        }]);
        assert!(buffer.is_empty());
        assert!(buffer.drain_all().is_empty());
    }

    #[test]
    fn eager_flush_slices_at_threshold() {
        let mut buffer = ContentBuffer::new(4);
        buffer.append(Category::Text, "abcdefghij");
        let units = buffer.drain_ready(Category::Text);
        let texts: Vec<_> = units.iter().map(|u| u.text.as_str()).collect();
        assert_eq!(texts, vec!["abcd", "efgh"]);
        assert_eq!(buffer.pending_len(Category::Text), 2);
        assert_eq!(
            buffer.take_flush(Category::Text, true).unwrap().text,
            "ij"
        );
    }

    #[test]
    fn slices_on_char_boundaries() {
        let mut buffer = ContentBuffer::new(2);
        buffer.append(Category::Text, "héllo");
        let first = buffer.take_flush(Category::Text, false).unwrap();
        assert_eq!(first.text, "hé");
        assert_eq!(buffer.pending_len(Category::Text), 3);
    }

    #[test]
    fn categories_are_independent() {
        let mut buffer = ContentBuffer::new(3);
        buffer.append(Category::Raw, "line\n");
        buffer.append(Category::Text, "ab");
        assert!(buffer.should_flush(Category::Raw));
        assert!(!buffer.should_flush(Category::Text));

        let drained: Vec<_> = buffer
            .drain_all()
            .into_iter()
            .map(|u| u.category)
            .collect();
        assert_eq!(drained, vec![Category::Text, Category::Raw]);
    }

    #[rstest]
    #[case(1, &["a", "bc", "", "defgh", "ijk"])]
    #[case(3, &["hello ", "wörld", "!"])]
    #[case(1000, &["short"])]
    fn flushed_text_reassembles_input(#[case] threshold: usize, #[case] parts: &[&str]) {
        let mut buffer = ContentBuffer::new(threshold);
        let mut seen = String::new();
        for part in parts {
            buffer.append(Category::Text, part);
            for unit in buffer.drain_ready(Category::Text) {
                assert!(unit.text.chars().count() <= threshold);
                seen.push_str(&unit.text);
            }
            assert!(buffer.pending_len(Category::Text) <= threshold);
        }
        for unit in buffer.drain_all() {
            seen.push_str(&unit.text);
        }
        assert_eq!(seen, parts.concat());
    }

    #[test]
    fn thinking_is_rendered_with_marker() {
        let unit = FlushUnit {
            category: Category::Thinking,
            text: "considering".into(),
        };
        assert_eq!(unit.render(), "💭 considering");
    }
}
