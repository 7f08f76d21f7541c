//! Turns raw agent output lines into categorized events.
//!
//! The agent prints one JSON record per line when asked for `--format json`.
//! Anything that does not decode, or decodes to a record we do not know, is
//! passed through verbatim as [`Category::Raw`] so nothing is silently lost.

use {
    relay_common::text::truncate_with_ellipsis,
    serde::Deserialize,
    serde_json::Value,
};

/// Characters of tool output forwarded with a tool completion.
pub const TOOL_OUTPUT_PREVIEW_CHARS: usize = 500;
/// Characters of error text forwarded with an error event.
pub const ERROR_PREVIEW_CHARS: usize = 500;
/// Payload emitted for every `step_start` record.
pub const STEP_START_MARKER: &str = "▶ step started";
/// Payload emitted for the first tool completion of an attempt.
pub const FIRST_TOOL_MARKER: &str = "✓ tool finished";

/// Buffering bucket for classified output. Declaration order is the order
/// in which a forced flush drains categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    StepStart,
    Thinking,
    ToolRunning,
    ToolCompleted,
    Text,
    Error,
    Raw,
}

impl Category {
    pub const ALL: [Self; 7] = [
        Self::StepStart,
        Self::Thinking,
        Self::ToolRunning,
        Self::ToolCompleted,
        Self::Text,
        Self::Error,
        Self::Raw,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::StepStart => "step_start",
            Self::Thinking => "thinking",
            Self::ToolRunning => "tool_running",
            Self::ToolCompleted => "tool_completed",
            Self::Text => "text",
            Self::Error => "error",
            Self::Raw => "raw",
        }
    }

    /// Categories whose payloads are whole lines rather than streamed
    /// fragments. Their payloads are newline-terminated when buffered.
    #[must_use]
    pub fn is_line_oriented(self) -> bool {
        !matches!(self, Self::Text | Self::Thinking)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub category: Category,
    pub payload: String,
}

impl Event {
    fn new(category: Category, payload: impl Into<String>) -> Self {
        Self {
            category,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AgentRecord {
    #[serde(rename = "type")]
    kind: String,
    part: Option<RecordPart>,
    error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RecordPart {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
    tool: Option<String>,
    state: Option<ToolState>,
    reason: Option<String>,
    error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ToolState {
    status: Option<String>,
    output: Option<Value>,
}

fn parse_record(line: &str) -> Option<AgentRecord> {
    serde_json::from_str(line.trim()).ok()
}

/// Whether the line decodes as a JSON object at all, known type or not.
pub(crate) fn is_structured(line: &str) -> bool {
    serde_json::from_str::<Value>(line.trim()).is_ok_and(|v| v.is_object())
}

/// Classify one output line.
///
/// `first_tool_seen` is the attempt-local flag telling whether a tool
/// completion was already reported. Blank lines produce no event.
#[must_use]
pub fn classify_line(line: &str, first_tool_seen: bool) -> Option<Event> {
    if line.trim().is_empty() {
        return None;
    }
    let Some(record) = parse_record(line) else {
        return Some(Event::new(Category::Raw, line));
    };
    let part = record.part.unwrap_or_default();

    if matches!(part.kind.as_str(), "thinking" | "reasoning")
        || matches!(record.kind.as_str(), "thinking" | "reasoning")
    {
        return non_empty(Category::Thinking, part.text);
    }
    if matches!(record.kind.as_str(), "text" | "text_delta") || part.kind == "text" {
        return non_empty(Category::Text, part.text);
    }
    if record.kind == "tool_use" || part.kind == "tool" {
        return Some(classify_tool(&part, first_tool_seen));
    }
    if record.kind == "step_start" || part.kind == "step-start" {
        return Some(Event::new(Category::StepStart, STEP_START_MARKER));
    }
    if record.kind == "error" || part.kind == "error" {
        let message = part
            .text
            .filter(|t| !t.trim().is_empty())
            .or_else(|| part.error.as_ref().and_then(error_text))
            .or_else(|| record.error.as_ref().and_then(error_text))
            .or(part.reason)
            .unwrap_or_else(|| "unknown error".into());
        return Some(Event::new(
            Category::Error,
            format!(
                "❌ {}",
                truncate_with_ellipsis(message.trim(), ERROR_PREVIEW_CHARS)
            ),
        ));
    }

    Some(Event::new(Category::Raw, line))
}

fn non_empty(category: Category, text: Option<String>) -> Option<Event> {
    text.filter(|t| !t.is_empty())
        .map(|t| Event::new(category, t))
}

fn classify_tool(part: &RecordPart, first_tool_seen: bool) -> Event {
    let tool = part.tool.as_deref().unwrap_or("tool");
    let state = part.state.as_ref();
    let completed = state
        .and_then(|s| s.status.as_deref())
        .is_some_and(|status| status == "completed");

    if !completed {
        return Event::new(Category::ToolRunning, format!("🔧 {tool}"));
    }
    if !first_tool_seen {
        return Event::new(Category::ToolCompleted, FIRST_TOOL_MARKER);
    }

    let output = state
        .and_then(|s| s.output.as_ref())
        .map(value_text)
        .unwrap_or_default();
    let output = output.trim();
    if output.is_empty() {
        Event::new(Category::ToolCompleted, format!("✓ {tool}"))
    } else {
        Event::new(
            Category::ToolCompleted,
            format!(
                "✓ {tool}\n{}",
                truncate_with_ellipsis(output, TOOL_OUTPUT_PREVIEW_CHARS)
            ),
        )
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Pull a human-readable message out of an error value. Agents report
/// errors either as a bare string or as `{name, data: {message}}`.
fn error_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("data")
            .and_then(|d| d.get("message"))
            .or_else(|| map.get("message"))
            .or_else(|| map.get("name"))
            .map(value_text)
            .unwrap_or_else(|| value.to_string()),
        Value::Null => return None,
        other => other.to_string(),
    };
    (!text.trim().is_empty()).then_some(text)
}

/// Attempt-scoped classifier that tracks the first tool completion.
#[derive(Debug, Default)]
pub struct Classifier {
    first_tool_seen: bool,
}

impl Classifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(&mut self, line: &str) -> Option<Event> {
        let event = classify_line(line, self.first_tool_seen);
        if let Some(Event {
            category: Category::ToolCompleted,
            ..
        }) = &event
        {
            self.first_tool_seen = true;
        }
        event
    }
}
