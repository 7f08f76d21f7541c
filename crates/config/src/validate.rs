//! Configuration validation.
//!
//! Detects unknown or misspelled fields, type errors, and settings that
//! would make the relay misbehave at runtime.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::schema::RelayConfig;

/// Hard upstream limit for one Telegram message.
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// "syntax", "unknown-field", "type-error", "runtime" or "file-ref".
    pub category: &'static str,
    /// Dotted path, e.g. "runner.max_retries".
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration file.
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }
}

// ── Schema tree for unknown-field detection ─────────────────────────────────

enum KnownKeys {
    Struct(HashMap<&'static str, KnownKeys>),
    /// Dynamic keys (e.g. `agent.env`).
    Map,
    Leaf,
}

fn build_schema_map() -> KnownKeys {
    use KnownKeys::{Leaf, Map, Struct};

    Struct(HashMap::from([
        (
            "telegram",
            Struct(HashMap::from([("token", Leaf), ("poll_timeout_secs", Leaf)])),
        ),
        (
            "agent",
            Struct(HashMap::from([
                ("program", Leaf),
                ("args", Leaf),
                ("model", Leaf),
                ("env", Map),
                ("working_dir", Leaf),
                ("attempt_timeout_secs", Leaf),
                ("cleanup_pattern", Leaf),
                ("scratch_dir", Leaf),
            ])),
        ),
        (
            "runner",
            Struct(HashMap::from([
                ("max_retries", Leaf),
                ("retry_backoff_secs", Leaf),
                ("heartbeat_interval_secs", Leaf),
                ("flush_threshold", Leaf),
                ("memory_limit", Leaf),
                ("line_channel_capacity", Leaf),
                ("completion_preview_chars", Leaf),
            ])),
        ),
        (
            "delivery",
            Struct(HashMap::from([
                ("max_chunk_len", Leaf),
                ("send_attempts", Leaf),
                ("retry_delay_ms", Leaf),
                ("pace_ms", Leaf),
            ])),
        ),
    ]))
}

// ── Levenshtein distance ────────────────────────────────────────────────────

fn levenshtein(a: &str, b: &str) -> usize {
    let b_chars: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b_chars.len();
    }
    if b_chars.is_empty() {
        return a.chars().count();
    }

    let mut prev: Vec<usize> = (0..=b_chars.len()).collect();
    let mut curr = vec![0; b_chars.len() + 1];

    for (i, ca) in a.chars().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b_chars.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b_chars.len()]
}

/// Closest candidate within `max_distance` edits.
fn suggest<'a>(needle: &str, candidates: &[&'a str], max_distance: usize) -> Option<&'a str> {
    candidates
        .iter()
        .map(|&c| (c, levenshtein(needle, c)))
        .filter(|&(_, d)| d > 0 && d <= max_distance)
        .min_by_key(|&(_, d)| d)
        .map(|(c, _)| c)
}

// ── Core validation ─────────────────────────────────────────────────────────

/// Validate a config file at `path`, or the discovered one when `None`.
#[must_use]
pub fn validate(path: Option<&Path>) -> ValidationResult {
    let config_path = match path {
        Some(p) => Some(p.to_path_buf()),
        None => crate::loader::find_config_file(),
    };

    let Some(ref actual_path) = config_path else {
        return ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Info,
                category: "file-ref",
                path: String::new(),
                message: "no config file found; using defaults".into(),
            }],
            config_path: None,
        };
    };

    let is_toml = actual_path
        .extension()
        .and_then(|e| e.to_str())
        .is_none_or(|e| e == "toml");

    match std::fs::read_to_string(actual_path) {
        Ok(content) if is_toml => {
            let mut result = validate_toml_str(&crate::env_subst::substitute_env(&content));
            result.config_path = Some(actual_path.clone());
            result
        },
        Ok(_) => match crate::loader::load_config(actual_path) {
            Ok(config) => {
                let mut diagnostics = Vec::new();
                check_runtime_settings(&config, &mut diagnostics);
                ValidationResult {
                    diagnostics,
                    config_path: Some(actual_path.clone()),
                }
            },
            Err(e) => ValidationResult {
                diagnostics: vec![Diagnostic {
                    severity: Severity::Error,
                    category: "type-error",
                    path: String::new(),
                    message: e.to_string(),
                }],
                config_path: Some(actual_path.clone()),
            },
        },
        Err(e) => ValidationResult {
            diagnostics: vec![Diagnostic {
                severity: Severity::Error,
                category: "syntax",
                path: String::new(),
                message: format!("failed to read config file: {e}"),
            }],
            config_path: Some(actual_path.clone()),
        },
    }
}

/// Validate a TOML string without touching the file system.
#[must_use]
pub fn validate_toml_str(toml_str: &str) -> ValidationResult {
    let mut diagnostics = Vec::new();

    let toml_value: toml::Value = match toml::from_str(toml_str) {
        Ok(v) => v,
        Err(e) => {
            diagnostics.push(Diagnostic {
                severity: Severity::Error,
                category: "syntax",
                path: String::new(),
                message: format!("TOML syntax error: {e}"),
            });
            return ValidationResult {
                diagnostics,
                config_path: None,
            };
        },
    };

    check_unknown_fields(&toml_value, &build_schema_map(), "", &mut diagnostics);

    match toml::from_str::<RelayConfig>(toml_str) {
        Ok(config) => check_runtime_settings(&config, &mut diagnostics),
        Err(e) => diagnostics.push(Diagnostic {
            severity: Severity::Error,
            category: "type-error",
            path: String::new(),
            message: format!("type error: {e}"),
        }),
    }

    ValidationResult {
        diagnostics,
        config_path: None,
    }
}

fn check_unknown_fields(
    value: &toml::Value,
    schema: &KnownKeys,
    prefix: &str,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let (toml::Value::Table(table), KnownKeys::Struct(fields)) = (value, schema) else {
        return;
    };
    let known_keys: Vec<&str> = fields.keys().copied().collect();
    for (key, child_value) in table {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match fields.get(key.as_str()) {
            Some(child_schema) => {
                check_unknown_fields(child_value, child_schema, &path, diagnostics);
            },
            None => {
                let message = match suggest(key, &known_keys, 3) {
                    Some(s) => format!("unknown field (did you mean \"{s}\"?)"),
                    None => "unknown field".to_string(),
                };
                diagnostics.push(Diagnostic {
                    severity: Severity::Error,
                    category: "unknown-field",
                    path,
                    message,
                });
            },
        }
    }
}

/// Semantic checks on a parsed config.
fn check_runtime_settings(config: &RelayConfig, diagnostics: &mut Vec<Diagnostic>) {
    let mut push = |severity, path: &str, message: String| {
        diagnostics.push(Diagnostic {
            severity,
            category: "runtime",
            path: path.into(),
            message,
        });
    };

    if !config.telegram.has_token() {
        push(
            Severity::Warning,
            "telegram.token",
            "no bot token configured; only `relay run` will work".into(),
        );
    }
    if config.agent.program.trim().is_empty() {
        push(
            Severity::Error,
            "agent.program",
            "agent program must not be empty".into(),
        );
    }
    if let Some(ref pattern) = config.agent.cleanup_pattern
        && pattern.trim().is_empty()
    {
        push(
            Severity::Error,
            "agent.cleanup_pattern",
            "an empty pattern would match every process; remove the key instead".into(),
        );
    }
    if config.agent.scratch_dir.as_deref() == Some(Path::new("/")) {
        push(
            Severity::Error,
            "agent.scratch_dir",
            "refusing to sweep the filesystem root".into(),
        );
    }
    if config.delivery.max_chunk_len == 0 || config.delivery.max_chunk_len > TELEGRAM_MESSAGE_LIMIT
    {
        push(
            Severity::Error,
            "delivery.max_chunk_len",
            format!(
                "must be between 1 and {TELEGRAM_MESSAGE_LIMIT}, got {}",
                config.delivery.max_chunk_len
            ),
        );
    }
    if config.delivery.send_attempts == 0 {
        push(
            Severity::Error,
            "delivery.send_attempts",
            "at least one send attempt is required".into(),
        );
    }
    if config.runner.flush_threshold == 0 {
        push(
            Severity::Error,
            "runner.flush_threshold",
            "flush threshold must be positive".into(),
        );
    }
    if config.runner.heartbeat_interval_secs == 0 {
        push(
            Severity::Error,
            "runner.heartbeat_interval_secs",
            "heartbeat interval must be positive".into(),
        );
    }
    if config.runner.line_channel_capacity == 0 {
        push(
            Severity::Error,
            "runner.line_channel_capacity",
            "channel capacity must be positive".into(),
        );
    }
    if config.runner.max_retries > 10 {
        push(
            Severity::Warning,
            "runner.max_retries",
            format!(
                "{} retries means a failing task can run for a very long time",
                config.runner.max_retries
            ),
        );
    }
}
